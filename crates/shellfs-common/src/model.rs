//! Model records and the catalog reported by the backend.

use serde::{Deserialize, Serialize};

/// One model as listed by the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_tokens: Option<u64>,
}

impl ModelRecord {
    /// The user-visible name: the display name, falling back to the id.
    pub fn name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }
}

/// The `window.__SHELLEY_INIT__` object embedded in the backend's index
/// page. Legacy source of the model list, current source of the default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitPayload {
    #[serde(default)]
    pub models: Vec<ModelRecord>,
    #[serde(default)]
    pub default_model: String,
}

/// The full model listing plus the backend's default model id.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    pub models: Vec<ModelRecord>,
    pub default_id: String,
}

impl ModelCatalog {
    /// Resolves a name as a display name first, then as an id.
    pub fn by_name(&self, name: &str) -> Option<&ModelRecord> {
        self.models
            .iter()
            .find(|m| m.name() == name)
            .or_else(|| self.models.iter().find(|m| m.id == name))
    }

    /// The default model record, when the backend reports a default that is
    /// present in the listing.
    pub fn default_model(&self) -> Option<&ModelRecord> {
        if self.default_id.is_empty() {
            return None;
        }
        self.by_name(&self.default_id)
    }

    /// The user-visible name of the default model, falling back to the raw
    /// default id when it is not in the listing.
    pub fn default_name(&self) -> Option<&str> {
        if self.default_id.is_empty() {
            return None;
        }
        Some(
            self.default_model()
                .map_or(self.default_id.as_str(), ModelRecord::name),
        )
    }

    /// Resolves a `ctl` model token to `(display_name, api_id)`.
    ///
    /// Unknown tokens are stored verbatim as both.
    pub fn resolve(&self, token: &str) -> (String, String) {
        self.by_name(token).map_or_else(
            || (token.to_string(), token.to_string()),
            |m| (m.name().to_string(), m.id.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ModelCatalog {
        ModelCatalog {
            models: vec![
                ModelRecord {
                    id: "claude-opus-4-5".to_string(),
                    display_name: "claude-opus-4.5".to_string(),
                    ready: true,
                    ..ModelRecord::default()
                },
                ModelRecord {
                    id: "bare-id".to_string(),
                    display_name: String::new(),
                    ready: false,
                    ..ModelRecord::default()
                },
            ],
            default_id: "claude-opus-4-5".to_string(),
        }
    }

    #[test]
    fn name_falls_back_to_id() {
        let catalog = catalog();
        assert_eq!(catalog.models[0].name(), "claude-opus-4.5");
        assert_eq!(catalog.models[1].name(), "bare-id");
    }

    #[test]
    fn by_name_prefers_display_name() {
        let catalog = catalog();
        assert_eq!(catalog.by_name("claude-opus-4.5").map(|m| m.id.as_str()), Some("claude-opus-4-5"));
        assert_eq!(catalog.by_name("claude-opus-4-5").map(|m| m.id.as_str()), Some("claude-opus-4-5"));
        assert!(catalog.by_name("unknown").is_none());
    }

    #[test]
    fn default_name_resolves_display() {
        let catalog = catalog();
        assert_eq!(catalog.default_name(), Some("claude-opus-4.5"));
    }

    #[test]
    fn empty_default_is_none() {
        let catalog = ModelCatalog::default();
        assert_eq!(catalog.default_name(), None);
        assert!(catalog.default_model().is_none());
    }

    #[test]
    fn resolve_keeps_unknown_tokens_verbatim() {
        let catalog = catalog();
        assert_eq!(
            catalog.resolve("claude-opus-4.5"),
            ("claude-opus-4.5".to_string(), "claude-opus-4-5".to_string())
        );
        assert_eq!(
            catalog.resolve("bare-id"),
            ("bare-id".to_string(), "bare-id".to_string())
        );
        assert_eq!(
            catalog.resolve("custom-thing"),
            ("custom-thing".to_string(), "custom-thing".to_string())
        );
    }

    #[test]
    fn init_payload_tolerates_missing_fields() {
        let payload: InitPayload = serde_json::from_str("{}").unwrap_or_default();
        assert!(payload.models.is_empty());
        assert!(payload.default_model.is_empty());
    }
}
