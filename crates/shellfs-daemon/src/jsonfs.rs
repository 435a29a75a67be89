//! Generic translator from a decoded JSON value to a read-only subtree.
//!
//! Objects and arrays become directories (array children named by decimal
//! index), scalars become text files holding the value's textual form plus a
//! trailing newline. Fields listed in `stringify_fields` whose string value
//! looks like JSON are parsed and recursed into instead of being emitted as
//! files.

use std::time::{Duration, SystemTime};

use serde_json::Value;

/// Rendering and kernel-cache configuration for one JSON subtree.
#[derive(Debug, Clone)]
pub struct JsonFsConfig {
    /// Field names whose stringified-JSON values become subtrees.
    pub stringify_fields: Vec<String>,
    /// Entry/attr timeout advertised to the kernel; zero requests direct
    /// I/O instead.
    pub cache_timeout: Duration,
    /// Timestamp stamped on every node of the subtree.
    pub start_time: SystemTime,
}

impl Default for JsonFsConfig {
    fn default() -> Self {
        Self {
            stringify_fields: Vec::new(),
            cache_timeout: Duration::ZERO,
            start_time: SystemTime::UNIX_EPOCH,
        }
    }
}

/// One resolved node of a JSON subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsonNode {
    /// A directory and its sorted child names with their kinds.
    Dir(Vec<(String, JsonNodeKind)>),
    /// A file and its full content.
    File(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonNodeKind {
    Dir,
    File,
}

/// Translator over one decoded JSON value.
#[derive(Debug, Clone)]
pub struct JsonFs {
    config: JsonFsConfig,
}

impl JsonFs {
    pub fn new(config: JsonFsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &JsonFsConfig {
        &self.config
    }

    /// Resolves `path` (segments below the subtree root) against `root`.
    pub fn resolve(&self, root: &Value, path: &[&str]) -> Option<JsonNode> {
        let mut current = root.clone();
        for segment in path {
            current = self.child(&current, segment)?;
        }
        Some(self.node(&current))
    }

    /// The kind `value` presents as.
    pub fn kind(value: &Value) -> JsonNodeKind {
        if value.is_object() || value.is_array() {
            JsonNodeKind::Dir
        } else {
            JsonNodeKind::File
        }
    }

    fn node(&self, value: &Value) -> JsonNode {
        match value {
            Value::Object(map) => {
                let mut names: Vec<&String> = map.keys().collect();
                names.sort();
                let entries = names
                    .into_iter()
                    .map(|name| {
                        let child = self.destringify(name, &map[name.as_str()]);
                        (name.clone(), Self::kind(&child))
                    })
                    .collect();
                JsonNode::Dir(entries)
            }
            Value::Array(items) => JsonNode::Dir(
                (0..items.len())
                    .map(|index| (index.to_string(), Self::kind(&items[index])))
                    .collect(),
            ),
            scalar => JsonNode::File(format!("{}\n", scalar_form(scalar))),
        }
    }

    fn child(&self, value: &Value, name: &str) -> Option<Value> {
        match value {
            Value::Object(map) => map.get(name).map(|child| self.destringify(name, child)),
            Value::Array(items) => {
                // Reject "01"-style aliases so every entry has one name.
                let index: usize = name.parse().ok()?;
                if index.to_string() != name {
                    return None;
                }
                items.get(index).cloned()
            }
            _ => None,
        }
    }

    fn destringify(&self, name: &str, value: &Value) -> Value {
        if let Value::String(text) = value {
            if self.config.stringify_fields.iter().any(|f| f == name) && looks_like_json(text) {
                if let Ok(parsed) = serde_json::from_str::<Value>(text) {
                    return parsed;
                }
            }
        }
        value.clone()
    }
}

fn looks_like_json(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with('{') || trimmed.starts_with('[')
}

/// The textual form of a scalar: numbers without superfluous decimals,
/// booleans lowercased, null as the literal `null`, strings verbatim.
pub fn scalar_form(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e15 {
                    format!("{f:.0}")
                } else {
                    f.to_string()
                }
            } else {
                n.to_string()
            }
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::panic)]

    use super::*;

    fn fs() -> JsonFs {
        JsonFs::new(JsonFsConfig::default())
    }

    fn sample() -> Value {
        serde_json::json!({
            "name": "conv",
            "count": 3,
            "ratio": 1.5,
            "whole": 2.0,
            "ready": true,
            "missing": null,
            "tags": ["a", "b"],
            "nested": {"inner": "x"}
        })
    }

    #[test]
    fn object_lists_sorted_entries() {
        let node = fs().resolve(&sample(), &[]).unwrap();
        let JsonNode::Dir(entries) = node else {
            panic!("expected directory");
        };
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["count", "missing", "name", "nested", "ratio", "ready", "tags", "whole"]
        );
    }

    #[test]
    fn scalars_render_with_trailing_newline() {
        let fs = fs();
        let root = sample();
        assert_eq!(
            fs.resolve(&root, &["name"]).unwrap(),
            JsonNode::File("conv\n".to_string())
        );
        assert_eq!(
            fs.resolve(&root, &["count"]).unwrap(),
            JsonNode::File("3\n".to_string())
        );
        assert_eq!(
            fs.resolve(&root, &["ratio"]).unwrap(),
            JsonNode::File("1.5\n".to_string())
        );
        assert_eq!(
            fs.resolve(&root, &["whole"]).unwrap(),
            JsonNode::File("2\n".to_string())
        );
        assert_eq!(
            fs.resolve(&root, &["ready"]).unwrap(),
            JsonNode::File("true\n".to_string())
        );
        assert_eq!(
            fs.resolve(&root, &["missing"]).unwrap(),
            JsonNode::File("null\n".to_string())
        );
    }

    #[test]
    fn arrays_index_by_decimal() {
        let fs = fs();
        let root = sample();
        let JsonNode::Dir(entries) = fs.resolve(&root, &["tags"]).unwrap() else {
            panic!("expected directory");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "0");
        assert_eq!(
            fs.resolve(&root, &["tags", "1"]).unwrap(),
            JsonNode::File("b\n".to_string())
        );
        assert!(fs.resolve(&root, &["tags", "2"]).is_none());
        assert!(fs.resolve(&root, &["tags", "01"]).is_none());
    }

    #[test]
    fn nested_navigation() {
        assert_eq!(
            fs().resolve(&sample(), &["nested", "inner"]).unwrap(),
            JsonNode::File("x\n".to_string())
        );
        assert!(fs().resolve(&sample(), &["nested", "nope"]).is_none());
    }

    #[test]
    fn stringified_fields_become_subtrees() {
        let fs = JsonFs::new(JsonFsConfig {
            stringify_fields: vec!["llm_data".to_string()],
            ..JsonFsConfig::default()
        });
        let root = serde_json::json!({
            "llm_data": "{\"Content\":[{\"Type\":0,\"Text\":\"hi\"}]}",
            "user_note": "{\"not\":\"expanded\"}"
        });

        assert_eq!(
            fs.resolve(&root, &["llm_data", "Content", "0", "Text"]).unwrap(),
            JsonNode::File("hi\n".to_string())
        );
        // Fields outside the stringify set stay plain files.
        assert_eq!(
            fs.resolve(&root, &["user_note"]).unwrap(),
            JsonNode::File("{\"not\":\"expanded\"}\n".to_string())
        );
    }

    #[test]
    fn stringify_leaves_non_json_strings_alone() {
        let fs = JsonFs::new(JsonFsConfig {
            stringify_fields: vec!["llm_data".to_string()],
            ..JsonFsConfig::default()
        });
        let root = serde_json::json!({"llm_data": "plain text"});
        assert_eq!(
            fs.resolve(&root, &["llm_data"]).unwrap(),
            JsonNode::File("plain text\n".to_string())
        );
    }
}
