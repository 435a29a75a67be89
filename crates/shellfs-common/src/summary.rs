//! Conversation summaries as returned by the listing endpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of `/api/conversations` (or the archived variant). Tolerant of
/// missing fields; unknown ones are preserved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(default, alias = "conversation_id")]
    pub id: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Parses a listing body. Bodies that are not a JSON array parse as empty.
pub fn parse_summaries(bytes: &[u8]) -> Vec<ConversationSummary> {
    serde_json::from_slice(bytes).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listing_with_aliases() {
        let body = br#"[
            {"id":"abc","slug":"fix-the-bug","created_at":"2026-01-01T00:00:00Z"},
            {"conversation_id":"def","model":"claude-opus-4-5"}
        ]"#;
        let summaries = parse_summaries(body);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, "abc");
        assert_eq!(summaries[0].slug, "fix-the-bug");
        assert_eq!(summaries[1].id, "def");
        assert_eq!(summaries[1].model, "claude-opus-4-5");
        assert!(summaries[1].slug.is_empty());
    }

    #[test]
    fn malformed_listing_parses_empty() {
        assert!(parse_summaries(b"{\"oops\":1}").is_empty());
        assert!(parse_summaries(b"not json").is_empty());
    }
}
