//! Message envelope parsing and slug derivation.
//!
//! The backend returns conversations as `{"messages":[…]}`. Each message
//! carries at most one of `llm_data`/`user_data`, a JSON *string* whose
//! decoded shape is `{"Content":[…]}` with capitalized keys. Content items
//! are discriminated by an integer `Type`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Plain text content item.
pub const ITEM_TEXT: i64 = 0;
/// Alternate plain text content item.
pub const ITEM_TEXT_ALT: i64 = 2;
/// Tool invocation content item.
pub const ITEM_TOOL_USE: i64 = 5;
/// Tool result content item.
pub const ITEM_TOOL_RESULT: i64 = 6;

/// The message type the backend uses for model output. User-visible
/// renderings replace it with `agent`.
const AGENT_INTERNAL_TYPE: &str = "shelley";

/// A single message as returned by the conversation endpoint.
///
/// Unknown fields are kept in `extra` so the JSON renderers reproduce the
/// backend's payload faithfully.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub conversation_id: String,
    /// 1-based, monotonic within a conversation.
    #[serde(default)]
    pub sequence_id: u64,
    /// Coarse role: `user`, `shelley`, `system`, …
    #[serde(rename = "type", default)]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// One decoded content item from `llm_data`/`user_data`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentItem {
    #[serde(rename = "Type", default)]
    pub item_type: i64,
    #[serde(rename = "Text", default)]
    pub text: String,
    #[serde(rename = "ToolName", default)]
    pub tool_name: String,
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "ToolInput", default)]
    pub tool_input: Option<Value>,
    #[serde(rename = "ToolUseID", default)]
    pub tool_use_id: String,
    #[serde(rename = "ToolResult", default)]
    pub tool_result: Vec<ResultChunk>,
}

/// One `{Text}` chunk inside a tool result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultChunk {
    #[serde(rename = "Text", default)]
    pub text: String,
}

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    messages: Vec<Message>,
}

impl Message {
    /// The stringified data payload, preferring `llm_data`.
    pub fn data(&self) -> Option<&str> {
        self.llm_data.as_deref().or(self.user_data.as_deref())
    }

    /// Decodes the content items of this message. Messages whose data is
    /// missing, unparseable, or whose `Content` is not an array decode to
    /// an empty list.
    pub fn content_items(&self) -> Vec<ContentItem> {
        let Some(raw) = self.data() else {
            return Vec::new();
        };
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            return Vec::new();
        };
        match value.get("Content") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| serde_json::from_value(item.clone()).unwrap_or_default())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// The first tool invocation in this message, if any.
    pub fn tool_use(items: &[ContentItem]) -> Option<&ContentItem> {
        items
            .iter()
            .find(|i| i.item_type == ITEM_TOOL_USE && !i.tool_name.is_empty())
    }

    /// All tool results in this message.
    pub fn tool_results(items: &[ContentItem]) -> Vec<&ContentItem> {
        items
            .iter()
            .filter(|i| i.item_type == ITEM_TOOL_RESULT)
            .collect()
    }

    /// Extracts the plain text of this message.
    ///
    /// Data that parses as JSON yields its `Content`: a string passes
    /// through, an array concatenates the `Text` of its elements. Data that
    /// does not parse passes through raw.
    pub fn plain_content(&self) -> String {
        let Some(raw) = self.data() else {
            return String::new();
        };
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => extract_content(&value),
            Err(_) => raw.to_string(),
        }
    }

    /// Derives the user-visible slug for this message.
    ///
    /// Tool invocations map to `<toolname>-tool`, tool results to
    /// `<toolname>-result` (or the literal `tool-result` when the
    /// originating invocation is unknown), everything else to the lowercased
    /// message type with the internal model type renamed to `agent`.
    pub fn slug(&self, tools: &ToolMap) -> String {
        let items = self.content_items();
        self.slug_with_items(&items, tools)
    }

    fn slug_with_items(&self, items: &[ContentItem], tools: &ToolMap) -> String {
        if let Some(use_item) = Self::tool_use(items) {
            return format!("{}-tool", use_item.tool_name.to_lowercase());
        }
        if let Some(result) = items.iter().find(|i| i.item_type == ITEM_TOOL_RESULT) {
            return match tools.get(&result.tool_use_id) {
                Some(tool_use) => format!("{}-result", tool_use.name.to_lowercase()),
                None => "tool-result".to_string(),
            };
        }
        let lowered = self.message_type.to_lowercase();
        if lowered == AGENT_INTERNAL_TYPE {
            "agent".to_string()
        } else {
            lowered
        }
    }
}

fn extract_content(value: &Value) -> String {
    match value.get("Content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(text) => text.as_str(),
                Value::Object(map) => map.get("Text").and_then(Value::as_str).unwrap_or(""),
                _ => "",
            })
            .collect(),
        _ => String::new(),
    }
}

/// A recorded tool invocation: the name and the input it was called with.
#[derive(Debug, Clone)]
pub struct ToolUse {
    pub name: String,
    pub input: Option<Value>,
}

/// Map of tool-use id to invocation, built in one pass over a message list.
#[derive(Debug, Clone, Default)]
pub struct ToolMap {
    uses: HashMap<String, ToolUse>,
}

impl ToolMap {
    /// Gathers every tool invocation of every message.
    pub fn build(messages: &[Message]) -> Self {
        let mut uses = HashMap::new();
        for message in messages {
            for item in message.content_items() {
                if item.item_type == ITEM_TOOL_USE && !item.id.is_empty() {
                    uses.insert(
                        item.id.clone(),
                        ToolUse {
                            name: item.tool_name.clone(),
                            input: item.tool_input.clone(),
                        },
                    );
                }
            }
        }
        Self { uses }
    }

    pub fn get(&self, id: &str) -> Option<&ToolUse> {
        self.uses.get(id)
    }
}

/// A conversation's messages in `sequence_id` order, with the tool map and
/// the derived slug of every message computed once.
#[derive(Debug, Clone, Default)]
pub struct MessageList {
    messages: Vec<Message>,
    tools: ToolMap,
    slugs: Vec<String>,
}

impl MessageList {
    /// Parses a `{"messages":[…]}` envelope.
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        Ok(Self::from_messages(envelope.messages))
    }

    pub fn from_messages(mut messages: Vec<Message>) -> Self {
        messages.sort_by_key(|m| m.sequence_id);
        let tools = ToolMap::build(&messages);
        let slugs = messages.iter().map(|m| m.slug(&tools)).collect();
        Self {
            messages,
            tools,
            slugs,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn tools(&self) -> &ToolMap {
        &self.tools
    }

    /// The derived slug of the message at `index`.
    pub fn slug(&self, index: usize) -> &str {
        self.slugs.get(index).map_or("", String::as_str)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The distinct derived slugs, sorted.
    pub fn distinct_slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self.slugs.clone();
        slugs.sort();
        slugs.dedup();
        slugs.retain(|s| !s.is_empty());
        slugs
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn text_message(seq: u64, message_type: &str, text: &str) -> Message {
        Message {
            message_id: format!("m{seq}"),
            conversation_id: "c1".to_string(),
            sequence_id: seq,
            message_type: message_type.to_string(),
            llm_data: Some(format!(
                r#"{{"Content":[{{"Type":0,"Text":"{text}"}}]}}"#
            )),
            ..Message::default()
        }
    }

    fn tool_use_message(seq: u64, tool: &str, id: &str, input: &str) -> Message {
        Message {
            message_id: format!("m{seq}"),
            sequence_id: seq,
            message_type: "shelley".to_string(),
            llm_data: Some(format!(
                r#"{{"Content":[{{"Type":5,"ToolName":"{tool}","ID":"{id}","ToolInput":{input}}}]}}"#
            )),
            ..Message::default()
        }
    }

    fn tool_result_message(seq: u64, use_id: &str, text: &str) -> Message {
        Message {
            message_id: format!("m{seq}"),
            sequence_id: seq,
            message_type: "user".to_string(),
            user_data: Some(format!(
                r#"{{"Content":[{{"Type":6,"ToolUseID":"{use_id}","ToolResult":[{{"Text":"{text}"}}]}}]}}"#
            )),
            ..Message::default()
        }
    }

    #[test]
    fn parses_envelope_and_sorts_by_sequence() {
        let bytes = br#"{"messages":[
            {"message_id":"b","sequence_id":2,"type":"shelley"},
            {"message_id":"a","sequence_id":1,"type":"user"}
        ]}"#;
        let list = MessageList::parse(bytes).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.messages()[0].message_id, "a");
        assert_eq!(list.messages()[1].message_id, "b");
    }

    #[test]
    fn slug_for_plain_types() {
        let list = MessageList::from_messages(vec![
            text_message(1, "user", "hi"),
            text_message(2, "Shelley", "hello"),
            text_message(3, "system", "note"),
        ]);
        assert_eq!(list.slug(0), "user");
        assert_eq!(list.slug(1), "agent");
        assert_eq!(list.slug(2), "system");
    }

    #[test]
    fn slug_for_tool_use_and_result() {
        let list = MessageList::from_messages(vec![
            tool_use_message(1, "Bash", "t1", r#"{"command":"ls"}"#),
            tool_result_message(2, "t1", "ok"),
        ]);
        assert_eq!(list.slug(0), "bash-tool");
        assert_eq!(list.slug(1), "bash-result");
    }

    #[test]
    fn unknown_tool_use_id_yields_literal_tool_result() {
        let list = MessageList::from_messages(vec![tool_result_message(1, "missing", "out")]);
        assert_eq!(list.slug(0), "tool-result");
    }

    #[test]
    fn plain_content_passes_raw_data_through() {
        let message = Message {
            llm_data: Some("not json at all".to_string()),
            ..Message::default()
        };
        assert_eq!(message.plain_content(), "not json at all");
    }

    #[test]
    fn plain_content_concatenates_text_items() {
        let message = Message {
            llm_data: Some(
                r#"{"Content":[{"Type":0,"Text":"one "},{"Type":2,"Text":"two"}]}"#.to_string(),
            ),
            ..Message::default()
        };
        assert_eq!(message.plain_content(), "one two");
    }

    #[test]
    fn plain_content_accepts_string_content() {
        let message = Message {
            user_data: Some(r#"{"Content":"just text"}"#.to_string()),
            ..Message::default()
        };
        assert_eq!(message.plain_content(), "just text");
    }

    #[test]
    fn tool_map_gathers_inputs() {
        let list = MessageList::from_messages(vec![tool_use_message(
            1,
            "bash",
            "t9",
            r#"{"command":"pwd"}"#,
        )]);
        let tool_use = list.tools().get("t9").unwrap();
        assert_eq!(tool_use.name, "bash");
        assert_eq!(
            tool_use.input.as_ref().unwrap()["command"],
            Value::String("pwd".to_string())
        );
    }

    #[test]
    fn message_json_round_trip_preserves_unknown_fields() {
        let bytes = br#"{"message_id":"m1","sequence_id":1,"type":"user","cost_usd":0.25}"#;
        let message: Message = serde_json::from_slice(bytes).unwrap();
        let back = serde_json::to_value(&message).unwrap();
        assert_eq!(back["cost_usd"], 0.25);
        assert_eq!(back["message_id"], "m1");
    }

    #[test]
    fn distinct_slugs_sorted_and_deduped() {
        let list = MessageList::from_messages(vec![
            text_message(1, "user", "a"),
            text_message(2, "shelley", "b"),
            text_message(3, "user", "c"),
        ]);
        assert_eq!(list.distinct_slugs(), vec!["agent", "user"]);
    }
}
