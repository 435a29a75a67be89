//! JSON and Markdown renderers for message subsequences.
//!
//! The tool-call/tool-result formatting lives behind single functions so new
//! tools are a matter of table lookup, not new branches.

use std::ops::Range;

use serde_json::Value;

use crate::message::{ContentItem, Message, MessageList, ToolMap, ToolUse};

/// Renders the messages in `range` as an indented JSON array, preserving
/// every field the backend sent.
pub fn render_json(list: &MessageList, range: Range<usize>) -> String {
    let values: Vec<Value> = list.messages()[range]
        .iter()
        .map(|message| serde_json::to_value(message).unwrap_or(Value::Null))
        .collect();
    let mut out = serde_json::to_string_pretty(&values).unwrap_or_else(|_| "[]".to_string());
    out.push('\n');
    out
}

/// Renders the messages in `range` as Markdown: one `## ` header per
/// message, followed by its content when non-empty.
pub fn render_markdown(list: &MessageList, range: Range<usize>) -> String {
    let mut out = String::new();
    for index in range {
        append_message(&mut out, list, index);
    }
    out
}

fn append_message(out: &mut String, list: &MessageList, index: usize) {
    let message = &list.messages()[index];
    let items = message.content_items();

    let (header, body) = if let Some(use_item) = Message::tool_use(&items) {
        let body = use_item
            .tool_input
            .as_ref()
            .map(format_tool_input)
            .unwrap_or_default();
        (format!("tool call: {}", use_item.tool_name), body)
    } else {
        let results = Message::tool_results(&items);
        if results.is_empty() {
            (list.slug(index).to_string(), message.plain_content())
        } else {
            let name = list
                .tools()
                .get(&results[0].tool_use_id)
                .map(|tool_use| tool_use.name.clone());
            let header = match name {
                Some(name) => format!("tool result: {name}"),
                None => "tool result".to_string(),
            };
            let body = results
                .iter()
                .map(|result| format_tool_result(result, list.tools()))
                .collect::<Vec<_>>()
                .join("\n\n");
            (header, body)
        }
    };

    out.push_str("## ");
    out.push_str(&header);
    out.push_str("\n\n");
    if !body.is_empty() {
        out.push_str(&body);
        out.push_str("\n\n");
    }
}

/// Formats a tool invocation's input.
///
/// A flat object of scalars becomes sorted `key: value` lines; anything else
/// is a 2-space-indented JSON block.
pub fn format_tool_input(input: &Value) -> String {
    if let Some(lines) = flat_scalar_lines(input) {
        return lines;
    }
    serde_json::to_string_pretty(input).unwrap_or_default()
}

fn flat_scalar_lines(input: &Value) -> Option<String> {
    let Value::Object(map) = input else {
        return None;
    };
    if map.values().any(|v| v.is_object() || v.is_array()) {
        return None;
    }
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    let lines: Vec<String> = keys
        .iter()
        .map(|key| format!("{key}: {}", scalar_text(&map[key.as_str()])))
        .collect();
    Some(lines.join("\n"))
}

fn format_tool_result(result: &ContentItem, tools: &ToolMap) -> String {
    let mut out = String::new();
    if let Some(tool_use) = tools.get(&result.tool_use_id) {
        if let Some(input) = &tool_use.input {
            out.push_str("### command: ");
            out.push_str(&input_summary(tool_use, input));
            out.push_str("\n\n");
        }
    }
    let text: String = result
        .tool_result
        .iter()
        .map(|chunk| chunk.text.as_str())
        .collect();
    out.push_str("```\n");
    out.push_str(&text);
    if !text.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("```");
    out
}

/// One-line summary of a tool invocation's input for result subheaders:
/// `bash` renders its `command` field verbatim, other tools a sorted
/// `key=value` flattening.
fn input_summary(tool_use: &ToolUse, input: &Value) -> String {
    if tool_use.name.eq_ignore_ascii_case("bash") {
        if let Some(command) = input.get("command").and_then(Value::as_str) {
            return command.to_string();
        }
    }
    match input {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            keys.iter()
                .map(|key| format!("{key}={}", scalar_text(&map[key.as_str()])))
                .collect::<Vec<_>>()
                .join(" ")
        }
        other => scalar_text(other),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
