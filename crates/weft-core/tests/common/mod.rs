#![allow(dead_code)]

use serde_json::{Value, json};
use weft_core::{Tool, ToolOutput};
use weft_types::{ContentBlock, Message, Role, joined_text};

pub fn calc_tool() -> Tool {
    Tool::server(
        "calc",
        "Adds two integers",
        json!({
            "type": "object",
            "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
            "required": ["a", "b"]
        }),
        |input: Value, _ctx| async move {
            match (input["a"].as_i64(), input["b"].as_i64()) {
                (Some(a), Some(b)) => ToolOutput::success(json!(a + b)),
                _ => ToolOutput::failure("invalid_input", "a and b must be integers", None),
            }
        },
    )
}

pub fn ping_tool() -> Tool {
    Tool::server("ping", "Answers pong", json!({}), |_input, _ctx| async {
        ToolOutput::success(json!("pong"))
    })
}

/// `(tool_use_id, is_error, text)` for every result block of a tool message.
pub fn tool_results(message: &Message) -> Vec<(String, bool, String)> {
    message
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
                ..
            } => Some((tool_use_id.clone(), *is_error, joined_text(content))),
            _ => None,
        })
        .collect()
}

pub fn roles<'a>(messages: impl IntoIterator<Item = &'a Message>) -> Vec<Role> {
    messages.into_iter().map(|m| m.role).collect()
}
