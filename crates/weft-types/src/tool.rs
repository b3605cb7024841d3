//! Tool call request/response shapes shared by the model boundary and the executor.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::content::ContentBlock;

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn to_block(&self) -> ContentBlock {
        ContentBlock::ToolUse {
            tool_use_id: self.id.clone(),
            name: self.name.clone(),
            input: self.input.clone(),
        }
    }
}

/// Result of one tool call. Failures are data: `is_error` carries them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub name: String,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn text(
        tool_use_id: impl Into<String>,
        name: impl Into<String>,
        text: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            name: name.into(),
            content: vec![ContentBlock::text(text)],
            is_error,
        }
    }

    pub fn into_block(self) -> ContentBlock {
        ContentBlock::ToolResult {
            tool_use_id: self.tool_use_id,
            name: self.name,
            content: self.content,
            is_error: self.is_error,
        }
    }
}

/// How a tool call gets resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolVariant {
    /// In-process handler.
    #[default]
    Server,
    /// Forwarded to an external peer; resolves when the peer reports back.
    Client,
    /// Executed by the provider itself; the result arrives inline.
    Provider,
    /// Forwarded to a named external tool endpoint.
    Routed { endpoint: String },
}

/// Model-facing description of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
}
