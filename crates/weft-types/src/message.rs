//! Conversation messages.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::content::{ContentBlock, joined_text};
use crate::tool::ToolResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A message with owned content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            created_at: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentBlock::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentBlock::text(text)])
    }

    /// Creates a single `tool` message holding every result of one tick, in call order.
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        let blocks = results.into_iter().map(ToolResult::into_block).collect();
        Self::new(Role::Tool, blocks)
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        joined_text(&self.content)
    }

    /// Returns true when role and content match, ignoring id, timestamp and metadata.
    pub fn same_content(&self, other: &Message) -> bool {
        self.role == other.role && self.content == other.content
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_results_batches_into_one_message() {
        let msg = Message::tool_results(vec![
            ToolResult::text("a", "calc", "4", false),
            ToolResult::text("b", "calc", "6", false),
        ]);
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.content.len(), 2);
        assert!(matches!(
            &msg.content[0],
            ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "a"
        ));
    }

    #[test]
    fn test_same_content_ignores_identity() {
        let a = Message::user("Hello");
        let b = Message::user("Hello");
        assert_ne!(a.id, b.id);
        assert!(a.same_content(&b));
        assert!(!a.same_content(&Message::assistant("Hello")));
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Tool).unwrap(), "\"tool\"");
    }
}
