//! Content blocks carried by messages, tool results and compiled output.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where binary media lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaSource {
    /// Base64-encoded payload.
    Base64 { data: String },
    /// Remote or local URL.
    Url { url: String },
}

/// A single block of message content.
///
/// Every variant carries the fields it needs; there is no catch-all variant,
/// so producers and consumers match exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: MediaSource,
        mime_type: String,
    },
    Audio {
        source: MediaSource,
        mime_type: String,
    },
    Video {
        source: MediaSource,
        mime_type: String,
    },
    Document {
        source: MediaSource,
        mime_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    /// Model reasoning/thinking content.
    Reasoning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        #[serde(default)]
        redacted: bool,
    },
    Code {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        code: String,
    },
    Json {
        data: Value,
    },
    ToolUse {
        tool_use_id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        name: String,
        content: Vec<ContentBlock>,
        #[serde(default)]
        is_error: bool,
    },
    UserAction {
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        actor: Option<String>,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        details: Value,
    },
    SystemEvent {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
    },
    StateChange {
        key: String,
        #[serde(default)]
        previous: Value,
        #[serde(default)]
        current: Value,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn block_type(&self) -> BlockType {
        match self {
            ContentBlock::Text { .. } => BlockType::Text,
            ContentBlock::Image { .. } => BlockType::Image,
            ContentBlock::Audio { .. } => BlockType::Audio,
            ContentBlock::Video { .. } => BlockType::Video,
            ContentBlock::Document { .. } => BlockType::Document,
            ContentBlock::Reasoning { .. } => BlockType::Reasoning,
            ContentBlock::Code { .. } => BlockType::Code,
            ContentBlock::Json { .. } => BlockType::Json,
            ContentBlock::ToolUse { .. } => BlockType::ToolUse,
            ContentBlock::ToolResult { .. } => BlockType::ToolResult,
            ContentBlock::UserAction { .. } => BlockType::UserAction,
            ContentBlock::SystemEvent { .. } => BlockType::SystemEvent,
            ContentBlock::StateChange { .. } => BlockType::StateChange,
        }
    }

    /// Returns the text payload for `Text` blocks.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Discriminant of [`ContentBlock`], used by stream deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Text,
    Image,
    Audio,
    Video,
    Document,
    Reasoning,
    Code,
    Json,
    ToolUse,
    ToolResult,
    UserAction,
    SystemEvent,
    StateChange,
}

impl BlockType {
    pub const ALL: [BlockType; 13] = [
        BlockType::Text,
        BlockType::Image,
        BlockType::Audio,
        BlockType::Video,
        BlockType::Document,
        BlockType::Reasoning,
        BlockType::Code,
        BlockType::Json,
        BlockType::ToolUse,
        BlockType::ToolResult,
        BlockType::UserAction,
        BlockType::SystemEvent,
        BlockType::StateChange,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BlockType::Text => "text",
            BlockType::Image => "image",
            BlockType::Audio => "audio",
            BlockType::Video => "video",
            BlockType::Document => "document",
            BlockType::Reasoning => "reasoning",
            BlockType::Code => "code",
            BlockType::Json => "json",
            BlockType::ToolUse => "tool_use",
            BlockType::ToolResult => "tool_result",
            BlockType::UserAction => "user_action",
            BlockType::SystemEvent => "system_event",
            BlockType::StateChange => "state_change",
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            "document" => Ok(Self::Document),
            "thinking" | "reasoning" => Ok(Self::Reasoning),
            "code" => Ok(Self::Code),
            "json" => Ok(Self::Json),
            "tool_use" => Ok(Self::ToolUse),
            "tool_result" => Ok(Self::ToolResult),
            "user_action" => Ok(Self::UserAction),
            "system_event" => Ok(Self::SystemEvent),
            "state_change" => Ok(Self::StateChange),
            _ => Err(format!("Unknown content block type: {value}")),
        }
    }
}

/// Concatenates the text of all `Text` blocks.
pub fn joined_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(ContentBlock::as_text)
        .collect::<Vec<_>>()
        .join("")
}
