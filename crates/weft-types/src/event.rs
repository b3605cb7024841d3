//! Stream event wire contract.
//!
//! Events are tick-framed: every model delta and tool event of tick `n` sits
//! between `TickStart { tick: n }` and `TickEnd { tick: n }`. Consumers must
//! treat unknown event types as no-ops; they deserialize to `Unknown`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::content::BlockType;
use crate::message::Message;
use crate::model::{StopReason, Usage};
use crate::tool::{ToolCall, ToolResult, ToolVariant};

/// Lifecycle status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Error categories for `StreamEvent::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input to model-call preparation.
    Validation,
    /// Provider returned an unusable response.
    Adapter,
    /// Component tree failed to compile.
    Compile,
    /// Execution aborted externally.
    Cancelled,
    /// Hook used outside a valid lifecycle.
    Context,
    /// Internal/unknown error
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Adapter => write!(f, "adapter"),
            ErrorKind::Compile => write!(f, "compile"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Context => write!(f, "context"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// What the model produced during one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickResponse {
    pub stop_reason: StopReason,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: Usage,
}

/// Final summary of a finished execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub stop_reason: StopReason,
    pub ticks: u32,
    pub final_text: String,
    #[serde(default)]
    pub usage: Usage,
}

/// Events emitted while an execution runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ExecutionStart {
        execution_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
    },

    TickStart {
        tick: u32,
    },

    /// A content block of the model response has started.
    ContentBlockStart {
        block_type: BlockType,
        block_index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Incremental content within a block (text, reasoning, or tool input JSON).
    ContentDelta {
        block_type: BlockType,
        block_index: usize,
        delta: String,
    },

    ContentBlockEnd {
        block_type: BlockType,
        block_index: usize,
    },

    /// Provider finished the message.
    MessageEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<StopReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    /// A tool call is about to be dispatched.
    ToolCall {
        call: ToolCall,
        variant: ToolVariant,
    },

    /// A tool call waits for explicit approval.
    ToolConfirmationRequired {
        call: ToolCall,
    },

    /// A tool call settled (success or error).
    ToolResult {
        result: ToolResult,
    },

    TickEnd {
        tick: u32,
        response: TickResponse,
    },

    ExecutionEnd {
        summary: ExecutionSummary,
    },

    /// Terminal error. Always the last event of a failed execution.
    Error {
        kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tick: Option<u32>,
    },

    /// Any event type this version does not know.
    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    /// True for the events that end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::ExecutionEnd { .. } | StreamEvent::Error { .. }
        )
    }
}
