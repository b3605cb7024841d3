//! Shared data model for weft: content blocks, messages, timeline entries,
//! tool calls and the stream event wire contract.

pub mod content;
pub mod event;
pub mod message;
pub mod model;
pub mod timeline;
pub mod tool;

pub use content::{BlockType, ContentBlock, MediaSource, joined_text};
pub use event::{
    ErrorKind, ExecutionStatus, ExecutionSummary, StreamEvent, TickResponse,
};
pub use message::{Message, Role};
pub use model::{StopReason, Usage};
pub use timeline::{EntryKind, TimelineEntry, TimelineEvent};
pub use tool::{ToolCall, ToolResult, ToolSpec, ToolVariant};
