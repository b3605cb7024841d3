//! Model call boundary.
//!
//! The engine only ever talks to a provider through [`ModelAdapter`]. Payloads
//! crossing the boundary are opaque JSON; adapters own their shape.

pub mod scripted;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use weft_types::{
    ContentBlock, Message, StopReason, StreamEvent, ToolCall, ToolResult, ToolSpec, Usage,
};

pub use scripted::{ScriptedModel, ScriptedToolCall, ScriptedTurn};

use crate::compiler::CompiledStructure;
use crate::error::EngineError;

/// What the engine sends to the model for one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInput {
    pub tick: u32,
    pub system: Vec<ContentBlock>,
    /// Timeline messages followed by this tick's ephemeral messages.
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

impl ModelInput {
    pub fn from_structure(tick: u32, structure: &CompiledStructure, tools: Vec<ToolSpec>) -> Self {
        let messages = structure
            .timeline
            .iter()
            .cloned()
            .chain(structure.ephemeral.iter().map(|m| m.to_message()))
            .collect();
        Self {
            tick,
            system: structure.system_blocks(),
            messages,
            tools,
        }
    }
}

/// Normalized result of one model call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelOutput {
    pub messages: Vec<Message>,
    pub stop_reason: StopReason,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    /// Results of provider-native tools, produced inline by the provider.
    pub native_results: Vec<ToolResult>,
}

impl ModelOutput {
    /// Derives tool calls from the `tool_use` blocks of the output messages.
    pub fn from_messages(messages: Vec<Message>, stop_reason: StopReason, usage: Usage) -> Self {
        let tool_calls = messages
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(|block| match block {
                ContentBlock::ToolUse {
                    tool_use_id,
                    name,
                    input,
                } => Some(ToolCall::new(tool_use_id.clone(), name.clone(), input.clone())),
                _ => None,
            })
            .collect();
        Self {
            messages,
            stop_reason,
            tool_calls,
            usage,
            native_results: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderRequest(pub Value);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderResponse(pub Value);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderChunk(pub Value);

pub type ChunkStream = BoxStream<'static, Result<ProviderChunk, EngineError>>;

/// A provider, seen from the engine.
///
/// `process_stream` must rebuild the same [`ModelOutput`] that
/// `process_output` would return for the equivalent buffered response, using
/// only the chunks it is given.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Fails with [`EngineError::Validation`] on malformed input.
    fn prepare_input(&self, input: &ModelInput) -> Result<ProviderRequest, EngineError>;

    async fn execute(&self, request: ProviderRequest) -> Result<ProviderResponse, EngineError>;

    async fn execute_stream(&self, request: ProviderRequest) -> Result<ChunkStream, EngineError>;

    fn process_output(&self, response: ProviderResponse) -> Result<ModelOutput, EngineError>;

    /// Maps one raw chunk onto a stream event. Chunks with no event
    /// counterpart (keepalives, bookkeeping) return `None`.
    fn process_chunk(&self, chunk: &ProviderChunk) -> Option<StreamEvent>;

    fn process_stream(&self, chunks: &[ProviderChunk]) -> Result<ModelOutput, EngineError>;
}
