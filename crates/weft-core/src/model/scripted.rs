//! Deterministic model boundary driven by a script of canned turns.
//!
//! Wire shape, buffered:
//! `{"content":[{"type":"text",..},{"type":"tool_use","id","name","input"}],"stop_reason","usage","native_results"}`.
//! Streamed, the same turn arrives as `message_start`, `block_start`/`delta`/`block_end`
//! per content block, `native_result` per inline result, then `message_end`.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use weft_types::{BlockType, ContentBlock, Message, Role, StopReason, StreamEvent, ToolResult, Usage};

use super::{
    ChunkStream, ModelAdapter, ModelInput, ModelOutput, ProviderChunk, ProviderRequest,
    ProviderResponse,
};
use crate::error::EngineError;

const DEFAULT_CHUNK_SIZE: usize = 8;

/// One canned model response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptedTurn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ScriptedToolCall>,
    /// Raw provider stop string. Defaults to `tool_use` when the turn has
    /// tool calls and `end_turn` otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub native_results: Vec<ToolResult>,
    /// Makes the call fail with an adapter error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedToolCall {
    /// Generated as `toolu_<turn>_<index>` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn tool_call(name: impl Into<String>, input: Value) -> Self {
        Self::default().with_tool_call(name, input)
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_tool_call(mut self, name: impl Into<String>, input: Value) -> Self {
        self.tool_calls.push(ScriptedToolCall {
            id: None,
            name: name.into(),
            input,
        });
        self
    }

    #[must_use]
    pub fn with_stop_reason(mut self, stop_reason: impl Into<String>) -> Self {
        self.stop_reason = Some(stop_reason.into());
        self
    }

    #[must_use]
    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Usage {
            input_tokens,
            output_tokens,
            ..Usage::default()
        };
        self
    }

    #[must_use]
    pub fn with_native_result(mut self, result: ToolResult) -> Self {
        self.native_results.push(result);
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    fn stop_string(&self) -> String {
        match &self.stop_reason {
            Some(reason) => reason.clone(),
            None if self.tool_calls.is_empty() => "end_turn".to_string(),
            None => "tool_use".to_string(),
        }
    }

    fn call_id(&self, turn: usize, index: usize) -> String {
        self.tool_calls[index]
            .id
            .clone()
            .unwrap_or_else(|| format!("toolu_{turn}_{index}"))
    }

    fn response(&self, turn: usize) -> ProviderResponse {
        let mut content = Vec::new();
        if let Some(text) = &self.text {
            content.push(json!({"type": "text", "text": text}));
        }
        for (index, call) in self.tool_calls.iter().enumerate() {
            content.push(json!({
                "type": "tool_use",
                "id": self.call_id(turn, index),
                "name": call.name,
                "input": call.input,
            }));
        }
        ProviderResponse(json!({
            "content": content,
            "stop_reason": self.stop_string(),
            "usage": self.usage,
            "native_results": self.native_results,
        }))
    }

    fn chunks(&self, turn: usize, chunk_size: usize) -> Vec<ProviderChunk> {
        let mut chunks = vec![ProviderChunk(json!({"type": "message_start"}))];
        let mut index = 0;
        if let Some(text) = &self.text {
            chunks.push(ProviderChunk(
                json!({"type": "block_start", "index": index, "block_type": "text"}),
            ));
            for piece in split_chars(text, chunk_size) {
                chunks.push(ProviderChunk(json!({
                    "type": "delta", "index": index, "block_type": "text", "text": piece,
                })));
            }
            chunks.push(ProviderChunk(
                json!({"type": "block_end", "index": index, "block_type": "text"}),
            ));
            index += 1;
        }
        for (call_index, call) in self.tool_calls.iter().enumerate() {
            chunks.push(ProviderChunk(json!({
                "type": "block_start",
                "index": index,
                "block_type": "tool_use",
                "id": self.call_id(turn, call_index),
                "name": call.name,
            })));
            for piece in split_chars(&call.input.to_string(), chunk_size) {
                chunks.push(ProviderChunk(json!({
                    "type": "delta", "index": index, "block_type": "tool_use", "text": piece,
                })));
            }
            chunks.push(ProviderChunk(
                json!({"type": "block_end", "index": index, "block_type": "tool_use"}),
            ));
            index += 1;
        }
        for result in &self.native_results {
            chunks.push(ProviderChunk(json!({"type": "native_result", "result": result})));
        }
        chunks.push(ProviderChunk(json!({
            "type": "message_end",
            "stop_reason": self.stop_string(),
            "usage": self.usage,
        })));
        chunks
    }
}

fn split_chars(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size.max(1))
        .map(|piece| piece.iter().collect())
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScriptFile {
    Turns(Vec<ScriptedTurn>),
    Full {
        #[serde(default)]
        repeat_last: bool,
        turns: Vec<ScriptedTurn>,
    },
}

#[derive(Default)]
struct ScriptState {
    turns: VecDeque<ScriptedTurn>,
    last: Option<ScriptedTurn>,
    served: usize,
    requests: Vec<ProviderRequest>,
}

/// Serves scripted turns in order, one per model call.
pub struct ScriptedModel {
    state: Mutex<ScriptState>,
    repeat_last: bool,
    chunk_size: usize,
}

impl ScriptedModel {
    pub fn new(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            state: Mutex::new(ScriptState {
                turns: turns.into_iter().collect(),
                ..ScriptState::default()
            }),
            repeat_last: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Loads a script: either a bare array of turns or
    /// `{"repeat_last": bool, "turns": [...]}`.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid script {}", path.display()))
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let file: ScriptFile = serde_json::from_str(raw)?;
        Ok(match file {
            ScriptFile::Turns(turns) => Self::new(turns),
            ScriptFile::Full { repeat_last, turns } => {
                Self::new(turns).with_repeat_last(repeat_last)
            }
        })
    }

    /// Keeps serving the final turn once the script runs out.
    #[must_use]
    pub fn with_repeat_last(mut self, repeat_last: bool) -> Self {
        self.repeat_last = repeat_last;
        self
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Requests seen so far, in call order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.state.lock().requests.clone()
    }

    pub fn remaining(&self) -> usize {
        self.state.lock().turns.len()
    }

    async fn next_turn(&self, request: ProviderRequest) -> Result<(usize, ScriptedTurn), EngineError> {
        let (served, turn) = {
            let mut state = self.state.lock();
            state.requests.push(request);
            let turn = match state.turns.pop_front() {
                Some(turn) => {
                    state.last = Some(turn.clone());
                    turn
                }
                None => match (&state.last, self.repeat_last) {
                    (Some(last), true) => last.clone(),
                    _ => {
                        return Err(EngineError::Adapter(format!(
                            "script exhausted after {} turn(s)",
                            state.served
                        )));
                    }
                },
            };
            state.served += 1;
            (state.served, turn)
        };
        if turn.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(turn.delay_ms)).await;
        }
        if let Some(message) = &turn.error {
            return Err(EngineError::Adapter(message.clone()));
        }
        Ok((served, turn))
    }
}

#[derive(Deserialize)]
struct RawResponse {
    #[serde(default)]
    content: Vec<RawBlock>,
    stop_reason: String,
    #[serde(default)]
    usage: Usage,
    #[serde(default)]
    native_results: Vec<ToolResult>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawChunk {
    MessageStart,
    BlockStart {
        index: usize,
        block_type: BlockType,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
    Delta {
        index: usize,
        block_type: BlockType,
        text: String,
    },
    BlockEnd {
        index: usize,
        block_type: BlockType,
    },
    NativeResult {
        result: ToolResult,
    },
    MessageEnd {
        stop_reason: String,
        #[serde(default)]
        usage: Usage,
    },
}

fn parse_chunk(chunk: &ProviderChunk) -> Result<RawChunk, EngineError> {
    serde_json::from_value(chunk.0.clone())
        .map_err(|err| EngineError::Adapter(format!("malformed chunk: {err}")))
}

fn parse_stop(raw: &str) -> Result<StopReason, EngineError> {
    StopReason::from_provider(raw)
        .ok_or_else(|| EngineError::Adapter(format!("unknown stop reason: {raw}")))
}

fn assistant(content: Vec<ContentBlock>) -> Vec<Message> {
    if content.is_empty() {
        Vec::new()
    } else {
        vec![Message::new(Role::Assistant, content)]
    }
}

enum Partial {
    Text(String),
    Tool { id: String, name: String, json: String },
}

#[async_trait]
impl ModelAdapter for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn prepare_input(&self, input: &ModelInput) -> Result<ProviderRequest, EngineError> {
        if input.messages.is_empty() {
            return Err(EngineError::Validation(
                "model input has no messages".to_string(),
            ));
        }
        let system = input
            .system
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n\n");
        let messages: Vec<Value> = input
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();
        Ok(ProviderRequest(json!({
            "tick": input.tick,
            "system": system,
            "messages": messages,
            "tools": input.tools,
        })))
    }

    async fn execute(&self, request: ProviderRequest) -> Result<ProviderResponse, EngineError> {
        let (served, turn) = self.next_turn(request).await?;
        Ok(turn.response(served))
    }

    async fn execute_stream(&self, request: ProviderRequest) -> Result<ChunkStream, EngineError> {
        let (served, turn) = self.next_turn(request).await?;
        let chunks = turn.chunks(served, self.chunk_size);
        Ok(futures_util::stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    fn process_output(&self, response: ProviderResponse) -> Result<ModelOutput, EngineError> {
        let raw: RawResponse = serde_json::from_value(response.0)
            .map_err(|err| EngineError::Adapter(format!("malformed response: {err}")))?;
        let stop_reason = parse_stop(&raw.stop_reason)?;
        let content = raw
            .content
            .into_iter()
            .map(|block| match block {
                RawBlock::Text { text } => ContentBlock::Text { text },
                RawBlock::ToolUse { id, name, input } => ContentBlock::ToolUse {
                    tool_use_id: id,
                    name,
                    input,
                },
            })
            .collect();
        let mut output = ModelOutput::from_messages(assistant(content), stop_reason, raw.usage);
        output.native_results = raw.native_results;
        Ok(output)
    }

    fn process_chunk(&self, chunk: &ProviderChunk) -> Option<StreamEvent> {
        match parse_chunk(chunk).ok()? {
            RawChunk::BlockStart {
                index,
                block_type,
                id,
                name,
            } => Some(StreamEvent::ContentBlockStart {
                block_type,
                block_index: index,
                id,
                name,
            }),
            RawChunk::Delta {
                index,
                block_type,
                text,
            } => Some(StreamEvent::ContentDelta {
                block_type,
                block_index: index,
                delta: text,
            }),
            RawChunk::BlockEnd { index, block_type } => Some(StreamEvent::ContentBlockEnd {
                block_type,
                block_index: index,
            }),
            RawChunk::MessageEnd { stop_reason, usage } => Some(StreamEvent::MessageEnd {
                stop_reason: StopReason::from_provider(&stop_reason),
                usage: Some(usage),
            }),
            RawChunk::MessageStart | RawChunk::NativeResult { .. } => None,
        }
    }

    fn process_stream(&self, chunks: &[ProviderChunk]) -> Result<ModelOutput, EngineError> {
        let mut blocks: BTreeMap<usize, Partial> = BTreeMap::new();
        let mut native_results = Vec::new();
        let mut end = None;

        for chunk in chunks {
            match parse_chunk(chunk)? {
                RawChunk::BlockStart {
                    index,
                    block_type,
                    id,
                    name,
                } => {
                    let partial = match block_type {
                        BlockType::ToolUse => Partial::Tool {
                            id: id.unwrap_or_default(),
                            name: name.unwrap_or_default(),
                            json: String::new(),
                        },
                        _ => Partial::Text(String::new()),
                    };
                    blocks.insert(index, partial);
                }
                RawChunk::Delta { index, text, .. } => match blocks.get_mut(&index) {
                    Some(Partial::Text(buf) | Partial::Tool { json: buf, .. }) => {
                        buf.push_str(&text);
                    }
                    None => {
                        return Err(EngineError::Adapter(format!(
                            "delta for unopened block {index}"
                        )));
                    }
                },
                RawChunk::NativeResult { result } => native_results.push(result),
                RawChunk::MessageEnd { stop_reason, usage } => {
                    end = Some((parse_stop(&stop_reason)?, usage));
                }
                RawChunk::MessageStart | RawChunk::BlockEnd { .. } => {}
            }
        }

        let (stop_reason, usage) = end.ok_or_else(|| {
            EngineError::Adapter("stream ended before message_end".to_string())
        })?;
        let content = blocks
            .into_values()
            .map(|partial| match partial {
                Partial::Text(text) => Ok(ContentBlock::Text { text }),
                Partial::Tool { id, name, json } => {
                    let input = if json.trim().is_empty() {
                        Value::Object(serde_json::Map::new())
                    } else {
                        serde_json::from_str(&json).map_err(|err| {
                            EngineError::Adapter(format!("invalid tool input for {name}: {err}"))
                        })?
                    };
                    Ok(ContentBlock::ToolUse {
                        tool_use_id: id,
                        name,
                        input,
                    })
                }
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        let mut output = ModelOutput::from_messages(assistant(content), stop_reason, usage);
        output.native_results = native_results;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::TryStreamExt;
    use weft_types::ToolSpec;

    use super::*;

    fn input() -> ModelInput {
        ModelInput {
            tick: 1,
            system: vec![ContentBlock::text("Be brief.")],
            messages: vec![Message::user("Hello")],
            tools: vec![ToolSpec {
                name: "calc".to_string(),
                description: "Calculator".to_string(),
                parameters_schema: json!({"type": "object"}),
            }],
        }
    }

    async fn buffered(model: &ScriptedModel) -> ModelOutput {
        let request = model.prepare_input(&input()).unwrap();
        let response = model.execute(request).await.unwrap();
        model.process_output(response).unwrap()
    }

    async fn streamed(model: &ScriptedModel) -> (ModelOutput, Vec<StreamEvent>) {
        let request = model.prepare_input(&input()).unwrap();
        let chunks: Vec<ProviderChunk> = model
            .execute_stream(request)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let events = chunks.iter().filter_map(|c| model.process_chunk(c)).collect();
        (model.process_stream(&chunks).unwrap(), events)
    }

    fn script() -> Vec<ScriptedTurn> {
        vec![
            ScriptedTurn::text("Let me compute that for you.")
                .with_tool_call("calc", json!({"expr": "2+2"}))
                .with_tool_call("calc", json!({"expr": "3+3"}))
                .with_usage(12, 5),
        ]
    }

    #[tokio::test]
    async fn test_stream_rebuilds_buffered_output() {
        let a = buffered(&ScriptedModel::new(script())).await;
        let (b, _) = streamed(&ScriptedModel::new(script()).with_chunk_size(3)).await;

        assert_eq!(a.stop_reason, StopReason::ToolUse);
        assert_eq!(a.stop_reason, b.stop_reason);
        assert_eq!(a.usage, b.usage);
        assert_eq!(a.tool_calls, b.tool_calls);
        assert_eq!(a.messages.len(), 1);
        assert!(a.messages[0].same_content(&b.messages[0]));
        assert_eq!(a.tool_calls[1].id, "toolu_1_1");
    }

    #[tokio::test]
    async fn test_chunks_map_to_deltas() {
        let model = ScriptedModel::new([ScriptedTurn::text("Hi there")]).with_chunk_size(4);
        let (output, events) = streamed(&model).await;
        let deltas: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentDelta { delta, .. } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["Hi t", "here"]);
        assert_eq!(output.messages[0].text(), "Hi there");
        assert!(matches!(
            events.last(),
            Some(StreamEvent::MessageEnd {
                stop_reason: Some(StopReason::Stop),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_exhausted_script_is_adapter_error() {
        let model = ScriptedModel::new([ScriptedTurn::text("once")]);
        buffered(&model).await;
        let request = model.prepare_input(&input()).unwrap();
        let err = model.execute(request).await.unwrap_err();
        assert!(matches!(err, EngineError::Adapter(msg) if msg.contains("exhausted after 1")));
    }

    #[tokio::test]
    async fn test_repeat_last_keeps_serving() {
        let model = ScriptedModel::new([ScriptedTurn::tool_call("calc", json!({}))])
            .with_repeat_last(true);
        for turn in 1..=3 {
            let output = buffered(&model).await;
            assert_eq!(output.tool_calls[0].id, format!("toolu_{turn}_0"));
        }
        assert_eq!(model.requests().len(), 3);
    }

    #[test]
    fn test_empty_input_is_validation_error() {
        let model = ScriptedModel::new([]);
        let mut empty = input();
        empty.messages.clear();
        assert!(matches!(
            model.prepare_input(&empty),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_stop_reason_is_adapter_error() {
        let model = ScriptedModel::new([]);
        let response = ProviderResponse(json!({"content": [], "stop_reason": "sleepy"}));
        assert!(matches!(
            model.process_output(response),
            Err(EngineError::Adapter(_))
        ));
    }

    #[test]
    fn test_script_file_forms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.json");
        std::fs::write(
            &path,
            r#"{"repeat_last": true, "turns": [{"text": "hi", "stop_reason": "stop"}]}"#,
        )
        .unwrap();
        let model = ScriptedModel::from_file(&path).unwrap();
        assert!(model.repeat_last);
        assert_eq!(model.remaining(), 1);

        let bare = ScriptedModel::from_json(r#"[{"text": "a"}, {"text": "b"}]"#).unwrap();
        assert!(!bare.repeat_last);
        assert_eq!(bare.remaining(), 2);
    }
}
