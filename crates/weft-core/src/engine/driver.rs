//! The tick loop: compile, call the model, run tools, decide.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::{
    ExecutionStatus, Message, StopReason, StreamEvent, TickResponse, TimelineEntry, ToolSpec,
    Usage,
};

use super::{
    EngineInner, ExecutionHandle, ExecutionInput, ExecutionOutput, StatusReporter, final_text,
};
use crate::com::Com;
use crate::compiler::Compiler;
use crate::context::ExecutionContext;
use crate::error::{EngineError, ExecutionError};
use crate::intercept::{Envelope, Operation, Terminal};
use crate::model::{ModelAdapter, ModelInput, ModelOutput};
use crate::stream::{EventSink, ExecutionStream, OutcomeCell};
use crate::tools::{Tool, ToolBatch, ToolContext, ToolExecutor, ToolRegistry};

pub(crate) async fn run_buffered(
    engine: Arc<EngineInner>,
    input: ExecutionInput,
) -> Result<ExecutionOutput, ExecutionError> {
    let (run, _handle) = Run::new(engine, input, EventSink::disabled());
    run.run().await
}

pub(crate) fn start_stream(engine: Arc<EngineInner>, input: ExecutionInput) -> ExecutionStream {
    let (sink, rx) = EventSink::channel(engine.config.event_channel_capacity);
    let (run, handle) = Run::new(engine, input, sink);
    let outcome = OutcomeCell::default();
    let driver = Box::pin({
        let outcome = outcome.clone();
        async move { outcome.set(run.run().await) }
    });
    ExecutionStream::new(rx, driver, handle, outcome)
}

/// State of one execution. Owns the COM and the compiler's instances.
struct Run {
    engine: Arc<EngineInner>,
    pid: Uuid,
    com: Com,
    compiler: Compiler,
    execution: ExecutionContext,
    executor: ToolExecutor,
    sink: EventSink,
    cancel: CancellationToken,
    reporter: StatusReporter,
    ticks: u32,
    usage: Usage,
}

impl Run {
    fn new(engine: Arc<EngineInner>, input: ExecutionInput, sink: EventSink) -> (Self, ExecutionHandle) {
        let ExecutionInput {
            messages,
            context,
            cancel,
        } = input;
        let pid = context.execution_id;
        let (reporter, handle) = StatusReporter::new(pid, cancel.clone());
        let compiler = Compiler::new(engine.renderer.clone())
            .with_auto_timeline(engine.config.auto_timeline);
        let executor = ToolExecutor::new(
            engine.registry.clone(),
            engine.bridge.clone(),
            engine.broker.clone(),
            engine.settings,
            engine.interceptors.tool_run.clone(),
        );
        let run = Self {
            engine,
            pid,
            com: Com::new(messages),
            compiler,
            execution: context,
            executor,
            sink,
            cancel,
            reporter,
            ticks: 0,
            usage: Usage::default(),
        };
        (run, handle)
    }

    async fn run(mut self) -> Result<ExecutionOutput, ExecutionError> {
        tracing::info!(
            pid = %self.pid,
            thread = ?self.execution.thread_id,
            model = self.engine.model.name(),
            "execution started"
        );
        self.sink
            .send(StreamEvent::ExecutionStart {
                execution_id: self.pid.to_string(),
                thread_id: self.execution.thread_id.clone(),
            })
            .await;

        let result = self.tick_loop().await;
        self.compiler.unmount_all(&self.com).await;

        match result {
            Ok(stop_reason) => {
                self.reporter.finish(ExecutionStatus::Completed);
                let timeline: Vec<TimelineEntry> = self
                    .com
                    .timeline()
                    .snapshot()
                    .iter()
                    .map(|entry| (**entry).clone())
                    .collect();
                let output = ExecutionOutput {
                    pid: self.pid,
                    status: ExecutionStatus::Completed,
                    stop_reason,
                    ticks: self.ticks,
                    final_text: final_text(&timeline),
                    usage: self.usage,
                    timeline,
                    state: self.com.snapshot_json(),
                };
                tracing::info!(
                    pid = %self.pid,
                    ticks = self.ticks,
                    stop_reason = %stop_reason,
                    "execution completed"
                );
                self.sink
                    .send(StreamEvent::ExecutionEnd {
                        summary: output.summary(),
                    })
                    .await;
                Ok(output)
            }
            Err(err) => {
                self.reporter.finish(ExecutionStatus::Failed);
                if err.is_cancelled() {
                    tracing::info!(pid = %self.pid, ticks = self.ticks, "execution cancelled");
                } else {
                    tracing::warn!(pid = %self.pid, ticks = self.ticks, error = %err, "execution failed");
                }
                self.sink
                    .send(StreamEvent::Error {
                        kind: err.kind(),
                        message: err.to_string(),
                        details: None,
                        tick: (self.ticks > 0).then_some(self.ticks),
                    })
                    .await;
                Err(ExecutionError {
                    pid: self.pid,
                    ticks: self.ticks,
                    source: err,
                    timeline: self.com.timeline().snapshot(),
                })
            }
        }
    }

    fn check_cancel(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn tick_loop(&mut self) -> Result<StopReason, EngineError> {
        let max_ticks = self.engine.config.max_ticks.max(1);
        loop {
            self.check_cancel()?;
            let tick = self.ticks + 1;
            self.ticks = tick;

            if tick == 1 {
                self.com.set_tick(1);
                for message in self.com.user_input().to_vec() {
                    self.com.append_message(message);
                }
            }
            let state = self.com.begin_tick(tick);
            tracing::debug!(tick, entries = state.current_tick_entries.len(), "tick started");
            self.sink.send(StreamEvent::TickStart { tick }).await;

            let compilation = self
                .compiler
                .compile(&self.engine.root, &self.com, &self.execution, &state)
                .await?;
            let specs = tool_specs(&compilation.tools, &self.engine.registry);
            let input = ModelInput::from_structure(tick, &compilation.structure, specs);
            let output = self.call_model(input, tick).await?;

            self.usage.add(&output.usage);
            for message in &output.messages {
                self.com.append_message(message.clone());
            }

            if !output.tool_calls.is_empty() {
                let ctx = ToolContext {
                    com: self.com.clone(),
                    execution: self.execution.clone(),
                    tick,
                    cancel: self.cancel.clone(),
                };
                let batch = ToolBatch {
                    calls: &output.tool_calls,
                    tick_tools: &compilation.tools,
                    native_results: &output.native_results,
                };
                let results = self.executor.execute(batch, &ctx, &self.sink).await;
                self.com.append_message(Message::tool_results(results));
                // Canceled results are already on the timeline.
                self.check_cancel()?;
            }

            self.sink
                .send(StreamEvent::TickEnd {
                    tick,
                    response: TickResponse {
                        stop_reason: output.stop_reason,
                        messages: output.messages.clone(),
                        tool_calls: output.tool_calls.clone(),
                        usage: output.usage,
                    },
                })
                .await;
            tracing::debug!(tick, stop_reason = %output.stop_reason, tools = output.tool_calls.len(), "tick ended");

            if output.tool_calls.is_empty() || output.stop_reason.is_terminal() {
                return Ok(output.stop_reason);
            }
            if tick >= max_ticks {
                tracing::info!(pid = %self.pid, tick, "max ticks reached");
                return Ok(StopReason::MaxTicks);
            }
        }
    }

    async fn call_model(&self, input: ModelInput, tick: u32) -> Result<ModelOutput, EngineError> {
        let streaming = self.sink.is_enabled();
        let operation = if streaming {
            Operation::ModelStream
        } else {
            Operation::ModelGenerate
        };
        let envelope = Envelope::new(operation, self.execution.clone(), tick);
        let model = self.engine.model.as_ref();
        let (sink, cancel) = (&self.sink, &self.cancel);
        let interceptors = &self.engine.interceptors;

        let call = async {
            if streaming {
                let terminal: &Terminal<'_, ModelInput, ModelOutput, EngineError> =
                    &move |input| Box::pin(stream_model(model, input, sink, cancel));
                interceptors
                    .model_stream
                    .run(input, &envelope, terminal)
                    .await
            } else {
                let terminal: &Terminal<'_, ModelInput, ModelOutput, EngineError> =
                    &move |input| Box::pin(generate(model, input));
                interceptors
                    .model_generate
                    .run(input, &envelope, terminal)
                    .await
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(EngineError::Cancelled),
            result = call => result,
        }
    }
}

/// Tree tools first, then registry tools they don't shadow.
fn tool_specs(tick_tools: &[Tool], registry: &ToolRegistry) -> Vec<ToolSpec> {
    let mut specs: Vec<ToolSpec> = tick_tools.iter().map(|t| t.definition.spec()).collect();
    for tool in registry.tools() {
        let shadowed = tick_tools
            .iter()
            .any(|t| t.name().eq_ignore_ascii_case(tool.name()));
        if !shadowed {
            specs.push(tool.definition.spec());
        }
    }
    specs
}

async fn generate(model: &dyn ModelAdapter, input: ModelInput) -> Result<ModelOutput, EngineError> {
    let request = model.prepare_input(&input)?;
    let response = model.execute(request).await?;
    model.process_output(response)
}

/// Forwards each chunk's event as it arrives, then rebuilds the output from
/// the raw chunks.
async fn stream_model(
    model: &dyn ModelAdapter,
    input: ModelInput,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> Result<ModelOutput, EngineError> {
    let request = model.prepare_input(&input)?;
    let mut chunks = model.execute_stream(request).await?;
    let mut seen = Vec::new();
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(EngineError::Cancelled),
            next = chunks.next() => next,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk?;
        if let Some(event) = model.process_chunk(&chunk) {
            sink.send(event).await;
        }
        seen.push(chunk);
    }
    model.process_stream(&seen)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tools::ToolOutput;

    fn tool(name: &str, description: &str) -> Tool {
        Tool::server(name, description, json!({}), |_input, _ctx| async {
            ToolOutput::success(json!(null))
        })
    }

    #[test]
    fn test_tree_tools_shadow_registry() {
        let registry = ToolRegistry::new()
            .with_tool(tool("calc", "registry calc"))
            .with_tool(tool("remember", "registry remember"));
        let specs = tool_specs(&[tool("CALC", "tree calc")], &registry);
        let described: Vec<(&str, &str)> = specs
            .iter()
            .map(|s| (s.name.as_str(), s.description.as_str()))
            .collect();
        assert_eq!(
            described,
            vec![("CALC", "tree calc"), ("remember", "registry remember")]
        );
    }
}
