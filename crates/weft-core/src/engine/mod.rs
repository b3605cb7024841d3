//! The engine: compiles the component tree, calls the model, runs tools,
//! and decides whether to go another tick.
//!
//! `execute` waits for the whole run; `stream` returns a lazy event sequence
//! driven by the same loop. Both go through their interceptor chain.

mod driver;
mod handle;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::{
    ExecutionStatus, ExecutionSummary, Message, Role, StopReason, TimelineEntry, Usage,
};

pub use handle::ExecutionHandle;
pub(crate) use handle::StatusReporter;

use crate::config::Config;
use crate::context::ExecutionContext;
use crate::error::{EngineError, ExecutionError};
use crate::intercept::{Envelope, Interceptors, Operation, Terminal};
use crate::model::ModelAdapter;
use crate::node::ComponentNode;
use crate::render::{Renderer, RendererRef};
use crate::stream::ExecutionStream;
use crate::tools::{
    ClientToolBridge, ConfirmationBroker, ExecutorSettings, Tool, ToolRegistry, ToolRouter,
};

/// Input to one execution.
#[derive(Debug, Clone)]
pub struct ExecutionInput {
    /// Captured as the COM's user input and appended on tick 1.
    pub messages: Vec<Message>,
    pub context: ExecutionContext,
    /// External cancellation. Also reachable through the execution handle.
    pub cancel: CancellationToken,
}

impl ExecutionInput {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            context: ExecutionContext::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(vec![Message::user(text)])
    }

    #[must_use]
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Result of a completed execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutput {
    pub pid: Uuid,
    pub status: ExecutionStatus,
    pub stop_reason: StopReason,
    pub ticks: u32,
    /// Text of the last assistant message.
    pub final_text: String,
    pub usage: Usage,
    pub timeline: Vec<TimelineEntry>,
    /// JSON view of the COM's shared state at the end of the run.
    pub state: Value,
}

impl ExecutionOutput {
    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            execution_id: self.pid.to_string(),
            status: self.status,
            stop_reason: self.stop_reason,
            ticks: self.ticks,
            final_text: self.final_text.clone(),
            usage: self.usage,
        }
    }

    /// Timeline messages, skipping events.
    pub fn messages(&self) -> Vec<&Message> {
        self.timeline
            .iter()
            .filter_map(TimelineEntry::as_message)
            .collect()
    }
}

fn final_text(timeline: &[TimelineEntry]) -> String {
    timeline
        .iter()
        .rev()
        .filter_map(TimelineEntry::as_message)
        .find(|m| m.role == Role::Assistant)
        .map(Message::text)
        .unwrap_or_default()
}

pub(crate) struct EngineInner {
    pub(crate) root: ComponentNode,
    pub(crate) model: Arc<dyn ModelAdapter>,
    pub(crate) registry: ToolRegistry,
    pub(crate) interceptors: Interceptors,
    pub(crate) config: Config,
    pub(crate) settings: ExecutorSettings,
    pub(crate) renderer: RendererRef,
    pub(crate) bridge: ClientToolBridge,
    pub(crate) broker: ConfirmationBroker,
}

/// Runs executions of one agent definition. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Tool execution limits in effect, after builder overrides.
    pub fn executor_settings(&self) -> ExecutorSettings {
        self.inner.settings
    }

    /// Where client tool calls are resolved.
    pub fn bridge(&self) -> &ClientToolBridge {
        &self.inner.bridge
    }

    /// Where confirmation-gated calls are approved or rejected.
    pub fn broker(&self) -> &ConfirmationBroker {
        &self.inner.broker
    }

    /// Runs to completion. Fails with the terminal error and the timeline
    /// flushed up to the failure.
    pub async fn execute(&self, input: ExecutionInput) -> Result<ExecutionOutput, ExecutionError> {
        let envelope = Envelope::new(Operation::EngineExecute, input.context.clone(), 0);
        let inner = &self.inner;
        let terminal: &Terminal<'_, ExecutionInput, ExecutionOutput, ExecutionError> =
            &move |input| Box::pin(driver::run_buffered(Arc::clone(inner), input));
        self.inner
            .interceptors
            .execute
            .run(input, &envelope, terminal)
            .await
    }

    /// Starts a streaming execution. Nothing runs until the stream is polled.
    pub async fn stream(&self, input: ExecutionInput) -> Result<ExecutionStream, ExecutionError> {
        let envelope = Envelope::new(Operation::EngineStream, input.context.clone(), 0);
        let inner = &self.inner;
        let terminal: &Terminal<'_, ExecutionInput, ExecutionStream, ExecutionError> =
            &move |input| {
                let stream = driver::start_stream(Arc::clone(inner), input);
                Box::pin(async move { Ok(stream) })
            };
        self.inner
            .interceptors
            .stream
            .run(input, &envelope, terminal)
            .await
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("model", &self.inner.model.name())
            .field("root", &self.inner.root)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Assembles an [`Engine`]. Builder settings win over config file values.
#[derive(Default)]
pub struct EngineBuilder {
    root: Option<ComponentNode>,
    model: Option<Arc<dyn ModelAdapter>>,
    registry: ToolRegistry,
    interceptors: Interceptors,
    config: Config,
    tool_timeout: Option<Duration>,
    renderer: Option<RendererRef>,
    bridge: ClientToolBridge,
    broker: ConfirmationBroker,
}

impl EngineBuilder {
    /// The component tree compiled every tick. Defaults to a bare timeline.
    #[must_use]
    pub fn root(mut self, root: ComponentNode) -> Self {
        self.root = Some(root);
        self
    }

    #[must_use]
    pub fn model(self, model: impl ModelAdapter + 'static) -> Self {
        self.shared_model(Arc::new(model))
    }

    #[must_use]
    pub fn shared_model(mut self, model: Arc<dyn ModelAdapter>) -> Self {
        self.model = Some(model);
        self
    }

    /// Registers a tool available on every tick.
    #[must_use]
    pub fn tool(mut self, tool: Tool) -> Self {
        self.registry.register(tool);
        self
    }

    #[must_use]
    pub fn router(mut self, endpoint: impl Into<String>, router: Arc<dyn ToolRouter>) -> Self {
        self.registry.register_router(endpoint, router);
        self
    }

    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn max_ticks(mut self, max_ticks: u32) -> Self {
        self.config.max_ticks = max_ticks.max(1);
        self
    }

    /// Per-call timeout for server and routed tools, kept at full precision.
    /// `Duration::ZERO` disables it.
    #[must_use]
    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn renderer(mut self, renderer: impl Renderer + 'static) -> Self {
        self.renderer = Some(RendererRef::new(renderer));
        self
    }

    #[must_use]
    pub fn auto_timeline(mut self, enabled: bool) -> Self {
        self.config.auto_timeline = enabled;
        self
    }

    /// Adds interceptors to any chain.
    #[must_use]
    pub fn intercept(mut self, install: impl FnOnce(&mut Interceptors)) -> Self {
        install(&mut self.interceptors);
        self
    }

    #[must_use]
    pub fn bridge(mut self, bridge: ClientToolBridge) -> Self {
        self.bridge = bridge;
        self
    }

    #[must_use]
    pub fn broker(mut self, broker: ConfirmationBroker) -> Self {
        self.broker = broker;
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        let model = self
            .model
            .ok_or_else(|| EngineError::Validation("engine has no model adapter".to_string()))?;
        let renderer = self.renderer.unwrap_or_else(|| self.config.renderer());
        let mut settings = self.config.executor_settings();
        if let Some(timeout) = self.tool_timeout {
            settings.tool_timeout = (!timeout.is_zero()).then_some(timeout);
        }
        Ok(Engine {
            inner: Arc::new(EngineInner {
                root: self.root.unwrap_or_else(ComponentNode::timeline),
                model,
                registry: self.registry,
                interceptors: self.interceptors,
                config: self.config,
                settings,
                renderer,
                bridge: self.bridge,
                broker: self.broker,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ScriptedModel, ScriptedTurn};

    #[test]
    fn test_build_requires_model() {
        let err = Engine::builder().build().unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_builder_overrides_config() {
        let engine = Engine::builder()
            .model(ScriptedModel::new([ScriptedTurn::text("hi")]))
            .config(Config {
                max_ticks: 7,
                ..Config::default()
            })
            .max_ticks(0)
            .tool_timeout(Duration::from_millis(10))
            .build()
            .unwrap();
        assert_eq!(engine.config().max_ticks, 1);
        assert_eq!(
            engine.executor_settings().tool_timeout,
            Some(Duration::from_millis(10))
        );
    }

    #[test]
    fn test_zero_builder_timeout_disables_configured_one() {
        let engine = Engine::builder()
            .model(ScriptedModel::new([ScriptedTurn::text("hi")]))
            .config(Config {
                tool_timeout_secs: 5,
                ..Config::default()
            })
            .tool_timeout(Duration::ZERO)
            .build()
            .unwrap();
        assert_eq!(engine.executor_settings().tool_timeout, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_second_builder_timeout_applies_to_tools() {
        let engine = Engine::builder()
            .model(ScriptedModel::new([
                ScriptedTurn::tool_call("nap", serde_json::json!({})),
                ScriptedTurn::text("gave up"),
            ]))
            .tool(Tool::server("nap", "Sleeps", serde_json::json!({}), |_input, _ctx| async {
                tokio::time::sleep(Duration::from_millis(400)).await;
                crate::tools::ToolOutput::success(serde_json::json!("rested"))
            }))
            .tool_timeout(Duration::from_millis(150))
            .build()
            .unwrap();
        let output = engine.execute(ExecutionInput::user("rest")).await.unwrap();
        let messages = output.messages();
        let text = serde_json::to_string(&messages[2].content).unwrap();
        assert!(text.contains("timed out after 150 ms"));
    }

    #[tokio::test]
    async fn test_single_tick_without_tools() {
        let engine = Engine::builder()
            .model(ScriptedModel::new([ScriptedTurn::text("Hi")]))
            .build()
            .unwrap();
        let output = engine.execute(ExecutionInput::user("Hello")).await.unwrap();

        assert_eq!(output.status, ExecutionStatus::Completed);
        assert_eq!(output.ticks, 1);
        assert_eq!(output.stop_reason, StopReason::Stop);
        assert_eq!(output.final_text, "Hi");
        let texts: Vec<(Role, String)> = output
            .messages()
            .into_iter()
            .map(|m| (m.role, m.text()))
            .collect();
        assert_eq!(
            texts,
            vec![
                (Role::User, "Hello".to_string()),
                (Role::Assistant, "Hi".to_string())
            ]
        );
    }
}
