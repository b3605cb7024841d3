//! Concurrent execution of one tick's tool calls.
//!
//! Every call is dispatched on its own task (fan-out). The batch settles only
//! when all calls have (fan-in), and results come back in call order whatever
//! order they finished in.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use weft_types::{StreamEvent, ToolCall, ToolResult, ToolVariant};

use super::confirm::Gate;
use super::{
    ClientToolBridge, ClientToolRequest, ConfirmationBroker, Tool, ToolContext, ToolOutput,
    ToolRegistry, unknown_tool_output,
};
use crate::error::EngineError;
use crate::intercept::{Chain, Envelope, Operation, Terminal};
use crate::stream::EventSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Per-call timeout for server and routed tools. `None` disables it.
    pub tool_timeout: Option<Duration>,
    pub client_timeout: Duration,
    pub confirmation_grace: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            tool_timeout: None,
            client_timeout: Duration::from_secs(300),
            confirmation_grace: Duration::from_secs(60),
        }
    }
}

/// One tick's calls plus what the tick knows about them.
#[derive(Debug, Clone, Copy)]
pub struct ToolBatch<'a> {
    pub calls: &'a [ToolCall],
    /// Tools rendered by the component tree this tick.
    pub tick_tools: &'a [Tool],
    /// Results the provider produced inline for provider-native tools.
    pub native_results: &'a [ToolResult],
}

#[derive(Clone)]
pub struct ToolExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    registry: ToolRegistry,
    bridge: ClientToolBridge,
    broker: ConfirmationBroker,
    settings: ExecutorSettings,
    interceptors: Chain<ToolCall, ToolResult>,
}

impl ToolExecutor {
    pub fn new(
        registry: ToolRegistry,
        bridge: ClientToolBridge,
        broker: ConfirmationBroker,
        settings: ExecutorSettings,
        interceptors: Chain<ToolCall, ToolResult>,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                registry,
                bridge,
                broker,
                settings,
                interceptors,
            }),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.inner.registry
    }

    fn resolve<'t>(&'t self, name: &str, tick_tools: &'t [Tool]) -> Option<&'t Tool> {
        tick_tools
            .iter()
            .find(|tool| tool.name().eq_ignore_ascii_case(name))
            .or_else(|| self.inner.registry.get(name))
    }

    fn available_names(&self, tick_tools: &[Tool]) -> Vec<String> {
        tick_tools
            .iter()
            .map(|t| t.name().to_string())
            .chain(self.inner.registry.tool_names())
            .collect()
    }

    /// Runs every call of the batch and returns results in call order.
    ///
    /// Cancellation aborts unsettled calls; they come back as canceled
    /// failures so the batch is always complete.
    pub async fn execute(
        &self,
        batch: ToolBatch<'_>,
        ctx: &ToolContext,
        events: &EventSink,
    ) -> Vec<ToolResult> {
        let mut join_set: JoinSet<(usize, ToolResult)> = JoinSet::new();
        let mut results: Vec<Option<ToolResult>> = vec![None; batch.calls.len()];
        let mut completed: HashSet<usize> = HashSet::new();

        for (index, call) in batch.calls.iter().enumerate() {
            let tool = self.resolve(&call.name, batch.tick_tools);
            let variant = tool
                .map(|t| t.definition.variant.clone())
                .unwrap_or_default();
            events
                .send(StreamEvent::ToolCall {
                    call: call.clone(),
                    variant,
                })
                .await;

            let Some(tool) = tool.cloned() else {
                tracing::warn!(tool = %call.name, "model called an unknown tool");
                let result = unknown_tool_output(&call.name, &self.available_names(batch.tick_tools))
                    .into_result(call);
                events
                    .send(StreamEvent::ToolResult {
                        result: result.clone(),
                    })
                    .await;
                completed.insert(index);
                results[index] = Some(result);
                continue;
            };

            let gate = if tool.definition.requires_confirmation {
                let gate = self
                    .inner
                    .broker
                    .register(ctx.execution.execution_id, &call.id);
                events
                    .send(StreamEvent::ToolConfirmationRequired { call: call.clone() })
                    .await;
                Some(gate)
            } else {
                None
            };

            let native = batch
                .native_results
                .iter()
                .find(|r| r.tool_use_id == call.id)
                .cloned();

            tracing::debug!(tick = ctx.tick, tool = %call.name, id = %call.id, "dispatching tool");
            let job = Job {
                executor: self.clone(),
                tool,
                call: call.clone(),
                gate,
                native,
                ctx: ctx.clone(),
            };
            join_set.spawn(async move { (index, job.run().await) });
        }

        loop {
            tokio::select! {
                biased;
                () = ctx.cancel.cancelled() => {
                    join_set.abort_all();

                    // Drain until every task is gone so aborted calls have
                    // withdrawn their pending gates and client requests. Keep
                    // anything that settled before the abort landed.
                    while let Some(joined) = join_set.join_next().await {
                        if let Ok((index, result)) = joined
                            && completed.insert(index)
                        {
                            events.send(StreamEvent::ToolResult { result: result.clone() }).await;
                            results[index] = Some(result);
                        }
                    }

                    for (index, call) in batch.calls.iter().enumerate() {
                        if completed.insert(index) {
                            let result = ToolOutput::canceled("Execution cancelled").into_result(call);
                            events.send(StreamEvent::ToolResult { result: result.clone() }).await;
                            results[index] = Some(result);
                        }
                    }
                    break;
                }
                joined = join_set.join_next() => {
                    match joined {
                        Some(Ok((index, result))) => {
                            tracing::debug!(
                                tick = ctx.tick,
                                tool = %result.name,
                                is_error = result.is_error,
                                "tool settled"
                            );
                            completed.insert(index);
                            events.send(StreamEvent::ToolResult { result: result.clone() }).await;
                            results[index] = Some(result);
                        }
                        Some(Err(err)) => {
                            tracing::warn!(error = %err, "tool task failed to join");
                        }
                        None => break,
                    }
                }
            }
        }

        let mut settled = Vec::with_capacity(results.len());
        for (slot, call) in results.into_iter().zip(batch.calls) {
            match slot {
                Some(result) => settled.push(result),
                None => {
                    let result = ToolOutput::failure(
                        "panic",
                        "Tool execution panicked",
                        Some("The tool task panicked during execution".to_string()),
                    )
                    .into_result(call);
                    events
                        .send(StreamEvent::ToolResult {
                            result: result.clone(),
                        })
                        .await;
                    settled.push(result);
                }
            }
        }
        settled
    }
}

/// Everything one spawned call needs.
struct Job {
    executor: ToolExecutor,
    tool: Tool,
    call: ToolCall,
    gate: Option<Gate>,
    native: Option<ToolResult>,
    ctx: ToolContext,
}

impl Job {
    async fn run(self) -> ToolResult {
        let Job {
            executor,
            tool,
            call,
            gate,
            native,
            ctx,
        } = self;
        let inner = &executor.inner;

        if let Some(gate) = gate {
            let approved = gate.wait(inner.settings.confirmation_grace).await;
            if !approved {
                tracing::warn!(tool = %call.name, id = %call.id, "tool call denied");
                return ToolOutput::failure("denied", "Tool call was not approved", None)
                    .into_result(&call);
            }
        }

        let envelope = Envelope::new(Operation::ToolRun, ctx.execution.clone(), ctx.tick);
        let (executor_ref, tool_ref, ctx_ref) = (&executor, &tool, &ctx);
        let terminal: &Terminal<'_, ToolCall, ToolResult, EngineError> = &move |call: ToolCall| {
            let native = native.clone();
            Box::pin(async move { Ok(executor_ref.dispatch(tool_ref, call, native, ctx_ref).await) })
        };

        match inner.interceptors.run(call.clone(), &envelope, terminal).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(tool = %call.name, error = %err, "tool.run interceptor failed");
                ToolOutput::failure("interceptor_error", err.to_string(), None).into_result(&call)
            }
        }
    }
}

impl ToolExecutor {
    async fn dispatch(
        &self,
        tool: &Tool,
        call: ToolCall,
        native: Option<ToolResult>,
        ctx: &ToolContext,
    ) -> ToolResult {
        let inner = &self.inner;
        let output = match &tool.definition.variant {
            ToolVariant::Provider => {
                return match native {
                    Some(result) => ToolResult {
                        tool_use_id: call.id,
                        name: call.name,
                        ..result
                    },
                    None => ToolOutput::failure(
                        "missing_provider_result",
                        format!("Provider returned no inline result for {}", call.name),
                        None,
                    )
                    .into_result(&call),
                };
            }
            ToolVariant::Client => {
                let request = ClientToolRequest {
                    execution_id: ctx.execution.execution_id,
                    tick: ctx.tick,
                    call: call.clone(),
                };
                inner
                    .bridge
                    .dispatch(request, inner.settings.client_timeout)
                    .await
            }
            ToolVariant::Server => {
                let timeout = tool.definition.timeout.or(inner.settings.tool_timeout);
                match &tool.handler {
                    Some(handler) => with_timeout(timeout, &call, handler(&call.input, ctx)).await,
                    None => ToolOutput::failure(
                        "missing_handler",
                        format!("Tool {} has no handler", call.name),
                        None,
                    ),
                }
            }
            ToolVariant::Routed { endpoint } => {
                let timeout = tool.definition.timeout.or(inner.settings.tool_timeout);
                match inner.registry.router(endpoint) {
                    Some(router) => {
                        with_timeout(timeout, &call, router.route(endpoint, &call, ctx)).await
                    }
                    None => ToolOutput::failure_with_details(
                        "unknown_endpoint",
                        format!("No router registered for endpoint '{endpoint}'"),
                        format!("Tool {} is routed to an endpoint this engine cannot reach", call.name),
                    ),
                }
            }
        };
        output.into_result(&call)
    }
}

async fn with_timeout<F>(timeout: Option<Duration>, call: &ToolCall, fut: F) -> ToolOutput
where
    F: Future<Output = ToolOutput>,
{
    let Some(timeout) = timeout else {
        return fut.await;
    };
    match tokio::time::timeout(timeout, fut).await {
        Ok(output) => output,
        Err(_) => {
            tracing::warn!(tool = %call.name, id = %call.id, ?timeout, "tool timed out");
            ToolOutput::failure(
                "timeout",
                format!("Tool execution timed out after {}", describe(timeout)),
                Some("Consider breaking up large tasks or increasing the timeout".to_string()),
            )
        }
    }
}

fn describe(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{} seconds", duration.as_secs())
    } else {
        format!("{} ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::com::Com;
    use crate::context::ExecutionContext;
    use crate::tools::ToolRouter;

    fn ctx() -> ToolContext {
        ToolContext {
            com: Com::new(Vec::new()),
            execution: ExecutionContext::new(),
            tick: 1,
            cancel: CancellationToken::new(),
        }
    }

    fn sleeper(name: &str) -> Tool {
        Tool::server(name, "Sleeps", json!({}), |input, _ctx| async move {
            let ms = input["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            ToolOutput::success(json!(ms))
        })
    }

    fn executor(registry: ToolRegistry, settings: ExecutorSettings) -> ToolExecutor {
        ToolExecutor::new(
            registry,
            ClientToolBridge::new(),
            ConfirmationBroker::new(),
            settings,
            Chain::default(),
        )
    }

    fn batch(calls: &[ToolCall]) -> ToolBatch<'_> {
        ToolBatch {
            calls,
            tick_tools: &[],
            native_results: &[],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_keep_call_order() {
        let exec = executor(ToolRegistry::new().with_tool(sleeper("sleep")), ExecutorSettings::default());
        let calls = vec![
            ToolCall::new("slow", "sleep", json!({"ms": 300})),
            ToolCall::new("fast", "sleep", json!({"ms": 10})),
        ];
        let results = exec.execute(batch(&calls), &ctx(), &EventSink::disabled()).await;
        let ids: Vec<&str> = results.iter().map(|r| r.tool_use_id.as_str()).collect();
        assert_eq!(ids, vec!["slow", "fast"]);
        assert!(results.iter().all(|r| !r.is_error));
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_run_concurrently() {
        let exec = executor(ToolRegistry::new().with_tool(sleeper("sleep")), ExecutorSettings::default());
        let calls: Vec<ToolCall> = (0..4)
            .map(|i| ToolCall::new(format!("c{i}"), "sleep", json!({"ms": 1000})))
            .collect();
        let started = tokio::time::Instant::now();
        exec.execute(batch(&calls), &ctx(), &EventSink::disabled()).await;
        assert!(started.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_flags_only_slow_calls() {
        let settings = ExecutorSettings {
            tool_timeout: Some(Duration::from_millis(100)),
            ..ExecutorSettings::default()
        };
        let exec = executor(ToolRegistry::new().with_tool(sleeper("sleep")), settings);
        let calls = vec![
            ToolCall::new("a", "sleep", json!({"ms": 10})),
            ToolCall::new("b", "sleep", json!({"ms": 5000})),
            ToolCall::new("c", "sleep", json!({"ms": 20})),
        ];
        let results = exec.execute(batch(&calls), &ctx(), &EventSink::disabled()).await;
        let flags: Vec<bool> = results.iter().map(|r| r.is_error).collect();
        assert_eq!(flags, vec![false, true, false]);
        assert!(results[1].content[0].as_text().unwrap().contains("timed out after 100 ms"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_result() {
        let exec = executor(ToolRegistry::new(), ExecutorSettings::default());
        let calls = vec![ToolCall::new("x", "missing", json!({}))];
        let results = exec.execute(batch(&calls), &ctx(), &EventSink::disabled()).await;
        assert!(results[0].is_error);
        assert!(results[0].content[0].as_text().unwrap().contains("unknown_tool"));
    }

    #[tokio::test]
    async fn test_tick_tools_shadow_registry() {
        let registry = ToolRegistry::new().with_tool(Tool::server(
            "pick",
            "Registry version",
            json!({}),
            |_input, _ctx| async { ToolOutput::success(json!("registry")) },
        ));
        let exec = executor(registry, ExecutorSettings::default());
        let tick_tools = vec![Tool::server("Pick", "Tick version", json!({}), |_input, _ctx| async {
            ToolOutput::success(json!("tick"))
        })];
        let calls = vec![ToolCall::new("p", "pick", json!({}))];
        let results = exec
            .execute(
                ToolBatch {
                    calls: &calls,
                    tick_tools: &tick_tools,
                    native_results: &[],
                },
                &ctx(),
                &EventSink::disabled(),
            )
            .await;
        assert_eq!(results[0].content[0].as_text(), Some(r#"{"ok":true,"data":"tick"}"#));
    }

    #[tokio::test]
    async fn test_provider_results_are_normalized() {
        let registry = ToolRegistry::new().with_tool(Tool::provider("web_search", "Search", json!({})));
        let exec = executor(registry, ExecutorSettings::default());
        let calls = vec![
            ToolCall::new("w1", "web_search", json!({"q": "rust"})),
            ToolCall::new("w2", "web_search", json!({"q": "tokio"})),
        ];
        let native = vec![ToolResult::text("w1", "", "3 hits", false)];
        let results = exec
            .execute(
                ToolBatch {
                    calls: &calls,
                    tick_tools: &[],
                    native_results: &native,
                },
                &ctx(),
                &EventSink::disabled(),
            )
            .await;
        assert_eq!(results[0].name, "web_search");
        assert_eq!(results[0].content[0].as_text(), Some("3 hits"));
        assert!(results[1].is_error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_fills_canceled_results() {
        let exec = executor(ToolRegistry::new().with_tool(sleeper("sleep")), ExecutorSettings::default());
        let calls = vec![
            ToolCall::new("quick", "sleep", json!({"ms": 1})),
            ToolCall::new("stuck", "sleep", json!({"ms": 60_000})),
        ];
        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let results = exec.execute(batch(&calls), &ctx, &EventSink::disabled()).await;
        assert!(!results[0].is_error);
        assert!(results[1].is_error);
        assert!(results[1].content[0].as_text().unwrap().contains("canceled"));
    }

    #[tokio::test]
    async fn test_rejected_confirmation_is_denied() {
        let broker = ConfirmationBroker::new();
        let registry = ToolRegistry::new().with_tool(sleeper("sleep").with_confirmation());
        let exec = ToolExecutor::new(
            registry,
            ClientToolBridge::new(),
            broker.clone(),
            ExecutorSettings::default(),
            Chain::default(),
        );
        let ctx = ctx();
        let execution_id = ctx.execution.execution_id;
        let (sink, mut rx) = EventSink::channel(16);
        let watcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let StreamEvent::ToolConfirmationRequired { call } = event {
                    broker.confirm(execution_id, &call.id, false);
                }
            }
        });
        let calls = vec![ToolCall::new("g", "sleep", json!({"ms": 1}))];
        let results = exec.execute(batch(&calls), &ctx, &sink).await;
        drop(sink);
        watcher.await.unwrap();
        assert!(results[0].is_error);
        assert!(results[0].content[0].as_text().unwrap().contains("denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_withdraws_pending_gates_and_client_calls() {
        let broker = ConfirmationBroker::new();
        let bridge = ClientToolBridge::new();
        let registry = ToolRegistry::new()
            .with_tool(sleeper("sleep").with_confirmation())
            .with_tool(Tool::client("pick_color", "Asks the user", json!({})));
        let exec = ToolExecutor::new(
            registry,
            bridge.clone(),
            broker.clone(),
            ExecutorSettings::default(),
            Chain::default(),
        );
        let calls = vec![
            ToolCall::new("gated", "sleep", json!({"ms": 1})),
            ToolCall::new("asked", "pick_color", json!({})),
        ];
        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let results = exec.execute(batch(&calls), &ctx, &EventSink::disabled()).await;
        assert!(results.iter().all(|r| r.is_error));
        assert!(broker.pending().is_empty());
        assert!(bridge.pending().is_empty());
        assert!(!broker.confirm(ctx.execution.execution_id, "gated", true));
    }

    struct RecordingRouter {
        seen: parking_lot::Mutex<Vec<(String, String, serde_json::Value)>>,
        delay: Duration,
    }

    impl RecordingRouter {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                seen: parking_lot::Mutex::new(Vec::new()),
                delay,
            })
        }
    }

    #[async_trait::async_trait]
    impl ToolRouter for RecordingRouter {
        async fn route(&self, endpoint: &str, call: &ToolCall, _ctx: &ToolContext) -> ToolOutput {
            self.seen
                .lock()
                .push((endpoint.to_string(), call.name.clone(), call.input.clone()));
            tokio::time::sleep(self.delay).await;
            ToolOutput::success(json!({"forecast": "rain"}))
        }
    }

    #[tokio::test]
    async fn test_routed_call_reaches_its_endpoint() {
        let router = RecordingRouter::new(Duration::ZERO);
        let mut registry = ToolRegistry::new()
            .with_tool(Tool::routed("weather", "Forecast", json!({}), "mcp://weather"));
        registry.register_router("mcp://weather", Arc::clone(&router) as Arc<dyn ToolRouter>);
        let exec = executor(registry, ExecutorSettings::default());

        let calls = vec![ToolCall::new("r1", "weather", json!({"city": "Oslo"}))];
        let results = exec.execute(batch(&calls), &ctx(), &EventSink::disabled()).await;

        assert!(!results[0].is_error);
        assert_eq!(results[0].tool_use_id, "r1");
        assert_eq!(
            results[0].content[0].as_text(),
            Some(r#"{"ok":true,"data":{"forecast":"rain"}}"#)
        );
        assert_eq!(
            *router.seen.lock(),
            vec![(
                "mcp://weather".to_string(),
                "weather".to_string(),
                json!({"city": "Oslo"})
            )]
        );
    }

    #[tokio::test]
    async fn test_routed_call_without_router_is_error_result() {
        let registry = ToolRegistry::new()
            .with_tool(Tool::routed("weather", "Forecast", json!({}), "mcp://nowhere"));
        let exec = executor(registry, ExecutorSettings::default());
        let calls = vec![ToolCall::new("r2", "weather", json!({}))];
        let results = exec.execute(batch(&calls), &ctx(), &EventSink::disabled()).await;
        assert!(results[0].is_error);
        let text = results[0].content[0].as_text().unwrap();
        assert!(text.contains("unknown_endpoint"));
        assert!(text.contains("mcp://nowhere"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_router_times_out() {
        let router = RecordingRouter::new(Duration::from_secs(30));
        let mut registry = ToolRegistry::new()
            .with_tool(Tool::routed("weather", "Forecast", json!({}), "mcp://weather"));
        registry.register_router("mcp://weather", router);
        let settings = ExecutorSettings {
            tool_timeout: Some(Duration::from_millis(100)),
            ..ExecutorSettings::default()
        };
        let exec = executor(registry, settings);
        let calls = vec![ToolCall::new("r3", "weather", json!({}))];
        let results = exec.execute(batch(&calls), &ctx(), &EventSink::disabled()).await;
        assert!(results[0].is_error);
        assert!(results[0].content[0].as_text().unwrap().contains("timed out after 100 ms"));
    }
}
