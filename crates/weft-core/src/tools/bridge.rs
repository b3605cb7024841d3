//! Client tools: calls resolved by a peer outside the execution.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;
use weft_types::ToolCall;

use super::ToolOutput;
use super::pending::PendingCalls;

/// A client call waiting for its external result.
#[derive(Debug, Clone)]
pub struct ClientToolRequest {
    pub execution_id: Uuid,
    pub tick: u32,
    pub call: ToolCall,
}

/// Routes client tool calls out and their results back in.
///
/// The peer learns about calls either from `tool_call` stream events or from
/// the request channel returned by [`ClientToolBridge::requests`], and answers
/// with [`ClientToolBridge::resolve`]. One bridge serves every execution of an
/// engine, so results are addressed by execution id and tool-use id together.
#[derive(Clone, Default)]
pub struct ClientToolBridge {
    inner: Arc<BridgeInner>,
}

#[derive(Default)]
struct BridgeInner {
    pending: PendingCalls<ToolOutput>,
    requests: Mutex<Option<mpsc::UnboundedSender<ClientToolRequest>>>,
}

impl ClientToolBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the request channel, replacing any previous one.
    pub fn requests(&self) -> mpsc::UnboundedReceiver<ClientToolRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.requests.lock() = Some(tx);
        rx
    }

    /// Delivers the result for `tool_use_id` in `execution_id`. Returns false
    /// when nothing waits for it.
    pub fn resolve(&self, execution_id: Uuid, tool_use_id: &str, output: ToolOutput) -> bool {
        let delivered = self.inner.pending.answer(execution_id, tool_use_id, output);
        if !delivered {
            tracing::debug!(%execution_id, tool_use_id, "no pending client call");
        }
        delivered
    }

    /// `(execution_id, tool_use_id)` of calls still waiting.
    pub fn pending(&self) -> Vec<(Uuid, String)> {
        self.inner.pending.keys()
    }

    /// Forwards `request` and waits for the peer's answer or the timeout.
    pub(crate) async fn dispatch(&self, request: ClientToolRequest, timeout: Duration) -> ToolOutput {
        let id = request.call.id.clone();
        let (_ticket, rx) = self.inner.pending.register(request.execution_id, &id);

        if let Some(requests) = self.inner.requests.lock().as_ref()
            && requests.send(request).is_err()
        {
            tracing::debug!(tool_use_id = %id, "client request channel closed");
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(output)) => output,
            Ok(Err(_)) => ToolOutput::failure("client_disconnected", "Client dropped the tool call", None),
            Err(_) => {
                tracing::warn!(tool_use_id = %id, secs = timeout.as_secs(), "client tool timed out");
                ToolOutput::failure_with_details(
                    "timeout",
                    format!("Client tool did not respond within {} seconds", timeout.as_secs()),
                    "The external peer never resolved this call",
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn request(execution_id: Uuid, id: &str) -> ClientToolRequest {
        ClientToolRequest {
            execution_id,
            tick: 1,
            call: ToolCall::new(id, "pick_color", json!({})),
        }
    }

    #[tokio::test]
    async fn test_resolve_completes_dispatch() {
        let bridge = ClientToolBridge::new();
        let mut requests = bridge.requests();
        let peer = bridge.clone();
        let answer = tokio::spawn(async move {
            let req = requests.recv().await.unwrap();
            assert!(peer.resolve(req.execution_id, &req.call.id, ToolOutput::success(json!("blue"))));
        });
        let output = bridge.dispatch(request(Uuid::new_v4(), "c1"), Duration::from_secs(5)).await;
        answer.await.unwrap();
        assert_eq!(output, ToolOutput::success(json!("blue")));
        assert!(bridge.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_call_times_out() {
        let bridge = ClientToolBridge::new();
        let execution_id = Uuid::new_v4();
        let output = bridge.dispatch(request(execution_id, "c2"), Duration::from_secs(3)).await;
        assert_eq!(output.error_code(), Some("timeout"));
        assert!(!bridge.resolve(execution_id, "c2", ToolOutput::success(json!(1))));
    }

    #[tokio::test]
    async fn test_same_call_id_resolves_per_execution() {
        let bridge = ClientToolBridge::new();
        let mut requests = bridge.requests();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let a = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.dispatch(request(first, "toolu_1_0"), Duration::from_secs(5)).await }
        });
        let b = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.dispatch(request(second, "toolu_1_0"), Duration::from_secs(5)).await }
        });

        for _ in 0..2 {
            let req = requests.recv().await.unwrap();
            let colour = if req.execution_id == first { "red" } else { "green" };
            assert!(bridge.resolve(req.execution_id, &req.call.id, ToolOutput::success(json!(colour))));
        }
        assert_eq!(a.await.unwrap(), ToolOutput::success(json!("red")));
        assert_eq!(b.await.unwrap(), ToolOutput::success(json!("green")));
        assert!(bridge.pending().is_empty());
    }

    #[tokio::test]
    async fn test_aborted_dispatch_clears_pending() {
        let bridge = ClientToolBridge::new();
        let mut requests = bridge.requests();
        let task = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.dispatch(request(Uuid::new_v4(), "c3"), Duration::from_secs(60)).await }
        });
        requests.recv().await.unwrap();
        assert_eq!(bridge.pending().len(), 1);
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(bridge.pending().is_empty());
    }
}
