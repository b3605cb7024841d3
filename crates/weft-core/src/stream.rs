//! Stream event pipeline.
//!
//! A streaming execution is a lazy pull-based sequence: the engine's driver
//! future lives inside the stream and only advances while the consumer polls.
//! Events go through a bounded channel, so a paused consumer pauses the loop
//! without losing anything already produced.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use weft_types::StreamEvent;

use crate::engine::{ExecutionHandle, ExecutionOutput};
use crate::error::{EngineError, ExecutionError};

/// Default channel capacity for event streams.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 128;

/// Where the engine writes events. Disabled in buffered mode.
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<StreamEvent>>,
}

impl EventSink {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Reliable send: waits for channel capacity. A gone receiver is ignored.
    pub async fn send(&self, event: StreamEvent) {
        if let Some(tx) = &self.tx
            && tx.send(event).await.is_err()
        {
            tracing::trace!("stream consumer dropped, event discarded");
        }
    }
}

/// Yields buffered events first, then drives the engine until it produces more.
struct EventPump {
    rx: mpsc::Receiver<StreamEvent>,
    driver: Option<BoxFuture<'static, ()>>,
}

impl Stream for EventPump {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let this = self.get_mut();
        loop {
            if let Poll::Ready(event) = this.rx.poll_recv(cx) {
                return Poll::Ready(event);
            }
            match this.driver.as_mut() {
                Some(driver) => {
                    if driver.as_mut().poll(cx).is_pending() {
                        return Poll::Pending;
                    }
                    // Done: the driver dropped its sender, drain what is left.
                    this.driver = None;
                }
                None => return this.rx.poll_recv(cx),
            }
        }
    }
}

/// Final result of a streaming execution, filled in before the stream ends.
#[derive(Clone, Default)]
pub struct OutcomeCell {
    inner: Arc<Mutex<Option<Result<ExecutionOutput, ExecutionError>>>>,
}

impl OutcomeCell {
    pub(crate) fn set(&self, outcome: Result<ExecutionOutput, ExecutionError>) {
        *self.inner.lock() = Some(outcome);
    }

    /// `None` until the execution has finished.
    pub fn get(&self) -> Option<Result<ExecutionOutput, ExecutionError>> {
        self.inner.lock().clone()
    }

    fn take(&self) -> Option<Result<ExecutionOutput, ExecutionError>> {
        self.inner.lock().take()
    }
}

impl std::fmt::Debug for OutcomeCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutcomeCell")
            .field("finished", &self.inner.lock().is_some())
            .finish()
    }
}

/// Events of one streaming execution, ending with `ExecutionEnd` or `Error`.
pub struct ExecutionStream {
    events: BoxStream<'static, StreamEvent>,
    handle: ExecutionHandle,
    outcome: OutcomeCell,
}

impl ExecutionStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<StreamEvent>,
        driver: BoxFuture<'static, ()>,
        handle: ExecutionHandle,
        outcome: OutcomeCell,
    ) -> Self {
        let pump = EventPump {
            rx,
            driver: Some(driver),
        };
        Self {
            events: pump.boxed(),
            handle,
            outcome,
        }
    }

    pub fn handle(&self) -> &ExecutionHandle {
        &self.handle
    }

    /// Readable once the event sequence has ended.
    pub fn outcome(&self) -> OutcomeCell {
        self.outcome.clone()
    }

    /// Wraps the event sequence, keeping the handle and outcome.
    #[must_use]
    pub fn map_events(
        self,
        f: impl FnOnce(BoxStream<'static, StreamEvent>) -> BoxStream<'static, StreamEvent>,
    ) -> Self {
        Self {
            events: f(self.events),
            handle: self.handle,
            outcome: self.outcome,
        }
    }

    /// Drains the stream and returns what buffered mode would have returned.
    pub async fn collect_output(mut self) -> Result<ExecutionOutput, ExecutionError> {
        while self.events.next().await.is_some() {}
        self.outcome
            .take()
            .unwrap_or_else(|| Err(ExecutionError::new(self.handle.pid(), EngineError::Cancelled)))
    }
}

impl Stream for ExecutionStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        self.events.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for ExecutionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStream")
            .field("pid", &self.handle.pid())
            .finish_non_exhaustive()
    }
}

/// Spawns a task that distributes one execution's events to several consumers.
///
/// Uses `try_send` so a slow consumer never blocks the others; it misses
/// events while its channel is full. Closed channels are removed. The task
/// ends with the stream and returns the execution outcome.
pub fn spawn_broadcaster(
    mut stream: ExecutionStream,
    mut subscribers: Vec<mpsc::Sender<Arc<StreamEvent>>>,
) -> JoinHandle<Result<ExecutionOutput, ExecutionError>> {
    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            let event = Arc::new(event);
            subscribers.retain(|tx| match tx.try_send(Arc::clone(&event)) {
                Ok(()) | Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Closed(_)) => false,
            });
        }
        stream.collect_output().await
    })
}
