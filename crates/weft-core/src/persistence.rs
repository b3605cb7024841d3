//! Persistence hooks.
//!
//! The engine knows nothing about storage. `PersistenceHooks` attaches to
//! every interceptor chain and writes execution, timeline and metrics
//! records through a `PersistenceStore`. Store failures are logged and never
//! change the engine's outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::{self, BoxFuture};
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;
use weft_types::{
    ExecutionStatus, StopReason, StreamEvent, TimelineEntry, ToolCall, ToolResult, Usage,
};

use crate::engine::{ExecutionInput, ExecutionOutput};
use crate::error::{EngineError, ExecutionError};
use crate::intercept::{Envelope, Interceptor, Interceptors, Next, Operation};
use crate::model::{ModelInput, ModelOutput};
use crate::stream::ExecutionStream;

/// One execution as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub operation: Operation,
    pub thread_id: Option<String>,
    pub user_id: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub ticks: u32,
    pub stop_reason: Option<StopReason>,
    pub error: Option<Value>,
}

impl ExecutionRecord {
    fn started(envelope: &Envelope) -> Self {
        Self {
            id: envelope.context.execution_id,
            operation: envelope.operation,
            thread_id: envelope.context.thread_id.clone(),
            user_id: envelope.context.user_id.clone(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            ticks: 0,
            stop_reason: None,
            error: None,
        }
    }
}

/// Terminal state written when an execution settles.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionUpdate {
    pub status: ExecutionStatus,
    pub ticks: u32,
    pub stop_reason: Option<StopReason>,
    pub error: Option<Value>,
    pub finished_at: DateTime<Utc>,
}

/// Timing and usage of one model call or tool run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsRecord {
    pub execution_id: Uuid,
    pub operation: Operation,
    pub tick: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub usage: Usage,
    pub duration_ms: u64,
    pub is_error: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Storage for execution records. Implemented by collaborators.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Records a newly started execution.
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<()>;

    /// Marks an execution finished.
    async fn update_execution(&self, id: Uuid, update: &ExecutionUpdate) -> Result<()>;

    /// Appends timeline entries in order.
    async fn append_entries(&self, id: Uuid, entries: &[TimelineEntry]) -> Result<()>;

    async fn record_metrics(&self, metrics: &MetricsRecord) -> Result<()>;
}

/// Process-local store, mostly for tests and the CLI.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    executions: Mutex<HashMap<Uuid, ExecutionRecord>>,
    entries: Mutex<HashMap<Uuid, Vec<TimelineEntry>>>,
    metrics: Mutex<Vec<MetricsRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution(&self, id: Uuid) -> Option<ExecutionRecord> {
        self.executions.lock().get(&id).cloned()
    }

    pub fn executions(&self) -> Vec<ExecutionRecord> {
        let mut records: Vec<ExecutionRecord> = self.executions.lock().values().cloned().collect();
        records.sort_by_key(|r| r.started_at);
        records
    }

    pub fn entries(&self, id: Uuid) -> Vec<TimelineEntry> {
        self.entries.lock().get(&id).cloned().unwrap_or_default()
    }

    pub fn metrics(&self) -> Vec<MetricsRecord> {
        self.metrics.lock().clone()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let mut executions = self.executions.lock();
        if executions.contains_key(&record.id) {
            anyhow::bail!("execution {} already recorded", record.id);
        }
        executions.insert(record.id, record.clone());
        Ok(())
    }

    async fn update_execution(&self, id: Uuid, update: &ExecutionUpdate) -> Result<()> {
        let mut executions = self.executions.lock();
        let Some(record) = executions.get_mut(&id) else {
            anyhow::bail!("execution {id} not found");
        };
        record.status = update.status;
        record.ticks = update.ticks;
        record.stop_reason = update.stop_reason;
        record.error.clone_from(&update.error);
        record.finished_at = Some(update.finished_at);
        Ok(())
    }

    async fn append_entries(&self, id: Uuid, entries: &[TimelineEntry]) -> Result<()> {
        self.entries
            .lock()
            .entry(id)
            .or_default()
            .extend_from_slice(entries);
        Ok(())
    }

    async fn record_metrics(&self, metrics: &MetricsRecord) -> Result<()> {
        self.metrics.lock().push(metrics.clone());
        Ok(())
    }
}

/// Interceptors that mirror executions into a [`PersistenceStore`].
#[derive(Clone)]
pub struct PersistenceHooks {
    store: Arc<dyn PersistenceStore>,
}

impl PersistenceHooks {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self { store }
    }

    /// Registers one interceptor on each of the five chains.
    pub fn install(&self, interceptors: &mut Interceptors) {
        interceptors.execute.push(Arc::new(self.clone()));
        interceptors.stream.push(Arc::new(self.clone()));
        interceptors.model_generate.push(Arc::new(self.clone()));
        interceptors.model_stream.push(Arc::new(self.clone()));
        interceptors.tool_run.push(Arc::new(self.clone()));
    }
}

impl std::fmt::Debug for PersistenceHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceHooks").finish_non_exhaustive()
    }
}

fn log_failure(result: Result<()>, action: &str, id: Uuid) {
    if let Err(err) = result {
        tracing::warn!(execution = %id, action, error = %format!("{err:#}"), "persistence failed");
    }
}

async fn begin(store: &dyn PersistenceStore, envelope: &Envelope) {
    let record = ExecutionRecord::started(envelope);
    log_failure(store.create_execution(&record).await, "create_execution", record.id);
}

async fn settle(
    store: &dyn PersistenceStore,
    id: Uuid,
    outcome: Result<&ExecutionOutput, &ExecutionError>,
) {
    let (entries, update) = match outcome {
        Ok(output) => (
            output.timeline.clone(),
            ExecutionUpdate {
                status: ExecutionStatus::Completed,
                ticks: output.ticks,
                stop_reason: Some(output.stop_reason),
                error: None,
                finished_at: Utc::now(),
            },
        ),
        Err(err) => (
            err.timeline.iter().map(|entry| (**entry).clone()).collect(),
            ExecutionUpdate {
                status: ExecutionStatus::Failed,
                ticks: err.ticks,
                stop_reason: None,
                error: Some(err.detail()),
                finished_at: Utc::now(),
            },
        ),
    };
    if !entries.is_empty() {
        log_failure(store.append_entries(id, &entries).await, "append_entries", id);
    }
    log_failure(
        store.update_execution(id, &update).await,
        "update_execution",
        id,
    );
}

async fn record(
    store: &dyn PersistenceStore,
    envelope: &Envelope,
    started: Instant,
    tool: Option<String>,
    usage: Usage,
    is_error: bool,
) {
    let metrics = MetricsRecord {
        execution_id: envelope.context.execution_id,
        operation: envelope.operation,
        tick: envelope.tick,
        tool,
        usage,
        duration_ms: started.elapsed().as_millis() as u64,
        is_error,
        recorded_at: Utc::now(),
    };
    log_failure(
        store.record_metrics(&metrics).await,
        "record_metrics",
        metrics.execution_id,
    );
}

impl Interceptor<ExecutionInput, ExecutionOutput, ExecutionError> for PersistenceHooks {
    fn intercept<'a>(
        &'a self,
        args: ExecutionInput,
        envelope: &'a Envelope,
        next: Next<'a, ExecutionInput, ExecutionOutput, ExecutionError>,
    ) -> BoxFuture<'a, Result<ExecutionOutput, ExecutionError>> {
        Box::pin(async move {
            begin(self.store.as_ref(), envelope).await;
            let outcome = next.run(args).await;
            settle(
                self.store.as_ref(),
                envelope.context.execution_id,
                outcome.as_ref(),
            )
            .await;
            outcome
        })
    }
}

impl Interceptor<ExecutionInput, ExecutionStream, ExecutionError> for PersistenceHooks {
    fn intercept<'a>(
        &'a self,
        args: ExecutionInput,
        envelope: &'a Envelope,
        next: Next<'a, ExecutionInput, ExecutionStream, ExecutionError>,
    ) -> BoxFuture<'a, Result<ExecutionStream, ExecutionError>> {
        Box::pin(async move {
            let id = envelope.context.execution_id;
            begin(self.store.as_ref(), envelope).await;
            let execution = match next.run(args).await {
                Ok(execution) => execution,
                Err(err) => {
                    settle(self.store.as_ref(), id, Err(&err)).await;
                    return Err(err);
                }
            };

            // The outcome is set before the event sequence ends, so the
            // trailing step sees the same result buffered mode would.
            let store = Arc::clone(&self.store);
            let outcome = execution.outcome();
            Ok(execution.map_events(move |events| {
                let finish = stream::once(async move {
                    match outcome.get() {
                        Some(result) => settle(store.as_ref(), id, result.as_ref()).await,
                        None => tracing::warn!(execution = %id, "stream ended without an outcome"),
                    }
                })
                .filter_map(|()| future::ready(None::<StreamEvent>));
                events.chain(finish).boxed()
            }))
        })
    }
}

impl Interceptor<ModelInput, ModelOutput> for PersistenceHooks {
    fn intercept<'a>(
        &'a self,
        args: ModelInput,
        envelope: &'a Envelope,
        next: Next<'a, ModelInput, ModelOutput>,
    ) -> BoxFuture<'a, Result<ModelOutput, EngineError>> {
        Box::pin(async move {
            let started = Instant::now();
            let outcome = next.run(args).await;
            let (usage, is_error) = match &outcome {
                Ok(output) => (output.usage, false),
                Err(_) => (Usage::default(), true),
            };
            record(self.store.as_ref(), envelope, started, None, usage, is_error).await;
            outcome
        })
    }
}

impl Interceptor<ToolCall, ToolResult> for PersistenceHooks {
    fn intercept<'a>(
        &'a self,
        args: ToolCall,
        envelope: &'a Envelope,
        next: Next<'a, ToolCall, ToolResult>,
    ) -> BoxFuture<'a, Result<ToolResult, EngineError>> {
        Box::pin(async move {
            let started = Instant::now();
            let name = args.name.clone();
            let outcome = next.run(args).await;
            let is_error = outcome.as_ref().map_or(true, |result| result.is_error);
            record(
                self.store.as_ref(),
                envelope,
                started,
                Some(name),
                Usage::default(),
                is_error,
            )
            .await;
            outcome
        })
    }
}
