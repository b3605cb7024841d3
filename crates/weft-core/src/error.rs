//! Error taxonomy.
//!
//! Tool failures are not errors here: they travel as `ToolOutput::Failure`
//! and end up as `is_error` tool results the model can react to.

use std::sync::Arc;

use uuid::Uuid;
use weft_types::{ErrorKind, TimelineEntry};

/// Misuse of the hook/signal surface. Programming error, fatal immediately.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("signal {id} read after its owning component unmounted")]
    Disposed { id: u64 },

    #[error("hook order changed in {component}: slot {slot} expected {expected}")]
    HookOrder {
        component: String,
        slot: usize,
        expected: &'static str,
    },

    #[error("shared state '{key}' already holds a value of a different type")]
    TypeMismatch { key: String },
}

/// Errors that terminate an execution.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Malformed input to model-call preparation. Not retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Provider returned an unusable response.
    #[error("adapter error: {0}")]
    Adapter(String),

    /// Component tree failed to compile.
    #[error("compile error: {0}")]
    Compile(String),

    /// Execution aborted by its cancellation token.
    #[error("execution cancelled")]
    Cancelled,

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::Adapter(_) => ErrorKind::Adapter,
            EngineError::Compile(_) => ErrorKind::Compile,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Context(_) => ErrorKind::Context,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    /// Converts a component-author error, keeping `ContextError`s distinguishable.
    pub fn from_component(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<ContextError>() {
            Some(ctx) => EngineError::Context(ctx.clone()),
            None => EngineError::Compile(format!("{err:#}")),
        }
    }
}

/// Terminal failure of one execution.
///
/// Carries the timeline as it stood when the execution stopped, so no
/// already-appended tick is lost.
#[derive(Debug, Clone, thiserror::Error)]
#[error("execution {pid} failed after {ticks} tick(s): {source}")]
pub struct ExecutionError {
    pub pid: Uuid,
    pub ticks: u32,
    pub source: EngineError,
    pub timeline: Vec<Arc<TimelineEntry>>,
}

impl ExecutionError {
    pub fn new(pid: Uuid, source: EngineError) -> Self {
        Self {
            pid,
            ticks: 0,
            source,
            timeline: Vec::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.source.is_cancelled()
    }

    /// Serializable detail for persistence records.
    pub fn detail(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.source.kind(),
            "message": self.source.to_string(),
            "ticks": self.ticks,
        })
    }
}
