//! Interceptor chains around engine, model and tool boundaries.
//!
//! An interceptor receives `(args, envelope, next)`. It may call `next` with
//! the same or transformed args, inspect or replace the outcome, or
//! short-circuit without calling `next` at all. An interceptor that sees an
//! error must return it (or a substitute value), never drop it silently.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::Serialize;
use weft_types::{ToolCall, ToolResult};

use crate::context::ExecutionContext;
use crate::engine::{ExecutionInput, ExecutionOutput};
use crate::error::{EngineError, ExecutionError};
use crate::model::{ModelInput, ModelOutput};
use crate::stream::ExecutionStream;

/// Which boundary an interceptor is wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Operation {
    #[serde(rename = "engine.execute")]
    EngineExecute,
    #[serde(rename = "engine.stream")]
    EngineStream,
    #[serde(rename = "model.generate")]
    ModelGenerate,
    #[serde(rename = "model.stream")]
    ModelStream,
    #[serde(rename = "tool.run")]
    ToolRun,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::EngineExecute => "engine.execute",
            Operation::EngineStream => "engine.stream",
            Operation::ModelGenerate => "model.generate",
            Operation::ModelStream => "model.stream",
            Operation::ToolRun => "tool.run",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata handed to every interceptor alongside the call arguments.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub operation: Operation,
    pub context: ExecutionContext,
    /// Zero outside a tick (engine-level chains).
    pub tick: u32,
}

impl Envelope {
    pub fn new(operation: Operation, context: ExecutionContext, tick: u32) -> Self {
        Self {
            operation,
            context,
            tick,
        }
    }
}

pub trait Interceptor<A, R, E = EngineError>: Send + Sync {
    fn intercept<'a>(
        &'a self,
        args: A,
        envelope: &'a Envelope,
        next: Next<'a, A, R, E>,
    ) -> BoxFuture<'a, Result<R, E>>;
}

/// The innermost operation a chain wraps.
pub type Terminal<'a, A, R, E> = dyn Fn(A) -> BoxFuture<'a, Result<R, E>> + Send + Sync + 'a;

/// The rest of the chain, handed to each interceptor.
pub struct Next<'a, A, R, E = EngineError> {
    rest: &'a [Arc<dyn Interceptor<A, R, E>>],
    envelope: &'a Envelope,
    terminal: &'a Terminal<'a, A, R, E>,
}

impl<'a, A, R, E> Next<'a, A, R, E>
where
    A: Send + 'a,
    R: Send + 'a,
    E: Send + 'a,
{
    pub fn run(self, args: A) -> BoxFuture<'a, Result<R, E>> {
        match self.rest.split_first() {
            Some((head, rest)) => head.intercept(
                args,
                self.envelope,
                Next {
                    rest,
                    envelope: self.envelope,
                    terminal: self.terminal,
                },
            ),
            None => (self.terminal)(args),
        }
    }
}

/// Ordered interceptors for one boundary. The first registered runs outermost.
pub struct Chain<A, R, E = EngineError> {
    interceptors: Vec<Arc<dyn Interceptor<A, R, E>>>,
}

impl<A, R, E> Chain<A, R, E>
where
    A: Send,
    R: Send,
    E: Send,
{
    pub fn new() -> Self {
        Self {
            interceptors: Vec::new(),
        }
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor<A, R, E>>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub async fn run<'a>(
        &'a self,
        args: A,
        envelope: &'a Envelope,
        terminal: &'a Terminal<'a, A, R, E>,
    ) -> Result<R, E>
    where
        A: 'a,
        R: 'a,
        E: 'a,
    {
        Next {
            rest: &self.interceptors,
            envelope,
            terminal,
        }
        .run(args)
        .await
    }
}

impl<A, R, E> Clone for Chain<A, R, E> {
    fn clone(&self) -> Self {
        Self {
            interceptors: self.interceptors.clone(),
        }
    }
}

impl<A, R, E> Default for Chain<A, R, E> {
    fn default() -> Self {
        Self {
            interceptors: Vec::new(),
        }
    }
}

impl<A, R, E> fmt::Debug for Chain<A, R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

/// Every interceptor chain an engine runs.
#[derive(Clone, Default, Debug)]
pub struct Interceptors {
    pub execute: Chain<ExecutionInput, ExecutionOutput, ExecutionError>,
    pub stream: Chain<ExecutionInput, ExecutionStream, ExecutionError>,
    pub model_generate: Chain<ModelInput, ModelOutput>,
    pub model_stream: Chain<ModelInput, ModelOutput>,
    pub tool_run: Chain<ToolCall, ToolResult>,
}
