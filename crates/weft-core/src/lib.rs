//! Tick-based execution engine for component-driven LLM agents.
//!
//! An agent is a component tree. Each tick the compiler renders the tree
//! against the execution's shared state into model input, the model answers,
//! requested tools run concurrently, and the loop decides whether to go on.

pub mod com;
pub mod compiler;
pub mod component;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod intercept;
pub mod model;
pub mod node;
pub mod persistence;
pub mod render;
pub mod state;
pub mod stream;
pub mod tools;

pub use com::{Com, Timeline};
pub use compiler::{CompiledStructure, Compiler};
pub use component::{Children, Component, RenderContext};
pub use config::Config;
pub use context::ExecutionContext;
pub use engine::{Engine, EngineBuilder, ExecutionHandle, ExecutionInput, ExecutionOutput};
pub use error::{ContextError, EngineError, ExecutionError};
pub use intercept::{Envelope, Interceptor, Interceptors, Next, Operation};
pub use model::{ModelAdapter, ModelInput, ModelOutput, ScriptedModel, ScriptedTurn};
pub use node::{ComponentNode, Primitive};
pub use persistence::{InMemoryStore, PersistenceHooks, PersistenceStore};
pub use render::{MarkdownRenderer, Renderer, SemanticNode, XmlRenderer};
pub use state::{Computed, Signal};
pub use stream::{ExecutionStream, spawn_broadcaster};
pub use tools::{Tool, ToolContext, ToolOutput, ToolRegistry};
