//! Tools: definitions, handlers, the registry and the concurrent executor.

mod bridge;
mod confirm;
mod executor;
mod output;
mod pending;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use weft_types::{ToolCall, ToolSpec, ToolVariant};

pub use bridge::{ClientToolBridge, ClientToolRequest};
pub use confirm::ConfirmationBroker;
pub use executor::{ExecutorSettings, ToolBatch, ToolExecutor};
pub use output::{ToolError, ToolOutput};

use crate::com::Com;
use crate::context::ExecutionContext;

/// Model-facing tool description plus dispatch policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
    pub variant: ToolVariant,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub requires_confirmation: bool,
    /// Overrides the engine-wide tool timeout for this tool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters_schema,
            variant: ToolVariant::Server,
            requires_confirmation: false,
            timeout: None,
        }
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters_schema: self.parameters_schema.clone(),
        }
    }
}

/// Context handed to tool handlers.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub com: Com,
    pub execution: ExecutionContext,
    pub tick: u32,
    /// Fires when the execution is cancelled.
    pub cancel: CancellationToken,
}

pub type ToolFuture = Pin<Box<dyn Future<Output = ToolOutput> + Send>>;
pub type ToolHandler = Arc<dyn Fn(&Value, &ToolContext) -> ToolFuture + Send + Sync>;

/// A definition together with its in-process handler, if it has one.
#[derive(Clone)]
pub struct Tool {
    pub definition: ToolDefinition,
    pub handler: Option<ToolHandler>,
}

impl Tool {
    /// In-process tool.
    pub fn server<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolOutput> + Send + 'static,
    {
        let handler: ToolHandler =
            Arc::new(move |input, ctx| Box::pin(handler(input.clone(), ctx.clone())));
        Self {
            definition: ToolDefinition::new(name, description, parameters_schema),
            handler: Some(handler),
        }
    }

    /// Resolved by an external peer through the [`ClientToolBridge`].
    pub fn client(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters_schema: Value,
    ) -> Self {
        Self::without_handler(name, description, parameters_schema, ToolVariant::Client)
    }

    /// Executed by the provider; its result arrives inline with the model output.
    pub fn provider(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters_schema: Value,
    ) -> Self {
        Self::without_handler(name, description, parameters_schema, ToolVariant::Provider)
    }

    /// Forwarded to the [`ToolRouter`] registered for `endpoint`.
    pub fn routed(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters_schema: Value,
        endpoint: impl Into<String>,
    ) -> Self {
        Self::without_handler(
            name,
            description,
            parameters_schema,
            ToolVariant::Routed {
                endpoint: endpoint.into(),
            },
        )
    }

    fn without_handler(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters_schema: Value,
        variant: ToolVariant,
    ) -> Self {
        let mut definition = ToolDefinition::new(name, description, parameters_schema);
        definition.variant = variant;
        Self {
            definition,
            handler: None,
        }
    }

    #[must_use]
    pub fn with_confirmation(mut self) -> Self {
        self.definition.requires_confirmation = true;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.definition.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("definition", &self.definition)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl PartialEq for Tool {
    fn eq(&self, other: &Self) -> bool {
        self.definition == other.definition
    }
}

/// Forwards routed tool calls to an external tool-serving endpoint.
#[async_trait]
pub trait ToolRouter: Send + Sync {
    async fn route(&self, endpoint: &str, call: &ToolCall, ctx: &ToolContext) -> ToolOutput;
}

/// Tools available to every tick, plus routers for routed tools.
///
/// Names are matched case-insensitively. Tools rendered by the component
/// tree for a tick take precedence over registry entries of the same name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Tool>,
    index: HashMap<String, usize>,
    routers: HashMap<String, Arc<dyn ToolRouter>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .field("routers", &self.routers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.register(tool);
        self
    }

    /// Adds or replaces a tool.
    pub fn register(&mut self, tool: Tool) {
        let key = tool.name().to_ascii_lowercase();
        match self.index.get(&key) {
            Some(&pos) => self.tools[pos] = tool,
            None => {
                self.index.insert(key, self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    pub fn register_router(&mut self, endpoint: impl Into<String>, router: Arc<dyn ToolRouter>) {
        self.routers.insert(endpoint.into(), router);
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.index
            .get(&name.to_ascii_lowercase())
            .map(|&pos| &self.tools[pos])
    }

    pub fn router(&self, endpoint: &str) -> Option<Arc<dyn ToolRouter>> {
        self.routers.get(endpoint).cloned()
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition.clone()).collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

fn unknown_tool_output(name: &str, available: &[String]) -> ToolOutput {
    let mut available = available.to_vec();
    available.sort();
    available.dedup();
    ToolOutput::failure_with_details(
        "unknown_tool",
        format!("Unknown tool: {name}"),
        format!("Available tools: {}", available.join(", ")),
    )
}
