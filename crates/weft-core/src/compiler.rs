//! Compiles a component tree against the COM into model-facing content.
//!
//! Per compile: `on_tick_start` for every mounted instance in tree pre-order,
//! then render (children before parents, mounting new instances first), then
//! unmount of every instance whose path vanished.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::Serialize;
use weft_types::{ContentBlock, Message, Role};

use crate::com::{Com, TickState};
use crate::component::{Children, Instance, RenderContext};
use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::node::{ComponentNode, Primitive};
use crate::render::{Formatter, RendererRef, SemanticNode, lower};
use crate::tools::{Tool, ToolDefinition};

/// A top-level system section.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub content: Vec<ContentBlock>,
}

/// A message rendered by the tree for the current tick only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl CompiledMessage {
    pub fn to_message(&self) -> Message {
        Message::new(self.role, self.content.clone())
    }
}

/// Ordered model-facing content of one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompiledStructure {
    pub sections: Vec<CompiledSection>,
    pub timeline: Vec<Message>,
    pub ephemeral: Vec<CompiledMessage>,
    pub tools: Vec<ToolDefinition>,
}

impl CompiledStructure {
    /// All section content in order, as sent in the system slot.
    pub fn system_blocks(&self) -> Vec<ContentBlock> {
        self.sections
            .iter()
            .flat_map(|section| section.content.iter().cloned())
            .collect()
    }

    pub fn system_text(&self) -> String {
        self.sections
            .iter()
            .flat_map(|section| section.content.iter().filter_map(ContentBlock::as_text))
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Compile output: the structure plus the tools (with handlers) it declared.
#[derive(Debug, Clone)]
pub struct Compilation {
    pub structure: CompiledStructure,
    pub tools: Vec<Tool>,
}

/// Holds component instances across ticks for one execution.
pub struct Compiler {
    renderer: RendererRef,
    auto_timeline: bool,
    instances: HashMap<String, Instance>,
    /// Mounted instance paths in tree pre-order, as of the last compile.
    order: Vec<String>,
}

struct Scope<'a> {
    com: &'a Com,
    execution: &'a ExecutionContext,
    tick: u32,
}

#[derive(Default)]
struct Pass {
    seen: Vec<String>,
    tools: Vec<Tool>,
}

impl Compiler {
    pub fn new(renderer: RendererRef) -> Self {
        Self {
            renderer,
            auto_timeline: true,
            instances: HashMap::new(),
            order: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_auto_timeline(mut self, enabled: bool) -> Self {
        self.auto_timeline = enabled;
        self
    }

    /// Mounted instance paths in pre-order.
    pub fn mounted(&self) -> &[String] {
        &self.order
    }

    pub async fn compile(
        &mut self,
        root: &ComponentNode,
        com: &Com,
        execution: &ExecutionContext,
        tick: &TickState,
    ) -> Result<Compilation, EngineError> {
        self.run_tick_start(com, tick).await?;

        let scope = Scope {
            com,
            execution,
            tick: tick.tick,
        };
        let mut pass = Pass::default();
        let rendered = self
            .render_nodes(std::slice::from_ref(root), "", &scope, &mut pass)
            .await?;

        self.unmount_missing(com, &pass.seen).await;
        self.order = pass.seen;

        let structure = self.assemble(rendered, com, &pass.tools);
        tracing::debug!(
            tick = tick.tick,
            sections = structure.sections.len(),
            timeline = structure.timeline.len(),
            tools = structure.tools.len(),
            "compiled"
        );
        Ok(Compilation {
            structure,
            tools: dedupe_tools(pass.tools),
        })
    }

    /// Unmounts every instance, in pre-order. Called when the execution ends.
    pub async fn unmount_all(&mut self, com: &Com) {
        self.unmount_missing(com, &[]).await;
        self.order.clear();
    }

    async fn run_tick_start(&self, com: &Com, tick: &TickState) -> Result<(), EngineError> {
        for path in &self.order {
            let Some(instance) = self.instances.get(path) else {
                continue;
            };
            let component = Arc::clone(&instance.component);
            let callbacks = instance.tick_callbacks();
            component
                .on_tick_start(com, tick)
                .await
                .map_err(|err| component_error(&err, "on_tick_start", component.name()))?;
            for callback in callbacks {
                callback(com, tick);
            }
        }
        Ok(())
    }

    async fn unmount_missing(&mut self, com: &Com, seen: &[String]) {
        let keep: HashSet<&str> = seen.iter().map(String::as_str).collect();
        let gone: Vec<String> = self
            .order
            .iter()
            .filter(|path| !keep.contains(path.as_str()))
            .cloned()
            .collect();
        for path in gone {
            let Some(mut instance) = self.instances.remove(&path) else {
                continue;
            };
            tracing::debug!(path = %path, component = instance.component.name(), "unmounting");
            if let Err(err) = instance.component.on_unmount(com).await {
                tracing::warn!(
                    path = %path,
                    component = instance.component.name(),
                    error = %format!("{err:#}"),
                    "on_unmount failed"
                );
            }
            instance.dispose();
        }
    }

    fn render_nodes<'a>(
        &'a mut self,
        nodes: &'a [ComponentNode],
        parent: &'a str,
        scope: &'a Scope<'a>,
        pass: &'a mut Pass,
    ) -> BoxFuture<'a, Result<Vec<SemanticNode>, EngineError>> {
        Box::pin(async move {
            let mut out = Vec::new();
            for (index, node) in nodes.iter().enumerate() {
                let path = format!("{parent}/{}", node.segment(index));
                let rendered = self.render_node(node, &path, scope, pass).await?;
                out.extend(rendered);
            }
            Ok(out)
        })
    }

    async fn render_node(
        &mut self,
        node: &ComponentNode,
        path: &str,
        scope: &Scope<'_>,
        pass: &mut Pass,
    ) -> Result<Vec<SemanticNode>, EngineError> {
        match node {
            ComponentNode::Primitive { kind, children, .. } => {
                self.render_primitive(kind, children, path, scope, pass).await
            }
            ComponentNode::Composite {
                component,
                props,
                children,
                ..
            } => {
                pass.seen.push(path.to_string());
                let rendered_children = self
                    .render_nodes(children, &format!("{path}/children"), scope, pass)
                    .await?;

                let mut instance = match self.instances.remove(path) {
                    Some(mut existing) => {
                        existing.component = Arc::clone(component);
                        existing
                    }
                    None => {
                        tracing::debug!(path, component = component.name(), "mounting");
                        let instance = Instance::new(Arc::clone(component));
                        component
                            .on_mount(scope.com)
                            .await
                            .map_err(|err| component_error(&err, "on_mount", component.name()))?;
                        instance
                    }
                };

                let output = {
                    let mut cx =
                        RenderContext::new(scope.com, scope.execution, scope.tick, &mut instance);
                    component
                        .render(&mut cx, props, Children::new(rendered_children))
                        .await
                };
                self.instances.insert(path.to_string(), instance);
                let output =
                    output.map_err(|err| component_error(&err, "render", component.name()))?;

                self.render_nodes(&output, &format!("{path}/out"), scope, pass)
                    .await
            }
        }
    }

    async fn render_primitive(
        &mut self,
        kind: &Primitive,
        children: &[ComponentNode],
        path: &str,
        scope: &Scope<'_>,
        pass: &mut Pass,
    ) -> Result<Vec<SemanticNode>, EngineError> {
        let node = match kind {
            Primitive::Text(text) => SemanticNode::text(text.clone()),
            Primitive::InlineCode(code) => SemanticNode::InlineCode { code: code.clone() },
            Primitive::Table { headers, rows } => SemanticNode::Table {
                headers: headers.clone(),
                rows: rows.clone(),
            },
            Primitive::Code { language, code } => SemanticNode::CodeBlock {
                language: language.clone(),
                code: code.clone(),
            },
            Primitive::Block(block) => SemanticNode::Block {
                block: block.clone(),
            },
            Primitive::Timeline => SemanticNode::Timeline,
            Primitive::Custom { kind, props } => SemanticNode::Custom {
                kind: kind.clone(),
                props: props.clone(),
            },
            Primitive::Prerendered(nodes) => return Ok(nodes.clone()),
            Primitive::Tool(tool) => {
                pass.tools.push(tool.clone());
                return Ok(Vec::new());
            }
            Primitive::Fragment => {
                return self.render_nodes(children, path, scope, pass).await;
            }
            container => {
                let children = self.render_nodes(children, path, scope, pass).await?;
                match container {
                    Primitive::Strong => SemanticNode::Strong { children },
                    Primitive::Emphasis => SemanticNode::Emphasis { children },
                    Primitive::Paragraph => SemanticNode::Paragraph { children },
                    Primitive::Heading(level) => SemanticNode::Heading {
                        level: *level,
                        children,
                    },
                    Primitive::List { ordered } => SemanticNode::List {
                        ordered: *ordered,
                        children,
                    },
                    Primitive::ListItem => SemanticNode::ListItem { children },
                    Primitive::Blockquote => SemanticNode::Blockquote { children },
                    Primitive::Section { id, title } => SemanticNode::Section {
                        id: id.clone(),
                        title: title.clone(),
                        children,
                    },
                    Primitive::Message(role) => SemanticNode::Message {
                        role: *role,
                        children,
                    },
                    Primitive::Renderer(renderer) => SemanticNode::WithRenderer {
                        renderer: renderer.clone(),
                        children,
                    },
                    // Leaves were handled above.
                    _ => SemanticNode::Custom {
                        kind: container.label().to_string(),
                        props: serde_json::Value::Null,
                    },
                }
            }
        };
        Ok(vec![node])
    }

    fn assemble(&self, nodes: Vec<SemanticNode>, com: &Com, tools: &[Tool]) -> CompiledStructure {
        let renderer = self.renderer.0.as_ref();
        let mut sections = Vec::new();
        let mut loose = Vec::new();
        let mut ephemeral = Vec::new();
        let mut timeline_rendered = false;

        let flush = |loose: &mut Vec<SemanticNode>, sections: &mut Vec<CompiledSection>| {
            if loose.is_empty() {
                return;
            }
            let content = lower(&std::mem::take(loose), renderer);
            if !content.is_empty() {
                sections.push(CompiledSection {
                    id: None,
                    title: None,
                    content,
                });
            }
        };

        for node in nodes {
            match node {
                SemanticNode::Section {
                    id,
                    title,
                    children,
                } => {
                    flush(&mut loose, &mut sections);
                    let mut content = Vec::new();
                    if let Some(title) = &title {
                        let heading = SemanticNode::Heading {
                            level: 2,
                            children: vec![SemanticNode::text(title.clone())],
                        };
                        content.push(ContentBlock::text(Formatter::new(renderer).format(&heading)));
                    }
                    content.extend(lower(&children, renderer));
                    sections.push(CompiledSection { id, title, content });
                }
                SemanticNode::Message { role, children } => {
                    ephemeral.push(CompiledMessage {
                        role,
                        content: lower(&children, renderer),
                    });
                }
                SemanticNode::Timeline => timeline_rendered = true,
                other => loose.push(other),
            }
        }
        flush(&mut loose, &mut sections);

        let timeline = if timeline_rendered || self.auto_timeline {
            com.timeline().model_messages()
        } else {
            Vec::new()
        };

        CompiledStructure {
            sections,
            timeline,
            ephemeral,
            tools: dedupe_tools(tools.to_vec())
                .into_iter()
                .map(|tool| tool.definition)
                .collect(),
        }
    }
}

/// Later declarations of the same tool name replace earlier ones, in place.
fn dedupe_tools(tools: Vec<Tool>) -> Vec<Tool> {
    let mut out: Vec<Tool> = Vec::with_capacity(tools.len());
    for tool in tools {
        match out
            .iter_mut()
            .find(|existing| existing.name().eq_ignore_ascii_case(tool.name()))
        {
            Some(existing) => *existing = tool,
            None => out.push(tool),
        }
    }
    out
}

fn component_error(err: &anyhow::Error, phase: &str, component: &str) -> EngineError {
    match EngineError::from_component(err) {
        EngineError::Compile(message) => {
            EngineError::Compile(format!("{component} {phase} failed: {message}"))
        }
        other => other,
    }
}
