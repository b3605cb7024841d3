//! Component tree nodes, built with plain constructors.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use weft_types::{ContentBlock, Role};

use crate::component::Component;
use crate::render::{Renderer, RendererRef, SemanticNode};
use crate::tools::Tool;

/// Primitive content. Renders directly to semantic nodes.
#[derive(Clone)]
pub enum Primitive {
    Text(String),
    Strong,
    Emphasis,
    InlineCode(String),
    Paragraph,
    Heading(u8),
    List { ordered: bool },
    ListItem,
    Table {
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    Blockquote,
    Code {
        language: Option<String>,
        code: String,
    },
    /// Children spliced into the parent.
    Fragment,
    Section {
        id: Option<String>,
        title: Option<String>,
    },
    /// Ephemeral message for the current tick only.
    Message(Role),
    /// Marks where timeline messages go.
    Timeline,
    /// Emitted unchanged.
    Block(ContentBlock),
    /// Makes a tool available for this tick.
    Tool(Tool),
    /// Formats the children with another renderer.
    Renderer(RendererRef),
    /// Already-rendered content, usually a component's children.
    Prerendered(Vec<SemanticNode>),
    Custom { kind: String, props: Value },
}

impl Primitive {
    pub fn label(&self) -> &'static str {
        match self {
            Primitive::Text(_) => "text",
            Primitive::Strong => "strong",
            Primitive::Emphasis => "emphasis",
            Primitive::InlineCode(_) => "inline_code",
            Primitive::Paragraph => "paragraph",
            Primitive::Heading(_) => "heading",
            Primitive::List { .. } => "list",
            Primitive::ListItem => "list_item",
            Primitive::Table { .. } => "table",
            Primitive::Blockquote => "blockquote",
            Primitive::Code { .. } => "code",
            Primitive::Fragment => "fragment",
            Primitive::Section { .. } => "section",
            Primitive::Message(_) => "message",
            Primitive::Timeline => "timeline",
            Primitive::Block(_) => "block",
            Primitive::Tool(_) => "tool",
            Primitive::Renderer(_) => "renderer",
            Primitive::Prerendered(_) => "prerendered",
            Primitive::Custom { .. } => "custom",
        }
    }
}

/// A node of the declarative tree.
///
/// Identity across ticks comes from the tree path plus the explicit key, or
/// the position among siblings when there is no key.
#[derive(Clone)]
pub enum ComponentNode {
    Primitive {
        kind: Primitive,
        key: Option<String>,
        children: Vec<ComponentNode>,
    },
    Composite {
        component: Arc<dyn Component>,
        props: Value,
        key: Option<String>,
        children: Vec<ComponentNode>,
    },
}

impl ComponentNode {
    pub fn primitive(kind: Primitive, children: Vec<ComponentNode>) -> Self {
        ComponentNode::Primitive {
            kind,
            key: None,
            children,
        }
    }

    pub fn component(component: impl Component, props: Value) -> Self {
        Self::shared(Arc::new(component), props)
    }

    pub fn shared(component: Arc<dyn Component>, props: Value) -> Self {
        ComponentNode::Composite {
            component,
            props,
            key: None,
            children: Vec::new(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::primitive(Primitive::Text(text.into()), Vec::new())
    }

    pub fn strong(children: Vec<ComponentNode>) -> Self {
        Self::primitive(Primitive::Strong, children)
    }

    pub fn emphasis(children: Vec<ComponentNode>) -> Self {
        Self::primitive(Primitive::Emphasis, children)
    }

    pub fn inline_code(code: impl Into<String>) -> Self {
        Self::primitive(Primitive::InlineCode(code.into()), Vec::new())
    }

    pub fn paragraph(children: Vec<ComponentNode>) -> Self {
        Self::primitive(Primitive::Paragraph, children)
    }

    pub fn heading(level: u8, text: impl Into<String>) -> Self {
        Self::primitive(Primitive::Heading(level), vec![Self::text(text)])
    }

    pub fn list(ordered: bool, items: Vec<ComponentNode>) -> Self {
        let items = items
            .into_iter()
            .map(|item| match item {
                ComponentNode::Primitive {
                    kind: Primitive::ListItem,
                    ..
                } => item,
                other => Self::primitive(Primitive::ListItem, vec![other]),
            })
            .collect();
        Self::primitive(Primitive::List { ordered }, items)
    }

    pub fn table(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self::primitive(Primitive::Table { headers, rows }, Vec::new())
    }

    pub fn blockquote(children: Vec<ComponentNode>) -> Self {
        Self::primitive(Primitive::Blockquote, children)
    }

    pub fn code(language: Option<&str>, code: impl Into<String>) -> Self {
        Self::primitive(
            Primitive::Code {
                language: language.map(str::to_string),
                code: code.into(),
            },
            Vec::new(),
        )
    }

    pub fn fragment(children: Vec<ComponentNode>) -> Self {
        Self::primitive(Primitive::Fragment, children)
    }

    pub fn section(id: impl Into<String>, title: Option<&str>, children: Vec<ComponentNode>) -> Self {
        Self::primitive(
            Primitive::Section {
                id: Some(id.into()),
                title: title.map(str::to_string),
            },
            children,
        )
    }

    pub fn message(role: Role, children: Vec<ComponentNode>) -> Self {
        Self::primitive(Primitive::Message(role), children)
    }

    pub fn timeline() -> Self {
        Self::primitive(Primitive::Timeline, Vec::new())
    }

    pub fn block(block: ContentBlock) -> Self {
        Self::primitive(Primitive::Block(block), Vec::new())
    }

    pub fn tool(tool: Tool) -> Self {
        Self::primitive(Primitive::Tool(tool), Vec::new())
    }

    pub fn with_renderer(renderer: impl Renderer + 'static, children: Vec<ComponentNode>) -> Self {
        Self::primitive(Primitive::Renderer(RendererRef::new(renderer)), children)
    }

    pub fn prerendered(nodes: Vec<SemanticNode>) -> Self {
        Self::primitive(Primitive::Prerendered(nodes), Vec::new())
    }

    pub fn custom(kind: impl Into<String>, props: Value) -> Self {
        Self::primitive(
            Primitive::Custom {
                kind: kind.into(),
                props,
            },
            Vec::new(),
        )
    }

    #[must_use]
    pub fn with_key(mut self, new_key: impl Into<String>) -> Self {
        match &mut self {
            ComponentNode::Primitive { key, .. } | ComponentNode::Composite { key, .. } => {
                *key = Some(new_key.into());
            }
        }
        self
    }

    #[must_use]
    pub fn with_children(mut self, new_children: Vec<ComponentNode>) -> Self {
        match &mut self {
            ComponentNode::Primitive { children, .. }
            | ComponentNode::Composite { children, .. } => *children = new_children,
        }
        self
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            ComponentNode::Primitive { key, .. } | ComponentNode::Composite { key, .. } => {
                key.as_deref()
            }
        }
    }

    pub fn children(&self) -> &[ComponentNode] {
        match self {
            ComponentNode::Primitive { children, .. }
            | ComponentNode::Composite { children, .. } => children,
        }
    }

    /// Path segment used for identity: `name#key`, or `name@index` when unkeyed.
    pub(crate) fn segment(&self, index: usize) -> String {
        let name = match self {
            ComponentNode::Primitive { kind, .. } => kind.label(),
            ComponentNode::Composite { component, .. } => component.name(),
        };
        match self.key() {
            Some(key) => format!("{name}#{key}"),
            None => format!("{name}@{index}"),
        }
    }
}

impl fmt::Debug for ComponentNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentNode::Primitive {
                kind,
                key,
                children,
            } => f
                .debug_struct("Primitive")
                .field("kind", &kind.label())
                .field("key", key)
                .field("children", children)
                .finish(),
            ComponentNode::Composite {
                component,
                props,
                key,
                children,
            } => f
                .debug_struct("Composite")
                .field("component", &component.name())
                .field("props", props)
                .field("key", key)
                .field("children", children)
                .finish(),
        }
    }
}

impl From<&str> for ComponentNode {
    fn from(text: &str) -> Self {
        ComponentNode::text(text)
    }
}

impl From<String> for ComponentNode {
    fn from(text: String) -> Self {
        ComponentNode::text(text)
    }
}
