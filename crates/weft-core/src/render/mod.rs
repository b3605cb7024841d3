//! Semantic nodes and the renderers that turn them into model-facing text.
//!
//! Components render into [`SemanticNode`] trees that carry structure only.
//! A [`Renderer`] formats them; [`lower`] turns a rendered tree into content
//! blocks. A subtree may switch renderer, and switches nest arbitrarily.

mod markdown;
mod xml;

use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use serde_json::Value;
use weft_types::ContentBlock;

pub use markdown::MarkdownRenderer;
pub use xml::XmlRenderer;

/// Formats semantic nodes into text.
pub trait Renderer: Send + Sync {
    fn name(&self) -> &str;

    /// Formats one node. Returns `None` for nodes this renderer does not know,
    /// which then degrade to a JSON fallback.
    fn format_node(&self, node: &SemanticNode, f: &Formatter<'_>) -> Option<String>;
}

/// Shared handle to a renderer, compared and serialized by name.
#[derive(Clone)]
pub struct RendererRef(pub Arc<dyn Renderer>);

impl RendererRef {
    pub fn new(renderer: impl Renderer + 'static) -> Self {
        Self(Arc::new(renderer))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }
}

impl fmt::Debug for RendererRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RendererRef").field(&self.name()).finish()
    }
}

impl PartialEq for RendererRef {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

impl Serialize for RendererRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Resolves a renderer by its configured name.
pub fn renderer_by_name(name: &str) -> Option<RendererRef> {
    match name.trim().to_ascii_lowercase().as_str() {
        "markdown" | "md" => Some(RendererRef::new(MarkdownRenderer)),
        "xml" => Some(RendererRef::new(XmlRenderer)),
        _ => None,
    }
}

/// Format-independent rendered content.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SemanticNode {
    Text {
        text: String,
    },
    Strong {
        children: Vec<SemanticNode>,
    },
    Emphasis {
        children: Vec<SemanticNode>,
    },
    InlineCode {
        code: String,
    },
    Paragraph {
        children: Vec<SemanticNode>,
    },
    Heading {
        level: u8,
        children: Vec<SemanticNode>,
    },
    List {
        ordered: bool,
        children: Vec<SemanticNode>,
    },
    ListItem {
        children: Vec<SemanticNode>,
    },
    Table {
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    Blockquote {
        children: Vec<SemanticNode>,
    },
    CodeBlock {
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        code: String,
    },
    /// A titled group. At the top level it becomes one system section.
    Section {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        children: Vec<SemanticNode>,
    },
    /// An ephemeral message, sent for this tick only.
    Message {
        role: weft_types::Role,
        children: Vec<SemanticNode>,
    },
    /// Where the timeline goes.
    Timeline,
    /// Content emitted unchanged.
    Block {
        block: ContentBlock,
    },
    /// Subtree formatted with another renderer.
    WithRenderer {
        renderer: RendererRef,
        children: Vec<SemanticNode>,
    },
    Custom {
        kind: String,
        props: Value,
    },
}

impl SemanticNode {
    pub fn text(text: impl Into<String>) -> Self {
        SemanticNode::Text { text: text.into() }
    }

    pub fn is_inline(&self) -> bool {
        matches!(
            self,
            SemanticNode::Text { .. }
                | SemanticNode::Strong { .. }
                | SemanticNode::Emphasis { .. }
                | SemanticNode::InlineCode { .. }
        )
    }

    /// Plain text content, ignoring all formatting.
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        match self {
            SemanticNode::Text { text } => out.push_str(text),
            SemanticNode::InlineCode { code } | SemanticNode::CodeBlock { code, .. } => {
                out.push_str(code);
            }
            SemanticNode::Table { headers, rows } => {
                out.push_str(&headers.join(" "));
                for row in rows {
                    out.push(' ');
                    out.push_str(&row.join(" "));
                }
            }
            SemanticNode::Block { block } => {
                if let Some(text) = block.as_text() {
                    out.push_str(text);
                }
            }
            SemanticNode::Strong { children }
            | SemanticNode::Emphasis { children }
            | SemanticNode::Paragraph { children }
            | SemanticNode::Heading { children, .. }
            | SemanticNode::List { children, .. }
            | SemanticNode::ListItem { children }
            | SemanticNode::Blockquote { children }
            | SemanticNode::Section { children, .. }
            | SemanticNode::Message { children, .. }
            | SemanticNode::WithRenderer { children, .. } => {
                for child in children {
                    child.collect_text(out);
                }
            }
            SemanticNode::Timeline | SemanticNode::Custom { .. } => {}
        }
    }
}

/// Formatting state handed to [`Renderer::format_node`].
///
/// Holds the active renderer. Children are formatted back through the
/// formatter so nested renderer switches are honored at any depth.
pub struct Formatter<'r> {
    renderer: &'r dyn Renderer,
}

impl<'r> Formatter<'r> {
    pub fn new(renderer: &'r dyn Renderer) -> Self {
        Self { renderer }
    }

    pub fn renderer_name(&self) -> &str {
        self.renderer.name()
    }

    /// Formats a single node with the active renderer.
    pub fn format(&self, node: &SemanticNode) -> String {
        match node {
            SemanticNode::WithRenderer { renderer, children } => {
                Formatter::new(renderer.0.as_ref()).blocks(children)
            }
            _ => self
                .renderer
                .format_node(node, self)
                .unwrap_or_else(|| fallback_text(node, self.renderer.name())),
        }
    }

    /// Concatenates inline children.
    pub fn inline(&self, children: &[SemanticNode]) -> String {
        children.iter().map(|child| self.format(child)).collect()
    }

    /// Formats a mixed child list: runs of inline nodes are concatenated,
    /// block-level nodes are separated by a blank line.
    pub fn blocks(&self, children: &[SemanticNode]) -> String {
        let mut parts: Vec<String> = Vec::new();
        let mut inline_run = String::new();
        for child in children {
            if child.is_inline() {
                inline_run.push_str(&self.format(child));
                continue;
            }
            if !inline_run.is_empty() {
                parts.push(std::mem::take(&mut inline_run));
            }
            let formatted = self.format(child);
            if !formatted.is_empty() {
                parts.push(formatted);
            }
        }
        if !inline_run.is_empty() {
            parts.push(inline_run);
        }
        parts.join("\n\n")
    }
}

fn fallback_text(node: &SemanticNode, renderer: &str) -> String {
    tracing::warn!(
        renderer,
        node = ?node_kind(node),
        "unrecognized semantic node, emitting JSON fallback"
    );
    match node {
        SemanticNode::Custom { kind, props } if props.is_null() => format!("[{kind}]"),
        SemanticNode::Custom { kind, props } => format!("[{kind}] {props}"),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn node_kind(node: &SemanticNode) -> String {
    match node {
        SemanticNode::Custom { kind, .. } => kind.clone(),
        SemanticNode::Block { block } => block.block_type().to_string(),
        other => serde_json::to_value(other)
            .ok()
            .and_then(|value| value.get("type").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default(),
    }
}

/// Lowers rendered nodes into content blocks.
///
/// Each block-level node becomes one text block and each run of inline nodes
/// one text block. `Block` nodes pass through unchanged. Unknown nodes never
/// fail the render; they degrade to a text fallback.
pub fn lower(nodes: &[SemanticNode], renderer: &dyn Renderer) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    let formatter = Formatter::new(renderer);
    let mut inline_run = String::new();
    for node in nodes {
        if node.is_inline() {
            inline_run.push_str(&formatter.format(node));
            continue;
        }
        if !inline_run.is_empty() {
            blocks.push(ContentBlock::text(std::mem::take(&mut inline_run)));
        }
        match node {
            SemanticNode::Block { block } => blocks.push(block.clone()),
            SemanticNode::WithRenderer { renderer, children } => {
                blocks.extend(lower(children, renderer.0.as_ref()));
            }
            SemanticNode::Timeline => {}
            other => {
                let text = formatter.format(other);
                if !text.is_empty() {
                    blocks.push(ContentBlock::text(text));
                }
            }
        }
    }
    if !inline_run.is_empty() {
        blocks.push(ContentBlock::text(inline_run));
    }
    blocks
}
