use super::{Formatter, Renderer, SemanticNode};

/// Tag-structured output, for prompts that address sections by name.
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlRenderer;

impl Renderer for XmlRenderer {
    fn name(&self) -> &str {
        "xml"
    }

    fn format_node(&self, node: &SemanticNode, f: &Formatter<'_>) -> Option<String> {
        let out = match node {
            SemanticNode::Text { text } => escape_xml(text),
            SemanticNode::Strong { children } => format!("<strong>{}</strong>", f.inline(children)),
            SemanticNode::Emphasis { children } => format!("<em>{}</em>", f.inline(children)),
            SemanticNode::InlineCode { code } => format!("<code>{}</code>", escape_xml(code)),
            SemanticNode::Paragraph { children } => format!("<p>{}</p>", f.inline(children)),
            SemanticNode::Heading { level, children } => {
                format!("<h{level}>{}</h{level}>", f.inline(children))
            }
            SemanticNode::List { ordered, children } => {
                let tag = if *ordered { "ol" } else { "ul" };
                let items: String = children
                    .iter()
                    .map(|child| format!("\n  {}", f.format(child)))
                    .collect();
                format!("<{tag}>{items}\n</{tag}>")
            }
            SemanticNode::ListItem { children } => format!("<li>{}</li>", f.blocks(children)),
            SemanticNode::Table { headers, rows } => {
                let mut out = String::from("<table>");
                out.push_str("\n  <tr>");
                for header in headers {
                    out.push_str(&format!("<th>{}</th>", escape_xml(header)));
                }
                out.push_str("</tr>");
                for row in rows {
                    out.push_str("\n  <tr>");
                    for cell in row {
                        out.push_str(&format!("<td>{}</td>", escape_xml(cell)));
                    }
                    out.push_str("</tr>");
                }
                out.push_str("\n</table>");
                out
            }
            SemanticNode::Blockquote { children } => {
                format!("<blockquote>\n{}\n</blockquote>", f.blocks(children))
            }
            SemanticNode::CodeBlock { language, code } => match language {
                Some(language) => format!(
                    "<code language=\"{}\">\n{}\n</code>",
                    escape_xml(language),
                    escape_xml(code.trim_end_matches('\n'))
                ),
                None => format!("<code>\n{}\n</code>", escape_xml(code.trim_end_matches('\n'))),
            },
            SemanticNode::Section {
                id,
                title,
                children,
            } => {
                let tag = id.as_deref().map_or_else(|| "section".to_string(), tag_name);
                let body = f.blocks(children);
                let open = match title {
                    Some(title) => format!("<{tag} title=\"{}\">", escape_xml(title)),
                    None => format!("<{tag}>"),
                };
                format!("{open}\n{body}\n</{tag}>")
            }
            SemanticNode::Message { role, children } => {
                format!("<message role=\"{role}\">\n{}\n</message>", f.blocks(children))
            }
            SemanticNode::Block { block } => escape_xml(block.as_text()?),
            SemanticNode::Timeline => String::new(),
            SemanticNode::WithRenderer { .. } | SemanticNode::Custom { .. } => return None,
        };
        Some(out)
    }
}

/// Section ids become tag names; anything outside `[A-Za-z0-9_-]` maps to `_`.
fn tag_name(id: &str) -> String {
    let mut name: String = id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if !name.starts_with(|ch: char| ch.is_ascii_alphabetic() || ch == '_') {
        name.insert(0, '_');
    }
    name
}

fn escape_xml(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
