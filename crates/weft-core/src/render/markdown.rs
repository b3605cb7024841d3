use super::{Formatter, Renderer, SemanticNode};

/// CommonMark-flavored output. The default renderer.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownRenderer;

impl Renderer for MarkdownRenderer {
    fn name(&self) -> &str {
        "markdown"
    }

    fn format_node(&self, node: &SemanticNode, f: &Formatter<'_>) -> Option<String> {
        let out = match node {
            SemanticNode::Text { text } => text.clone(),
            SemanticNode::Strong { children } => format!("**{}**", f.inline(children)),
            SemanticNode::Emphasis { children } => format!("*{}*", f.inline(children)),
            SemanticNode::InlineCode { code } => format!("`{code}`"),
            SemanticNode::Paragraph { children } => f.inline(children),
            SemanticNode::Heading { level, children } => {
                let hashes = "#".repeat(usize::from((*level).clamp(1, 6)));
                format!("{hashes} {}", f.inline(children))
            }
            SemanticNode::List { ordered, children } => list(*ordered, children, f),
            SemanticNode::ListItem { children } => format!("- {}", f.blocks(children)),
            SemanticNode::Table { headers, rows } => table(headers, rows),
            SemanticNode::Blockquote { children } => f
                .blocks(children)
                .lines()
                .map(|line| {
                    if line.is_empty() {
                        ">".to_string()
                    } else {
                        format!("> {line}")
                    }
                })
                .collect::<Vec<_>>()
                .join("\n"),
            SemanticNode::CodeBlock { language, code } => format!(
                "```{}\n{}\n```",
                language.as_deref().unwrap_or_default(),
                code.trim_end_matches('\n')
            ),
            SemanticNode::Section {
                title, children, ..
            } => {
                let body = f.blocks(children);
                match title {
                    Some(title) if body.is_empty() => format!("## {title}"),
                    Some(title) => format!("## {title}\n\n{body}"),
                    None => body,
                }
            }
            SemanticNode::Message { children, .. } => f.blocks(children),
            SemanticNode::Block { block } => block.as_text()?.to_string(),
            SemanticNode::Timeline => String::new(),
            SemanticNode::WithRenderer { .. } | SemanticNode::Custom { .. } => return None,
        };
        Some(out)
    }
}

fn list(ordered: bool, children: &[SemanticNode], f: &Formatter<'_>) -> String {
    children
        .iter()
        .enumerate()
        .map(|(index, child)| {
            let body = match child {
                SemanticNode::ListItem { children } => f.blocks(children),
                other => f.format(other),
            };
            let marker = if ordered {
                format!("{}.", index + 1)
            } else {
                "-".to_string()
            };
            let indent = " ".repeat(marker.len() + 1);
            let mut lines = body.lines();
            let first = lines.next().unwrap_or_default();
            let mut item = format!("{marker} {first}");
            for line in lines {
                item.push('\n');
                if !line.is_empty() {
                    item.push_str(&indent);
                    item.push_str(line);
                }
            }
            item
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn table(headers: &[String], rows: &[Vec<String>]) -> String {
    let row = |cells: &[String]| {
        let cells: Vec<String> = cells.iter().map(|cell| cell.replace('|', "\\|")).collect();
        format!("| {} |", cells.join(" | "))
    };
    let mut lines = vec![
        row(headers),
        format!("|{}", " --- |".repeat(headers.len().max(1))),
    ];
    lines.extend(rows.iter().map(|cells| row(cells)));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(node: &SemanticNode) -> String {
        Formatter::new(&MarkdownRenderer).format(node)
    }

    #[test]
    fn test_ordered_list_indents_continuation_lines() {
        let node = SemanticNode::List {
            ordered: true,
            children: vec![
                SemanticNode::ListItem {
                    children: vec![
                        SemanticNode::Paragraph {
                            children: vec![SemanticNode::text("first")],
                        },
                        SemanticNode::Paragraph {
                            children: vec![SemanticNode::text("more")],
                        },
                    ],
                },
                SemanticNode::ListItem {
                    children: vec![SemanticNode::text("second")],
                },
            ],
        };
        assert_eq!(render(&node), "1. first\n\n   more\n2. second");
    }

    #[test]
    fn test_table_escapes_pipes() {
        let node = SemanticNode::Table {
            headers: vec!["tool".to_string(), "note".to_string()],
            rows: vec![vec!["calc".to_string(), "a|b".to_string()]],
        };
        assert_eq!(
            render(&node),
            "| tool | note |\n| --- | --- |\n| calc | a\\|b |"
        );
    }

    #[test]
    fn test_blockquote_and_code() {
        let quote = SemanticNode::Blockquote {
            children: vec![
                SemanticNode::Paragraph {
                    children: vec![SemanticNode::text("one")],
                },
                SemanticNode::Paragraph {
                    children: vec![SemanticNode::text("two")],
                },
            ],
        };
        assert_eq!(render(&quote), "> one\n>\n> two");

        let code = SemanticNode::CodeBlock {
            language: Some("rust".to_string()),
            code: "fn main() {}\n".to_string(),
        };
        assert_eq!(render(&code), "```rust\nfn main() {}\n```");
    }

    #[test]
    fn test_heading_level_is_clamped() {
        let node = SemanticNode::Heading {
            level: 9,
            children: vec![SemanticNode::text("deep")],
        };
        assert_eq!(render(&node), "###### deep");
    }
}
