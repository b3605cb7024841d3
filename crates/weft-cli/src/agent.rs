//! The demo agent the `run` command drives: an instruction section, the
//! notes kept in shared state, the timeline, and two tools.

use async_trait::async_trait;
use serde_json::{Value, json};
use weft_core::{
    Children, Component, ComponentNode, Config, Engine, RenderContext, ScriptedModel,
    ScriptedTurn, Tool, ToolContext, ToolOutput,
};

const NOTES_KEY: &str = "notes";

const INSTRUCTIONS: &str = "You are a careful assistant. Use `calc` for arithmetic \
and `remember` for anything the user asks you to keep.";

struct Assistant;

#[async_trait]
impl Component for Assistant {
    fn name(&self) -> &str {
        "Assistant"
    }

    async fn render(
        &self,
        cx: &mut RenderContext<'_>,
        _props: &Value,
        _children: Children,
    ) -> anyhow::Result<Vec<ComponentNode>> {
        let notes = cx.use_com_state(NOTES_KEY, Vec::<String>::new)?.get();

        let memory = if notes.is_empty() {
            ComponentNode::paragraph(vec![ComponentNode::text("No notes yet.")])
        } else {
            ComponentNode::list(false, notes.into_iter().map(ComponentNode::text).collect())
        };

        Ok(vec![
            ComponentNode::section(
                "system",
                Some("Instructions"),
                vec![ComponentNode::paragraph(vec![ComponentNode::text(
                    INSTRUCTIONS,
                )])],
            ),
            ComponentNode::section("notes", Some("Notes"), vec![memory]),
            ComponentNode::timeline(),
        ])
    }
}

/// Integer arithmetic. `op` defaults to `add`.
pub fn calc_tool() -> Tool {
    Tool::server(
        "calc",
        "Applies add, sub, mul or div to two integers",
        json!({
            "type": "object",
            "properties": {
                "a": {"type": "integer"},
                "b": {"type": "integer"},
                "op": {"type": "string", "enum": ["add", "sub", "mul", "div"]}
            },
            "required": ["a", "b"]
        }),
        |input: Value, _ctx| async move { calc(&input) },
    )
}

fn calc(input: &Value) -> ToolOutput {
    let (Some(a), Some(b)) = (input["a"].as_i64(), input["b"].as_i64()) else {
        return ToolOutput::failure("invalid_input", "a and b must be integers", None);
    };
    let op = input["op"].as_str().unwrap_or("add");
    let value = match op {
        "add" => a.checked_add(b),
        "sub" => a.checked_sub(b),
        "mul" => a.checked_mul(b),
        "div" if b == 0 => {
            return ToolOutput::failure("division_by_zero", "b must not be zero", None);
        }
        "div" => a.checked_div(b),
        other => {
            return ToolOutput::failure("invalid_input", format!("unknown op '{other}'"), None);
        }
    };
    match value {
        Some(value) => ToolOutput::success(json!(value)),
        None => ToolOutput::failure("overflow", format!("{a} {op} {b} overflows"), None),
    }
}

/// Appends a note to shared state, where the `Notes` section picks it up on
/// the next tick.
pub fn remember_tool() -> Tool {
    Tool::server(
        "remember",
        "Stores a note for later ticks",
        json!({
            "type": "object",
            "properties": {"note": {"type": "string"}},
            "required": ["note"]
        }),
        |input: Value, ctx: ToolContext| async move {
            let Some(note) = input["note"].as_str().map(str::to_string) else {
                return ToolOutput::failure("invalid_input", "note must be a string", None);
            };
            match ctx.com.state(NOTES_KEY, Vec::<String>::new) {
                Ok(notes) => {
                    notes.update(|current| {
                        let mut next = current.clone();
                        next.push(note);
                        next
                    });
                    ToolOutput::success(json!("saved"))
                }
                Err(err) => ToolOutput::failure("state", err.to_string(), None),
            }
        },
    )
}

/// Used when no script file is given: one `calc` call, then an answer.
pub fn default_script() -> ScriptedModel {
    ScriptedModel::new([
        ScriptedTurn::text("Let me work that out.")
            .with_tool_call("calc", json!({"a": 2, "b": 3, "op": "add"})),
        ScriptedTurn::text("2 + 3 = 5."),
    ])
}

pub fn build(model: ScriptedModel, config: Config) -> anyhow::Result<Engine> {
    let engine = Engine::builder()
        .root(ComponentNode::component(Assistant, json!({})))
        .model(model)
        .tool(calc_tool())
        .tool(remember_tool())
        .config(config)
        .build()?;
    Ok(engine)
}
