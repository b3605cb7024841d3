//! Run command handler.

use std::path::Path;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use weft_core::config::Config;
use weft_core::{ExecutionError, ExecutionInput, ScriptedModel};

use crate::{agent, interrupt};

pub struct RunOptions<'a> {
    pub prompt: &'a str,
    pub script: Option<&'a Path>,
    pub config: Config,
    pub max_ticks_override: Option<u32>,
    pub renderer_override: Option<&'a str>,
    pub stream: bool,
}

pub async fn run(options: RunOptions<'_>) -> Result<()> {
    let config = {
        let mut c = options.config;
        if let Some(max_ticks) = options.max_ticks_override {
            c.max_ticks = max_ticks;
        }
        if let Some(renderer) = options.renderer_override {
            c.renderer = renderer.to_string();
        }
        c.validate().context("invalid run options")?;
        c
    };

    let model = match options.script {
        Some(path) => ScriptedModel::from_file(path)?,
        None => agent::default_script(),
    };
    let engine = agent::build(model, config).context("build agent")?;
    let input = ExecutionInput::user(options.prompt).with_cancel(interrupt::token());

    if options.stream {
        let mut stream = engine.stream(input).await.map_err(into_anyhow)?;
        while let Some(event) = stream.next().await {
            let line = serde_json::to_string(&event).context("serialize event")?;
            println!("{line}");
        }
        stream.collect_output().await.map_err(into_anyhow)?;
    } else {
        let output = engine.execute(input).await.map_err(into_anyhow)?;
        tracing::info!(
            ticks = output.ticks,
            stop_reason = ?output.stop_reason,
            "execution finished"
        );
        println!("{}", output.final_text);
    }
    Ok(())
}

fn into_anyhow(err: ExecutionError) -> anyhow::Error {
    if err.is_cancelled() {
        anyhow::Error::new(interrupt::InterruptedError)
    } else {
        anyhow::Error::new(err)
    }
}
