//! CLI entry and dispatch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use weft_core::config;

use crate::{interrupt, logging};

mod commands;

#[derive(Parser)]
#[command(name = "weft")]
#[command(version)]
#[command(about = "Runs component-driven agents against a scripted model")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Runs the demo agent with a prompt
    Run {
        /// The user message for tick 1
        #[arg(short, long)]
        prompt: String,

        /// JSON script of model turns (default: a built-in two-turn script)
        #[arg(long, value_name = "FILE")]
        script: Option<PathBuf>,

        /// Override max_ticks from config
        #[arg(long, value_name = "N")]
        max_ticks: Option<u32>,

        /// Print stream events as NDJSON instead of the final text
        #[arg(long)]
        stream: bool,

        /// Override the renderer from config (markdown, xml)
        #[arg(long)]
        renderer: Option<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Print the config file path
    Path,
    /// Write a default config file
    Init,
    /// Print the effective settings, file values merged over defaults
    Show,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    logging::init();
    interrupt::init()?;

    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move { dispatch(cli).await })
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run {
            prompt,
            script,
            max_ticks,
            stream,
            renderer,
        } => {
            let config = config::Config::load().context("load config")?;
            commands::run::run(commands::run::RunOptions {
                prompt: &prompt,
                script: script.as_deref(),
                config,
                max_ticks_override: max_ticks,
                renderer_override: renderer.as_deref(),
                stream,
            })
            .await
        }

        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
            ConfigCommands::Show => commands::config::show(),
        },
    }
}
