//! Config command handlers.

use anyhow::{Context, Result};
use weft_core::config::{self, Config};

pub fn path() {
    println!("{}", config::paths::config_path().display());
}

pub fn init() -> Result<()> {
    let config_path = config::paths::config_path();
    Config::init(&config_path)
        .with_context(|| format!("init config at {}", config_path.display()))?;
    println!("Created config at {}", config_path.display());
    Ok(())
}

/// Prints the settings a `weft run` would use and where they came from.
pub fn show() -> Result<()> {
    let config_path = config::paths::config_path();
    let config = Config::load_from(&config_path).context("load config")?;

    println!("# WEFT_HOME: {}", config::paths::weft_home().display());
    if config_path.exists() {
        println!("# source: {}", config_path.display());
    } else {
        println!("# source: built-in defaults (run `weft config init` to create a file)");
    }
    print!("{}", config.to_toml()?);
    Ok(())
}
