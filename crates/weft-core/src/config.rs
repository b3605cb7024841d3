//! Configuration management for weft.
//!
//! Loads configuration from ${WEFT_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::render::{RendererRef, renderer_by_name};
use crate::tools::ExecutorSettings;

/// Embedded from default_config.toml at compile time.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

pub mod paths {
    //! Path resolution for weft configuration.
    //!
    //! WEFT_HOME resolution order:
    //! 1. WEFT_HOME environment variable (if set)
    //! 2. ~/.config/weft (default)
    //! 3. ./.weft when no home directory can be determined

    use std::path::PathBuf;

    pub fn weft_home() -> PathBuf {
        if let Ok(home) = std::env::var("WEFT_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".weft"),
            |h| h.join(".config").join("weft"),
        )
    }

    pub fn config_path() -> PathBuf {
        weft_home().join("config.toml")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_ticks: u32,
    /// 0 disables the per-call tool timeout.
    pub tool_timeout_secs: u64,
    pub client_tool_timeout_secs: u64,
    pub confirmation_grace_secs: u64,
    pub event_channel_capacity: usize,
    pub renderer: String,
    pub auto_timeline: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_ticks: Self::DEFAULT_MAX_TICKS,
            tool_timeout_secs: 0,
            client_tool_timeout_secs: 300,
            confirmation_grace_secs: 60,
            event_channel_capacity: crate::stream::DEFAULT_EVENT_CHANNEL_CAPACITY,
            renderer: "markdown".to_string(),
            auto_timeline: true,
        }
    }
}

impl Config {
    const DEFAULT_MAX_TICKS: u32 = 10;

    /// Loads configuration from the default config path.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Creates a default config file at the given path.
    /// Returns an error if the file already exists.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, default_config_template())
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_ticks == 0 {
            anyhow::bail!("max_ticks must be at least 1");
        }
        if renderer_by_name(&self.renderer).is_none() {
            anyhow::bail!(
                "Unknown renderer '{}' (expected markdown or xml)",
                self.renderer
            );
        }
        Ok(())
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        if self.tool_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.tool_timeout_secs))
        }
    }

    /// The configured renderer, falling back to markdown for unknown names.
    pub fn renderer(&self) -> RendererRef {
        renderer_by_name(&self.renderer)
            .unwrap_or_else(|| RendererRef::new(crate::render::MarkdownRenderer))
    }

    /// The effective settings as TOML, every key spelled out.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).context("Failed to serialize config")
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            tool_timeout: self.tool_timeout(),
            client_timeout: Duration::from_secs(self.client_tool_timeout_secs),
            confirmation_grace: Duration::from_secs(self.confirmation_grace_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.max_ticks, 10);
        assert_eq!(config.tool_timeout(), None);
    }

    #[test]
    fn test_load_partial_config_merges_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "max_ticks = 3\ntool_timeout_secs = 5\nrenderer = \"xml\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.max_ticks, 3);
        assert_eq!(config.tool_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.renderer().name(), "xml");
        assert_eq!(config.client_tool_timeout_secs, 300);
        assert!(config.auto_timeline);
    }

    #[test]
    fn test_to_toml_lists_effective_values() {
        let config = Config {
            max_ticks: 4,
            renderer: "xml".to_string(),
            ..Config::default()
        };
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("max_ticks = 4"));
        assert!(rendered.contains("confirmation_grace_secs = 60"));
        assert_eq!(toml::from_str::<Config>(&rendered).unwrap(), config);
    }

    #[test]
    fn test_template_matches_defaults() {
        let parsed: Config = toml::from_str(default_config_template()).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn test_init_creates_file_and_refuses_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("subdir").join("config.toml");

        Config::init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(Config::load_from(&path).unwrap(), Config::default());

        let err = Config::init(&path).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        fs::write(&path, "max_ticks = 0\n").unwrap();
        assert!(Config::load_from(&path).is_err());

        fs::write(&path, "renderer = \"html\"\n").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Unknown renderer"));
    }
}
