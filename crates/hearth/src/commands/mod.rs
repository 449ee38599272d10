//! CLI command handlers.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use hearth_session::SessionManagerConfig;

pub mod config;
pub mod delete;
pub mod inspect;
pub mod reap;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Effective session manager configuration.
    pub config: SessionManagerConfig,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

/// Default config file location.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("hearth").join("hearth.toml"))
}

/// Load `path`, or the default config file if it exists, or built-in defaults.
pub fn load_config(path: Option<&Path>) -> Result<SessionManagerConfig> {
    if let Some(path) = path {
        return SessionManagerConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()));
    }
    match default_config_path() {
        Some(path) if path.is_file() => SessionManagerConfig::load(&path)
            .with_context(|| format!("loading config from {}", path.display())),
        _ => Ok(SessionManagerConfig::default()),
    }
}
