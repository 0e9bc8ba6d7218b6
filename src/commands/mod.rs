//! CLI command implementations.

pub mod block;
pub mod check;
pub mod daemon;
pub mod rules;
pub mod status;

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::Config;

/// Load the configuration for a command that needs a real one.
pub(crate) fn load_config(config_path: &Path) -> Result<Config> {
    Config::load(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))
}
