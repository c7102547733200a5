//! Configuration loading and schema definitions.
//!
//! This module provides types and functions for loading pipeline
//! configuration from TOML files or strings. The schema covers the job's
//! artifact directory and the system information collection settings.
//!
//! # The Configuration File Format is described in the README.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Loads configuration from a TOML file.
///
/// Relative `job.logdir` values stay relative to the current directory;
/// `~` and environment variables in it are expanded.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use avocado_pipeline::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("pipeline.toml"))?;
/// println!("Logging to {}", config.job.logdir.display());
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    load_config_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Loads configuration from a TOML string.
///
/// # Example
///
/// ```
/// use avocado_pipeline::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [job]
///     logdir = "/tmp/results"
///
///     [sysinfo.collect]
///     commands_timeout = 10
/// "#)?;
///
/// assert_eq!(config.sysinfo.collect.commands_timeout, 10);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;
    config.job.logdir = expand_path(&config.job.logdir)?;
    Ok(config)
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .with_context(|| format!("Failed to expand path: {raw}"))?;
    Ok(PathBuf::from(expanded.as_ref()))
}
