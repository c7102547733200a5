//! Configuration schema definitions.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Every key is optional; a missing table or key
//! takes the default listed below.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── JobConfig                  - Log directory, job id, early message policy
//! └── SysInfoConfig
//!     ├── SysInfoCollectConfig   - What to collect and how
//!     └── CollectiblesConfig     - Paths of the collectible list files
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
///
/// # TOML Structure
///
/// ```toml
/// [job]
/// logdir = "job-results/latest"
/// early_messages = "create"
///
/// [sysinfo.collect]
/// enabled = true
/// per_test = false
/// commands_timeout = -1
/// installed_packages = false
/// profiler = false
/// locale = "C"
/// optimize = false
///
/// [sysinfo.collectibles]
/// commands = "/etc/avocado/sysinfo/commands"
/// ```
///
/// # Example
///
/// ```
/// use avocado_pipeline::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [sysinfo.collect]
///     optimize = true
/// "#).unwrap();
/// assert!(config.sysinfo.collect.optimize);
/// assert!(config.sysinfo.collect.enabled);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Job-level settings.
    #[serde(default)]
    pub job: JobConfig,

    /// System information collection.
    #[serde(default)]
    pub sysinfo: SysInfoConfig,
}

/// What to do with a `running` or `finished` message that arrives before
/// the task's `started`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EarlyMessagePolicy {
    /// Create the task directory and metadata on demand, with a warning.
    #[default]
    Create,
    /// Drop the message with a warning.
    Drop,
}

/// Job-level settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `logdir` | `job-results/latest` |
/// | `unique_id` | random UUID v4 |
/// | `early_messages` | `create` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
    /// Root directory of the job's artifacts. `~` and environment
    /// variables are expanded.
    #[serde(default = "default_logdir")]
    pub logdir: PathBuf,

    /// Unique job identifier.
    #[serde(default)]
    pub unique_id: Option<String>,

    #[serde(default)]
    pub early_messages: EarlyMessagePolicy,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            logdir: default_logdir(),
            unique_id: None,
            early_messages: EarlyMessagePolicy::default(),
        }
    }
}

fn default_logdir() -> PathBuf {
    PathBuf::from("job-results/latest")
}

/// `[sysinfo]` table.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SysInfoConfig {
    #[serde(default)]
    pub collect: SysInfoCollectConfig,

    #[serde(default)]
    pub collectibles: CollectiblesConfig,
}

/// `[sysinfo.collect]` table.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `enabled` | true |
/// | `per_test` | false |
/// | `commands_timeout` | -1 (no timeout) |
/// | `installed_packages` | false |
/// | `profiler` | false |
/// | `locale` | `"C"` |
/// | `optimize` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SysInfoCollectConfig {
    /// Master switch for job-level collection.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Also collect around every test, into the test's own directory.
    #[serde(default)]
    pub per_test: bool,

    /// Seconds a command may run. Zero or negative means unlimited.
    #[serde(default = "default_commands_timeout")]
    pub commands_timeout: i64,

    /// Capture the installed package list and diff it at the end.
    #[serde(default)]
    pub installed_packages: bool,

    /// Run the profiler commands as daemons between start and end.
    #[serde(default)]
    pub profiler: bool,

    /// Value of `LC_ALL` for commands. Empty leaves it untouched.
    #[serde(default = "default_locale")]
    pub locale: String,

    /// Drop a post file when it is byte-identical to its pre counterpart.
    #[serde(default)]
    pub optimize: bool,
}

impl Default for SysInfoCollectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_test: false,
            commands_timeout: default_commands_timeout(),
            installed_packages: false,
            profiler: false,
            locale: default_locale(),
            optimize: false,
        }
    }
}

impl SysInfoCollectConfig {
    /// The command timeout, `None` when unlimited.
    pub fn timeout(&self) -> Option<std::time::Duration> {
        u64::try_from(self.commands_timeout)
            .ok()
            .filter(|secs| *secs > 0)
            .map(std::time::Duration::from_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_commands_timeout() -> i64 {
    -1
}

fn default_locale() -> String {
    "C".to_string()
}

/// `[sysinfo.collectibles]` table: files listing one collectible per line.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectiblesConfig {
    #[serde(default = "default_commands_file")]
    pub commands: PathBuf,

    #[serde(default = "default_fail_commands_file")]
    pub fail_commands: PathBuf,

    #[serde(default = "default_files_file")]
    pub files: PathBuf,

    #[serde(default = "default_fail_files_file")]
    pub fail_files: PathBuf,

    #[serde(default = "default_profilers_file")]
    pub profilers: PathBuf,
}

impl Default for CollectiblesConfig {
    fn default() -> Self {
        Self {
            commands: default_commands_file(),
            fail_commands: default_fail_commands_file(),
            files: default_files_file(),
            fail_files: default_fail_files_file(),
            profilers: default_profilers_file(),
        }
    }
}

const SYSINFO_CONFIG_DIR: &str = "/etc/avocado/sysinfo";

fn default_commands_file() -> PathBuf {
    PathBuf::from(SYSINFO_CONFIG_DIR).join("commands")
}

fn default_fail_commands_file() -> PathBuf {
    PathBuf::from(SYSINFO_CONFIG_DIR).join("fail_commands")
}

fn default_files_file() -> PathBuf {
    PathBuf::from(SYSINFO_CONFIG_DIR).join("files")
}

fn default_fail_files_file() -> PathBuf {
    PathBuf::from(SYSINFO_CONFIG_DIR).join("fail_files")
}

fn default_profilers_file() -> PathBuf {
    PathBuf::from(SYSINFO_CONFIG_DIR).join("profilers")
}
