//! flowline Configuration Module
//!
//! Engine settings: scheduler flavour, concurrency, timeouts, isolation.
//! Config is stored in `~/.config/flowline/config.toml`.
//!
//! ## Priority Order (highest to lowest)
//!
//! 1. CLI flags (applied by the binary)
//! 2. Environment variables (`FLOWLINE_*`)
//! 3. Config file (`~/.config/flowline/config.toml`)
//! 4. Defaults
//!
//! ## Thread budget
//!
//! Node concurrency bounds one line; line concurrency bounds how many lines
//! run at once. A sync batch can therefore hold up to
//! `line_concurrency × node_concurrency` worker threads. [`EngineConfig::thread_budget`]
//! reports that product so callers can size it on purpose.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::util::constants::{
    DEFAULT_ERROR_REPORT_LIMIT, DEFAULT_FORCE_EXIT_TIMEOUT, DEFAULT_LINE_CONCURRENCY,
    DEFAULT_NODE_CONCURRENCY, MAX_NODE_CONCURRENCY,
};

/// Which node scheduler drives a line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    /// OS thread pool, blocks on the first finished node
    #[default]
    Sync,
    /// tokio tasks, blocking tools delegated to the blocking pool
    Async,
}

impl FromStr for SchedulerMode {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" | "thread" | "threads" => Ok(Self::Sync),
            "async" | "tokio" => Ok(Self::Async),
            other => Err(FlowError::ConfigError {
                reason: format!("unknown scheduler '{}' (expected sync or async)", other),
            }),
        }
    }
}

impl std::fmt::Display for SchedulerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Sync => "sync",
            Self::Async => "async",
        })
    }
}

/// Where a line executes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Lines run inside this process
    #[default]
    InProcess,
    /// Each line is shipped to a `flowline worker` child process
    Process,
}

impl FromStr for Isolation {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in_process" | "in-process" | "thread" => Ok(Self::InProcess),
            "process" => Ok(Self::Process),
            other => Err(FlowError::ConfigError {
                reason: format!("unknown isolation '{}' (expected in_process or process)", other),
            }),
        }
    }
}

impl std::fmt::Display for Isolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::InProcess => "in_process",
            Self::Process => "process",
        })
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerMode,

    /// Requested node concurrency per line (clamped to the hard cap at use)
    pub node_concurrency: usize,

    /// Lines executed at the same time by the batch engine
    pub line_concurrency: usize,

    /// Per-line timeout; `None` means lines may run indefinitely
    pub line_timeout_secs: Option<u64>,

    /// Grace period after SIGINT/SIGTERM before force exit; 0 disables the monitor
    pub force_exit_timeout_secs: u64,

    /// How many failed lines are kept verbatim in the error summary
    pub error_report_limit: usize,

    pub isolation: Isolation,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerMode::default(),
            node_concurrency: DEFAULT_NODE_CONCURRENCY,
            line_concurrency: DEFAULT_LINE_CONCURRENCY,
            line_timeout_secs: None,
            force_exit_timeout_secs: DEFAULT_FORCE_EXIT_TIMEOUT.as_secs(),
            error_report_limit: DEFAULT_ERROR_REPORT_LIMIT,
            isolation: Isolation::default(),
        }
    }
}

impl EngineConfig {
    /// Returns `~/.config/flowline/` on Unix, `%APPDATA%/flowline/` on Windows
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("flowline")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration from the default location
    ///
    /// Returns default config if file doesn't exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from an explicit file
    ///
    /// Returns error if file exists but is malformed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| FlowError::ConfigError {
            reason: format!("Failed to read config file: {}", e),
        })?;

        toml::from_str(&content).map_err(|e| FlowError::ConfigError {
            reason: format!("Failed to parse config file: {}", e),
        })
    }

    /// Save configuration to an explicit file, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| FlowError::ConfigError {
                reason: format!("Failed to create config directory: {}", e),
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| FlowError::ConfigError {
            reason: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(path, content).map_err(|e| FlowError::ConfigError {
            reason: format!("Failed to write config file: {}", e),
        })
    }

    /// Merge with environment variables
    ///
    /// Environment variables take precedence over config file values.
    /// Empty variables are ignored; malformed ones are an error.
    pub fn with_env(mut self) -> Result<Self> {
        if let Some(raw) = env_var("FLOWLINE_SCHEDULER") {
            self.scheduler = raw.parse()?;
        }
        if let Some(n) = env_parse::<usize>("FLOWLINE_NODE_CONCURRENCY")? {
            self.node_concurrency = n;
        }
        if let Some(n) = env_parse::<usize>("FLOWLINE_LINE_CONCURRENCY")? {
            self.line_concurrency = n;
        }
        if let Some(secs) = env_parse::<u64>("FLOWLINE_LINE_TIMEOUT_SECS")? {
            self.line_timeout_secs = (secs > 0).then_some(secs);
        }
        if let Some(secs) = env_parse::<u64>("FLOWLINE_FORCE_EXIT_TIMEOUT_SECS")? {
            self.force_exit_timeout_secs = secs;
        }
        if let Some(raw) = env_var("FLOWLINE_ISOLATION") {
            self.isolation = raw.parse()?;
        }
        Ok(self)
    }

    /// Node concurrency after applying the hard cap
    pub fn effective_node_concurrency(&self) -> usize {
        clamp_concurrency(self.node_concurrency)
    }

    /// Line concurrency, never below one
    pub fn effective_line_concurrency(&self) -> usize {
        self.line_concurrency.max(1)
    }

    pub fn line_timeout(&self) -> Option<Duration> {
        self.line_timeout_secs.map(Duration::from_secs)
    }

    /// `None` when the force-exit monitor is disabled
    pub fn force_exit_timeout(&self) -> Option<Duration> {
        (self.force_exit_timeout_secs > 0).then(|| Duration::from_secs(self.force_exit_timeout_secs))
    }

    /// Upper bound on worker threads a sync batch may hold at once
    pub fn thread_budget(&self) -> usize {
        self.effective_line_concurrency() * self.effective_node_concurrency()
    }
}

/// Clamp a requested node concurrency into `1..=MAX_NODE_CONCURRENCY`
pub fn clamp_concurrency(requested: usize) -> usize {
    requested.clamp(1, MAX_NODE_CONCURRENCY)
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env_var(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| FlowError::ConfigError {
                reason: format!("{} must be a non-negative integer, got '{}'", name, raw),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    fn clear_env() {
        for key in [
            "FLOWLINE_SCHEDULER",
            "FLOWLINE_NODE_CONCURRENCY",
            "FLOWLINE_LINE_CONCURRENCY",
            "FLOWLINE_LINE_TIMEOUT_SECS",
            "FLOWLINE_FORCE_EXIT_TIMEOUT_SECS",
            "FLOWLINE_ISOLATION",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_config_path_contains_flowline() {
        let path = EngineConfig::config_path();
        assert!(path.to_string_lossy().contains("flowline"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.scheduler, SchedulerMode::Sync);
        assert_eq!(config.node_concurrency, DEFAULT_NODE_CONCURRENCY);
        assert_eq!(config.force_exit_timeout(), Some(DEFAULT_FORCE_EXIT_TIMEOUT));
        assert!(config.line_timeout().is_none());
    }

    #[test]
    fn test_concurrency_clamp() {
        assert_eq!(clamp_concurrency(0), 1);
        assert_eq!(clamp_concurrency(4), 4);
        assert_eq!(clamp_concurrency(64), MAX_NODE_CONCURRENCY);

        let config = EngineConfig {
            node_concurrency: 100,
            line_concurrency: 3,
            ..Default::default()
        };
        assert_eq!(config.effective_node_concurrency(), MAX_NODE_CONCURRENCY);
        assert_eq!(config.thread_budget(), 3 * MAX_NODE_CONCURRENCY);
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = EngineConfig {
            scheduler: SchedulerMode::Async,
            line_timeout_secs: Some(90),
            isolation: Isolation::Process,
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "scheduler = \"async\"\nline_concurrency = 2\n").unwrap();

        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded.scheduler, SchedulerMode::Async);
        assert_eq!(loaded.line_concurrency, 2);
        assert_eq!(loaded.node_concurrency, DEFAULT_NODE_CONCURRENCY);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "scheduler = [").unwrap();

        let err = EngineConfig::load_from(&path).unwrap_err();
        assert_eq!(err.code(), "FLOW-140");
    }

    #[test]
    fn test_load_nonexistent_file_returns_default() {
        let dir = TempDir::new().unwrap();
        let loaded = EngineConfig::load_from(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(loaded, EngineConfig::default());
    }

    #[test]
    #[serial]
    fn test_env_overrides_config() {
        clear_env();
        env::set_var("FLOWLINE_SCHEDULER", "async");
        env::set_var("FLOWLINE_NODE_CONCURRENCY", "32");
        env::set_var("FLOWLINE_FORCE_EXIT_TIMEOUT_SECS", "0");
        env::set_var("FLOWLINE_LINE_TIMEOUT_SECS", "15");

        let config = EngineConfig::default().with_env().unwrap();
        clear_env();

        assert_eq!(config.scheduler, SchedulerMode::Async);
        assert_eq!(config.node_concurrency, 32);
        assert_eq!(config.effective_node_concurrency(), MAX_NODE_CONCURRENCY);
        assert_eq!(config.force_exit_timeout(), None);
        assert_eq!(config.line_timeout(), Some(Duration::from_secs(15)));
    }

    #[test]
    #[serial]
    fn test_env_does_not_override_with_empty() {
        clear_env();
        env::set_var("FLOWLINE_LINE_CONCURRENCY", "  ");

        let config = EngineConfig::default().with_env().unwrap();
        clear_env();

        assert_eq!(config.line_concurrency, DEFAULT_LINE_CONCURRENCY);
    }

    #[test]
    #[serial]
    fn test_env_rejects_garbage() {
        clear_env();
        env::set_var("FLOWLINE_NODE_CONCURRENCY", "many");

        let result = EngineConfig::default().with_env();
        clear_env();

        assert!(result.is_err());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("Async".parse::<SchedulerMode>().unwrap(), SchedulerMode::Async);
        assert_eq!("threads".parse::<SchedulerMode>().unwrap(), SchedulerMode::Sync);
        assert!("fibers".parse::<SchedulerMode>().is_err());
        assert_eq!("process".parse::<Isolation>().unwrap(), Isolation::Process);
    }
}
