//! Engine configuration
//!
//! Configuration is read from an optional TOML file, then environment
//! variables prefixed with `DIAGNOSTICS_` override individual values. Every
//! section has defaults, so an empty or missing file is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::mode::DiagnosticMode;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub events: EventsConfig,
    pub executor: ExecutorConfig,
    pub mode: ModeConfig,
    pub logging: LoggingConfig,
}

/// Ordering rule for concurrent stores of the same cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOrdering {
    /// Last completed computation wins
    #[default]
    CompletionOrder,
    /// A store never replaces a result computed for a newer solution version
    MonotonicVersion,
}

impl FromStr for StoreOrdering {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "completion_order" | "completion" => Ok(StoreOrdering::CompletionOrder),
            "monotonic_version" | "monotonic" => Ok(StoreOrdering::MonotonicVersion),
            other => Err(format!("unknown store ordering '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub store_ordering: StoreOrdering,
    /// Reference sets whose skipped-analyzer info is kept
    pub skipped_analyzers_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            store_ordering: StoreOrdering::CompletionOrder,
            skipped_analyzers_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Bound of the event queue; publishers wait when it is full
    pub queue_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Fail the request when an analyzer reports outside its contract,
    /// instead of dropping or clamping the offending diagnostic
    pub fail_fast_on_contract_violation: bool,
    /// Run the compiler analyzer in its own driver invocation
    pub isolate_compiler_analyzer: bool,
    /// Report AD0001 / AD0002 diagnostics for analyzer failures
    pub report_analyzer_exceptions: bool,
    /// Widen semantic spans for the compiler analyzer to whole members
    pub widen_compiler_spans: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            fail_fast_on_contract_violation: cfg!(debug_assertions),
            isolate_compiler_analyzer: true,
            report_analyzer_exceptions: true,
            widen_compiler_spans: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    pub default_mode: DiagnosticMode,
    /// Override for document diagnostics
    pub document: Option<DiagnosticMode>,
    /// Override for project and workspace diagnostics
    pub workspace: Option<DiagnosticMode>,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            default_mode: DiagnosticMode::Push,
            document: None,
            workspace: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `diagnostic_engine=debug`
    pub level: String,
    /// Write log lines to stderr
    pub stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            stderr: false,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path:?}"))?;
        let config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {path:?}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, apply environment overrides and validate
    pub fn load_with_env(path: &Path) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `DIAGNOSTICS_*` environment variables. Unparseable values are
    /// logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("DIAGNOSTICS_EVENT_QUEUE_CAPACITY") {
            match val.parse::<usize>() {
                Ok(capacity) => self.events.queue_capacity = capacity,
                Err(e) => warn!("Ignoring DIAGNOSTICS_EVENT_QUEUE_CAPACITY={}: {}", val, e),
            }
        }
        if let Ok(val) = env::var("DIAGNOSTICS_DIAGNOSTIC_MODE") {
            match val.parse::<DiagnosticMode>() {
                Ok(mode) => self.mode.default_mode = mode,
                Err(e) => warn!("Ignoring DIAGNOSTICS_DIAGNOSTIC_MODE: {}", e),
            }
        }
        if let Ok(val) = env::var("DIAGNOSTICS_FAIL_FAST") {
            self.executor.fail_fast_on_contract_violation =
                val == "1" || val.eq_ignore_ascii_case("true");
        }
        if let Ok(val) = env::var("DIAGNOSTICS_STORE_ORDERING") {
            match val.parse::<StoreOrdering>() {
                Ok(ordering) => self.cache.store_ordering = ordering,
                Err(e) => warn!("Ignoring DIAGNOSTICS_STORE_ORDERING: {}", e),
            }
        }
        if let Ok(val) = env::var("DIAGNOSTICS_LOG_LEVEL") {
            self.logging.level = val;
            self.logging.stderr = true;
        }
    }

    pub fn validate(&self) -> std::result::Result<(), EngineError> {
        if self.events.queue_capacity == 0 {
            return Err(EngineError::config("events.queue_capacity must be greater than zero"));
        }
        if self.cache.skipped_analyzers_capacity == 0 {
            return Err(EngineError::config(
                "cache.skipped_analyzers_capacity must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = EngineConfig::load(Path::new("/definitely/not/here.toml")).unwrap();
        assert_eq!(config.events.queue_capacity, 1024);
        assert_eq!(config.cache.store_ordering, StoreOrdering::CompletionOrder);
        assert_eq!(config.mode.default_mode, DiagnosticMode::Push);
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() -> anyhow::Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(
            file,
            r#"
[events]
queue_capacity = 8

[mode]
default_mode = "pull"
workspace = "push"

[cache]
store_ordering = "monotonic_version"
"#
        )?;

        let config = EngineConfig::load(file.path())?;
        assert_eq!(config.events.queue_capacity, 8);
        assert_eq!(config.mode.default_mode, DiagnosticMode::Pull);
        assert_eq!(config.mode.workspace, Some(DiagnosticMode::Push));
        assert_eq!(config.cache.store_ordering, StoreOrdering::MonotonicVersion);
        assert_eq!(config.cache.skipped_analyzers_capacity, 256);
        assert!(config.executor.isolate_compiler_analyzer);
        Ok(())
    }

    #[test]
    fn test_zero_capacity_is_rejected() -> anyhow::Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "[events]\nqueue_capacity = 0")?;
        assert!(EngineConfig::load(file.path()).is_err());
        Ok(())
    }

    #[test]
    fn test_invalid_toml_is_an_error() -> anyhow::Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "this is = = not toml")?;
        assert!(EngineConfig::load(file.path()).is_err());
        Ok(())
    }
}
