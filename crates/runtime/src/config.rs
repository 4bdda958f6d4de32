//! Configuration management for the codebox runtime
//!
//! Defaults are usable as-is against a local Docker daemon. A TOML file can
//! replace any section, and a small set of environment variables override the
//! values an operator typically changes per deployment.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use thiserror::Error;

use crate::types::DEFAULT_MAX_SOURCE_CHARS;

/// Largest accepted `sandbox.memory_mb` (1 TiB)
pub const MAX_MEMORY_MB: u64 = 1024 * 1024;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("IO error reading config file: {message}")]
    IoError { message: String },

    #[error("Configuration parsing error: {message}")]
    ParseError { message: String },
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub sandbox: SandboxConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

/// Execution engine connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Daemon endpoint (`unix://...` or `tcp://host:port`); local defaults when unset
    pub host: Option<String>,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Upper bound for every engine call except the image pull: ping,
    /// inspect, create, start, remove, extract and the exec calls
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// Upper bound for an image pull. A first pull of the toolchain image
    /// can take many minutes.
    #[serde(with = "humantime_serde")]
    pub pull_timeout: Duration,
    /// Base image providing the toolchain
    pub image: String,
}

/// Sandbox instance shape. Applied only when an instance is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Instances are named `<name_prefix>-<index>`
    pub name_prefix: String,
    pub pool_size: usize,
    pub memory_mb: u64,
    pub pids_limit: i64,
    /// Absolute path of the working directory inside the instance
    pub working_dir: String,
    /// Named volume holding the package cache, shared by all instances
    pub cache_volume: String,
    pub cache_mount: String,
    /// Idle command keeping the instance alive between submissions. It runs
    /// as PID 1, so it must reap orphaned children.
    pub keep_alive: Vec<String>,
}

/// Per-submission pipeline behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_source_chars: usize,
    #[serde(with = "humantime_serde")]
    pub probe_deadline: Duration,
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub restore_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub build_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub run_timeout: Duration,
    /// Retry a failed offline restore against the public package feed
    pub online_restore: bool,
    /// Captured output per command beyond this is dropped
    pub max_output_bytes: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: None,
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(120),
            pull_timeout: Duration::from_secs(30 * 60),
            image: "mcr.microsoft.com/dotnet/sdk:8.0".to_string(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            name_prefix: "codebox-sandbox".to_string(),
            pool_size: 1,
            memory_mb: 512,
            pids_limit: 256,
            working_dir: "/workspace".to_string(),
            cache_volume: "codebox-nuget-cache".to_string(),
            cache_mount: "/root/.nuget/packages".to_string(),
            keep_alive: vec![
                "sh".to_string(),
                "-c".to_string(),
                "trap 'exit 0' TERM; while :; do sleep 1; done".to_string(),
            ],
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_source_chars: DEFAULT_MAX_SOURCE_CHARS,
            probe_deadline: Duration::from_secs(30),
            probe_interval: Duration::from_millis(500),
            restore_timeout: Duration::from_secs(120),
            build_timeout: Duration::from_secs(120),
            run_timeout: Duration::from_secs(10),
            online_restore: false,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Accepts the usual spellings of a boolean flag
fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("'{}' is not a boolean", value),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("'{}' is not a valid number", value),
    })
}

impl Config {
    /// Load configuration from environment variables and defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a TOML file. Missing sections keep their defaults.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            message: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        Ok(config)
    }

    /// Override fields from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = env::var("CODEBOX_ENGINE_HOST") {
            if !host.trim().is_empty() {
                self.engine.host = Some(host.trim().to_string());
            }
        }

        if let Ok(image) = env::var("CODEBOX_IMAGE") {
            self.engine.image = image;
        }

        if let Ok(flag) = env::var("CODEBOX_ONLINE_RESTORE") {
            self.pipeline.online_restore = parse_flag("CODEBOX_ONLINE_RESTORE", &flag)?;
        }

        if let Ok(size) = env::var("CODEBOX_POOL_SIZE") {
            self.sandbox.pool_size = parse_number("CODEBOX_POOL_SIZE", &size)?;
        }

        if let Ok(limit) = env::var("CODEBOX_MAX_SOURCE_CHARS") {
            self.pipeline.max_source_chars = parse_number("CODEBOX_MAX_SOURCE_CHARS", &limit)?;
        }

        if let Ok(level) = env::var("LOG_LEVEL") {
            self.logging.level = level.to_ascii_lowercase();
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, reason: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        if self.engine.image.trim().is_empty() {
            return Err(invalid("engine.image", "Image cannot be empty"));
        }

        if self.sandbox.pool_size == 0 {
            return Err(invalid("sandbox.pool_size", "Pool size must be > 0"));
        }
        if self.sandbox.memory_mb == 0 {
            return Err(invalid("sandbox.memory_mb", "Memory limit must be > 0"));
        }
        if self.sandbox.memory_mb > MAX_MEMORY_MB {
            return Err(ConfigError::InvalidValue {
                key: "sandbox.memory_mb".to_string(),
                reason: format!("Memory limit must be <= {}", MAX_MEMORY_MB),
            });
        }
        if self.sandbox.pids_limit <= 0 {
            return Err(invalid("sandbox.pids_limit", "Process limit must be > 0"));
        }
        for (key, path) in [
            ("sandbox.working_dir", &self.sandbox.working_dir),
            ("sandbox.cache_mount", &self.sandbox.cache_mount),
        ] {
            if !path.starts_with('/') {
                return Err(invalid(key, "Must be an absolute path"));
            }
        }
        if self.sandbox.keep_alive.is_empty() {
            return Err(invalid("sandbox.keep_alive", "Keep-alive command cannot be empty"));
        }

        for (key, value) in [
            ("engine.call_timeout", self.engine.call_timeout),
            ("engine.pull_timeout", self.engine.pull_timeout),
            ("pipeline.probe_deadline", self.pipeline.probe_deadline),
            ("pipeline.probe_interval", self.pipeline.probe_interval),
            ("pipeline.restore_timeout", self.pipeline.restore_timeout),
            ("pipeline.build_timeout", self.pipeline.build_timeout),
            ("pipeline.run_timeout", self.pipeline.run_timeout),
        ] {
            if value.is_zero() {
                return Err(invalid(key, "Duration must be > 0"));
            }
        }

        if self.pipeline.max_source_chars == 0 {
            return Err(invalid("pipeline.max_source_chars", "Limit must be > 0"));
        }
        if self.pipeline.max_output_bytes == 0 {
            return Err(invalid("pipeline.max_output_bytes", "Limit must be > 0"));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "logging.level".to_string(),
                reason: format!("Must be one of: {}", valid_levels.join(", ")),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const ENV_KEYS: &[&str] = &[
        "CODEBOX_ENGINE_HOST",
        "CODEBOX_IMAGE",
        "CODEBOX_ONLINE_RESTORE",
        "CODEBOX_POOL_SIZE",
        "CODEBOX_MAX_SOURCE_CHARS",
        "LOG_LEVEL",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.max_source_chars, 200_000);
        assert!(!config.pipeline.online_restore);
        assert_eq!(config.sandbox.pool_size, 1);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        env::set_var("CODEBOX_ENGINE_HOST", "tcp://10.0.0.5:2375");
        env::set_var("CODEBOX_ONLINE_RESTORE", "yes");
        env::set_var("CODEBOX_POOL_SIZE", "4");
        env::set_var("LOG_LEVEL", "DEBUG");

        let config = Config::from_env().unwrap();
        assert_eq!(config.engine.host.as_deref(), Some("tcp://10.0.0.5:2375"));
        assert!(config.pipeline.online_restore);
        assert_eq!(config.sandbox.pool_size, 4);
        assert_eq!(config.logging.level, "debug");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_rejects_bad_values() {
        clear_env();
        env::set_var("CODEBOX_ONLINE_RESTORE", "maybe");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "CODEBOX_ONLINE_RESTORE"
        ));

        clear_env();
        env::set_var("CODEBOX_POOL_SIZE", "many");
        assert!(Config::from_env().is_err());

        clear_env();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[pipeline]
run_timeout = "3s"
online_restore = true

[sandbox]
memory_mb = 1024
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.pipeline.run_timeout, Duration::from_secs(3));
        assert!(config.pipeline.online_restore);
        assert_eq!(config.sandbox.memory_mb, 1024);
        assert_eq!(config.sandbox.pids_limit, 256);
        assert_eq!(config.engine.image, "mcr.microsoft.com/dotnet/sdk:8.0");
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            Config::from_file("/nonexistent/codebox.toml"),
            Err(ConfigError::IoError { .. })
        ));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.sandbox.pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sandbox.working_dir = "workspace".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.run_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.engine.pull_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_memory_limit_upper_bound() {
        let mut config = Config::default();
        config.sandbox.memory_mb = MAX_MEMORY_MB;
        assert!(config.validate().is_ok());

        config.sandbox.memory_mb = MAX_MEMORY_MB + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "sandbox.memory_mb"
        ));

        config.sandbox.memory_mb = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pull_timeout_is_separate_from_call_timeout() {
        let config = Config::default();
        assert!(config.engine.pull_timeout > config.engine.call_timeout);

        let config: Config = toml::from_str(
            r#"
[engine]
call_timeout = "30s"
pull_timeout = "45m"
"#,
        )
        .unwrap();
        assert_eq!(config.engine.call_timeout, Duration::from_secs(30));
        assert_eq!(config.engine.pull_timeout, Duration::from_secs(45 * 60));
    }
}
