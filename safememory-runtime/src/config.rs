//! Runtime Configuration
//!
//! Configuration for heaps and runtime logging. It can be set
//! programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `SAFEMEMORY_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `SAFEMEMORY_EARLY_DETECTION` | Track zombie spans for raw-pointer checks ("true"/"false") | true |
//! | `SAFEMEMORY_ZOMBIE_WARN_BYTES` | Warn once zombie memory exceeds this many bytes (0 = never) | 67108864 (64MB) |
//! | `SAFEMEMORY_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | warn |
//! | `SAFEMEMORY_LOG_TIMESTAMPS` | Include timestamps in log output | true |
//! | `SAFEMEMORY_LOG_TARGETS` | Include the event target in log output | false |
//!
//! # Example
//!
//! ```rust
//! use safememory_runtime::config::{LogLevel, RuntimeConfig};
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .early_detection(false)
//!     .log_level(LogLevel::Debug)
//!     .build()
//!     .unwrap();
//! assert!(!config.zombie.early_detection);
//! ```

use std::env;

use thiserror::Error;

/// Smallest non-zero zombie warning threshold.
pub const MIN_ZOMBIE_WARN_BYTES: usize = 4096;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors (default).
    #[default]
    Warn,
    /// Informational messages.
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation.
    ///
    /// The result is also a valid `EnvFilter` directive.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Zombie allocator configuration.
#[derive(Debug, Clone)]
pub struct ZombieConfig {
    /// Record every zombie block's address span so raw pointers can be
    /// classified by [`Heap::dezombiefy`](crate::alloc::Heap::dezombiefy).
    /// Default: true.
    pub early_detection: bool,

    /// Emit a warning the first time outstanding zombie memory exceeds this
    /// many bytes since the last reap.
    /// 0 disables the warning. Default: 64MB.
    pub warn_bytes: usize,
}

impl Default for ZombieConfig {
    fn default() -> Self {
        Self {
            early_detection: true,
            warn_bytes: 64 * 1024 * 1024, // 64 MB
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level.
    /// Default: Warn.
    pub level: LogLevel,

    /// Include timestamps in log output.
    /// Default: true.
    pub timestamps: bool,

    /// Include source location in log output.
    /// Default: false (only in debug builds).
    pub source_location: bool,

    /// Include the event target (module path) in log output.
    /// Default: false.
    pub targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Warn,
            timestamps: true,
            source_location: cfg!(debug_assertions),
            targets: false,
        }
    }
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Zombie allocator configuration.
    pub zombie: ZombieConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables that are not set, or that fail to parse, keep
    /// their default values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_bool("SAFEMEMORY_EARLY_DETECTION") {
            config.zombie.early_detection = val;
        }

        if let Some(val) = parse_env_usize("SAFEMEMORY_ZOMBIE_WARN_BYTES") {
            if val == 0 || val >= MIN_ZOMBIE_WARN_BYTES {
                config.zombie.warn_bytes = val;
            }
        }

        if let Ok(val) = env::var("SAFEMEMORY_LOG_LEVEL") {
            if let Some(level) = LogLevel::from_str(&val) {
                config.log.level = level;
            }
        }

        if let Some(val) = parse_env_bool("SAFEMEMORY_LOG_TIMESTAMPS") {
            config.log.timestamps = val;
        }

        if let Some(val) = parse_env_bool("SAFEMEMORY_LOG_TARGETS") {
            config.log.targets = val;
        }

        config
    }

    /// Load configuration from environment variables, rejecting malformed values.
    ///
    /// Unlike [`from_env`](Self::from_env), a variable that is set but cannot
    /// be parsed is an error, and the result is validated.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = env_var("SAFEMEMORY_EARLY_DETECTION") {
            config.zombie.early_detection =
                parse_bool(&raw).ok_or_else(|| env_error("SAFEMEMORY_EARLY_DETECTION", "expected a boolean"))?;
        }

        if let Some(raw) = env_var("SAFEMEMORY_ZOMBIE_WARN_BYTES") {
            config.zombie.warn_bytes = raw
                .trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| env_error("SAFEMEMORY_ZOMBIE_WARN_BYTES", &e.to_string()))?;
        }

        if let Some(raw) = env_var("SAFEMEMORY_LOG_LEVEL") {
            config.log.level =
                LogLevel::from_str(&raw).ok_or_else(|| env_error("SAFEMEMORY_LOG_LEVEL", "unknown log level"))?;
        }

        if let Some(raw) = env_var("SAFEMEMORY_LOG_TIMESTAMPS") {
            config.log.timestamps =
                parse_bool(&raw).ok_or_else(|| env_error("SAFEMEMORY_LOG_TIMESTAMPS", "expected a boolean"))?;
        }

        if let Some(raw) = env_var("SAFEMEMORY_LOG_TARGETS") {
            config.log.targets =
                parse_bool(&raw).ok_or_else(|| env_error("SAFEMEMORY_LOG_TARGETS", "expected a boolean"))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.zombie.warn_bytes != 0 && self.zombie.warn_bytes < MIN_ZOMBIE_WARN_BYTES {
            return Err(ConfigError::InvalidValue {
                field: "zombie.warn_bytes".into(),
                message: format!("must be 0 or at least {} bytes", MIN_ZOMBIE_WARN_BYTES),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParseError {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable early zombie detection.
    pub fn early_detection(mut self, enabled: bool) -> Self {
        self.config.zombie.early_detection = enabled;
        self
    }

    /// Set the zombie memory warning threshold in bytes (0 = never warn).
    pub fn zombie_warn_bytes(mut self, bytes: usize) -> Self {
        self.config.zombie.warn_bytes = bytes;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Enable or disable timestamps in log output.
    pub fn log_timestamps(mut self, enabled: bool) -> Self {
        self.config.log.timestamps = enabled;
        self
    }

    /// Enable or disable source locations in log output.
    pub fn log_source_location(mut self, enabled: bool) -> Self {
        self.config.log.source_location = enabled;
        self
    }

    /// Enable or disable event targets in log output.
    pub fn log_targets(mut self, enabled: bool) -> Self {
        self.config.log.targets = enabled;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    ///
    /// Use this only if you're certain the configuration is valid.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok()
}

fn env_error(var: &str, message: &str) -> ConfigError {
    ConfigError::EnvParseError {
        var: var.into(),
        message: message.into(),
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| parse_bool(&s))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
