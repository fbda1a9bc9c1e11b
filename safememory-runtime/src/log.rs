//! Logging Infrastructure
//!
//! The runtime reports through [`tracing`] events; this module installs a
//! `tracing-subscriber` formatter for applications that do not bring their
//! own subscriber.
//!
//! # Events
//!
//! | Level | Event |
//! |-------|-------|
//! | `warn` | outstanding zombie memory crossed the configured threshold |
//! | `warn` | a heap was dropped while blocks were still live (leaked references) |
//! | `debug` | a control block grew its overflow slot table |
//! | `debug` | zombie blocks were reaped |
//! | `trace` | an owner invalidated its soft references |
//!
//! # Filtering
//!
//! When the `SAFEMEMORY_LOG` variable holds an `EnvFilter` directive string
//! (for example `safememory_runtime::control_block=debug`) it takes
//! precedence over the configured level.
//!
//! # Example
//!
//! ```rust
//! use safememory_runtime::{config::LogConfig, log};
//!
//! let _installed = log::init(&LogConfig::default());
//! ```

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Environment variable holding a full filter directive.
pub const FILTER_ENV: &str = "SAFEMEMORY_LOG";

/// Build the filter for `config`, preferring a directive from [`FILTER_ENV`].
pub fn filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(config.level.as_str()))
}

/// Install a global formatting subscriber.
///
/// Returns `false` if a global subscriber was already installed, in which
/// case that subscriber keeps receiving the runtime's events.
pub fn init(config: &LogConfig) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(config))
        .with_target(config.targets)
        .with_file(config.source_location)
        .with_line_number(config.source_location);

    let installed = if config.timestamps {
        builder.try_init().is_ok()
    } else {
        builder.without_time().try_init().is_ok()
    };

    if installed {
        tracing::debug!(level = config.level.as_str(), "safememory logging initialized");
    }
    installed
}
