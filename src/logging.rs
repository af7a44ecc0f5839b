//! Structured logging setup and span helpers.
//!
//! Supports JSON and pretty output, level selection via CLI flags with a
//! settings-file fallback, and context spans for macro runs and transport
//! connections.

use tracing::{info_span, Span};
use tracing_subscriber::{fmt::time::ChronoLocal, EnvFilter};

use crate::config::Settings;
use crate::types::Result;

/// Span wrapping one macro invocation.
pub fn macro_span(macro_name: &str) -> Span {
    info_span!("macro_run", macro_name = macro_name)
}

/// Span wrapping one transport connection.
pub fn connection_span(peer: &str) -> Span {
    info_span!("connection", peer = peer)
}

/// Log level names accepted in configuration.
pub mod level {
    pub const TRACE: &str = "trace";
    pub const DEBUG: &str = "debug";
    pub const INFO: &str = "info";
    pub const WARN: &str = "warn";
    pub const ERROR: &str = "error";
}

/// Log format names accepted in configuration.
pub mod format {
    pub const JSON: &str = "json";
    pub const PRETTY: &str = "pretty";
}

/// Initialize the global subscriber.
///
/// Precedence: CLI overrides, then the settings file, then defaults. An
/// explicit `RUST_LOG` environment filter beats the computed level.
pub fn init(
    log_level_override: Option<&str>,
    log_format_override: Option<&str>,
    settings: Option<&Settings>,
) -> Result<()> {
    let log_level = if let Some(level) = log_level_override {
        level
    } else if let Some(settings) = settings {
        &settings.logging.level
    } else {
        level::INFO
    };

    let log_format = if let Some(fmt) = log_format_override {
        fmt
    } else if let Some(settings) = settings {
        &settings.logging.format
    } else {
        format::PRETTY
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string());

    match log_format {
        format::JSON => {
            tracing_subscriber::fmt()
                .json()
                .with_timer(timer)
                .with_env_filter(env_filter)
                .with_target(false)
                .with_current_span(true)
                .with_span_list(false)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_timer(timer)
                .with_env_filter(env_filter)
                .with_target(false)
                .with_file(false)
                .with_line_number(false)
                .init();
        }
    }

    Ok(())
}
