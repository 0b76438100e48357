//! # Observability
//!
//! Centralized tracing setup for the cache client workspace.
//!
//! Libraries in this workspace are **log producers**: they only use the
//! `tracing` macros. The embedding application calls [`init`] or
//! [`init_with_config`] once at startup and decides where the output goes.
//!
//! ## Formats
//!
//! - `Compact` (default): human-readable lines on stderr
//! - `Json`: one JSON object per line, to stderr or to `log_path`
//!
//! `RUST_LOG` always overrides `default_level`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "cache-client".into(),
//!     default_level: "debug".into(),
//!     format: observability::LogFormat::Json,
//!     ..Default::default()
//! });
//! ```

mod file;
mod json_layer;

use std::io;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub use file::{FileWriterFactory, LogFileWriter};
pub use json_layer::{JsonLayer, LogEntry};

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    /// Parse a format name, falling back to `Compact`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" | "jsonl" => Self::Json,
            _ => Self::Compact,
        }
    }
}

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, written into every JSON line.
    pub service_name: String,

    /// Default level filter (e.g., "debug", "info", "warn").
    /// Can be overridden by `RUST_LOG`.
    pub default_level: String,

    /// Output format.
    pub format: LogFormat,

    /// Append JSON lines to this file instead of stderr.
    pub log_path: Option<PathBuf>,

    /// When writing to a file, also print compact lines on stderr.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            format: LogFormat::Compact,
            log_path: None,
            also_stderr: false,
        }
    }
}

/// Initialize with default settings.
pub fn init(service_name: &str) -> bool {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    })
}

/// Initialize with custom configuration.
///
/// Returns `false` when a global subscriber was already installed, in which
/// case the existing one is left alone.
pub fn init_with_config(config: LogConfig) -> bool {
    let filter = env_filter(&config.default_level);

    if let Some(path) = &config.log_path {
        let writer = match LogFileWriter::open(path) {
            Ok(writer) => writer,
            Err(e) => {
                eprintln!("failed to open log file {}: {}", path.display(), e);
                return false;
            }
        };
        let json_layer = JsonLayer::new(config.service_name.clone(), FileWriterFactory::new(writer));
        let stderr_layer = config.also_stderr.then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .compact()
                .with_writer(io::stderr)
                .with_filter(env_filter(&config.default_level))
        });
        let installed = tracing_subscriber::registry()
            .with(json_layer.with_filter(filter))
            .with(stderr_layer)
            .try_init()
            .is_ok();
        if installed {
            tracing::info!(log_path = %path.display(), "observability initialized");
        }
        return installed;
    }

    match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(JsonLayer::new(config.service_name.clone(), io::stderr).with_filter(filter))
            .try_init()
            .is_ok(),
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(io::stderr)
            .compact()
            .try_init()
            .is_ok(),
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

/// Re-export Level for advanced filtering.
pub use tracing::Level;
