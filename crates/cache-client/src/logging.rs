//! Logging initialization for applications embedding the cache client.
//!
//! The client itself only emits `tracing` events. Call [`init_logging`] once
//! from `main` if nothing else installs a subscriber.

pub use observability::{LogConfig, LogFormat};

/// Initialize tracing through the observability package.
///
/// - Level from `RUST_LOG` or the provided default
/// - `CACHE_LOG_FORMAT=json` switches to JSON lines
/// - `CACHE_LOG_FILE` appends JSON lines to a file instead of stderr
///
/// Returns `false` if a subscriber was already installed.
///
/// ```ignore
/// cache_client::init_logging("debug");
/// tracing::info!("starting");
/// ```
pub fn init_logging(level: &str) -> bool {
    let format = std::env::var("CACHE_LOG_FORMAT")
        .map(|raw| LogFormat::parse(&raw))
        .unwrap_or_default();
    let log_path = std::env::var("CACHE_LOG_FILE")
        .ok()
        .filter(|raw| !raw.trim().is_empty())
        .map(Into::into);

    observability::init_with_config(LogConfig {
        service_name: "cache-client".into(),
        default_level: parse_level(level).to_string().to_lowercase(),
        format,
        log_path,
        also_stderr: false,
    })
}

/// Parse a log level string into a tracing Level.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}
