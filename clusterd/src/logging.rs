//! tracing subscriber setup

use eyre::{Result, eyre};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::sink::OutputSink;

/// Parse a level name; unknown names fall back to INFO with a warning on stderr
pub fn parse_level(level: Option<&str>) -> tracing::Level {
    let Some(s) = level else {
        return tracing::Level::INFO;
    };
    match s.to_uppercase().as_str() {
        "TRACE" => tracing::Level::TRACE,
        "DEBUG" => tracing::Level::DEBUG,
        "INFO" => tracing::Level::INFO,
        "WARN" | "WARNING" => tracing::Level::WARN,
        "ERROR" => tracing::Level::ERROR,
        _ => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
            tracing::Level::INFO
        }
    }
}

/// Install the global subscriber
///
/// Level priority: CLI `--log-level` > config `log-level` > INFO. With a sink
/// (silent mode) everything is written there without ANSI colors, otherwise
/// to stderr.
pub fn init(cli_level: Option<&str>, config_level: Option<&str>, sink: Option<OutputSink>) -> Result<()> {
    let level = parse_level(cli_level.or(config_level));
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    let silent = sink.is_some();

    let result = match sink {
        Some(sink) => tracing_subscriber::fmt()
            .with_writer(sink)
            .with_ansi(false)
            .with_env_filter(filter)
            .try_init(),
        None => tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .try_init(),
    };
    result.map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

    info!("Logging initialized (level: {:?})", level);
    debug!(silent, "logging::init: done");
    Ok(())
}
