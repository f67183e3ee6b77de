//! Logger setup for the host binary.
use std::str::FromStr;

use engine_logging::LogDestination;
use log::LevelFilter;

use crate::config::AppConfig;

/// Installs the global logger described by `config`. Unknown level names fall back to info.
pub fn initialize(config: &AppConfig) -> LevelFilter {
    let level = LevelFilter::from_str(&config.log_level).unwrap_or_else(|_| {
        eprintln!(
            "Warning: unknown log level {:?}, using info",
            config.log_level
        );
        LevelFilter::Info
    });
    let destination = match &config.log_to_file {
        Some(path) => LogDestination::Both(path.clone()),
        None => LogDestination::Terminal,
    };
    if !engine_logging::initialize(level, destination) {
        eprintln!("Warning: logger was not installed");
    }
    level
}
