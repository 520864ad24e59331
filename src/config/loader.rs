//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::DispatcherConfig;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<DispatcherConfig, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: DispatcherConfig = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: listen={}, buffer.max_connections={}, time_wait.retention={}s",
        config.listen.address, config.buffer.max_connections, config.time_wait.retention_secs
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<DispatcherConfig, ConfigError> {
    let config: DispatcherConfig =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `QUIC_DISPATCHER_LISTEN_ADDR`: Override listen address
/// - `QUIC_DISPATCHER_LOG_LEVEL`: Override log level
/// - `QUIC_DISPATCHER_MAX_SESSIONS_PER_DRIVE`: Override sessions created per drive
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing or an override fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<DispatcherConfig, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;

    // Re-validate after overrides
    config.validate()?;

    Ok(config)
}

fn apply_env_overrides(
    config: &mut DispatcherConfig,
    var: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(addr) = var("QUIC_DISPATCHER_LISTEN_ADDR") {
        config.listen.address = addr.parse().map_err(|_| ConfigError::EnvError {
            name: "QUIC_DISPATCHER_LISTEN_ADDR".into(),
            reason: format!("Invalid socket address: {addr}"),
        })?;
        debug!("Listen address overridden to {}", config.listen.address);
    }

    if let Some(level) = var("QUIC_DISPATCHER_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(max) = var("QUIC_DISPATCHER_MAX_SESSIONS_PER_DRIVE") {
        config.dispatch.max_sessions_per_drive =
            max.parse().map_err(|_| ConfigError::EnvError {
                name: "QUIC_DISPATCHER_MAX_SESSIONS_PER_DRIVE".into(),
                reason: format!("Invalid number: {max}"),
            })?;
        debug!(
            "Max sessions per drive overridden to {}",
            config.dispatch.max_sessions_per_drive
        );
    }

    Ok(())
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = DispatcherConfig::default();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
