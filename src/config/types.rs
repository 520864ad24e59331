//! Configuration types for quic-dispatcher
//!
//! This module defines all configuration structures used by the dispatcher.
//! Configuration is loaded from JSON files and validated at startup.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::ResetTokenGenerator;
use crate::dispatcher::{BufferedStoreConfig, ResetLimitConfig, RouterConfig, TimeWaitConfig};
use crate::error::ConfigError;
use crate::packet::{QuicVersion, MAX_CONNECTION_ID_LEN};

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DispatcherConfig {
    /// Listen configuration
    #[serde(default)]
    pub listen: ListenConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Buffered packet store limits
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Time-wait registry limits
    #[serde(default)]
    pub time_wait: TimeWaitSettings,

    /// Dispatch loop settings
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Proof validation backend
    #[serde(default)]
    pub validator: ValidatorConfig,
}

impl DispatcherConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log.validate()?;
        self.buffer.validate()?;
        self.time_wait.validate()?;
        self.dispatch.validate()?;
        self.validator.validate()?;
        Ok(())
    }

    /// Router settings derived from this configuration
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            max_sessions_per_drive: self.dispatch.max_sessions_per_drive,
            write_blocked_batch: self.dispatch.write_blocked_batch,
            connection_id_length: self.dispatch.connection_id_length,
            min_initial_size: self.dispatch.min_initial_size,
            supported_versions: self.dispatch.versions(),
            buffer: BufferedStoreConfig {
                max_connections: self.buffer.max_connections,
                max_connections_without_handshake: self.buffer.max_connections_without_handshake,
                max_packets_per_connection: self.buffer.max_packets_per_connection,
                idle_timeout: self.buffer.idle_timeout(),
            },
            time_wait: TimeWaitConfig {
                retention: self.time_wait.retention(),
                max_entries: self.time_wait.max_entries,
                response_budget: self.time_wait.response_budget,
            },
            reset_limit: ResetLimitConfig {
                max_addresses: self.dispatch.max_recent_reset_addresses,
                lifetime: self.dispatch.recent_reset_lifetime(),
            },
        }
    }

    /// Stateless reset token generator for the configured secret
    ///
    /// A random secret is generated when none is configured; tokens then
    /// change across restarts.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the secret is not valid hex.
    pub fn reset_token_generator(&self) -> Result<ResetTokenGenerator, ConfigError> {
        match &self.dispatch.stateless_reset_secret {
            Some(secret) => {
                let bytes = hex::decode(secret).map_err(|e| {
                    ConfigError::validation(format!("stateless_reset_secret is not hex: {e}"))
                })?;
                Ok(ResetTokenGenerator::new(bytes))
            }
            None => Ok(ResetTokenGenerator::random()),
        }
    }
}

/// Listen configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// UDP listen address (e.g., "0.0.0.0:443")
    #[serde(default = "default_listen_address")]
    pub address: SocketAddr,

    /// Receive buffer size per datagram
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            max_datagram_size: default_max_datagram_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.format.as_str(), "json" | "text") {
            return Err(ConfigError::validation(format!(
                "log.format must be \"json\" or \"text\", got \"{}\"",
                self.format
            )));
        }
        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

/// Buffered packet store limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BufferConfig {
    /// Maximum distinct buffered connection ids
    #[serde(default = "default_buffer_max_connections")]
    pub max_connections: usize,

    /// Maximum buffered ids still waiting for a complete handshake
    #[serde(default = "default_buffer_max_without_handshake")]
    pub max_connections_without_handshake: usize,

    /// Maximum datagrams buffered per id
    #[serde(default = "default_buffer_max_packets")]
    pub max_packets_per_connection: usize,

    /// Buffered entries are evicted this long after creation
    #[serde(default = "default_buffer_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl BufferConfig {
    /// Get idle timeout as Duration
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::validation(
                "buffer.max_connections must be greater than 0",
            ));
        }
        if self.max_connections_without_handshake > self.max_connections {
            return Err(ConfigError::validation(format!(
                "buffer.max_connections_without_handshake ({}) exceeds buffer.max_connections ({})",
                self.max_connections_without_handshake, self.max_connections
            )));
        }
        if self.max_packets_per_connection == 0 {
            return Err(ConfigError::validation(
                "buffer.max_packets_per_connection must be greater than 0",
            ));
        }
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::validation(
                "buffer.idle_timeout_ms must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_connections: default_buffer_max_connections(),
            max_connections_without_handshake: default_buffer_max_without_handshake(),
            max_packets_per_connection: default_buffer_max_packets(),
            idle_timeout_ms: default_buffer_idle_timeout_ms(),
        }
    }
}

/// Time-wait registry limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeWaitSettings {
    /// How long a terminated id is remembered
    #[serde(default = "default_time_wait_retention_secs")]
    pub retention_secs: u64,

    /// Maximum remembered ids
    #[serde(default = "default_time_wait_max_entries")]
    pub max_entries: usize,

    /// Maximum responses sent per remembered id
    #[serde(default = "default_time_wait_response_budget")]
    pub response_budget: u32,
}

impl TimeWaitSettings {
    /// Get retention as Duration
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.retention_secs == 0 {
            return Err(ConfigError::validation(
                "time_wait.retention_secs must be greater than 0",
            ));
        }
        if self.max_entries == 0 {
            return Err(ConfigError::validation(
                "time_wait.max_entries must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for TimeWaitSettings {
    fn default() -> Self {
        Self {
            retention_secs: default_time_wait_retention_secs(),
            max_entries: default_time_wait_max_entries(),
            response_budget: default_time_wait_response_budget(),
        }
    }
}

/// Dispatch loop settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Sessions created per drive of the buffered store
    #[serde(default = "default_max_sessions_per_drive")]
    pub max_sessions_per_drive: usize,

    /// Write-blocked sessions serviced per writable event
    #[serde(default = "default_write_blocked_batch")]
    pub write_blocked_batch: usize,

    /// Length of the connection ids carried in short headers
    #[serde(default = "default_connection_id_length")]
    pub connection_id_length: usize,

    /// Smallest client Initial datagram accepted
    #[serde(default = "default_min_initial_size")]
    pub min_initial_size: usize,

    /// Supported QUIC versions as wire values
    #[serde(default = "default_supported_versions")]
    pub supported_versions: Vec<u32>,

    /// Hex secret for stateless reset tokens (random if unset)
    #[serde(default)]
    pub stateless_reset_secret: Option<String>,

    /// Interval of the maintenance tick (expiry and drive) in milliseconds
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,

    /// Peers remembered after a stateless reset for an unknown id
    #[serde(default = "default_max_recent_reset_addresses")]
    pub max_recent_reset_addresses: usize,

    /// How long reset peers are remembered, in milliseconds
    #[serde(default = "default_recent_reset_lifetime_ms")]
    pub recent_reset_lifetime_ms: u64,
}

impl DispatchConfig {
    /// Supported versions as typed values
    #[must_use]
    pub fn versions(&self) -> Vec<QuicVersion> {
        self.supported_versions
            .iter()
            .map(|v| QuicVersion::from_u32(*v))
            .collect()
    }

    /// Get maintenance interval as Duration
    #[must_use]
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    /// Get the reset peer lifetime as Duration
    #[must_use]
    pub const fn recent_reset_lifetime(&self) -> Duration {
        Duration::from_millis(self.recent_reset_lifetime_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions_per_drive == 0 {
            return Err(ConfigError::validation(
                "dispatch.max_sessions_per_drive must be greater than 0",
            ));
        }
        if self.write_blocked_batch == 0 {
            return Err(ConfigError::validation(
                "dispatch.write_blocked_batch must be greater than 0",
            ));
        }
        if !(8..=MAX_CONNECTION_ID_LEN).contains(&self.connection_id_length) {
            return Err(ConfigError::validation(format!(
                "dispatch.connection_id_length must be between 8 and {MAX_CONNECTION_ID_LEN}"
            )));
        }
        if self.min_initial_size < 1200 {
            return Err(ConfigError::validation(
                "dispatch.min_initial_size must be at least 1200",
            ));
        }
        if self.supported_versions.is_empty() {
            return Err(ConfigError::validation(
                "dispatch.supported_versions must not be empty",
            ));
        }
        if let Some(version) = self.versions().into_iter().find(|v| !v.is_known()) {
            return Err(ConfigError::validation(format!(
                "dispatch.supported_versions contains unsupported version {version}"
            )));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(ConfigError::validation(
                "dispatch.maintenance_interval_ms must be greater than 0",
            ));
        }
        if self.max_recent_reset_addresses == 0 || self.recent_reset_lifetime_ms == 0 {
            return Err(ConfigError::validation(
                "dispatch.max_recent_reset_addresses and recent_reset_lifetime_ms must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_drive: default_max_sessions_per_drive(),
            write_blocked_batch: default_write_blocked_batch(),
            connection_id_length: default_connection_id_length(),
            min_initial_size: default_min_initial_size(),
            supported_versions: default_supported_versions(),
            stateless_reset_secret: None,
            maintenance_interval_ms: default_maintenance_interval_ms(),
            max_recent_reset_addresses: default_max_recent_reset_addresses(),
            recent_reset_lifetime_ms: default_recent_reset_lifetime_ms(),
        }
    }
}

/// Proof validation backend
///
/// Without a key every well-formed handshake is accepted. With a key,
/// proofs are HMAC-signed and attempts must offer one of `alpn` (if set).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ValidatorConfig {
    /// Hex HMAC key for signed proofs
    #[serde(default)]
    pub proof_key: Option<String>,

    /// Accepted ALPN protocols (empty accepts any)
    #[serde(default)]
    pub alpn: Vec<String>,
}

impl ValidatorConfig {
    /// Decoded proof key, if configured.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the key is not valid hex.
    pub fn proof_key_bytes(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        self.proof_key
            .as_deref()
            .map(|key| {
                hex::decode(key)
                    .map_err(|e| ConfigError::validation(format!("validator.proof_key is not hex: {e}")))
            })
            .transpose()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(key) = self.proof_key_bytes()? {
            if key.is_empty() {
                return Err(ConfigError::validation("validator.proof_key must not be empty"));
            }
        }
        Ok(())
    }
}

// Default value functions for serde
const fn default_true() -> bool {
    true
}

fn default_listen_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 4433))
}

const fn default_max_datagram_size() -> usize {
    1500
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

const fn default_buffer_max_connections() -> usize {
    100
}

const fn default_buffer_max_without_handshake() -> usize {
    50
}

const fn default_buffer_max_packets() -> usize {
    10
}

const fn default_buffer_idle_timeout_ms() -> u64 {
    5_000
}

const fn default_time_wait_retention_secs() -> u64 {
    200
}

const fn default_time_wait_max_entries() -> usize {
    10_000
}

const fn default_time_wait_response_budget() -> u32 {
    8
}

const fn default_max_sessions_per_drive() -> usize {
    16
}

const fn default_write_blocked_batch() -> usize {
    32
}

const fn default_connection_id_length() -> usize {
    8
}

const fn default_min_initial_size() -> usize {
    1200
}

fn default_supported_versions() -> Vec<u32> {
    vec![QuicVersion::V1.as_u32(), QuicVersion::V2.as_u32()]
}

const fn default_maintenance_interval_ms() -> u64 {
    100
}

const fn default_max_recent_reset_addresses() -> usize {
    1024
}

const fn default_recent_reset_lifetime_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = DispatcherConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_buffer_limits_validation() {
        let mut config = DispatcherConfig::default();
        config.buffer.max_connections_without_handshake = config.buffer.max_connections + 1;
        assert!(config.validate().is_err());

        let mut config = DispatcherConfig::default();
        config.buffer.max_packets_per_connection = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dispatch_validation() {
        let mut config = DispatcherConfig::default();
        config.dispatch.supported_versions = vec![0x1a2a_3a4a];
        assert!(config.validate().is_err());

        let mut config = DispatcherConfig::default();
        config.dispatch.connection_id_length = 4;
        assert!(config.validate().is_err());

        let mut config = DispatcherConfig::default();
        config.dispatch.min_initial_size = 1000;
        assert!(config.validate().is_err());

        let mut config = DispatcherConfig::default();
        config.dispatch.max_recent_reset_addresses = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_router_config_mapping() {
        let mut config = DispatcherConfig::default();
        config.buffer.idle_timeout_ms = 2500;
        config.time_wait.retention_secs = 30;
        config.dispatch.supported_versions = vec![1];

        let router = config.router_config();
        assert_eq!(router.buffer.idle_timeout, Duration::from_millis(2500));
        assert_eq!(router.time_wait.retention, Duration::from_secs(30));
        assert_eq!(router.reset_limit.max_addresses, 1024);
        assert_eq!(router.reset_limit.lifetime, Duration::from_secs(1));
        assert_eq!(router.supported_versions, vec![QuicVersion::V1]);
    }

    #[test]
    fn test_reset_secret() {
        let mut config = DispatcherConfig::default();
        config.dispatch.stateless_reset_secret = Some("00112233".into());
        let a = config.reset_token_generator().unwrap();
        let b = ResetTokenGenerator::new(vec![0x00, 0x11, 0x22, 0x33]);
        let cid = crate::packet::ConnectionId::from_u64(1);
        assert_eq!(a.token(&cid), b.token(&cid));

        config.dispatch.stateless_reset_secret = Some("not hex".into());
        assert!(config.reset_token_generator().is_err());
    }

    #[test]
    fn test_validator_key() {
        let mut config = DispatcherConfig::default();
        assert_eq!(config.validator.proof_key_bytes().unwrap(), None);

        config.validator.proof_key = Some("a0b1".into());
        assert_eq!(
            config.validator.proof_key_bytes().unwrap(),
            Some(vec![0xa0, 0xb1])
        );

        config.validator.proof_key = Some("xyz".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = DispatcherConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: DispatcherConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.listen.address, config.listen.address);
        assert_eq!(parsed.dispatch.supported_versions, vec![1, 0x6b33_43cf]);
    }
}
