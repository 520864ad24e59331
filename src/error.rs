//! Error types for quic-dispatcher
//!
//! Errors are grouped by subsystem. None of them ever escape the datagram
//! receive path: the router turns every failure into a [`DispatchOutcome`]
//! and logs it. They surface to callers only from configuration loading,
//! session construction and the event-loop driver.
//!
//! [`DispatchOutcome`]: crate::dispatcher::DispatchOutcome

use std::io;

use thiserror::Error;

/// Top-level error type for quic-dispatcher
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Packet header could not be parsed
    #[error("Header error: {0}")]
    Header(#[from] HeaderError),

    /// Initial packet protection failed
    #[error("Initial packet protection error: {0}")]
    Initial(#[from] InitialError),

    /// Opening handshake could not be extracted
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Session factory refused or failed to build a session
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DispatchError {
    /// Check if this error is recoverable (the next datagram may succeed)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Header(_) | Self::Initial(_) | Self::Handshake(_) => true,
            Self::Session(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionRefused
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, inconsistent limits)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without operator intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ValidationError(reason.into())
    }
}

/// QUIC packet header parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    /// Datagram is empty or shorter than the smallest valid header
    #[error("packet too short: {len} bytes")]
    TooShort { len: usize },

    /// The fixed bit (0x40) is clear
    #[error("fixed bit not set")]
    FixedBitClear,

    /// A version negotiation packet was sent to the server
    #[error("unexpected version negotiation packet")]
    VersionNegotiation,

    /// Connection id longer than the version permits
    #[error("connection id of {len} bytes exceeds maximum of {max}")]
    ConnectionIdTooLong { len: usize, max: usize },

    /// A length-prefixed field runs past the end of the datagram
    #[error("truncated header: {0}")]
    Truncated(&'static str),
}

/// Initial packet protection errors (RFC 9001)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InitialError {
    /// Packet too short to carry a protected payload
    #[error("packet too short")]
    PacketTooShort,

    /// Not an Initial packet
    #[error("not an Initial packet")]
    NotInitial,

    /// Version has no known Initial salt
    #[error("unsupported QUIC version: 0x{0:08x}")]
    UnsupportedVersion(u32),

    /// Header could not be parsed
    #[error("header parse error: {0}")]
    HeaderParse(&'static str),

    /// HKDF expansion failed
    #[error("key derivation failed")]
    KeyDerivation,

    /// Header protection could not be applied or removed
    #[error("header protection failed")]
    HeaderProtection,

    /// AEAD tag mismatch
    #[error("AEAD decryption failed")]
    DecryptionFailed,

    /// AEAD sealing failed
    #[error("AEAD encryption failed")]
    EncryptionFailed,
}

/// Opening-handshake extraction errors
///
/// Any of these is fatal for the connection attempt: the router rejects the
/// connection id and seeds the time-wait registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// First CRYPTO message is not a ClientHello
    #[error("unexpected handshake message type {0}")]
    NotClientHello(u8),

    /// ClientHello exceeds the reassembly limit
    #[error("ClientHello of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },

    /// Frame could not be decoded
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// ClientHello body could not be decoded
    #[error("malformed ClientHello: {0}")]
    MalformedClientHello(&'static str),
}

impl HandshakeError {
    /// QUIC transport error code carried in the stateless close
    ///
    /// Malformed handshakes map to `PROTOCOL_VIOLATION`; an unexpected
    /// message maps to the TLS `unexpected_message` alert (0x100 + 10).
    #[must_use]
    pub const fn transport_error_code(&self) -> u64 {
        match self {
            Self::NotClientHello(_) => 0x010a,
            Self::TooLarge { .. } => 0x0d,
            Self::MalformedFrame(_) => 0x07,
            Self::MalformedClientHello(_) => 0x0a,
        }
    }
}

/// Session factory errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// The factory refused the connection (policy, quota)
    #[error("session refused: {0}")]
    Refused(String),

    /// Session construction failed
    #[error("session creation failed: {0}")]
    CreateFailed(String),
}

impl SessionError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Refused(_) => false,
            Self::CreateFailed(_) => true,
        }
    }

    /// Create a refused error
    pub fn refused(reason: impl Into<String>) -> Self {
        Self::Refused(reason.into())
    }

    /// Create a creation failure
    pub fn create_failed(reason: impl Into<String>) -> Self {
        Self::CreateFailed(reason.into())
    }
}

/// Type alias for Result with `DispatchError`
pub type Result<T> = std::result::Result<T, DispatchError>;
