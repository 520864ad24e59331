//! Packet-level types: connection ids, received datagrams, header parsing
//! and the stateless datagrams the dispatcher can emit.
//!
//! # Modules
//!
//! - [`header`]: long/short header parsing and QUIC versions
//! - [`varint`]: RFC 9000 variable-length integers
//! - [`builder`]: version negotiation, stateless close and stateless reset

pub mod builder;
pub mod header;
pub mod varint;

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;

pub use builder::{
    build_stateless_close, build_stateless_reset, build_version_negotiation, CloseReason,
    MIN_STATELESS_RESET_SIZE,
};
pub use header::{HeaderForm, PacketHeader, PacketType, QuicVersion};

/// Maximum connection id length for QUIC v1/v2.
pub const MAX_CONNECTION_ID_LEN: usize = 20;

/// Opaque connection identifier used as the routing key.
///
/// Cloning is cheap: the bytes are reference counted and usually point
/// into the datagram they were parsed from.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Bytes);

impl ConnectionId {
    /// Create a connection id from raw bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Create a connection id by copying a slice.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }

    /// Create an 8-byte connection id from a number (tests, demos).
    #[must_use]
    pub fn from_u64(value: u64) -> Self {
        Self::from_slice(&value.to_be_bytes())
    }

    /// Raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this is the zero-length connection id.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({self})")
    }
}

impl AsRef<[u8]> for ConnectionId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A datagram as it came off the socket.
///
/// Immutable once received. Ownership moves to whichever component keeps
/// it: the buffered packet store, a pending validation, or the session.
#[derive(Debug, Clone)]
pub struct ReceivedDatagram {
    /// Local address the datagram arrived on
    pub self_addr: SocketAddr,
    /// Remote address of the sender
    pub peer_addr: SocketAddr,
    /// Receive timestamp
    pub received_at: Instant,
    /// Raw UDP payload
    pub payload: Bytes,
}

impl ReceivedDatagram {
    /// Create a new received datagram.
    pub fn new(
        self_addr: SocketAddr,
        peer_addr: SocketAddr,
        received_at: Instant,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            self_addr,
            peer_addr,
            received_at,
            payload: payload.into(),
        }
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
