//! Connection dispatcher
//!
//! The [`Router`] is the server's front door: every datagram received on
//! the listening socket goes through [`Router::on_datagram`], which decides
//! its fate:
//!
//! ```text
//!                      ┌─────────────────────────────┐
//!   datagram ────────▶ │ parse header, source checks │──▶ Dropped
//!                      └──────────────┬──────────────┘
//!                                     │ connection id
//!        ┌────────────────┬───────────┴───────┬──────────────────┐
//!        ▼                ▼                   ▼                  ▼
//!   session table    time-wait          buffered store        unknown id
//!   Delivered        TimeWait           Buffered              version negotiation,
//!                                                             stateless reset, or
//!                                                             handshake ──▶ validator
//!                                                                            │
//!                                            accept: SessionCreated ◀────────┤
//!                                            reject: Rejected (+ time-wait) ◀┘
//! ```
//!
//! An id is a member of at most one of the session table, the buffered
//! store and the time-wait registry at any time.
//!
//! # Modules
//!
//! - [`router`]: the orchestrator
//! - [`buffered_store`]: datagrams for ids without a session
//! - [`time_wait`]: recently terminated ids
//! - [`reset_limit`]: one stateless reset per peer per window
//! - [`write_blocked`]: sessions waiting for the socket
//! - [`validator`]: proof validation adapter
//! - [`session`]: session collaborator interfaces
//! - [`writer`]: packet writer interface
//! - [`events`]: cross-stack notifications
//! - [`stats`]: counters

pub mod buffered_store;
pub mod events;
pub mod reset_limit;
pub mod router;
pub mod session;
pub mod stats;
pub mod time_wait;
pub mod validator;
pub mod write_blocked;
pub mod writer;

use serde::{Deserialize, Serialize};

pub use buffered_store::{
    BufferOutcome, BufferedEntry, BufferedPacketStore, BufferedStoreConfig, EntryState,
    PacketContext, ReadyHandshake, RefusalReason,
};
pub use events::{DispatcherEvents, SessionEvent};
pub use reset_limit::{RecentResets, ResetLimitConfig};
pub use router::{Router, RouterConfig};
pub use session::{
    Session, SessionContext, SessionFactory, SessionKey, SessionNotifier, WriteStatus,
};
pub use stats::{DispatcherStats, DroppedSnapshot, StatsSnapshot};
pub use time_wait::{
    EntryPhase, TimeWaitAction, TimeWaitConfig, TimeWaitRegistry, TimeWaitResponse,
};
pub use validator::{
    AcceptAll, Acceptance, HmacProofSigner, ProofSigner, ProofValidator, SigningValidator,
    ValidationRequest, ValidationToken, Verdict,
};
pub use write_blocked::{ServiceStep, WriteBlockedList};
pub use writer::{PacketWriter, WriteResult};

/// UDP source ports of services known to be abused for reflection.
///
/// Datagrams from these ports are dropped before any processing.
pub const BLOCKED_SOURCE_PORTS: [u16; 16] = [
    0,     // reserved
    17,    // quote of the day
    19,    // chargen
    53,    // DNS
    111,   // portmap
    123,   // NTP
    137,   // NetBIOS name service
    138,   // NetBIOS datagram service
    161,   // SNMP
    389,   // CLDAP
    500,   // IKE
    1900,  // SSDP
    3702,  // WS-Discovery
    5353,  // mDNS
    5355,  // LLMNR
    11211, // memcached
];

/// Whether datagrams from `port` are dropped unconditionally.
#[must_use]
pub fn is_blocked_source_port(port: u16) -> bool {
    BLOCKED_SOURCE_PORTS.contains(&port)
}

/// Why a datagram was dropped without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Not a QUIC packet a server can handle
    Unparseable,
    /// Source port known for reflection attacks
    BlockedSourcePort,
    /// Long header with a destination id shorter than 8 bytes
    ShortConnectionId,
    /// Too small to be a client Initial or to warrant a reply
    TooSmall,
    /// Buffered store refused the datagram
    BufferFull,
    /// Another Initial for an id whose handshake is already complete
    DuplicateHandshake,
    /// Initial packet protection could not be removed
    Undecryptable,
    /// Short header for an unknown id, too small for a stateless reset
    UnknownConnection,
    /// Short header for an unknown id from a peer reset recently
    ResetLimited,
    /// New connections are not being accepted
    NotAccepting,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unparseable => "unparseable",
            Self::BlockedSourcePort => "blocked source port",
            Self::ShortConnectionId => "short connection id",
            Self::TooSmall => "too small",
            Self::BufferFull => "buffer full",
            Self::DuplicateHandshake => "duplicate handshake",
            Self::Undecryptable => "undecryptable",
            Self::UnknownConnection => "unknown connection",
            Self::ResetLimited => "reset limited",
            Self::NotAccepting => "not accepting",
        };
        f.write_str(s)
    }
}

/// Fate of one datagram handed to [`Router::on_datagram`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Routed to an existing session
    Delivered,
    /// Completed a handshake that was accepted; a session now exists
    SessionCreated,
    /// Queued in the buffered store
    Buffered,
    /// Completed a handshake whose validation is in flight
    ValidationPending,
    /// Attempt refused with a stateless close; id moved to time-wait
    Rejected,
    /// Answered with version negotiation
    VersionNegotiation,
    /// Answered with a stateless reset
    StatelessReset,
    /// Handled by the time-wait registry
    TimeWait {
        /// Whether anything was sent back
        responded: bool,
    },
    /// Dropped silently
    Dropped(DropReason),
}

/// Which table currently holds a connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    /// Not known to the dispatcher
    None,
    /// Active session
    Session,
    /// Buffered store entry
    Buffered,
    /// Time-wait registry entry
    TimeWait,
}
