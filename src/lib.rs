//! quic-dispatcher: server-side QUIC connection dispatcher
//!
//! This crate sits between a UDP socket and per-connection QUIC sessions.
//! It decides, for every incoming datagram, whether it belongs to a live
//! session, a recently terminated connection, or a new connection attempt,
//! and admits new connections only after their opening handshake has been
//! validated.
//!
//! # Features
//!
//! - **Header parsing**: QUIC v1/v2 long and short headers, version negotiation
//! - **Initial packet protection**: Removal of Initial keys to read the opening handshake
//! - **Buffered admission**: Bounded store for datagrams of ids without a session
//! - **Asynchronous validation**: Pluggable proof validator, sync or async
//! - **Time-wait**: Bounded memory of terminated ids with rate-limited replies
//! - **Write scheduling**: FIFO servicing of sessions blocked on the socket
//!
//! # Architecture
//!
//! ```text
//! UDP socket → server loop → Router ─┬─▶ Session (existing id)
//!                                    ├─▶ TimeWaitRegistry
//!                                    ├─▶ BufferedPacketStore ─▶ ProofValidator ─▶ SessionFactory
//!                                    └─▶ PacketWriter (version negotiation, resets, closes)
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use quic_dispatcher::config::load_config;
//! use quic_dispatcher::dispatcher::{AcceptAll, SessionFactory};
//! use quic_dispatcher::server::DispatchServer;
//!
//! # async fn example(factory: Box<dyn SessionFactory>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/quic-dispatcher/config.json")?;
//! let server = DispatchServer::bind(&config, Box::new(AcceptAll), factory).await?;
//! let shutdown = server.shutdown_handle();
//! let router = server.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`crypto`]: Initial packet protection and stateless reset tokens
//! - [`dispatcher`]: Router and its tables
//! - [`error`]: Error types
//! - [`handshake`]: `ClientHello` extraction from Initial packets
//! - [`packet`]: Header parsing and stateless packet builders
//! - [`server`]: Tokio UDP event loop

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod packet;
pub mod server;

// Re-export commonly used types at the crate root
pub use config::{load_config, DispatcherConfig};
pub use dispatcher::{
    DispatchOutcome, DropReason, Membership, ProofValidator, Router, RouterConfig, Session,
    SessionContext, SessionFactory,
};
pub use error::{
    ConfigError, DispatchError, HandshakeError, HeaderError, InitialError, SessionError,
};
pub use packet::{ConnectionId, PacketHeader, QuicVersion, ReceivedDatagram};
pub use server::{DispatchServer, ShutdownHandle, UdpSocketWriter};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
