//! Session collaborator interfaces.
//!
//! The dispatcher does not implement the QUIC transport. Once a handshake
//! is admitted it asks a [`SessionFactory`] for a [`Session`] and from then
//! on only routes datagrams to it.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;

use super::events::{DispatcherEvents, SessionEvent};
use super::validator::Acceptance;
use crate::error::SessionError;
use crate::handshake::{ClientHello, TransportParameters};
use crate::packet::{ConnectionId, QuicVersion, ReceivedDatagram};

/// Result of giving a session a chance to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Nothing left to write
    Done,
    /// Still has data queued; keep the session in the write-blocked list
    Blocked,
}

/// An established connection, owned by the router.
pub trait Session {
    /// Process a datagram routed to this connection.
    fn deliver(&mut self, datagram: ReceivedDatagram);

    /// The socket became writable; flush what can be flushed.
    fn on_writable(&mut self) -> WriteStatus;

    /// Whether the session has finished and should move to time-wait.
    fn is_closing(&self) -> bool;

    /// Ask the session to close (server shutdown).
    fn close(&mut self) {}

    /// Datagrams the time-wait registry should resend for this id.
    ///
    /// Usually the session's final CONNECTION_CLOSE. When empty, the
    /// registry answers with stateless resets instead.
    fn take_termination_datagrams(&mut self) -> Vec<Bytes> {
        Vec::new()
    }
}

/// Router-assigned handle of one session.
///
/// Stays the same while the session's connection ids come and go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(pub(crate) u64);

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Lets a session notify the router out of band.
///
/// Holds only a weak reference; notifications after the router is gone are
/// dropped.
#[derive(Debug, Clone)]
pub struct SessionNotifier {
    key: SessionKey,
    id: ConnectionId,
    events: Weak<DispatcherEvents>,
}

impl SessionNotifier {
    pub(crate) fn new(key: SessionKey, id: ConnectionId, events: &Arc<DispatcherEvents>) -> Self {
        Self {
            key,
            id,
            events: Arc::downgrade(events),
        }
    }

    /// Session this notifier reports for.
    #[must_use]
    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// Original connection id of the session.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    /// The session has closed; move its ids to time-wait.
    pub fn closed(&self) {
        self.push(SessionEvent::Closed(self.key));
    }

    /// The session is blocked on the socket; call `on_writable` later.
    pub fn write_blocked(&self) {
        self.push(SessionEvent::WriteBlocked(self.key));
    }

    /// The session issued `id` to its peer; route it to this session.
    pub fn add_connection_id(&self, id: ConnectionId) {
        self.push(SessionEvent::NewConnectionId(self.key, id));
    }

    /// The peer retired `id`; stop routing it.
    pub fn retire_connection_id(&self, id: ConnectionId) {
        self.push(SessionEvent::RetireConnectionId(self.key, id));
    }

    fn push(&self, event: SessionEvent) {
        if let Some(events) = self.events.upgrade() {
            events.push_session_event(event);
        }
    }
}

/// Everything a factory needs to build a session.
#[derive(Debug)]
pub struct SessionContext {
    /// Destination id of the client's first Initial
    pub connection_id: ConnectionId,
    /// Id the server uses for the connection
    ///
    /// Equal to `connection_id` unless that has a different length from
    /// the configured short-header length, in which case it is a
    /// replacement of that length. Both ids route to the session.
    pub server_connection_id: ConnectionId,
    /// Client address
    pub client_addr: SocketAddr,
    /// Server address
    pub server_addr: SocketAddr,
    /// Negotiated version
    pub version: QuicVersion,
    /// The validated `ClientHello`
    pub hello: ClientHello,
    /// Validator output
    pub acceptance: Acceptance,
    /// Handle for out-of-band notifications
    pub notifier: SessionNotifier,
}

impl SessionContext {
    /// Client transport parameters, if sent.
    #[must_use]
    pub fn transport_params(&self) -> Option<&TransportParameters> {
        self.hello.transport_params()
    }
}

/// Builds sessions for admitted connections.
pub trait SessionFactory {
    /// Create a session.
    ///
    /// # Errors
    ///
    /// A `SessionError` makes the router statelessly refuse the attempt.
    fn create(&mut self, context: SessionContext) -> Result<Box<dyn Session>, SessionError>;
}
