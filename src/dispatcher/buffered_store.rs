//! Buffered packet store: datagrams for connection ids without a session.
//!
//! An entry is created by the first datagram that cannot be routed and
//! lives until the session is created (its datagrams are replayed), the
//! attempt is rejected, or it idles past the timeout.
//!
//! # Entry states
//!
//! ```text
//!             complete ClientHello
//! Awaiting ──────────────────────▶ Validating(token) ──accept, no allowance──▶ Ready
//!    │                                   │                                      │
//!    │                                   └──accept──▶ drained into session ◀────┘
//!    └──────────── idle timeout / reject / stop accepting ──▶ removed
//! ```
//!
//! # Limits
//!
//! - `max_connections` distinct ids in total
//! - `max_connections_without_handshake` ids still waiting for a complete
//!   `ClientHello`, so a flood of fragments cannot crowd out real attempts
//! - `max_packets_per_connection` datagrams per id; once reached the oldest
//!   are kept and new ones are dropped

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::validator::{Acceptance, ValidationToken};
use crate::handshake::{ClientHello, ClientHelloAssembler};
use crate::packet::{ConnectionId, PacketHeader, QuicVersion, ReceivedDatagram};

/// Store limits.
#[derive(Debug, Clone)]
pub struct BufferedStoreConfig {
    /// Maximum distinct buffered ids
    pub max_connections: usize,
    /// Maximum buffered ids without a complete handshake
    pub max_connections_without_handshake: usize,
    /// Maximum datagrams queued per id
    pub max_packets_per_connection: usize,
    /// Entries older than this are evicted
    pub idle_timeout: Duration,
}

impl Default for BufferedStoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_connections_without_handshake: 50,
            max_packets_per_connection: 10,
            idle_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-packet context captured when a handshake completes.
///
/// Restored verbatim when the validation verdict is applied, however much
/// later that is.
#[derive(Debug, Clone)]
pub struct PacketContext {
    /// Connection id of the attempt
    pub connection_id: ConnectionId,
    /// Version of the attempt
    pub version: QuicVersion,
    /// The datagram that completed the `ClientHello`
    pub datagram: ReceivedDatagram,
    /// Its parsed header
    pub header: PacketHeader,
    /// Number of datagrams buffered for the id before it arrived
    pub position: usize,
}

/// An accepted handshake waiting for session-creation allowance.
#[derive(Debug)]
pub struct ReadyHandshake {
    /// Context of the completing datagram
    pub ctx: PacketContext,
    /// The validated `ClientHello`
    pub hello: ClientHello,
    /// Validator output
    pub acceptance: Acceptance,
}

/// Handshake progress of a buffered id.
#[derive(Debug)]
pub enum EntryState {
    /// No complete `ClientHello` yet
    Awaiting,
    /// Validation in flight
    Validating(ValidationToken),
    /// Accepted; waiting for a drive call to create the session
    Ready(Box<ReadyHandshake>),
}

/// Why a datagram was not buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefusalReason {
    /// Too many distinct ids buffered
    StoreFull,
    /// Too many ids without a complete handshake
    TooManyWithoutHandshake,
    /// The id already holds its maximum number of datagrams
    PerConnectionCap,
    /// The id already has a complete handshake
    DuplicateHandshake,
}

/// Result of [`BufferedPacketStore::maybe_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOutcome {
    /// The datagram was queued
    Buffered,
    /// The datagram was dropped
    Refused(RefusalReason),
}

/// Datagrams and handshake state for one id.
#[derive(Debug)]
pub struct BufferedEntry {
    packets: VecDeque<ReceivedDatagram>,
    created_at: Instant,
    has_handshake: bool,
    state: EntryState,
    assembler: ClientHelloAssembler,
}

impl BufferedEntry {
    fn new(created_at: Instant, has_handshake: bool) -> Self {
        Self {
            packets: VecDeque::new(),
            created_at,
            has_handshake,
            state: EntryState::Awaiting,
            assembler: ClientHelloAssembler::new(),
        }
    }

    /// Queued datagrams, oldest first.
    pub fn packets(&self) -> impl Iterator<Item = &ReceivedDatagram> {
        self.packets.iter()
    }

    /// Number of queued datagrams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Whether no datagram is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// When the entry was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Whether a complete `ClientHello` has been seen.
    #[must_use]
    pub fn has_handshake(&self) -> bool {
        self.has_handshake
    }

    /// Handshake progress.
    #[must_use]
    pub fn state(&self) -> &EntryState {
        &self.state
    }
}

/// Bounded store of datagrams for ids without a session.
#[derive(Debug)]
pub struct BufferedPacketStore {
    config: BufferedStoreConfig,
    entries: HashMap<ConnectionId, BufferedEntry>,
    /// Ids parked as `Ready`, in acceptance order
    ready_queue: VecDeque<ConnectionId>,
    ready: usize,
    without_handshake: usize,
}

impl BufferedPacketStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(config: BufferedStoreConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            ready_queue: VecDeque::new(),
            ready: 0,
            without_handshake: 0,
        }
    }

    /// Store limits.
    #[must_use]
    pub fn config(&self) -> &BufferedStoreConfig {
        &self.config
    }

    /// Queue `datagram` for `id`.
    ///
    /// `is_handshake` marks an Initial packet; one arriving for an id that
    /// already has a complete handshake is refused.
    pub fn maybe_buffer(
        &mut self,
        id: &ConnectionId,
        datagram: ReceivedDatagram,
        is_handshake: bool,
    ) -> BufferOutcome {
        if let Some(entry) = self.entries.get_mut(id) {
            if is_handshake && entry.has_handshake {
                trace!("Duplicate handshake for buffered {}", id);
                return BufferOutcome::Refused(RefusalReason::DuplicateHandshake);
            }
            if entry.packets.len() >= self.config.max_packets_per_connection {
                trace!("Per-connection cap reached for {}", id);
                return BufferOutcome::Refused(RefusalReason::PerConnectionCap);
            }
            entry.packets.push_back(datagram);
            return BufferOutcome::Buffered;
        }

        if let Err(reason) = self.admit(false) {
            debug!("Refusing to buffer {}: {:?}", id, reason);
            return BufferOutcome::Refused(reason);
        }
        let mut entry = BufferedEntry::new(datagram.received_at, false);
        entry.packets.push_back(datagram);
        self.insert(id.clone(), entry);
        BufferOutcome::Buffered
    }

    fn admit(&self, has_handshake: bool) -> Result<(), RefusalReason> {
        if self.entries.len() >= self.config.max_connections {
            return Err(RefusalReason::StoreFull);
        }
        if !has_handshake && self.without_handshake >= self.config.max_connections_without_handshake
        {
            return Err(RefusalReason::TooManyWithoutHandshake);
        }
        Ok(())
    }

    fn insert(&mut self, id: ConnectionId, entry: BufferedEntry) {
        if !entry.has_handshake {
            self.without_handshake += 1;
        }
        trace!("Buffered entry created for {}", id);
        self.entries.insert(id, entry);
    }

    /// Entry for `id`, created with a handshake if absent.
    fn entry_with_handshake(&mut self, id: &ConnectionId, now: Instant) -> Option<&mut BufferedEntry> {
        if !self.entries.contains_key(id) {
            if let Err(reason) = self.admit(true) {
                debug!("No room to track handshake for {}: {:?}", id, reason);
                return None;
            }
            self.insert(id.clone(), BufferedEntry::new(now, true));
        }
        let entry = self.entries.get_mut(id)?;
        if !entry.has_handshake {
            entry.has_handshake = true;
            self.without_handshake -= 1;
        }
        Some(entry)
    }

    /// Record that `id` is being validated under `token`.
    ///
    /// Creates the entry if needed. Returns `false` if the store is full.
    pub fn begin_validation(
        &mut self,
        id: &ConnectionId,
        token: ValidationToken,
        now: Instant,
    ) -> bool {
        match self.entry_with_handshake(id, now) {
            Some(entry) => {
                entry.state = EntryState::Validating(token);
                true
            }
            None => false,
        }
    }

    /// Park an accepted handshake until session-creation allowance frees up.
    ///
    /// Creates the entry if needed. Returns `false` if the store is full.
    pub fn park_ready(&mut self, id: &ConnectionId, ready: Box<ReadyHandshake>, now: Instant) -> bool {
        match self.entry_with_handshake(id, now) {
            Some(entry) => {
                let was_ready = matches!(entry.state, EntryState::Ready(_));
                entry.state = EntryState::Ready(ready);
                if !was_ready {
                    self.ready += 1;
                    self.ready_queue.push_back(id.clone());
                }
                true
            }
            None => false,
        }
    }

    /// Take the oldest parked handshake.
    ///
    /// The entry and its datagrams stay in place until drained.
    pub fn pop_ready(&mut self) -> Option<(ConnectionId, Box<ReadyHandshake>)> {
        while let Some(id) = self.ready_queue.pop_front() {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            if !matches!(entry.state, EntryState::Ready(_)) {
                continue;
            }
            if let EntryState::Ready(ready) = std::mem::replace(&mut entry.state, EntryState::Awaiting)
            {
                self.ready -= 1;
                return Some((id, ready));
            }
        }
        None
    }

    /// Number of parked handshakes.
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.ready
    }

    /// Remove the entry for `id` and return its datagrams in arrival order.
    pub fn drain(&mut self, id: &ConnectionId) -> Vec<ReceivedDatagram> {
        self.remove(id)
            .map(|entry| entry.packets.into())
            .unwrap_or_default()
    }

    /// Whether `id` has an entry.
    #[must_use]
    pub fn has_entry(&self, id: &ConnectionId) -> bool {
        self.entries.contains_key(id)
    }

    /// Entry for `id`.
    #[must_use]
    pub fn entry(&self, id: &ConnectionId) -> Option<&BufferedEntry> {
        self.entries.get(id)
    }

    /// Reassembly state for `id`, if it has an entry.
    pub fn assembler_mut(&mut self, id: &ConnectionId) -> Option<&mut ClientHelloAssembler> {
        self.entries.get_mut(id).map(|e| &mut e.assembler)
    }

    /// Replace the reassembly state of an existing entry.
    pub fn install_assembler(&mut self, id: &ConnectionId, assembler: ClientHelloAssembler) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.assembler = assembler;
        }
    }

    /// Remove and return entries created at least `idle_timeout` ago,
    /// oldest first.
    pub fn expire(&mut self, now: Instant) -> Vec<(ConnectionId, BufferedEntry)> {
        let timeout = self.config.idle_timeout;
        let expired: Vec<ConnectionId> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.created_at) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return Vec::new();
        }

        let mut evicted: Vec<(ConnectionId, BufferedEntry)> = expired
            .into_iter()
            .filter_map(|id| self.remove(&id).map(|entry| (id, entry)))
            .collect();
        evicted.sort_by_key(|(_, entry)| entry.created_at);
        debug!("Expired {} buffered entries", evicted.len());
        evicted
    }

    /// Remove the entry for `id`.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<BufferedEntry> {
        let entry = self.entries.remove(id)?;
        if !entry.has_handshake {
            self.without_handshake -= 1;
        }
        if matches!(entry.state, EntryState::Ready(_)) {
            self.ready -= 1;
            self.ready_queue.retain(|queued| queued != id);
        }
        Some(entry)
    }

    /// Remove every entry, returning them.
    pub fn clear(&mut self) -> Vec<(ConnectionId, BufferedEntry)> {
        self.ready_queue.clear();
        self.ready = 0;
        self.without_handshake = 0;
        self.entries.drain().collect()
    }

    /// Number of buffered ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no id is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of buffered ids without a complete handshake.
    #[must_use]
    pub fn without_handshake_count(&self) -> usize {
        self.without_handshake
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn config() -> BufferedStoreConfig {
        BufferedStoreConfig {
            max_connections: 4,
            max_connections_without_handshake: 3,
            max_packets_per_connection: 3,
            idle_timeout: Duration::from_secs(5),
        }
    }

    fn datagram(tag: u8, at: Instant) -> ReceivedDatagram {
        ReceivedDatagram::new(
            "198.51.100.1:443".parse().unwrap(),
            "192.0.2.1:5000".parse().unwrap(),
            at,
            Bytes::from(vec![tag; 32]),
        )
    }

    fn tags(packets: &[ReceivedDatagram]) -> Vec<u8> {
        packets.iter().map(|d| d.payload[0]).collect()
    }

    #[test]
    fn test_drain_preserves_order() {
        let mut store = BufferedPacketStore::new(config());
        let id = ConnectionId::from_u64(1);
        let now = Instant::now();
        for tag in 1..=3 {
            assert_eq!(
                store.maybe_buffer(&id, datagram(tag, now), false),
                BufferOutcome::Buffered
            );
        }

        assert_eq!(tags(&store.drain(&id)), vec![1, 2, 3]);
        assert!(!store.has_entry(&id));
        assert!(store.drain(&id).is_empty());
    }

    #[test]
    fn test_per_connection_cap_keeps_oldest() {
        let mut store = BufferedPacketStore::new(config());
        let id = ConnectionId::from_u64(1);
        let now = Instant::now();
        for tag in 1..=5 {
            store.maybe_buffer(&id, datagram(tag, now), false);
        }
        assert_eq!(
            store.maybe_buffer(&id, datagram(6, now), false),
            BufferOutcome::Refused(RefusalReason::PerConnectionCap)
        );
        assert_eq!(tags(&store.drain(&id)), vec![1, 2, 3]);
    }

    #[test]
    fn test_without_handshake_limit() {
        let mut store = BufferedPacketStore::new(config());
        let now = Instant::now();
        for i in 1..=3 {
            assert_eq!(
                store.maybe_buffer(&ConnectionId::from_u64(i), datagram(0, now), false),
                BufferOutcome::Buffered
            );
        }
        assert_eq!(
            store.maybe_buffer(&ConnectionId::from_u64(4), datagram(0, now), false),
            BufferOutcome::Refused(RefusalReason::TooManyWithoutHandshake)
        );

        // An id with a handshake still fits under the global cap
        assert!(store.begin_validation(&ConnectionId::from_u64(9), ValidationToken(1), now));
        assert_eq!(store.len(), 4);
        assert_eq!(store.without_handshake_count(), 3);
        assert!(!store.begin_validation(&ConnectionId::from_u64(10), ValidationToken(2), now));
    }

    #[test]
    fn test_handshake_moves_entry_out_of_without_count() {
        let mut store = BufferedPacketStore::new(config());
        let id = ConnectionId::from_u64(1);
        let now = Instant::now();
        store.maybe_buffer(&id, datagram(1, now), false);
        assert_eq!(store.without_handshake_count(), 1);

        assert!(store.begin_validation(&id, ValidationToken(5), now));
        assert_eq!(store.without_handshake_count(), 0);
        assert!(matches!(
            store.entry(&id).map(BufferedEntry::state),
            Some(EntryState::Validating(ValidationToken(5)))
        ));

        // Further Initials for the id are duplicates
        assert_eq!(
            store.maybe_buffer(&id, datagram(2, now), true),
            BufferOutcome::Refused(RefusalReason::DuplicateHandshake)
        );
        assert_eq!(
            store.maybe_buffer(&id, datagram(3, now), false),
            BufferOutcome::Buffered
        );

        store.remove(&id);
        assert_eq!(store.without_handshake_count(), 0);
    }

    #[test]
    fn test_expire_by_creation_time() {
        let mut store = BufferedPacketStore::new(config());
        let start = Instant::now();
        store.maybe_buffer(&ConnectionId::from_u64(2), datagram(0, start + Duration::from_secs(1)), false);
        store.maybe_buffer(&ConnectionId::from_u64(1), datagram(0, start), false);
        // Later datagrams do not refresh the entry
        store.maybe_buffer(&ConnectionId::from_u64(1), datagram(0, start + Duration::from_secs(4)), false);

        assert!(store.expire(start + Duration::from_secs(4)).is_empty());

        let evicted = store.expire(start + Duration::from_secs(6));
        let ids: Vec<_> = evicted.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(ids, vec![ConnectionId::from_u64(1), ConnectionId::from_u64(2)]);
        assert!(store.is_empty());
        assert_eq!(store.without_handshake_count(), 0);
    }

    #[test]
    fn test_ready_queue_fifo_skips_removed() {
        let mut store = BufferedPacketStore::new(config());
        let now = Instant::now();
        let ctx = |id: u64| PacketContext {
            connection_id: ConnectionId::from_u64(id),
            version: QuicVersion::V1,
            datagram: datagram(0, now),
            header: PacketHeader::parse(&Bytes::from(vec![0x40; 16]), 8).unwrap(),
            position: 0,
        };
        let hello = ClientHello::parse(Bytes::from(
            crate::handshake::client_hello::tests::encode_client_hello(&[]),
        ))
        .unwrap();

        for id in 1..=3 {
            let ready = Box::new(ReadyHandshake {
                ctx: ctx(id),
                hello: hello.clone(),
                acceptance: Acceptance::default(),
            });
            assert!(store.park_ready(&ConnectionId::from_u64(id), ready, now));
        }
        assert_eq!(store.ready_count(), 3);
        store.remove(&ConnectionId::from_u64(1));
        assert_eq!(store.ready_count(), 2);
        assert_eq!(store.ready_queue.len(), 2);

        let (id, ready) = store.pop_ready().unwrap();
        assert_eq!(id, ConnectionId::from_u64(2));
        assert_eq!(ready.ctx.connection_id, id);
        assert!(store.has_entry(&id));
        assert_eq!(store.pop_ready().map(|(id, _)| id), Some(ConnectionId::from_u64(3)));
        assert!(store.pop_ready().is_none());
        assert_eq!(store.ready_count(), 0);
    }

    #[test]
    fn test_expired_ready_entries_leave_queue() {
        let mut store = BufferedPacketStore::new(config());
        let start = Instant::now();
        let hello = ClientHello::parse(Bytes::from(
            crate::handshake::client_hello::tests::encode_client_hello(&[]),
        ))
        .unwrap();
        for id in 1..=2 {
            let ready = Box::new(ReadyHandshake {
                ctx: PacketContext {
                    connection_id: ConnectionId::from_u64(id),
                    version: QuicVersion::V1,
                    datagram: datagram(0, start),
                    header: PacketHeader::parse(&Bytes::from(vec![0x40; 16]), 8).unwrap(),
                    position: 0,
                },
                hello: hello.clone(),
                acceptance: Acceptance::default(),
            });
            assert!(store.park_ready(&ConnectionId::from_u64(id), ready, start));
        }
        assert_eq!(store.ready_count(), 2);

        assert_eq!(store.expire(start + Duration::from_secs(6)).len(), 2);
        assert_eq!(store.ready_count(), 0);
        assert!(store.ready_queue.is_empty());
        assert!(store.pop_ready().is_none());
    }

    #[test]
    fn test_clear() {
        let mut store = BufferedPacketStore::new(config());
        let now = Instant::now();
        store.maybe_buffer(&ConnectionId::from_u64(1), datagram(0, now), false);
        store.begin_validation(&ConnectionId::from_u64(2), ValidationToken(1), now);
        assert_eq!(store.clear().len(), 2);
        assert!(store.is_empty());
        assert_eq!(store.ready_count(), 0);
        assert_eq!(store.without_handshake_count(), 0);
    }
}
