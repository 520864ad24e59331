//! Connection router.
//!
//! Owns the session table, the buffered packet store, the time-wait
//! registry and the write-blocked list, and is the only code that mutates
//! them. Everything runs on the dispatch loop's thread; notifications from
//! other call stacks (validation wake-ups, session events) are queued in
//! [`DispatcherEvents`] and applied by [`Router::process_events`], which
//! every entry point calls first.
//!
//! # Validation
//!
//! A complete `ClientHello` is handed to the [`ProofValidator`]. The future
//! it returns is polled once on the spot: a verdict that is already there
//! is applied immediately. Otherwise the future is parked under a
//! [`ValidationToken`] together with the [`PacketContext`] of the datagram
//! that completed the handshake, and the buffered entry records the token.
//! When the waker fires, the future is polled again and the same
//! continuation runs with the saved context.
//!
//! Evicting the buffered entry drops the parked future; a later wake-up
//! finds no token and is ignored.
//!
//! # Replay order
//!
//! The completing datagram is not queued in the store. Its context records
//! how many datagrams were buffered before it, so a new session receives
//! the earlier datagrams, then the handshake, then anything that arrived
//! while validation was in flight.
//!
//! # Connection ids
//!
//! Sessions live under a [`SessionKey`]; every connection id that reaches
//! a session is an entry in the route table. A session starts with the
//! client's original destination id. Short headers are parsed at
//! `connection_id_length` bytes, so when the original id has another length
//! the session is also routed on a replacement of that length, which the
//! session hands to the peer. Ids the session issues or the peer retires
//! later arrive as [`SessionEvent`]s.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use tracing::{debug, info, trace, warn};

use super::buffered_store::{
    BufferOutcome, BufferedEntry, BufferedPacketStore, BufferedStoreConfig, EntryState,
    PacketContext, ReadyHandshake, RefusalReason,
};
use super::events::{DispatcherEvents, SessionEvent};
use super::reset_limit::{RecentResets, ResetLimitConfig};
use super::session::{
    Session, SessionContext, SessionFactory, SessionKey, SessionNotifier, WriteStatus,
};
use super::stats::DispatcherStats;
use super::time_wait::{TimeWaitAction, TimeWaitConfig, TimeWaitRegistry, TimeWaitResponse};
use super::validator::{
    completion_waker, Acceptance, ProofValidator, ValidationRequest, ValidationToken, Verdict,
};
use super::write_blocked::{ServiceStep, WriteBlockedList};
use super::writer::{PacketWriter, WriteResult};
use super::{is_blocked_source_port, DispatchOutcome, DropReason, Membership};
use crate::crypto::{ConnectionIdGenerator, ResetTokenGenerator};
use crate::error::DispatchError;
use crate::handshake::{self, AssemblyStatus, ClientHello, ClientHelloAssembler};
use crate::packet::{
    build_stateless_close, build_stateless_reset, build_version_negotiation, CloseReason,
    ConnectionId, HeaderForm, PacketHeader, QuicVersion, ReceivedDatagram,
};

/// Shortest destination id accepted on a long header of a known version.
pub const MIN_INITIAL_CONNECTION_ID_LEN: usize = 8;

/// Router settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Sessions created per drive call
    pub max_sessions_per_drive: usize,
    /// Write-blocked sessions serviced per writable event
    pub write_blocked_batch: usize,
    /// Length of connection ids in short headers
    pub connection_id_length: usize,
    /// Smallest client Initial datagram accepted
    pub min_initial_size: usize,
    /// Versions answered without version negotiation
    pub supported_versions: Vec<QuicVersion>,
    /// Buffered store limits
    pub buffer: BufferedStoreConfig,
    /// Time-wait limits
    pub time_wait: TimeWaitConfig,
    /// Stateless resets for unknown ids, per peer
    pub reset_limit: ResetLimitConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_drive: 16,
            write_blocked_batch: 32,
            connection_id_length: 8,
            min_initial_size: 1200,
            supported_versions: vec![QuicVersion::V1, QuicVersion::V2],
            buffer: BufferedStoreConfig::default(),
            time_wait: TimeWaitConfig::default(),
            reset_limit: ResetLimitConfig::default(),
        }
    }
}

/// A validation whose verdict is not in yet.
struct PendingValidation {
    ctx: PacketContext,
    hello: ClientHello,
    future: LocalBoxFuture<'static, Verdict>,
}

fn packet_context(
    datagram: ReceivedDatagram,
    header: PacketHeader,
    position: usize,
) -> PacketContext {
    PacketContext {
        connection_id: header.connection_id(),
        version: header.version.unwrap_or(QuicVersion::V1),
        datagram,
        header,
        position,
    }
}

/// A session and the connection ids routed to it.
struct SessionSlot {
    session: Box<dyn Session>,
    /// Client's original id first, unless retired
    ids: Vec<ConnectionId>,
}

/// The connection dispatcher.
pub struct Router {
    config: RouterConfig,
    sessions: HashMap<SessionKey, SessionSlot>,
    routes: HashMap<ConnectionId, SessionKey>,
    next_session: u64,
    store: BufferedPacketStore,
    time_wait: TimeWaitRegistry,
    write_blocked: WriteBlockedList<SessionKey>,
    recent_resets: RecentResets,
    id_generator: ConnectionIdGenerator,
    pending: HashMap<ValidationToken, PendingValidation>,
    next_token: u64,
    new_sessions_allowance: usize,
    accepting: bool,
    validator: Box<dyn ProofValidator>,
    factory: Box<dyn SessionFactory>,
    writer: Box<dyn PacketWriter>,
    reset_tokens: ResetTokenGenerator,
    events: Arc<DispatcherEvents>,
    stats: Arc<DispatcherStats>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("sessions", &self.sessions.len())
            .field("routed_ids", &self.routes.len())
            .field("buffered", &self.store.len())
            .field("time_wait", &self.time_wait.len())
            .field("pending_validations", &self.pending.len())
            .field("accepting", &self.accepting)
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Create a router.
    pub fn new(
        config: RouterConfig,
        validator: Box<dyn ProofValidator>,
        factory: Box<dyn SessionFactory>,
        writer: Box<dyn PacketWriter>,
        reset_tokens: ResetTokenGenerator,
    ) -> Self {
        Self {
            store: BufferedPacketStore::new(config.buffer.clone()),
            time_wait: TimeWaitRegistry::new(config.time_wait.clone()),
            recent_resets: RecentResets::new(config.reset_limit.clone()),
            id_generator: ConnectionIdGenerator::random(config.connection_id_length),
            new_sessions_allowance: config.max_sessions_per_drive,
            config,
            sessions: HashMap::new(),
            routes: HashMap::new(),
            next_session: 0,
            write_blocked: WriteBlockedList::new(),
            pending: HashMap::new(),
            next_token: 0,
            accepting: true,
            validator,
            factory,
            writer,
            reset_tokens,
            events: Arc::new(DispatcherEvents::new()),
            stats: Arc::new(DispatcherStats::new()),
        }
    }

    /// Router settings.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<DispatcherStats> {
        &self.stats
    }

    /// Event queues; the dispatch loop waits on these for wake-ups.
    #[must_use]
    pub fn events(&self) -> Arc<DispatcherEvents> {
        Arc::clone(&self.events)
    }

    /// Process one received datagram.
    pub fn on_datagram(&mut self, datagram: ReceivedDatagram) -> DispatchOutcome {
        self.process_events(datagram.received_at);
        self.stats.record_received();
        let outcome = self.dispatch(datagram);
        self.record_outcome(outcome);
        outcome
    }

    fn record_outcome(&self, outcome: DispatchOutcome) {
        if let DispatchOutcome::Dropped(reason) = outcome {
            self.stats.record_dropped(reason);
        }
    }

    fn dispatch(&mut self, datagram: ReceivedDatagram) -> DispatchOutcome {
        if is_blocked_source_port(datagram.peer_addr.port()) {
            trace!("Dropping datagram from blocked port {}", datagram.peer_addr);
            return DispatchOutcome::Dropped(DropReason::BlockedSourcePort);
        }

        let header = match PacketHeader::parse(&datagram.payload, self.config.connection_id_length)
        {
            Ok(header) => header,
            Err(e) => {
                trace!("Unparseable datagram from {}: {}", datagram.peer_addr, e);
                return DispatchOutcome::Dropped(DropReason::Unparseable);
            }
        };

        if header.version.is_some_and(|v| v.is_known())
            && header.dcid.len() < MIN_INITIAL_CONNECTION_ID_LEN
        {
            trace!(
                "Dropping long header with {}-byte connection id from {}",
                header.dcid.len(),
                datagram.peer_addr
            );
            return DispatchOutcome::Dropped(DropReason::ShortConnectionId);
        }

        let id = header.connection_id();
        let now = datagram.received_at;

        if let Some(&key) = self.routes.get(&id) {
            return self.deliver(key, datagram, now);
        }

        if self.time_wait.is_tracked(&id) {
            return self.handle_time_wait(&id, &datagram);
        }

        if !self.accepting {
            if header.is_initial() && datagram.len() >= self.config.min_initial_size {
                debug!("Refusing {} while not accepting", id);
                let ctx = packet_context(datagram, header, 0);
                return self.reject(ctx, &CloseReason::refused("not accepting connections"), now);
            }
            return DispatchOutcome::Dropped(DropReason::NotAccepting);
        }

        if let Some(has_handshake) = self.store.entry(&id).map(BufferedEntry::has_handshake) {
            if header.is_initial() && !has_handshake {
                if datagram.len() < self.config.min_initial_size {
                    return DispatchOutcome::Dropped(DropReason::TooSmall);
                }
                return self.handle_initial(datagram, header, now);
            }
            let is_initial = header.is_initial();
            return self.buffer(&id, datagram, is_initial);
        }

        if header.form == HeaderForm::Short {
            return self.reset_unknown(&id, &datagram);
        }

        let Some(version) = header.version else {
            return DispatchOutcome::Dropped(DropReason::Unparseable);
        };
        if !self.config.supported_versions.contains(&version) {
            if datagram.len() < self.config.min_initial_size {
                return DispatchOutcome::Dropped(DropReason::TooSmall);
            }
            debug!("Version negotiation for {} ({})", id, version);
            let packet = build_version_negotiation(&header, &self.config.supported_versions);
            self.send(&packet, datagram.self_addr, datagram.peer_addr);
            self.stats.record_version_negotiation();
            return DispatchOutcome::VersionNegotiation;
        }

        if !header.is_initial() {
            // 0-RTT or Handshake packet that overtook the Initial
            return self.buffer(&id, datagram, false);
        }
        if datagram.len() < self.config.min_initial_size {
            trace!("Initial for {} is {} bytes, dropping", id, datagram.len());
            return DispatchOutcome::Dropped(DropReason::TooSmall);
        }
        self.handle_initial(datagram, header, now)
    }

    fn deliver(&mut self, key: SessionKey, datagram: ReceivedDatagram, now: Instant) -> DispatchOutcome {
        let Some(slot) = self.sessions.get_mut(&key) else {
            warn!("Route to missing {}", key);
            return DispatchOutcome::Dropped(DropReason::UnknownConnection);
        };
        slot.session.deliver(datagram);
        self.stats.record_delivered();
        if slot.session.is_closing() {
            self.close_session(key, now);
        }
        DispatchOutcome::Delivered
    }

    /// Answer a short header for an unknown id, at most once per peer per
    /// window.
    fn reset_unknown(&mut self, id: &ConnectionId, datagram: &ReceivedDatagram) -> DispatchOutcome {
        let Some(reset) = build_stateless_reset(id, datagram.len(), &self.reset_tokens) else {
            trace!("Short header for unknown {} too small to reset", id);
            return DispatchOutcome::Dropped(DropReason::UnknownConnection);
        };
        if !self.recent_resets.allows(&datagram.peer_addr) {
            return DispatchOutcome::Dropped(DropReason::ResetLimited);
        }
        if !self.send(&reset, datagram.self_addr, datagram.peer_addr) {
            return DispatchOutcome::Dropped(DropReason::UnknownConnection);
        }
        self.stats.record_stateless_reset();
        self.recent_resets
            .record(datagram.peer_addr, datagram.received_at);
        DispatchOutcome::StatelessReset
    }

    fn handle_time_wait(&mut self, id: &ConnectionId, datagram: &ReceivedDatagram) -> DispatchOutcome {
        let responded = match self.time_wait.handle(id) {
            TimeWaitResponse::Send(packets) => {
                let mut sent = false;
                for packet in &packets {
                    sent |= self.send(packet, datagram.self_addr, datagram.peer_addr);
                }
                sent
            }
            TimeWaitResponse::StatelessReset => self.send_stateless_reset(id, datagram),
            TimeWaitResponse::Drop => false,
        };
        if responded {
            self.stats.record_time_wait_response();
        }
        DispatchOutcome::TimeWait { responded }
    }

    fn buffer(
        &mut self,
        id: &ConnectionId,
        datagram: ReceivedDatagram,
        is_handshake: bool,
    ) -> DispatchOutcome {
        match self.store.maybe_buffer(id, datagram, is_handshake) {
            BufferOutcome::Buffered => {
                self.stats.record_buffered();
                self.check_membership(id);
                DispatchOutcome::Buffered
            }
            BufferOutcome::Refused(RefusalReason::DuplicateHandshake) => {
                DispatchOutcome::Dropped(DropReason::DuplicateHandshake)
            }
            BufferOutcome::Refused(_) => DispatchOutcome::Dropped(DropReason::BufferFull),
        }
    }

    fn handle_initial(
        &mut self,
        datagram: ReceivedDatagram,
        header: PacketHeader,
        now: Instant,
    ) -> DispatchOutcome {
        let id = header.connection_id();

        let mut scratch = None;
        let assembler = match self.store.assembler_mut(&id) {
            Some(assembler) => assembler,
            None => scratch.insert(ClientHelloAssembler::new()),
        };
        let status = handshake::feed_initial(&datagram.payload, &header, assembler);

        match status {
            Ok(AssemblyStatus::Complete(hello)) => {
                let position = self.store.entry(&id).map_or(0, BufferedEntry::len);
                trace!(
                    "ClientHello complete for {} after {} buffered datagrams",
                    id,
                    position
                );
                let ctx = packet_context(datagram, header, position);
                self.start_validation(ctx, *hello, now)
            }
            Ok(AssemblyStatus::Incomplete) => {
                let outcome = self.buffer(&id, datagram, false);
                if let (Some(assembler), DispatchOutcome::Buffered) = (scratch, outcome) {
                    self.store.install_assembler(&id, assembler);
                }
                outcome
            }
            Ok(AssemblyStatus::Duplicate) => DispatchOutcome::Dropped(DropReason::DuplicateHandshake),
            Err(DispatchError::Handshake(err)) => {
                debug!("Invalid handshake for {}: {}", id, err);
                let position = self.store.entry(&id).map_or(0, BufferedEntry::len);
                let ctx = packet_context(datagram, header, position);
                self.reject(ctx, &CloseReason::from_handshake_error(&err), now)
            }
            Err(err) => {
                trace!("Cannot open Initial for {}: {}", id, err);
                DispatchOutcome::Dropped(DropReason::Undecryptable)
            }
        }
    }

    fn start_validation(
        &mut self,
        ctx: PacketContext,
        hello: ClientHello,
        now: Instant,
    ) -> DispatchOutcome {
        let token = ValidationToken(self.next_token);
        self.next_token += 1;

        let request = ValidationRequest {
            connection_id: ctx.connection_id.clone(),
            client_addr: ctx.datagram.peer_addr,
            server_addr: ctx.datagram.self_addr,
            version: ctx.version,
            hello: hello.clone(),
        };
        self.stats.record_validation_started();
        let mut future = self.validator.validate(request);

        let waker = completion_waker(token, &self.events);
        let mut cx = Context::from_waker(&waker);
        if let Poll::Ready(verdict) = future.poll_unpin(&mut cx) {
            trace!("Validation {} for {} completed inline", token, ctx.connection_id);
            return self.finish_validation(ctx, hello, verdict, now);
        }

        let id = ctx.connection_id.clone();
        if !self.store.begin_validation(&id, token, now) {
            warn!("No room to track validation for {}, dropping handshake", id);
            self.stats.record_validation_abandoned();
            return DispatchOutcome::Dropped(DropReason::BufferFull);
        }
        debug!("Validation {} pending for {}", token, id);
        self.pending
            .insert(token, PendingValidation { ctx, hello, future });
        self.check_membership(&id);
        DispatchOutcome::ValidationPending
    }

    /// Poll a parked validation after its waker fired.
    fn poll_validation(&mut self, token: ValidationToken, now: Instant) -> bool {
        let Some(pending) = self.pending.get_mut(&token) else {
            debug!("Ignoring completion for unknown validation {}", token);
            self.stats.record_stale_completion();
            return false;
        };

        let waker = completion_waker(token, &self.events);
        let mut cx = Context::from_waker(&waker);
        let Poll::Ready(verdict) = pending.future.poll_unpin(&mut cx) else {
            trace!("Validation {} woke but is still pending", token);
            return false;
        };

        let Some(PendingValidation { ctx, hello, .. }) = self.pending.remove(&token) else {
            return false;
        };
        let outcome = self.finish_validation(ctx, hello, verdict, now);
        self.record_outcome(outcome);
        true
    }

    fn finish_validation(
        &mut self,
        ctx: PacketContext,
        hello: ClientHello,
        verdict: Verdict,
        now: Instant,
    ) -> DispatchOutcome {
        self.stats.record_validation_completed();
        match verdict {
            Verdict::Reject(reason) => {
                debug!("Validator rejected {}: {}", ctx.connection_id, reason);
                self.reject(ctx, &CloseReason::refused(reason), now)
            }
            Verdict::Accept(acceptance) if self.new_sessions_allowance == 0 => {
                let id = ctx.connection_id.clone();
                let ready = Box::new(ReadyHandshake {
                    ctx,
                    hello,
                    acceptance,
                });
                if self.store.park_ready(&id, ready, now) {
                    debug!("Session allowance spent, {} parked", id);
                    self.check_membership(&id);
                    DispatchOutcome::Buffered
                } else {
                    warn!("No room to park accepted handshake for {}", id);
                    DispatchOutcome::Dropped(DropReason::BufferFull)
                }
            }
            Verdict::Accept(acceptance) => self.create_session(ctx, hello, acceptance, now),
        }
    }

    fn create_session(
        &mut self,
        ctx: PacketContext,
        hello: ClientHello,
        acceptance: Acceptance,
        now: Instant,
    ) -> DispatchOutcome {
        let id = ctx.connection_id.clone();
        self.new_sessions_allowance = self.new_sessions_allowance.saturating_sub(1);
        let mut packets = self.store.drain(&id);

        let key = SessionKey(self.next_session);
        self.next_session += 1;
        let replacement = self.replacement_id(&id);
        let context = SessionContext {
            connection_id: id.clone(),
            server_connection_id: replacement.clone().unwrap_or_else(|| id.clone()),
            client_addr: ctx.datagram.peer_addr,
            server_addr: ctx.datagram.self_addr,
            version: ctx.version,
            hello,
            acceptance,
            notifier: SessionNotifier::new(key, id.clone(), &self.events),
        };
        let mut session = match self.factory.create(context) {
            Ok(session) => session,
            Err(err) => {
                warn!("Failed to create session for {}: {}", id, err);
                self.stats.record_session_create_failure();
                return self.reject(ctx, &CloseReason::refused(err.to_string()), now);
            }
        };

        let after = packets.split_off(ctx.position.min(packets.len()));
        let replayed = packets.len() + after.len();
        for datagram in packets
            .into_iter()
            .chain(std::iter::once(ctx.datagram))
            .chain(after)
        {
            session.deliver(datagram);
            self.stats.record_delivered();
        }
        self.stats.record_session_created();
        debug!(
            "{} created for {} ({} buffered datagrams replayed)",
            key, id, replayed
        );

        let mut ids = vec![id];
        if let Some(replacement) = replacement {
            debug!("{} also routed on replacement id {}", key, replacement);
            ids.push(replacement);
        }
        for cid in &ids {
            self.routes.insert(cid.clone(), key);
        }
        let closing = session.is_closing();
        self.sessions.insert(key, SessionSlot {
            session,
            ids: ids.clone(),
        });
        if closing {
            self.close_session(key, now);
        }
        for cid in &ids {
            self.check_membership(cid);
        }
        DispatchOutcome::SessionCreated
    }

    /// Replacement for an original id whose length differs from the
    /// short-header length.
    fn replacement_id(&self, original: &ConnectionId) -> Option<ConnectionId> {
        let replacement = self.id_generator.maybe_replace(original)?;
        if self.membership(&replacement) != Membership::None {
            warn!(
                "Replacement id {} for {} is already in use",
                replacement, original
            );
            return None;
        }
        Some(replacement)
    }

    /// Route `id` to the session under `key`.
    fn add_connection_id(&mut self, key: SessionKey, id: ConnectionId) -> bool {
        if !self.sessions.contains_key(&key) {
            debug!("Ignoring new id {} for closed {}", id, key);
            return false;
        }
        if let Some(&owner) = self.routes.get(&id) {
            if owner != key {
                warn!("{} issued {} which routes to {}", key, id, owner);
            }
            return false;
        }
        if self.store.has_entry(&id) || self.time_wait.is_tracked(&id) {
            warn!("{} issued {} which is still in use", key, id);
            return false;
        }
        if id.len() != self.config.connection_id_length {
            warn!(
                "{} issued {}-byte id {}; short headers carry {} bytes",
                key,
                id.len(),
                id,
                self.config.connection_id_length
            );
            return false;
        }
        trace!("{} now routed on {}", key, id);
        self.routes.insert(id.clone(), key);
        if let Some(slot) = self.sessions.get_mut(&key) {
            slot.ids.push(id.clone());
        }
        self.check_membership(&id);
        true
    }

    /// Stop routing `id` to the session under `key`.
    fn retire_connection_id(&mut self, key: SessionKey, id: &ConnectionId) -> bool {
        if self.routes.get(id) != Some(&key) {
            return false;
        }
        trace!("{} retired {}", key, id);
        self.routes.remove(id);
        if let Some(slot) = self.sessions.get_mut(&key) {
            slot.ids.retain(|cid| cid != id);
        }
        true
    }

    /// Refuse an attempt with a stateless close and move its id to
    /// time-wait.
    fn reject(&mut self, ctx: PacketContext, reason: &CloseReason, now: Instant) -> DispatchOutcome {
        let id = ctx.connection_id.clone();
        self.discard_entry(&id);

        match build_stateless_close(&ctx.header, reason) {
            Ok(close) => {
                self.send(&close, ctx.datagram.self_addr, ctx.datagram.peer_addr);
                self.time_wait
                    .add(id.clone(), TimeWaitAction::SendTerminationPackets, vec![close], now);
            }
            Err(err) => {
                debug!("Cannot build stateless close for {}: {}", id, err);
                self.time_wait
                    .add(id.clone(), TimeWaitAction::SendStatelessReset, Vec::new(), now);
            }
        }
        self.stats.record_rejection();
        self.check_membership(&id);
        DispatchOutcome::Rejected
    }

    /// Remove a buffered entry, abandoning its validation if one is parked.
    fn discard_entry(&mut self, id: &ConnectionId) -> Option<BufferedEntry> {
        let entry = self.store.remove(id)?;
        if let EntryState::Validating(token) = entry.state() {
            self.abandon_validation(*token);
        }
        Some(entry)
    }

    fn abandon_validation(&mut self, token: ValidationToken) {
        if let Some(pending) = self.pending.remove(&token) {
            debug!(
                "Abandoned validation {} for {}",
                token, pending.ctx.connection_id
            );
            self.stats.record_validation_abandoned();
        }
    }

    /// Move every id of the session under `key` to time-wait.
    fn close_session(&mut self, key: SessionKey, now: Instant) -> bool {
        let Some(SessionSlot { mut session, ids }) = self.sessions.remove(&key) else {
            return false;
        };
        self.write_blocked.remove(&key);
        for id in &ids {
            self.routes.remove(id);
        }

        let termination = session.take_termination_datagrams();
        let action = if termination.is_empty() {
            TimeWaitAction::SendStatelessReset
        } else {
            TimeWaitAction::SendTerminationPackets
        };
        debug!("{} closed, {} ids to time-wait {:?}", key, ids.len(), action);
        for id in ids {
            self.time_wait.add(id.clone(), action, termination.clone(), now);
            self.check_membership(&id);
        }
        self.stats.record_session_closed();
        true
    }

    fn send_stateless_reset(&mut self, id: &ConnectionId, datagram: &ReceivedDatagram) -> bool {
        let Some(reset) = build_stateless_reset(id, datagram.len(), &self.reset_tokens) else {
            return false;
        };
        let sent = self.send(&reset, datagram.self_addr, datagram.peer_addr);
        if sent {
            self.stats.record_stateless_reset();
        }
        sent
    }

    /// Write one datagram. A blocked or failing socket drops it.
    fn send(&mut self, buf: &[u8], self_addr: SocketAddr, peer_addr: SocketAddr) -> bool {
        if self.writer.is_write_blocked() {
            trace!("Writer blocked, dropping {} bytes to {}", buf.len(), peer_addr);
            self.stats.record_write_failed();
            return false;
        }
        match self.writer.write_packet(buf, self_addr, peer_addr) {
            WriteResult::Written(_) => true,
            WriteResult::Blocked => {
                debug!("Writer became blocked sending to {}", peer_addr);
                self.stats.record_write_failed();
                false
            }
            WriteResult::Error(e) => {
                debug!("Write to {} failed: {}", peer_addr, e);
                self.stats.record_write_failed();
                false
            }
        }
    }

    /// Apply queued validation wake-ups and session notifications.
    ///
    /// Returns the number of events that changed state.
    pub fn process_events(&mut self, now: Instant) -> usize {
        let mut handled = 0;
        for token in self.events.take_completions() {
            if self.poll_validation(token, now) {
                handled += 1;
            }
        }
        for event in self.events.take_session_events() {
            let changed = match event {
                SessionEvent::Closed(key) => self.close_session(key, now),
                SessionEvent::WriteBlocked(key) => {
                    self.sessions.contains_key(&key) && self.write_blocked.mark_blocked(key)
                }
                SessionEvent::NewConnectionId(key, id) => self.add_connection_id(key, id),
                SessionEvent::RetireConnectionId(key, id) => self.retire_connection_id(key, &id),
            };
            if changed {
                handled += 1;
            }
        }
        handled
    }

    /// Create sessions for parked handshakes, at most `limit` of them.
    ///
    /// Also resets the allowance for handshakes accepted before the next
    /// call. Returns the number of sessions created.
    pub fn process_buffered_connections(&mut self, limit: usize) -> usize {
        let now = Instant::now();
        self.process_events(now);
        self.new_sessions_allowance = limit;

        let mut created = 0;
        while self.new_sessions_allowance > 0 {
            let Some((_, ready)) = self.store.pop_ready() else {
                break;
            };
            let ReadyHandshake {
                ctx,
                hello,
                acceptance,
            } = *ready;
            if self.create_session(ctx, hello, acceptance, now) == DispatchOutcome::SessionCreated {
                created += 1;
            }
        }
        if created > 0 {
            debug!("Created {} sessions from parked handshakes", created);
        }
        created
    }

    /// Whether accepted handshakes are waiting for a drive call.
    #[must_use]
    pub fn has_ready_handshakes(&self) -> bool {
        self.store.ready_count() > 0
    }

    /// Evict idle buffered entries and expired time-wait entries, and
    /// forget peers reset in an elapsed window.
    pub fn on_expiry_tick(&mut self, now: Instant) {
        self.process_events(now);
        self.recent_resets.expire(now);

        for (id, entry) in self.store.expire(now) {
            if let EntryState::Validating(token) = entry.state() {
                self.abandon_validation(*token);
            }
            debug!(
                "Buffered entry for {} expired with {} datagrams",
                id,
                entry.len()
            );
            self.time_wait
                .add(id.clone(), TimeWaitAction::Drop, Vec::new(), now);
            self.stats.record_buffered_expired();
            self.check_membership(&id);
        }

        let expired = self.time_wait.expire(now);
        if expired > 0 {
            trace!("{} time-wait entries expired", expired);
        }
    }

    /// The socket is writable again; service write-blocked sessions.
    ///
    /// Returns the number of sessions serviced.
    pub fn on_can_write(&mut self) -> usize {
        self.process_events(Instant::now());
        self.writer.set_writable();

        let sessions = &mut self.sessions;
        let writer = &self.writer;
        self.write_blocked
            .on_writable(self.config.write_blocked_batch, |id| {
                if writer.is_write_blocked() {
                    return ServiceStep::Stop;
                }
                match sessions.get_mut(id).map(|slot| slot.session.on_writable()) {
                    Some(WriteStatus::Blocked) => ServiceStep::Reblocked,
                    Some(WriteStatus::Done) | None => ServiceStep::Done,
                }
            })
    }

    /// A session reports it is blocked on the socket.
    pub fn mark_write_blocked(&mut self, id: &ConnectionId) {
        if let Some(&key) = self.routes.get(id) {
            self.write_blocked.mark_blocked(key);
        }
    }

    /// A session reports it has closed.
    pub fn on_session_closed(&mut self, id: &ConnectionId) {
        if let Some(&key) = self.routes.get(id) {
            self.close_session(key, Instant::now());
        }
    }

    /// Stop admitting connections and discard all buffered datagrams.
    ///
    /// New attempts are refused with a stateless close.
    pub fn stop_accepting_new_connections(&mut self) {
        if !self.accepting {
            return;
        }
        self.accepting = false;
        let discarded = self.store.clear();
        for (_, entry) in &discarded {
            if let EntryState::Validating(token) = entry.state() {
                self.abandon_validation(*token);
            }
        }
        info!(
            "Stopped accepting new connections ({} buffered ids discarded)",
            discarded.len()
        );
    }

    /// Resume admitting connections.
    pub fn start_accepting_new_connections(&mut self) {
        if !self.accepting {
            info!("Accepting new connections");
            self.accepting = true;
        }
    }

    /// Whether new connections are admitted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Close every session and move all ids to time-wait.
    pub fn shutdown(&mut self) {
        let now = Instant::now();
        self.process_events(now);
        self.stop_accepting_new_connections();

        let mut keys: Vec<SessionKey> = self.sessions.keys().copied().collect();
        keys.sort_unstable();
        for key in &keys {
            if let Some(slot) = self.sessions.get_mut(key) {
                slot.session.close();
            }
            self.close_session(*key, now);
        }
        self.write_blocked.clear();
        info!("Dispatcher shut down, {} sessions closed", keys.len());
    }

    /// Which table holds `id`.
    #[must_use]
    pub fn membership(&self, id: &ConnectionId) -> Membership {
        if self.routes.contains_key(id) {
            Membership::Session
        } else if self.store.has_entry(id) {
            Membership::Buffered
        } else if self.time_wait.is_tracked(id) {
            Membership::TimeWait
        } else {
            Membership::None
        }
    }

    fn check_membership(&self, id: &ConnectionId) {
        let tables = usize::from(self.routes.contains_key(id))
            + usize::from(self.store.has_entry(id))
            + usize::from(self.time_wait.is_tracked(id));
        if tables > 1 {
            warn!("Connection id {} is in {} tables", id, tables);
        }
        debug_assert!(tables <= 1, "connection id {id} is in {tables} tables");
    }

    /// Number of active sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Connection ids routed to the session that owns `id`.
    #[must_use]
    pub fn session_ids(&self, id: &ConnectionId) -> Vec<ConnectionId> {
        self.routes
            .get(id)
            .and_then(|key| self.sessions.get(key))
            .map(|slot| slot.ids.clone())
            .unwrap_or_default()
    }

    /// Number of peers answered with a reset in the current window.
    #[must_use]
    pub fn recent_reset_count(&self) -> usize {
        self.recent_resets.len()
    }

    /// Number of buffered ids.
    #[must_use]
    pub fn buffered_count(&self) -> usize {
        self.store.len()
    }

    /// Number of validations in flight.
    #[must_use]
    pub fn pending_validations(&self) -> usize {
        self.pending.len()
    }

    /// Number of time-wait entries.
    #[must_use]
    pub fn time_wait_count(&self) -> usize {
        self.time_wait.len()
    }

    /// The time-wait registry.
    #[must_use]
    pub fn time_wait(&self) -> &TimeWaitRegistry {
        &self.time_wait
    }

    /// The buffered packet store.
    #[must_use]
    pub fn store(&self) -> &BufferedPacketStore {
        &self.store
    }

    /// Whether sessions are waiting for the socket.
    #[must_use]
    pub fn has_write_blocked_sessions(&self) -> bool {
        !self.write_blocked.is_empty()
    }

    /// Whether the writer is blocked on a full socket.
    #[must_use]
    pub fn is_write_blocked(&self) -> bool {
        self.writer.is_write_blocked()
    }
}
