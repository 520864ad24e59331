//! Dispatcher statistics
//!
//! Counters are atomics so a reporting task can read them while the
//! dispatch loop runs; only the dispatch loop writes them.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::DropReason;

/// Atomic dispatcher statistics
#[derive(Debug, Default)]
pub struct DispatcherStats {
    packets_received: AtomicU64,
    packets_delivered: AtomicU64,
    packets_buffered: AtomicU64,
    dropped_unparseable: AtomicU64,
    dropped_blocked_port: AtomicU64,
    dropped_short_connection_id: AtomicU64,
    dropped_too_small: AtomicU64,
    dropped_buffer_full: AtomicU64,
    dropped_duplicate_handshake: AtomicU64,
    dropped_undecryptable: AtomicU64,
    dropped_reset_limited: AtomicU64,
    dropped_other: AtomicU64,
    sessions_created: AtomicU64,
    session_create_failures: AtomicU64,
    sessions_closed: AtomicU64,
    validations_started: AtomicU64,
    validations_completed: AtomicU64,
    validations_abandoned: AtomicU64,
    stale_completions: AtomicU64,
    rejections: AtomicU64,
    version_negotiations: AtomicU64,
    stateless_resets: AtomicU64,
    time_wait_responses: AtomicU64,
    buffered_expired: AtomicU64,
    writes_failed: AtomicU64,
}

impl DispatcherStats {
    /// Create new statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received datagram
    pub fn record_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a datagram delivered to a session
    pub fn record_delivered(&self) {
        self.packets_delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a datagram accepted into the store
    pub fn record_buffered(&self) {
        self.packets_buffered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a created session
    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session factory failure
    pub fn record_session_create_failure(&self) {
        self.session_create_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session moved to time-wait
    pub fn record_session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a submitted validation
    pub fn record_validation_started(&self) {
        self.validations_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an applied verdict
    pub fn record_validation_completed(&self) {
        self.validations_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a validation discarded before completion
    pub fn record_validation_abandoned(&self) {
        self.validations_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completion for an unknown token
    pub fn record_stale_completion(&self) {
        self.stale_completions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stateless rejection
    pub fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a version negotiation packet
    pub fn record_version_negotiation(&self) {
        self.version_negotiations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stateless reset
    pub fn record_stateless_reset(&self) {
        self.stateless_resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a time-wait response
    pub fn record_time_wait_response(&self) {
        self.time_wait_responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an expired buffered entry
    pub fn record_buffered_expired(&self) {
        self.buffered_expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed or blocked write
    pub fn record_write_failed(&self) {
        self.writes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get received datagrams
    #[must_use]
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    /// Get created sessions
    #[must_use]
    pub fn sessions_created(&self) -> u64 {
        self.sessions_created.load(Ordering::Relaxed)
    }

    /// Record a dropped datagram
    pub fn record_dropped(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Unparseable => &self.dropped_unparseable,
            DropReason::BlockedSourcePort => &self.dropped_blocked_port,
            DropReason::ShortConnectionId => &self.dropped_short_connection_id,
            DropReason::TooSmall => &self.dropped_too_small,
            DropReason::BufferFull => &self.dropped_buffer_full,
            DropReason::DuplicateHandshake => &self.dropped_duplicate_handshake,
            DropReason::Undecryptable => &self.dropped_undecryptable,
            DropReason::ResetLimited => &self.dropped_reset_limited,
            DropReason::UnknownConnection | DropReason::NotAccepting => &self.dropped_other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Total dropped datagrams across all reasons
    #[must_use]
    pub fn dropped_total(&self) -> u64 {
        [
            &self.dropped_unparseable,
            &self.dropped_blocked_port,
            &self.dropped_short_connection_id,
            &self.dropped_too_small,
            &self.dropped_buffer_full,
            &self.dropped_duplicate_handshake,
            &self.dropped_undecryptable,
            &self.dropped_reset_limited,
            &self.dropped_other,
        ]
        .iter()
        .map(|c| c.load(Ordering::Relaxed))
        .sum()
    }

    /// Get a snapshot of all statistics
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            packets_received: load(&self.packets_received),
            packets_delivered: load(&self.packets_delivered),
            packets_buffered: load(&self.packets_buffered),
            dropped: DroppedSnapshot {
                unparseable: load(&self.dropped_unparseable),
                blocked_port: load(&self.dropped_blocked_port),
                short_connection_id: load(&self.dropped_short_connection_id),
                too_small: load(&self.dropped_too_small),
                buffer_full: load(&self.dropped_buffer_full),
                duplicate_handshake: load(&self.dropped_duplicate_handshake),
                undecryptable: load(&self.dropped_undecryptable),
                reset_limited: load(&self.dropped_reset_limited),
                other: load(&self.dropped_other),
            },
            sessions_created: load(&self.sessions_created),
            session_create_failures: load(&self.session_create_failures),
            sessions_closed: load(&self.sessions_closed),
            validations_started: load(&self.validations_started),
            validations_completed: load(&self.validations_completed),
            validations_abandoned: load(&self.validations_abandoned),
            stale_completions: load(&self.stale_completions),
            rejections: load(&self.rejections),
            version_negotiations: load(&self.version_negotiations),
            stateless_resets: load(&self.stateless_resets),
            time_wait_responses: load(&self.time_wait_responses),
            buffered_expired: load(&self.buffered_expired),
            writes_failed: load(&self.writes_failed),
            #[allow(clippy::cast_possible_truncation)]
            timestamp_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }
}

/// Dropped datagram counters by reason
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedSnapshot {
    pub unparseable: u64,
    pub blocked_port: u64,
    pub short_connection_id: u64,
    pub too_small: u64,
    pub buffer_full: u64,
    pub duplicate_handshake: u64,
    pub undecryptable: u64,
    pub reset_limited: u64,
    pub other: u64,
}

/// Snapshot of dispatcher statistics at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Datagrams handed to the router
    pub packets_received: u64,
    /// Datagrams delivered to sessions (directly or replayed)
    pub packets_delivered: u64,
    /// Datagrams accepted into the buffered packet store
    pub packets_buffered: u64,
    /// Dropped datagrams by reason
    pub dropped: DroppedSnapshot,
    /// Sessions created by the factory
    pub sessions_created: u64,
    /// Factory failures
    pub session_create_failures: u64,
    /// Sessions moved to time-wait
    pub sessions_closed: u64,
    /// Validations submitted
    pub validations_started: u64,
    /// Validations whose verdict was applied
    pub validations_completed: u64,
    /// Validations discarded before completing
    pub validations_abandoned: u64,
    /// Completions for unknown validation tokens
    pub stale_completions: u64,
    /// Stateless rejections sent
    pub rejections: u64,
    /// Version negotiation packets sent
    pub version_negotiations: u64,
    /// Stateless resets sent
    pub stateless_resets: u64,
    /// Responses sent from time-wait
    pub time_wait_responses: u64,
    /// Buffered entries evicted by expiry
    pub buffered_expired: u64,
    /// Writes that failed or hit a blocked socket
    pub writes_failed: u64,
    /// Unix timestamp of the snapshot in milliseconds
    pub timestamp_ms: u64,
}
