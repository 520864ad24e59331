//! Time-wait registry: recently terminated connection ids.
//!
//! Datagrams for a tracked id never reach the session factory. Each entry
//! answers with its canned termination datagrams, a stateless reset, or
//! silence, depending on its action.
//!
//! # Entry lifecycle
//!
//! ```text
//!   add ──▶ Active (budget > 0) ──budget spent──▶ Exhausted (silent)
//!              │                                      │
//!              └──────────── retention elapsed ───────┴──▶ removed
//! ```
//!
//! Within the budget an entry only answers the 1st, 2nd, 4th, 8th, ...
//! datagram it receives, so a flood of trailing packets cannot turn the
//! server into an amplifier.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::packet::ConnectionId;

/// What a time-wait entry does with datagrams for its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWaitAction {
    /// Resend the canned termination datagrams
    SendTerminationPackets,
    /// Answer with a stateless reset
    SendStatelessReset,
    /// Drop silently
    Drop,
}

/// Phase of a tracked entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPhase {
    /// Responses remain in the budget
    Active,
    /// Budget spent; datagrams are dropped silently
    Exhausted,
}

/// Decision for one datagram addressed to a tracked id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeWaitResponse {
    /// Send these datagrams back to the peer
    Send(Vec<Bytes>),
    /// Send a stateless reset
    StatelessReset,
    /// Send nothing
    Drop,
}

/// Registry limits.
#[derive(Debug, Clone)]
pub struct TimeWaitConfig {
    /// How long an id stays tracked
    pub retention: Duration,
    /// Maximum tracked ids; the oldest is evicted beyond this
    pub max_entries: usize,
    /// Maximum responses per id
    pub response_budget: u32,
}

impl Default for TimeWaitConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(200),
            max_entries: 10_000,
            response_budget: 8,
        }
    }
}

#[derive(Debug)]
struct TimeWaitEntry {
    action: TimeWaitAction,
    termination: Vec<Bytes>,
    added_at: Instant,
    packets_received: u64,
    budget_remaining: u32,
    seq: u64,
}

/// Bounded, time-limited set of terminated connection ids.
#[derive(Debug)]
pub struct TimeWaitRegistry {
    config: TimeWaitConfig,
    entries: HashMap<ConnectionId, TimeWaitEntry>,
    /// Insertion order; stale records are skipped lazily
    order: VecDeque<(ConnectionId, u64)>,
    next_seq: u64,
}

impl TimeWaitRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: TimeWaitConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
        }
    }

    /// Track `id`, replacing any existing entry.
    ///
    /// Returns the id evicted to make room, if the registry was full.
    pub fn add(
        &mut self,
        id: ConnectionId,
        action: TimeWaitAction,
        termination: Vec<Bytes>,
        now: Instant,
    ) -> Option<ConnectionId> {
        let action = if action == TimeWaitAction::SendTerminationPackets && termination.is_empty()
        {
            TimeWaitAction::SendStatelessReset
        } else {
            action
        };

        let mut evicted = None;
        if !self.entries.contains_key(&id) && self.entries.len() >= self.config.max_entries {
            evicted = self.evict_oldest();
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        debug!("Time-wait add {} action={:?}", id, action);
        self.order.push_back((id.clone(), seq));
        self.entries.insert(
            id,
            TimeWaitEntry {
                action,
                termination,
                added_at: now,
                packets_received: 0,
                budget_remaining: self.config.response_budget,
                seq,
            },
        );
        evicted
    }

    fn evict_oldest(&mut self) -> Option<ConnectionId> {
        while let Some((id, seq)) = self.order.pop_front() {
            if self.entries.get(&id).is_some_and(|e| e.seq == seq) {
                self.entries.remove(&id);
                debug!("Time-wait full, evicted {}", id);
                return Some(id);
            }
        }
        None
    }

    /// Whether `id` is tracked.
    #[must_use]
    pub fn is_tracked(&self, id: &ConnectionId) -> bool {
        self.entries.contains_key(id)
    }

    /// Action of a tracked id.
    #[must_use]
    pub fn action(&self, id: &ConnectionId) -> Option<TimeWaitAction> {
        self.entries.get(id).map(|e| e.action)
    }

    /// Phase of a tracked id.
    #[must_use]
    pub fn phase(&self, id: &ConnectionId) -> Option<EntryPhase> {
        self.entries.get(id).map(|e| {
            if e.budget_remaining > 0 {
                EntryPhase::Active
            } else {
                EntryPhase::Exhausted
            }
        })
    }

    /// Decide what to do with a datagram for `id`.
    ///
    /// Untracked ids get `Drop`.
    pub fn handle(&mut self, id: &ConnectionId) -> TimeWaitResponse {
        let Some(entry) = self.entries.get_mut(id) else {
            return TimeWaitResponse::Drop;
        };
        entry.packets_received += 1;

        if entry.action == TimeWaitAction::Drop || entry.budget_remaining == 0 {
            trace!("Time-wait drop for {}", id);
            return TimeWaitResponse::Drop;
        }
        if !entry.packets_received.is_power_of_two() {
            trace!(
                "Time-wait backoff for {} (packet {})",
                id,
                entry.packets_received
            );
            return TimeWaitResponse::Drop;
        }

        entry.budget_remaining -= 1;
        match entry.action {
            TimeWaitAction::SendTerminationPackets => {
                TimeWaitResponse::Send(entry.termination.clone())
            }
            TimeWaitAction::SendStatelessReset => TimeWaitResponse::StatelessReset,
            TimeWaitAction::Drop => TimeWaitResponse::Drop,
        }
    }

    /// Remove entries older than the retention window.
    ///
    /// Returns the number removed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some((id, seq)) = self.order.front().cloned() {
            let expired = match self.entries.get(&id) {
                Some(entry) if entry.seq == seq => {
                    if now.saturating_duration_since(entry.added_at) < self.config.retention {
                        break;
                    }
                    true
                }
                // Replaced or removed since this record was queued
                _ => false,
            };
            self.order.pop_front();
            if expired {
                self.entries.remove(&id);
                trace!("Time-wait expired {}", id);
                removed += 1;
            }
        }
        removed
    }

    /// Remove an entry regardless of age.
    pub fn remove(&mut self, id: &ConnectionId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Number of tracked ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
