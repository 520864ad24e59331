//! FIFO of sessions waiting for the socket to become writable.

use std::collections::{HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;

use tracing::trace;

use crate::packet::ConnectionId;

/// What happened when one blocked session was serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStep {
    /// The session wrote everything it had
    Done,
    /// The session blocked again; it goes to the back of the queue
    Reblocked,
    /// The writer is blocked; the session keeps its place and the pass ends
    Stop,
}

/// De-duplicated queue of write-blocked sessions.
///
/// The router queues its session keys; any hashable handle works.
#[derive(Debug)]
pub struct WriteBlockedList<K = ConnectionId> {
    queue: VecDeque<K>,
    members: HashSet<K>,
}

impl<K> Default for WriteBlockedList<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            members: HashSet::new(),
        }
    }
}

impl<K: Clone + Eq + Hash + Display> WriteBlockedList<K> {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `id` unless it is already queued.
    ///
    /// Returns `true` if it was added.
    pub fn mark_blocked(&mut self, id: K) -> bool {
        if !self.members.insert(id.clone()) {
            return false;
        }
        trace!("Session {} write-blocked", id);
        self.queue.push_back(id);
        true
    }

    /// Remove `id` from the queue.
    pub fn remove(&mut self, id: &K) -> bool {
        if !self.members.remove(id) {
            return false;
        }
        self.queue.retain(|queued| queued != id);
        true
    }

    /// Whether `id` is queued.
    #[must_use]
    pub fn is_blocked(&self, id: &K) -> bool {
        self.members.contains(id)
    }

    /// Number of queued sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop every queued session.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.members.clear();
    }

    /// Service up to `max_to_service` sessions in FIFO order.
    ///
    /// Only sessions queued when the pass starts are serviced, so one that
    /// re-blocks is not serviced twice in the same pass. Returns the number
    /// of sessions serviced.
    pub fn on_writable<F>(&mut self, max_to_service: usize, mut service: F) -> usize
    where
        F: FnMut(&K) -> ServiceStep,
    {
        let batch = max_to_service.min(self.queue.len());
        let mut serviced = 0;

        for _ in 0..batch {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            match service(&id) {
                ServiceStep::Done => {
                    self.members.remove(&id);
                    serviced += 1;
                }
                ServiceStep::Reblocked => {
                    self.queue.push_back(id);
                    serviced += 1;
                }
                ServiceStep::Stop => {
                    self.queue.push_front(id);
                    break;
                }
            }
        }

        serviced
    }
}
