//! Cross-stack signals into the dispatch loop.
//!
//! Validation completions and session notifications may fire from a call
//! stack other than the router's. They are queued here and applied by the
//! router on its next turn, so the router's maps are only ever mutated by
//! the router itself.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::session::SessionKey;
use super::validator::ValidationToken;
use crate::packet::ConnectionId;

/// Notification raised by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session finished closing
    Closed(SessionKey),
    /// The session could not write and wants `on_writable` later
    WriteBlocked(SessionKey),
    /// The session issued a connection id
    NewConnectionId(SessionKey, ConnectionId),
    /// The peer retired a connection id
    RetireConnectionId(SessionKey, ConnectionId),
}

/// Queues shared between the router and the handles it gives out.
#[derive(Debug, Default)]
pub struct DispatcherEvents {
    completions: Mutex<VecDeque<ValidationToken>>,
    session_events: Mutex<VecDeque<SessionEvent>>,
    notify: Notify,
}

impl DispatcherEvents {
    /// Create empty queues.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a validation wake-up.
    pub fn push_completion(&self, token: ValidationToken) {
        self.completions.lock().push_back(token);
        self.notify.notify_one();
    }

    /// Queue a session notification.
    pub fn push_session_event(&self, event: SessionEvent) {
        self.session_events.lock().push_back(event);
        self.notify.notify_one();
    }

    /// Take all queued validation wake-ups.
    pub fn take_completions(&self) -> Vec<ValidationToken> {
        self.completions.lock().drain(..).collect()
    }

    /// Take all queued session notifications.
    pub fn take_session_events(&self) -> Vec<SessionEvent> {
        self.session_events.lock().drain(..).collect()
    }

    /// Whether anything is queued.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.completions.lock().is_empty() || !self.session_events.lock().is_empty()
    }

    /// Wait until something is queued.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}
