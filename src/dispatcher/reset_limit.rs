//! Peers recently answered with a stateless reset for an unknown id.
//!
//! Each peer address gets at most one such reset per window. The whole set
//! is cleared once the window has passed, and while it is full no new peer
//! is reset at all.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::trace;

/// Reset limiter settings.
#[derive(Debug, Clone)]
pub struct ResetLimitConfig {
    /// Peers remembered per window
    pub max_addresses: usize,
    /// How long the set is kept before it is cleared
    pub lifetime: Duration,
}

impl Default for ResetLimitConfig {
    fn default() -> Self {
        Self {
            max_addresses: 1024,
            lifetime: Duration::from_secs(1),
        }
    }
}

/// Bounded set of recently reset peer addresses.
#[derive(Debug)]
pub struct RecentResets {
    config: ResetLimitConfig,
    addresses: HashSet<SocketAddr>,
    window_started: Option<Instant>,
}

impl RecentResets {
    /// Create an empty set.
    #[must_use]
    pub fn new(config: ResetLimitConfig) -> Self {
        Self {
            config,
            addresses: HashSet::new(),
            window_started: None,
        }
    }

    /// Whether `peer` may be sent a reset now.
    #[must_use]
    pub fn allows(&self, peer: &SocketAddr) -> bool {
        if self.addresses.contains(peer) {
            trace!("{} was reset recently", peer);
            return false;
        }
        if self.addresses.len() >= self.config.max_addresses {
            trace!("Recent reset set full, not resetting {}", peer);
            return false;
        }
        true
    }

    /// Remember that `peer` was sent a reset.
    pub fn record(&mut self, peer: SocketAddr, now: Instant) {
        if self.addresses.is_empty() {
            self.window_started = Some(now);
        }
        self.addresses.insert(peer);
    }

    /// Forget every peer once the window has passed.
    pub fn expire(&mut self, now: Instant) {
        let Some(started) = self.window_started else {
            return;
        };
        if now.saturating_duration_since(started) >= self.config.lifetime {
            trace!("Clearing {} recently reset peers", self.addresses.len());
            self.addresses.clear();
            self.window_started = None;
        }
    }

    /// Number of remembered peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Whether no peer is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}
