//! Server-chosen replacement connection ids.
//!
//! A client may open with a destination id of any length from 8 to 20
//! bytes, but short headers are parsed at one fixed length. When the two
//! differ the server routes on a replacement of the fixed length, derived
//! as `HMAC-SHA256(secret, "replace" || original)` so retransmitted Initials
//! map to the same id.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::packet::{ConnectionId, MAX_CONNECTION_ID_LEN};

const LABEL: &[u8] = b"replace";

/// Derives replacement connection ids from a secret.
#[derive(Clone)]
pub struct ConnectionIdGenerator {
    secret: Vec<u8>,
    length: usize,
}

impl ConnectionIdGenerator {
    /// Generator issuing ids of `length` bytes.
    pub fn new(secret: impl Into<Vec<u8>>, length: usize) -> Self {
        Self {
            secret: secret.into(),
            length: length.min(MAX_CONNECTION_ID_LEN),
        }
    }

    /// Generator with a fresh random secret.
    #[must_use]
    pub fn random(length: usize) -> Self {
        let mut secret = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::new(secret, length)
    }

    /// Length of the ids this generator issues.
    #[must_use]
    pub fn length(&self) -> usize {
        self.length
    }

    /// Replacement for `original`, or `None` when it already has the
    /// issued length.
    #[must_use]
    pub fn maybe_replace(&self, original: &ConnectionId) -> Option<ConnectionId> {
        if original.len() == self.length {
            return None;
        }
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
            .expect("HMAC can take key of any size");
        mac.update(LABEL);
        mac.update(original.as_bytes());
        let digest = mac.finalize().into_bytes();
        Some(ConnectionId::from_slice(&digest[..self.length]))
    }
}

impl std::fmt::Debug for ConnectionIdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionIdGenerator")
            .field("secret", &"<redacted>")
            .field("length", &self.length)
            .finish()
    }
}
