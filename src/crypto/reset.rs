//! Stateless reset tokens (RFC 9000 Section 10.3.2).
//!
//! A token is `HMAC-SHA256(secret, connection_id)` truncated to 16 bytes, so
//! any server instance sharing the secret can regenerate it without state.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::packet::ConnectionId;

/// Length of a stateless reset token.
pub const RESET_TOKEN_LEN: usize = 16;

/// Derives stateless reset tokens from a static secret.
#[derive(Clone)]
pub struct ResetTokenGenerator {
    secret: Vec<u8>,
}

impl ResetTokenGenerator {
    /// Create a generator from a configured secret.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Create a generator with a fresh random 32-byte secret.
    ///
    /// Tokens from such a generator do not survive a restart.
    #[must_use]
    pub fn random() -> Self {
        let mut secret = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self { secret }
    }

    /// Token for `cid`.
    #[must_use]
    pub fn token(&self, cid: &ConnectionId) -> [u8; RESET_TOKEN_LEN] {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
            .expect("HMAC can take key of any size");
        mac.update(cid.as_bytes());
        let digest = mac.finalize().into_bytes();

        let mut token = [0u8; RESET_TOKEN_LEN];
        token.copy_from_slice(&digest[..RESET_TOKEN_LEN]);
        token
    }
}

impl std::fmt::Debug for ResetTokenGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResetTokenGenerator")
            .field("secret", &"<redacted>")
            .finish()
    }
}
