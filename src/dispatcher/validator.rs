//! Proof validator adapter.
//!
//! Before committing memory to a session, the router asks a
//! [`ProofValidator`] to check the client's `ClientHello` and produce the
//! server's signed proof. Signing may be slow, so `validate` returns a
//! future:
//!
//! ```text
//! validate() ──▶ future ──first poll──▶ Ready(verdict)  ──▶ continuation
//!                              │
//!                              └──▶ Pending ──waker fires──▶ router polls again
//!                                                              │
//!                                               Ready(verdict) ──▶ continuation
//! ```
//!
//! The router polls the future once when it is created; a verdict that is
//! already available is applied on the spot. Otherwise the future is parked
//! and its waker queues the validation's token on the router's event queue.
//! The waker only holds a weak reference, so a completion that fires after
//! the router is gone does nothing.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::task::Waker;

use bytes::Bytes;
use futures::future::{self, LocalBoxFuture};
use futures::task::ArcWake;
use futures::FutureExt;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::trace;

use super::events::DispatcherEvents;
use crate::handshake::ClientHello;
use crate::packet::{ConnectionId, QuicVersion};

/// Identifies one outstanding validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidationToken(pub(crate) u64);

impl ValidationToken {
    /// Raw token value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ValidationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything a validator needs to judge a connection attempt.
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    /// Connection id of the attempt
    pub connection_id: ConnectionId,
    /// Client address
    pub client_addr: SocketAddr,
    /// Server address the attempt arrived on
    pub server_addr: SocketAddr,
    /// QUIC version of the attempt
    pub version: QuicVersion,
    /// The complete `ClientHello`
    pub hello: ClientHello,
}

/// Result of a successful validation, handed to the session factory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acceptance {
    /// Signed proof for the server's first flight, if the backend signs
    pub proof: Option<Bytes>,
}

/// Outcome of a validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Admit the connection
    Accept(Acceptance),
    /// Refuse the connection with a reason phrase
    Reject(String),
}

impl Verdict {
    /// Accept without a proof.
    #[must_use]
    pub fn accept() -> Self {
        Self::Accept(Acceptance::default())
    }

    /// Reject with a reason.
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject(reason.into())
    }

    /// Whether this verdict admits the connection.
    #[must_use]
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept(_))
    }
}

/// Validates opening handshakes, possibly asynchronously.
///
/// The returned future must resolve exactly once. It is polled from the
/// dispatch loop and may be dropped unresolved when the attempt is
/// abandoned.
pub trait ProofValidator {
    /// Start validating `request`.
    fn validate(&mut self, request: ValidationRequest) -> LocalBoxFuture<'static, Verdict>;
}

impl<F> ProofValidator for F
where
    F: FnMut(ValidationRequest) -> LocalBoxFuture<'static, Verdict>,
{
    fn validate(&mut self, request: ValidationRequest) -> LocalBoxFuture<'static, Verdict> {
        self(request)
    }
}

/// Accepts every handshake immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl ProofValidator for AcceptAll {
    fn validate(&mut self, _request: ValidationRequest) -> LocalBoxFuture<'static, Verdict> {
        future::ready(Verdict::accept()).boxed_local()
    }
}

/// Signature backend wrapped by [`SigningValidator`].
pub trait ProofSigner {
    /// Sign the proof for `request`. An `Err` rejects the attempt.
    fn sign(&self, request: &ValidationRequest) -> LocalBoxFuture<'static, Result<Bytes, String>>;
}

/// HMAC-SHA256 over the server name and `ClientHello` bytes.
///
/// Stands in for a certificate key in tests and demonstrations.
#[derive(Clone)]
pub struct HmacProofSigner {
    key: Vec<u8>,
}

impl HmacProofSigner {
    /// Create a signer with `key`.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }
}

impl std::fmt::Debug for HmacProofSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacProofSigner").finish_non_exhaustive()
    }
}

impl ProofSigner for HmacProofSigner {
    fn sign(&self, request: &ValidationRequest) -> LocalBoxFuture<'static, Result<Bytes, String>> {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&self.key).expect("HMAC can take key of any size");
        mac.update(request.hello.server_name().unwrap_or_default().as_bytes());
        mac.update(request.hello.raw());
        let proof = Bytes::copy_from_slice(&mac.finalize().into_bytes());
        future::ready(Ok(proof)).boxed_local()
    }
}

/// Adapts a [`ProofSigner`] into a [`ProofValidator`].
///
/// Attempts that offer none of the configured ALPN protocols are rejected
/// without signing; the rest are accepted with the signer's proof.
#[derive(Debug, Clone)]
pub struct SigningValidator<S> {
    signer: S,
    alpn: Vec<String>,
}

impl<S: ProofSigner> SigningValidator<S> {
    /// Wrap `signer`, accepting any ALPN.
    pub fn new(signer: S) -> Self {
        Self {
            signer,
            alpn: Vec::new(),
        }
    }

    /// Require one of `alpn` to be offered.
    #[must_use]
    pub fn with_alpn(mut self, alpn: Vec<String>) -> Self {
        self.alpn = alpn;
        self
    }
}

impl<S: ProofSigner> ProofValidator for SigningValidator<S> {
    fn validate(&mut self, request: ValidationRequest) -> LocalBoxFuture<'static, Verdict> {
        if !self.alpn.is_empty()
            && !request
                .hello
                .alpn()
                .iter()
                .any(|offered| self.alpn.contains(offered))
        {
            trace!("No common ALPN for {}", request.connection_id);
            return future::ready(Verdict::reject("no application protocol")).boxed_local();
        }

        self.signer
            .sign(&request)
            .map(|signed| match signed {
                Ok(proof) => Verdict::Accept(Acceptance { proof: Some(proof) }),
                Err(reason) => Verdict::Reject(reason),
            })
            .boxed_local()
    }
}

/// Waker that queues its token on the router's event queue.
struct CompletionWaker {
    token: ValidationToken,
    events: Weak<DispatcherEvents>,
}

impl ArcWake for CompletionWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if let Some(events) = arc_self.events.upgrade() {
            events.push_completion(arc_self.token);
        }
    }
}

/// Build the waker for validation `token`.
pub(crate) fn completion_waker(token: ValidationToken, events: &Arc<DispatcherEvents>) -> Waker {
    futures::task::waker(Arc::new(CompletionWaker {
        token,
        events: Arc::downgrade(events),
    }))
}
