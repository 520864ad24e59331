//! Stateless datagrams the dispatcher emits without any session state.
//!
//! - Version negotiation (RFC 9000 Section 17.2.1)
//! - Stateless CONNECTION_CLOSE sealed in a server Initial
//! - Stateless reset (RFC 9000 Section 10.3)

use bytes::{BufMut, Bytes, BytesMut};
use rand::{Rng, RngCore};
use tracing::trace;

use super::{varint, ConnectionId, PacketHeader, QuicVersion};
use crate::crypto::{seal_initial, InitialKeys, InitialPacket, ResetTokenGenerator, Side, RESET_TOKEN_LEN};
use crate::error::{HandshakeError, InitialError};

/// Smallest stateless reset: 5 unpredictable bytes plus the token.
pub const MIN_STATELESS_RESET_SIZE: usize = 5 + RESET_TOKEN_LEN;

/// Largest stateless reset we send, regardless of the trigger size.
const MAX_STATELESS_RESET_SIZE: usize = 43;

/// Transport error code `CONNECTION_REFUSED`.
const CONNECTION_REFUSED: u64 = 0x02;

/// CONNECTION_CLOSE frame type for transport errors.
const CONNECTION_CLOSE_FRAME: u8 = 0x1c;

/// Error code and reason phrase for a stateless close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// QUIC transport error code
    pub code: u64,
    /// Reason phrase (diagnostic only)
    pub reason: String,
}

impl CloseReason {
    /// `CONNECTION_REFUSED` with a reason phrase.
    pub fn refused(reason: impl Into<String>) -> Self {
        Self {
            code: CONNECTION_REFUSED,
            reason: reason.into(),
        }
    }

    /// Close reason for a malformed or unexpected handshake.
    #[must_use]
    pub fn from_handshake_error(err: &HandshakeError) -> Self {
        Self {
            code: err.transport_error_code(),
            reason: err.to_string(),
        }
    }
}

/// Random reserved version of the form `0x?a?a?a?a`.
fn grease_version() -> u32 {
    (rand::thread_rng().gen::<u32>() & 0xf0f0_f0f0) | 0x0a0a_0a0a
}

/// Build a version negotiation packet answering `header`.
///
/// The connection ids are echoed swapped: the client's SCID becomes the
/// DCID. A reserved version is listed alongside `supported` so clients
/// exercise their handling of unknown versions.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn build_version_negotiation(header: &PacketHeader, supported: &[QuicVersion]) -> Bytes {
    let mut buf = BytesMut::with_capacity(
        7 + header.dcid.len() + header.scid.len() + 4 * (supported.len() + 1),
    );

    buf.put_u8(0x80 | (rand::thread_rng().gen::<u8>() & 0x7f));
    buf.put_u32(0);
    buf.put_u8(header.scid.len() as u8);
    buf.extend_from_slice(&header.scid);
    buf.put_u8(header.dcid.len() as u8);
    buf.extend_from_slice(&header.dcid);
    for version in supported {
        buf.put_u32(version.as_u32());
    }
    buf.put_u32(grease_version());

    trace!(
        "Built version negotiation for {} ({} versions)",
        hex::encode(&header.dcid),
        supported.len() + 1
    );

    buf.freeze()
}

/// Build a stateless CONNECTION_CLOSE in reply to a client Initial.
///
/// The packet is a server Initial protected with keys derived from the
/// client's DCID, so the client can open it without any handshake state.
///
/// # Errors
///
/// Returns `InitialError` if `header` is not from a known version or
/// sealing fails.
pub fn build_stateless_close(
    header: &PacketHeader,
    reason: &CloseReason,
) -> Result<Bytes, InitialError> {
    let version = header.version.ok_or(InitialError::NotInitial)?;
    let keys = InitialKeys::derive(&header.dcid, version, Side::Server)?;

    let phrase = reason.reason.as_bytes();
    let phrase = &phrase[..phrase.len().min(64)];

    let mut frames = Vec::with_capacity(8 + phrase.len());
    frames.put_u8(CONNECTION_CLOSE_FRAME);
    varint::encode(reason.code, &mut frames);
    // Frame type that triggered the close: unknown
    varint::encode(0, &mut frames);
    varint::encode(phrase.len() as u64, &mut frames);
    frames.extend_from_slice(phrase);

    let packet = seal_initial(
        &keys,
        &InitialPacket {
            version,
            dcid: &header.scid,
            scid: &header.dcid,
            token: &[],
            packet_number: 0,
        },
        &frames,
    )?;

    Ok(Bytes::from(packet))
}

/// Build a stateless reset for `cid`, triggered by a packet of
/// `trigger_len` bytes.
///
/// Returns `None` when the trigger is too short: a reset must be smaller
/// than the packet that caused it and still be at least
/// [`MIN_STATELESS_RESET_SIZE`] bytes.
#[must_use]
pub fn build_stateless_reset(
    cid: &ConnectionId,
    trigger_len: usize,
    tokens: &ResetTokenGenerator,
) -> Option<Bytes> {
    if trigger_len <= MIN_STATELESS_RESET_SIZE {
        return None;
    }
    let len = (trigger_len - 1).min(MAX_STATELESS_RESET_SIZE);

    let mut buf = vec![0u8; len];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut buf[..len - RESET_TOKEN_LEN]);
    buf[0] = 0x40 | (buf[0] & 0x3f);
    buf[len - RESET_TOKEN_LEN..].copy_from_slice(&tokens.token(cid));

    Some(Bytes::from(buf))
}
