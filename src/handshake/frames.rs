//! Frame walking for decrypted Initial payloads.
//!
//! Only the frames RFC 9000 permits in Initial packets are understood:
//! PADDING, PING, ACK, ACK_ECN, CRYPTO and transport CONNECTION_CLOSE.
//! Anything else is a protocol violation.

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::HandshakeError;
use crate::packet::varint;

/// A CRYPTO frame (RFC 9000 Section 19.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame {
    /// Offset of `data` in the Initial crypto stream
    pub offset: u64,
    /// Stream data
    pub data: Bytes,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn varint(&mut self) -> Result<u64, HandshakeError> {
        let (value, size) = varint::decode(&self.buf[self.pos..])
            .ok_or(HandshakeError::MalformedFrame("truncated varint"))?;
        self.pos += size;
        Ok(value)
    }

    fn bytes(&mut self, len: u64) -> Result<&'a [u8], HandshakeError> {
        let len = usize::try_from(len).map_err(|_| HandshakeError::MalformedFrame("length"))?;
        if self.buf.len() - self.pos < len {
            return Err(HandshakeError::MalformedFrame("frame data truncated"));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }
}

/// Collect the CRYPTO frames of a decrypted Initial payload.
///
/// Stops at a CONNECTION_CLOSE frame; frames after it are ignored.
///
/// # Errors
///
/// Returns `HandshakeError::MalformedFrame` for truncated frames or frame
/// types not allowed in Initial packets.
pub fn crypto_frames(payload: &[u8]) -> Result<Vec<CryptoFrame>, HandshakeError> {
    let mut frames = Vec::new();
    let mut r = Reader { buf: payload, pos: 0 };

    while r.pos < payload.len() {
        let frame_type = payload[r.pos];
        r.pos += 1;

        match frame_type {
            // PADDING, PING
            0x00 | 0x01 => {}

            // ACK, ACK_ECN
            0x02 | 0x03 => {
                let _largest = r.varint()?;
                let _delay = r.varint()?;
                let range_count = r.varint()?;
                let _first_range = r.varint()?;
                for _ in 0..range_count {
                    let _gap = r.varint()?;
                    let _len = r.varint()?;
                }
                if frame_type == 0x03 {
                    for _ in 0..3 {
                        let _ecn = r.varint()?;
                    }
                }
            }

            // CRYPTO
            0x06 => {
                let offset = r.varint()?;
                let length = r.varint()?;
                let data = r.bytes(length)?;
                trace!("Found CRYPTO frame: offset={}, length={}", offset, length);
                frames.push(CryptoFrame {
                    offset,
                    data: Bytes::copy_from_slice(data),
                });
            }

            // CONNECTION_CLOSE (transport)
            0x1c => {
                debug!("Encountered CONNECTION_CLOSE frame in Initial packet");
                break;
            }

            other => {
                trace!("Frame type 0x{:02x} not allowed in Initial", other);
                return Err(HandshakeError::MalformedFrame("frame not allowed in Initial"));
            }
        }
    }

    Ok(frames)
}
