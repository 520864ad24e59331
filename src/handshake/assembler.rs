//! Reassembly of a `ClientHello` spread over several Initial packets.
//!
//! CRYPTO frames may arrive out of order, overlap, or repeat. The assembler
//! keeps the contiguous prefix of the crypto stream plus any out-of-order
//! fragments, and reports a complete message as soon as the prefix covers
//! the handshake header's declared length.

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::trace;

use super::client_hello::{ClientHello, CLIENT_HELLO_TYPE};
use super::frames::CryptoFrame;
use super::MAX_CLIENT_HELLO_SIZE;
use crate::error::HandshakeError;

/// Result of feeding CRYPTO frames to the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyStatus {
    /// More data is needed
    Incomplete,
    /// The `ClientHello` just became complete
    Complete(Box<ClientHello>),
    /// The `ClientHello` was already complete; nothing new
    Duplicate,
}

/// Per-connection `ClientHello` reassembly state.
#[derive(Debug, Default)]
pub struct ClientHelloAssembler {
    /// Contiguous stream data from offset 0
    contiguous: Vec<u8>,
    /// Out-of-order fragments keyed by offset
    pending: BTreeMap<u64, Bytes>,
    pending_bytes: usize,
    complete: bool,
}

impl ClientHelloAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a complete `ClientHello` has been assembled.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Bytes of the crypto stream received contiguously from offset 0.
    #[must_use]
    pub fn contiguous_len(&self) -> usize {
        self.contiguous.len()
    }

    /// Feed the CRYPTO frames of one packet.
    ///
    /// # Errors
    ///
    /// Returns a `HandshakeError` when the stream cannot be a `ClientHello`
    /// within the size limit. The error is fatal for the attempt.
    pub fn push(&mut self, frames: Vec<CryptoFrame>) -> Result<AssemblyStatus, HandshakeError> {
        if self.complete {
            return Ok(AssemblyStatus::Duplicate);
        }

        for frame in frames {
            self.insert(frame)?;
        }
        self.absorb_pending();

        let Some(total) = self.message_len()? else {
            return Ok(AssemblyStatus::Incomplete);
        };
        if self.contiguous.len() < total {
            trace!(
                "ClientHello incomplete: {}/{} bytes",
                self.contiguous.len(),
                total
            );
            return Ok(AssemblyStatus::Incomplete);
        }

        let raw = Bytes::copy_from_slice(&self.contiguous[..total]);
        let hello = ClientHello::parse(raw)?;
        self.complete = true;
        self.contiguous = Vec::new();
        self.pending.clear();
        self.pending_bytes = 0;
        Ok(AssemblyStatus::Complete(Box::new(hello)))
    }

    fn insert(&mut self, frame: CryptoFrame) -> Result<(), HandshakeError> {
        let end = frame.offset + frame.data.len() as u64;
        if end > MAX_CLIENT_HELLO_SIZE as u64 {
            return Err(HandshakeError::TooLarge {
                len: usize::try_from(end).unwrap_or(usize::MAX),
                max: MAX_CLIENT_HELLO_SIZE,
            });
        }
        if frame.data.is_empty() {
            return Ok(());
        }

        let have = self.contiguous.len() as u64;
        if frame.offset <= have {
            // Overlaps or extends the prefix
            #[allow(clippy::cast_possible_truncation)]
            let skip = (have - frame.offset) as usize;
            if skip < frame.data.len() {
                self.contiguous.extend_from_slice(&frame.data[skip..]);
            }
        } else if !self.pending.contains_key(&frame.offset) {
            self.pending_bytes += frame.data.len();
            if self.pending_bytes > MAX_CLIENT_HELLO_SIZE {
                return Err(HandshakeError::TooLarge {
                    len: self.pending_bytes,
                    max: MAX_CLIENT_HELLO_SIZE,
                });
            }
            self.pending.insert(frame.offset, frame.data);
        }
        Ok(())
    }

    fn absorb_pending(&mut self) {
        while let Some((&offset, _)) = self.pending.first_key_value() {
            if offset > self.contiguous.len() as u64 {
                break;
            }
            if let Some(data) = self.pending.remove(&offset) {
                self.pending_bytes -= data.len();
                #[allow(clippy::cast_possible_truncation)]
                let skip = (self.contiguous.len() as u64 - offset) as usize;
                if skip < data.len() {
                    self.contiguous.extend_from_slice(&data[skip..]);
                }
            }
        }
    }

    /// Declared message length once the 4-byte handshake header is present.
    fn message_len(&self) -> Result<Option<usize>, HandshakeError> {
        if self.contiguous.len() < 4 {
            return Ok(None);
        }
        if self.contiguous[0] != CLIENT_HELLO_TYPE {
            return Err(HandshakeError::NotClientHello(self.contiguous[0]));
        }
        let body = u32::from_be_bytes([
            0,
            self.contiguous[1],
            self.contiguous[2],
            self.contiguous[3],
        ]) as usize;
        let total = body + 4;
        if total > MAX_CLIENT_HELLO_SIZE {
            return Err(HandshakeError::TooLarge {
                len: total,
                max: MAX_CLIENT_HELLO_SIZE,
            });
        }
        Ok(Some(total))
    }
}
