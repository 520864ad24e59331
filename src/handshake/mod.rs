//! Opening-handshake extraction.
//!
//! Turns client Initial packets into a `ClientHello`:
//!
//! ```text
//! Initial packet ──open_initial──▶ frames ──crypto_frames──▶ CRYPTO data
//!                                                              │
//!                                   ClientHelloAssembler ◀─────┘
//!                                          │
//!                    Incomplete | Complete(ClientHello) | Duplicate
//! ```
//!
//! Decryption failures mean the datagram is not a usable Initial and are
//! reported as [`DispatchError::Initial`]. Errors in the handshake stream
//! itself are reported as [`DispatchError::Handshake`] and are fatal for
//! the connection attempt.

pub mod assembler;
pub mod client_hello;
pub mod frames;
pub mod transport_params;

pub use assembler::{AssemblyStatus, ClientHelloAssembler};
pub use client_hello::ClientHello;
pub use frames::{crypto_frames, CryptoFrame};
pub use transport_params::TransportParameters;

use crate::crypto::open_initial;
use crate::error::DispatchError;
use crate::packet::PacketHeader;

/// Largest `ClientHello` the assembler accepts.
pub const MAX_CLIENT_HELLO_SIZE: usize = 16 * 1024;

/// Open a client Initial and feed its CRYPTO frames to `assembler`.
///
/// # Errors
///
/// `DispatchError::Initial` if the packet cannot be opened,
/// `DispatchError::Handshake` if the handshake stream is invalid.
pub fn feed_initial(
    data: &[u8],
    header: &PacketHeader,
    assembler: &mut ClientHelloAssembler,
) -> Result<AssemblyStatus, DispatchError> {
    let plaintext = open_initial(data, header)?;
    let frames = crypto_frames(&plaintext)?;
    Ok(assembler.push(frames)?)
}
