//! Cryptographic helpers for stateless operation.
//!
//! - [`initial`]: Initial packet protection, used to read `ClientHello`s and
//!   to seal stateless CONNECTION_CLOSE packets
//! - [`reset`]: stateless reset token generation
//! - [`cid`]: replacement connection ids

pub mod cid;
pub mod initial;
pub mod reset;

pub use cid::ConnectionIdGenerator;
pub use initial::{open_initial, open_with_keys, seal_initial, InitialKeys, InitialPacket, Side};
pub use reset::{ResetTokenGenerator, RESET_TOKEN_LEN};
