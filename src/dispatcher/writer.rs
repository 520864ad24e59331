//! Packet writer interface.

use std::io;
use std::net::SocketAddr;

/// Result of a single datagram write.
#[derive(Debug)]
pub enum WriteResult {
    /// The datagram was written
    Written(usize),
    /// The socket is full; the writer is now write-blocked
    Blocked,
    /// The write failed
    Error(io::Error),
}

/// Sends datagrams on the server socket.
pub trait PacketWriter {
    /// Write `buf` from `self_addr` to `peer_addr`.
    fn write_packet(
        &mut self,
        buf: &[u8],
        self_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> WriteResult;

    /// Whether a previous write hit a full socket.
    fn is_write_blocked(&self) -> bool;

    /// Clear the blocked state once the socket is writable again.
    fn set_writable(&mut self);
}
