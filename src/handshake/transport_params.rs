//! QUIC transport parameters (RFC 9000 Section 18).
//!
//! Carried in the `quic_transport_parameters` TLS extension (0x39) as a
//! sequence of `(varint id, varint length, value)` entries. The dispatcher
//! does not interpret them beyond a few accessors; the session consumes the
//! full set.

use bytes::Bytes;

use crate::error::HandshakeError;
use crate::packet::{varint, ConnectionId};

/// Transport parameter ids the dispatcher knows by name.
pub mod id {
    pub const MAX_IDLE_TIMEOUT: u64 = 0x01;
    pub const MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
    pub const INITIAL_MAX_DATA: u64 = 0x04;
    pub const INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
    pub const INITIAL_SOURCE_CONNECTION_ID: u64 = 0x0f;
}

/// Decoded transport parameters, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportParameters {
    params: Vec<(u64, Bytes)>,
}

impl TransportParameters {
    /// Parse the body of the transport parameters extension.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::MalformedClientHello` for truncated entries
    /// or a repeated parameter id.
    pub fn parse(data: &Bytes) -> Result<Self, HandshakeError> {
        let mut params: Vec<(u64, Bytes)> = Vec::new();
        let mut pos = 0;

        while pos < data.len() {
            let (param_id, sz) = varint::decode(&data[pos..])
                .ok_or(HandshakeError::MalformedClientHello("transport parameter id"))?;
            pos += sz;
            let (len, sz) = varint::decode(&data[pos..])
                .ok_or(HandshakeError::MalformedClientHello("transport parameter length"))?;
            pos += sz;
            let len = usize::try_from(len)
                .map_err(|_| HandshakeError::MalformedClientHello("transport parameter length"))?;
            if data.len() - pos < len {
                return Err(HandshakeError::MalformedClientHello(
                    "transport parameter truncated",
                ));
            }
            if params.iter().any(|(existing, _)| *existing == param_id) {
                return Err(HandshakeError::MalformedClientHello(
                    "duplicate transport parameter",
                ));
            }
            params.push((param_id, data.slice(pos..pos + len)));
            pos += len;
        }

        Ok(Self { params })
    }

    /// Raw value of a parameter.
    #[must_use]
    pub fn get(&self, param_id: u64) -> Option<&Bytes> {
        self.params
            .iter()
            .find(|(existing, _)| *existing == param_id)
            .map(|(_, value)| value)
    }

    /// Integer-valued parameter.
    #[must_use]
    pub fn get_varint(&self, param_id: u64) -> Option<u64> {
        let value = self.get(param_id)?;
        match varint::decode(value) {
            Some((v, sz)) if sz == value.len() => Some(v),
            _ => None,
        }
    }

    /// `initial_source_connection_id`
    #[must_use]
    pub fn initial_source_connection_id(&self) -> Option<ConnectionId> {
        self.get(id::INITIAL_SOURCE_CONNECTION_ID)
            .map(|v| ConnectionId::new(v.clone()))
    }

    /// `max_idle_timeout` in milliseconds
    #[must_use]
    pub fn max_idle_timeout(&self) -> Option<u64> {
        self.get_varint(id::MAX_IDLE_TIMEOUT)
    }

    /// `max_udp_payload_size`
    #[must_use]
    pub fn max_udp_payload_size(&self) -> Option<u64> {
        self.get_varint(id::MAX_UDP_PAYLOAD_SIZE)
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether no parameters were sent.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Iterate over `(id, value)` pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Bytes)> {
        self.params.iter().map(|(param_id, value)| (*param_id, value))
    }
}
