//! TLS 1.3 `ClientHello` decoding (handshake message, no record layer).
//!
//! ```text
//! HandshakeType (1) = 0x01
//! Length (3)
//! ProtocolVersion (2)
//! Random (32)
//! SessionID (1 byte length + variable)
//! CipherSuites (2 bytes length + variable)
//! CompressionMethods (1 byte length + variable)
//! Extensions (2 bytes length + variable)
//! ```

use bytes::Bytes;
use tracing::trace;

use super::transport_params::TransportParameters;
use crate::error::HandshakeError;

/// TLS handshake type of a `ClientHello`
pub const CLIENT_HELLO_TYPE: u8 = 0x01;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;
const EXT_QUIC_TRANSPORT_PARAMETERS: u16 = 0x0039;

/// A complete, decoded `ClientHello`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    raw: Bytes,
    server_name: Option<String>,
    alpn: Vec<String>,
    transport_params: Option<TransportParameters>,
}

impl ClientHello {
    /// Decode a complete handshake message.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::NotClientHello` for any other message type
    /// and `HandshakeError::MalformedClientHello` for structural errors.
    pub fn parse(raw: Bytes) -> Result<Self, HandshakeError> {
        let data = raw.as_ref();
        // 1 + 3 + 2 + 32 + 1 + 2 + 1
        if data.len() < 42 {
            return Err(HandshakeError::MalformedClientHello("too short"));
        }
        if data[0] != CLIENT_HELLO_TYPE {
            return Err(HandshakeError::NotClientHello(data[0]));
        }

        // Skip: type (1) + length (3) + version (2) + random (32)
        let mut pos: usize = 38;

        let session_id_len = usize::from(data[pos]);
        pos += 1 + session_id_len;

        let cipher_suites_len = read_u16(data, pos, "cipher suites")?;
        pos += 2 + cipher_suites_len;

        let compression_len = usize::from(
            *data
                .get(pos)
                .ok_or(HandshakeError::MalformedClientHello("compression methods"))?,
        );
        pos += 1 + compression_len;

        let mut hello = Self {
            raw: raw.clone(),
            server_name: None,
            alpn: Vec::new(),
            transport_params: None,
        };

        if pos == data.len() {
            return Ok(hello);
        }

        let extensions_len = read_u16(data, pos, "extensions length")?;
        pos += 2;
        let extensions_end = pos + extensions_len;
        if extensions_end > data.len() {
            return Err(HandshakeError::MalformedClientHello("extensions truncated"));
        }

        while pos < extensions_end {
            let ext_type = u16::try_from(read_u16(data, pos, "extension type")?)
                .map_err(|_| HandshakeError::MalformedClientHello("extension type"))?;
            let ext_len = read_u16(data, pos + 2, "extension length")?;
            pos += 4;
            if pos + ext_len > extensions_end {
                return Err(HandshakeError::MalformedClientHello("extension truncated"));
            }
            let ext_data = raw.slice(pos..pos + ext_len);

            match ext_type {
                EXT_SERVER_NAME => {
                    hello.server_name = parse_sni_extension(&ext_data);
                    if let Some(ref s) = hello.server_name {
                        trace!("Found SNI: {}", s);
                    }
                }
                EXT_ALPN => {
                    hello.alpn = parse_alpn_extension(&ext_data);
                }
                EXT_QUIC_TRANSPORT_PARAMETERS => {
                    hello.transport_params = Some(TransportParameters::parse(&ext_data)?);
                }
                _ => {}
            }

            pos += ext_len;
        }

        Ok(hello)
    }

    /// The full handshake message bytes (type and length included).
    #[must_use]
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Server Name Indication, if present and a valid hostname.
    #[must_use]
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// Offered ALPN protocols, in preference order.
    #[must_use]
    pub fn alpn(&self) -> &[String] {
        &self.alpn
    }

    /// QUIC transport parameters, if the extension was present.
    #[must_use]
    pub fn transport_params(&self) -> Option<&TransportParameters> {
        self.transport_params.as_ref()
    }
}

fn read_u16(data: &[u8], pos: usize, what: &'static str) -> Result<usize, HandshakeError> {
    match data.get(pos..pos + 2) {
        Some(b) => Ok(usize::from(u16::from_be_bytes([b[0], b[1]]))),
        None => Err(HandshakeError::MalformedClientHello(what)),
    }
}

/// Parse SNI extension data.
fn parse_sni_extension(data: &[u8]) -> Option<String> {
    if data.len() < 5 {
        return None;
    }

    let list_len = usize::from(u16::from_be_bytes([data[0], data[1]]));
    if list_len + 2 > data.len() {
        return None;
    }

    let mut pos: usize = 2;
    let end = 2 + list_len;

    while pos + 3 <= end {
        let name_type = data[pos];
        let name_len = usize::from(u16::from_be_bytes([data[pos + 1], data[pos + 2]]));
        pos += 3;

        if pos + name_len > end {
            return None;
        }

        // Name type 0 = hostname
        if name_type == 0x00 {
            let hostname = std::str::from_utf8(&data[pos..pos + name_len]).ok()?;
            return is_valid_hostname(hostname).then(|| hostname.to_ascii_lowercase());
        }

        pos += name_len;
    }

    None
}

/// Parse ALPN extension data.
fn parse_alpn_extension(data: &[u8]) -> Vec<String> {
    let mut protocols = Vec::new();

    if data.len() < 2 {
        return protocols;
    }

    let list_len = usize::from(u16::from_be_bytes([data[0], data[1]]));
    let end = (2 + list_len).min(data.len());
    let mut pos: usize = 2;

    while pos < end {
        let proto_len = usize::from(data[pos]);
        pos += 1;

        if pos + proto_len > end {
            break;
        }

        if let Ok(proto) = std::str::from_utf8(&data[pos..pos + proto_len]) {
            protocols.push(proto.to_string());
        }

        pos += proto_len;
    }

    protocols
}

/// Hostname check (RFC 1123 characters).
fn is_valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > 253 {
        return false;
    }

    hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}
