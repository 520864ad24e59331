//! QUIC public header parsing.
//!
//! The dispatcher only needs the unprotected parts of a packet: the header
//! form, the version, the connection ids and (for Initial packets) the
//! token and Length fields that locate the protected payload.
//!
//! ## Long Header Format
//!
//! ```text
//! +-+-+-+-+-+-+-+-+
//! |1|1|T T|X X X X|  First byte (Header Form=1, Fixed Bit=1, Type, Reserved, PNLength)
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Version (32)                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | DCID Len (8)  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               Destination Connection ID (0..160)              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | SCID Len (8)  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 Source Connection ID (0..160)                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! ## Short Header Format
//!
//! ```text
//! +-+-+-+-+-+-+-+-+
//! |0|1|S|R|R|K|P P|
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                Destination Connection ID (0..160)           ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Short headers do not carry the connection id length, so the server's
//! own id length must be supplied by the caller.
//!
//! Headers of unknown versions are parsed only up to the source connection
//! id, with ids up to 255 bytes, so that a version negotiation packet can
//! echo them back.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{varint, ConnectionId, MAX_CONNECTION_ID_LEN};
use crate::error::HeaderError;

/// Known QUIC versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuicVersion {
    /// QUIC version 1 (RFC 9000)
    V1,
    /// QUIC version 2 (RFC 9369)
    V2,
    /// Draft version
    Draft(u32),
    /// Unknown version
    Unknown(u32),
}

impl QuicVersion {
    /// Parse version from its wire value.
    #[must_use]
    pub const fn from_u32(version: u32) -> Self {
        match version {
            0x0000_0001 => Self::V1,
            0x6b33_43cf => Self::V2,
            v if v >= 0xff00_0000 => Self::Draft(v),
            v => Self::Unknown(v),
        }
    }

    /// Get the raw version number.
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        match self {
            Self::V1 => 0x0000_0001,
            Self::V2 => 0x6b33_43cf,
            Self::Draft(v) | Self::Unknown(v) => *v,
        }
    }

    /// Whether this version's wire image is understood by the dispatcher.
    #[must_use]
    pub const fn is_known(&self) -> bool {
        matches!(self, Self::V1 | Self::V2)
    }

    /// Whether this is a reserved greasing version (`0x?a?a?a?a`).
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        self.as_u32() & 0x0f0f_0f0f == 0x0a0a_0a0a
    }
}

impl std::fmt::Display for QuicVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V1 => write!(f, "QUICv1"),
            Self::V2 => write!(f, "QUICv2"),
            Self::Draft(v) => write!(f, "draft-{:02}", v & 0xff),
            Self::Unknown(v) => write!(f, "unknown-0x{v:08x}"),
        }
    }
}

/// QUIC packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// Initial packet (carries the `ClientHello`)
    Initial,
    /// 0-RTT packet
    ZeroRtt,
    /// Handshake packet
    Handshake,
    /// Retry packet
    Retry,
    /// Short header (1-RTT data)
    Short,
    /// Long header of an unknown version
    Unknown(u8),
}

impl PacketType {
    /// Parse packet type from first byte and version.
    #[must_use]
    pub const fn from_header(first_byte: u8, version: QuicVersion) -> Self {
        if first_byte & 0x80 == 0 {
            return Self::Short;
        }

        let packet_type = (first_byte & 0x30) >> 4;

        match version {
            QuicVersion::V1 | QuicVersion::Draft(_) => match packet_type {
                0 => Self::Initial,
                1 => Self::ZeroRtt,
                2 => Self::Handshake,
                _ => Self::Retry,
            },
            QuicVersion::V2 => match packet_type {
                // v2 rotates the type values
                1 => Self::Initial,
                2 => Self::ZeroRtt,
                3 => Self::Handshake,
                _ => Self::Retry,
            },
            QuicVersion::Unknown(_) => Self::Unknown(packet_type),
        }
    }

    /// Long-header type bits (already shifted into place) for `version`.
    #[must_use]
    pub const fn type_bits(&self, version: QuicVersion) -> u8 {
        let bits = match (self, version) {
            (Self::Initial, QuicVersion::V2) => 1,
            (Self::ZeroRtt, QuicVersion::V2) => 2,
            (Self::Handshake, QuicVersion::V2) => 3,
            (Self::Retry, QuicVersion::V2) => 0,
            (Self::Initial, _) => 0,
            (Self::ZeroRtt, _) => 1,
            (Self::Handshake, _) => 2,
            (Self::Retry, _) => 3,
            (Self::Unknown(t), _) => *t & 0x03,
            (Self::Short, _) => 0,
        };
        bits << 4
    }
}

/// Header form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeaderForm {
    /// Long header: carries the version and both connection ids
    Long,
    /// Short header: destination connection id only
    Short,
}

/// Parsed public header of a received datagram.
#[derive(Debug, Clone)]
pub struct PacketHeader {
    /// Header form
    pub form: HeaderForm,
    /// First byte, still header-protected
    pub first_byte: u8,
    /// Version (long header only)
    pub version: Option<QuicVersion>,
    /// Packet type
    pub packet_type: PacketType,
    /// Destination connection id bytes
    pub dcid: Bytes,
    /// Source connection id bytes (empty for short headers)
    pub scid: Bytes,
    /// Token (Initial packets of known versions only)
    pub token: Option<Bytes>,
    /// Offset of the packet number (Initial packets of known versions only)
    pub pn_offset: Option<usize>,
    /// Value of the Length field (Initial packets of known versions only)
    pub payload_len: Option<usize>,
}

impl PacketHeader {
    /// Minimum size of a long header: first byte, version, two id lengths.
    pub const MIN_LONG_HEADER_SIZE: usize = 7;

    /// Parse the public header of `data`.
    ///
    /// `short_cid_len` is the length of the connection ids this server
    /// issues; it locates the destination id in short headers.
    ///
    /// # Errors
    ///
    /// Returns `HeaderError` when the datagram cannot be a QUIC packet
    /// addressed to a server.
    pub fn parse(data: &Bytes, short_cid_len: usize) -> Result<Self, HeaderError> {
        let first_byte = *data.first().ok_or(HeaderError::TooShort { len: 0 })?;

        if first_byte & 0x80 == 0 {
            return Self::parse_short(data, first_byte, short_cid_len);
        }

        if data.len() < Self::MIN_LONG_HEADER_SIZE {
            return Err(HeaderError::TooShort { len: data.len() });
        }

        let version_raw = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        if version_raw == 0 {
            return Err(HeaderError::VersionNegotiation);
        }
        let version = QuicVersion::from_u32(version_raw);

        if version.is_known() && first_byte & 0x40 == 0 {
            return Err(HeaderError::FixedBitClear);
        }
        let max_cid = if version.is_known() {
            MAX_CONNECTION_ID_LEN
        } else {
            usize::from(u8::MAX)
        };

        let mut pos = 5;
        let dcid = read_cid(data, &mut pos, max_cid, "destination connection id")?;
        let scid = read_cid(data, &mut pos, max_cid, "source connection id")?;

        let packet_type = PacketType::from_header(first_byte, version);

        let mut header = Self {
            form: HeaderForm::Long,
            first_byte,
            version: Some(version),
            packet_type,
            dcid,
            scid,
            token: None,
            pn_offset: None,
            payload_len: None,
        };

        if version.is_known() && packet_type == PacketType::Initial {
            let (token_len, sz) =
                varint::decode(&data[pos..]).ok_or(HeaderError::Truncated("token length"))?;
            pos += sz;
            let token_len =
                usize::try_from(token_len).map_err(|_| HeaderError::Truncated("token"))?;
            if data.len() < pos + token_len {
                return Err(HeaderError::Truncated("token"));
            }
            header.token = Some(data.slice(pos..pos + token_len));
            pos += token_len;

            let (length, sz) =
                varint::decode(&data[pos..]).ok_or(HeaderError::Truncated("length"))?;
            pos += sz;
            let length = usize::try_from(length).map_err(|_| HeaderError::Truncated("payload"))?;
            if data.len() < pos + length {
                return Err(HeaderError::Truncated("payload"));
            }
            header.pn_offset = Some(pos);
            header.payload_len = Some(length);
        }

        trace!(
            "Parsed long header: version={}, type={:?}, dcid_len={}, scid_len={}",
            version,
            packet_type,
            header.dcid.len(),
            header.scid.len()
        );

        Ok(header)
    }

    fn parse_short(data: &Bytes, first_byte: u8, cid_len: usize) -> Result<Self, HeaderError> {
        if first_byte & 0x40 == 0 {
            return Err(HeaderError::FixedBitClear);
        }
        if data.len() < 1 + cid_len {
            return Err(HeaderError::TooShort { len: data.len() });
        }

        Ok(Self {
            form: HeaderForm::Short,
            first_byte,
            version: None,
            packet_type: PacketType::Short,
            dcid: data.slice(1..1 + cid_len),
            scid: Bytes::new(),
            token: None,
            pn_offset: None,
            payload_len: None,
        })
    }

    /// Routing key: the destination connection id.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.dcid.clone())
    }

    /// Whether the header carries a version.
    #[must_use]
    pub fn has_version(&self) -> bool {
        self.form == HeaderForm::Long
    }

    /// Whether this is an Initial packet of a known version.
    #[must_use]
    pub fn is_initial(&self) -> bool {
        self.packet_type == PacketType::Initial && self.pn_offset.is_some()
    }
}

fn read_cid(
    data: &Bytes,
    pos: &mut usize,
    max: usize,
    what: &'static str,
) -> Result<Bytes, HeaderError> {
    let len = usize::from(*data.get(*pos).ok_or(HeaderError::Truncated(what))?);
    *pos += 1;
    if len > max {
        return Err(HeaderError::ConnectionIdTooLong { len, max });
    }
    if data.len() < *pos + len {
        return Err(HeaderError::Truncated(what));
    }
    let cid = data.slice(*pos..*pos + len);
    *pos += len;
    Ok(cid)
}
