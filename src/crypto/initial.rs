//! QUIC Initial packet protection (RFC 9001 Section 5, RFC 9369 Section 3).
//!
//! Initial packets are protected with keys anyone can derive from the
//! client's original Destination Connection ID. The dispatcher opens client
//! Initials to read the `ClientHello` and seals its own Initials when it
//! answers an attempt with a stateless CONNECTION_CLOSE.
//!
//! # Overview
//!
//! 1. **Key derivation** using HKDF-SHA256 with the version's salt
//! 2. **Header protection** using AES-128-ECB over a 16-byte sample
//! 3. **Payload protection** using AES-128-GCM, nonce = iv XOR packet number
//!
//! # Example
//!
//! ```ignore
//! use quic_dispatcher::crypto::initial::open_initial;
//! use quic_dispatcher::packet::PacketHeader;
//!
//! let header = PacketHeader::parse(&datagram, 8)?;
//! let frames = open_initial(&datagram, &header)?;
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes128Gcm, Nonce,
};
use bytes::BufMut;
use hkdf::Hkdf;
use sha2::Sha256;
use tracing::trace;

use crate::error::InitialError;
use crate::packet::{varint, PacketHeader, PacketType, QuicVersion};

/// QUIC v1 Initial Salt (RFC 9001 Section 5.2)
const QUIC_V1_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c, 0xad,
    0xcc, 0xbb, 0x7f, 0x0a,
];

/// QUIC v2 Initial Salt (RFC 9369)
const QUIC_V2_SALT: [u8; 20] = [
    0x0d, 0xed, 0xe3, 0xde, 0xf7, 0x00, 0xa6, 0xdb, 0x81, 0x93, 0x81, 0xbe, 0x6e, 0x26, 0x9d, 0xcb,
    0xf9, 0xbd, 0x2e, 0xd9,
];

/// AES-128-GCM key size
const AES_KEY_SIZE: usize = 16;

/// AES-128-GCM IV size
const IV_SIZE: usize = 12;

/// AES-128-GCM tag size
pub const TAG_SIZE: usize = 16;

/// Header protection key size (AES-128)
const HP_KEY_SIZE: usize = 16;

/// Header protection sample size
const HP_SAMPLE_SIZE: usize = 16;

/// Which endpoint's Initial secret to derive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// "client in"
    Client,
    /// "server in"
    Server,
}

impl Side {
    const fn label(self) -> &'static str {
        match self {
            Self::Client => "client in",
            Self::Server => "server in",
        }
    }
}

/// Keys derived for QUIC Initial encryption/decryption
#[derive(Debug, Clone)]
pub struct InitialKeys {
    /// AES-128-GCM key
    key: [u8; AES_KEY_SIZE],
    /// IV (nonce base)
    iv: [u8; IV_SIZE],
    /// Header protection key
    hp: [u8; HP_KEY_SIZE],
}

impl InitialKeys {
    /// Derive Initial keys from the client's original DCID.
    ///
    /// RFC 9001 Section 5.2 (QUIC v1):
    /// - `initial_secret = HKDF-Extract(salt, DCID)`
    /// - `side_secret = HKDF-Expand-Label(initial_secret, "client in" | "server in", 32)`
    /// - `key`, `iv`, `hp` via `quic key`, `quic iv`, `quic hp`
    ///
    /// QUIC v2 uses its own salt and the `quicv2` label prefix.
    ///
    /// # Errors
    ///
    /// Returns `InitialError::UnsupportedVersion` for versions without a
    /// known salt.
    pub fn derive(dcid: &[u8], version: QuicVersion, side: Side) -> Result<Self, InitialError> {
        let (salt, label_prefix) = match version {
            QuicVersion::V1 => (&QUIC_V1_SALT, "quic"),
            QuicVersion::V2 => (&QUIC_V2_SALT, "quicv2"),
            _ => return Err(InitialError::UnsupportedVersion(version.as_u32())),
        };

        let hkdf = Hkdf::<Sha256>::new(Some(salt), dcid);

        let mut side_secret = [0u8; 32];
        hkdf.expand(&hkdf_expand_label_info(side.label(), 32), &mut side_secret)
            .map_err(|_| InitialError::KeyDerivation)?;

        let side_hkdf =
            Hkdf::<Sha256>::from_prk(&side_secret).map_err(|_| InitialError::KeyDerivation)?;

        let mut key = [0u8; AES_KEY_SIZE];
        side_hkdf
            .expand(
                &hkdf_expand_label_info(&format!("{label_prefix} key"), AES_KEY_SIZE),
                &mut key,
            )
            .map_err(|_| InitialError::KeyDerivation)?;

        let mut iv = [0u8; IV_SIZE];
        side_hkdf
            .expand(
                &hkdf_expand_label_info(&format!("{label_prefix} iv"), IV_SIZE),
                &mut iv,
            )
            .map_err(|_| InitialError::KeyDerivation)?;

        let mut hp = [0u8; HP_KEY_SIZE];
        side_hkdf
            .expand(
                &hkdf_expand_label_info(&format!("{label_prefix} hp"), HP_KEY_SIZE),
                &mut hp,
            )
            .map_err(|_| InitialError::KeyDerivation)?;

        Ok(Self { key, iv, hp })
    }

    fn nonce(&self, packet_number: u32) -> [u8; IV_SIZE] {
        let mut nonce = self.iv;
        for (n, p) in nonce[IV_SIZE - 4..].iter_mut().zip(packet_number.to_be_bytes()) {
            *n ^= p;
        }
        nonce
    }
}

/// Build HKDF-Expand-Label info structure (TLS 1.3 format).
///
/// Format:
/// - length (2 bytes)
/// - "tls13 " + label (1 byte length + string)
/// - context (1 byte length + data, empty for QUIC)
#[allow(clippy::cast_possible_truncation)]
fn hkdf_expand_label_info(label: &str, length: usize) -> Vec<u8> {
    let tls_label = format!("tls13 {label}");
    let mut info = Vec::with_capacity(2 + 1 + tls_label.len() + 1);
    info.put_u16(length as u16);
    info.put_u8(tls_label.len() as u8);
    info.extend_from_slice(tls_label.as_bytes());
    info.put_u8(0);
    info
}

/// Header protection mask (AES-128-ECB over the sample).
fn header_mask(hp: &[u8; HP_KEY_SIZE], sample: &[u8]) -> Result<[u8; 16], InitialError> {
    use aes::cipher::{BlockEncrypt, KeyInit as _};
    use aes::Aes128;

    if sample.len() < HP_SAMPLE_SIZE {
        return Err(InitialError::HeaderProtection);
    }
    let cipher = Aes128::new_from_slice(hp).map_err(|_| InitialError::HeaderProtection)?;

    let mut output = [0u8; 16];
    output.copy_from_slice(&sample[..HP_SAMPLE_SIZE]);
    cipher.encrypt_block(aes::Block::from_mut_slice(&mut output));
    Ok(output)
}

/// Open a client Initial packet and return its plaintext frames.
///
/// Keys are derived from the packet's own DCID, which for a client's first
/// flight is the original destination connection id.
///
/// # Errors
///
/// Returns `InitialError` if the packet is not an Initial of a known
/// version, is truncated, or fails authentication.
pub fn open_initial(data: &[u8], header: &PacketHeader) -> Result<Vec<u8>, InitialError> {
    let version = header.version.ok_or(InitialError::NotInitial)?;
    let keys = InitialKeys::derive(&header.dcid, version, Side::Client)?;
    open_with_keys(data, header, &keys)
}

/// Open an Initial packet with explicitly supplied keys.
///
/// # Errors
///
/// See [`open_initial`].
pub fn open_with_keys(
    data: &[u8],
    header: &PacketHeader,
    keys: &InitialKeys,
) -> Result<Vec<u8>, InitialError> {
    if header.packet_type != PacketType::Initial {
        return Err(InitialError::NotInitial);
    }
    let version = header.version.ok_or(InitialError::NotInitial)?;
    if !version.is_known() {
        return Err(InitialError::UnsupportedVersion(version.as_u32()));
    }
    let (Some(pn_offset), Some(payload_len)) = (header.pn_offset, header.payload_len) else {
        return Err(InitialError::HeaderParse("missing length field"));
    };

    let payload_end = pn_offset + payload_len;
    if payload_end > data.len() {
        return Err(InitialError::PacketTooShort);
    }

    // Sample starts at pn_offset + 4 (assuming maximum PN length)
    let sample_offset = pn_offset + 4;
    if sample_offset + HP_SAMPLE_SIZE > payload_end {
        return Err(InitialError::HeaderProtection);
    }
    let mask = header_mask(&keys.hp, &data[sample_offset..sample_offset + HP_SAMPLE_SIZE])?;

    // Long header: only the low 4 bits of the first byte are protected
    let first_byte = data[0] ^ (mask[0] & 0x0f);
    let pn_len = usize::from(first_byte & 0x03) + 1;

    let mut pn_bytes = [0u8; 4];
    for i in 0..pn_len {
        pn_bytes[4 - pn_len + i] = data[pn_offset + i] ^ mask[1 + i];
    }
    let packet_number = u32::from_be_bytes(pn_bytes);

    let mut aad = Vec::with_capacity(pn_offset + pn_len);
    aad.push(first_byte);
    aad.extend_from_slice(&data[1..pn_offset]);
    aad.extend_from_slice(&pn_bytes[4 - pn_len..]);

    let ciphertext = &data[pn_offset + pn_len..payload_end];
    if ciphertext.len() < TAG_SIZE {
        return Err(InitialError::PacketTooShort);
    }

    let cipher =
        Aes128Gcm::new_from_slice(&keys.key).map_err(|_| InitialError::DecryptionFailed)?;
    let nonce = keys.nonce(packet_number);
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| InitialError::DecryptionFailed)?;

    trace!(
        "Opened Initial: pn={}, pn_len={}, {} bytes of frames",
        packet_number,
        pn_len,
        plaintext.len()
    );

    Ok(plaintext)
}

/// Fields of an Initial packet to be sealed.
#[derive(Debug, Clone, Copy)]
pub struct InitialPacket<'a> {
    /// QUIC version (v1 or v2)
    pub version: QuicVersion,
    /// Destination connection id
    pub dcid: &'a [u8],
    /// Source connection id
    pub scid: &'a [u8],
    /// Token (empty for server Initials)
    pub token: &'a [u8],
    /// Packet number
    pub packet_number: u32,
}

/// Seal `frames` into a protected Initial packet.
///
/// Frames are padded with PADDING so that the header protection sample is
/// always available.
///
/// # Errors
///
/// Returns `InitialError::EncryptionFailed` if the packet would not fit a
/// two-byte Length field or the AEAD fails.
#[allow(clippy::cast_possible_truncation)]
pub fn seal_initial(
    keys: &InitialKeys,
    packet: &InitialPacket<'_>,
    frames: &[u8],
) -> Result<Vec<u8>, InitialError> {
    if !packet.version.is_known() {
        return Err(InitialError::UnsupportedVersion(packet.version.as_u32()));
    }

    let pn_len: usize = match packet.packet_number {
        0..=0xff => 1,
        0x100..=0xffff => 2,
        _ => 4,
    };

    // pn + ciphertext must reach past the 16-byte sample at pn_offset + 4
    let mut plaintext = frames.to_vec();
    let min_plaintext = (4 + HP_SAMPLE_SIZE).saturating_sub(pn_len + TAG_SIZE);
    if plaintext.len() < min_plaintext {
        plaintext.resize(min_plaintext, 0x00);
    }

    let length = pn_len + plaintext.len() + TAG_SIZE;
    if length >= 1 << 14 {
        return Err(InitialError::EncryptionFailed);
    }

    let first_byte =
        0xc0 | PacketType::Initial.type_bits(packet.version) | (pn_len as u8 - 1);

    let mut out = Vec::with_capacity(32 + packet.dcid.len() + packet.scid.len() + length);
    out.put_u8(first_byte);
    out.put_u32(packet.version.as_u32());
    out.put_u8(packet.dcid.len() as u8);
    out.extend_from_slice(packet.dcid);
    out.put_u8(packet.scid.len() as u8);
    out.extend_from_slice(packet.scid);
    varint::encode(packet.token.len() as u64, &mut out);
    out.extend_from_slice(packet.token);
    varint::encode_u14(length, &mut out);
    let pn_offset = out.len();
    out.extend_from_slice(&packet.packet_number.to_be_bytes()[4 - pn_len..]);

    let cipher =
        Aes128Gcm::new_from_slice(&keys.key).map_err(|_| InitialError::EncryptionFailed)?;
    let nonce = keys.nonce(packet.packet_number);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &plaintext,
                aad: &out,
            },
        )
        .map_err(|_| InitialError::EncryptionFailed)?;
    out.extend_from_slice(&ciphertext);

    let sample_offset = pn_offset + 4;
    let mask = header_mask(&keys.hp, &out[sample_offset..sample_offset + HP_SAMPLE_SIZE])?;
    out[0] ^= mask[0] & 0x0f;
    for i in 0..pn_len {
        out[pn_offset + i] ^= mask[1 + i];
    }

    Ok(out)
}
