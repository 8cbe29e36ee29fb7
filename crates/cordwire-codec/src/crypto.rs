// RTP payload sealing with XSalsa20-Poly1305 (NaCl secretbox).

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use crypto_secretbox::aead::generic_array::GenericArray;
use crypto_secretbox::aead::{AeadInPlace, KeyInit};
use crypto_secretbox::XSalsa20Poly1305;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::rtp::{RtpHeader, RTP_HEADER_SIZE};
use crate::SAMPLES_PER_FRAME;

pub const KEY_SIZE: usize = 32;
pub const TAG_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 24;
/// Bytes of the lite counter carried after the ciphertext.
pub const LITE_NONCE_SIZE: usize = 4;

/// Transport encryption modes, in the order this client prefers them.
///
/// `Lite` comes first: its counter nonce cannot repeat within a session and
/// costs four bytes per packet. `Suffix` draws 24 random bytes per packet.
/// `Legacy` derives the nonce from the RTP header, which only stays unique
/// until sequence and timestamp wrap together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionMode {
    #[serde(rename = "xsalsa20_poly1305_lite")]
    Lite,
    #[serde(rename = "xsalsa20_poly1305_suffix")]
    Suffix,
    #[serde(rename = "xsalsa20_poly1305")]
    Legacy,
}

impl EncryptionMode {
    pub const PREFERENCE: [EncryptionMode; 3] = [Self::Lite, Self::Suffix, Self::Legacy];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lite => "xsalsa20_poly1305_lite",
            Self::Suffix => "xsalsa20_poly1305_suffix",
            Self::Legacy => "xsalsa20_poly1305",
        }
    }

    /// Bytes appended after the ciphertext.
    pub fn nonce_suffix_len(self) -> usize {
        match self {
            Self::Lite => LITE_NONCE_SIZE,
            Self::Suffix => NONCE_SIZE,
            Self::Legacy => 0,
        }
    }

    /// First mode in `preferred` that the server also advertised.
    pub fn select<S: AsRef<str>>(preferred: &[EncryptionMode], advertised: &[S]) -> Option<Self> {
        preferred
            .iter()
            .copied()
            .find(|mode| advertised.iter().any(|m| m.as_ref() == mode.as_str()))
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionMode {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::PREFERENCE
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| CodecError::UnsupportedMode(s.to_string()))
    }
}

/// The session's 32-byte secret key from SessionDescription.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    fn cipher(&self) -> Result<XSalsa20Poly1305, CodecError> {
        XSalsa20Poly1305::new_from_slice(&self.0)
            .map_err(|_| CodecError::InvalidKeyLength(self.0.len()))
    }
}

impl TryFrom<&[u8]> for SecretKey {
    type Error = CodecError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; KEY_SIZE] = value
            .try_into()
            .map_err(|_| CodecError::InvalidKeyLength(value.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// Seals Opus frames into RTP packets for one ssrc.
///
/// Sequence, timestamp and the lite counter advance on every call to
/// [`seal`](Self::seal) whether or not the packet is ever written, so a
/// dropped packet never frees its nonce for reuse.
pub struct PacketSealer {
    cipher: XSalsa20Poly1305,
    mode: EncryptionMode,
    header: RtpHeader,
    lite_counter: u32,
}

impl PacketSealer {
    pub fn new(key: &SecretKey, mode: EncryptionMode, ssrc: u32) -> Result<Self, CodecError> {
        Ok(Self {
            cipher: key.cipher()?,
            mode,
            header: RtpHeader::new(ssrc),
            lite_counter: 0,
        })
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    pub fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    /// Header the next packet will carry.
    pub fn next_header(&self) -> RtpHeader {
        self.header
    }

    /// Packet layout: `header || tag || ciphertext || nonce suffix`.
    pub fn seal(&mut self, opus: &[u8]) -> Result<Bytes, CodecError> {
        let header = self.header.to_bytes();
        let (nonce, suffix) = self.next_nonce(&header);
        self.advance();

        let body = RTP_HEADER_SIZE + TAG_SIZE;
        let mut packet = Vec::with_capacity(body + opus.len() + suffix.len());
        packet.extend_from_slice(&header);
        packet.resize(body, 0);
        packet.extend_from_slice(opus);
        let tag = self
            .cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&nonce), b"", &mut packet[body..])
            .map_err(|_| CodecError::EncryptionFailed)?;
        packet[RTP_HEADER_SIZE..body].copy_from_slice(&tag);
        packet.extend_from_slice(&suffix);
        Ok(Bytes::from(packet))
    }

    fn next_nonce(&mut self, header: &[u8; RTP_HEADER_SIZE]) -> ([u8; NONCE_SIZE], Vec<u8>) {
        let mut nonce = [0u8; NONCE_SIZE];
        match self.mode {
            EncryptionMode::Legacy => {
                nonce[..RTP_HEADER_SIZE].copy_from_slice(header);
                (nonce, Vec::new())
            }
            EncryptionMode::Suffix => {
                rand::thread_rng().fill_bytes(&mut nonce);
                (nonce, nonce.to_vec())
            }
            EncryptionMode::Lite => {
                let counter = self.lite_counter.to_be_bytes();
                self.lite_counter = self.lite_counter.wrapping_add(1);
                nonce[..LITE_NONCE_SIZE].copy_from_slice(&counter);
                (nonce, counter.to_vec())
            }
        }
    }

    fn advance(&mut self) {
        self.header.sequence = self.header.sequence.wrapping_add(1);
        self.header.timestamp = self.header.timestamp.wrapping_add(SAMPLES_PER_FRAME);
    }
}

/// Open a packet sealed under `mode`, returning its header and Opus payload.
pub fn open(
    key: &SecretKey,
    mode: EncryptionMode,
    packet: &[u8],
) -> Result<(RtpHeader, Vec<u8>), CodecError> {
    let mut cursor = packet;
    let header = RtpHeader::decode(&mut cursor)?;
    let header_len = packet.len() - cursor.len();

    let suffix_len = mode.nonce_suffix_len();
    let min = header_len + TAG_SIZE + suffix_len;
    if packet.len() < min {
        return Err(CodecError::BufferTooShort {
            expected: min,
            actual: packet.len(),
        });
    }
    let (sealed, suffix) = packet[header_len..].split_at(packet.len() - header_len - suffix_len);

    let mut nonce = [0u8; NONCE_SIZE];
    match mode {
        EncryptionMode::Legacy => nonce[..RTP_HEADER_SIZE].copy_from_slice(&packet[..RTP_HEADER_SIZE]),
        EncryptionMode::Suffix | EncryptionMode::Lite => nonce[..suffix_len].copy_from_slice(suffix),
    }

    let (tag, ciphertext) = sealed.split_at(TAG_SIZE);
    let mut payload = ciphertext.to_vec();
    key.cipher()?
        .decrypt_in_place_detached(
            GenericArray::from_slice(&nonce),
            b"",
            &mut payload,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| CodecError::DecryptionFailed)?;
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn key() -> SecretKey {
        SecretKey::new([7u8; KEY_SIZE])
    }

    #[test]
    fn seal_then_open_every_mode() {
        for mode in EncryptionMode::PREFERENCE {
            let mut sealer = PacketSealer::new(&key(), mode, 0x1234).unwrap();
            let packet = sealer.seal(b"opus frame").unwrap();
            assert_eq!(
                packet.len(),
                RTP_HEADER_SIZE + TAG_SIZE + 10 + mode.nonce_suffix_len()
            );
            assert_eq!(&packet[..2], &[0x80, 0x78]);

            let (header, payload) = open(&key(), mode, &packet).unwrap();
            assert_eq!(header.ssrc, 0x1234);
            assert_eq!(header.sequence, 0);
            assert_eq!(payload, b"opus frame");
        }
    }

    #[test]
    fn header_advances_per_packet() {
        let mut sealer = PacketSealer::new(&key(), EncryptionMode::Lite, 1).unwrap();
        for i in 0..3u16 {
            let packet = sealer.seal(&[0xF8, 0xFF, 0xFE]).unwrap();
            let (header, _) = open(&key(), EncryptionMode::Lite, &packet).unwrap();
            assert_eq!(header.sequence, i);
            assert_eq!(header.timestamp, u32::from(i) * SAMPLES_PER_FRAME);
            assert_eq!(&packet[packet.len() - 4..], &u32::from(i).to_be_bytes());
        }
        assert_eq!(sealer.next_header().sequence, 3);
    }

    #[test]
    fn nonces_never_repeat() {
        for mode in EncryptionMode::PREFERENCE {
            let mut sealer = PacketSealer::new(&key(), mode, 42).unwrap();
            let mut seen = HashSet::new();
            for _ in 0..1_000 {
                let packet = sealer.seal(b"x").unwrap();
                let nonce = match mode {
                    EncryptionMode::Legacy => packet[..RTP_HEADER_SIZE].to_vec(),
                    _ => packet[packet.len() - mode.nonce_suffix_len()..].to_vec(),
                };
                assert!(seen.insert(nonce), "nonce reused under {mode}");
            }
        }
    }

    #[test]
    fn wrong_key_or_tampering_fails() {
        let mut sealer = PacketSealer::new(&key(), EncryptionMode::Suffix, 5).unwrap();
        let packet = sealer.seal(b"secret").unwrap();

        let other = SecretKey::new([9u8; KEY_SIZE]);
        assert_eq!(
            open(&other, EncryptionMode::Suffix, &packet),
            Err(CodecError::DecryptionFailed)
        );

        let mut tampered = packet.to_vec();
        tampered[RTP_HEADER_SIZE + TAG_SIZE] ^= 1;
        assert_eq!(
            open(&key(), EncryptionMode::Suffix, &tampered),
            Err(CodecError::DecryptionFailed)
        );
    }

    #[test]
    fn select_follows_preference() {
        let advertised = ["xsalsa20_poly1305", "xsalsa20_poly1305_suffix", "aead_aes256_gcm"];
        assert_eq!(
            EncryptionMode::select(&EncryptionMode::PREFERENCE, &advertised),
            Some(EncryptionMode::Suffix)
        );
        assert_eq!(
            EncryptionMode::select(&[EncryptionMode::Legacy], &advertised),
            Some(EncryptionMode::Legacy)
        );
        assert_eq!(
            EncryptionMode::select(&EncryptionMode::PREFERENCE, &["aead_aes256_gcm"]),
            None
        );
    }

    #[test]
    fn mode_names_round_trip_serde() {
        let json = serde_json::to_string(&EncryptionMode::Lite).unwrap();
        assert_eq!(json, "\"xsalsa20_poly1305_lite\"");
        assert_eq!(
            "xsalsa20_poly1305".parse::<EncryptionMode>(),
            Ok(EncryptionMode::Legacy)
        );
        assert!("plain".parse::<EncryptionMode>().is_err());
    }

    #[test]
    fn key_length_is_checked() {
        assert_eq!(
            SecretKey::try_from(&[0u8; 16][..]),
            Err(CodecError::InvalidKeyLength(16))
        );
        assert!(SecretKey::try_from(&[0u8; 32][..]).is_ok());
        assert_eq!(format!("{:?}", key()), "SecretKey(<redacted>)");
    }
}
