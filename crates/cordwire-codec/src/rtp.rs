use std::net::IpAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;

pub const RTP_HEADER_SIZE: usize = 12;
pub const RTP_VERSION: u8 = 2;
/// Dynamic payload type the voice server assigns to Opus.
pub const OPUS_PAYLOAD_TYPE: u8 = 0x78;

/// 12-byte RTP header.
///
/// ```text
/// Byte 0:     [V:2][P:1][X:1][CC:4]   always 0x80
/// Byte 1:     [M:1][PT:7]             0x78
/// Bytes 2-3:  Sequence number (u16)
/// Bytes 4-7:  Timestamp (u32, 48kHz)
/// Bytes 8-11: SSRC (u32)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn new(ssrc: u32) -> Self {
        Self {
            payload_type: OPUS_PAYLOAD_TYPE,
            sequence: 0,
            timestamp: 0,
            ssrc,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(RTP_VERSION << 6);
        buf.put_u8(self.payload_type & 0x7F);
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }

    pub fn to_bytes(&self) -> [u8; RTP_HEADER_SIZE] {
        let mut out = [0u8; RTP_HEADER_SIZE];
        out[0] = RTP_VERSION << 6;
        out[1] = self.payload_type & 0x7F;
        out[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        out[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        out[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        out
    }

    /// Parse a header, skipping any CSRC list the sender included.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        if buf.remaining() < RTP_HEADER_SIZE {
            return Err(CodecError::BufferTooShort {
                expected: RTP_HEADER_SIZE,
                actual: buf.remaining(),
            });
        }
        let byte0 = buf.get_u8();
        let version = byte0 >> 6;
        if version != RTP_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let csrc_count = (byte0 & 0x0F) as usize;
        let payload_type = buf.get_u8() & 0x7F;
        let sequence = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();
        if buf.remaining() < csrc_count * 4 {
            return Err(CodecError::BufferTooShort {
                expected: RTP_HEADER_SIZE + csrc_count * 4,
                actual: RTP_HEADER_SIZE + buf.remaining(),
            });
        }
        buf.advance(csrc_count * 4);
        Ok(Self {
            payload_type,
            sequence,
            timestamp,
            ssrc,
        })
    }
}

pub const DISCOVERY_PACKET_SIZE: usize = 74;
const DISCOVERY_REQUEST: u16 = 0x1;
const DISCOVERY_RESPONSE: u16 = 0x2;
/// Length field counts everything after type and length.
const DISCOVERY_LENGTH: u16 = 70;
const DISCOVERY_ADDRESS_SIZE: usize = 64;

/// Build the 74-byte IP discovery request for `ssrc`.
pub fn discovery_request(ssrc: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(DISCOVERY_PACKET_SIZE);
    buf.put_u16(DISCOVERY_REQUEST);
    buf.put_u16(DISCOVERY_LENGTH);
    buf.put_u32(ssrc);
    buf.put_bytes(0, DISCOVERY_ADDRESS_SIZE);
    buf.put_u16(0);
    buf.freeze()
}

/// Externally visible address reported by the voice server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredAddress {
    pub ssrc: u32,
    pub ip: IpAddr,
    pub port: u16,
}

/// Parse a discovery response. The request type (0x1) is accepted too, since
/// some servers echo the framing back unchanged apart from the address.
pub fn parse_discovery(mut buf: &[u8]) -> Result<DiscoveredAddress, CodecError> {
    if buf.len() < DISCOVERY_PACKET_SIZE {
        return Err(CodecError::BufferTooShort {
            expected: DISCOVERY_PACKET_SIZE,
            actual: buf.len(),
        });
    }
    let kind = buf.get_u16();
    if kind != DISCOVERY_RESPONSE && kind != DISCOVERY_REQUEST {
        return Err(CodecError::Discovery(format!("unexpected packet type {kind:#x}")));
    }
    let _length = buf.get_u16();
    let ssrc = buf.get_u32();
    let raw = &buf[..DISCOVERY_ADDRESS_SIZE];
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    let text = std::str::from_utf8(&raw[..end])
        .map_err(|_| CodecError::Discovery("address is not utf-8".into()))?;
    let ip = text
        .parse::<IpAddr>()
        .map_err(|_| CodecError::Discovery(format!("invalid address {text:?}")))?;
    buf.advance(DISCOVERY_ADDRESS_SIZE);
    let port = buf.get_u16();
    Ok(DiscoveredAddress { ssrc, ip, port })
}

/// Build a discovery response, as the voice server would.
pub fn discovery_response(ssrc: u32, ip: IpAddr, port: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(DISCOVERY_PACKET_SIZE);
    buf.put_u16(DISCOVERY_RESPONSE);
    buf.put_u16(DISCOVERY_LENGTH);
    buf.put_u32(ssrc);
    let text = ip.to_string();
    let len = text.len().min(DISCOVERY_ADDRESS_SIZE - 1);
    buf.put_slice(&text.as_bytes()[..len]);
    buf.put_bytes(0, DISCOVERY_ADDRESS_SIZE - len);
    buf.put_u16(port);
    buf.freeze()
}
