pub mod crypto;
pub mod error;
pub mod rtp;

pub use crypto::{open, EncryptionMode, PacketSealer, SecretKey};
pub use error::CodecError;
pub use rtp::{discovery_request, discovery_response, parse_discovery, DiscoveredAddress, RtpHeader, RTP_HEADER_SIZE};

/// Opus frame the voice server treats as silence.
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];
/// Silence frames sent when audio stops, so receivers flush their jitter
/// buffers instead of interpolating.
pub const SILENCE_FRAME_COUNT: usize = 5;

/// Opus frames carry 20 ms of 48 kHz audio.
pub const SAMPLE_RATE: u32 = 48_000;
pub const FRAME_DURATION_MS: u64 = 20;
pub const SAMPLES_PER_FRAME: u32 = 960;
