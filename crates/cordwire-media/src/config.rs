use std::time::Duration;

use cordwire_codec::EncryptionMode;
use serde::Deserialize;

pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_HELLO_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 3_000;
/// One second of 20 ms frames.
pub const DEFAULT_FRAME_QUEUE: usize = 50;
pub const DEFAULT_BACKOFF_MIN_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Budget for VOICE_STATE_UPDATE + VOICE_SERVER_UPDATE, and again for
    /// the handshake that follows.
    pub join_timeout_ms: u64,
    pub self_mute: bool,
    pub self_deaf: bool,
    /// Checked in order against the modes the server advertises.
    pub preferred_modes: Vec<EncryptionMode>,
    pub hello_timeout_ms: u64,
    pub discovery_timeout_ms: u64,
    /// Opus frames buffered ahead of the pacer.
    pub frame_queue: usize,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
            self_mute: false,
            self_deaf: false,
            preferred_modes: EncryptionMode::PREFERENCE.to_vec(),
            hello_timeout_ms: DEFAULT_HELLO_TIMEOUT_MS,
            discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            frame_queue: DEFAULT_FRAME_QUEUE,
            backoff_min_ms: DEFAULT_BACKOFF_MIN_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
        }
    }
}

impl VoiceConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn hello_timeout(&self) -> Duration {
        Duration::from_millis(self.hello_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}
