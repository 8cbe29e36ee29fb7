use cordwire_http::HttpConfig;
use cordwire_media::VoiceConfig;
use cordwire_ws::GatewayConfig;
use serde::Deserialize;

pub const DEFAULT_DISPATCH_BUFFER: usize = 256;

/// Everything a [`Session`](crate::Session) needs besides the token.
///
/// `gateway.token` and `gateway.shard` are ignored; the session fills them
/// in for every shard it starts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub http: HttpConfig,
    pub gateway: GatewayConfig,
    pub voice: VoiceConfig,
    /// `None` uses the shard count recommended by `GET /gateway/bot`.
    pub shard_count: Option<u32>,
    /// Queue capacity of each dispatcher subscriber.
    pub dispatch_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            gateway: GatewayConfig::default(),
            voice: VoiceConfig::default(),
            shard_count: None,
            dispatch_buffer: DEFAULT_DISPATCH_BUFFER,
        }
    }
}

impl SessionConfig {
    /// Apply `CORDWIRE_HTTP_MAX_RETRIES`, `CORDWIRE_HTTP_TIMEOUT_MS` and
    /// `CORDWIRE_GATEWAY_COMMANDS_PER_MINUTE`.
    pub fn with_env_overrides(mut self) -> Self {
        self.http = self.http.with_env_overrides();
        self.gateway = self.gateway.with_env_overrides();
        self
    }
}
