use std::time::Duration;

use cordwire_models::gateway::ShardId;
use cordwire_models::intents::Intents;
use cordwire_models::presence::UpdatePresence;
use serde::Deserialize;

pub const DEFAULT_API_VERSION: u8 = 10;
pub const DEFAULT_BACKOFF_MIN_MS: u64 = 1_000;
pub const DEFAULT_HELLO_TIMEOUT_MS: u64 = 20_000;
/// Client-side budget for caller commands; heartbeats are not counted.
pub const DEFAULT_COMMANDS_PER_MINUTE: u32 = 120;

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub token: String,
    pub intents: Intents,
    /// `None` connects unsharded.
    pub shard: Option<ShardId>,
    pub presence: Option<UpdatePresence>,
    /// Request `compress=zlib-stream` transport compression.
    pub compress: bool,
    pub large_threshold: Option<u32>,
    pub backoff_min_ms: u64,
    /// `None` lets the reconnect delay grow without bound.
    pub backoff_max_ms: Option<u64>,
    pub hello_timeout_ms: u64,
    pub api_version: u8,
    pub commands_per_minute: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            intents: Intents::default(),
            shard: None,
            presence: None,
            compress: true,
            large_threshold: None,
            backoff_min_ms: DEFAULT_BACKOFF_MIN_MS,
            backoff_max_ms: None,
            hello_timeout_ms: DEFAULT_HELLO_TIMEOUT_MS,
            api_version: DEFAULT_API_VERSION,
            commands_per_minute: DEFAULT_COMMANDS_PER_MINUTE,
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("token", &"<redacted>")
            .field("intents", &self.intents)
            .field("shard", &self.shard)
            .field("compress", &self.compress)
            .field("large_threshold", &self.large_threshold)
            .field("backoff_min_ms", &self.backoff_min_ms)
            .field("backoff_max_ms", &self.backoff_max_ms)
            .field("hello_timeout_ms", &self.hello_timeout_ms)
            .field("api_version", &self.api_version)
            .field("commands_per_minute", &self.commands_per_minute)
            .finish_non_exhaustive()
    }
}

impl GatewayConfig {
    pub fn new(token: impl Into<String>, intents: Intents) -> Self {
        Self {
            token: token.into(),
            intents,
            ..Self::default()
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard.unwrap_or(ShardId::ONE)
    }

    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    pub fn backoff_max(&self) -> Option<Duration> {
        self.backoff_max_ms.map(Duration::from_millis)
    }

    pub fn hello_timeout(&self) -> Duration {
        Duration::from_millis(self.hello_timeout_ms)
    }

    /// Apply `CORDWIRE_GATEWAY_COMMANDS_PER_MINUTE`.
    pub fn with_env_overrides(mut self) -> Self {
        self.commands_per_minute = env_u32(
            "CORDWIRE_GATEWAY_COMMANDS_PER_MINUTE",
            self.commands_per_minute,
        );
        self
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
