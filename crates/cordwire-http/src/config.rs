use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_API_VERSION: u8 = 10;
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_TIMEOUT_MS: u64 = 20_000;

/// `DiscordBot (<url>, <version>)`, the format Discord requires for bots.
pub fn default_user_agent() -> String {
    format!(
        "DiscordBot ({}, {})",
        env!("CARGO_PKG_REPOSITORY"),
        env!("CARGO_PKG_VERSION")
    )
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    /// Retries after the first attempt for 429, 5xx and transport failures.
    pub max_retries: u32,
    /// Send `Authorization: Bot <token>` instead of the raw token.
    pub bot: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: format!("https://discord.com/api/v{DEFAULT_API_VERSION}"),
            user_agent: default_user_agent(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            bot: true,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn authorization(&self, token: &str) -> String {
        let token = token.trim();
        if self.bot && !token.starts_with("Bot ") {
            format!("Bot {token}")
        } else {
            token.to_string()
        }
    }

    /// Apply `CORDWIRE_HTTP_MAX_RETRIES` and `CORDWIRE_HTTP_TIMEOUT_MS`.
    pub fn with_env_overrides(mut self) -> Self {
        self.max_retries = env_u32("CORDWIRE_HTTP_MAX_RETRIES", self.max_retries);
        self.timeout_ms = env_u64("CORDWIRE_HTTP_TIMEOUT_MS", self.timeout_ms);
        self
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
