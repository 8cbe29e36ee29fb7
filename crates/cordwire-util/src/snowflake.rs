use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Discord epoch: 2015-01-01T00:00:00Z
pub const DISCORD_EPOCH: u64 = 1_420_070_400_000;

/// A 64-bit Discord identifier.
/// Format: 42 bits timestamp | 5 bits worker | 5 bits process | 12 bits increment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Snowflake(u64);

impl Snowflake {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Zero is never assigned by Discord and is used as "unset".
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Build the smallest snowflake created at the given Unix time (ms).
    /// Used as a pagination cursor for time-based queries.
    pub fn from_timestamp_millis(unix_ms: u64) -> Self {
        Self(unix_ms.saturating_sub(DISCORD_EPOCH) << 22)
    }

    /// Extract the Unix timestamp (ms) from a snowflake.
    pub const fn timestamp_millis(self) -> u64 {
        (self.0 >> 22) + DISCORD_EPOCH
    }

    pub fn created_at(self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp_millis() as i64).single()
    }

    pub const fn worker_id(self) -> u8 {
        ((self.0 >> 17) & 0x1F) as u8
    }

    pub const fn process_id(self) -> u8 {
        ((self.0 >> 12) & 0x1F) as u8
    }

    pub const fn increment(self) -> u16 {
        (self.0 & 0xFFF) as u16
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Snowflake {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}

impl From<u64> for Snowflake {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl Serialize for Snowflake {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

struct SnowflakeVisitor;

impl Visitor<'_> for SnowflakeVisitor {
    type Value = Snowflake;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a snowflake as a decimal string or integer")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Snowflake, E> {
        v.parse().map_err(E::custom)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Snowflake, E> {
        Ok(Snowflake(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Snowflake, E> {
        u64::try_from(v)
            .map(Snowflake)
            .map_err(|_| E::custom("negative snowflake"))
    }
}

impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(SnowflakeVisitor)
    }
}

macro_rules! typed_ids {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(pub Snowflake);

            impl $name {
                pub const fn new(raw: u64) -> Self {
                    Self(Snowflake::new(raw))
                }

                pub const fn get(self) -> u64 {
                    self.0.get()
                }

                pub const fn snowflake(self) -> Snowflake {
                    self.0
                }

                pub const fn is_valid(self) -> bool {
                    self.0.is_valid()
                }
            }

            impl From<Snowflake> for $name {
                fn from(s: Snowflake) -> Self {
                    Self(s)
                }
            }

            impl From<u64> for $name {
                fn from(raw: u64) -> Self {
                    Self::new(raw)
                }
            }

            impl From<$name> for Snowflake {
                fn from(id: $name) -> Self {
                    id.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    self.0.fmt(f)
                }
            }

            impl FromStr for $name {
                type Err = ParseIntError;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    s.parse().map(Self)
                }
            }
        )*
    };
}

typed_ids! {
    GuildId;
    ChannelId;
    UserId;
    MessageId;
    WebhookId;
    ApplicationId;
    InteractionId;
    RoleId;
    /// Guild scheduled event.
    EventId;
    /// Application command.
    CommandId;
}
