use cordwire_util::{ChannelId, GuildId, UserId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::intents::Intents;
use crate::presence::UpdatePresence;
use crate::user::User;

// Client -> Server opcodes
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_PRESENCE_UPDATE: u8 = 3;
pub const OP_VOICE_STATE_UPDATE: u8 = 4;
pub const OP_RESUME: u8 = 6;
pub const OP_REQUEST_GUILD_MEMBERS: u8 = 8;

// Server -> Client opcodes
pub const OP_DISPATCH: u8 = 0;
pub const OP_RECONNECT: u8 = 7;
pub const OP_INVALID_SESSION: u8 = 9;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;

/// One frame on the gateway, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayMessage {
    pub fn new<T: Serialize>(op: u8, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            op,
            d: Some(serde_json::to_value(data)?),
            s: None,
            t: None,
        })
    }

    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self {
            op: OP_HEARTBEAT,
            d: Some(sequence.map_or(Value::Null, Value::from)),
            s: None,
            t: None,
        }
    }

    pub fn dispatch(event: &str, sequence: u64, data: Value) -> Self {
        Self {
            op: OP_DISPATCH,
            d: Some(data),
            s: Some(sequence),
            t: Some(event.to_string()),
        }
    }

    /// Decode the `d` field, treating a missing field as JSON null.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.d {
            Some(d) => T::deserialize(d),
            None => T::deserialize(Value::Null),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "cordwire".to_string(),
            device: "cordwire".to_string(),
        }
    }
}

/// Shard tuple `[shard_id, shard_count]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u32; 2]", into = "[u32; 2]")]
pub struct ShardId {
    pub id: u32,
    pub total: u32,
}

impl ShardId {
    pub const ONE: ShardId = ShardId { id: 0, total: 1 };

    pub fn new(id: u32, total: u32) -> Self {
        Self {
            id,
            total: total.max(1),
        }
    }

    /// Shard responsible for a guild: `(guild_id >> 22) % total`.
    pub fn for_guild(guild_id: GuildId, total: u32) -> Self {
        let total = total.max(1);
        let id = ((guild_id.get() >> 22) % u64::from(total)) as u32;
        Self { id, total }
    }
}

impl From<[u32; 2]> for ShardId {
    fn from([id, total]: [u32; 2]) -> Self {
        Self { id, total }
    }
}

impl From<ShardId> for [u32; 2] {
    fn from(shard: ShardId) -> Self {
        [shard.id, shard.total]
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.id, self.total)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identify {
    pub token: String,
    pub properties: IdentifyProperties,
    pub intents: Intents,
    #[serde(default)]
    pub compress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<UpdatePresence>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateVoiceState {
    pub guild_id: GuildId,
    /// `None` serializes as `null`, which leaves the channel.
    pub channel_id: Option<ChannelId>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestGuildMembers {
    pub guild_id: GuildId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub presences: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<UserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialApplication {
    pub id: cordwire_util::ApplicationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ready {
    #[serde(default)]
    pub v: u8,
    pub user: User,
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    #[serde(default)]
    pub shard: Option<ShardId>,
    #[serde(default)]
    pub guilds: Vec<Value>,
    #[serde(default)]
    pub application: Option<PartialApplication>,
}

/// Response of `GET /gateway`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayInfo {
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    /// Milliseconds until the limit resets.
    pub reset_after: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

fn default_max_concurrency() -> u32 {
    1
}

/// Response of `GET /gateway/bot`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayBot {
    pub url: String,
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

// Close codes
pub const CLOSE_UNKNOWN_ERROR: u16 = 4000;
pub const CLOSE_UNKNOWN_OPCODE: u16 = 4001;
pub const CLOSE_DECODE_ERROR: u16 = 4002;
pub const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
pub const CLOSE_AUTHENTICATION_FAILED: u16 = 4004;
pub const CLOSE_ALREADY_AUTHENTICATED: u16 = 4005;
pub const CLOSE_INVALID_SEQ: u16 = 4007;
pub const CLOSE_RATE_LIMITED: u16 = 4008;
pub const CLOSE_SESSION_TIMED_OUT: u16 = 4009;
pub const CLOSE_INVALID_SHARD: u16 = 4010;
pub const CLOSE_SHARDING_REQUIRED: u16 = 4011;
pub const CLOSE_INVALID_API_VERSION: u16 = 4012;
pub const CLOSE_INVALID_INTENTS: u16 = 4013;
pub const CLOSE_DISALLOWED_INTENTS: u16 = 4014;

/// What the client must do after the server closed the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Reconnect and resume the existing session.
    Resume,
    /// Reconnect with a fresh Identify.
    Reidentify,
    /// Stop; retrying cannot succeed.
    Fatal,
}

pub fn close_action(code: u16) -> CloseAction {
    match code {
        CLOSE_AUTHENTICATION_FAILED
        | CLOSE_INVALID_SHARD
        | CLOSE_SHARDING_REQUIRED
        | CLOSE_INVALID_API_VERSION
        | CLOSE_INVALID_INTENTS
        | CLOSE_DISALLOWED_INTENTS => CloseAction::Fatal,
        CLOSE_INVALID_SEQ | CLOSE_SESSION_TIMED_OUT => CloseAction::Reidentify,
        _ => CloseAction::Resume,
    }
}

pub fn close_reason(code: u16) -> &'static str {
    match code {
        CLOSE_UNKNOWN_ERROR => "unknown error",
        CLOSE_UNKNOWN_OPCODE => "unknown opcode",
        CLOSE_DECODE_ERROR => "decode error",
        CLOSE_NOT_AUTHENTICATED => "not authenticated",
        CLOSE_AUTHENTICATION_FAILED => "authentication failed",
        CLOSE_ALREADY_AUTHENTICATED => "already authenticated",
        CLOSE_INVALID_SEQ => "invalid sequence",
        CLOSE_RATE_LIMITED => "rate limited",
        CLOSE_SESSION_TIMED_OUT => "session timed out",
        CLOSE_INVALID_SHARD => "invalid shard",
        CLOSE_SHARDING_REQUIRED => "sharding required",
        CLOSE_INVALID_API_VERSION => "invalid API version",
        CLOSE_INVALID_INTENTS => "invalid intents",
        CLOSE_DISALLOWED_INTENTS => "disallowed intents",
        _ => "unrecognized close code",
    }
}

// Dispatch event names
pub const EVENT_READY: &str = "READY";
pub const EVENT_RESUMED: &str = "RESUMED";

pub const EVENT_GUILD_CREATE: &str = "GUILD_CREATE";
pub const EVENT_GUILD_UPDATE: &str = "GUILD_UPDATE";
pub const EVENT_GUILD_DELETE: &str = "GUILD_DELETE";
pub const EVENT_GUILD_MEMBERS_CHUNK: &str = "GUILD_MEMBERS_CHUNK";

pub const EVENT_CHANNEL_CREATE: &str = "CHANNEL_CREATE";
pub const EVENT_CHANNEL_UPDATE: &str = "CHANNEL_UPDATE";
pub const EVENT_CHANNEL_DELETE: &str = "CHANNEL_DELETE";

pub const EVENT_MESSAGE_CREATE: &str = "MESSAGE_CREATE";
pub const EVENT_MESSAGE_UPDATE: &str = "MESSAGE_UPDATE";
pub const EVENT_MESSAGE_DELETE: &str = "MESSAGE_DELETE";
pub const EVENT_MESSAGE_DELETE_BULK: &str = "MESSAGE_DELETE_BULK";

pub const EVENT_PRESENCE_UPDATE: &str = "PRESENCE_UPDATE";
pub const EVENT_INTERACTION_CREATE: &str = "INTERACTION_CREATE";

pub const EVENT_VOICE_STATE_UPDATE: &str = "VOICE_STATE_UPDATE";
pub const EVENT_VOICE_SERVER_UPDATE: &str = "VOICE_SERVER_UPDATE";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_encodes_null_before_first_dispatch() {
        let hb = serde_json::to_string(&GatewayMessage::heartbeat(None)).unwrap();
        assert_eq!(hb, r#"{"op":1,"d":null}"#);
        let hb = serde_json::to_string(&GatewayMessage::heartbeat(Some(42))).unwrap();
        assert_eq!(hb, r#"{"op":1,"d":42}"#);
    }

    #[test]
    fn dispatch_decodes_with_optional_fields() {
        let msg: GatewayMessage =
            serde_json::from_str(r#"{"op":0,"t":"MESSAGE_CREATE","s":2,"d":{"id":"1"}}"#).unwrap();
        assert_eq!(msg.op, OP_DISPATCH);
        assert_eq!(msg.s, Some(2));
        assert_eq!(msg.t.as_deref(), Some(EVENT_MESSAGE_CREATE));

        let ack: GatewayMessage = serde_json::from_str(r#"{"op":11}"#).unwrap();
        assert_eq!(ack.op, OP_HEARTBEAT_ACK);
        assert!(ack.d.is_none());
    }

    #[test]
    fn leave_voice_serializes_null_channel() {
        let update = UpdateVoiceState {
            guild_id: GuildId::new(1),
            channel_id: None,
            self_mute: false,
            self_deaf: true,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert!(json["channel_id"].is_null());
        assert_eq!(json["guild_id"], "1");
    }

    #[test]
    fn shard_routing() {
        let guild = GuildId::new(41_771_983_423_143_937);
        let shard = ShardId::for_guild(guild, 4);
        assert_eq!(shard.id, ((41_771_983_423_143_937u64 >> 22) % 4) as u32);
        assert_eq!(serde_json::to_string(&shard).unwrap(), format!("[{},4]", shard.id));
    }

    #[test]
    fn close_code_classification() {
        assert_eq!(close_action(4004), CloseAction::Fatal);
        for code in 4010..=4014 {
            assert_eq!(close_action(code), CloseAction::Fatal);
        }
        assert_eq!(close_action(4007), CloseAction::Reidentify);
        assert_eq!(close_action(4009), CloseAction::Reidentify);
        assert_eq!(close_action(4000), CloseAction::Resume);
        assert_eq!(close_action(1006), CloseAction::Resume);
    }
}
