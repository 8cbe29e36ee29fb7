use bitflags::bitflags;
use cordwire_util::{ChannelId, GuildId, UserId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::user::Member;

// Voice gateway opcodes
pub const VOICE_OP_IDENTIFY: u8 = 0;
pub const VOICE_OP_SELECT_PROTOCOL: u8 = 1;
pub const VOICE_OP_READY: u8 = 2;
pub const VOICE_OP_HEARTBEAT: u8 = 3;
pub const VOICE_OP_SESSION_DESCRIPTION: u8 = 4;
pub const VOICE_OP_SPEAKING: u8 = 5;
pub const VOICE_OP_HEARTBEAT_ACK: u8 = 6;
pub const VOICE_OP_RESUME: u8 = 7;
pub const VOICE_OP_HELLO: u8 = 8;
pub const VOICE_OP_RESUMED: u8 = 9;
pub const VOICE_OP_CLIENT_DISCONNECT: u8 = 13;

/// Voice gateway protocol version requested in the endpoint URL.
pub const VOICE_GATEWAY_VERSION: u8 = 4;

// Voice close codes
pub const VOICE_CLOSE_UNKNOWN_OPCODE: u16 = 4001;
pub const VOICE_CLOSE_AUTHENTICATION_FAILED: u16 = 4004;
pub const VOICE_CLOSE_SESSION_NO_LONGER_VALID: u16 = 4006;
pub const VOICE_CLOSE_SESSION_TIMEOUT: u16 = 4009;
pub const VOICE_CLOSE_SERVER_NOT_FOUND: u16 = 4011;
pub const VOICE_CLOSE_UNKNOWN_PROTOCOL: u16 = 4012;
/// Kicked, channel deleted, or the voice server moved.
pub const VOICE_CLOSE_DISCONNECTED: u16 = 4014;
pub const VOICE_CLOSE_SERVER_CRASHED: u16 = 4015;
pub const VOICE_CLOSE_UNKNOWN_ENCRYPTION_MODE: u16 = 4016;

/// What a voice connection does after the server closes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceCloseAction {
    /// Resume on a new socket, keeping UDP and keys.
    Resume,
    /// Start over from Identify on the same endpoint.
    Reconnect,
    /// Wait for a new VOICE_SERVER_UPDATE or a leave.
    AwaitServer,
    /// Give up.
    Fatal,
}

pub fn voice_close_action(code: u16) -> VoiceCloseAction {
    match code {
        VOICE_CLOSE_AUTHENTICATION_FAILED
        | VOICE_CLOSE_SESSION_NO_LONGER_VALID
        | VOICE_CLOSE_SERVER_NOT_FOUND
        | VOICE_CLOSE_UNKNOWN_PROTOCOL
        | VOICE_CLOSE_UNKNOWN_ENCRYPTION_MODE => VoiceCloseAction::Fatal,
        VOICE_CLOSE_SESSION_TIMEOUT => VoiceCloseAction::Reconnect,
        VOICE_CLOSE_DISCONNECTED => VoiceCloseAction::AwaitServer,
        _ => VoiceCloseAction::Resume,
    }
}

pub fn voice_close_reason(code: u16) -> &'static str {
    match code {
        VOICE_CLOSE_UNKNOWN_OPCODE => "unknown opcode",
        VOICE_CLOSE_AUTHENTICATION_FAILED => "authentication failed",
        VOICE_CLOSE_SESSION_NO_LONGER_VALID => "session no longer valid",
        VOICE_CLOSE_SESSION_TIMEOUT => "session timeout",
        VOICE_CLOSE_SERVER_NOT_FOUND => "server not found",
        VOICE_CLOSE_UNKNOWN_PROTOCOL => "unknown protocol",
        VOICE_CLOSE_DISCONNECTED => "disconnected",
        VOICE_CLOSE_SERVER_CRASHED => "voice server crashed",
        VOICE_CLOSE_UNKNOWN_ENCRYPTION_MODE => "unknown encryption mode",
        _ => "unknown",
    }
}

/// Dispatch `VOICE_STATE_UPDATE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceState {
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    pub channel_id: Option<ChannelId>,
    pub user_id: UserId,
    pub session_id: String,
    #[serde(default)]
    pub deaf: bool,
    #[serde(default)]
    pub mute: bool,
    #[serde(default)]
    pub self_deaf: bool,
    #[serde(default)]
    pub self_mute: bool,
    #[serde(default)]
    pub self_stream: bool,
    #[serde(default)]
    pub self_video: bool,
    #[serde(default)]
    pub suppress: bool,
    #[serde(default)]
    pub member: Option<Member>,
}

/// Dispatch `VOICE_SERVER_UPDATE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceServerUpdate {
    pub token: String,
    pub guild_id: GuildId,
    /// `None` while Discord is reallocating the voice server.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceIdentify {
    pub server_id: GuildId,
    pub user_id: UserId,
    pub session_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceResume {
    pub server_id: GuildId,
    pub session_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceHello {
    /// Milliseconds; the voice gateway sends this as a float.
    pub heartbeat_interval: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceReady {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    pub modes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectProtocol {
    pub protocol: String,
    pub data: SelectProtocolData,
}

impl SelectProtocol {
    pub fn udp(address: String, port: u16, mode: &str) -> Self {
        Self {
            protocol: "udp".to_string(),
            data: SelectProtocolData {
                address,
                port,
                mode: mode.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub mode: String,
    pub secret_key: Vec<u8>,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpeakingFlags: u8 {
        const MICROPHONE = 1 << 0;
        const SOUNDSHARE = 1 << 1;
        const PRIORITY   = 1 << 2;
    }
}

impl Serialize for SpeakingFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

impl<'de> Deserialize<'de> for SpeakingFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u8::deserialize(deserializer)?;
        Ok(SpeakingFlags::from_bits_truncate(bits))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Speaking {
    pub speaking: SpeakingFlags,
    #[serde(default)]
    pub delay: u32,
    pub ssrc: u32,
    /// Only present on speaking updates about other users.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDisconnect {
    pub user_id: UserId,
}

/// Entry of `GET /voice/regions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceRegion {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub optimal: bool,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub custom: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_decodes() {
        let ready: VoiceReady = serde_json::from_str(
            r#"{"ssrc":4660,"ip":"127.0.0.1","port":1234,"modes":["xsalsa20_poly1305","xsalsa20_poly1305_lite"],"heartbeat_interval":1}"#,
        )
        .unwrap();
        assert_eq!(ready.ssrc, 0x1234);
        assert_eq!(ready.modes.len(), 2);
    }

    #[test]
    fn select_protocol_shape() {
        let json = serde_json::to_value(SelectProtocol::udp(
            "198.51.100.7".into(),
            50000,
            "xsalsa20_poly1305_lite",
        ))
        .unwrap();
        assert_eq!(json["protocol"], "udp");
        assert_eq!(json["data"]["address"], "198.51.100.7");
        assert_eq!(json["data"]["port"], 50000);
    }

    #[test]
    fn speaking_flags_as_integer() {
        let speaking = Speaking {
            speaking: SpeakingFlags::MICROPHONE | SpeakingFlags::PRIORITY,
            delay: 0,
            ssrc: 7,
            user_id: None,
        };
        let json = serde_json::to_value(&speaking).unwrap();
        assert_eq!(json["speaking"], 5);
        assert!(json.get("user_id").is_none());
    }

    #[test]
    fn close_codes() {
        assert_eq!(voice_close_action(4006), VoiceCloseAction::Fatal);
        assert_eq!(voice_close_action(4014), VoiceCloseAction::AwaitServer);
        assert_eq!(voice_close_action(4015), VoiceCloseAction::Resume);
        assert_eq!(voice_close_action(1006), VoiceCloseAction::Resume);
        assert_eq!(voice_close_reason(4009), "session timeout");
    }

    #[test]
    fn voice_state_leave_has_null_channel() {
        let state: VoiceState = serde_json::from_str(
            r#"{"guild_id":"1","channel_id":null,"user_id":"2","session_id":"abc"}"#,
        )
        .unwrap();
        assert!(state.channel_id.is_none());
        assert_eq!(state.user_id, UserId::new(2));
    }
}
