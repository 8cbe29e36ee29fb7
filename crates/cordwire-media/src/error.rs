use cordwire_codec::CodecError;
use cordwire_ws::GatewayError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("timed out waiting for voice server")]
    Timeout,
    #[error("gateway session is not ready")]
    NotReady,
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("udp error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("ip discovery failed: {0}")]
    Discovery(String),
    #[error("voice protocol error: {0}")]
    Protocol(String),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("voice server closed the session: {code} ({reason})")]
    Fatal { code: u16, reason: String },
    #[error("cancelled")]
    Cancelled,
    #[error("voice connection closed")]
    Closed,
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
