use cordwire_http::HttpError;
use cordwire_media::VoiceError;
use cordwire_ws::GatewayError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is not open")]
    NotOpen,

    #[error("session is already open")]
    AlreadyOpen,

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Voice(#[from] VoiceError),
}

impl SessionError {
    /// `true` when retrying `open` cannot help.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Gateway(err) => err.is_fatal(),
            Self::Voice(VoiceError::Fatal { .. }) => true,
            _ => false,
        }
    }
}
