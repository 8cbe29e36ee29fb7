use std::error::Error as StdError;

use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Dialing, reading or writing the socket failed.
    #[error("gateway transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("gateway decode error: {0}")]
    Decode(#[source] BoxError),

    /// The zlib-stream context is broken. Every later frame on the same
    /// socket fails too, so only a new connection recovers.
    #[error("gateway inflate error: {0}")]
    Inflate(#[source] BoxError),

    /// The server closed with a code that retrying cannot fix.
    #[error("gateway closed with fatal code {code}: {reason}")]
    Fatal { code: u16, reason: String },

    #[error("gateway operation cancelled")]
    Cancelled,

    #[error("gateway connection closed")]
    Closed,

    #[error("invalid gateway url: {0}")]
    Url(#[from] url::ParseError),

    #[error("gateway discovery failed: {0}")]
    Http(#[source] BoxError),
}

impl GatewayError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// Wrap a REST failure hit while discovering the gateway URL.
    pub fn http<E: StdError + Send + Sync + 'static>(err: E) -> Self {
        Self::Http(Box::new(err))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(Box::new(err))
    }
}

impl From<flate2::DecompressError> for GatewayError {
    fn from(err: flate2::DecompressError) -> Self {
        Self::Inflate(Box::new(err))
    }
}

impl From<std::string::FromUtf8Error> for GatewayError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Self::Inflate(Box::new(err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Io(io) => Self::Transport(io),
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::Closed,
            other => Self::Transport(std::io::Error::other(other)),
        }
    }
}
