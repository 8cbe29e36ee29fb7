pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod sender;

pub use config::VoiceConfig;
pub use connection::{voice_url, VoiceConnection, VoiceConnectionState, VoiceConnector, VoiceGateway};
pub use discovery::discover;
pub use error::VoiceError;
pub use sender::SenderStats;
