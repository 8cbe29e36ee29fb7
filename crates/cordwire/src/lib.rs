//! Discord client: REST, gateway shards and voice behind one [`Session`].

pub mod config;
pub mod error;
pub mod session;
pub mod voice;

pub use config::SessionConfig;
pub use error::SessionError;
pub use session::Session;
pub use voice::VoiceRegistry;

pub use cordwire_codec as codec;
pub use cordwire_http as http;
pub use cordwire_media as media;
pub use cordwire_models as models;
pub use cordwire_util as util;
pub use cordwire_ws as ws;

pub use cordwire_core::{Dispatcher, HandlerHandle, Subscription};
pub use cordwire_media::VoiceConnection;
pub use cordwire_models::{Dispatch, Event, Intents};
pub use tokio_util::sync::CancellationToken;
