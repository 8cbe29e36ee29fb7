pub mod embed;
pub mod error;
pub mod event;
pub mod gateway;
pub mod image;
pub mod intents;
pub mod message;
pub mod nullable;
pub mod presence;
pub mod user;
pub mod voice;

pub use error::ModelError;
pub use event::{Dispatch, Event};
pub use gateway::{GatewayMessage, ShardId};
pub use intents::Intents;
pub use nullable::Nullable;
