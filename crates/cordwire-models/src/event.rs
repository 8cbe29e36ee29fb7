use serde_json::Value;

use crate::gateway::{
    Ready, ShardId, EVENT_READY, EVENT_RESUMED, EVENT_VOICE_SERVER_UPDATE,
    EVENT_VOICE_STATE_UPDATE,
};
use crate::voice::{VoiceServerUpdate, VoiceState};

/// A gateway dispatch, decoded only as far as the client itself needs.
///
/// Everything the connection machinery does not act on stays as raw JSON in
/// [`Event::Other`]; consumers filter on [`Event::name`] and decode the body
/// into their own types.
#[derive(Debug, Clone)]
pub enum Event {
    Ready(Box<Ready>),
    Resumed,
    VoiceStateUpdate(VoiceState),
    VoiceServerUpdate(VoiceServerUpdate),
    Other { name: String, data: Value },
}

impl Event {
    pub fn decode(name: &str, data: Value) -> Result<Self, serde_json::Error> {
        Ok(match name {
            EVENT_READY => Self::Ready(Box::new(serde_json::from_value(data)?)),
            EVENT_RESUMED => Self::Resumed,
            EVENT_VOICE_STATE_UPDATE => Self::VoiceStateUpdate(serde_json::from_value(data)?),
            EVENT_VOICE_SERVER_UPDATE => Self::VoiceServerUpdate(serde_json::from_value(data)?),
            _ => Self::Other {
                name: name.to_string(),
                data,
            },
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Ready(_) => EVENT_READY,
            Self::Resumed => EVENT_RESUMED,
            Self::VoiceStateUpdate(_) => EVENT_VOICE_STATE_UPDATE,
            Self::VoiceServerUpdate(_) => EVENT_VOICE_SERVER_UPDATE,
            Self::Other { name, .. } => name,
        }
    }

    /// Decode the body of an [`Event::Other`] into a caller-chosen type.
    pub fn data<T: serde::de::DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        match self {
            Self::Other { data, .. } => Some(T::deserialize(data)),
            _ => None,
        }
    }
}

/// An event together with the sequence and shard it arrived on.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub sequence: u64,
    pub shard: ShardId,
    pub event: Event,
}

impl Dispatch {
    pub fn name(&self) -> &str {
        self.event.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_events_are_typed() {
        let event = Event::decode(
            EVENT_VOICE_SERVER_UPDATE,
            json!({"token":"t","guild_id":"5","endpoint":"us-east1.discord.media:443"}),
        )
        .unwrap();
        match &event {
            Event::VoiceServerUpdate(update) => {
                assert_eq!(update.endpoint.as_deref(), Some("us-east1.discord.media:443"))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(event.name(), "VOICE_SERVER_UPDATE");
    }

    #[test]
    fn unknown_events_stay_opaque() {
        let event = Event::decode("MESSAGE_CREATE", json!({"id":"1","content":"hi"})).unwrap();
        assert_eq!(event.name(), "MESSAGE_CREATE");
        let body: Value = event.data().unwrap().unwrap();
        assert_eq!(body["content"], "hi");
    }

    #[test]
    fn malformed_known_event_is_an_error() {
        assert!(Event::decode(EVENT_READY, json!({"session_id": 5})).is_err());
    }
}
