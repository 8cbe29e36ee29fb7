use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A JSON field that may be absent, explicitly `null`, or set.
///
/// PATCH-style endpoints treat "absent" as "leave unchanged" and `null` as
/// "clear", so a plain `Option` cannot express both. Use with
/// `#[serde(default, skip_serializing_if = "Nullable::is_unspecified")]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Nullable<T> {
    Unspecified,
    Null,
    Value(T),
}

impl<T> Default for Nullable<T> {
    fn default() -> Self {
        Self::Unspecified
    }
}

impl<T> Nullable<T> {
    pub fn is_unspecified(&self) -> bool {
        matches!(self, Self::Unspecified)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_value(&self) -> Option<&T> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Nullable<U> {
        match self {
            Self::Unspecified => Nullable::Unspecified,
            Self::Null => Nullable::Null,
            Self::Value(v) => Nullable::Value(f(v)),
        }
    }
}

impl<T> From<T> for Nullable<T> {
    fn from(value: T) -> Self {
        Self::Value(value)
    }
}

impl<T: Serialize> Serialize for Nullable<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Value(v) => v.serialize(serializer),
            Self::Null | Self::Unspecified => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Nullable<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(v) => Self::Value(v),
            None => Self::Null,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct ModifyChannel {
        #[serde(default, skip_serializing_if = "Nullable::is_unspecified")]
        topic: Nullable<String>,
        #[serde(default, skip_serializing_if = "Nullable::is_unspecified")]
        rate_limit_per_user: Nullable<u32>,
    }

    #[test]
    fn three_states_on_the_wire() {
        let patch = ModifyChannel {
            topic: Nullable::Null,
            rate_limit_per_user: Nullable::Value(5),
        };
        assert_eq!(
            serde_json::to_string(&patch).unwrap(),
            r#"{"topic":null,"rate_limit_per_user":5}"#
        );
        assert_eq!(serde_json::to_string(&ModifyChannel::default()).unwrap(), "{}");
    }

    #[test]
    fn decoding_distinguishes_absent_from_null() {
        let patch: ModifyChannel = serde_json::from_str(r#"{"topic":null}"#).unwrap();
        assert!(patch.topic.is_null());
        assert!(patch.rate_limit_per_user.is_unspecified());

        let patch: ModifyChannel = serde_json::from_str(r#"{"topic":"hi"}"#).unwrap();
        assert_eq!(patch.topic.as_value().map(String::as_str), Some("hi"));
    }
}
