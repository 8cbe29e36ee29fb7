use bytes::Bytes;
use cordwire_util::validation::{
    check_count, validate_message_content, ValidationError, MAX_ALLOWED_MENTION_IDS, MAX_EMBEDS,
};
use cordwire_util::{ChannelId, GuildId, MessageId, RoleId, UserId};
use serde::{Deserialize, Serialize};

use crate::embed::Embed;
use crate::nullable::Nullable;
use crate::user::User;

/// Filename prefix Discord uses to blur an attachment.
pub const ATTACHMENT_SPOILER_PREFIX: &str = "SPOILER_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum MessageType {
    Default,
    RecipientAdd,
    RecipientRemove,
    Call,
    ChannelNameChange,
    ChannelIconChange,
    PinnedMessage,
    GuildMemberJoin,
    Reply,
    Other(u8),
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Default,
            1 => Self::RecipientAdd,
            2 => Self::RecipientRemove,
            3 => Self::Call,
            4 => Self::ChannelNameChange,
            5 => Self::ChannelIconChange,
            6 => Self::PinnedMessage,
            7 => Self::GuildMemberJoin,
            19 => Self::Reply,
            other => Self::Other(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Default => 0,
            MessageType::RecipientAdd => 1,
            MessageType::RecipientRemove => 2,
            MessageType::Call => 3,
            MessageType::ChannelNameChange => 4,
            MessageType::ChannelIconChange => 5,
            MessageType::PinnedMessage => 6,
            MessageType::GuildMemberJoin => 7,
            MessageType::Reply => 19,
            MessageType::Other(other) => other,
        }
    }
}

impl Default for MessageType {
    fn default() -> Self {
        Self::Default
    }
}

/// Message as returned by the REST API and `MESSAGE_CREATE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    pub author: User,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub edited_timestamp: Option<String>,
    #[serde(default)]
    pub tts: bool,
    #[serde(default)]
    pub mention_everyone: bool,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default, rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: cordwire_util::Snowflake,
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: u64,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MentionType {
    Roles,
    Users,
    Everyone,
}

/// Restricts which mentions in the content actually ping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedMentions {
    #[serde(default)]
    pub parse: Vec<MentionType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<RoleId>,
    #[serde(default)]
    pub replied_user: bool,
}

impl AllowedMentions {
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_count("allowed mention users", self.users.len(), MAX_ALLOWED_MENTION_IDS)?;
        check_count("allowed mention roles", self.roles.len(), MAX_ALLOWED_MENTION_IDS)?;
        if !self.users.is_empty() && self.parse.contains(&MentionType::Users) {
            return Err(ValidationError::Conflict(
                "allowed_mentions.users together with parse=users",
            ));
        }
        if !self.roles.is_empty() && self.parse.contains(&MentionType::Roles) {
            return Err(ValidationError::Conflict(
                "allowed_mentions.roles together with parse=roles",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<GuildId>,
    #[serde(default = "default_true")]
    pub fail_if_not_exists: bool,
}

fn default_true() -> bool {
    true
}

/// A file uploaded alongside a message as a multipart part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFile {
    pub name: String,
    /// Declared MIME type; guessed from `name` when absent.
    pub content_type: Option<String>,
    pub data: Bytes,
    pub spoiler: bool,
}

impl SendFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content_type: None,
            data: data.into(),
            spoiler: false,
        }
    }

    pub fn spoiler(mut self) -> Self {
        self.spoiler = true;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Filename as sent on the wire, carrying the spoiler prefix when requested.
    pub fn wire_name(&self) -> String {
        if self.spoiler && !self.name.starts_with(ATTACHMENT_SPOILER_PREFIX) {
            format!("{ATTACHMENT_SPOILER_PREFIX}{}", self.name)
        } else {
            self.name.clone()
        }
    }
}

/// Body of `POST /channels/{id}/messages`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tts: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_mentions: Option<AllowedMentions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_reference: Option<MessageReference>,
    /// Sent as multipart parts, never inside the JSON payload.
    #[serde(skip)]
    pub files: Vec<SendFile>,
}

impl SendMessage {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_embed(mut self, embed: Embed) -> Self {
        self.embeds.push(embed);
        self
    }

    pub fn with_file(mut self, file: SendFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn reply_to(mut self, message_id: MessageId) -> Self {
        self.message_reference = Some(MessageReference {
            message_id: Some(message_id),
            channel_id: None,
            guild_id: None,
            fail_if_not_exists: true,
        });
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.content.is_empty() && self.embeds.is_empty() && self.files.is_empty() {
            return Err(ValidationError::Empty("message"));
        }
        validate_message_content(&self.content)?;
        check_count("embeds", self.embeds.len(), MAX_EMBEDS)?;
        for embed in &self.embeds {
            embed.validate()?;
        }
        if let Some(mentions) = &self.allowed_mentions {
            mentions.validate()?;
        }
        Ok(())
    }
}

/// Body of `PATCH /channels/{id}/messages/{id}`. `Null` clears a field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditMessage {
    #[serde(default, skip_serializing_if = "Nullable::is_unspecified")]
    pub content: Nullable<String>,
    #[serde(default, skip_serializing_if = "Nullable::is_unspecified")]
    pub embeds: Nullable<Vec<Embed>>,
    #[serde(default, skip_serializing_if = "Nullable::is_unspecified")]
    pub allowed_mentions: Nullable<AllowedMentions>,
}

impl EditMessage {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(content) = self.content.as_value() {
            validate_message_content(content)?;
        }
        if let Some(embeds) = self.embeds.as_value() {
            check_count("embeds", embeds.len(), MAX_EMBEDS)?;
            for embed in embeds {
                embed.validate()?;
            }
        }
        if let Some(mentions) = self.allowed_mentions.as_value() {
            mentions.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::EmbedField;

    #[test]
    fn send_message_survives_json() {
        let message = SendMessage {
            content: "deploy finished".into(),
            embeds: vec![Embed {
                title: Some("build 812".into()),
                fields: vec![EmbedField {
                    name: "duration".into(),
                    value: "3m12s".into(),
                    inline: true,
                }],
                ..Embed::default()
            }],
            allowed_mentions: Some(AllowedMentions {
                parse: vec![MentionType::Roles],
                users: vec![UserId::new(80351110224678912)],
                ..AllowedMentions::default()
            }),
            ..SendMessage::default()
        };
        message.validate().unwrap();

        let json = serde_json::to_string(&message).unwrap();
        let back: SendMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.content, message.content);
        assert_eq!(back.embeds, message.embeds);
        assert_eq!(back.allowed_mentions, message.allowed_mentions);
        assert!(!json.contains("tts"));
    }

    #[test]
    fn files_stay_out_of_json() {
        let message = SendMessage::content("log").with_file(SendFile::new("log.txt", "abc"));
        let json = serde_json::to_value(&message).unwrap();
        assert!(json.get("files").is_none());
    }

    #[test]
    fn mention_id_limit_and_conflict() {
        let mentions = AllowedMentions {
            users: (1..=101).map(UserId::new).collect(),
            ..AllowedMentions::default()
        };
        assert!(matches!(
            mentions.validate(),
            Err(ValidationError::TooMany { max: 100, got: 101, .. })
        ));

        let mentions = AllowedMentions {
            parse: vec![MentionType::Users],
            users: vec![UserId::new(1)],
            ..AllowedMentions::default()
        };
        assert!(matches!(mentions.validate(), Err(ValidationError::Conflict(_))));
    }

    #[test]
    fn empty_and_oversized_messages_rejected() {
        assert_eq!(
            SendMessage::default().validate(),
            Err(ValidationError::Empty("message"))
        );
        let mut message = SendMessage::content("x");
        message.embeds = vec![Embed::default(); 11];
        assert!(matches!(
            message.validate(),
            Err(ValidationError::TooMany { field: "embeds", .. })
        ));
    }

    #[test]
    fn spoiler_prefix_applied_once() {
        let file = SendFile::new("cat.png", vec![1u8, 2, 3]).spoiler();
        assert_eq!(file.wire_name(), "SPOILER_cat.png");
        let file = SendFile::new("SPOILER_cat.png", vec![1u8]).spoiler();
        assert_eq!(file.wire_name(), "SPOILER_cat.png");
    }

    #[test]
    fn edit_distinguishes_clear_from_unchanged() {
        let edit = EditMessage {
            content: Nullable::Value("fixed typo".into()),
            embeds: Nullable::Null,
            ..EditMessage::default()
        };
        let json = serde_json::to_value(&edit).unwrap();
        assert_eq!(json["content"], "fixed typo");
        assert!(json["embeds"].is_null());
        assert!(json.get("allowed_mentions").is_none());
    }

    #[test]
    fn message_decodes_from_api_shape() {
        let message: Message = serde_json::from_str(
            r#"{"id":"10","channel_id":"20","author":{"id":"30","username":"bot","bot":true},
                "content":"hi","type":19,"embeds":[],"attachments":[]}"#,
        )
        .unwrap();
        assert_eq!(message.kind, MessageType::Reply);
        assert!(message.author.bot);
    }
}
