use cordwire_util::validation::{
    check_count, check_len, ValidationError, MAX_EMBED_AUTHOR, MAX_EMBED_DESCRIPTION,
    MAX_EMBED_FIELDS, MAX_EMBED_FIELD_NAME, MAX_EMBED_FIELD_VALUE, MAX_EMBED_FOOTER,
    MAX_EMBED_TITLE, MAX_EMBED_TOTAL,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<EmbedMedia>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<EmbedMedia>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<EmbedAuthor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedFooter {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedMedia {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedAuthor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

impl Embed {
    /// Check the embed against Discord's per-field and combined limits.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut total = 0;
        if let Some(title) = &self.title {
            total += check_len("embed title", title, MAX_EMBED_TITLE)?;
        }
        if let Some(description) = &self.description {
            total += check_len("embed description", description, MAX_EMBED_DESCRIPTION)?;
        }
        if let Some(footer) = &self.footer {
            total += check_len("embed footer", &footer.text, MAX_EMBED_FOOTER)?;
        }
        if let Some(author) = &self.author {
            total += check_len("embed author", &author.name, MAX_EMBED_AUTHOR)?;
        }
        check_count("embed fields", self.fields.len(), MAX_EMBED_FIELDS)?;
        for field in &self.fields {
            if field.name.is_empty() {
                return Err(ValidationError::Empty("embed field name"));
            }
            if field.value.is_empty() {
                return Err(ValidationError::Empty("embed field value"));
            }
            total += check_len("embed field name", &field.name, MAX_EMBED_FIELD_NAME)?;
            total += check_len("embed field value", &field.value, MAX_EMBED_FIELD_VALUE)?;
        }
        if total > MAX_EMBED_TOTAL {
            return Err(ValidationError::TooLong {
                field: "embed",
                max: MAX_EMBED_TOTAL,
                got: total,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, value: usize) -> EmbedField {
        EmbedField {
            name: name.to_string(),
            value: "v".repeat(value),
            inline: false,
        }
    }

    #[test]
    fn accepts_reasonable_embed() {
        let embed = Embed {
            title: Some("Status".into()),
            description: Some("All systems nominal".into()),
            fields: vec![field("uptime", 10)],
            ..Embed::default()
        };
        assert!(embed.validate().is_ok());
    }

    #[test]
    fn title_limit() {
        let embed = Embed {
            title: Some("t".repeat(257)),
            ..Embed::default()
        };
        assert!(matches!(
            embed.validate(),
            Err(ValidationError::TooLong { field: "embed title", .. })
        ));
    }

    #[test]
    fn combined_limit() {
        // Each field is within bounds but together they exceed 6000 characters.
        let embed = Embed {
            description: Some("d".repeat(4000)),
            fields: (0..3).map(|i| field(&format!("f{i}"), 1000)).collect(),
            ..Embed::default()
        };
        assert!(matches!(
            embed.validate(),
            Err(ValidationError::TooLong { field: "embed", max: 6000, .. })
        ));
    }

    #[test]
    fn too_many_fields() {
        let embed = Embed {
            fields: (0..26).map(|i| field(&format!("f{i}"), 1)).collect(),
            ..Embed::default()
        };
        assert!(matches!(embed.validate(), Err(ValidationError::TooMany { .. })));
    }
}
