use thiserror::Error;

pub const MAX_MESSAGE_CONTENT: usize = 2000;
pub const MAX_EMBEDS: usize = 10;
pub const MAX_EMBED_TITLE: usize = 256;
pub const MAX_EMBED_DESCRIPTION: usize = 4096;
pub const MAX_EMBED_FIELDS: usize = 25;
pub const MAX_EMBED_FIELD_NAME: usize = 256;
pub const MAX_EMBED_FIELD_VALUE: usize = 1024;
pub const MAX_EMBED_FOOTER: usize = 2048;
pub const MAX_EMBED_AUTHOR: usize = 256;
/// Combined character count across all text fields of one embed.
pub const MAX_EMBED_TOTAL: usize = 6000;
pub const MAX_ALLOWED_MENTION_IDS: usize = 100;
pub const MAX_AUDIT_LOG_REASON: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} is too long (max {max}, got {got})")]
    TooLong {
        field: &'static str,
        max: usize,
        got: usize,
    },
    #[error("too many {field} (max {max}, got {got})")]
    TooMany {
        field: &'static str,
        max: usize,
        got: usize,
    },
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("conflicting options: {0}")]
    Conflict(&'static str),
    #[error("unsupported content type: {0}")]
    ContentType(String),
    #[error("invalid format")]
    InvalidFormat,
}

/// Length check in characters, which is how Discord counts text limits.
pub fn check_len(field: &'static str, value: &str, max: usize) -> Result<usize, ValidationError> {
    let got = value.chars().count();
    if got > max {
        return Err(ValidationError::TooLong { field, max, got });
    }
    Ok(got)
}

pub fn check_count(field: &'static str, got: usize, max: usize) -> Result<(), ValidationError> {
    if got > max {
        return Err(ValidationError::TooMany { field, max, got });
    }
    Ok(())
}

pub fn validate_message_content(content: &str) -> Result<(), ValidationError> {
    check_len("content", content, MAX_MESSAGE_CONTENT).map(|_| ())
}

pub fn validate_audit_log_reason(reason: &str) -> Result<(), ValidationError> {
    if reason.trim().is_empty() {
        return Err(ValidationError::Empty("audit log reason"));
    }
    check_len("audit log reason", reason, MAX_AUDIT_LOG_REASON).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_characters_not_bytes() {
        let content = "é".repeat(MAX_MESSAGE_CONTENT);
        assert!(content.len() > MAX_MESSAGE_CONTENT);
        assert!(validate_message_content(&content).is_ok());

        let too_long = "a".repeat(MAX_MESSAGE_CONTENT + 1);
        assert_eq!(
            validate_message_content(&too_long),
            Err(ValidationError::TooLong {
                field: "content",
                max: MAX_MESSAGE_CONTENT,
                got: MAX_MESSAGE_CONTENT + 1
            })
        );
    }

    #[test]
    fn count_limit() {
        assert!(check_count("embeds", 10, MAX_EMBEDS).is_ok());
        assert!(matches!(
            check_count("embeds", 11, MAX_EMBEDS),
            Err(ValidationError::TooMany { got: 11, .. })
        ));
    }

    #[test]
    fn audit_reason_rules() {
        assert!(validate_audit_log_reason("cleanup").is_ok());
        assert_eq!(
            validate_audit_log_reason("  "),
            Err(ValidationError::Empty("audit log reason"))
        );
        assert!(validate_audit_log_reason(&"x".repeat(513)).is_err());
    }
}
