use std::fmt;

/// Resources whose id Discord treats as a "major parameter": requests for
/// different ids of these never share a rate limit.
const MAJOR_RESOURCES: [&str; 3] = ["channels", "guilds", "webhooks"];

const ID_PLACEHOLDER: &str = "{id}";
const REACTION_PLACEHOLDER: &str = "{reaction}";
const TOKEN_PLACEHOLDER: &str = "{token}";

/// Canonical rate-limit key for a REST path.
///
/// The id following `channels/`, `guilds/` or `webhooks/` is kept (plus the
/// webhook token), every other snowflake becomes `{id}`, and everything after
/// `reactions/` collapses into one placeholder. Query strings and the HTTP
/// method are not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathKey {
    key: String,
    major: Option<String>,
}

impl PathKey {
    pub fn new(path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let mut out: Vec<String> = Vec::with_capacity(segments.len());
        let mut major: Option<String> = None;
        let mut i = 0;
        while i < segments.len() {
            let segment = segments[i];
            let prev = i.checked_sub(1).map(|p| segments[p]);

            if segment == "reactions" {
                out.push(segment.to_string());
                if i + 1 < segments.len() {
                    out.push(REACTION_PLACEHOLDER.to_string());
                }
                break;
            }

            if is_snowflake(segment) {
                match prev {
                    Some(resource) if major.is_none() && MAJOR_RESOURCES.contains(&resource) => {
                        major = Some(format!("{resource}/{segment}"));
                        out.push(segment.to_string());
                        // webhooks/{id}/{token}: the token is part of the major parameter.
                        if resource == "webhooks" {
                            if let Some(token) = segments.get(i + 1).filter(|t| !is_word(t)) {
                                out.push((*token).to_string());
                                i += 1;
                            }
                        }
                    }
                    Some("interactions") => {
                        out.push(ID_PLACEHOLDER.to_string());
                        if segments.get(i + 1).is_some_and(|t| !is_word(t)) {
                            out.push(TOKEN_PLACEHOLDER.to_string());
                            i += 1;
                        }
                    }
                    _ => out.push(ID_PLACEHOLDER.to_string()),
                }
            } else {
                out.push(segment.to_string());
            }
            i += 1;
        }

        Self {
            key: out.join("/"),
            major,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// `resource/id` of the major parameter, if the path has one.
    pub fn major(&self) -> Option<&str> {
        self.major.as_deref()
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl From<&str> for PathKey {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

fn is_snowflake(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

/// Route words are lowercase ascii with dashes or `@me`; tokens are not.
fn is_word(segment: &str) -> bool {
    segment == "@me"
        || segment
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_major_parameter() {
        let key = PathKey::new("/channels/381870553235193857/messages/381870553235193999");
        assert_eq!(key.as_str(), "channels/381870553235193857/messages/{id}");
        assert_eq!(key.major(), Some("channels/381870553235193857"));

        let other = PathKey::new("channels/381870553235193857/messages/1");
        assert_eq!(key, other);
        assert_ne!(key, PathKey::new("channels/2/messages/1"));
    }

    #[test]
    fn second_major_resource_is_not_major() {
        let key = PathKey::new("guilds/10/channels/20");
        assert_eq!(key.as_str(), "guilds/10/channels/{id}");
        assert_eq!(key.major(), Some("guilds/10"));
    }

    #[test]
    fn reactions_collapse() {
        let a = PathKey::new("channels/1/messages/2/reactions/%F0%9F%91%8D/@me");
        let b = PathKey::new("channels/1/messages/3/reactions/custom:123/456");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "channels/1/messages/{id}/reactions/{reaction}");
        assert_eq!(
            PathKey::new("channels/1/messages/2/reactions").as_str(),
            "channels/1/messages/{id}/reactions"
        );
    }

    #[test]
    fn webhook_token_is_major() {
        let key = PathKey::new("webhooks/5/AbCd-tok3n?wait=true");
        assert_eq!(key.as_str(), "webhooks/5/AbCd-tok3n");
        assert_eq!(key.major(), Some("webhooks/5"));
        assert_eq!(PathKey::new("webhooks/5/messages/@original"), PathKey::new("webhooks/5/messages/@original"));
    }

    #[test]
    fn interaction_token_is_hidden() {
        let key = PathKey::new("interactions/99/aW50ZXJhY3Rpb24/callback");
        assert_eq!(key.as_str(), "interactions/{id}/{token}/callback");
        assert_eq!(key.major(), None);
    }

    #[test]
    fn query_is_ignored() {
        assert_eq!(
            PathKey::new("guilds/1/members?limit=1000&after=0"),
            PathKey::new("guilds/1/members")
        );
    }
}
