use core::fmt::{self, Display, Formatter};
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// A validated Bayeux channel name: an absolute `/`-separated path with no
/// empty segments.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId(String);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelKind {
    /// `/meta/..` control channels, handled by the server itself.
    Meta,
    /// `/service/..` directed channels, never broadcast to subscribers.
    Service,
    /// Everything else, fanned out to subscribed sessions.
    Broadcast,
}

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
pub enum InvalidChannel {
    #[error("channel name is empty")]
    Empty,
    #[error("channel name `{0}` is not an absolute path")]
    NotAbsolute(String),
    #[error("channel name `{0}` contains an empty segment")]
    EmptySegment(String),
}

impl ChannelId {
    pub fn new(name: &str) -> Result<Self, InvalidChannel> {
        if name.is_empty() {
            return Err(InvalidChannel::Empty);
        }

        let Some(rest) = name.strip_prefix('/') else {
            return Err(InvalidChannel::NotAbsolute(name.to_owned()));
        };

        if rest.is_empty() || rest.split('/').any(str::is_empty) {
            return Err(InvalidChannel::EmptySegment(name.to_owned()));
        }

        Ok(Self(name.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        if self.is_meta() {
            ChannelKind::Meta
        } else if self.is_service() {
            ChannelKind::Service
        } else {
            ChannelKind::Broadcast
        }
    }

    #[must_use]
    pub fn is_meta(&self) -> bool {
        self.0.starts_with("/meta/")
    }

    #[must_use]
    pub fn is_service(&self) -> bool {
        self.0.starts_with("/service/")
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        !self.is_meta() && !self.is_service()
    }

    fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').skip(1)
    }

    /// Whether the last segment is a `*` or `**` wildcard.
    #[must_use]
    pub fn is_wild(&self) -> bool {
        matches!(self.segments().last(), Some("*" | "**"))
    }

    #[must_use]
    pub fn is_deep_wild(&self) -> bool {
        matches!(self.segments().last(), Some("**"))
    }

    /// The wildcard channels matching this one, most general first.
    ///
    /// `/a/b/c` yields `/**`, `/a/**`, `/a/b/**`, `/a/b/*`. Wildcard channels
    /// have no wild parents of their own.
    #[must_use]
    pub fn wild_parents(&self) -> Vec<ChannelId> {
        if self.is_wild() {
            return Vec::new();
        }

        let segments: Vec<&str> = self.segments().collect();
        let mut parents = Vec::with_capacity(segments.len() + 1);

        let mut prefix = String::new();
        for segment in &segments[..segments.len() - 1] {
            parents.push(Self(format!("{prefix}/**")));
            prefix.push('/');
            prefix.push_str(segment);
        }
        parents.push(Self(format!("{prefix}/**")));
        parents.push(Self(format!("{prefix}/*")));

        parents
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl FromStr for ChannelId {
    type Err = InvalidChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ChannelId {
    type Error = InvalidChannel;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::new(&name)
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chan(name: &str) -> ChannelId {
        ChannelId::new(name).expect(name)
    }

    #[test]
    fn rejects_malformed_names() {
        assert_eq!(ChannelId::new(""), Err(InvalidChannel::Empty));
        assert_eq!(
            ChannelId::new("foo"),
            Err(InvalidChannel::NotAbsolute("foo".to_owned()))
        );
        assert_eq!(
            ChannelId::new("/"),
            Err(InvalidChannel::EmptySegment("/".to_owned()))
        );
        assert_eq!(
            ChannelId::new("/a//b"),
            Err(InvalidChannel::EmptySegment("/a//b".to_owned()))
        );
        assert_eq!(
            ChannelId::new("/a/b/"),
            Err(InvalidChannel::EmptySegment("/a/b/".to_owned()))
        );
    }

    #[test]
    fn classifies_by_prefix() {
        assert_eq!(chan("/meta/connect").kind(), ChannelKind::Meta);
        assert_eq!(chan("/service/echo").kind(), ChannelKind::Service);
        assert_eq!(chan("/chat/rust").kind(), ChannelKind::Broadcast);
        // A bare `/meta` segment is not a meta channel.
        assert_eq!(chan("/meta").kind(), ChannelKind::Broadcast);
    }

    #[test]
    fn wild_parents_ancestor_first() {
        let parents: Vec<String> = chan("/a/b/c")
            .wild_parents()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(parents, ["/**", "/a/**", "/a/b/**", "/a/b/*"]);

        let parents: Vec<String> = chan("/foo")
            .wild_parents()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(parents, ["/**", "/*"]);
    }

    #[test]
    fn wildcards_have_no_wild_parents() {
        assert!(chan("/a/*").is_wild());
        assert!(chan("/a/**").is_deep_wild());
        assert!(chan("/a/*").wild_parents().is_empty());
        assert!(chan("/**").wild_parents().is_empty());
    }
}
