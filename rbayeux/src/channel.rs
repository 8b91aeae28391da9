//! Channel names and wildcard matching.
//!
//! A channel id is an absolute `/`-delimited path such as `/chat/room1`.
//! The last segment may be a wildcard: `*` matches exactly one segment,
//! `**` matches one or more segments. `/meta/**` is reserved for protocol
//! operations and `/service/**` for request/response traffic that is routed
//! to service handlers but never broadcast.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

const WILD: &str = "*";
const DEEP_WILD: &str = "**";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid channel `{0}`, {1}")]
    InvalidChannel(String, &'static str),
    #[error("invalid segment `{0}`")]
    InvalidSegment(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Literal(String),
    /// `*`, one segment
    Wild,
    /// `**`, one or more segments
    DeepWild,
}

impl Segment {
    fn parse(s: &str) -> Result<Segment, ChannelError> {
        match s {
            WILD => Ok(Segment::Wild),
            DEEP_WILD => Ok(Segment::DeepWild),
            "" => Err(ChannelError::InvalidSegment(String::new())),
            _ if s.contains('*') => Err(ChannelError::InvalidSegment(s.into())),
            _ => Ok(Segment::Literal(s.into())),
        }
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        !matches!(self, Segment::Literal(_))
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Literal(s) => f.write_str(s),
            Segment::Wild => f.write_str(WILD),
            Segment::DeepWild => f.write_str(DEEP_WILD),
        }
    }
}

/// The protocol operations carried on `/meta/*` channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaChannel {
    Handshake,
    Connect,
    Subscribe,
    Unsubscribe,
    Disconnect,
}

impl MetaChannel {
    pub const HANDSHAKE: &'static str = "/meta/handshake";
    pub const CONNECT: &'static str = "/meta/connect";
    pub const SUBSCRIBE: &'static str = "/meta/subscribe";
    pub const UNSUBSCRIBE: &'static str = "/meta/unsubscribe";
    pub const DISCONNECT: &'static str = "/meta/disconnect";

    #[inline]
    pub fn from_channel(channel: &str) -> Option<MetaChannel> {
        match channel {
            Self::HANDSHAKE => Some(MetaChannel::Handshake),
            Self::CONNECT => Some(MetaChannel::Connect),
            Self::SUBSCRIBE => Some(MetaChannel::Subscribe),
            Self::UNSUBSCRIBE => Some(MetaChannel::Unsubscribe),
            Self::DISCONNECT => Some(MetaChannel::Disconnect),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            MetaChannel::Handshake => Self::HANDSHAKE,
            MetaChannel::Connect => Self::CONNECT,
            MetaChannel::Subscribe => Self::SUBSCRIBE,
            MetaChannel::Unsubscribe => Self::UNSUBSCRIBE,
            MetaChannel::Disconnect => Self::DISCONNECT,
        }
    }
}

#[derive(Clone)]
pub struct ChannelId {
    id: String,
    segments: Vec<Segment>,
}

impl ChannelId {
    #[inline]
    pub fn parse<T: AsRef<str>>(s: T) -> Result<ChannelId, ChannelError> {
        ChannelId::from_str(s.as_ref())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    #[inline]
    fn first_is(&self, name: &str) -> bool {
        matches!(self.segments.first(), Some(Segment::Literal(s)) if s == name)
    }

    #[inline]
    pub fn is_meta(&self) -> bool {
        self.first_is("meta")
    }

    #[inline]
    pub fn is_service(&self) -> bool {
        self.first_is("service")
    }

    /// Neither meta nor service: publishes here reach subscribers.
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        !self.is_meta() && !self.is_service()
    }

    #[inline]
    pub fn is_wild(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::Wild))
    }

    #[inline]
    pub fn is_deep_wild(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::DeepWild))
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        self.is_wild() || self.is_deep_wild()
    }

    #[inline]
    pub fn meta(&self) -> Option<MetaChannel> {
        MetaChannel::from_channel(&self.id)
    }

    /// Wildcard patterns that match this channel, most specific first.
    ///
    /// `/a/b/c` yields `/a/b/*`, `/a/b/**`, `/a/**`, `/**`. A wildcard id has none.
    pub fn wilds(&self) -> Vec<ChannelId> {
        if self.is_wildcard() {
            return Vec::new();
        }
        let depth = self.segments.len();
        let mut wilds = Vec::with_capacity(depth + 1);
        wilds.push(self.with_prefix(depth - 1, Segment::Wild));
        for i in (0..depth).rev() {
            wilds.push(self.with_prefix(i, Segment::DeepWild));
        }
        wilds
    }

    fn with_prefix(&self, n: usize, last: Segment) -> ChannelId {
        let mut segments = self.segments[..n].to_vec();
        segments.push(last);
        ChannelId::from(segments)
    }

    /// True if this id, taken as a pattern, matches the non-wildcard `channel`.
    pub fn matches(&self, channel: &ChannelId) -> bool {
        if channel.is_wildcard() {
            return self == channel;
        }
        let prefix = &self.segments[..self.segments.len() - 1];
        let head_matches = || prefix.iter().zip(channel.segments.iter()).all(|(p, c)| p == c);
        match self.segments.last() {
            Some(Segment::Wild) => channel.depth() == self.depth() && head_matches(),
            Some(Segment::DeepWild) => channel.depth() >= self.depth() && head_matches(),
            _ => self == channel,
        }
    }

    #[inline]
    pub fn matches_str(&self, channel: &str) -> bool {
        ChannelId::parse(channel).map(|c| self.matches(&c)).unwrap_or(false)
    }
}

impl From<Vec<Segment>> for ChannelId {
    fn from(segments: Vec<Segment>) -> Self {
        let id = segments.iter().fold(String::new(), |mut id, s| {
            id.push('/');
            id.push_str(&s.to_string());
            id
        });
        ChannelId { id, segments }
    }
}

impl FromStr for ChannelId {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, ChannelError> {
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| ChannelError::InvalidChannel(s.into(), "must start with `/`"))?;
        if rest.is_empty() {
            return Err(ChannelError::InvalidChannel(s.into(), "is empty"));
        }
        let segments = rest
            .split('/')
            .map(Segment::parse)
            .collect::<Result<Vec<_>, ChannelError>>()
            .map_err(|e| match e {
                ChannelError::InvalidSegment(seg) if seg.is_empty() => {
                    ChannelError::InvalidChannel(s.into(), "contains an empty segment")
                }
                e => e,
            })?;
        if segments[..segments.len() - 1].iter().any(Segment::is_wildcard) {
            return Err(ChannelError::InvalidChannel(s.into(), "wildcard is only allowed as last segment"));
        }
        Ok(ChannelId { id: s.into(), segments })
    }
}

impl PartialEq for ChannelId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ChannelId {}

impl Hash for ChannelId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.id)
    }
}

impl AsRef<str> for ChannelId {
    fn as_ref(&self) -> &str {
        &self.id
    }
}

impl Serialize for ChannelId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.id)
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        ChannelId::from_str(&s).map_err(de::Error::custom)
    }
}

#[macro_export]
macro_rules! channel {
    ($s:expr) => {
        $s.parse::<$crate::channel::ChannelId>()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: Vec<ChannelId>) -> Vec<String> {
        v.into_iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_parse() {
        let c = channel!("/chat/room1").unwrap();
        assert_eq!(c.depth(), 2);
        assert_eq!(c.as_str(), "/chat/room1");
        assert_eq!(c.segments()[1], Segment::Literal("room1".into()));
        assert!(c.is_broadcast());
        assert!(!c.is_wildcard());

        assert!(channel!("/a/*").unwrap().is_wild());
        assert!(channel!("/a/**").unwrap().is_deep_wild());
        assert!(channel!("/**").unwrap().is_deep_wild());
        assert!(channel!("/meta/handshake").unwrap().is_meta());
        assert!(channel!("/service/echo").unwrap().is_service());
        assert_eq!(channel!("/meta/connect").unwrap().meta(), Some(MetaChannel::Connect));
        assert_eq!(channel!("/meta/other").unwrap().meta(), None);
    }

    #[test]
    fn test_invalid() {
        assert!(channel!("").is_err());
        assert!(channel!("/").is_err());
        assert!(channel!("chat").is_err());
        assert!(channel!("/chat/").is_err());
        assert!(channel!("/chat//room").is_err());
        assert!(channel!("/a/*/c").is_err());
        assert!(channel!("/a/**/c").is_err());
        assert!(channel!("/a/b*").is_err());
        assert!(channel!("/a/***").is_err());
    }

    #[test]
    fn test_wilds() {
        assert_eq!(
            ids(channel!("/a/b/c").unwrap().wilds()),
            vec!["/a/b/*", "/a/b/**", "/a/**", "/**"]
        );
        assert_eq!(ids(channel!("/a").unwrap().wilds()), vec!["/*", "/**"]);
        assert!(channel!("/a/*").unwrap().wilds().is_empty());
    }

    #[test]
    fn test_matches() {
        let c = channel!("/a/b/c").unwrap();
        for p in ["/a/b/c", "/a/b/*", "/a/b/**", "/a/**", "/**"] {
            assert!(channel!(p).unwrap().matches(&c), "{p} should match");
        }
        for p in ["/a/b/d", "/x/*", "/a/*", "/a/b/c/*", "/a/b/c/**", "/*"] {
            assert!(!channel!(p).unwrap().matches(&c), "{p} should not match");
        }
        assert!(channel!("/a/**").unwrap().matches_str("/a/b/c/d/e"));
        assert!(!channel!("/a/**").unwrap().matches_str("/a"));
        assert!(!channel!("/a/**").unwrap().matches_str("not a channel"));
        assert!(channel!("/a/*").unwrap().matches(&channel!("/a/*").unwrap()));
    }

    #[test]
    fn test_serde() {
        let c: ChannelId = serde_json::from_str("\"/chat/room1\"").unwrap();
        assert_eq!(c, channel!("/chat/room1").unwrap());
        assert_eq!(serde_json::to_string(&c).unwrap(), "\"/chat/room1\"");
        assert!(serde_json::from_str::<ChannelId>("\"chat\"").is_err());
    }
}
