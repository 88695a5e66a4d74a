use std::{fmt, str::FromStr};

use crate::Error;

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    Post,
    Pod,
}

impl TopicKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::Post => "post",
            TopicKind::Pod => "pod",
        }
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TopicKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<TopicKind, Error> {
        match s {
            "post" | "posts" => Ok(TopicKind::Post),
            "pod" | "pods" => Ok(TopicKind::Pod),
            _ => Err(Error::UnknownTopicKind(String::from(s))),
        }
    }
}

/// Identifies one discussion: the comments of a post, or the chat of a pod
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
pub struct TopicRef {
    pub kind: TopicKind,
    pub id: String,
}

impl TopicRef {
    pub fn new(kind: TopicKind, id: impl Into<String>) -> TopicRef {
        TopicRef {
            kind,
            id: id.into(),
        }
    }

    pub fn post(id: impl Into<String>) -> TopicRef {
        TopicRef::new(TopicKind::Post, id)
    }

    pub fn pod(id: impl Into<String>) -> TopicRef {
        TopicRef::new(TopicKind::Pod, id)
    }

    // The id gets spliced into destinations and REST paths, so it must stay a single path segment
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.id)?;
        let forbidden = |c: char| matches!(c, '/' | ' ' | '\n' | '\r' | ':');
        if self.id.is_empty() || self.id.contains(forbidden) {
            return Err(Error::InvalidTopicId(self.id.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for TopicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for TopicRef {
    type Err = Error;

    /// Parses the `kind:id` form produced by `Display`
    fn from_str(s: &str) -> Result<TopicRef, Error> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidTopicId(String::from(s)))?;
        let topic = TopicRef::new(kind.parse()?, id);
        topic.validate()?;
        Ok(topic)
    }
}

/// A destination built as `prefix + topic id + suffix`
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Pattern {
    pub prefix: String,
    pub suffix: String,
}

impl Pattern {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Pattern {
        Pattern {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    pub fn render(&self, id: &str) -> String {
        format!("{}{}{}", self.prefix, id, self.suffix)
    }

    /// Recovers the topic id from a destination rendered by this pattern
    pub fn extract<'a>(&self, destination: &'a str) -> Option<&'a str> {
        let id = destination
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.suffix.as_str())?;
        (!id.is_empty()).then_some(id)
    }
}

/// The pair of destinations a topic channel talks to: the one it subscribes to, and the
/// companion one replies get published to
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DestinationTemplate {
    pub inbound: Pattern,
    pub outbound: Pattern,
}

impl DestinationTemplate {
    pub fn for_kind(kind: TopicKind) -> DestinationTemplate {
        match kind {
            TopicKind::Post => DestinationTemplate {
                inbound: Pattern::new("/topic/post/", "/comments"),
                outbound: Pattern::new("/app/post/", "/comment"),
            },
            TopicKind::Pod => DestinationTemplate {
                inbound: Pattern::new("/topic/pod/", "/messages"),
                outbound: Pattern::new("/app/pod/", "/message"),
            },
        }
    }

    pub fn inbound(&self, topic: &TopicRef) -> String {
        self.inbound.render(&topic.id)
    }

    pub fn outbound(&self, topic: &TopicRef) -> String {
        self.outbound.render(&topic.id)
    }
}

/// What the REST backend reports about a topic. Only the id matters to the synchronization
/// layer, the rest is passed through for whoever renders the page around the discussion.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TopicMetadata {
    pub id: crate::CommentId,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}
