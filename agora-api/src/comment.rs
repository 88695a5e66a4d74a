use std::fmt;

use chrono::{NaiveDateTime, TimeZone, Utc};

use crate::{Error, Time};

/// Backend-assigned identifier of a comment, unique within its topic
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Serialize)]
#[serde(transparent)]
pub struct CommentId(pub String);

impl CommentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommentId {
    fn from(s: &str) -> CommentId {
        CommentId(String::from(s))
    }
}

impl From<String> for CommentId {
    fn from(s: String) -> CommentId {
        CommentId(s)
    }
}

// Backends disagree on whether ids are numbers or strings, accept both
impl<'de> serde::Deserialize<'de> for CommentId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<CommentId, D::Error> {
        use serde::Deserialize;

        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Signed(i64),
            Unsigned(u64),
        }
        Ok(CommentId(match RawId::deserialize(d)? {
            RawId::Text(s) => s,
            RawId::Signed(n) => n.to_string(),
            RawId::Unsigned(n) => n.to_string(),
        }))
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentNode {
    pub id: CommentId,

    #[serde(default)]
    pub author_name: String,

    #[serde(default)]
    pub content: String,

    /// Only used to order siblings for display, never to place a node in the tree
    #[serde(default, deserialize_with = "lenient_time")]
    pub created_at: Option<Time>,

    /// Replies in insertion order
    #[serde(default)]
    pub replies: Vec<CommentNode>,
}

impl CommentNode {
    pub fn new(
        id: impl Into<CommentId>,
        author_name: impl Into<String>,
        content: impl Into<String>,
        created_at: Option<Time>,
    ) -> CommentNode {
        CommentNode {
            id: id.into(),
            author_name: author_name.into(),
            content: content.into(),
            created_at,
            replies: Vec::new(),
        }
    }

    /// Total number of nodes in this subtree, including self
    pub fn subtree_len(&self) -> usize {
        1 + self.replies.iter().map(|r| r.subtree_len()).sum::<usize>()
    }

    // See comments on other `validate` functions throughout agora-api
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(self.id.as_str())?;
        crate::validate_string(&self.author_name)?;
        crate::validate_string(&self.content)?;
        self.replies.iter().try_for_each(|r| r.validate())
    }
}

// Replies are unlinked one level at a time, so dropping a long reply chain never recurses
impl Drop for CommentNode {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.replies);
        while let Some(mut n) = pending.pop() {
            pending.append(&mut n.replies);
        }
    }
}

/// Accepts RFC 3339 timestamps, offset-less ISO timestamps (taken as UTC) and epoch
/// milliseconds. Anything else is treated as missing rather than failing the whole node.
fn lenient_time<'de, D>(d: D) -> Result<Option<Time>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum RawTime {
        Text(String),
        Millis(i64),
    }
    let raw: Option<RawTime> = serde::Deserialize::deserialize(d)?;
    Ok(match raw {
        None => None,
        Some(RawTime::Millis(ms)) => Utc.timestamp_millis_opt(ms).single(),
        Some(RawTime::Text(s)) => chrono::DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|t| Utc.from_utc_datetime(&t))
            }),
    })
}
