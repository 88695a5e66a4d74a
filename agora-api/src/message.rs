use serde_json::Value;

use crate::{CommentId, CommentNode, Error};

/// One comment pushed by the broker, along with where it goes in the tree
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Incoming {
    pub comment: CommentNode,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CommentId>,
}

impl Incoming {
    pub fn new(comment: CommentNode, parent_id: Option<CommentId>) -> Incoming {
        Incoming { comment, parent_id }
    }

    pub fn parse(body: &[u8]) -> Result<Incoming, Error> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| Error::MalformedPayload(format!("body is not json: {e}")))?;
        Incoming::from_value(value)
    }

    /// The comment is carried in `comment`, or in `message` for pod chats; if neither is there the
    /// whole object is the comment. A `parentId` on the carrier itself is used when the envelope
    /// has no `parentId` key at all.
    pub fn from_value(value: Value) -> Result<Incoming, Error> {
        let mut envelope = match value {
            Value::Object(map) => map,
            other => {
                return Err(Error::MalformedPayload(format!(
                    "expected a json object, got {other}"
                )))
            }
        };
        let envelope_parent = envelope.remove("parentId");
        let carrier = match (envelope.remove("comment"), envelope.remove("message")) {
            (Some(c), _) if !c.is_null() => c,
            (_, Some(m)) if !m.is_null() => m,
            _ => Value::Object(envelope),
        };
        let carrier_parent = carrier.get("parentId").cloned();
        let comment: CommentNode = serde_json::from_value(carrier)
            .map_err(|e| Error::MalformedPayload(format!("invalid comment: {e}")))?;
        // an explicit null on the envelope means top-level, whatever the carrier says
        let parent_id = envelope_parent
            .or(carrier_parent)
            .filter(|p| !p.is_null())
            .map(serde_json::from_value::<CommentId>)
        .transpose()
        .map_err(|e| Error::MalformedPayload(format!("invalid parentId: {e}")))?;
        comment
            .validate()
            .map_err(|e| Error::MalformedPayload(e.to_string()))?;
        Ok(Incoming { comment, parent_id })
    }
}

/// A comment composed locally, as published to the broker
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundReply {
    pub content: String,

    /// `None` for a top-level comment
    pub parent_id: Option<CommentId>,

    pub author_name: String,
}

impl OutboundReply {
    pub fn top_level(author_name: impl Into<String>, content: impl Into<String>) -> OutboundReply {
        OutboundReply {
            content: content.into(),
            parent_id: None,
            author_name: author_name.into(),
        }
    }

    pub fn reply_to(
        parent_id: impl Into<CommentId>,
        author_name: impl Into<String>,
        content: impl Into<String>,
    ) -> OutboundReply {
        OutboundReply {
            content: content.into(),
            parent_id: Some(parent_id.into()),
            author_name: author_name.into(),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.content)?;
        crate::validate_string(&self.author_name)?;
        if let Some(p) = &self.parent_id {
            crate::validate_string(p.as_str())?;
        }
        if self.content.trim().is_empty() {
            return Err(Error::EmptyContent);
        }
        Ok(())
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializing an outbound reply")
    }
}
