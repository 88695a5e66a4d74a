#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Unknown topic kind {0:?}")]
    UnknownTopicKind(String),

    #[error("Invalid topic id {0:?}")]
    InvalidTopicId(String),

    #[error("Comment content is empty")]
    EmptyContent,

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),

    #[error("Broker error: {0}")]
    Broker(String),
}

impl Error {
    /// Whether this error is about a single frame or payload, and thus should only drop that
    /// frame rather than affect the connection
    pub fn is_per_frame(&self) -> bool {
        matches!(self, Error::MalformedFrame(_) | Error::MalformedPayload(_))
    }
}
