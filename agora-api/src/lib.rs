use chrono::Utc;

mod comment;
pub use comment::{CommentId, CommentNode};

mod error;
pub use error::Error;

mod frame;
pub use frame::{Command, Frame, Packet};

mod message;
pub use message::{Incoming, OutboundReply};

mod topic;
pub use topic::{DestinationTemplate, Pattern, TopicKind, TopicMetadata, TopicRef};

mod transport;
pub use transport::{Connector, Link, LinkSink, LinkStream};

pub use uuid::{uuid, Uuid};
pub type Time = chrono::DateTime<Utc>;

// Strings that end up in STOMP frames or in the rendered tree must not carry null bytes: the frame
// codec uses them as terminators.
pub fn validate_string(s: &str) -> Result<(), Error> {
    match s.contains('\0') {
        true => Err(Error::NullByteInString(String::from(s))),
        false => Ok(()),
    }
}
