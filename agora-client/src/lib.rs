mod binding;
pub use binding::{BindingConfig, LocalEcho, TopicBinding, UpdateListener};

mod channel;
pub use channel::{ChannelHandler, ChannelState, TopicChannel};

mod rest;
pub use rest::RestClient;

mod session;
pub use session::{Session, SessionConfig, SessionListener};

mod tree;
pub use tree::{CommentTree, DuplicatePolicy, Placement, Row};

mod ws;
pub use ws::WsConnector;

#[cfg(test)]
mod tests;

pub mod api {
    pub use agora_api::*;
}
