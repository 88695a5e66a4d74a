use std::pin::Pin;

use futures::{Sink, Stream};

use crate::Packet;

pub type LinkSink = Pin<Box<dyn Send + Sink<Packet, Error = anyhow::Error>>>;
pub type LinkStream = Pin<Box<dyn Send + Stream<Item = anyhow::Result<Packet>>>>;

/// One established duplex connection to the broker. The stream ending, or yielding an error, means
/// the connection is lost.
pub struct Link {
    pub sink: LinkSink,
    pub stream: LinkStream,
}

impl Link {
    pub fn new<W, R>(sink: W, stream: R) -> Link
    where
        W: 'static + Send + Sink<Packet, Error = anyhow::Error>,
        R: 'static + Send + Stream<Item = anyhow::Result<Packet>>,
    {
        Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Knows how to reach a broker endpoint. The real implementation speaks WebSocket, tests plug in
/// an in-memory broker.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> anyhow::Result<Link>;
}
