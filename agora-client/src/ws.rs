use anyhow::Context;
use futures::{future, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::api::{Connector, Link, Packet};

/// Reaches the broker over a WebSocket, one STOMP frame per message
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

fn to_message(packet: Packet) -> Message {
    match String::from_utf8(packet.encode()) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}

fn from_message(msg: Message) -> Option<anyhow::Result<Packet>> {
    let packet = match msg {
        Message::Text(t) => Packet::decode(t.as_bytes()),
        Message::Binary(b) => Packet::decode(&b),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return None,
        Message::Close(reason) => {
            tracing::debug!(?reason, "broker sent websocket close");
            return None;
        }
    };
    Some(packet.map_err(anyhow::Error::from))
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> anyhow::Result<Link> {
        let (socket, _) = tokio_tungstenite::connect_async(endpoint)
            .await
            .with_context(|| format!("opening websocket to {endpoint}"))?;
        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(anyhow::Error::from)
            .with(|p: Packet| future::ready(Ok::<_, anyhow::Error>(to_message(p))));
        let stream = stream.filter_map(|msg| {
            future::ready(match msg {
                Ok(msg) => from_message(msg),
                Err(e) => Some(Err(anyhow::Error::from(e))),
            })
        });
        Ok(Link::new(sink, stream))
    }
}
