use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use agora_api::{
    Command, CommentNode, Connector, DestinationTemplate, Frame, Incoming, Link, OutboundReply,
    Packet, TopicKind, TopicRef,
};
use anyhow::bail;
use futures::{channel::mpsc, SinkExt, StreamExt};
use parking_lot::Mutex;

/// In-memory STOMP broker. Comments sent to a topic's outbound destination are given an id and
/// fanned out to every subscriber of the topic's inbound destination, like the real backend does.
#[derive(Clone)]
pub struct MockBroker(Arc<Mutex<State>>);

struct State {
    templates: Vec<(TopicKind, DestinationTemplate)>,
    connections: HashMap<u64, Connection>,
    next_connection: u64,
    next_message: u64,
    next_comment: u64,
    refuse_connections: bool,
    heartbeat: (u64, u64),
    answer_heartbeats: bool,
    failing_destinations: HashSet<String>,
    connect_attempts: usize,
    received: Vec<Frame>,
}

struct Connection {
    outbox: mpsc::UnboundedSender<Packet>,
    // subscription id -> destination
    subscriptions: HashMap<String, String>,
}

impl State {
    fn reply(&mut self, conn: u64, packet: impl Into<Packet>) {
        if let Some(c) = self.connections.get(&conn) {
            if c.outbox.unbounded_send(packet.into()).is_err() {
                self.connections.remove(&conn);
            }
        }
    }

    fn publish(&mut self, destination: &str, body: &[u8]) -> usize {
        let mut delivered = 0;
        let next_message = &mut self.next_message;
        self.connections.retain(|_, c| {
            c.subscriptions
                .iter()
                .filter(|(_, d)| *d == destination)
                .all(|(sub, _)| {
                    *next_message += 1;
                    let frame = Frame::message(
                        sub,
                        destination,
                        &format!("m{next_message}"),
                        body.to_vec(),
                    );
                    let sent = c.outbox.unbounded_send(Packet::Frame(frame)).is_ok();
                    delivered += sent as usize;
                    sent
                })
        });
        delivered
    }

    fn on_subscribe(&mut self, conn: u64, frame: &Frame) {
        let receipt = frame.header("receipt");
        let (id, destination) = match (frame.header("id"), frame.header("destination")) {
            (Some(i), Some(d)) => (i, d),
            _ => {
                let error = Frame::error("SUBSCRIBE needs an id and a destination", receipt);
                return self.reply(conn, error);
            }
        };
        if self.failing_destinations.contains(destination) {
            let error = Frame::error(&format!("not allowed to subscribe to {destination}"), receipt);
            return self.reply(conn, error);
        }
        if let Some(c) = self.connections.get_mut(&conn) {
            c.subscriptions
                .insert(String::from(id), String::from(destination));
        }
        if let Some(r) = receipt {
            self.reply(conn, Frame::receipt(r));
        }
    }

    fn on_send(&mut self, conn: u64, frame: &Frame) {
        let destination = frame.header("destination").unwrap_or_default();
        let topic = self.templates.iter().find_map(|(kind, t)| {
            t.outbound
                .extract(destination)
                .map(|id| (TopicRef::new(*kind, id), t.clone()))
        });
        let (topic, template) = match topic {
            Some(t) => t,
            None => {
                tracing::debug!(%destination, "SEND to a destination nobody listens to");
                return;
            }
        };
        let reply = match serde_json::from_slice::<OutboundReply>(&frame.body) {
            Ok(r) => r,
            Err(e) => {
                let error = Frame::error(&format!("invalid reply: {e}"), frame.header("receipt"));
                return self.reply(conn, error);
            }
        };
        self.next_comment += 1;
        let comment = CommentNode::new(
            format!("c{}", self.next_comment),
            reply.author_name,
            reply.content,
            Some(chrono::Utc::now()),
        );
        let body = serde_json::to_vec(&Incoming::new(comment, reply.parent_id))
            .expect("serializing an incoming message");
        self.publish(&template.inbound(&topic), &body);
    }

    fn handle(&mut self, conn: u64, packet: Packet) {
        if !self.connections.contains_key(&conn) {
            return;
        }
        let frame = match packet {
            Packet::Heartbeat => {
                if self.answer_heartbeats {
                    self.reply(conn, Packet::Heartbeat);
                }
                return;
            }
            Packet::Frame(f) => f,
        };
        self.received.push(frame.clone());
        match frame.command {
            Command::Connect | Command::Stomp => {
                let heartbeat = self.heartbeat;
                self.reply(conn, Frame::connected(heartbeat));
            }
            Command::Subscribe => self.on_subscribe(conn, &frame),
            Command::Unsubscribe => {
                if let (Some(c), Some(id)) = (self.connections.get_mut(&conn), frame.header("id")) {
                    c.subscriptions.remove(id);
                }
            }
            Command::Send => self.on_send(conn, &frame),
            Command::Disconnect => {
                if let Some(r) = frame.header("receipt") {
                    self.reply(conn, Frame::receipt(r));
                }
                self.connections.remove(&conn);
            }
            other => {
                let error = Frame::error(&format!("unexpected {other} frame from client"), None);
                self.reply(conn, error);
            }
        }
    }
}

impl MockBroker {
    pub fn new() -> MockBroker {
        MockBroker(Arc::new(Mutex::new(State {
            templates: [TopicKind::Post, TopicKind::Pod]
                .into_iter()
                .map(|k| (k, DestinationTemplate::for_kind(k)))
                .collect(),
            connections: HashMap::new(),
            next_connection: 0,
            next_message: 0,
            next_comment: 0,
            refuse_connections: false,
            heartbeat: (0, 0),
            answer_heartbeats: true,
            failing_destinations: HashSet::new(),
            connect_attempts: 0,
            received: Vec::new(),
        })))
    }

    /// Pushes `msg` to every subscriber of `topic`, returns how many got it
    pub fn publish(&self, topic: &TopicRef, msg: &Incoming) -> usize {
        let destination = DestinationTemplate::for_kind(topic.kind).inbound(topic);
        let body = serde_json::to_vec(msg).expect("serializing an incoming message");
        self.publish_raw(&destination, &body)
    }

    pub fn publish_raw(&self, destination: &str, body: &[u8]) -> usize {
        self.0.lock().publish(destination, body)
    }

    /// Simulates a network failure on every open connection
    pub fn test_drop_connections(&self) {
        self.0.lock().connections.clear();
    }

    pub fn test_refuse_connections(&self, refuse: bool) {
        self.0.lock().refuse_connections = refuse;
    }

    pub fn test_fail_subscriptions_to(&self, destination: &str) {
        self.0
            .lock()
            .failing_destinations
            .insert(String::from(destination));
    }

    pub fn test_allow_subscriptions_to(&self, destination: &str) {
        self.0.lock().failing_destinations.remove(destination);
    }

    /// Heart-beat header sent in CONNECTED. The broker itself never sends heart-beats unprompted,
    /// it only answers the client's ones if `test_answer_heartbeats` is on.
    pub fn test_advertise_heartbeat(&self, heartbeat: (u64, u64)) {
        self.0.lock().heartbeat = heartbeat;
    }

    pub fn test_answer_heartbeats(&self, answer: bool) {
        self.0.lock().answer_heartbeats = answer;
    }

    pub fn test_connect_attempts(&self) -> usize {
        self.0.lock().connect_attempts
    }

    pub fn test_num_connections(&self) -> usize {
        self.0.lock().connections.len()
    }

    pub fn test_num_subscribers(&self, destination: &str) -> usize {
        self.0
            .lock()
            .connections
            .values()
            .flat_map(|c| c.subscriptions.values())
            .filter(|d| *d == destination)
            .count()
    }

    /// Frames of kind `command` received from clients so far
    pub fn test_received(&self, command: Command) -> Vec<Frame> {
        self.0
            .lock()
            .received
            .iter()
            .filter(|f| f.command == command)
            .cloned()
            .collect()
    }
}

impl Default for MockBroker {
    fn default() -> MockBroker {
        MockBroker::new()
    }
}

#[async_trait::async_trait]
impl Connector for MockBroker {
    async fn connect(&self, endpoint: &str) -> anyhow::Result<Link> {
        let (conn, outbox_rx) = {
            let mut state = self.0.lock();
            state.connect_attempts += 1;
            if state.refuse_connections {
                bail!("connection to {endpoint} refused");
            }
            state.next_connection += 1;
            let conn = state.next_connection;
            let (outbox, outbox_rx) = mpsc::unbounded();
            state.connections.insert(
                conn,
                Connection {
                    outbox,
                    subscriptions: HashMap::new(),
                },
            );
            (conn, outbox_rx)
        };

        let (inbox, mut inbox_rx) = mpsc::unbounded::<Packet>();
        let broker = self.clone();
        tokio::spawn(async move {
            while let Some(packet) = inbox_rx.next().await {
                broker.0.lock().handle(conn, packet);
            }
            broker.0.lock().connections.remove(&conn);
        });

        Ok(Link::new(
            inbox.sink_map_err(anyhow::Error::from),
            outbox_rx.map(Ok::<_, anyhow::Error>),
        ))
    }
}
