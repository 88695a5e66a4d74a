use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Context};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    api::{Command, Connector, Error, Frame, Incoming, Link, LinkSink, LinkStream, Packet, TopicRef},
    ChannelHandler, ChannelState,
};

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Broker endpoint, eg. `ws://localhost:8080/ws`
    pub endpoint: String,

    /// Value of the STOMP `host` header
    pub host_header: String,

    pub login: Option<(String, String)>,

    /// Fixed wait between two connection attempts. There is no backoff and no cap.
    pub reconnect_delay: Duration,

    /// How long to wait for CONNECTED after sending CONNECT
    pub connect_timeout: Duration,

    /// Zero disables heart-beats in both directions
    pub heartbeat_interval: Duration,

    /// The connection is considered lost after this long without any inbound traffic
    pub heartbeat_timeout: Duration,
}

impl SessionConfig {
    pub fn new(endpoint: impl Into<String>) -> SessionConfig {
        SessionConfig {
            endpoint: endpoint.into(),
            ..SessionConfig::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            endpoint: String::from("ws://localhost:8080/ws"),
            host_header: String::from("localhost"),
            login: None,
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(20),
        }
    }
}

/// Lifecycle callbacks, called from the session driver
pub trait SessionListener: 'static + Send + Sync {
    fn on_connect(&self) {}

    fn on_disconnect(&self) {}

    /// Failed connection attempts and broker errors not tied to a subscription. The session
    /// keeps retrying on its own.
    fn on_error(&self, _err: &anyhow::Error) {}
}

impl SessionListener for () {}

pub(crate) struct Subscription {
    pub id: String,
    pub topic: TopicRef,
    pub destination: String,
    pub handler: Box<dyn ChannelHandler>,
    pub state: watch::Sender<ChannelState>,
}

pub(crate) enum Request {
    Subscribe(Subscription),
    Unsubscribe { id: String },
    Publish { destination: String, body: Vec<u8> },
    Close,
}

pub(crate) struct Shared {
    requests: mpsc::UnboundedSender<Request>,
    connected: watch::Sender<bool>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl Shared {
    pub fn request(&self, req: Request) {
        if self.requests.send(req).is_err() {
            tracing::debug!("session driver is gone, dropping request");
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn next_subscription_id(&self) -> String {
        format!("sub-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

enum DriverSlot {
    Idle(Driver),
    Running(JoinHandle<()>),
    Closed,
}

/// The one connection to the broker, shared by every topic channel of the process.
///
/// Only the owner of the session opens and closes it. Channels register with it and follow its
/// connection state: they are resubscribed each time it (re)connects.
pub struct Session {
    shared: Arc<Shared>,
    driver: Mutex<DriverSlot>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        connector: impl Connector + 'static,
        listener: impl SessionListener,
    ) -> Session {
        let (requests, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            requests,
            connected: watch::channel(false).0,
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        });
        let driver = Driver {
            config,
            connector: Arc::new(connector),
            listener: Arc::new(listener),
            shared: shared.clone(),
            requests: receiver,
            subscriptions: BTreeMap::new(),
        };
        Session {
            shared,
            driver: Mutex::new(DriverSlot::Idle(driver)),
        }
    }

    /// Starts connecting in the background. Errors are reported to the listener, never returned.
    ///
    /// Must be called from within a tokio runtime. Opening an open session does nothing, and a
    /// closed session cannot be reopened.
    pub fn open(&self) {
        let mut slot = self.driver.lock();
        *slot = match std::mem::replace(&mut *slot, DriverSlot::Closed) {
            DriverSlot::Idle(driver) => {
                tracing::debug!(endpoint = %driver.config.endpoint, "opening session");
                DriverSlot::Running(tokio::spawn(driver.run()))
            }
            DriverSlot::Running(handle) => DriverSlot::Running(handle),
            DriverSlot::Closed => {
                tracing::warn!("attempted to reopen a closed session");
                DriverSlot::Closed
            }
        };
    }

    /// Disconnects and stops reconnecting. Idempotent.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.driver.lock(), DriverSlot::Closed);
        self.shared.closed.store(true, Ordering::Release);
        match previous {
            DriverSlot::Idle(mut driver) => driver.shut_down(),
            DriverSlot::Running(_) => self.shared.request(Request::Close),
            DriverSlot::Closed => return,
        }
        self.shared.connected.send_replace(false);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Returns `true` once connected, or `false` if the session gets closed first
    pub async fn wait_connected(&self) -> bool {
        let mut connected = self.shared.connected.subscribe();
        loop {
            if *connected.borrow_and_update() {
                return true;
            }
            if self.is_closed() || connected.changed().await.is_err() {
                return false;
            }
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Flow {
    Continue,
    Close,
}

/// Heart-beat periods agreed on with the broker, `None` meaning disabled
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Heartbeat {
    send_every: Option<Duration>,
    expect_within: Option<Duration>,
}

impl Heartbeat {
    fn negotiate(config: &SessionConfig, connected: Option<&str>) -> Heartbeat {
        let ours = config.heartbeat_interval.as_millis() as u64;
        let (broker_sends, broker_wants) = connected.and_then(parse_pair).unwrap_or((0, 0));
        Heartbeat {
            send_every: (ours > 0 && broker_wants > 0)
                .then(|| Duration::from_millis(ours.max(broker_wants))),
            expect_within: (ours > 0 && broker_sends > 0).then(|| {
                config
                    .heartbeat_timeout
                    .max(Duration::from_millis(ours.max(broker_sends)))
            }),
        }
    }
}

fn parse_pair(s: &str) -> Option<(u64, u64)> {
    let (a, b) = s.split_once(',')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => futures::future::pending().await,
    }
}

async fn send_frame(sink: &mut LinkSink, frame: Frame) -> anyhow::Result<()> {
    let command = frame.command;
    sink.send(Packet::Frame(frame))
        .await
        .with_context(|| format!("sending {command} frame"))
}

async fn next_frame(stream: &mut LinkStream) -> anyhow::Result<Frame> {
    loop {
        match stream.next().await {
            None => bail!("broker closed the connection"),
            Some(Ok(Packet::Heartbeat)) => continue,
            Some(Ok(Packet::Frame(f))) => return Ok(f),
            Some(Err(e)) => return Err(e),
        }
    }
}

fn is_per_frame(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Error>()
        .map_or(false, |e| e.is_per_frame())
}

async fn handshake(
    connector: Arc<dyn Connector>,
    config: SessionConfig,
) -> anyhow::Result<(Link, Heartbeat)> {
    let mut link = connector
        .connect(&config.endpoint)
        .await
        .with_context(|| format!("connecting to {}", config.endpoint))?;
    let beat = config.heartbeat_interval.as_millis() as u64;
    let login = config
        .login
        .as_ref()
        .map(|(l, p)| (l.as_str(), p.as_str()));
    send_frame(
        &mut link.sink,
        Frame::connect(&config.host_header, (beat, beat), login),
    )
    .await?;
    let frame = tokio::time::timeout(config.connect_timeout, next_frame(&mut link.stream))
        .await
        .context("timed out waiting for CONNECTED")??;
    match frame.command {
        Command::Connected => {
            let heartbeat = Heartbeat::negotiate(&config, frame.header("heart-beat"));
            Ok((link, heartbeat))
        }
        Command::Error => Err(anyhow!(Error::Broker(
            frame
                .header("message")
                .unwrap_or("connection refused")
                .to_string()
        ))),
        other => bail!("expected CONNECTED frame, got {other}"),
    }
}

struct Driver {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    listener: Arc<dyn SessionListener>,
    shared: Arc<Shared>,
    requests: mpsc::UnboundedReceiver<Request>,
    subscriptions: BTreeMap<String, Subscription>,
}

impl Driver {
    async fn run(mut self) {
        let mut first_attempt = true;
        'reconnect: loop {
            match first_attempt {
                true => first_attempt = false,
                false => {
                    if self.idle(self.config.reconnect_delay).await == Flow::Close {
                        break 'reconnect;
                    }
                }
            }

            let (mut link, heartbeat) = match self.connect().await {
                Ok(Some(connected)) => connected,
                Ok(None) => break 'reconnect,
                Err(err) => {
                    tracing::warn!(?err, endpoint = %self.config.endpoint, "failed connecting to broker");
                    self.listener.on_error(&err);
                    continue 'reconnect;
                }
            };
            tracing::info!(endpoint = %self.config.endpoint, ?heartbeat, "connected to broker");

            match self.serve(&mut link, heartbeat).await {
                Ok(()) => {
                    tracing::info!("disconnected from broker");
                    break 'reconnect;
                }
                Err(err) => {
                    tracing::warn!(?err, "lost broker connection");
                    self.went_offline();
                    self.listener.on_disconnect();
                }
            }
        }
        self.shut_down();
    }

    /// Waits out `delay` while keeping the registry up to date
    async fn idle(&mut self, delay: Duration) -> Flow {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Flow::Continue,
                req = self.requests.recv() => {
                    if self.handle_offline(req) == Flow::Close {
                        return Flow::Close;
                    }
                }
            }
        }
    }

    /// `Ok(None)` if the session was closed while connecting
    async fn connect(&mut self) -> anyhow::Result<Option<(Link, Heartbeat)>> {
        let handshake = handshake(self.connector.clone(), self.config.clone());
        tokio::pin!(handshake);
        loop {
            tokio::select! {
                res = &mut handshake => return res.map(Some),
                req = self.requests.recv() => {
                    if self.handle_offline(req) == Flow::Close {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Returns `Ok` when closed on request, `Err` when the connection is lost
    async fn serve(&mut self, link: &mut Link, heartbeat: Heartbeat) -> anyhow::Result<()> {
        self.shared.connected.send_replace(true);
        self.listener.on_connect();
        let resubscribe = self
            .subscriptions
            .values()
            .map(|sub| {
                sub.state.send_replace(ChannelState::Pending);
                Frame::subscribe(&sub.id, &sub.destination, &sub.id)
            })
            .collect::<Vec<_>>();
        for frame in resubscribe {
            send_frame(&mut link.sink, frame).await?;
        }

        let mut next_beat = heartbeat.send_every.map(|d| Instant::now() + d);
        let mut last_seen = Instant::now();
        loop {
            let deadline = heartbeat.expect_within.map(|d| last_seen + d);
            tokio::select! {
                req = self.requests.recv() => {
                    if self.handle_online(req, &mut link.sink).await? == Flow::Close {
                        self.shared.connected.send_replace(false);
                        if let Err(err) = send_frame(&mut link.sink, Frame::disconnect()).await {
                            tracing::debug!(?err, "failed saying goodbye to broker");
                        }
                        if let Err(err) = link.sink.close().await {
                            tracing::debug!(?err, "failed closing broker connection");
                        }
                        return Ok(());
                    }
                }
                _ = sleep_until(next_beat) => {
                    link.sink.send(Packet::Heartbeat).await.context("sending heart-beat")?;
                    next_beat = heartbeat.send_every.map(|d| Instant::now() + d);
                }
                _ = sleep_until(deadline) => {
                    bail!("nothing received from broker for {:?}", heartbeat.expect_within);
                }
                packet = link.stream.next() => {
                    match packet {
                        None => bail!("broker closed the connection"),
                        Some(Err(err)) if is_per_frame(&err) => {
                            tracing::warn!(?err, "dropping undecodable frame");
                        }
                        Some(Err(err)) => return Err(err),
                        Some(Ok(packet)) => self.on_packet(packet),
                    }
                    last_seen = Instant::now();
                }
            }
        }
    }

    fn on_packet(&mut self, packet: Packet) {
        let frame = match packet {
            Packet::Heartbeat => return,
            Packet::Frame(f) => f,
        };
        match frame.command {
            Command::Message => self.on_message(frame),
            Command::Receipt => {
                if let Some(sub) = frame
                    .header("receipt-id")
                    .and_then(|r| self.subscriptions.get(r))
                {
                    tracing::debug!(topic = %sub.topic, "subscription confirmed");
                    sub.state.send_replace(ChannelState::Active);
                }
            }
            Command::Error => {
                let reason = frame
                    .header("message")
                    .unwrap_or("unspecified broker error")
                    .to_string();
                match frame
                    .header("receipt-id")
                    .and_then(|r| self.subscriptions.get_mut(r))
                {
                    Some(sub) => {
                        tracing::warn!(topic = %sub.topic, %reason, "broker refused subscription");
                        sub.state.send_replace(ChannelState::Failed(reason.clone()));
                        sub.handler.on_error(&Error::Broker(reason));
                    }
                    None => {
                        tracing::warn!(%reason, "broker reported an error");
                        self.listener.on_error(&anyhow!(Error::Broker(reason)));
                    }
                }
            }
            other => tracing::debug!(command = %other, "ignoring unexpected frame"),
        }
    }

    fn on_message(&mut self, frame: Frame) {
        let sub = match frame
            .header("subscription")
            .and_then(|id| self.subscriptions.get_mut(id))
        {
            Some(sub) => sub,
            None => {
                tracing::debug!(
                    subscription = ?frame.header("subscription"),
                    "dropping message for unknown subscription"
                );
                return;
            }
        };
        match Incoming::parse(&frame.body) {
            Ok(msg) => sub.handler.on_message(msg),
            Err(err) => tracing::warn!(topic = %sub.topic, ?err, "dropping malformed message"),
        }
    }

    /// Adds `sub`, replacing any subscription to the same destination for the same topic.
    /// Returns the ids of the replaced subscriptions.
    fn register(&mut self, sub: Subscription) -> Vec<String> {
        let replaced = self
            .subscriptions
            .values()
            .filter(|s| s.topic == sub.topic && s.destination == sub.destination)
            .map(|s| s.id.clone())
            .collect::<Vec<_>>();
        for id in &replaced {
            tracing::debug!(topic = %sub.topic, subscription = %id, "replacing subscription");
            self.forget(id);
        }
        self.subscriptions.insert(sub.id.clone(), sub);
        replaced
    }

    fn forget(&mut self, id: &str) -> bool {
        match self.subscriptions.remove(id) {
            Some(sub) => {
                sub.state.send_replace(ChannelState::Closed);
                true
            }
            None => false,
        }
    }

    fn handle_offline(&mut self, req: Option<Request>) -> Flow {
        match req {
            None | Some(Request::Close) => return Flow::Close,
            Some(Request::Subscribe(sub)) => {
                self.register(sub);
            }
            Some(Request::Unsubscribe { id }) => {
                self.forget(&id);
            }
            Some(Request::Publish { destination, .. }) => {
                tracing::debug!(%destination, "not connected, dropping outbound message");
            }
        }
        Flow::Continue
    }

    async fn handle_online(
        &mut self,
        req: Option<Request>,
        sink: &mut LinkSink,
    ) -> anyhow::Result<Flow> {
        match req {
            None | Some(Request::Close) => return Ok(Flow::Close),
            Some(Request::Subscribe(sub)) => {
                let subscribe = Frame::subscribe(&sub.id, &sub.destination, &sub.id);
                for old in self.register(sub) {
                    send_frame(sink, Frame::unsubscribe(&old)).await?;
                }
                send_frame(sink, subscribe).await?;
            }
            Some(Request::Unsubscribe { id }) => {
                if self.forget(&id) {
                    send_frame(sink, Frame::unsubscribe(&id)).await?;
                }
            }
            Some(Request::Publish { destination, body }) => {
                send_frame(sink, Frame::send(&destination, body)).await?;
            }
        }
        Ok(Flow::Continue)
    }

    fn went_offline(&mut self) {
        self.shared.connected.send_replace(false);
        for sub in self.subscriptions.values() {
            sub.state.send_replace(ChannelState::Pending);
        }
    }

    fn shut_down(&mut self) {
        self.shared.connected.send_replace(false);
        self.requests.close();
        while let Ok(req) = self.requests.try_recv() {
            if let Request::Subscribe(sub) = req {
                sub.state.send_replace(ChannelState::Closed);
            }
        }
        for (_, sub) in std::mem::take(&mut self.subscriptions) {
            sub.state.send_replace(ChannelState::Closed);
        }
    }
}
