use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::watch;

use crate::{
    api::{DestinationTemplate, Error, Incoming, OutboundReply, TopicRef},
    session::{Request, Session, Shared, Subscription},
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChannelState {
    /// Subscription requested, not yet confirmed by the broker for the current connection
    Pending,
    Active,
    /// The broker refused the subscription, retried on the next connection
    Failed(String),
    Closed,
}

/// Receives what arrives on one topic. Runs on the session driver: handlers must not block.
pub trait ChannelHandler: 'static + Send {
    fn on_message(&mut self, msg: Incoming);

    fn on_error(&mut self, err: &Error) {
        tracing::warn!(?err, "topic subscription failed");
    }
}

impl<F> ChannelHandler for F
where
    F: 'static + Send + FnMut(Incoming),
{
    fn on_message(&mut self, msg: Incoming) {
        self(msg)
    }
}

/// A subscription to one topic on the shared session, plus the ability to publish to it.
///
/// Closing a channel never touches the session itself. Dropping it closes it.
pub struct TopicChannel {
    id: String,
    topic: TopicRef,
    outbound: String,
    shared: Arc<Shared>,
    state: watch::Receiver<ChannelState>,
    closed: AtomicBool,
}

impl TopicChannel {
    /// Registers the subscription with the session. It is sent to the broker now if the session
    /// is connected, and again on every later connection.
    pub fn open(
        session: &Session,
        topic: TopicRef,
        template: &DestinationTemplate,
        handler: impl ChannelHandler,
    ) -> Result<TopicChannel, Error> {
        topic.validate()?;
        let shared = session.shared().clone();
        let id = shared.next_subscription_id();
        let (state_tx, state) = watch::channel(ChannelState::Pending);
        let destination = template.inbound(&topic);
        tracing::debug!(%topic, %destination, subscription = %id, "opening topic channel");
        shared.request(Request::Subscribe(Subscription {
            id: id.clone(),
            topic: topic.clone(),
            destination,
            handler: Box::new(handler),
            state: state_tx,
        }));
        Ok(TopicChannel {
            id,
            outbound: template.outbound(&topic),
            topic,
            shared,
            state,
            closed: AtomicBool::new(false),
        })
    }

    pub fn topic(&self) -> &TopicRef {
        &self.topic
    }

    pub fn subscription_id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    /// Waits until the subscription leaves `Pending`, and returns the state it settled in
    pub async fn wait_active(&self) -> ChannelState {
        let mut state = self.state.clone();
        loop {
            let current = state.borrow_and_update().clone();
            if current != ChannelState::Pending {
                return current;
            }
            if state.changed().await.is_err() {
                return ChannelState::Closed;
            }
        }
    }

    /// Publishes `reply` to the topic. Does nothing while the session is disconnected or after
    /// the channel was closed: nothing is queued for later.
    pub fn send(&self, reply: &OutboundReply) -> Result<(), Error> {
        self.publish(reply).map(|_| ())
    }

    // Returns whether `reply` was actually handed to the session
    pub(crate) fn publish(&self, reply: &OutboundReply) -> Result<bool, Error> {
        reply.validate()?;
        if self.closed.load(Ordering::Acquire) {
            tracing::debug!(topic = %self.topic, "channel is closed, not sending");
            return Ok(false);
        }
        if !self.shared.is_connected() {
            tracing::debug!(topic = %self.topic, "session is not connected, not sending");
            return Ok(false);
        }
        self.shared.request(Request::Publish {
            destination: self.outbound.clone(),
            body: reply.to_json(),
        });
        Ok(true)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(topic = %self.topic, subscription = %self.id, "closing topic channel");
            self.shared.request(Request::Unsubscribe {
                id: self.id.clone(),
            });
        }
    }
}

impl Drop for TopicChannel {
    fn drop(&mut self) {
        self.close();
    }
}
