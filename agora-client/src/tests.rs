use std::{sync::Arc, time::Duration};

use agora_mock_broker::MockBroker;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{
    api::{
        Command, CommentNode, DestinationTemplate, Error, Incoming, OutboundReply, TopicKind,
        TopicRef,
    },
    BindingConfig, ChannelHandler, ChannelState, LocalEcho, Session, SessionConfig,
    SessionListener, TopicBinding, TopicChannel,
};

fn init_tracing() {
    if std::env::var_os("RUST_LOG").is_some() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        endpoint: String::from("mock://broker"),
        reconnect_delay: Duration::from_millis(20),
        connect_timeout: Duration::from_secs(1),
        heartbeat_interval: Duration::ZERO,
        ..SessionConfig::default()
    }
}

fn open_session(broker: &MockBroker, listener: impl SessionListener) -> Arc<Session> {
    init_tracing();
    let session = Arc::new(Session::new(fast_config(), broker.clone(), listener));
    session.open();
    session
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn post_template() -> DestinationTemplate {
    DestinationTemplate::for_kind(TopicKind::Post)
}

fn comment(id: &str, content: &str) -> CommentNode {
    CommentNode::new(id, "someone", content, None)
}

#[derive(Clone, Default)]
struct Lifecycle(Arc<Mutex<Vec<&'static str>>>);

impl Lifecycle {
    fn count(&self, event: &str) -> usize {
        self.0.lock().iter().filter(|e| **e == event).count()
    }
}

impl SessionListener for Lifecycle {
    fn on_connect(&self) {
        self.0.lock().push("connect");
    }

    fn on_disconnect(&self) {
        self.0.lock().push("disconnect");
    }

    fn on_error(&self, _err: &anyhow::Error) {
        self.0.lock().push("error");
    }
}

#[derive(Clone, Default)]
struct Recorder {
    messages: Arc<Mutex<Vec<Incoming>>>,
    errors: Arc<Mutex<Vec<Error>>>,
}

impl ChannelHandler for Recorder {
    fn on_message(&mut self, msg: Incoming) {
        self.messages.lock().push(msg);
    }

    fn on_error(&mut self, err: &Error) {
        self.errors.lock().push(err.clone());
    }
}

fn new_binding(
    session: &Arc<Session>,
    config: BindingConfig,
) -> (TopicBinding, Arc<Mutex<Vec<TopicRef>>>) {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let binding = TopicBinding::new(session.clone(), config, {
        let updates = updates.clone();
        move |topic: &TopicRef, _: &crate::CommentTree| updates.lock().push(topic.clone())
    });
    (binding, updates)
}

#[tokio::test]
async fn channel_receives_published_messages() {
    let broker = MockBroker::new();
    let session = open_session(&broker, ());
    let topic = TopicRef::post("1");
    let recorder = Recorder::default();
    let channel =
        TopicChannel::open(&session, topic.clone(), &post_template(), recorder.clone()).unwrap();
    assert_eq!(channel.wait_active().await, ChannelState::Active);
    assert!(session.is_connected());

    let delivered = broker.publish(&topic, &Incoming::new(comment("c1", "hi"), None));
    assert_eq!(delivered, 1);
    eventually("message", || recorder.messages.lock().len() == 1).await;
    assert_eq!(recorder.messages.lock()[0].comment.id.as_str(), "c1");
    assert!(recorder.errors.lock().is_empty());
}

#[tokio::test]
async fn send_while_disconnected_is_a_noop() {
    init_tracing();
    let broker = MockBroker::new();
    let session = Session::new(fast_config(), broker.clone(), ());
    let channel =
        TopicChannel::open(&session, TopicRef::post("1"), &post_template(), |_: Incoming| ())
            .unwrap();
    assert_eq!(channel.send(&OutboundReply::top_level("A", "hello")), Ok(()));

    session.open();
    assert!(session.wait_connected().await);
    assert_eq!(channel.wait_active().await, ChannelState::Active);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(broker.test_received(Command::Send).is_empty());
    assert_eq!(broker.test_connect_attempts(), 1);
}

#[tokio::test]
async fn invalid_replies_are_rejected_before_sending() {
    let broker = MockBroker::new();
    let session = open_session(&broker, ());
    let channel =
        TopicChannel::open(&session, TopicRef::post("1"), &post_template(), |_: Incoming| ())
            .unwrap();
    channel.wait_active().await;
    assert_eq!(
        channel.send(&OutboundReply::top_level("A", "   ")),
        Err(Error::EmptyContent)
    );
    let invalid = TopicRef::post("a/b");
    assert!(TopicChannel::open(&session, invalid, &post_template(), |_: Incoming| ()).is_err());
}

#[tokio::test]
async fn refused_connections_are_retried() {
    let broker = MockBroker::new();
    broker.test_refuse_connections(true);
    let lifecycle = Lifecycle::default();
    let session = open_session(&broker, lifecycle.clone());

    eventually("a few attempts", || broker.test_connect_attempts() >= 3).await;
    assert!(lifecycle.count("error") >= 2);
    assert_eq!(lifecycle.count("connect"), 0);
    assert!(!session.is_connected());

    broker.test_refuse_connections(false);
    assert!(session.wait_connected().await);
    assert_eq!(lifecycle.count("connect"), 1);
}

#[tokio::test]
async fn session_reconnects_and_resubscribes() {
    let broker = MockBroker::new();
    let lifecycle = Lifecycle::default();
    let session = open_session(&broker, lifecycle.clone());
    let topic = TopicRef::post("1");
    let recorder = Recorder::default();
    let channel =
        TopicChannel::open(&session, topic.clone(), &post_template(), recorder.clone()).unwrap();
    assert_eq!(channel.wait_active().await, ChannelState::Active);

    broker.test_drop_connections();
    eventually("disconnect", || lifecycle.count("disconnect") == 1).await;
    eventually("reconnect", || lifecycle.count("connect") == 2).await;
    assert_eq!(channel.wait_active().await, ChannelState::Active);
    assert_eq!(broker.test_num_subscribers("/topic/post/1/comments"), 1);

    broker.publish(&topic, &Incoming::new(comment("c9", "after"), None));
    eventually("message after reconnect", || {
        recorder.messages.lock().len() == 1
    })
    .await;
    assert!(session.is_connected());
}

#[tokio::test]
async fn subscription_failure_is_isolated() {
    let broker = MockBroker::new();
    broker.test_fail_subscriptions_to("/topic/post/bad/comments");
    let session = open_session(&broker, ());
    let bad_recorder = Recorder::default();
    let bad = TopicChannel::open(
        &session,
        TopicRef::post("bad"),
        &post_template(),
        bad_recorder.clone(),
    )
    .unwrap();
    let good =
        TopicChannel::open(&session, TopicRef::post("good"), &post_template(), |_: Incoming| ())
            .unwrap();

    assert!(matches!(bad.wait_active().await, ChannelState::Failed(_)));
    assert_eq!(good.wait_active().await, ChannelState::Active);
    assert!(session.is_connected());
    assert!(matches!(&bad_recorder.errors.lock()[..], [Error::Broker(_)]));

    // retried on the next connection
    broker.test_allow_subscriptions_to("/topic/post/bad/comments");
    broker.test_drop_connections();
    eventually("resubscription", || bad.state() == ChannelState::Active).await;
    assert_eq!(good.wait_active().await, ChannelState::Active);
}

#[tokio::test]
async fn channel_close_unsubscribes_without_touching_session() {
    let broker = MockBroker::new();
    let session = open_session(&broker, ());
    let pod_template = DestinationTemplate::for_kind(TopicKind::Pod);
    let channel =
        TopicChannel::open(&session, TopicRef::pod("7"), &pod_template, |_: Incoming| ()).unwrap();
    channel.wait_active().await;
    assert_eq!(broker.test_num_subscribers("/topic/pod/7/messages"), 1);

    channel.close();
    channel.close();
    eventually("unsubscribe", || {
        broker.test_num_subscribers("/topic/pod/7/messages") == 0
    })
    .await;
    assert_eq!(channel.wait_active().await, ChannelState::Closed);
    assert_eq!(broker.test_received(Command::Unsubscribe).len(), 1);
    assert!(session.is_connected());
    assert_eq!(channel.send(&OutboundReply::top_level("A", "late")), Ok(()));
}

#[tokio::test]
async fn reopening_a_topic_replaces_the_old_subscription() {
    let broker = MockBroker::new();
    let session = open_session(&broker, ());
    let first =
        TopicChannel::open(&session, TopicRef::post("1"), &post_template(), |_: Incoming| ())
            .unwrap();
    first.wait_active().await;
    let second =
        TopicChannel::open(&session, TopicRef::post("1"), &post_template(), |_: Incoming| ())
            .unwrap();
    assert_eq!(second.wait_active().await, ChannelState::Active);
    assert_eq!(first.state(), ChannelState::Closed);
    assert_eq!(broker.test_num_subscribers("/topic/post/1/comments"), 1);

    drop(first);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(broker.test_num_subscribers("/topic/post/1/comments"), 1);
}

#[tokio::test]
async fn close_is_final_and_idempotent() {
    let broker = MockBroker::new();
    let session = open_session(&broker, ());
    let channel =
        TopicChannel::open(&session, TopicRef::post("1"), &post_template(), |_: Incoming| ())
            .unwrap();
    channel.wait_active().await;

    session.close();
    session.close();
    assert!(!session.is_connected());
    eventually("channel closed", || channel.state() == ChannelState::Closed).await;
    eventually("goodbye", || {
        broker.test_received(Command::Disconnect).len() == 1
    })
    .await;
    let attempts = broker.test_connect_attempts();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.test_connect_attempts(), attempts);
    assert!(!session.wait_connected().await);

    session.open();
    assert!(!session.is_connected());
    assert_eq!(channel.send(&OutboundReply::top_level("A", "hi")), Ok(()));
    assert!(broker.test_received(Command::Send).is_empty());
}

#[tokio::test]
async fn silent_broker_is_detected() {
    init_tracing();
    let broker = MockBroker::new();
    broker.test_advertise_heartbeat((50, 50));
    broker.test_answer_heartbeats(false);
    let lifecycle = Lifecycle::default();
    let config = SessionConfig {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(150),
        ..fast_config()
    };
    let session = Session::new(config, broker.clone(), lifecycle.clone());
    session.open();

    eventually("liveness timeout", || lifecycle.count("disconnect") >= 1).await;
    eventually("reconnect", || lifecycle.count("connect") >= 2).await;
    assert!(broker.test_connect_attempts() >= 2);
}

#[tokio::test]
async fn answered_heartbeats_keep_the_connection() {
    let broker = MockBroker::new();
    broker.test_advertise_heartbeat((50, 50));
    let lifecycle = Lifecycle::default();
    let config = SessionConfig {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(200),
        ..fast_config()
    };
    let session = Session::new(config, broker.clone(), lifecycle.clone());
    session.open();
    assert!(session.wait_connected().await);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(lifecycle.count("disconnect"), 0);
    assert_eq!(broker.test_connect_attempts(), 1);
}

#[tokio::test]
async fn binding_merges_broker_echo_of_posted_reply() {
    let broker = MockBroker::new();
    let session = open_session(&broker, ());
    let (mut binding, updates) = new_binding(&session, BindingConfig::default());

    binding
        .bind(TopicRef::post("1"), vec![comment("c1", "first")])
        .unwrap();
    assert_eq!(binding.wait_active().await, Some(ChannelState::Active));
    assert_eq!(updates.lock().len(), 1);

    binding
        .post(OutboundReply::reply_to("c1", "B", "second"))
        .unwrap();
    eventually("echo", || binding.tree().unwrap().len() == 2).await;
    let nodes = binding.tree().unwrap().to_nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].replies.len(), 1);
    assert_eq!(nodes[0].replies[0].content, "second");
    assert_eq!(nodes[0].replies[0].author_name, "B");
    assert_eq!(updates.lock().len(), 2);
}

#[tokio::test]
async fn rebinding_isolates_topics() {
    let broker = MockBroker::new();
    let session = open_session(&broker, ());
    let (mut binding, updates) = new_binding(&session, BindingConfig::default());
    let (t1, t2) = (TopicRef::post("1"), TopicRef::post("2"));

    binding.bind(t1.clone(), vec![comment("c1", "one")]).unwrap();
    binding.wait_active().await;
    broker.publish(&t1, &Incoming::new(comment("c2", "two"), None));
    eventually("merge on t1", || binding.tree().unwrap().len() == 2).await;

    binding.bind(t2.clone(), Vec::new()).unwrap();
    assert_eq!(binding.current(), Some(&t2));
    assert_eq!(binding.wait_active().await, Some(ChannelState::Active));
    assert_eq!(broker.test_num_subscribers("/topic/post/1/comments"), 0);
    assert_eq!(broker.publish(&t1, &Incoming::new(comment("c3", "late"), None)), 0);
    broker.publish(&t2, &Incoming::new(comment("c4", "elsewhere"), None));
    eventually("merge on t2", || binding.tree().unwrap().len() == 1).await;
    assert!(binding.tree().unwrap().contains(&"c4".into()));

    binding.bind(t1.clone(), Vec::new()).unwrap();
    assert!(binding.tree().unwrap().is_empty());
    assert_eq!(updates.lock().last(), Some(&t1));

    binding.unbind();
    binding.unbind();
    assert_eq!(binding.current(), None);
    assert!(binding.tree().is_none());
    eventually("unsubscribed", || {
        broker.test_num_subscribers("/topic/post/1/comments") == 0
    })
    .await;
    assert!(session.is_connected());
}

#[tokio::test]
async fn bad_messages_do_not_break_the_binding() {
    let broker = MockBroker::new();
    let session = open_session(&broker, ());
    let (mut binding, _) = new_binding(&session, BindingConfig::default());
    let topic = TopicRef::post("1");
    binding.bind(topic.clone(), vec![comment("c1", "one")]).unwrap();
    binding.wait_active().await;

    let destination = "/topic/post/1/comments";
    broker.publish_raw(destination, b"not json");
    broker.publish_raw(destination, br#"{"comment": {"content": "no id"}}"#);
    let orphan = Incoming::new(comment("c2", "orphan"), Some("ghost".into()));
    broker.publish(&topic, &orphan);
    broker.publish(&topic, &orphan);
    eventually("valid messages", || binding.tree().unwrap().len() == 3).await;

    let tree = binding.tree().unwrap();
    assert_eq!(tree.root_len(), 3);
    assert!(session.is_connected());
    assert_eq!(binding.channel_state(), Some(ChannelState::Active));
}

#[tokio::test]
async fn optimistic_echo_shows_posts_right_away() {
    let broker = MockBroker::new();
    let session = open_session(&broker, ());
    let config = BindingConfig {
        local_echo: LocalEcho::Optimistic,
        ..BindingConfig::default()
    };
    let (mut binding, _) = new_binding(&session, config);
    binding.bind(TopicRef::post("1"), Vec::new()).unwrap();
    binding.wait_active().await;

    binding
        .post(OutboundReply::top_level("A", "hello"))
        .unwrap();
    let nodes = binding.tree().unwrap().to_nodes();
    assert_eq!(nodes.len(), 1);
    assert!(nodes[0].id.as_str().starts_with("local-"));

    eventually("broker echo", || binding.tree().unwrap().len() == 2).await;
}

#[tokio::test]
async fn optimistic_echo_skips_posts_made_offline() {
    let broker = MockBroker::new();
    broker.test_refuse_connections(true);
    let session = open_session(&broker, ());
    let config = BindingConfig {
        local_echo: LocalEcho::Optimistic,
        ..BindingConfig::default()
    };
    let (mut binding, updates) = new_binding(&session, config);
    binding.bind(TopicRef::post("1"), Vec::new()).unwrap();
    let bound_updates = updates.lock().len();

    binding.post(OutboundReply::top_level("A", "lost")).unwrap();
    assert!(binding.tree().unwrap().is_empty());
    assert_eq!(updates.lock().len(), bound_updates);

    broker.test_refuse_connections(false);
    assert!(session.wait_connected().await);
    assert_eq!(binding.wait_active().await, Some(ChannelState::Active));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(broker.test_received(Command::Send).is_empty());
    assert!(binding.tree().unwrap().is_empty());
}

#[tokio::test]
async fn stale_seeds_are_discarded() {
    let broker = MockBroker::new();
    let session = open_session(&broker, ());
    let (mut binding, _) = new_binding(&session, BindingConfig::default());
    let (t1, t2) = (TopicRef::post("1"), TopicRef::pod("2"));

    binding.bind(t1.clone(), Vec::new()).unwrap();
    binding.bind(t2.clone(), Vec::new()).unwrap();
    assert!(!binding.reseed(&t1, vec![comment("c1", "stale")]));
    assert!(binding.tree().unwrap().is_empty());
    assert!(binding.reseed(&t2, vec![comment("c2", "fresh")]));
    assert_eq!(binding.tree().unwrap().len(), 1);
}

#[tokio::test]
async fn posting_unbound_does_nothing() {
    let broker = MockBroker::new();
    let session = open_session(&broker, ());
    let (binding, updates) = new_binding(&session, BindingConfig::default());
    assert!(session.wait_connected().await);
    assert_eq!(binding.post(OutboundReply::top_level("A", "hi")), Ok(()));
    assert_eq!(
        binding.post(OutboundReply::top_level("A", "")),
        Err(Error::EmptyContent)
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(broker.test_received(Command::Send).is_empty());
    assert!(updates.lock().is_empty());
}

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum Step {
    Bind(u8),
    Publish { topic: u8, parent: Option<u8> },
    Reconnect,
    Unbind,
}

fn fuzz_topic(n: u8) -> TopicRef {
    TopicRef::post((n % 3).to_string())
}

fn assert_only_from(binding: &TopicBinding) {
    let (topic, tree) = match (binding.current(), binding.tree()) {
        (Some(t), Some(tree)) => (t, tree),
        _ => return,
    };
    let prefix = format!("{topic}-");
    for node in tree.display_order() {
        assert!(
            node.id.as_str().starts_with(&prefix),
            "{} leaked into {topic}",
            node.id
        );
    }
}

async fn run_steps(steps: Vec<Step>) {
    let broker = MockBroker::new();
    let lifecycle = Lifecycle::default();
    let session = open_session(&broker, lifecycle.clone());
    let (mut binding, _) = new_binding(&session, BindingConfig::default());
    assert!(session.wait_connected().await);
    let mut expected = 0;
    let mut next_id = 0;
    for step in steps {
        match step {
            Step::Bind(n) => {
                let topic = fuzz_topic(n);
                if binding.current() != Some(&topic) {
                    expected = 0;
                }
                binding.bind(topic, Vec::new()).unwrap();
                assert_eq!(binding.wait_active().await, Some(ChannelState::Active));
            }
            Step::Publish { topic, parent } => {
                let topic = fuzz_topic(topic);
                next_id += 1;
                let parent = parent.map(|p| format!("{topic}-{p}").into());
                let msg = Incoming::new(comment(&format!("{topic}-{next_id}"), "x"), parent);
                let delivered = broker.publish(&topic, &msg);
                if binding.current() == Some(&topic) {
                    assert_eq!(delivered, 1);
                    expected += 1;
                }
            }
            Step::Reconnect => {
                let lost = lifecycle.count("disconnect");
                broker.test_drop_connections();
                eventually("disconnect", || lifecycle.count("disconnect") > lost).await;
                assert!(session.wait_connected().await);
                if binding.current().is_some() {
                    assert_eq!(binding.wait_active().await, Some(ChannelState::Active));
                }
            }
            Step::Unbind => {
                binding.unbind();
                expected = 0;
            }
        }
        assert_only_from(&binding);
    }
    if binding.current().is_some() {
        eventually("every message", || binding.tree().unwrap().len() == expected).await;
    }
    assert_only_from(&binding);
}

#[test]
fn binding_never_mixes_topics() {
    let runtime = std::panic::AssertUnwindSafe(
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed initializing tokio runtime"),
    );
    bolero::check!()
        .with_generator(bolero::generator::gen_with::<Vec<Step>>().len(0..12usize))
        .with_iterations(64)
        .cloned()
        .for_each(move |steps| runtime.block_on(run_steps(steps)))
}
