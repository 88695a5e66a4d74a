use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    api::{
        CommentNode, DestinationTemplate, Error, Incoming, OutboundReply, TopicKind, TopicRef,
    },
    ChannelState, CommentTree, DuplicatePolicy, Placement, Session, TopicChannel,
};

/// Called with a snapshot of the tree after every change to the bound topic's tree
pub type UpdateListener = Arc<dyn 'static + Send + Sync + Fn(&TopicRef, &CommentTree)>;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LocalEcho {
    /// Posted comments show up once the broker echoes them back
    #[default]
    None,

    /// Posted comments are added to the tree right away, with a provisional `local-` id. The
    /// broker echo will then be added as a separate node.
    Optimistic,
}

#[derive(Clone, Debug)]
pub struct BindingConfig {
    pub post_template: DestinationTemplate,
    pub pod_template: DestinationTemplate,
    pub duplicates: DuplicatePolicy,
    pub local_echo: LocalEcho,
}

impl BindingConfig {
    pub fn template(&self, kind: TopicKind) -> &DestinationTemplate {
        match kind {
            TopicKind::Post => &self.post_template,
            TopicKind::Pod => &self.pod_template,
        }
    }
}

impl Default for BindingConfig {
    fn default() -> BindingConfig {
        BindingConfig {
            post_template: DestinationTemplate::for_kind(TopicKind::Post),
            pod_template: DestinationTemplate::for_kind(TopicKind::Pod),
            duplicates: DuplicatePolicy::default(),
            local_echo: LocalEcho::default(),
        }
    }
}

struct Bound {
    topic: TopicRef,
    tree: Arc<Mutex<CommentTree>>,
    channel: TopicChannel,
}

/// Keeps one live comment tree for whichever topic is currently displayed.
///
/// Switching topics closes the previous channel before opening the next one, and starts from a
/// brand new tree, so nothing merged for one topic can leak into another. The session is never
/// opened nor closed from here.
pub struct TopicBinding {
    session: Arc<Session>,
    config: BindingConfig,
    on_update: UpdateListener,
    bound: Option<Bound>,
}

impl TopicBinding {
    pub fn new(
        session: Arc<Session>,
        config: BindingConfig,
        on_update: impl 'static + Send + Sync + Fn(&TopicRef, &CommentTree),
    ) -> TopicBinding {
        TopicBinding {
            session,
            config,
            on_update: Arc::new(on_update),
            bound: None,
        }
    }

    /// Binds to `topic`, with `seed` as the comments already known for it. Binding again to the
    /// topic already bound does nothing; use `reseed` to refresh its comments.
    pub fn bind(&mut self, topic: TopicRef, seed: Vec<CommentNode>) -> Result<(), Error> {
        if self.current() == Some(&topic) {
            tracing::debug!(%topic, "topic is already bound");
            return Ok(());
        }
        topic.validate()?;
        self.unbind();

        let mut tree = CommentTree::new(self.config.duplicates);
        tree.seed(seed);
        let tree = Arc::new(Mutex::new(tree));
        let handler = {
            let tree = tree.clone();
            let topic = topic.clone();
            let on_update = self.on_update.clone();
            move |msg: Incoming| {
                let id = msg.comment.id.clone();
                let snapshot = {
                    let mut tree = tree.lock();
                    match tree.merge_incoming(msg) {
                        Placement::Orphan { missing_parent } => tracing::debug!(
                            %topic, comment = %id, %missing_parent,
                            "parent is not known, placed comment at root"
                        ),
                        Placement::Duplicate => {
                            tracing::debug!(%topic, comment = %id, "skipped known comment");
                            return;
                        }
                        _ => (),
                    }
                    tree.clone()
                };
                on_update(&topic, &snapshot);
            }
        };
        let channel = TopicChannel::open(
            &self.session,
            topic.clone(),
            self.config.template(topic.kind),
            handler,
        )?;
        tracing::info!(%topic, "bound topic");

        let snapshot = tree.lock().clone();
        self.bound = Some(Bound {
            topic: topic.clone(),
            tree,
            channel,
        });
        (self.on_update)(&topic, &snapshot);
        Ok(())
    }

    /// Releases the current topic's channel and tree. Idempotent.
    pub fn unbind(&mut self) {
        if let Some(bound) = self.bound.take() {
            bound.channel.close();
            tracing::info!(topic = %bound.topic, "unbound topic");
        }
    }

    /// Replaces the bound topic's comments with `nodes`, typically the result of a fetch started
    /// when `topic` was bound. Returns `false` and discards `nodes` if the binding has moved on.
    pub fn reseed(&self, topic: &TopicRef, nodes: Vec<CommentNode>) -> bool {
        let bound = match &self.bound {
            Some(b) if &b.topic == topic => b,
            _ => {
                tracing::debug!(%topic, "discarding comments fetched for a topic no longer bound");
                return false;
            }
        };
        let snapshot = {
            let mut tree = bound.tree.lock();
            tree.seed(nodes);
            tree.clone()
        };
        (self.on_update)(&bound.topic, &snapshot);
        true
    }

    /// Sends `reply` on the bound topic. Does nothing if no topic is bound or the session is
    /// disconnected. The optimistic echo, if enabled, only shows posts that were sent.
    pub fn post(&self, reply: OutboundReply) -> Result<(), Error> {
        reply.validate()?;
        let bound = match &self.bound {
            Some(b) => b,
            None => {
                tracing::debug!("no topic bound, not posting");
                return Ok(());
            }
        };
        if !bound.channel.publish(&reply)? || self.config.local_echo != LocalEcho::Optimistic {
            return Ok(());
        }
        let node = CommentNode::new(
            format!("local-{}", Uuid::new_v4()),
            reply.author_name.clone(),
            reply.content.clone(),
            Some(Utc::now()),
        );
        let snapshot = {
            let mut tree = bound.tree.lock();
            tree.append_local(node, reply.parent_id.as_ref());
            tree.clone()
        };
        (self.on_update)(&bound.topic, &snapshot);
        Ok(())
    }

    pub fn current(&self) -> Option<&TopicRef> {
        self.bound.as_ref().map(|b| &b.topic)
    }

    /// Snapshot of the bound topic's tree
    pub fn tree(&self) -> Option<CommentTree> {
        self.bound.as_ref().map(|b| b.tree.lock().clone())
    }

    pub fn channel_state(&self) -> Option<ChannelState> {
        self.bound.as_ref().map(|b| b.channel.state())
    }

    pub async fn wait_active(&self) -> Option<ChannelState> {
        match &self.bound {
            Some(b) => Some(b.channel.wait_active().await),
            None => None,
        }
    }
}

impl Drop for TopicBinding {
    fn drop(&mut self) {
        self.unbind();
    }
}
