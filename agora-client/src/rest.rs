use anyhow::Context;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};

use crate::{
    api::{CommentNode, Incoming, TopicKind, TopicMetadata, TopicRef},
    CommentTree, DuplicatePolicy,
};

/// Fetches what a topic already holds, to seed its tree and the surrounding chrome
#[derive(Clone)]
pub struct RestClient {
    host: String,
    client: ClientWithMiddleware,
}

impl RestClient {
    /// `host` is eg. `http://localhost:8080`, without trailing slash
    pub fn new(host: impl Into<String>) -> RestClient {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        RestClient {
            host: host.into().trim_end_matches('/').to_string(),
            client: ClientBuilder::new(reqwest::Client::new())
                .with(RetryTransientMiddleware::new_with_policy(retry_policy))
                .build(),
        }
    }

    pub fn comments_url(&self, topic: &TopicRef) -> String {
        match topic.kind {
            TopicKind::Post => format!("{}/api/posts/{}/comments", self.host, topic.id),
            TopicKind::Pod => format!("{}/api/pods/{}/messages", self.host, topic.id),
        }
    }

    pub fn metadata_url(&self, topic: &TopicRef) -> String {
        match topic.kind {
            TopicKind::Post => format!("{}/api/posts/{}", self.host, topic.id),
            TopicKind::Pod => format!("{}/api/pods/{}", self.host, topic.id),
        }
    }

    pub async fn fetch_comments(&self, topic: &TopicRef) -> anyhow::Result<Vec<CommentNode>> {
        topic.validate()?;
        let url = self.comments_url(topic);
        let items: Vec<serde_json::Value> = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("fetching {url}"))?
            .error_for_status()
            .with_context(|| format!("fetching {url}"))?
            .json()
            .await
            .with_context(|| format!("parsing comments from {url}"))?;
        let nodes = assemble(items);
        tracing::debug!(%topic, roots = nodes.len(), "fetched comments");
        Ok(nodes)
    }

    pub async fn fetch_metadata(&self, topic: &TopicRef) -> anyhow::Result<TopicMetadata> {
        topic.validate()?;
        let url = self.metadata_url(topic);
        self.client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("fetching {url}"))?
            .error_for_status()
            .with_context(|| format!("fetching {url}"))?
            .json()
            .await
            .with_context(|| format!("parsing topic metadata from {url}"))
    }
}

/// Turns a fetched listing into root nodes. Listings are either already nested, or flat with a
/// `parentId` on each item; both go through the same placement as live messages. Items that do
/// not parse are skipped.
pub(crate) fn assemble(items: Vec<serde_json::Value>) -> Vec<CommentNode> {
    let mut tree = CommentTree::new(DuplicatePolicy::Append);
    for item in items {
        match Incoming::from_value(item) {
            Ok(msg) => {
                tree.merge_incoming(msg);
            }
            Err(err) => tracing::warn!(?err, "skipping unparseable fetched comment"),
        }
    }
    tree.to_nodes()
}
