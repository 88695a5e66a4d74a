use std::{path::PathBuf, sync::Arc, time::Duration};

use agora_client::{
    api::{CommentNode, DestinationTemplate, Incoming, OutboundReply, TopicRef},
    BindingConfig, ChannelState, CommentTree, DuplicatePolicy, LocalEcho, RestClient, Session,
    SessionConfig, SessionListener, TopicBinding, TopicChannel, WsConnector,
};
use anyhow::{bail, Context};
use tokio::sync::mpsc;

#[derive(structopt::StructOpt)]
struct Opt {
    /// REST backend, eg. `http://localhost:8080`
    #[structopt(short, long, default_value = "http://localhost:8080")]
    host: String,

    /// Broker WebSocket endpoint, eg. `ws://localhost:8080/ws`
    #[structopt(short, long, default_value = "ws://localhost:8080/ws")]
    endpoint: String,

    #[structopt(long)]
    login: Option<String>,

    #[structopt(long, env = "AGORA_PASSCODE", hide_env_values = true)]
    passcode: Option<String>,

    /// Seconds to wait between two connection attempts
    #[structopt(long, default_value = "5")]
    reconnect_delay: u64,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(structopt::StructOpt)]
enum Command {
    /// Print a topic's current comments, as served by the REST backend
    Show {
        /// `post:<id>` or `pod:<id>`
        topic: TopicRef,
    },

    /// Follow a topic live, printing the tree on every change
    Watch {
        topic: TopicRef,

        /// Seed from a JSON array of comments instead of fetching them
        #[structopt(long, parse(from_os_str))]
        seed_file: Option<PathBuf>,

        /// Start from an empty tree
        #[structopt(long)]
        no_fetch: bool,

        /// Ignore comments whose id is already displayed
        #[structopt(long)]
        skip_duplicates: bool,
    },

    /// Publish a comment, and wait for the broker to echo it back
    Post {
        topic: TopicRef,

        content: String,

        /// Id of the comment to reply to
        #[structopt(long)]
        parent: Option<String>,

        #[structopt(long, env = "AGORA_AUTHOR")]
        author: Option<String>,

        /// Seconds to wait for the connection, then for the echo
        #[structopt(long, default_value = "10")]
        timeout: u64,
    },
}

struct LogListener;

impl SessionListener for LogListener {
    fn on_connect(&self) {
        tracing::info!("connected to broker");
    }

    fn on_disconnect(&self) {
        tracing::warn!("lost connection to broker, will retry");
    }

    fn on_error(&self, err: &anyhow::Error) {
        tracing::error!(?err, "broker connection error");
    }
}

fn render(topic: &TopicRef, tree: &CommentTree) {
    println!("--- {topic}: {} comments", tree.len());
    for row in tree.display_order() {
        let when = row
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| String::from("????-??-?? ??:??"));
        println!(
            "{:indent$}[{when}] {}: {} ({})",
            "",
            row.author_name,
            row.content,
            row.id,
            indent = 2 * row.depth,
        );
    }
}

fn read_seed(path: &PathBuf) -> anyhow::Result<Vec<CommentNode>> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("parsing comments from {}", path.display()))
}

impl Opt {
    fn session(&self) -> Session {
        let config = SessionConfig {
            endpoint: self.endpoint.clone(),
            login: self
                .login
                .clone()
                .map(|l| (l, self.passcode.clone().unwrap_or_default())),
            reconnect_delay: Duration::from_secs(self.reconnect_delay),
            ..SessionConfig::default()
        };
        Session::new(config, WsConnector, LogListener)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let opt = <Opt as structopt::StructOpt>::from_args();
    let rest = RestClient::new(&opt.host);

    match &opt.cmd {
        Command::Show { topic } => {
            let metadata = rest.fetch_metadata(topic).await?;
            if let Some(title) = &metadata.title {
                println!("{title}");
            }
            let mut tree = CommentTree::default();
            tree.seed(rest.fetch_comments(topic).await?);
            render(topic, &tree);
        }

        Command::Watch {
            topic,
            seed_file,
            no_fetch,
            skip_duplicates,
        } => {
            let seed = match seed_file {
                Some(path) => read_seed(path)?,
                None if *no_fetch => Vec::new(),
                None => rest.fetch_comments(topic).await.unwrap_or_else(|err| {
                    tracing::warn!(?err, %topic, "failed fetching comments, starting empty");
                    Vec::new()
                }),
            };
            let session = Arc::new(opt.session());
            session.open();
            let config = BindingConfig {
                duplicates: match *skip_duplicates {
                    true => DuplicatePolicy::SkipKnownIds,
                    false => DuplicatePolicy::Append,
                },
                local_echo: LocalEcho::None,
                ..BindingConfig::default()
            };
            let mut binding = TopicBinding::new(session.clone(), config, render);
            binding.bind(topic.clone(), seed)?;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            binding.unbind();
            session.close();
        }

        Command::Post {
            topic,
            content,
            parent,
            author,
            timeout,
        } => {
            let timeout = Duration::from_secs(*timeout);
            let author = author.clone().unwrap_or_else(whoami::username);
            let reply = match parent {
                Some(p) => OutboundReply::reply_to(p.as_str(), author, content.as_str()),
                None => OutboundReply::top_level(author, content.as_str()),
            };
            reply.validate()?;

            let session = opt.session();
            session.open();
            if !tokio::time::timeout(timeout, session.wait_connected())
                .await
                .unwrap_or(false)
            {
                bail!("could not connect to {} in {timeout:?}", opt.endpoint);
            }

            let (echo_tx, mut echo_rx) = mpsc::unbounded_channel();
            let channel = TopicChannel::open(
                &session,
                topic.clone(),
                &DestinationTemplate::for_kind(topic.kind),
                move |msg: Incoming| {
                    let _ = echo_tx.send(msg);
                },
            )?;
            match channel.wait_active().await {
                ChannelState::Active => (),
                other => bail!("could not subscribe to {topic}: {other:?}"),
            }
            channel.send(&reply)?;

            let echo = tokio::time::timeout(timeout, async {
                while let Some(msg) = echo_rx.recv().await {
                    if msg.comment.content == reply.content
                        && msg.comment.author_name == reply.author_name
                        && msg.parent_id == reply.parent_id
                    {
                        return Some(msg);
                    }
                }
                None
            })
            .await;
            match echo {
                Ok(Some(msg)) => println!("posted {} on {topic}", msg.comment.id),
                _ => tracing::warn!(%topic, "sent, but the broker did not echo the comment back"),
            }
            channel.close();
            session.close();
        }
    }

    Ok(())
}
