//! Prints a random discussion thread as a JSON array of nested comments, suitable for
//! `agora-ctl watch --seed-file`.

use agora_client::{
    api::{CommentId, CommentNode, Incoming},
    CommentTree, DuplicatePolicy,
};
use chrono::{Duration, Utc};
use rand::{seq::SliceRandom, Rng};

const NUM_AUTHORS: usize = 5;
const NUM_COMMENTS: usize = 80;

const TOP_LEVEL_PROBABILITY: f64 = 0.25;
const COMMENT_WORD_COUNT: usize = 20;

fn main() {
    let mut rng = rand::thread_rng();
    let authors = (0..NUM_AUTHORS)
        .map(|_| lipsum::lipsum_words(2))
        .collect::<Vec<_>>();

    let mut tree = CommentTree::new(DuplicatePolicy::SkipKnownIds);
    let mut ids: Vec<CommentId> = Vec::new();
    let mut when = Utc::now() - Duration::days(2);
    for i in 0..NUM_COMMENTS {
        when = when + Duration::minutes(rng.gen_range(1..90));
        let parent = match ids.is_empty() || rng.gen_bool(TOP_LEVEL_PROBABILITY) {
            true => None,
            false => ids.choose(&mut rng).cloned(),
        };
        let node = CommentNode::new(
            format!("c{i}"),
            authors[rng.gen_range(0..authors.len())].clone(),
            lipsum::lipsum_words(rng.gen_range(1..COMMENT_WORD_COUNT)),
            Some(when),
        );
        ids.push(node.id.clone());
        tree.merge_incoming(Incoming::new(node, parent));
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&tree.to_nodes()).expect("serializing comments")
    );
}
