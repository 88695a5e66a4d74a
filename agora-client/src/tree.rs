use crate::api::{CommentId, CommentNode, Incoming, Time};

/// What to do with a node whose id is already somewhere in the tree
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DuplicatePolicy {
    /// Insert it again. A message replayed across a resubscribe will show up twice.
    #[default]
    Append,

    /// Ignore it
    SkipKnownIds,
}

/// Where a merged node ended up
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Placement {
    Root,
    Reply { parent: CommentId },

    /// The declared parent is not in the tree (yet), so the node was appended to the root
    /// sequence instead of being dropped
    Orphan { missing_parent: CommentId },

    /// Only with `DuplicatePolicy::SkipKnownIds`
    Duplicate,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
struct Slot(usize);

#[derive(Clone, Debug)]
struct Node {
    id: CommentId,
    author_name: String,
    content: String,
    created_at: Option<Time>,
    replies: im::Vector<Slot>,
}

/// One line of the rendered tree, see `CommentTree::display_order`
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Row<'a> {
    pub depth: usize,
    pub id: &'a CommentId,
    pub author_name: &'a str,
    pub content: &'a str,
    pub created_at: Option<Time>,
    pub reply_count: usize,
}

/// The comments of one topic.
///
/// Nodes live in an append-only arena and refer to their replies by slot, with a separate list
/// for the root sequence. Placement only ever looks at `parent_id`, never at timestamps. Cloning
/// is cheap, so handing a snapshot to a renderer is fine.
#[derive(Clone, Debug, Default)]
pub struct CommentTree {
    nodes: im::Vector<Node>,
    roots: im::Vector<Slot>,
    by_id: im::HashMap<CommentId, im::Vector<Slot>>,
    policy: DuplicatePolicy,
}

impl CommentTree {
    pub fn new(policy: DuplicatePolicy) -> CommentTree {
        CommentTree {
            policy,
            ..CommentTree::default()
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Replaces the whole tree with already-known comments
    pub fn seed(&mut self, nodes: Vec<CommentNode>) {
        self.nodes = im::Vector::new();
        self.roots = im::Vector::new();
        self.by_id = im::HashMap::new();
        for n in nodes {
            let slot = self.insert_subtree(n);
            self.roots.push_back(slot);
        }
    }

    pub fn merge_incoming(&mut self, msg: Incoming) -> Placement {
        self.place(msg.comment, msg.parent_id.as_ref())
    }

    /// Same placement as `merge_incoming`, so that a locally composed comment lands where remote
    /// viewers will see it
    pub fn append_local(&mut self, node: CommentNode, parent_id: Option<&CommentId>) -> Placement {
        self.place(node, parent_id)
    }

    fn place(&mut self, node: CommentNode, parent_id: Option<&CommentId>) -> Placement {
        if self.policy == DuplicatePolicy::SkipKnownIds && self.by_id.contains_key(&node.id) {
            return Placement::Duplicate;
        }
        let parent = parent_id.map(|p| (p, self.find(p)));
        let slot = self.insert_subtree(node);
        match parent {
            None => {
                self.roots.push_back(slot);
                Placement::Root
            }
            Some((p, Some(parent))) => {
                self.node_mut(parent).replies.push_back(slot);
                Placement::Reply { parent: p.clone() }
            }
            Some((p, None)) => {
                self.roots.push_back(slot);
                Placement::Orphan {
                    missing_parent: p.clone(),
                }
            }
        }
    }

    /// First node with this id in pre-order
    fn find(&self, id: &CommentId) -> Option<Slot> {
        let candidates = self.by_id.get(id)?;
        if candidates.len() == 1 {
            return candidates.front().copied();
        }
        let mut stack = self.roots.iter().rev().copied().collect::<Vec<_>>();
        while let Some(slot) = stack.pop() {
            let node = self.node(slot);
            if node.id == *id {
                return Some(slot);
            }
            stack.extend(node.replies.iter().rev().copied());
        }
        None
    }

    // Allocates `node` and all its nested replies, keeping their order, and returns the slot of
    // `node` itself, which is not attached anywhere yet
    fn insert_subtree(&mut self, mut node: CommentNode) -> Slot {
        let top = self.alloc(&mut node);
        let mut pending = vec![(top, std::mem::take(&mut node.replies))];
        while let Some((parent, children)) = pending.pop() {
            for mut c in children {
                let slot = self.alloc(&mut c);
                self.node_mut(parent).replies.push_back(slot);
                pending.push((slot, std::mem::take(&mut c.replies)));
            }
        }
        top
    }

    // Takes everything but the replies out of `node`
    fn alloc(&mut self, node: &mut CommentNode) -> Slot {
        let id = CommentId(std::mem::take(&mut node.id.0));
        let slot = Slot(self.nodes.len());
        self.by_id
            .entry(id.clone())
            .or_insert_with(im::Vector::new)
            .push_back(slot);
        self.nodes.push_back(Node {
            id,
            author_name: std::mem::take(&mut node.author_name),
            content: std::mem::take(&mut node.content),
            created_at: node.created_at,
            replies: im::Vector::new(),
        });
        slot
    }

    fn node(&self, slot: Slot) -> &Node {
        &self.nodes[slot.0]
    }

    fn node_mut(&mut self, slot: Slot) -> &mut Node {
        &mut self.nodes[slot.0]
    }

    /// Number of comments at any depth
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root_len(&self) -> usize {
        self.roots.len()
    }

    pub fn contains(&self, id: &CommentId) -> bool {
        self.by_id.contains_key(id)
    }

    /// The first comment with this id, along with all its replies
    pub fn get(&self, id: &CommentId) -> Option<CommentNode> {
        let slot = self.find(id)?;
        self.materialize(&[slot]).pop()
    }

    /// The root sequence as nested comments, in insertion order
    pub fn to_nodes(&self) -> Vec<CommentNode> {
        let roots = self.roots.iter().copied().collect::<Vec<_>>();
        self.materialize(&roots)
    }

    // Post-order build: a node is assembled once all its replies sit on top of `built`
    fn materialize(&self, slots: &[Slot]) -> Vec<CommentNode> {
        let mut built = Vec::new();
        let mut stack = slots.iter().rev().map(|s| (*s, false)).collect::<Vec<_>>();
        while let Some((slot, expanded)) = stack.pop() {
            let n = self.node(slot);
            if !expanded {
                stack.push((slot, true));
                stack.extend(n.replies.iter().rev().map(|r| (*r, false)));
                continue;
            }
            let replies = built.split_off(built.len() - n.replies.len());
            built.push(CommentNode {
                id: n.id.clone(),
                author_name: n.author_name.clone(),
                content: n.content.clone(),
                created_at: n.created_at,
                replies,
            });
        }
        built
    }

    /// Flattened pre-order walk for rendering. Siblings are sorted by creation date, undated ones
    /// last, ties keep arrival order.
    pub fn display_order(&self) -> Vec<Row<'_>> {
        let mut rows = Vec::with_capacity(self.nodes.len());
        let mut stack = self
            .by_date(&self.roots)
            .into_iter()
            .rev()
            .map(|s| (0, s))
            .collect::<Vec<_>>();
        while let Some((depth, slot)) = stack.pop() {
            let n = self.node(slot);
            rows.push(Row {
                depth,
                id: &n.id,
                author_name: &n.author_name,
                content: &n.content,
                created_at: n.created_at,
                reply_count: n.replies.len(),
            });
            stack.extend(
                self.by_date(&n.replies)
                    .into_iter()
                    .rev()
                    .map(|s| (depth + 1, s)),
            );
        }
        rows
    }

    fn by_date(&self, slots: &im::Vector<Slot>) -> Vec<Slot> {
        let mut res = slots.iter().copied().collect::<Vec<_>>();
        res.sort_by_key(|s| {
            let created_at = self.node(*s).created_at;
            (created_at.is_none(), created_at)
        });
        res
    }
}
