// src/search/arena.rs
//! Block-pool node storage. Nodes are allocated from fixed-size blocks owned
//! by one worker thread, handed out as plain indices, and recycled through a
//! free list; pruning a subtree returns every node to the pool. Index
//! handles keep the tree free of parent pointers and let shadow game slots
//! alias a shared root without ownership gymnastics.

use crate::search::node::Node;

/// Default block footprint. Blocks are never freed individually; the whole
/// arena goes away with its worker.
pub const BLOCK_SIZE_BYTES: usize = 64 * 1024 * 1024;

/// Handle into a [`NodeArena`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(u32);

pub struct NodeArena {
    blocks: Vec<Vec<Node>>,
    nodes_per_block: usize,
    free: Vec<NodeId>,
    live: usize,
    peak: usize,
}

impl Default for NodeArena {
    fn default() -> Self {
        NodeArena::with_block_bytes(BLOCK_SIZE_BYTES)
    }
}

impl NodeArena {
    pub fn new() -> NodeArena {
        NodeArena::default()
    }

    pub fn with_block_bytes(block_bytes: usize) -> NodeArena {
        let nodes_per_block = (block_bytes / std::mem::size_of::<Node>()).max(1);
        NodeArena {
            blocks: Vec::new(),
            nodes_per_block,
            free: Vec::new(),
            live: 0,
            peak: 0,
        }
    }

    pub fn alloc(&mut self, prior: f32) -> NodeId {
        self.live += 1;
        self.peak = self.peak.max(self.live);

        if let Some(id) = self.free.pop() {
            *self.node_mut(id) = Node::new(prior);
            return id;
        }

        if self
            .blocks
            .last()
            .map_or(true, |block| block.len() == self.nodes_per_block)
        {
            self.blocks.push(Vec::with_capacity(self.nodes_per_block));
        }
        let block_index = self.blocks.len() - 1;
        let block = &mut self.blocks[block_index];
        let id = NodeId((block_index * self.nodes_per_block + block.len()) as u32);
        block.push(Node::new(prior));
        id
    }

    fn free_one(&mut self, id: NodeId) {
        debug_assert!(self.live > 0);
        self.live -= 1;
        // Drop the children buffer now rather than at slot reuse.
        self.node_mut(id).children = Vec::new();
        self.free.push(id);
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.blocks[id.0 as usize / self.nodes_per_block][id.0 as usize % self.nodes_per_block]
    }

    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.blocks[id.0 as usize / self.nodes_per_block][id.0 as usize % self.nodes_per_block]
    }

    /// Live node count; returns to zero once every tree is pruned.
    pub fn current_allocations(&self) -> usize {
        self.live
    }

    pub fn peak_allocations(&self) -> usize {
        self.peak
    }

    /// Free `root` and its entire subtree. Iterative: search trees can be
    /// deep enough to flatten a thread stack.
    pub fn prune_all(&mut self, root: NodeId) {
        let mut pending = vec![root];
        while let Some(id) = pending.pop() {
            pending.extend(self.node(id).children.iter().map(|(_, child)| *child));
            self.free_one(id);
        }
    }

    /// Free `root` and every descendant except the subtree under `kept`,
    /// which becomes the caller's new root.
    pub fn prune_except(&mut self, root: NodeId, kept: NodeId) {
        debug_assert!(root != kept);
        let children: Vec<NodeId> = self
            .node(root)
            .children
            .iter()
            .map(|(_, child)| *child)
            .collect();
        for child in children {
            if child != kept {
                self.prune_all(child);
            }
        }
        self.free_one(root);
    }
}
