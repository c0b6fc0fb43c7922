//! Hashing utilities for ringkv
//!
//! - BLAKE3-derived 64-bit positions on the ring
//! - Consistent hash ring with virtual nodes for replica placement

use std::collections::{BTreeMap, HashSet};

/// Map arbitrary bytes to a 64-bit ring position.
pub fn ring_position(data: &[u8]) -> u64 {
    let hash = blake3::hash(data);
    let mut word = [0u8; 8];
    word.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(word)
}

/// Consistent hash ring
///
/// Every physical node owns `virtual_nodes` tokens. A key is hashed onto the
/// ring and the ring is walked clockwise, collecting distinct physical nodes
/// in the order they are met. Adding or removing one node only moves the
/// keys adjacent to its tokens.
#[derive(Debug, Clone)]
pub struct ConsistentHashRing {
    virtual_nodes: usize,
    tokens: BTreeMap<u64, String>,
    nodes: HashSet<String>,
}

impl ConsistentHashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            tokens: BTreeMap::new(),
            nodes: HashSet::new(),
        }
    }

    /// Build a ring from a node list. Duplicate addresses collapse into one node.
    pub fn from_nodes<I, S>(nodes: I, virtual_nodes: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ring = Self::new(virtual_nodes);
        for node in nodes {
            ring.add_node(node);
        }
        ring
    }

    pub fn add_node(&mut self, node: impl Into<String>) {
        let node = node.into();
        if !self.nodes.insert(node.clone()) {
            return;
        }
        for replica in 0..self.virtual_nodes {
            let position = ring_position(format!("{}#{}", node, replica).as_bytes());
            // A colliding token keeps its first owner so placement stays stable.
            self.tokens.entry(position).or_insert_with(|| node.clone());
        }
    }

    pub fn remove_node(&mut self, node: &str) {
        if self.nodes.remove(node) {
            self.tokens.retain(|_, owner| owner != node);
        }
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Walk the ring from `key`'s position and return up to `n` distinct
    /// physical nodes, closest first.
    pub fn walk(&self, key: &[u8], n: usize) -> Vec<String> {
        let wanted = n.min(self.nodes.len());
        let mut selected = Vec::with_capacity(wanted);
        if wanted == 0 {
            return selected;
        }

        let start = ring_position(key);
        let clockwise = self.tokens.range(start..).chain(self.tokens.range(..start));
        for (_, node) in clockwise {
            if !selected.contains(node) {
                selected.push(node.clone());
                if selected.len() == wanted {
                    break;
                }
            }
        }
        selected
    }
}
