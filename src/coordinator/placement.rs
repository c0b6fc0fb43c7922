//! Replica selection using consistent hashing
//!
//! A routing key (column family or key bytes) is hashed onto a ring built
//! from the current membership view, and the ring is walked to pick up to R
//! distinct nodes. The ring is rebuilt on every call so topology changes are
//! visible immediately.

use crate::common::ConsistentHashRing;
use crate::coordinator::membership::MembershipView;

/// Ordered replica set for one routing key. Index 0 is the primary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaSet {
    nodes: Vec<String>,
}

impl ReplicaSet {
    pub fn new(nodes: Vec<String>) -> Self {
        Self { nodes }
    }

    /// Node contacted first by reads and streams
    pub fn primary(&self) -> Option<&str> {
        self.get(0)
    }

    /// Node contacted by a hedged read or stream
    pub fn backup(&self) -> Option<&str> {
        self.get(1)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.nodes.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.nodes
    }

    pub fn into_vec(self) -> Vec<String> {
        self.nodes
    }
}

/// Maps routing keys to ordered replica sets over the live membership.
#[derive(Debug, Clone)]
pub struct ReplicaSelector {
    view: MembershipView,
    virtual_nodes: usize,
}

impl ReplicaSelector {
    pub fn new(view: MembershipView, virtual_nodes: usize) -> Self {
        Self {
            view,
            virtual_nodes,
        }
    }

    /// Select up to `replicas` distinct nodes for `routing_key`, closest first.
    ///
    /// Returns fewer nodes when fewer are live; callers skip absent positions.
    pub fn select(&self, routing_key: &[u8], replicas: usize) -> ReplicaSet {
        let ring = ConsistentHashRing::from_nodes(self.view.snapshot(), self.virtual_nodes);
        ReplicaSet::new(ring.walk(routing_key, replicas))
    }

    pub fn view(&self) -> &MembershipView {
        &self.view
    }
}
