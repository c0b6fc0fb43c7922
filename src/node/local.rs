//! In-process cluster
//!
//! Hosts nodes backed by `MemStorage` inside the current runtime and wires
//! them to the coordinator through `LocalConnector`. Each node can be slowed
//! down, cut off or taken out of membership, and counts the requests it
//! actually received.

use crate::common::{ClientConfig, Error, Message, Op, Result};
use crate::coordinator::membership::{EphemeralNode, MembershipView, Registry};
use crate::coordinator::pool::{Connection, Connector};
use crate::coordinator::tracker::RequestTracker;
use crate::coordinator::ReplicationClient;
use crate::node::handler::handle;
use crate::node::storage::MemStorage;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

type NodeMap = Arc<RwLock<HashMap<String, Arc<LocalNode>>>>;

pub struct LocalNode {
    storage: Arc<MemStorage>,
    latency_micros: AtomicU64,
    reachable: AtomicBool,
    received: Mutex<HashMap<Op, usize>>,
    registration: Mutex<Option<EphemeralNode>>,
}

impl LocalNode {
    fn new() -> Self {
        Self {
            storage: Arc::new(MemStorage::new()),
            latency_micros: AtomicU64::new(0),
            reachable: AtomicBool::new(true),
            received: Mutex::new(HashMap::new()),
            registration: Mutex::new(None),
        }
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn latency(&self) -> Duration {
        Duration::from_micros(self.latency_micros.load(Ordering::SeqCst))
    }

    /// Apply `msg` after the configured latency and hand the reply to the
    /// tracker. Unreachable nodes swallow the message.
    async fn deliver(&self, msg: Message, tracker: &RequestTracker) {
        if !self.is_reachable() {
            return;
        }
        *self
            .received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(msg.op)
            .or_insert(0) += 1;

        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.is_reachable() {
            return;
        }
        tracker.resolve(handle(self.storage.as_ref(), msg));
    }
}

pub struct LocalCluster {
    registry: Registry,
    path: String,
    nodes: NodeMap,
}

impl LocalCluster {
    pub fn new(registry: Registry, path: impl Into<String>) -> Self {
        Self {
            registry,
            path: path.into(),
            nodes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// A fresh registry with `count` nodes named `node-0`, `node-1`, ...
    /// registered under the default membership path.
    pub fn with_nodes(count: usize) -> Self {
        let cluster = Self::new(Registry::new(), ClientConfig::default().membership_path);
        for i in 0..count {
            cluster.add_node(&format!("node-{}", i));
        }
        cluster
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Start a node and register it in membership.
    pub fn add_node(&self, addr: &str) {
        let node = Arc::new(LocalNode::new());
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr.to_string(), node);
        self.register(addr);
    }

    /// All hosted node addresses, sorted
    pub fn nodes(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        addrs.sort();
        addrs
    }

    fn node(&self, addr: &str) -> Result<Arc<LocalNode>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(addr)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("no local node {}", addr)))
    }

    pub fn set_latency(&self, addr: &str, latency: Duration) -> Result<()> {
        self.node(addr)?
            .latency_micros
            .store(latency.as_micros() as u64, Ordering::SeqCst);
        Ok(())
    }

    /// An unreachable node refuses connections and drops every message,
    /// including ones already in flight.
    pub fn set_reachable(&self, addr: &str, reachable: bool) -> Result<()> {
        self.node(addr)?.reachable.store(reachable, Ordering::SeqCst);
        tracing::info!(
            "Local node {} is now {}",
            addr,
            if reachable { "reachable" } else { "unreachable" }
        );
        Ok(())
    }

    /// Remove the node's ephemeral membership entry.
    pub fn deregister(&self, addr: &str) -> Result<()> {
        let node = self.node(addr)?;
        let registration = node
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(registration);
        Ok(())
    }

    pub fn register(&self, addr: &str) {
        if let Ok(node) = self.node(addr) {
            let entry = self.registry.register(&self.path, addr);
            *node
                .registration
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(entry);
        }
    }

    /// Requests of kind `op` the node has received
    pub fn requests(&self, addr: &str, op: Op) -> usize {
        self.node(addr)
            .map(|node| {
                node.received
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&op)
                    .copied()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Requests of kind `op` received across the cluster
    pub fn total_requests(&self, op: Op) -> usize {
        self.nodes()
            .iter()
            .map(|addr| self.requests(addr, op))
            .sum()
    }

    pub fn storage(&self, addr: &str) -> Result<Arc<MemStorage>> {
        Ok(self.node(addr)?.storage.clone())
    }

    pub fn view(&self) -> MembershipView {
        MembershipView::watch(&self.registry, &self.path)
    }

    pub fn connector(&self) -> LocalConnector {
        LocalConnector {
            nodes: self.nodes.clone(),
        }
    }

    /// A client over this cluster's live membership.
    pub fn client(&self, config: ClientConfig) -> Result<ReplicationClient<LocalConnector>> {
        ReplicationClient::new(config, self.view(), self.connector())
    }
}

/// Connects the coordinator to nodes of a `LocalCluster`.
#[derive(Clone)]
pub struct LocalConnector {
    nodes: NodeMap,
}

impl Connector for LocalConnector {
    fn connect(
        &self,
        node: &str,
        tracker: Arc<RequestTracker>,
        queue_depth: usize,
    ) -> impl Future<Output = Result<Connection>> + Send {
        let addr = node.to_string();
        let target = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node)
            .cloned();

        async move {
            let target = match target {
                Some(target) if target.is_reachable() => target,
                _ => return Err(Error::unavailable(addr, "connection refused")),
            };

            let (conn, mut outbound) = Connection::new(&addr, queue_depth);
            tokio::spawn(async move {
                while let Some(msg) = outbound.recv().await {
                    let target = target.clone();
                    let tracker = tracker.clone();
                    tokio::spawn(async move { target.deliver(msg, &tracker).await });
                }
            });
            Ok(conn)
        }
    }
}
