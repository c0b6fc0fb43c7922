//! Per-node connection pool
//!
//! Each node gets a bounded set of lease permits and a stack of idle
//! connections. A connection is an outbound message queue drained by a
//! transport task; a full queue is how backpressure shows up, so a lease is
//! writable only while its queue has room and the transport is alive.

use crate::common::{Error, Message, PoolConfig, Result};
use crate::coordinator::tracker::RequestTracker;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

/// Opens connections to nodes. Responses read off a connection must be
/// handed to `tracker.resolve`.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        node: &str,
        tracker: Arc<RequestTracker>,
        queue_depth: usize,
    ) -> impl Future<Output = Result<Connection>> + Send;
}

/// Shared liveness flag of one connection
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn mark_dead(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Coordinator half of a connection
#[derive(Debug)]
pub struct Connection {
    node: String,
    tx: mpsc::Sender<Message>,
    liveness: Liveness,
}

/// Transport half of a connection: the queue of messages to put on the wire.
#[derive(Debug)]
pub struct Outbound {
    rx: mpsc::Receiver<Message>,
    liveness: Liveness,
}

impl Connection {
    pub fn new(node: &str, queue_depth: usize) -> (Connection, Outbound) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let liveness = Liveness::new();
        (
            Connection {
                node: node.to_string(),
                tx,
                liveness: liveness.clone(),
            },
            Outbound { rx, liveness },
        )
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn is_alive(&self) -> bool {
        self.liveness.is_alive() && !self.tx.is_closed()
    }

    pub fn is_writable(&self) -> bool {
        self.is_alive() && self.tx.capacity() > 0
    }

    /// Queue `msg` without waiting.
    pub fn send(&self, msg: Message) -> Result<()> {
        self.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => Error::unavailable(&self.node, "connection not writable"),
            TrySendError::Closed(_) => {
                self.liveness.mark_dead();
                Error::unavailable(&self.node, "connection closed")
            }
        })
    }
}

impl Outbound {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        match self.rx.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }
}

impl Drop for Outbound {
    fn drop(&mut self) {
        self.liveness.mark_dead();
    }
}

struct NodeSlots {
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
}

impl NodeSlots {
    fn new(max: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(max)),
        }
    }

    fn pop_live(&self) -> Option<Connection> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(conn) = idle.pop() {
            if conn.is_alive() {
                return Some(conn);
            }
        }
        None
    }

    fn close(&self) {
        self.permits.close();
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Exclusive use of one connection to one node.
///
/// Dropping the lease returns a live connection to the idle stack before the
/// permit is released, so every exit path gives the connection back.
pub struct Lease {
    node: String,
    conn: Option<Connection>,
    slots: Arc<NodeSlots>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn is_writable(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::is_writable)
    }

    pub fn send(&self, msg: Message) -> Result<()> {
        match &self.conn {
            Some(conn) => conn.send(msg),
            None => Err(Error::unavailable(&self.node, "lease has no connection")),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if conn.is_alive() && !self.slots.permits.is_closed() {
                self.slots
                    .idle
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(conn);
            }
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("node", &self.node).finish()
    }
}

pub struct ConnectionPool<C: Connector> {
    connector: C,
    tracker: Arc<RequestTracker>,
    config: PoolConfig,
    nodes: Mutex<HashMap<String, Arc<NodeSlots>>>,
    closed: AtomicBool,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, tracker: Arc<RequestTracker>, config: PoolConfig) -> Self {
        Self {
            connector,
            tracker,
            config,
            nodes: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn slots(&self, node: &str) -> Result<Arc<NodeSlots>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::unavailable(node, "pool closed"));
        }
        let mut nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(nodes
            .entry(node.to_string())
            .or_insert_with(|| Arc::new(NodeSlots::new(self.config.max_connections_per_node)))
            .clone())
    }

    /// Lease a connection to `node`, waiting at most the acquire timeout for
    /// a free permit and at most the connect timeout for a new connection.
    pub async fn acquire(&self, node: &str) -> Result<Lease> {
        let slots = self.slots(node)?;

        let permit = match tokio::time::timeout(
            self.config.acquire_timeout(),
            slots.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::unavailable(node, "pool closed")),
            Err(_) => return Err(Error::unavailable(node, "pool exhausted")),
        };

        let conn = match slots.pop_live() {
            Some(conn) => conn,
            None => {
                tracing::debug!("Opening connection to {}", node);
                match tokio::time::timeout(
                    self.config.connect_timeout(),
                    self.connector.connect(
                        node,
                        self.tracker.clone(),
                        self.config.send_queue_depth,
                    ),
                )
                .await
                {
                    Ok(result) => result?,
                    Err(_) => return Err(Error::unavailable(node, "connect timed out")),
                }
            }
        };

        Ok(Lease {
            node: node.to_string(),
            conn: Some(conn),
            slots,
            _permit: permit,
        })
    }

    pub fn is_writable(&self, lease: &Lease) -> bool {
        lease.is_writable()
    }

    /// Give a lease back. Equivalent to dropping it.
    pub fn release(&self, lease: Lease) {
        drop(lease);
    }

    /// Forget pooled connections to nodes that are no longer members.
    pub fn retain_nodes(&self, members: &[String]) {
        let mut nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        nodes.retain(|node, slots| {
            let keep = members.iter().any(|m| m == node);
            if !keep {
                tracing::info!("Evicting pooled connections to departed node {}", node);
                slots.close();
            }
            keep
        });
    }

    /// Close every pooled connection and refuse further leases.
    pub fn drain(&self) {
        self.closed.store(true, Ordering::Release);
        let mut nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, slots) in nodes.drain() {
            slots.close();
        }
    }

    pub fn idle_connections(&self, node: &str) -> usize {
        let nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        nodes
            .get(node)
            .map(|slots| {
                slots
                    .idle
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .len()
            })
            .unwrap_or(0)
    }

    pub fn tracker(&self) -> &Arc<RequestTracker> {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ClientMetrics, Op};
    use std::sync::atomic::AtomicUsize;

    /// Connector that parks the outbound half so tests can inspect the queue.
    #[derive(Default, Clone)]
    struct ParkingConnector {
        connects: Arc<AtomicUsize>,
        parked: Arc<Mutex<Vec<Outbound>>>,
        refuse: Arc<AtomicBool>,
    }

    impl Connector for ParkingConnector {
        fn connect(
            &self,
            node: &str,
            _tracker: Arc<RequestTracker>,
            queue_depth: usize,
        ) -> impl Future<Output = Result<Connection>> + Send {
            let node = node.to_string();
            let this = self.clone();
            async move {
                if this.refuse.load(Ordering::SeqCst) {
                    return Err(Error::unavailable(node, "connection refused"));
                }
                this.connects.fetch_add(1, Ordering::SeqCst);
                let (conn, outbound) = Connection::new(&node, queue_depth);
                this.parked.lock().unwrap().push(outbound);
                Ok(conn)
            }
        }
    }

    fn pool(connector: ParkingConnector, config: PoolConfig) -> ConnectionPool<ParkingConnector> {
        let tracker = Arc::new(RequestTracker::new(Arc::new(ClientMetrics::new())));
        ConnectionPool::new(connector, tracker, config)
    }

    fn msg() -> Message {
        Message::new(Op::Read, b"cf", Some(b"k"), None)
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let connector = ParkingConnector::default();
        let pool = pool(connector.clone(), PoolConfig::default());

        let lease = pool.acquire("n1").await.unwrap();
        assert!(pool.is_writable(&lease));
        pool.release(lease);
        assert_eq!(pool.idle_connections("n1"), 1);

        let _lease = pool.acquire("n1").await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_connections("n1"), 0);
    }

    #[tokio::test]
    async fn test_full_queue_is_not_writable() {
        let config = PoolConfig {
            send_queue_depth: 1,
            ..PoolConfig::default()
        };
        let pool = pool(ParkingConnector::default(), config);

        let lease = pool.acquire("n1").await.unwrap();
        lease.send(msg()).unwrap();
        assert!(!pool.is_writable(&lease));
        assert!(matches!(
            lease.send(msg()),
            Err(Error::NodeUnavailable { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_fails_after_bounded_wait() {
        let config = PoolConfig {
            max_connections_per_node: 1,
            ..PoolConfig::default()
        };
        let pool = pool(ParkingConnector::default(), config);

        let _held = pool.acquire("n1").await.unwrap();
        let err = pool.acquire("n1").await.unwrap_err();
        assert!(matches!(err, Error::NodeUnavailable { ref reason, .. } if reason == "pool exhausted"));
    }

    #[tokio::test]
    async fn test_unreachable_node() {
        let connector = ParkingConnector::default();
        connector.refuse.store(true, Ordering::SeqCst);
        let config = PoolConfig {
            max_connections_per_node: 1,
            ..PoolConfig::default()
        };
        let pool = pool(connector, config);

        for _ in 0..2 {
            // A failed connect gives its permit back, so this never reports exhaustion.
            let err = pool.acquire("n1").await.unwrap_err();
            assert!(matches!(err, Error::NodeUnavailable { ref reason, .. } if reason == "connection refused"));
        }
    }

    #[tokio::test]
    async fn test_dead_connection_not_reused() {
        let connector = ParkingConnector::default();
        let pool = pool(connector.clone(), PoolConfig::default());

        let lease = pool.acquire("n1").await.unwrap();
        drop(lease);
        connector.parked.lock().unwrap().clear();

        let lease = pool.acquire("n1").await.unwrap();
        assert!(lease.is_writable());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retain_and_drain() {
        let pool = pool(ParkingConnector::default(), PoolConfig::default());
        drop(pool.acquire("n1").await.unwrap());
        drop(pool.acquire("n2").await.unwrap());

        pool.retain_nodes(&["n2".to_string()]);
        assert_eq!(pool.idle_connections("n1"), 0);
        assert_eq!(pool.idle_connections("n2"), 1);

        pool.drain();
        assert_eq!(pool.idle_connections("n2"), 0);
        assert!(pool.acquire("n2").await.is_err());
    }

    #[tokio::test]
    async fn test_outbound_drains_in_order() {
        let (conn, mut outbound) = Connection::new("n1", 4);
        let first = msg();
        let second = msg();
        conn.send(first.clone()).unwrap();
        conn.send(second.clone()).unwrap();

        assert_eq!(outbound.recv().await, Some(first));
        assert_eq!(outbound.try_recv(), Some(second));
        assert_eq!(outbound.try_recv(), None);

        drop(outbound);
        assert!(!conn.is_alive());
    }
}
