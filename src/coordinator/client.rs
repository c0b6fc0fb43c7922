//! Replication coordinator
//!
//! `ReplicationClient` owns the coordinator context: replica selector,
//! connection pool, request tracker, metrics and append buffers. It is built
//! once at startup (subscribing to membership changes) and torn down by
//! `close`.
//!
//! Writes and deletes fan out to every replica and report one slot per
//! replica. Reads and streams go to the primary and are hedged to the backup
//! after a short delay; the first resolution wins and the loser is dropped.
//! Nothing here retries and nothing judges a quorum; callers decide what
//! number of acknowledgements is enough.

use crate::common::{
    display_bytes, validate_column_family, validate_key, validate_value, ClientConfig,
    ClientMetrics, Error, Message, Op, Record, RecordStream, Response, Result, Status, DELIMITER,
    MAX_VALUE_LEN,
};
use crate::coordinator::membership::MembershipView;
use crate::coordinator::placement::{ReplicaSelector, ReplicaSet};
use crate::coordinator::pool::{ConnectionPool, Connector};
use crate::coordinator::tracker::{PendingResponse, RequestTracker};
use crate::coordinator::transport::TcpConnector;
use bytes::{Bytes, BytesMut};
use futures_util::future::join_all;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::task::JoinHandle;

/// Per-replica outcome of a write-style fan-out.
///
/// Always exactly R slots, in replica order. A slot is `None` when that
/// replica failed, timed out, could not be reached, or did not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaAcks {
    slots: Vec<Option<Bytes>>,
}

impl ReplicaAcks {
    pub fn slots(&self) -> &[Option<Bytes>] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of replicas that acknowledged
    pub fn acknowledged(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn into_slots(self) -> Vec<Option<Bytes>> {
        self.slots
    }
}

/// Result of a buffered time-series append
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendAck {
    /// Held locally; nothing was sent.
    Buffered { pending_bytes: usize },
    /// The buffer crossed the threshold and was written to the replicas.
    Flushed(ReplicaAcks),
}

impl AppendAck {
    pub fn is_flushed(&self) -> bool {
        matches!(self, AppendAck::Flushed(_))
    }
}

/// Records from every member that answered, concatenated in view order.
///
/// Members whose stream failed are left out; `dropped` says how many.
#[derive(Debug, Default)]
pub struct AggregatedStream {
    parts: VecDeque<RecordStream>,
    contributors: usize,
    dropped: usize,
}

impl AggregatedStream {
    /// Members whose records are included (possibly none)
    pub fn contributors(&self) -> usize {
        self.contributors
    }

    /// Members whose stream failed and was left out
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl Iterator for AggregatedStream {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        while let Some(part) = self.parts.front_mut() {
            if let Some(record) = part.next() {
                return Some(record);
            }
            self.parts.pop_front();
        }
        None
    }
}

pub struct ReplicationClient<C: Connector = TcpConnector> {
    config: ClientConfig,
    selector: ReplicaSelector,
    pool: Arc<ConnectionPool<C>>,
    tracker: Arc<RequestTracker>,
    metrics: Arc<ClientMetrics>,
    append_buffers: Mutex<HashMap<Vec<u8>, BytesMut>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> ReplicationClient<C> {
    /// Build the coordinator context. Must be called from within a tokio
    /// runtime; the membership watcher runs on it until `close`.
    pub fn new(config: ClientConfig, view: MembershipView, connector: C) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Internal("ReplicationClient requires a tokio runtime".into()))?;

        let metrics = Arc::new(ClientMetrics::new());
        let tracker = Arc::new(RequestTracker::new(metrics.clone()));
        let pool = Arc::new(ConnectionPool::new(
            connector,
            tracker.clone(),
            config.pool.clone(),
        ));
        let watcher = runtime.spawn(watch_membership(view.clone(), Arc::downgrade(&pool)));

        tracing::info!(
            "Replication client ready: R={}, {} live nodes, hedge after {}ms, timeout {}ms",
            config.replicas,
            view.len(),
            config.hedge_delay_ms,
            config.request_timeout_ms
        );

        Ok(Self {
            selector: ReplicaSelector::new(view, config.virtual_nodes),
            config,
            pool,
            tracker,
            metrics,
            append_buffers: Mutex::new(HashMap::new()),
            watcher: Mutex::new(Some(watcher)),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    /// Current membership view snapshot
    pub fn members(&self) -> Vec<String> {
        self.selector.view().snapshot()
    }

    pub fn replicas_for(&self, routing_key: &[u8]) -> ReplicaSet {
        self.selector.select(routing_key, self.config.replicas)
    }

    /// Requests registered and not yet resolved
    pub fn pending_requests(&self) -> usize {
        self.tracker.pending()
    }

    // ------------------------------------------------------------------
    // Write-style fan-out
    // ------------------------------------------------------------------

    pub async fn write(&self, col_fam: &[u8], key: &[u8], value: &[u8]) -> Result<ReplicaAcks> {
        validate_column_family(col_fam)?;
        validate_key(key)?;
        validate_value(value)?;

        let replicas = self.replicas_for(col_fam);
        tracing::debug!(
            "WRITE {}/{} to {:?}",
            display_bytes(col_fam),
            display_bytes(key),
            replicas.as_slice()
        );
        Ok(self
            .fan_out(&replicas, || {
                Message::new(Op::Write, col_fam, Some(key), Some(value))
            })
            .await)
    }

    /// Write into the default column family.
    pub async fn write_default(&self, key: &[u8], value: &[u8]) -> Result<ReplicaAcks> {
        let col_fam = self.config.default_column_family.clone();
        self.write(col_fam.as_bytes(), key, value).await
    }

    pub async fn delete(&self, col_fam: &[u8], key: &[u8]) -> Result<ReplicaAcks> {
        validate_column_family(col_fam)?;
        validate_key(key)?;

        let replicas = self.replicas_for(col_fam);
        Ok(self
            .fan_out(&replicas, || Message::new(Op::Delete, col_fam, Some(key), None))
            .await)
    }

    pub async fn delete_default(&self, key: &[u8]) -> Result<ReplicaAcks> {
        let col_fam = self.config.default_column_family.clone();
        self.delete(col_fam.as_bytes(), key).await
    }

    /// Drop an entire column family on its replicas.
    pub async fn delete_column_family(&self, col_fam: &[u8]) -> Result<ReplicaAcks> {
        validate_column_family(col_fam)?;

        let replicas = self.replicas_for(col_fam);
        tracing::info!(
            "Dropping column family {} on {:?}",
            display_bytes(col_fam),
            replicas.as_slice()
        );
        Ok(self
            .fan_out(&replicas, || Message::new(Op::DeleteColFam, col_fam, None, None))
            .await)
    }

    // ------------------------------------------------------------------
    // Hedged reads
    // ------------------------------------------------------------------

    /// Read one key. `Ok(None)` means the replica that answered first had no
    /// such key.
    pub async fn read(&self, col_fam: &[u8], key: &[u8]) -> Result<Option<Bytes>> {
        validate_column_family(col_fam)?;
        validate_key(key)?;

        let replicas = self.replicas_for(col_fam);
        let response = self
            .hedged(&replicas, || Message::new(Op::Read, col_fam, Some(key), None))
            .await?;
        Ok(match response.status {
            Status::Ok => response.payload.map(Bytes::from),
            _ => None,
        })
    }

    pub async fn read_default(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let col_fam = self.config.default_column_family.clone();
        self.read(col_fam.as_bytes(), key).await
    }

    /// Stream a column family from `offset` (or the start) off one replica.
    pub async fn stream(&self, col_fam: &[u8], offset: Option<&[u8]>) -> Result<RecordStream> {
        validate_column_family(col_fam)?;

        let replicas = self.replicas_for(col_fam);
        let response = self
            .hedged(&replicas, || Message::new(Op::Stream, col_fam, None, offset))
            .await?;
        Ok(match (response.status, response.payload) {
            (Status::Ok, Some(payload)) => RecordStream::new(payload),
            _ => RecordStream::empty(),
        })
    }

    /// Stream `col_fam` (or the default family) from every live member.
    ///
    /// Best effort: members that fail are left out of the result without an
    /// error. The number left out is reported in the result and counted in
    /// the metrics.
    pub async fn aggregated_stream(
        &self,
        col_fam: Option<&[u8]>,
        offset: Option<&[u8]>,
    ) -> Result<AggregatedStream> {
        let col_fam = match col_fam {
            Some(col_fam) => col_fam.to_vec(),
            None => self.config.default_column_family.as_bytes().to_vec(),
        };
        validate_column_family(&col_fam)?;

        let members = self.members();
        let outcomes = join_all(members.iter().map(|node| {
            let msg = Message::new(Op::Stream, &col_fam, None, offset);
            self.request(node, msg)
        }))
        .await;

        let mut aggregated = AggregatedStream::default();
        for (node, outcome) in members.iter().zip(outcomes) {
            match outcome {
                Ok(response) if response.status == Status::Ok => {
                    aggregated.contributors += 1;
                    if let Some(payload) = response.payload {
                        aggregated.parts.push_back(RecordStream::new(payload));
                    }
                }
                Ok(response) if response.status == Status::NotFound => {
                    aggregated.contributors += 1;
                }
                Ok(response) => {
                    self.drop_member(&mut aggregated, node, &node_error(response));
                }
                Err(e) => self.drop_member(&mut aggregated, node, &e),
            }
        }
        Ok(aggregated)
    }

    fn drop_member(&self, aggregated: &mut AggregatedStream, node: &str, error: &Error) {
        aggregated.dropped += 1;
        self.metrics.aggregate_members_dropped.inc();
        tracing::warn!("Aggregated stream dropped {}: {}", node, error);
    }

    // ------------------------------------------------------------------
    // Buffered time-series append
    // ------------------------------------------------------------------

    /// Buffer `value` for `key`. Once the key's buffer reaches the flush
    /// threshold the whole buffer is written as one delimited blob, routed
    /// by `col_fam` when given and by `key` otherwise.
    pub async fn append(
        &self,
        key: &[u8],
        value: &[u8],
        col_fam: Option<&[u8]>,
    ) -> Result<AppendAck> {
        validate_key(key)?;
        validate_value(value)?;
        if let Some(col_fam) = col_fam {
            validate_column_family(col_fam)?;
        }

        let blob = {
            let mut buffers = self
                .append_buffers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let held = buffers.get(key).map_or(0, BytesMut::len);
            if held + value.len() + DELIMITER.len() > MAX_VALUE_LEN {
                return Err(Error::InvalidArgument(format!(
                    "append to {} would exceed {} buffered bytes",
                    display_bytes(key),
                    MAX_VALUE_LEN
                )));
            }
            let buffer = buffers.entry(key.to_vec()).or_default();
            buffer.extend_from_slice(value);
            buffer.extend_from_slice(DELIMITER);
            self.metrics
                .append_buffered_bytes
                .add((value.len() + DELIMITER.len()) as u64);

            if buffer.len() < self.config.append_flush_threshold {
                return Ok(AppendAck::Buffered {
                    pending_bytes: buffer.len(),
                });
            }
            let blob = buffers.remove(key).unwrap_or_default().freeze();
            self.metrics.append_buffered_bytes.sub(blob.len() as u64);
            blob
        };

        self.metrics.append_flushes.inc();
        let (routing_key, msg_key) = match col_fam {
            Some(col_fam) => (col_fam, Some(key)),
            None => (key, None),
        };
        tracing::debug!(
            "Flushing {} buffered bytes for {}",
            blob.len(),
            display_bytes(key)
        );

        let replicas = self.replicas_for(routing_key);
        let acks = self
            .fan_out(&replicas, || {
                Message::new(Op::TsWrite, routing_key, msg_key, Some(&blob[..]))
            })
            .await;
        Ok(AppendAck::Flushed(acks))
    }

    /// Bytes buffered for `key` and not yet flushed
    pub fn pending_append_bytes(&self, key: &[u8]) -> usize {
        self.append_buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(BytesMut::len)
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Unsubscribe from membership, drain the pool and fail pending requests.
    ///
    /// Buffered appends that never reached the threshold are discarded.
    pub fn close(&self) {
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }

        let discarded: usize = {
            let mut buffers = self
                .append_buffers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let total = buffers.values().map(BytesMut::len).sum();
            buffers.clear();
            // The gauge tracks the buffers, so both change under one lock.
            self.metrics.append_buffered_bytes.set(0);
            total
        };
        if discarded > 0 {
            tracing::warn!("Discarding {} unflushed append bytes on close", discarded);
        }

        self.pool.drain();
        self.tracker.close();
        tracing::info!("Replication client closed");
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Lease a connection, register the id and queue the message.
    async fn dispatch(&self, node: &str, msg: Message) -> Result<PendingResponse> {
        let lease = self.pool.acquire(node).await?;
        if !self.pool.is_writable(&lease) {
            self.pool.release(lease);
            return Err(Error::unavailable(node, "connection not writable"));
        }

        let (id, op) = (msg.id, msg.op);
        let pending = match self
            .tracker
            .register(id, node, self.config.request_timeout())
        {
            Ok(pending) => pending,
            Err(e) => {
                self.pool.release(lease);
                return Err(e);
            }
        };

        let sent = lease.send(msg);
        self.pool.release(lease);
        match sent {
            Ok(()) => {
                self.metrics.requests_sent.inc();
                tracing::debug!("Sent {} {} to {}", op, id, node);
                Ok(pending)
            }
            Err(e) => {
                pending.abandon();
                Err(e)
            }
        }
    }

    /// Send one message and wait for its resolution.
    async fn request(&self, node: &str, msg: Message) -> Result<Response> {
        self.dispatch(node, msg).await?.wait().await
    }

    /// One replica's slot of a fan-out.
    async fn attempt(&self, node: &str, msg: Message) -> Option<Bytes> {
        let op = msg.op;
        match self.request(node, msg).await {
            Ok(response) => match response.status {
                Status::Ok => Some(Bytes::from(response.payload.unwrap_or_default())),
                Status::NotFound => None,
                Status::Error => {
                    self.replica_failed(op, node, &node_error(response));
                    None
                }
            },
            Err(e) => {
                self.replica_failed(op, node, &e);
                None
            }
        }
    }

    fn replica_failed(&self, op: Op, node: &str, error: &Error) {
        self.metrics.replica_failures.inc();
        tracing::warn!("{} on {} failed: {}", op, node, error);
    }

    /// Send to every replica in parallel and collect exactly R slots.
    async fn fan_out<F>(&self, replicas: &ReplicaSet, build: F) -> ReplicaAcks
    where
        F: Fn() -> Message,
    {
        let attempts = replicas.iter().map(|node| self.attempt(node, build()));
        let mut slots = join_all(attempts).await;
        slots.resize(self.config.replicas, None);
        ReplicaAcks { slots }
    }

    /// Primary first, backup after the hedge delay; first resolution wins.
    ///
    /// At most two nodes are contacted. The delay runs from the start of the
    /// read and each attempt races whole, dial included, so a slow connect on
    /// either side never holds back an answer from the other. If the primary
    /// fails outright the backup is tried at once instead of waiting out the
    /// delay.
    async fn hedged<F>(&self, replicas: &ReplicaSet, build: F) -> Result<Response>
    where
        F: Fn() -> Message,
    {
        let primary = replicas
            .primary()
            .ok_or_else(|| Error::unavailable("cluster", "no live replicas"))?;
        let mut backup = replicas.backup();

        let hedge = tokio::time::sleep(self.config.hedge_delay());
        tokio::pin!(hedge);

        let first = build();
        let op = first.op;
        let mut racing = FuturesUnordered::new();
        racing.push(self.race(primary, first));

        loop {
            tokio::select! {
                Some((node, outcome)) = racing.next() => {
                    let error = match outcome {
                        // Returning drops the sibling, which marks it superseded.
                        Ok(response) if response.is_resolved() => return Ok(response),
                        Ok(response) => node_error(response),
                        Err(e) => e,
                    };
                    self.replica_failed(op, node, &error);
                    if racing.is_empty() {
                        let Some(next) = backup.take() else {
                            return Err(error);
                        };
                        self.metrics.hedges_sent.inc();
                        tracing::debug!("{} failing over from {} to {}", op, node, next);
                        racing.push(self.race(next, build()));
                    }
                },
                () = &mut hedge, if backup.is_some() => {
                    if let Some(next) = backup.take() {
                        self.metrics.hedges_sent.inc();
                        tracing::debug!("{} hedging to {} after {}ms", op, next, self.config.hedge_delay_ms);
                        racing.push(self.race(next, build()));
                    }
                },
            }
        }
    }

    /// One hedged attempt, tagged with the node it went to.
    async fn race<'a>(&self, node: &'a str, msg: Message) -> (&'a str, Result<Response>) {
        (node, self.request(node, msg).await)
    }
}

impl<C: Connector> Drop for ReplicationClient<C> {
    fn drop(&mut self) {
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
    }
}

fn node_error(response: Response) -> Error {
    Error::Storage(
        response
            .error
            .unwrap_or_else(|| "node reported an error".to_string()),
    )
}

async fn watch_membership<C: Connector>(mut view: MembershipView, pool: Weak<ConnectionPool<C>>) {
    loop {
        let members = match view.changed().await {
            Ok(members) => members,
            Err(e) => {
                tracing::debug!("Membership watch ended: {}", e);
                return;
            }
        };
        tracing::info!("Membership changed: {} live nodes {:?}", members.len(), members);
        match pool.upgrade() {
            Some(pool) => pool.retain_nodes(&members),
            None => return,
        }
    }
}
