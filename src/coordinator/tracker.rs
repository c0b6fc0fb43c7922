//! Request tracker
//!
//! Correlates outbound requests with inbound responses. Every registered id
//! resolves exactly once: by a matching response, by its deadline timer, by
//! being superseded, or by the tracker closing. Whichever path removes the
//! entry from the map first wins; later arrivals find nothing and are dropped.

use crate::common::{ClientMetrics, Error, Response, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use uuid::Uuid;

struct PendingRequest {
    node: String,
    issued_at: Instant,
    slot: oneshot::Sender<Result<Response>>,
    timer: AbortHandle,
}

pub struct RequestTracker {
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
    metrics: Arc<ClientMetrics>,
    closed: AtomicBool,
}

impl RequestTracker {
    pub fn new(metrics: Arc<ClientMetrics>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            metrics,
            closed: AtomicBool::new(false),
        }
    }

    /// Register `id` and arm its deadline timer. Must run inside a tokio runtime.
    pub fn register(
        self: &Arc<Self>,
        id: Uuid,
        node: &str,
        timeout: Duration,
    ) -> Result<PendingResponse> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::unavailable(node, "request tracker closed"));
        }
        if pending.contains_key(&id) {
            return Err(Error::InvalidArgument(format!(
                "correlation id {} already registered",
                id
            )));
        }

        let (slot, rx) = oneshot::channel();
        let tracker: Weak<Self> = Arc::downgrade(self);
        // The timer cannot observe the map before this lock is released.
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tracker) = tracker.upgrade() {
                tracker.expire(id);
            }
        })
        .abort_handle();

        pending.insert(
            id,
            PendingRequest {
                node: node.to_string(),
                issued_at: Instant::now(),
                slot,
                timer,
            },
        );
        self.metrics.pending_requests.add(1);

        Ok(PendingResponse {
            id,
            node: node.to_string(),
            rx,
            tracker: self.clone(),
            finished: false,
        })
    }

    fn take(&self, id: &Uuid) -> Option<PendingRequest> {
        let entry = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if entry.is_some() {
            self.metrics.pending_requests.sub(1);
        }
        entry
    }

    /// Deliver an inbound response. Returns false if the id was unknown,
    /// already resolved, expired or superseded; such responses are dropped.
    pub fn resolve(&self, response: Response) -> bool {
        let id = response.id;
        match self.take(&id) {
            Some(request) => {
                request.timer.abort();
                self.metrics
                    .response_latency
                    .observe_duration(request.issued_at.elapsed());
                self.metrics.responses_resolved.inc();
                tracing::trace!(%id, node = %request.node, "response resolved");
                let _ = request.slot.send(Ok(response));
                true
            }
            None => {
                self.metrics.responses_dropped.inc();
                tracing::trace!(%id, "dropping response for unknown request");
                false
            }
        }
    }

    /// Resolve `id` as timed out. Fired by the deadline timer.
    pub fn expire(&self, id: Uuid) -> bool {
        match self.take(&id) {
            Some(request) => {
                self.metrics.requests_timed_out.inc();
                tracing::debug!(%id, node = %request.node, "request timed out");
                let _ = request.slot.send(Err(Error::RequestTimeout {
                    node: request.node,
                    id,
                }));
                true
            }
            None => false,
        }
    }

    /// Resolve `id` as superseded by a faster sibling.
    pub fn discard(&self, id: Uuid) -> bool {
        match self.take(&id) {
            Some(request) => {
                request.timer.abort();
                self.metrics.requests_superseded.inc();
                tracing::trace!(%id, node = %request.node, "request superseded");
                let _ = request.slot.send(Err(Error::Superseded));
                true
            }
            None => false,
        }
    }

    /// Resolve `id` with `error`. Used when the message could not be put on
    /// the wire at all.
    pub fn fail(&self, id: Uuid, error: Error) -> bool {
        match self.take(&id) {
            Some(request) => {
                request.timer.abort();
                tracing::debug!(%id, node = %request.node, "request failed: {}", error);
                let _ = request.slot.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Remove `id` without counting it anywhere (the send never happened).
    fn forget(&self, id: Uuid) {
        if let Some(request) = self.take(&id) {
            request.timer.abort();
        }
    }

    /// Fail every pending request and refuse new registrations.
    pub fn close(&self) {
        let drained: Vec<(Uuid, PendingRequest)> = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            self.closed.store(true, Ordering::Release);
            pending.drain().collect()
        };
        self.metrics.pending_requests.sub(drained.len() as u64);
        if !drained.is_empty() {
            tracing::info!("Request tracker closing with {} pending requests", drained.len());
        }
        for (_, request) in drained {
            request.timer.abort();
            let _ = request.slot.send(Err(Error::unavailable(
                request.node,
                "request tracker closed",
            )));
        }
    }

    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_pending(&self, id: &Uuid) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }
}

/// Placeholder for one registered request.
///
/// Dropping it before it resolves marks the request superseded, so a late
/// response is discarded.
pub struct PendingResponse {
    id: Uuid,
    node: String,
    rx: oneshot::Receiver<Result<Response>>,
    tracker: Arc<RequestTracker>,
    finished: bool,
}

impl PendingResponse {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Wait for the request to resolve.
    pub async fn wait(mut self) -> Result<Response> {
        let outcome = (&mut self.rx).await;
        self.finished = true;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::unavailable(
                self.node.clone(),
                "request dropped by tracker",
            )),
        }
    }

    /// Withdraw a request whose message could not be sent.
    pub(crate) fn abandon(mut self) {
        self.finished = true;
        self.tracker.forget(self.id);
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if !self.finished {
            self.tracker.discard(self.id);
        }
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("id", &self.id)
            .field("node", &self.node)
            .finish()
    }
}
