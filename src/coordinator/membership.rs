//! Cluster membership
//!
//! `Registry` stands in for the coordination service: nodes register an
//! ephemeral entry under a well-known path and the entry disappears when the
//! registration is dropped. `MembershipView` is the coordinator's cached,
//! watch-updated list of live node addresses.

use crate::common::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

struct PathEntry {
    /// member -> session that currently owns the entry
    members: BTreeMap<String, u64>,
    tx: watch::Sender<Vec<String>>,
}

impl PathEntry {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self {
            members: BTreeMap::new(),
            tx,
        }
    }

    fn publish(&self) {
        self.tx.send_replace(self.members.keys().cloned().collect());
    }
}

#[derive(Default)]
struct RegistryInner {
    paths: Mutex<HashMap<String, PathEntry>>,
    next_session: AtomicU64,
}

/// In-process coordination service with ephemeral entries and watches
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `member` under `path` until the returned guard is dropped.
    ///
    /// Registering an existing member takes the entry over; dropping the
    /// older guard then leaves it in place.
    pub fn register(&self, path: &str, member: impl Into<String>) -> EphemeralNode {
        let member = member.into();
        let session = self.inner.next_session.fetch_add(1, Ordering::Relaxed);

        let mut paths = self.inner.paths.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = paths.entry(path.to_string()).or_insert_with(PathEntry::new);
        entry.members.insert(member.clone(), session);
        entry.publish();
        tracing::info!("Registered {} under {}", member, path);

        EphemeralNode {
            registry: self.clone(),
            path: path.to_string(),
            member,
            session,
        }
    }

    fn unregister(&self, path: &str, member: &str, session: u64) {
        let mut paths = self.inner.paths.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = paths.get_mut(path) {
            if entry.members.get(member) == Some(&session) {
                entry.members.remove(member);
                entry.publish();
                tracing::info!("Ephemeral entry {} under {} removed", member, path);
            }
        }
    }

    /// Current members under `path`, sorted.
    pub fn children(&self, path: &str) -> Vec<String> {
        let paths = self.inner.paths.lock().unwrap_or_else(PoisonError::into_inner);
        paths
            .get(path)
            .map(|entry| entry.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Subscribe to membership changes under `path`.
    pub fn watch(&self, path: &str) -> watch::Receiver<Vec<String>> {
        let mut paths = self.inner.paths.lock().unwrap_or_else(PoisonError::into_inner);
        paths
            .entry(path.to_string())
            .or_insert_with(PathEntry::new)
            .tx
            .subscribe()
    }
}

/// Registration guard; the entry is removed when this is dropped.
pub struct EphemeralNode {
    registry: Registry,
    path: String,
    member: String,
    session: u64,
}

impl EphemeralNode {
    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for EphemeralNode {
    fn drop(&mut self) {
        self.registry
            .unregister(&self.path, &self.member, self.session);
    }
}

impl std::fmt::Debug for EphemeralNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralNode")
            .field("path", &self.path)
            .field("member", &self.member)
            .finish()
    }
}

/// Cached list of live node addresses, refreshed on change notifications
#[derive(Clone)]
pub struct MembershipView {
    rx: watch::Receiver<Vec<String>>,
    // Keeps a fixed view's channel open.
    _fixed: Option<Arc<watch::Sender<Vec<String>>>>,
}

impl MembershipView {
    /// Follow the members registered under `path`.
    pub fn watch(registry: &Registry, path: &str) -> Self {
        Self {
            rx: registry.watch(path),
            _fixed: None,
        }
    }

    /// A view that never changes. Duplicate addresses are dropped.
    pub fn fixed<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for node in nodes {
            let node = node.into();
            if !unique.contains(&node) {
                unique.push(node);
            }
        }
        let (tx, rx) = watch::channel(unique);
        Self {
            rx,
            _fixed: Some(Arc::new(tx)),
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.rx.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.rx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.borrow().is_empty()
    }

    /// Wait for the next membership change and return the new member list.
    pub async fn changed(&mut self) -> Result<Vec<String>> {
        self.rx
            .changed()
            .await
            .map_err(|_| Error::Internal("membership source closed".into()))?;
        Ok(self.rx.borrow_and_update().clone())
    }
}

impl std::fmt::Debug for MembershipView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipView")
            .field("members", &*self.rx.borrow())
            .finish()
    }
}
