//! Storage engines for a node
//!
//! `StorageProvider` is the capability set a node exposes to the coordinator.
//! `MemStorage` keeps ordered maps in memory; `RocksStorage` maps every
//! logical column family onto a RocksDB column family.

use crate::common::message::split_delimited;
use crate::common::utils::timestamp_now_nanos;
use crate::common::{Error, NodeConfig, Result, StorageBackend};
use rocksdb::{
    BoundColumnFamily, DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Ordered (key, value) pairs from one column family
pub type Records = Vec<(Vec<u8>, Vec<u8>)>;

pub trait StorageProvider: Send + Sync {
    fn write(&self, col_fam: &[u8], key: &[u8], value: &[u8]) -> Result<bool>;

    fn read(&self, col_fam: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Returns whether the key existed.
    fn delete(&self, col_fam: &[u8], key: &[u8]) -> Result<bool>;

    /// Returns whether the family existed.
    fn delete_column_family(&self, col_fam: &[u8]) -> Result<bool>;

    /// Store `value` under a freshly generated, monotonically increasing
    /// token and return the token.
    fn ts_write(&self, col_fam: &[u8], value: &[u8]) -> Result<Vec<u8>>;

    /// Split a delimited blob and `ts_write` each non-empty value in order.
    /// Returns the token of the last value.
    fn batch_write(&self, col_fam: &[u8], blob: &[u8]) -> Result<Vec<u8>> {
        let mut last = None;
        for value in split_delimited(blob) {
            last = Some(self.ts_write(col_fam, value)?);
        }
        last.ok_or_else(|| Error::InvalidArgument("batch contains no values".into()))
    }

    /// Records from `offset` (inclusive, or the start) to the end, in key
    /// order. `None` if the family does not exist.
    fn stream(&self, col_fam: &[u8], offset: Option<&[u8]>) -> Result<Option<Records>>;

    fn column_family_exists(&self, col_fam: &[u8]) -> bool;

    fn list_column_families(&self) -> Vec<Vec<u8>>;
}

/// Open the backend named in the node configuration.
pub fn open_storage(config: &NodeConfig) -> Result<Arc<dyn StorageProvider>> {
    match config.backend {
        StorageBackend::Memory => {
            tracing::info!("Using in-memory storage");
            Ok(Arc::new(MemStorage::new()))
        }
        StorageBackend::Rocksdb => {
            tracing::info!("Using RocksDB storage at {}", config.data_path.display());
            Ok(Arc::new(RocksStorage::open(&config.data_path)?))
        }
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Default)]
pub struct MemStorage {
    families: RwLock<HashMap<Vec<u8>, BTreeMap<Vec<u8>, Vec<u8>>>>,
    next_token: AtomicU64,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn families_mut(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<Vec<u8>, BTreeMap<Vec<u8>, Vec<u8>>>> {
        self.families.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn families(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<Vec<u8>, BTreeMap<Vec<u8>, Vec<u8>>>> {
        self.families.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of keys in `col_fam`
    pub fn len(&self, col_fam: &[u8]) -> usize {
        self.families().get(col_fam).map(BTreeMap::len).unwrap_or(0)
    }
}

impl StorageProvider for MemStorage {
    fn write(&self, col_fam: &[u8], key: &[u8], value: &[u8]) -> Result<bool> {
        self.families_mut()
            .entry(col_fam.to_vec())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(true)
    }

    fn read(&self, col_fam: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .families()
            .get(col_fam)
            .and_then(|family| family.get(key).cloned()))
    }

    fn delete(&self, col_fam: &[u8], key: &[u8]) -> Result<bool> {
        Ok(self
            .families_mut()
            .get_mut(col_fam)
            .and_then(|family| family.remove(key))
            .is_some())
    }

    fn delete_column_family(&self, col_fam: &[u8]) -> Result<bool> {
        Ok(self.families_mut().remove(col_fam).is_some())
    }

    fn ts_write(&self, col_fam: &[u8], value: &[u8]) -> Result<Vec<u8>> {
        let mut families = self.families_mut();
        // Taken under the lock so token order matches insertion order.
        let token = self.next_token.fetch_add(1, Ordering::Relaxed).to_be_bytes().to_vec();
        families
            .entry(col_fam.to_vec())
            .or_default()
            .insert(token.clone(), value.to_vec());
        Ok(token)
    }

    fn stream(&self, col_fam: &[u8], offset: Option<&[u8]>) -> Result<Option<Records>> {
        let families = self.families();
        let Some(family) = families.get(col_fam) else {
            return Ok(None);
        };
        let records = match offset {
            Some(offset) => family
                .range(offset.to_vec()..)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => family.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        Ok(Some(records))
    }

    fn column_family_exists(&self, col_fam: &[u8]) -> bool {
        self.families().contains_key(col_fam)
    }

    fn list_column_families(&self) -> Vec<Vec<u8>> {
        let mut names: Vec<Vec<u8>> = self.families().keys().cloned().collect();
        names.sort();
        names
    }
}

// ============================================================================
// RocksDB
// ============================================================================

type Db = DBWithThreadMode<MultiThreaded>;

/// RocksDB-backed storage. Logical family names are hex-encoded into RocksDB
/// column family names so arbitrary bytes are allowed.
pub struct RocksStorage {
    db: Db,
    families: RwLock<BTreeSet<Vec<u8>>>,
    create_lock: Mutex<()>,
    next_token: AtomicU64,
}

impl RocksStorage {
    pub fn open(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let existing = Db::list_cf(&opts, path).unwrap_or_else(|_| vec!["default".to_string()]);
        let db = Db::open_cf(&opts, path, &existing)?;

        let families: BTreeSet<Vec<u8>> = existing
            .iter()
            .filter(|name| name.as_str() != "default")
            .filter_map(|name| hex::decode(name).ok())
            .collect();
        tracing::info!(
            "Opened RocksDB at {} with {} column families",
            path.display(),
            families.len()
        );

        Ok(Self {
            db,
            families: RwLock::new(families),
            create_lock: Mutex::new(()),
            // Seeded from the clock so tokens keep increasing across restarts.
            next_token: AtomicU64::new(timestamp_now_nanos()),
        })
    }

    fn cf_name(col_fam: &[u8]) -> String {
        hex::encode(col_fam)
    }

    fn handle(&self, col_fam: &[u8]) -> Option<Arc<BoundColumnFamily<'_>>> {
        self.db.cf_handle(&Self::cf_name(col_fam))
    }

    fn handle_or_create(&self, col_fam: &[u8]) -> Result<Arc<BoundColumnFamily<'_>>> {
        if let Some(handle) = self.handle(col_fam) {
            return Ok(handle);
        }
        let _guard = self.create_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.handle(col_fam).is_none() {
            self.db.create_cf(Self::cf_name(col_fam), &Options::default())?;
            self.families
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(col_fam.to_vec());
            tracing::debug!("Created column family {}", Self::cf_name(col_fam));
        }
        self.handle(col_fam)
            .ok_or_else(|| Error::Storage("column family vanished after creation".into()))
    }
}

impl StorageProvider for RocksStorage {
    fn write(&self, col_fam: &[u8], key: &[u8], value: &[u8]) -> Result<bool> {
        let handle = self.handle_or_create(col_fam)?;
        self.db.put_cf(&handle, key, value)?;
        Ok(true)
    }

    fn read(&self, col_fam: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.handle(col_fam) {
            Some(handle) => Ok(self.db.get_cf(&handle, key)?),
            None => Ok(None),
        }
    }

    fn delete(&self, col_fam: &[u8], key: &[u8]) -> Result<bool> {
        let Some(handle) = self.handle(col_fam) else {
            return Ok(false);
        };
        let existed = self.db.get_pinned_cf(&handle, key)?.is_some();
        if existed {
            self.db.delete_cf(&handle, key)?;
        }
        Ok(existed)
    }

    fn delete_column_family(&self, col_fam: &[u8]) -> Result<bool> {
        let _guard = self.create_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.handle(col_fam).is_none() {
            return Ok(false);
        }
        self.db.drop_cf(&Self::cf_name(col_fam))?;
        self.families
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(col_fam);
        Ok(true)
    }

    fn ts_write(&self, col_fam: &[u8], value: &[u8]) -> Result<Vec<u8>> {
        let handle = self.handle_or_create(col_fam)?;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed).to_be_bytes().to_vec();
        self.db.put_cf(&handle, &token, value)?;
        Ok(token)
    }

    fn stream(&self, col_fam: &[u8], offset: Option<&[u8]>) -> Result<Option<Records>> {
        let Some(handle) = self.handle(col_fam) else {
            return Ok(None);
        };
        let mode = match offset {
            Some(offset) => IteratorMode::From(offset, Direction::Forward),
            None => IteratorMode::Start,
        };
        let mut records = Vec::new();
        for item in self.db.iterator_cf(&handle, mode) {
            let (key, value) = item?;
            records.push((key.into_vec(), value.into_vec()));
        }
        Ok(Some(records))
    }

    fn column_family_exists(&self, col_fam: &[u8]) -> bool {
        self.handle(col_fam).is_some()
    }

    fn list_column_families(&self) -> Vec<Vec<u8>> {
        self.families
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}
