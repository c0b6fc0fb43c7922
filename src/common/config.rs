//! Configuration for ringkv components
//!
//! Values come from an optional TOML file, then `RINGKV__*` environment
//! variables (`RINGKV__CLIENT__REPLICAS=5`), then CLI flags in the binaries.

use crate::common::{Error, Result, MAX_VALUE_LEN};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Client / coordinator settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Storage node settings
    #[serde(default)]
    pub node: NodeConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    "ringkv-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            client: ClientConfig::default(),
            node: NodeConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from `path` (or `./ringkv.toml` if present) and the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("ringkv").required(false)),
        };
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("RINGKV")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.client.validate()?;
        Ok(config)
    }
}

/// Replication coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Replication factor (R)
    pub replicas: usize,

    /// Deadline for every individual replica request
    pub request_timeout_ms: u64,

    /// Delay before a read/stream is hedged to the backup replica
    pub hedge_delay_ms: u64,

    /// Buffered append size (bytes) at which a key's buffer is flushed
    pub append_flush_threshold: usize,

    /// Column family used when the caller omits one
    pub default_column_family: String,

    /// Registry path under which live nodes announce themselves
    pub membership_path: String,

    /// Ring tokens per physical node
    pub virtual_nodes: usize,

    pub pool: PoolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            replicas: 3,
            request_timeout_ms: 1000,
            hedge_delay_ms: 2,
            append_flush_threshold: 10_000,
            default_column_family: "default".to_string(),
            membership_path: "/ringkv/nodes".to_string(),
            virtual_nodes: 64,
            pool: PoolConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn hedge_delay(&self) -> Duration {
        Duration::from_millis(self.hedge_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.replicas == 0 {
            return Err(Error::InvalidConfig("replicas must be at least 1".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "request_timeout_ms must be positive".into(),
            ));
        }
        if self.append_flush_threshold == 0 || self.append_flush_threshold > MAX_VALUE_LEN {
            return Err(Error::InvalidConfig(format!(
                "append_flush_threshold must be between 1 and {}",
                MAX_VALUE_LEN
            )));
        }
        if self.default_column_family.is_empty() {
            return Err(Error::InvalidConfig(
                "default_column_family cannot be empty".into(),
            ));
        }
        if self.virtual_nodes == 0 {
            return Err(Error::InvalidConfig("virtual_nodes must be at least 1".into()));
        }
        self.pool.validate()
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum concurrently leased connections per node
    pub max_connections_per_node: usize,

    /// Bounded wait for a free lease before the node counts as unavailable
    pub acquire_timeout_ms: u64,

    /// Dial timeout for new connections
    pub connect_timeout_ms: u64,

    /// Outbound queue depth per connection; a full queue is not writable
    pub send_queue_depth: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_node: 4,
            acquire_timeout_ms: 100,
            connect_timeout_ms: 500,
            send_queue_depth: 1024,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_connections_per_node == 0 || self.send_queue_depth == 0 {
            return Err(Error::InvalidConfig(
                "pool sizes must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Rocksdb,
}

/// Storage node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Bind address for the node protocol
    pub bind_addr: SocketAddr,

    pub backend: StorageBackend,

    /// RocksDB directory (rocksdb backend only)
    pub data_path: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 12000)),
            backend: StorageBackend::Memory,
            data_path: PathBuf::from("./node-data"),
        }
    }
}
