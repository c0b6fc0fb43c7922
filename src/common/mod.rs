//! Common utilities and types shared across ringkv

pub mod config;
pub mod error;
pub mod hash;
pub mod message;
pub mod metrics;
pub mod utils;

pub use config::{ClientConfig, Config, NodeConfig, PoolConfig, StorageBackend};
pub use error::{Error, Result};
pub use hash::{ring_position, ConsistentHashRing};
pub use message::{Message, Op, Record, RecordStream, Response, Status, DELIMITER};
pub use metrics::{ClientMetrics, Counter, Gauge, Histogram};
pub use utils::{
    crc32, display_bytes, format_bytes, validate_column_family, validate_key, validate_value,
    MAX_VALUE_LEN,
};
