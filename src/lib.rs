//! # ringkv
//!
//! Client-side replication coordinator for a consistent-hashed key-value
//! store:
//! - Consistent hashing over a watch-updated membership view
//! - Per-node connection leasing with backpressure
//! - Correlated requests with per-request deadlines
//! - Fan-out writes/deletes, hedged reads/streams
//! - Buffered time-series appends
//!
//! ## Architecture
//!
//! ```text
//!              ┌──────────────────────────────┐
//!  caller ───▶ │      ReplicationClient        │
//!              │ selector · pool · tracker     │
//!              └──────┬───────────┬───────────┘
//!                     │ framed TCP│
//!        ┌────────────▼─┐   ┌─────▼────────┐   ┌──────────────┐
//!        │ node-0       │   │ node-1       │   │ node-2       │
//!        │ (primary)    │   │ (backup)     │   │              │
//!        │ Mem/RocksDB  │   │ Mem/RocksDB  │   │ Mem/RocksDB  │
//!        └──────────────┘   └──────────────┘   └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start storage nodes
//! ```bash
//! ringkv-node --bind 127.0.0.1:12000 --backend rocksdb --data ./node-0
//! ringkv-node --bind 127.0.0.1:12001
//! ringkv-node --bind 127.0.0.1:12002
//! ```
//!
//! ### Start the HTTP gateway
//! ```bash
//! ringkv-gateway --bind 0.0.0.0:8080 \
//!   --nodes 127.0.0.1:12000,127.0.0.1:12001,127.0.0.1:12002
//! ```
//!
//! ### Use the CLI
//! ```bash
//! ringkv --nodes 127.0.0.1:12000,127.0.0.1:12001 put users alice ./alice.json
//! ringkv --nodes 127.0.0.1:12000,127.0.0.1:12001 get users alice
//! ringkv --nodes 127.0.0.1:12000,127.0.0.1:12001 aggregate events
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod coordinator;
pub mod node;

// Re-export commonly used types
pub use common::{ClientConfig, Config, Error, Result};
pub use coordinator::{
    AggregatedStream, AppendAck, MembershipView, Registry, ReplicaAcks, ReplicationClient,
    TcpConnector,
};
pub use node::{LocalCluster, NodeServer};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
