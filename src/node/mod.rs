//! Storage node implementation
//!
//! Handles per-node data with:
//! - Pluggable storage engines (in-memory, RocksDB)
//! - Framed TCP protocol for coordinator requests
//! - An in-process cluster for embedding and tests

pub mod handler;
pub mod local;
pub mod server;
pub mod storage;

pub use local::{LocalCluster, LocalConnector};
pub use server::NodeServer;
pub use storage::{open_storage, MemStorage, RocksStorage, StorageProvider};
