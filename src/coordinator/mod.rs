//! Client-side replication coordinator
//!
//! The coordinator is responsible for:
//! - Membership tracking (live node list, updated on change notifications)
//! - Placement decisions (consistent hashing over the live nodes)
//! - Connection leasing per node
//! - Request/response correlation with deadlines
//! - Fan-out writes and hedged reads across replicas

pub mod client;
pub mod http;
pub mod membership;
pub mod placement;
pub mod pool;
pub mod tracker;
pub mod transport;

pub use client::{AggregatedStream, AppendAck, ReplicaAcks, ReplicationClient};
pub use membership::{EphemeralNode, MembershipView, Registry};
pub use placement::{ReplicaSelector, ReplicaSet};
pub use pool::{Connection, ConnectionPool, Connector, Lease, Liveness, Outbound};
pub use tracker::{PendingResponse, RequestTracker};
pub use transport::TcpConnector;
