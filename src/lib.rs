//! Gridset: a partitioned in-memory data grid core. Operations are routed
//! to the owner of their partition, executed there one at a time per
//! partition, and replicated to backup owners.

#[macro_use]
mod utils;

mod cluster;
mod config;
mod engine;
mod node;
mod operation;
mod partition;
mod proxy;
mod txn;

#[cfg(test)]
mod testkit;

pub use cluster::{
    to_data, to_object, Address, ClusterView, Data, Inbox, LocalFabric,
    LocalTransport, NodeState, SentFrame, TcpTransport, Transport,
};
pub use config::{GridConfig, MapConfig};
pub use engine::{
    BackupMode, EntryEvent, EntryEventKind, EntryProcessor, EntryView,
    InvocationFuture, OperationService, PartitionResults,
};
pub use node::GridNode;
pub use operation::{
    MapOperation, OpBody, OpEnvelope, OpResponse, Predicate, ThreadId, TxnId,
    LIST_SERVICE, MAP_SERVICE,
};
pub use partition::{
    partition_id_for_key, PartitionId, PartitionReplicas, PartitionTable,
};
pub use proxy::{
    ListProxy, MapEntryView, MapProxy, NearCacheStats, ProxyFuture,
    QueryResultSet,
};
pub use txn::{CallContext, TransactionTracker};
pub use utils::{logger_init, DomainError, GridError, ME};
