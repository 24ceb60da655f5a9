//! Operation engine: partition stores and their executor, invocation
//! tracking, backup replication and the operation service on top.

mod backup;
mod events;
mod executor;
mod interceptors;
mod invocation;
mod messages;
mod processors;
mod service;
mod store;

pub use backup::{BackupMode, BackupTracker};
pub use events::{EntryEvent, EntryEventKind, EventService};
pub use executor::{ExecutorContext, PartitionExecutor, Reply};
pub use interceptors::InterceptorRegistry;
pub use invocation::{Completion, InvocationFuture, InvocationRegistry};
pub use messages::{InvocationId, PeerMsg};
pub use processors::{EntryProcessor, EntryProcessors};
pub use service::{OperationService, PartitionResults};
pub use store::{EntryView, PartitionStore, UndoRecord};
