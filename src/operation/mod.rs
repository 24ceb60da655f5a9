//! Operation model: the lifecycle contract every routed unit of work follows,
//! the optional backup capability, the wire envelope carrying an operation
//! between members, and the response values operations produce.
//!
//! An operation runs as `before_run -> run -> after_run` on the partition
//! executor owning its partition. Whatever `before_run` captures lives in a
//! per-execution local context value (`Operation::Local`) that is threaded
//! through the three steps and never serialized.

mod backup;
mod list;
mod map;
mod query;
mod txn;

pub use backup::{BackupOperation, ListBackup, MapBackup};
pub use list::{
    AddOperation, ClearOperation, ListReadOperation, RemoveIndexOperation,
};
pub use map::MapOperation;
pub use query::{
    Predicate, QueryOperation, QueryPartitionOperation, QueryResult,
};
pub use txn::TxnFinishOperation;

use std::fmt;
use std::sync::Arc;

use crate::cluster::Data;
use crate::engine::{
    EntryEvent, EntryProcessor, EntryProcessors, EntryView, EventService,
    PartitionStore,
};
use crate::partition::{partition_id_for_key, PartitionId};
use crate::utils::{DomainError, GridError};

use serde::{Deserialize, Serialize};

/// Calling thread (or session) ID, carried for reentrant lock semantics.
pub type ThreadId = u64;

/// Transaction ID type.
pub type TxnId = u64;

/// Service name of distributed maps.
pub const MAP_SERVICE: &str = "grid:map";

/// Service name of distributed lists.
pub const LIST_SERVICE: &str = "grid:list";

/// Wire header carried by every operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpHeader {
    /// Service the operation belongs to.
    pub service: String,

    /// Name of the target data structure.
    pub name: String,

    /// Target partition; `None` for member-level operations.
    pub partition: Option<PartitionId>,

    /// Transaction ID if issued inside a transaction.
    pub txn: Option<TxnId>,

    /// Calling thread ID.
    pub thread: ThreadId,
}

/// Response value of an executed operation. Expected domain failures are
/// values too (`Error`), distinct from execution failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpResponse {
    None,
    Bool(bool),
    Size(u64),
    Value(Option<Data>),
    Keys(Vec<Data>),
    Values(Vec<Data>),
    Entries(Vec<(Data, Data)>),
    Entry(Option<EntryView>),
    Query(QueryResult),
    Error(DomainError),
}

// Helper macro for the `into_*()` unwrappers used at the proxy boundary.
macro_rules! response_into {
    ($func:ident, $variant:ident, $ty:ty) => {
        pub fn $func(self) -> Result<$ty, GridError> {
            match self {
                OpResponse::$variant(v) => Ok(v),
                OpResponse::Error(e) => Err(GridError::Domain(e)),
                r => Err(GridError::msg(format!(
                    "unexpected response {:?}, expecting {}",
                    r,
                    stringify!($variant)
                ))),
            }
        }
    };
}

impl OpResponse {
    /// Whether the response is a domain failure marker.
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, OpResponse::Error(_))
    }

    /// Turns a domain failure marker into `GridError::Domain`, passing every
    /// other response through.
    pub fn into_result(self) -> Result<OpResponse, GridError> {
        match self {
            OpResponse::Error(e) => Err(GridError::Domain(e)),
            r => Ok(r),
        }
    }

    response_into!(into_bool, Bool, bool);
    response_into!(into_size, Size, u64);
    response_into!(into_value, Value, Option<Data>);
    response_into!(into_keys, Keys, Vec<Data>);
    response_into!(into_values, Values, Vec<Data>);
    response_into!(into_entries, Entries, Vec<(Data, Data)>);
    response_into!(into_entry, Entry, Option<EntryView>);
    response_into!(into_query, Query, QueryResult);
}

/// Execution environment handed to an operation on its partition executor.
pub struct OpContext<'a> {
    pub header: &'a OpHeader,

    /// Partition being executed on.
    pub partition: PartitionId,

    /// Total number of partitions in the cluster.
    pub partition_count: u32,

    /// Partition-local data, exclusively borrowed for this execution.
    pub store: &'a mut PartitionStore,

    events: &'a EventService,
    processors: &'a EntryProcessors,
}

impl<'a> OpContext<'a> {
    pub fn new(
        header: &'a OpHeader,
        partition_count: u32,
        store: &'a mut PartitionStore,
        events: &'a EventService,
        processors: &'a EntryProcessors,
    ) -> Self {
        OpContext {
            header,
            partition: store.id(),
            partition_count,
            store,
            events,
            processors,
        }
    }

    /// Entry processor registered on this member under `name`.
    #[inline]
    pub fn processor(&self, name: &str) -> Option<Arc<dyn EntryProcessor>> {
        self.processors.get(name)
    }

    /// Whether anyone on this member listens to the target structure.
    #[inline]
    pub fn has_listener(&self) -> bool {
        self.events.has_listener(&self.header.name)
    }

    /// Publishes an event to local listeners of the target structure.
    #[inline]
    pub fn publish(&self, event: EntryEvent) {
        self.events.publish(&self.header.name, event);
    }
}

/// Lifecycle contract of a routed unit of work.
pub trait Operation {
    /// Local execution context, captured in `before_run` and consumed by
    /// `after_run`. Never leaves the executing member.
    type Local: Default;

    /// Captures pre-mutation state.
    fn before_run(
        &mut self,
        _ctx: &mut OpContext<'_>,
    ) -> Result<Self::Local, GridError> {
        Ok(Self::Local::default())
    }

    /// Performs the operation and produces its response.
    fn run(
        &mut self,
        ctx: &mut OpContext<'_>,
        local: &mut Self::Local,
    ) -> Result<OpResponse, GridError>;

    /// Publishes derived events. Runs even if `run` failed.
    fn after_run(
        &mut self,
        _ctx: &mut OpContext<'_>,
        _local: Self::Local,
    ) -> Result<(), GridError> {
        Ok(())
    }

    /// Serialized key this operation is routed by, if partition-aware.
    fn routing_key(&self) -> Option<&Data> {
        None
    }

    /// Backup capability, if any.
    fn as_backup_aware(&self) -> Option<&dyn BackupAware<Self::Local>> {
        None
    }

    /// Whether the operation affects a whole partition rather than one key.
    fn is_partition_level(&self) -> bool {
        false
    }
}

/// Capability of operations whose effect is replicated to backup owners.
pub trait BackupAware<L> {
    /// Decided after `run`: whether a backup trip is warranted.
    fn should_backup(&self, local: &L, response: &OpResponse) -> bool;

    /// The replica-side counterpart reproducing the primary effect.
    fn backup_operation(&self, header: &OpHeader, local: &L) -> BackupOperation;
}

/// Outcome of one execution on the partition executor.
#[derive(Debug)]
pub struct Executed {
    pub response: Result<OpResponse, GridError>,

    /// Backup to ship to the partition's backup owners, if warranted.
    pub backup: Option<BackupOperation>,
}

impl Executed {
    fn failed(err: GridError) -> Self {
        Executed {
            response: Err(err),
            backup: None,
        }
    }
}

/// Drives one operation through its lifecycle.
pub fn run_lifecycle<O: Operation>(
    op: &mut O,
    ctx: &mut OpContext<'_>,
) -> Executed {
    if !op.is_partition_level() {
        if let Some(key) = op.routing_key() {
            let expected = partition_id_for_key(key, ctx.partition_count);
            if expected != ctx.partition {
                return Executed::failed(GridError::Execution {
                    cause: format!(
                        "key of partition {} executed on partition {}",
                        expected, ctx.partition
                    ),
                });
            }
        }
    }

    let mut local = match op.before_run(ctx) {
        Ok(local) => local,
        Err(e) => return Executed::failed(into_execution(e)),
    };

    let response = op.run(ctx, &mut local).map_err(into_execution);

    // never replicate a failed primary execution
    let backup = match (&response, op.as_backup_aware()) {
        (Ok(resp), Some(aware))
            if !resp.is_error() && aware.should_backup(&local, resp) =>
        {
            Some(aware.backup_operation(ctx.header, &local))
        }
        _ => None,
    };

    if let Err(e) = op.after_run(ctx, local) {
        pf_warn!("after_run of {} on partition {} failed: {}",
                 ctx.header.name, ctx.partition, e);
    }

    Executed { response, backup }
}

fn into_execution(err: GridError) -> GridError {
    match err {
        GridError::Execution { .. } => err,
        e => GridError::Execution {
            cause: e.to_string(),
        },
    }
}

/// Concrete operation carried by an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpBody {
    Map(MapOperation),
    ListAdd(AddOperation),
    ListClear(ClearOperation),
    ListRemoveIndex(RemoveIndexOperation),
    ListRead(ListReadOperation),
    QueryPartition(QueryPartitionOperation),
    TxnFinish(TxnFinishOperation),

    /// Member-level: answers with the locally owned partitions' matches.
    Query(QueryOperation),

    /// Member-level: registers or removes a map interceptor.
    Interceptor(InterceptorOperation),
}

/// Member-level map interceptor registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterceptorOperation {
    Add { id: String, interceptor: Data },
    Remove { id: String },
}

/// An operation together with its header, as shipped between members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpEnvelope {
    pub header: OpHeader,
    pub body: OpBody,
}

impl OpEnvelope {
    /// Creates an envelope with no partition, transaction, or thread.
    pub fn new(service: &str, name: &str, body: OpBody) -> Self {
        OpEnvelope {
            header: OpHeader {
                service: service.into(),
                name: name.into(),
                partition: None,
                txn: None,
                thread: 0,
            },
            body,
        }
    }

    /// Map service operation.
    pub fn map(name: &str, op: MapOperation) -> Self {
        Self::new(MAP_SERVICE, name, OpBody::Map(op))
    }

    /// Stamps the calling thread ID.
    pub fn with_thread(mut self, thread: ThreadId) -> Self {
        self.header.thread = thread;
        self
    }

    /// Stamps a transaction ID (or clears it).
    pub fn with_txn(mut self, txn: Option<TxnId>) -> Self {
        self.header.txn = txn;
        self
    }

    /// Whether the envelope targets a member instead of a partition.
    pub fn is_member_level(&self) -> bool {
        matches!(self.body, OpBody::Query(_) | OpBody::Interceptor(_))
    }

    /// Runs the carried operation against a partition store.
    pub fn execute(
        &mut self,
        partition_count: u32,
        store: &mut PartitionStore,
        events: &EventService,
        processors: &EntryProcessors,
    ) -> Executed {
        let OpEnvelope { header, body } = self;
        let mut ctx =
            OpContext::new(header, partition_count, store, events, processors);
        match body {
            OpBody::Map(op) => run_lifecycle(op, &mut ctx),
            OpBody::ListAdd(op) => run_lifecycle(op, &mut ctx),
            OpBody::ListClear(op) => run_lifecycle(op, &mut ctx),
            OpBody::ListRemoveIndex(op) => run_lifecycle(op, &mut ctx),
            OpBody::ListRead(op) => run_lifecycle(op, &mut ctx),
            OpBody::QueryPartition(op) => run_lifecycle(op, &mut ctx),
            OpBody::TxnFinish(op) => run_lifecycle(op, &mut ctx),
            OpBody::Query(_) | OpBody::Interceptor(_) => {
                Executed::failed(GridError::Misuse(format!(
                    "member-level operation {} sent to a partition",
                    ctx.header.name
                )))
            }
        }
    }
}

impl fmt::Display for OpEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match &self.body {
            OpBody::Map(op) => op.kind(),
            OpBody::ListAdd(_) => "ListAdd",
            OpBody::ListClear(_) => "ListClear",
            OpBody::ListRemoveIndex(_) => "ListRemoveIndex",
            OpBody::ListRead(_) => "ListRead",
            OpBody::QueryPartition(_) => "QueryPartition",
            OpBody::TxnFinish(_) => "TxnFinish",
            OpBody::Query(_) => "Query",
            OpBody::Interceptor(_) => "Interceptor",
        };
        write!(f, "{}[{}:{}]", kind, self.header.service, self.header.name)
    }
}
