//! Partition executor: a fixed pool of worker tasks, each exclusively owning
//! the stores of the partitions mapped to it. Operations on one partition run
//! one at a time, in submission order; different partitions run in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::cluster::{Address, Transport};
use crate::config::GridConfig;
use crate::engine::{
    BackupMode, BackupTracker, Completion, EntryProcessors, EventService,
    InvocationId, PartitionStore, PeerMsg,
};
use crate::operation::{BackupOperation, OpEnvelope, OpResponse};
use crate::partition::{PartitionId, PartitionTable};
use crate::utils::GridError;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Everything a worker needs besides its partition stores.
pub struct ExecutorContext {
    pub me: Address,
    pub config: Arc<GridConfig>,
    pub table: Arc<PartitionTable>,
    pub transport: Arc<dyn Transport>,
    pub events: Arc<EventService>,
    pub processors: Arc<EntryProcessors>,
    pub backups: Arc<BackupTracker>,
}

/// Where the outcome of an execution goes.
pub enum Reply {
    /// In-process invoker.
    Local(Completion),

    /// Remote invoker, answered with a `PeerMsg::Response`.
    Remote { to: Address, id: InvocationId },
}

enum Task {
    Execute {
        op: OpEnvelope,
        reply: Reply,
    },
    ApplyBackup {
        origin: Address,
        partition: PartitionId,
        version: u64,
        op: BackupOperation,
        ack: Option<u64>,
    },
}

/// The partition executor module.
pub struct PartitionExecutor {
    ctx: Arc<ExecutorContext>,

    /// Sender sides of the workers' task channels; emptied on shutdown.
    tx_tasks: RwLock<Vec<mpsc::UnboundedSender<Task>>>,

    /// Join handles of the workers.
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

// PartitionExecutor public API implementation
impl PartitionExecutor {
    /// Spawns `worker_count` workers.
    pub fn new_and_setup(ctx: Arc<ExecutorContext>) -> Result<Self, GridError> {
        let worker_count = ctx.config.worker_count;
        if worker_count == 0 {
            return logged_err!(ctx.me; "invalid worker_count {}", worker_count);
        }

        let mut tx_tasks = Vec::with_capacity(worker_count);
        let mut worker_handles = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let (tx_task, rx_task) = mpsc::unbounded_channel();
            tx_tasks.push(tx_task);
            worker_handles.push(tokio::spawn(Self::worker_thread(
                worker,
                ctx.clone(),
                rx_task,
            )));
        }

        Ok(PartitionExecutor {
            ctx,
            tx_tasks: RwLock::new(tx_tasks),
            worker_handles: Mutex::new(worker_handles),
        })
    }

    /// Queues an operation for its partition's worker. The reply is always
    /// settled, with a failure if the operation cannot be queued.
    pub fn submit(&self, op: OpEnvelope, reply: Reply) {
        let partition = match op.header.partition {
            Some(p) => p,
            None => {
                Self::deliver(
                    &self.ctx,
                    reply,
                    Err(GridError::Misuse(format!(
                        "{} submitted without partition",
                        op
                    ))),
                );
                return;
            }
        };

        if let Err(Task::Execute { reply, .. }) =
            self.route(partition, Task::Execute { op, reply })
        {
            Self::deliver(&self.ctx, reply, Err(GridError::ShuttingDown));
        }
    }

    /// Queues a backup received from `origin` for its partition's worker.
    pub fn submit_backup(
        &self,
        origin: Address,
        partition: PartitionId,
        version: u64,
        op: BackupOperation,
        ack: Option<u64>,
    ) {
        let task = Task::ApplyBackup {
            origin,
            partition,
            version,
            op,
            ack,
        };
        if self.route(partition, task).is_err() {
            pf_warn!(self.ctx.me; "backup v{} of partition {} from {} dropped on shutdown",
                                  version, partition, origin);
        }
    }

    /// Stops accepting tasks, lets the workers drain their queues, and
    /// waits for them to exit.
    pub async fn shutdown(&self) {
        self.tx_tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        let handles: Vec<JoinHandle<()>> = self
            .worker_handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                pf_error!(self.ctx.me; "worker join error: {}", e);
            }
        }
        pf_debug!(self.ctx.me; "partition executor shut down");
    }

    /// Hands a task to the worker of `partition`, giving it back on failure.
    fn route(&self, partition: PartitionId, task: Task) -> Result<(), Task> {
        let tx_tasks = self.tx_tasks.read().unwrap_or_else(|e| e.into_inner());
        if tx_tasks.is_empty() {
            return Err(task);
        }
        let worker = partition as usize % tx_tasks.len();
        tx_tasks[worker].send(task).map_err(|e| e.0)
    }
}

// PartitionExecutor worker thread implementation
impl PartitionExecutor {
    /// Sends an outcome to where it is expected.
    fn deliver(
        ctx: &ExecutorContext,
        reply: Reply,
        result: Result<OpResponse, GridError>,
    ) {
        match reply {
            Reply::Local(tx_done) => {
                let _ = tx_done.send(result);
            }
            Reply::Remote { to, id } => {
                match (PeerMsg::Response { id, result }).encode() {
                    Ok(frame) => {
                        if let Err(e) = ctx.transport.send(to, frame) {
                            pf_warn!(ctx.me; "error replying {} to {}: {}", id, to, e);
                        }
                    }
                    Err(e) => {
                        pf_error!(ctx.me; "error encoding response {}: {}", id, e)
                    }
                }
            }
        }
    }

    /// Ships a backup to the backup owners of `partition`, as many as the
    /// structure's backup count asks for. In sync mode, returns the ack ID
    /// and the receiver resolving once all acks arrived.
    fn send_backups(
        ctx: &ExecutorContext,
        store: &mut PartitionStore,
        name: &str,
        partition: PartitionId,
        backup: BackupOperation,
    ) -> Option<(u64, oneshot::Receiver<()>)> {
        let mut targets = match ctx.table.backups_of(partition) {
            Ok(targets) => targets,
            Err(e) => {
                pf_error!(ctx.me; "error looking up backups of {}: {}", partition, e);
                return None;
            }
        };
        targets.truncate(ctx.config.map_config(name).backup_count);
        if targets.is_empty() {
            return None;
        }

        let version = store.next_backup_version();
        let pending = match ctx.config.backup_mode {
            BackupMode::Sync => Some(ctx.backups.expect(targets.len())),
            BackupMode::Async => None,
        };
        let ack = pending.as_ref().map(|(ack, _)| *ack);

        let msg = PeerMsg::Backup {
            partition,
            version,
            op: backup,
            ack,
        };
        let frame = match msg.encode() {
            Ok(frame) => frame,
            Err(e) => {
                pf_error!(ctx.me; "error encoding backup of {}: {}", partition, e);
                if let Some(ack) = ack {
                    ctx.backups.forget(ack);
                }
                return None;
            }
        };

        for target in targets {
            if let Err(e) = ctx.transport.send(target, frame.clone()) {
                pf_warn!(ctx.me; "backup v{} of partition {} to {} failed: {}",
                                 version, partition, target, e);
                if let Some(ack) = ack {
                    // nothing will come back from it
                    ctx.backups.ack(ack);
                }
            } else {
                pf_trace!(ctx.me; "sent backup v{} of partition {} to {}",
                                  version, partition, target);
            }
        }
        pending
    }

    /// Runs one operation on its partition.
    fn handle_execute(
        ctx: &Arc<ExecutorContext>,
        stores: &mut HashMap<PartitionId, PartitionStore>,
        mut op: OpEnvelope,
        reply: Reply,
    ) {
        let partition = match op.header.partition {
            Some(p) => p,
            None => {
                Self::deliver(ctx, reply, Err(GridError::msg("no partition")));
                return;
            }
        };

        // ownership may have moved since the invoker resolved it
        match ctx.table.owner_of(partition) {
            Ok(owner) if owner == ctx.me => {}
            Ok(_) => {
                Self::deliver(
                    ctx,
                    reply,
                    Err(GridError::WrongTarget {
                        partition,
                        member: ctx.me,
                    }),
                );
                return;
            }
            Err(e) => {
                Self::deliver(ctx, reply, Err(e));
                return;
            }
        }

        let store = stores
            .entry(partition)
            .or_insert_with(|| PartitionStore::new(partition));
        let executed = op.execute(
            ctx.table.partition_count(),
            store,
            &ctx.events,
            &ctx.processors,
        );
        pf_trace!(ctx.me; "executed {} on partition {}", op, partition);

        let pending = match executed.backup {
            Some(backup) if !backup.is_noop() => Self::send_backups(
                ctx,
                store,
                &op.header.name,
                partition,
                backup,
            ),
            _ => None,
        };

        match pending {
            None => Self::deliver(ctx, reply, executed.response),
            Some((ack, rx_acks)) => {
                let ctx = ctx.clone();
                let response = executed.response;
                tokio::spawn(async move {
                    let wait =
                        Duration::from_millis(ctx.config.backup_ack_timeout_ms);
                    if time::timeout(wait, rx_acks).await.is_err() {
                        ctx.backups.forget(ack);
                        pf_warn!(ctx.me; "backup acks of partition {} missing after {:?}",
                                         partition, wait);
                    }
                    Self::deliver(&ctx, reply, response);
                });
            }
        }
    }

    /// Applies a backup received from `origin` at most once.
    fn handle_backup(
        ctx: &ExecutorContext,
        stores: &mut HashMap<PartitionId, PartitionStore>,
        origin: Address,
        partition: PartitionId,
        version: u64,
        op: BackupOperation,
        ack: Option<u64>,
    ) {
        let store = stores
            .entry(partition)
            .or_insert_with(|| PartitionStore::new(partition));
        if store.admit_backup(origin, version) {
            op.apply(store);
            pf_trace!(ctx.me; "applied backup v{} of partition {} from {}",
                              version, partition, origin);
        } else {
            pf_debug!(ctx.me; "ignored duplicate backup v{} of partition {} from {}",
                              version, partition, origin);
        }

        if let Some(ack) = ack {
            let sent = PeerMsg::BackupAck { ack }
                .encode()
                .and_then(|frame| ctx.transport.send(origin, frame));
            if let Err(e) = sent {
                pf_warn!(ctx.me; "error acking backup to {}: {}", origin, e);
            }
        }
    }

    /// Worker thread function.
    async fn worker_thread(
        worker: usize,
        ctx: Arc<ExecutorContext>,
        mut rx_task: mpsc::UnboundedReceiver<Task>,
    ) {
        pf_debug!(ctx.me; "worker {} spawned", worker);

        // partition stores owned by this worker
        let mut stores: HashMap<PartitionId, PartitionStore> = HashMap::new();

        while let Some(task) = rx_task.recv().await {
            match task {
                Task::Execute { op, reply } => {
                    Self::handle_execute(&ctx, &mut stores, op, reply)
                }
                Task::ApplyBackup {
                    origin,
                    partition,
                    version,
                    op,
                    ack,
                } => Self::handle_backup(
                    &ctx,
                    &mut stores,
                    origin,
                    partition,
                    version,
                    op,
                    ack,
                ),
            }
        }

        // channel gets closed and no tasks remain
        pf_debug!(ctx.me; "worker {} exitted", worker);
    }
}

#[cfg(test)]
mod executor_tests {
    use super::*;
    use crate::cluster::{to_data, to_object, LocalFabric};
    use crate::operation::{ListBackup, MapOperation, OpBody, LIST_SERVICE};
    use crate::operation::ClearOperation;
    use crate::partition::PartitionReplicas;

    fn addr(port: u16) -> Address {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    /// Executor of member 5701 owning every partition, backed up by 5702.
    fn setup(
        backup_mode: BackupMode,
    ) -> Result<(PartitionExecutor, LocalFabric, crate::cluster::Inbox), GridError>
    {
        let fabric = LocalFabric::new();
        let (transport, _inbox) = fabric.join(addr(5701))?;
        let (_t1, inbox1) = fabric.join(addr(5702))?;
        let config = GridConfig {
            partition_count: 4,
            worker_count: 2,
            backup_mode,
            backup_ack_timeout_ms: 100,
            ..Default::default()
        };
        let table = Arc::new(PartitionTable::new(4)?);
        for p in 0..4 {
            table.set_replicas(
                p,
                PartitionReplicas {
                    owner: Some(addr(5701)),
                    backups: vec![addr(5702)],
                },
            )?;
        }
        let ctx = Arc::new(ExecutorContext {
            me: addr(5701),
            config: Arc::new(config),
            table,
            transport,
            events: Arc::new(EventService::new()),
            processors: Arc::new(EntryProcessors::new()),
            backups: Arc::new(BackupTracker::new()),
        });
        Ok((PartitionExecutor::new_and_setup(ctx)?, fabric, inbox1))
    }

    async fn run(
        executor: &PartitionExecutor,
        mut op: OpEnvelope,
        partition: PartitionId,
    ) -> Result<OpResponse, GridError> {
        op.header.partition = Some(partition);
        let (tx, rx) = oneshot::channel();
        executor.submit(op, Reply::Local(tx));
        rx.await?
    }

    fn list_op(body: OpBody) -> OpEnvelope {
        OpEnvelope::new(LIST_SERVICE, "l", body)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn list_clear_backups() -> Result<(), GridError> {
        let (executor, fabric, mut inbox1) = setup(BackupMode::Async)?;

        run(&executor, list_op(OpBody::ListClear(ClearOperation)), 1).await?;
        assert!(fabric.frames().is_empty());

        run(
            &executor,
            list_op(OpBody::ListAdd(crate::operation::AddOperation {
                value: to_data("x")?,
            })),
            1,
        )
        .await?;
        run(&executor, list_op(OpBody::ListClear(ClearOperation)), 1).await?;

        let mut versions = vec![];
        for _ in 0..2 {
            let (from, frame) = inbox1.recv().await.unwrap();
            assert_eq!(from, addr(5701));
            match to_object::<PeerMsg>(&frame)? {
                PeerMsg::Backup {
                    partition,
                    version,
                    ack,
                    ..
                } => {
                    assert_eq!(partition, 1);
                    assert!(ack.is_none());
                    versions.push(version);
                }
                msg => panic!("unexpected {:?}", msg),
            }
        }
        assert_eq!(versions, vec![1, 2]);
        executor.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wrong_target_rejected() -> Result<(), GridError> {
        let (executor, _fabric, _inbox1) = setup(BackupMode::Async)?;
        executor.ctx.table.set_replicas(
            2,
            PartitionReplicas {
                owner: Some(addr(5702)),
                backups: vec![],
            },
        )?;
        let get = OpEnvelope::map("m", MapOperation::Size);
        assert_eq!(
            run(&executor, get, 2).await,
            Err(GridError::WrongTarget {
                partition: 2,
                member: addr(5701)
            })
        );
        executor.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_backup_applied_once() -> Result<(), GridError> {
        let (executor, _fabric, _inbox1) = setup(BackupMode::Async)?;
        let add = BackupOperation::List {
            name: "l".into(),
            op: ListBackup::Add {
                value: to_data("x")?,
            },
        };
        for _ in 0..3 {
            executor.submit_backup(addr(5702), 3, 1, add.clone(), None);
        }
        let size = run(
            &executor,
            list_op(OpBody::ListRead(crate::operation::ListReadOperation::Size)),
            3,
        )
        .await?;
        assert_eq!(size, OpResponse::Size(1));
        executor.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sync_mode_waits_for_ack_timeout() -> Result<(), GridError> {
        let (executor, _fabric, mut inbox1) = setup(BackupMode::Sync)?;
        let start = time::Instant::now();
        let put = OpEnvelope::map(
            "m",
            MapOperation::Set {
                key: to_data("k")?,
                value: to_data("v")?,
                ttl_ms: None,
            },
        );
        let partition =
            crate::partition::partition_id_for_key(&to_data("k")?, 4);
        // nobody acks: response comes after the ack timeout
        assert_eq!(run(&executor, put, partition).await?, OpResponse::None);
        assert!(start.elapsed() >= Duration::from_millis(100));
        let (_, frame) = inbox1.recv().await.unwrap();
        assert!(matches!(
            to_object::<PeerMsg>(&frame)?,
            PeerMsg::Backup { ack: Some(_), .. }
        ));
        assert_eq!(executor.ctx.backups.outstanding(), 0);
        executor.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submit_after_shutdown_fails() -> Result<(), GridError> {
        let (executor, _fabric, _inbox1) = setup(BackupMode::Async)?;
        executor.shutdown().await;
        let get = OpEnvelope::map("m", MapOperation::Size);
        assert_eq!(run(&executor, get, 0).await, Err(GridError::ShuttingDown));
        Ok(())
    }
}
