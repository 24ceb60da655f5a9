//! One grid member: wires the partition table, executor, and operation
//! service to a transport, and runs the peer message loop.

use std::sync::{Arc, Mutex};

use crate::cluster::{
    to_object, Address, ClusterView, Inbox, NodeState, PeerFailures, Transport,
};
use crate::config::GridConfig;
use crate::engine::{
    BackupTracker, EntryProcessor, EntryProcessors, EventService,
    ExecutorContext, InterceptorRegistry, OperationService, PartitionExecutor,
    PeerMsg, Reply,
};
use crate::operation::TxnId;
use crate::partition::PartitionTable;
use crate::proxy::{ListProxy, MapProxy, NearCaches};
use crate::txn::TransactionTracker;
use crate::utils::GridError;

use serde::{de::DeserializeOwned, Serialize};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// A running grid member.
pub struct GridNode {
    me: Address,
    config: Arc<GridConfig>,
    view: Arc<ClusterView>,
    table: Arc<PartitionTable>,
    transport: Arc<dyn Transport>,
    events: Arc<EventService>,
    processors: Arc<EntryProcessors>,
    executor: Arc<PartitionExecutor>,
    service: Arc<OperationService>,
    txns: Arc<TransactionTracker>,
    near_caches: NearCaches,

    /// Sender side of the messenger's stop signal.
    tx_stop: mpsc::Sender<()>,

    /// Join handle of the messenger thread.
    messenger_handle: Mutex<Option<JoinHandle<()>>>,
}

impl GridNode {
    /// Starts a member on an already set up transport, with a static
    /// initial member list and round-robin partition assignment. Returns
    /// once the member is active.
    pub async fn start(
        config: GridConfig,
        transport: Arc<dyn Transport>,
        inbox: Inbox,
        members: &[Address],
    ) -> Result<Self, GridError> {
        config.validate()?;
        let me = transport.local_addr();
        let config = Arc::new(config);

        let mut members = members.to_vec();
        if !members.contains(&me) {
            members.push(me);
        }
        members.sort();
        members.dedup();
        let view = Arc::new(ClusterView::new(me));
        view.set_members(&members);

        let table = Arc::new(PartitionTable::new(config.partition_count)?);
        table.assign_round_robin(&members, config.table_backup_count())?;

        let events = Arc::new(EventService::new());
        let processors = Arc::new(EntryProcessors::new());
        let backups = Arc::new(BackupTracker::new());
        let executor = Arc::new(PartitionExecutor::new_and_setup(Arc::new(
            ExecutorContext {
                me,
                config: config.clone(),
                table: table.clone(),
                transport: transport.clone(),
                events: events.clone(),
                processors: processors.clone(),
                backups: backups.clone(),
            },
        ))?);
        let service = Arc::new(OperationService::new(
            config.clone(),
            view.clone(),
            table.clone(),
            transport.clone(),
            executor.clone(),
            Arc::new(InterceptorRegistry::new()),
        ));

        let (tx_stop, rx_stop) = mpsc::channel(1);
        let messenger_handle = tokio::spawn(Self::messenger_thread(
            me,
            service.clone(),
            executor.clone(),
            backups,
            transport.clone(),
            inbox,
            transport.take_failures(),
            rx_stop,
        ));

        let near_caches = NearCaches::new(me, events.clone());
        view.set_state(NodeState::Active);
        pf_info!(me; "member active with {} members, {} partitions ({} owned)",
                     members.len(), config.partition_count, table.owned_by(me).len());

        Ok(GridNode {
            me,
            config,
            view,
            table,
            transport,
            events,
            processors,
            executor,
            service,
            txns: Arc::new(TransactionTracker::new()),
            near_caches,
            tx_stop,
            messenger_handle: Mutex::new(Some(messenger_handle)),
        })
    }

    #[inline]
    pub fn me(&self) -> Address {
        self.me
    }

    #[inline]
    pub fn config(&self) -> &Arc<GridConfig> {
        &self.config
    }

    #[inline]
    pub fn view(&self) -> &Arc<ClusterView> {
        &self.view
    }

    #[inline]
    pub fn table(&self) -> &Arc<PartitionTable> {
        &self.table
    }

    #[inline]
    pub fn service(&self) -> &Arc<OperationService> {
        &self.service
    }

    #[inline]
    pub fn events(&self) -> &Arc<EventService> {
        &self.events
    }

    #[inline]
    pub fn transactions(&self) -> &Arc<TransactionTracker> {
        &self.txns
    }

    /// Registers an entry processor under `name` on this member. Maps run
    /// processors by name on the partition owner, so every member needs
    /// the same registrations. Returns false if it replaced an earlier one.
    pub fn register_entry_processor(
        &self,
        name: &str,
        processor: Arc<dyn EntryProcessor>,
    ) -> bool {
        pf_debug!(self.me; "entry processor '{}' registered", name);
        self.processors.register(name, processor)
    }

    /// Typed facade of map `name`.
    pub fn map_proxy<K, V>(&self, name: &str) -> MapProxy<K, V>
    where
        K: Serialize + DeserializeOwned + Send + 'static,
        V: Serialize + DeserializeOwned + Send + 'static,
    {
        MapProxy::new(
            name,
            self.service.clone(),
            self.txns.clone(),
            self.events.clone(),
            self.near_caches
                .cache_for(name, self.config.map_config(name)),
        )
    }

    /// Typed facade of list `name`.
    pub fn list_proxy<V>(&self, name: &str) -> Result<ListProxy<V>, GridError>
    where
        V: Serialize + DeserializeOwned + Send + 'static,
    {
        ListProxy::new(name, self.service.clone())
    }

    /// Commits transaction `txn` on every partition it enlisted.
    pub async fn commit(&self, txn: TxnId) -> Result<u64, GridError> {
        self.txns.finish(&self.service, txn, true).await
    }

    /// Rolls back transaction `txn` on every partition it enlisted.
    pub async fn rollback(&self, txn: TxnId) -> Result<u64, GridError> {
        self.txns.finish(&self.service, txn, false).await
    }

    /// Applies a membership change. Departed members are dropped from the
    /// partition table (promoting backups) before their in-flight
    /// invocations are failed, so that retries find the new owners.
    pub fn set_members(&self, members: &[Address]) {
        let gone = self.view.set_members(members);
        for member in gone {
            let promoted = self.table.remove_member(member);
            pf_info!(self.me; "member {} left, {} partitions changed owner",
                              member, promoted.len());
            self.service.member_left(member);
        }
    }

    /// Stops accepting invocations, drains in-flight ones within the
    /// configured grace period, then stops the executor and transport.
    pub async fn shutdown(&self) {
        if self.view.state() != NodeState::Active {
            return;
        }
        self.view.set_state(NodeState::ShuttingDown);
        self.service
            .shutdown(Duration::from_millis(self.config.shutdown_grace_ms))
            .await;

        let _ = self.tx_stop.send(()).await;
        let handle = self
            .messenger_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                pf_error!(self.me; "messenger join error: {}", e);
            }
        }

        self.near_caches.shutdown();
        self.executor.shutdown().await;
        self.transport.shutdown().await;
        self.view.set_state(NodeState::Shutdown);
        pf_info!(self.me; "member shut down");
    }
}

// GridNode messenger thread implementation
impl GridNode {
    fn handle_peer_msg(
        me: Address,
        service: &Arc<OperationService>,
        executor: &PartitionExecutor,
        backups: &BackupTracker,
        transport: &Arc<dyn Transport>,
        from: Address,
        msg: PeerMsg,
    ) {
        match msg {
            PeerMsg::Invoke { id, op } if op.is_member_level() => {
                let service = service.clone();
                let transport = transport.clone();
                tokio::spawn(async move {
                    let result = service.run_member_level(op).await;
                    let sent = PeerMsg::Response { id, result }
                        .encode()
                        .and_then(|frame| transport.send(from, frame));
                    if let Err(e) = sent {
                        pf_warn!(me; "error replying {} to {}: {}", id, from, e);
                    }
                });
            }
            PeerMsg::Invoke { id, op } => {
                executor.submit(op, Reply::Remote { to: from, id })
            }
            PeerMsg::Response { id, result } => {
                service.handle_response(id, from, result)
            }
            PeerMsg::Backup {
                partition,
                version,
                op,
                ack,
            } => executor.submit_backup(from, partition, version, op, ack),
            PeerMsg::BackupAck { ack } => backups.ack(ack),
        }
    }

    /// Next peer the transport gave up on; never resolves without a
    /// failure stream.
    async fn next_failure(
        failures: &mut Option<PeerFailures>,
    ) -> Option<(Address, String)> {
        match failures {
            Some(rx_fail) => rx_fail.recv().await,
            None => futures::future::pending().await,
        }
    }

    /// Messenger thread function.
    #[allow(clippy::too_many_arguments)]
    async fn messenger_thread(
        me: Address,
        service: Arc<OperationService>,
        executor: Arc<PartitionExecutor>,
        backups: Arc<BackupTracker>,
        transport: Arc<dyn Transport>,
        mut inbox: Inbox,
        mut failures: Option<PeerFailures>,
        mut rx_stop: mpsc::Receiver<()>,
    ) {
        pf_debug!(me; "messenger thread spawned");

        loop {
            tokio::select! {
                failure = Self::next_failure(&mut failures) => match failure {
                    Some((peer, cause)) => {
                        service.peer_unreachable(peer, &cause);
                    }
                    None => failures = None,
                },

                frame = inbox.recv() => {
                    let (from, frame) = match frame {
                        Some(frame) => frame,
                        None => break,
                    };
                    match to_object::<PeerMsg>(&frame) {
                        Ok(msg) => Self::handle_peer_msg(
                            me,
                            &service,
                            &executor,
                            &backups,
                            &transport,
                            from,
                            msg,
                        ),
                        Err(e) => {
                            pf_error!(me; "error decoding frame from {}: {}", from, e);
                        }
                    }
                },

                _ = rx_stop.recv() => break,
            }
        }

        pf_debug!(me; "messenger thread exitted");
    }
}
