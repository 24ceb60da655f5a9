//! Operation service: routes operations to partition owners or explicit
//! members, tracks every invocation until it completes exactly once, and
//! retries invocations whose target stopped owning the partition.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cluster::{Address, ClusterView, NodeState, Transport};
use crate::config::GridConfig;
use crate::engine::{
    InterceptorRegistry, InvocationFuture, InvocationId, InvocationRegistry,
    PartitionExecutor, PeerMsg, Reply,
};
use crate::operation::{
    InterceptorOperation, OpBody, OpEnvelope, OpResponse, QueryPartitionOperation,
    QueryResult,
};
use crate::partition::{PartitionId, PartitionTable};
use crate::utils::{GridError, Timer};

use futures::future::join_all;

use tokio::sync::{oneshot, Notify};
use tokio::time::{self, Duration};

/// Per-partition outcomes of a fan-out. Failed partitions are kept as
/// failure entries, never dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionResults(BTreeMap<PartitionId, Result<OpResponse, GridError>>);

impl PartitionResults {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(
        &self,
        partition: PartitionId,
    ) -> Option<&Result<OpResponse, GridError>> {
        self.0.get(&partition)
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&PartitionId, &Result<OpResponse, GridError>)> {
        self.0.iter()
    }

    /// Partitions that failed, with their causes.
    pub fn failures(&self) -> Vec<(PartitionId, String)> {
        self.0
            .iter()
            .filter_map(|(&p, r)| r.as_ref().err().map(|e| (p, e.to_string())))
            .collect()
    }

    /// All responses, or `PartialAggregate` if any partition failed. Used by
    /// aggregates that are meaningless when incomplete.
    pub fn into_complete(
        self,
    ) -> Result<BTreeMap<PartitionId, OpResponse>, GridError> {
        let failed = self.failures();
        if !failed.is_empty() {
            return Err(GridError::PartialAggregate { failed });
        }
        Ok(self
            .0
            .into_iter()
            .filter_map(|(p, r)| r.ok().map(|resp| (p, resp)))
            .collect())
    }
}

/// Count of accepted but not yet completed invocations.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    notify: Notify,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard(self.clone())
    }

    async fn drained(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.notify.notify_waiters();
        }
    }
}

/// One registered remote round trip; forgotten when the attempt is over,
/// however it ends.
struct Registration<'a> {
    registry: &'a InvocationRegistry,
    id: InvocationId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.forget(self.id);
    }
}

/// The operation service of one member.
pub struct OperationService {
    me: Address,
    config: Arc<GridConfig>,
    view: Arc<ClusterView>,
    table: Arc<PartitionTable>,
    transport: Arc<dyn Transport>,
    executor: Arc<PartitionExecutor>,
    registry: InvocationRegistry,
    interceptors: Arc<InterceptorRegistry>,
    in_flight: Arc<InFlight>,

    /// Cleared once shutdown begins.
    accepting: AtomicBool,
}

// OperationService public API implementation
impl OperationService {
    pub fn new(
        config: Arc<GridConfig>,
        view: Arc<ClusterView>,
        table: Arc<PartitionTable>,
        transport: Arc<dyn Transport>,
        executor: Arc<PartitionExecutor>,
        interceptors: Arc<InterceptorRegistry>,
    ) -> Self {
        OperationService {
            me: view.me(),
            config,
            view,
            table,
            transport,
            executor,
            registry: InvocationRegistry::new(),
            interceptors,
            in_flight: Arc::new(InFlight::default()),
            accepting: AtomicBool::new(true),
        }
    }

    #[inline]
    pub fn me(&self) -> Address {
        self.me
    }

    #[inline]
    pub fn table(&self) -> &Arc<PartitionTable> {
        &self.table
    }

    #[inline]
    pub fn view(&self) -> &Arc<ClusterView> {
        &self.view
    }

    #[inline]
    pub fn config(&self) -> &Arc<GridConfig> {
        &self.config
    }

    #[inline]
    pub fn interceptors(&self) -> &Arc<InterceptorRegistry> {
        &self.interceptors
    }

    /// Number of remote round trips waiting for a response.
    pub fn pending_remote(&self) -> usize {
        self.registry.len()
    }

    /// Invokes `op` on the current owner of `partition`, executing it in
    /// process if that is this member.
    pub fn invoke_on_partition(
        self: &Arc<Self>,
        service: &str,
        mut op: OpEnvelope,
        partition: PartitionId,
    ) -> InvocationFuture {
        let id = self.registry.next_id();
        let guard = match self.admit() {
            Ok(guard) => guard,
            Err(e) => return InvocationFuture::ready(id, Err(e)),
        };
        op.header.service = service.into();
        op.header.partition = Some(partition);

        let this = self.clone();
        self.spawn_invocation(id, guard, async move {
            this.drive_partition(id, op, partition).await
        })
    }

    /// Invokes a member-level `op` on `target`, bypassing partition routing.
    pub fn invoke_on_target(
        self: &Arc<Self>,
        service: &str,
        mut op: OpEnvelope,
        target: Address,
    ) -> InvocationFuture {
        let id = self.registry.next_id();
        if !op.is_member_level() {
            return InvocationFuture::ready(
                id,
                Err(GridError::Misuse(format!(
                    "{} cannot be invoked on a target",
                    op
                ))),
            );
        }
        let guard = match self.admit() {
            Ok(guard) => guard,
            Err(e) => return InvocationFuture::ready(id, Err(e)),
        };
        op.header.service = service.into();
        op.header.partition = None;

        let this = self.clone();
        self.spawn_invocation(id, guard, async move {
            this.dispatch(id, target, op).await
        })
    }

    /// Invokes one copy of `op` per partition and collects every outcome.
    pub async fn invoke_on_all_partitions(
        self: &Arc<Self>,
        service: &str,
        op: OpEnvelope,
    ) -> PartitionResults {
        let partitions = (0..self.table.partition_count()).collect();
        self.fan_out(service, op, partitions).await
    }

    /// Like `invoke_on_all_partitions`, restricted to the partitions
    /// currently owned by `target`.
    pub async fn invoke_on_target_partitions(
        self: &Arc<Self>,
        service: &str,
        op: OpEnvelope,
        target: Address,
    ) -> PartitionResults {
        let partitions = self.table.owned_by(target);
        self.fan_out(service, op, partitions).await
    }

    /// Runs a member-level operation on this member.
    pub async fn run_member_level(
        &self,
        op: OpEnvelope,
    ) -> Result<OpResponse, GridError> {
        let OpEnvelope { header, body } = op;
        match body {
            OpBody::Query(query) => {
                let mut waits = vec![];
                for partition in self.table.covered_by(self.me) {
                    let mut scan = OpEnvelope::new(
                        &header.service,
                        &header.name,
                        OpBody::QueryPartition(QueryPartitionOperation {
                            predicate: query.predicate.clone(),
                        }),
                    )
                    .with_thread(header.thread);
                    scan.header.partition = Some(partition);
                    let (tx_done, rx_done) = oneshot::channel();
                    self.executor.submit(scan, Reply::Local(tx_done));
                    waits.push((partition, rx_done));
                }

                // a partition that fails to answer is simply not claimed
                let mut result = QueryResult::default();
                for (partition, rx_done) in waits {
                    match rx_done
                        .await
                        .unwrap_or(Err(GridError::ShuttingDown))
                        .and_then(OpResponse::into_query)
                    {
                        Ok(partial) => result.merge(partial),
                        Err(e) => {
                            pf_debug!(self.me; "partition {} left out of query on {}: {}",
                                               partition, header.name, e);
                        }
                    }
                }
                Ok(OpResponse::Query(result))
            }

            OpBody::Interceptor(InterceptorOperation::Add { id, interceptor }) => {
                Ok(OpResponse::Bool(self.interceptors.add(
                    &header.name,
                    &id,
                    interceptor,
                )))
            }
            OpBody::Interceptor(InterceptorOperation::Remove { id }) => Ok(
                OpResponse::Bool(self.interceptors.remove(&header.name, &id)),
            ),

            _ => Err(GridError::Misuse(format!(
                "{} is not a member-level operation",
                header.name
            ))),
        }
    }

    /// Completes a remote round trip with the response that came back.
    pub fn handle_response(
        &self,
        id: InvocationId,
        from: Address,
        result: Result<OpResponse, GridError>,
    ) {
        if !self.registry.complete(id, from, result) {
            pf_debug!(self.me; "dropped late response to invocation {} from {}",
                               id, from);
        }
    }

    /// Fails the round trips waiting on a peer the transport gave up on,
    /// since whatever was queued for it is lost.
    pub fn peer_unreachable(&self, peer: Address, cause: &str) -> usize {
        let failed = self.registry.fail_target(
            peer,
            GridError::Unreachable {
                target: peer,
                cause: cause.into(),
            },
        );
        if failed > 0 {
            pf_warn!(self.me; "failed {} invocations waiting on unreachable {}: {}",
                              failed, peer, cause);
        }
        failed
    }

    /// Fails the round trips waiting on a departed member. Partition
    /// invocations among them get retried against the new owner.
    pub fn member_left(&self, member: Address) -> usize {
        let failed = self
            .registry
            .fail_target(member, GridError::MemberLeft { member });
        if failed > 0 {
            pf_info!(self.me; "failed {} invocations waiting on departed {}",
                              failed, member);
        }
        failed
    }

    /// Stops accepting invocations, waits up to `grace` for in-flight ones,
    /// then fails whatever is still waiting on a remote response.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::Release);
        if time::timeout(grace, self.in_flight.drained()).await.is_err() {
            pf_warn!(self.me; "{} invocations still in flight after {:?}",
                              self.in_flight.count.load(Ordering::Acquire), grace);
        }
        let failed = self.registry.fail_all(GridError::ShuttingDown);
        pf_debug!(self.me; "operation service shut down, failed {} pending", failed);
    }
}

// OperationService internal routing implementation
impl OperationService {
    fn admit(&self) -> Result<InFlightGuard, GridError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(GridError::ShuttingDown);
        }
        match self.view.state() {
            NodeState::Active => Ok(self.in_flight.enter()),
            NodeState::Starting => Err(GridError::NotActive),
            NodeState::ShuttingDown | NodeState::Shutdown => {
                Err(GridError::ShuttingDown)
            }
        }
    }

    #[inline]
    fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.config.proxy_call_timeout_ms)
    }

    /// Runs an admitted invocation on its own task. The task settles the
    /// returned future, or stops early once the future timed out or was
    /// cancelled.
    fn spawn_invocation<F>(
        &self,
        id: InvocationId,
        guard: InFlightGuard,
        work: F,
    ) -> InvocationFuture
    where
        F: Future<Output = Result<OpResponse, GridError>> + Send + 'static,
    {
        let (tx_done, rx_done) = oneshot::channel();
        let (tx_abandon, rx_abandon) = oneshot::channel();
        let me = self.me;
        tokio::spawn(async move {
            tokio::select! {
                result = work => {
                    let _ = tx_done.send(result);
                },

                // a dropped future is not an abandonment
                Ok(()) = rx_abandon => {
                    pf_debug!(me; "invocation {} abandoned by its caller", id);
                },
            }
            drop(guard);
        });
        InvocationFuture::abandonable(id, rx_done, tx_abandon)
    }

    /// Resolves the owner and dispatches, re-resolving on ownership moves.
    async fn drive_partition(
        &self,
        id: InvocationId,
        op: OpEnvelope,
        partition: PartitionId,
    ) -> Result<OpResponse, GridError> {
        let mut timer =
            Timer::new(Duration::from_millis(self.config.retry_backoff_max_ms));
        let mut attempts = 0;
        loop {
            let owner = self.table.owner_of(partition)?;
            match self.dispatch(id, owner, op.clone()).await {
                Err(
                    e @ (GridError::WrongTarget { .. }
                    | GridError::MemberLeft { .. }),
                ) if attempts < self.config.invocation_retries => {
                    attempts += 1;
                    timer.backoff(Duration::from_millis(
                        self.config.retry_backoff_ms,
                    ))?;
                    pf_debug!(self.me; "retry #{} of invocation {} {} on partition {} in {:?}: {}",
                                       attempts, id, op, partition, timer.get_dur(), e);
                    timer.timeout().await;
                    if !self.accepting.load(Ordering::Acquire) {
                        return Err(GridError::ShuttingDown);
                    }
                }
                result => return result,
            }
        }
    }

    /// One round trip to `target`, or a direct local execution.
    async fn dispatch(
        &self,
        id: InvocationId,
        target: Address,
        op: OpEnvelope,
    ) -> Result<OpResponse, GridError> {
        if target == self.me {
            if op.is_member_level() {
                return self.run_member_level(op).await;
            }
            let (tx_done, rx_done) = oneshot::channel();
            self.executor.submit(op, Reply::Local(tx_done));
            return rx_done.await.unwrap_or(Err(GridError::ShuttingDown));
        }

        let rx_done = self.registry.register(id, target);
        let _registration = Registration {
            registry: &self.registry,
            id,
        };
        // registered before the check, so a concurrent departure cannot
        // slip between them unnoticed
        if !self.view.is_member(target) {
            return Err(GridError::MemberLeft { member: target });
        }
        pf_trace!(self.me; "invocation {} sends {} to {}", id, op, target);
        PeerMsg::Invoke { id, op }
            .encode()
            .and_then(|frame| self.transport.send(target, frame))?;
        rx_done.await.unwrap_or(Err(GridError::ShuttingDown))
    }

    async fn fan_out(
        self: &Arc<Self>,
        service: &str,
        op: OpEnvelope,
        partitions: Vec<PartitionId>,
    ) -> PartitionResults {
        let timeout = self.call_timeout();
        let waits = partitions.into_iter().map(|partition| {
            let mut future =
                self.invoke_on_partition(service, op.clone(), partition);
            async move { (partition, future.get_timeout(timeout).await) }
        });
        PartitionResults(join_all(waits).await.into_iter().collect())
    }
}

#[cfg(test)]
mod service_tests {
    use super::*;
    use crate::operation::{MapOperation, MAP_SERVICE};
    use crate::partition::PartitionReplicas;
    use crate::testkit::TestCluster;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn all_partitions_one_entry_each() -> Result<(), GridError> {
        let cluster = TestCluster::start(3, 8, 1).await?;
        let service = cluster.nodes[0].service();
        let results = service
            .invoke_on_all_partitions(
                MAP_SERVICE,
                OpEnvelope::map("m", MapOperation::Size),
            )
            .await;
        assert_eq!(results.len(), 8);
        for p in 0..8 {
            assert_eq!(results.get(p), Some(&Ok(OpResponse::Size(0))));
        }
        assert!(results.into_complete().is_ok());
        cluster.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn target_partitions_restricted() -> Result<(), GridError> {
        let cluster = TestCluster::start(2, 6, 0).await?;
        let service = cluster.nodes[0].service();
        let other = cluster.addr(1);
        let results = service
            .invoke_on_target_partitions(
                MAP_SERVICE,
                OpEnvelope::map("m", MapOperation::Size),
                other,
            )
            .await;
        let keys: Vec<PartitionId> = results.iter().map(|(&p, _)| p).collect();
        assert_eq!(keys, vec![1, 3, 5]);
        cluster.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unreachable_owner_yields_failure_entry() -> Result<(), GridError> {
        let cluster = TestCluster::start(2, 4, 0).await?;
        cluster.fabric.sever(cluster.addr(1));
        let results = cluster.nodes[0]
            .service()
            .invoke_on_all_partitions(
                MAP_SERVICE,
                OpEnvelope::map("m", MapOperation::Size),
            )
            .await;
        assert_eq!(results.len(), 4);
        assert!(matches!(results.get(1), Some(Err(GridError::Unreachable { .. }))));
        assert_eq!(results.get(0), Some(&Ok(OpResponse::Size(0))));
        assert!(matches!(
            results.into_complete(),
            Err(GridError::PartialAggregate { failed }) if failed.len() == 2
        ));
        cluster.fabric.heal(cluster.addr(1));
        cluster.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_owner_is_not_connectivity() -> Result<(), GridError> {
        let cluster = TestCluster::start(1, 4, 0).await?;
        let node = &cluster.nodes[0];
        node.table().set_replicas(2, Default::default())?;
        let mut future = node.service().invoke_on_partition(
            MAP_SERVICE,
            OpEnvelope::map("m", MapOperation::Size),
            2,
        );
        let err = future.get().await.unwrap_err();
        assert_eq!(err, GridError::NoOwner { partition: 2 });
        assert!(err.is_retryable());
        cluster.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn target_requires_member_level() -> Result<(), GridError> {
        let cluster = TestCluster::start(2, 4, 0).await?;
        let mut future = cluster.nodes[0].service().invoke_on_target(
            MAP_SERVICE,
            OpEnvelope::map("m", MapOperation::Size),
            cluster.addr(1),
        );
        assert!(matches!(future.get().await, Err(GridError::Misuse(_))));
        cluster.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn wrong_target_retried_until_table_catches_up() -> Result<(), GridError> {
        let cluster = TestCluster::start(2, 4, 0).await?;
        let (n0, n1) = (&cluster.nodes[0], &cluster.nodes[1]);
        let moved = PartitionReplicas {
            owner: Some(cluster.addr(0)),
            backups: vec![],
        };

        // partition 1 moved to member 0, but member 0 has not heard yet
        n1.table().set_replicas(1, moved.clone())?;
        let mut future = n0.service().invoke_on_partition(
            MAP_SERVICE,
            OpEnvelope::map("m", MapOperation::Size),
            1,
        );
        time::sleep(Duration::from_millis(30)).await;
        n0.table().set_replicas(1, moved)?;
        assert_eq!(future.get().await?, OpResponse::Size(0));
        cluster.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_rejects_new_invocations() -> Result<(), GridError> {
        let cluster = TestCluster::start(1, 4, 0).await?;
        let service = cluster.nodes[0].service().clone();
        service.shutdown(Duration::from_millis(100)).await;
        let mut future = service.invoke_on_partition(
            MAP_SERVICE,
            OpEnvelope::map("m", MapOperation::Size),
            0,
        );
        assert_eq!(future.get().await, Err(GridError::ShuttingDown));
        cluster.shutdown().await;
        Ok(())
    }
}
