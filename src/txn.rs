//! Explicit call context and transaction participant bookkeeping.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use crate::engine::OperationService;
use crate::operation::{
    OpBody, OpEnvelope, OpResponse, ThreadId, TxnFinishOperation, TxnId,
    MAP_SERVICE,
};
use crate::partition::PartitionId;
use crate::utils::GridError;

use rand::Rng;

use tokio::time::Duration;

/// Identity of a caller, passed into every proxy call: the thread (or
/// session) ID that lock ownership is checked against, and the transaction
/// the call belongs to, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallContext {
    pub thread: ThreadId,
    pub txn: Option<TxnId>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    /// A fresh non-transactional context with a random thread ID.
    pub fn new() -> Self {
        CallContext {
            thread: rand::thread_rng().gen_range(1..u64::MAX),
            txn: None,
        }
    }

    pub fn with_thread(thread: ThreadId) -> Self {
        CallContext { thread, txn: None }
    }

    /// Same caller, inside transaction `txn`.
    pub fn in_txn(self, txn: TxnId) -> Self {
        CallContext {
            txn: Some(txn),
            ..self
        }
    }
}

/// Which partitions each active transaction has touched.
#[derive(Debug, Default)]
pub struct TransactionTracker {
    enlisted: Mutex<HashMap<TxnId, BTreeSet<PartitionId>>>,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a transaction with a fresh random ID.
    pub fn begin(&self) -> TxnId {
        let mut enlisted = self.lock();
        let mut rng = rand::thread_rng();
        loop {
            let txn = rng.gen_range(1..u64::MAX);
            if let std::collections::hash_map::Entry::Vacant(e) =
                enlisted.entry(txn)
            {
                e.insert(BTreeSet::new());
                return txn;
            }
        }
    }

    pub fn is_active(&self, txn: TxnId) -> bool {
        self.lock().contains_key(&txn)
    }

    /// Records that `txn` touched `partition`. Returns true on the first
    /// touch, false if the partition was already enlisted.
    pub fn enlist(
        &self,
        txn: TxnId,
        partition: PartitionId,
    ) -> Result<bool, GridError> {
        match self.lock().get_mut(&txn) {
            Some(partitions) => Ok(partitions.insert(partition)),
            None => Err(GridError::Misuse(format!(
                "transaction {} is not active",
                txn
            ))),
        }
    }

    /// Enlisted partitions of `txn`, in ID order.
    pub fn participants(&self, txn: TxnId) -> Vec<PartitionId> {
        self.lock()
            .get(&txn)
            .map_or(vec![], |partitions| partitions.iter().copied().collect())
    }

    /// Total number of (transaction, partition) enlistment records.
    pub fn record_count(&self) -> usize {
        self.lock().values().map(BTreeSet::len).sum()
    }

    /// Ends `txn`: issues a commit or rollback to every enlisted partition
    /// and drops the enlistments. Partitions are finished independently,
    /// each waited for up to the proxy call timeout; any failed or silent
    /// one makes the whole call fail with `PartialAggregate`. Returns the
    /// number of undo records processed.
    pub async fn finish(
        &self,
        service: &Arc<OperationService>,
        txn: TxnId,
        commit: bool,
    ) -> Result<u64, GridError> {
        let partitions = self.lock().remove(&txn).ok_or_else(|| {
            GridError::Misuse(format!("transaction {} is not active", txn))
        })?;

        let mut futures = vec![];
        for &partition in &partitions {
            let op = OpEnvelope::new(
                MAP_SERVICE,
                "",
                OpBody::TxnFinish(TxnFinishOperation { commit }),
            )
            .with_txn(Some(txn));
            futures.push((
                partition,
                service.invoke_on_partition(MAP_SERVICE, op, partition),
            ));
        }

        let timeout =
            Duration::from_millis(service.config().proxy_call_timeout_ms);
        let mut touched = 0;
        let mut failed = vec![];
        for (partition, mut future) in futures {
            match future
                .get_timeout(timeout)
                .await
                .and_then(OpResponse::into_size)
            {
                Ok(n) => touched += n,
                Err(e) => failed.push((partition, e.to_string())),
            }
        }
        if !failed.is_empty() {
            pf_warn!(service.me(); "txn {} {} failed on {} partitions",
                                   txn, if commit { "commit" } else { "rollback" },
                                   failed.len());
            return Err(GridError::PartialAggregate { failed });
        }
        pf_debug!(service.me(); "txn {} finished on {} partitions", txn, partitions.len());
        Ok(touched)
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<TxnId, BTreeSet<PartitionId>>> {
        self.enlisted.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod txn_tests {
    use super::*;
    use crate::cluster::Address;
    use crate::config::GridConfig;
    use crate::partition::PartitionReplicas;
    use crate::testkit::TestCluster;
    use tokio::time::{self, Instant};

    #[test]
    fn enlist_once_per_partition() -> Result<(), GridError> {
        let tracker = TransactionTracker::new();
        let txn = tracker.begin();
        assert!(tracker.enlist(txn, 5)?);
        assert!(!tracker.enlist(txn, 5)?);
        assert_eq!(tracker.record_count(), 1);
        assert_eq!(tracker.participants(txn), vec![5]);
        Ok(())
    }

    #[test]
    fn independent_transactions() -> Result<(), GridError> {
        let tracker = TransactionTracker::new();
        let (t1, t2) = (tracker.begin(), tracker.begin());
        assert_ne!(t1, t2);
        assert!(tracker.enlist(t1, 5)?);
        assert!(tracker.enlist(t2, 5)?);
        assert_eq!(tracker.record_count(), 2);
        assert!(tracker.enlist(777, 5).is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn silent_participant_bounds_finish() -> Result<(), GridError> {
        let config = GridConfig {
            partition_count: 4,
            worker_count: 2,
            proxy_call_timeout_ms: 200,
            shutdown_grace_ms: 5000,
            ..Default::default()
        };
        let cluster = TestCluster::start_with(1, config).await?;
        let node = &cluster.nodes[0];

        // a member that takes frames but never answers owns partition 2
        let silent = Address::from(([127, 0, 0, 1], 5799));
        let (_silent, _silent_inbox) = cluster.fabric.join(silent)?;
        node.set_members(&[cluster.addr(0), silent]);
        node.table().set_replicas(
            2,
            PartitionReplicas {
                owner: Some(silent),
                backups: vec![],
            },
        )?;

        let txn = node.transactions().begin();
        node.transactions().enlist(txn, 0)?;
        node.transactions().enlist(txn, 2)?;
        let start = Instant::now();
        let err = node.commit(txn).await.unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(2));
        match err {
            GridError::PartialAggregate { failed } => {
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].0, 2);
            }
            e => panic!("unexpected {:?}", e),
        }
        assert!(!node.transactions().is_active(txn));

        // the timed-out round trip is dropped, not left pending
        for _ in 0..50 {
            if node.service().pending_remote() == 0 {
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(node.service().pending_remote(), 0);

        // nothing is left in flight, so shutdown does not sit out its grace
        let start = Instant::now();
        cluster.shutdown().await;
        assert!(start.elapsed() < Duration::from_secs(2));
        Ok(())
    }

    #[test]
    fn context_stamping() {
        let ctx = CallContext::with_thread(3);
        assert_eq!(ctx.txn, None);
        let in_txn = ctx.in_txn(9);
        assert_eq!(in_txn.thread, 3);
        assert_eq!(in_txn.txn, Some(9));
        assert_ne!(CallContext::new().thread, 0);
    }
}
