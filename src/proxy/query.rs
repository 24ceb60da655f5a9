//! Scatter-gather map queries: one member-level round over the current
//! members, then a targeted per-partition round for whatever no member
//! claimed.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cluster::Data;
use crate::engine::OperationService;
use crate::operation::{
    OpBody, OpEnvelope, OpResponse, Predicate, QueryOperation,
    QueryPartitionOperation, ThreadId, MAP_SERVICE,
};
use crate::partition::PartitionId;
use crate::utils::{GridError, PartitionSet};

use futures::future::join_all;

use tokio::time::Duration;

/// Merged outcome of a scatter-gather query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResultSet {
    /// Matching entries, one per key, in key byte order.
    pub entries: Vec<(Data, Data)>,

    /// Partitions that had to be queried individually in the second round.
    pub gap_filled: Vec<PartitionId>,
}

/// Marks the partitions a member answered for. An out of range ID stays
/// unclaimed, so the gap-fill round covers it.
fn claim_partitions(
    covered: &mut PartitionSet,
    claimed: &[PartitionId],
    mut on_bogus: impl FnMut(GridError),
) {
    for &p in claimed {
        if let Err(e) = covered.set(p, true) {
            on_bogus(e);
        }
    }
}

/// Runs `predicate` over map `name` on every partition.
pub async fn scatter_gather(
    service: &Arc<OperationService>,
    name: &str,
    thread: ThreadId,
    predicate: &Predicate,
) -> Result<QueryResultSet, GridError> {
    let me = service.me();
    let timeout = Duration::from_millis(service.config().proxy_call_timeout_ms);
    let mut covered = PartitionSet::new(service.table().partition_count(), false);
    let mut entries = BTreeMap::new();

    // first round: every member answers for the partitions it covers
    let members = service.view().current_members();
    let waits = members.iter().map(|&member| {
        let op = OpEnvelope::new(
            MAP_SERVICE,
            name,
            OpBody::Query(QueryOperation {
                predicate: predicate.clone(),
            }),
        )
        .with_thread(thread);
        let mut future = service.invoke_on_target(MAP_SERVICE, op, member);
        async move { (member, future.get_timeout(timeout).await) }
    });
    for (member, result) in join_all(waits).await {
        match result.and_then(OpResponse::into_query) {
            Ok(partial) => {
                claim_partitions(&mut covered, &partial.partition_ids, |e| {
                    pf_warn!(me; "query on {} ignoring claim of {}: {}", name, member, e);
                });
                entries.extend(partial.entries);
            }
            Err(e) => {
                pf_debug!(me; "query on {} got no answer from {}: {}", name, member, e);
            }
        }
    }

    // second round: exactly the partitions nobody claimed
    let gaps = if covered.is_full() {
        vec![]
    } else {
        covered.missing()
    };
    if !gaps.is_empty() {
        pf_debug!(me; "query on {} gap-filling {} partitions, {} claimed",
                      name, gaps.len(), covered.count());
        let waits = gaps.iter().map(|&partition| {
            let op = OpEnvelope::new(
                MAP_SERVICE,
                name,
                OpBody::QueryPartition(QueryPartitionOperation {
                    predicate: predicate.clone(),
                }),
            )
            .with_thread(thread);
            let mut future =
                service.invoke_on_partition(MAP_SERVICE, op, partition);
            async move { (partition, future.get_timeout(timeout).await) }
        });

        let mut failed = vec![];
        for (partition, result) in join_all(waits).await {
            match result.and_then(OpResponse::into_query) {
                Ok(partial) => entries.extend(partial.entries),
                Err(e) => failed.push((partition, e.to_string())),
            }
        }
        if !failed.is_empty() {
            return Err(GridError::PartialAggregate { failed });
        }
    }

    Ok(QueryResultSet {
        entries: entries.into_iter().collect(),
        gap_filled: gaps,
    })
}
