//! Map query predicates and the two query operations used by the
//! scatter-gather engine: the member-level `QueryOperation` and the
//! partition-level `QueryPartitionOperation` used for gap-filling.

use crate::cluster::{to_data, Data};
use crate::operation::{OpContext, OpResponse, Operation};
use crate::partition::PartitionId;
use crate::utils::GridError;

use serde::{Deserialize, Serialize};

/// Predicate over serialized map entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predicate {
    All,
    KeyIn(Vec<Data>),
    ValueEquals(Data),
    ValueIn(Vec<Data>),
    Not(Box<Predicate>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    /// Matches entries whose key is one of `keys`.
    pub fn key_in<K: Serialize>(keys: &[K]) -> Result<Self, GridError> {
        Ok(Predicate::KeyIn(
            keys.iter().map(to_data).collect::<Result<_, _>>()?,
        ))
    }

    /// Matches entries whose value equals `value`.
    pub fn value_equals<V: Serialize>(value: &V) -> Result<Self, GridError> {
        Ok(Predicate::ValueEquals(to_data(value)?))
    }

    /// Matches entries whose value is one of `values`.
    pub fn value_in<V: Serialize>(values: &[V]) -> Result<Self, GridError> {
        Ok(Predicate::ValueIn(
            values.iter().map(to_data).collect::<Result<_, _>>()?,
        ))
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    pub fn matches(&self, key: &Data, value: &Data) -> bool {
        match self {
            Predicate::All => true,
            Predicate::KeyIn(keys) => keys.contains(key),
            Predicate::ValueEquals(v) => v == value,
            Predicate::ValueIn(values) => values.contains(value),
            Predicate::Not(p) => !p.matches(key, value),
            Predicate::And(ps) => ps.iter().all(|p| p.matches(key, value)),
            Predicate::Or(ps) => ps.iter().any(|p| p.matches(key, value)),
        }
    }
}

/// Matches of a query together with the partitions they cover.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Partitions actually scanned.
    pub partition_ids: Vec<PartitionId>,

    pub entries: Vec<(Data, Data)>,
}

impl QueryResult {
    /// Folds another partial result into this one.
    pub fn merge(&mut self, other: QueryResult) {
        self.partition_ids.extend(other.partition_ids);
        self.entries.extend(other.entries);
    }
}

/// Member-level query: the receiving member scans the partitions it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOperation {
    pub predicate: Predicate,
}

/// Scans one partition of a map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPartitionOperation {
    pub predicate: Predicate,
}

impl Operation for QueryPartitionOperation {
    type Local = ();

    fn run(
        &mut self,
        ctx: &mut OpContext<'_>,
        _local: &mut (),
    ) -> Result<OpResponse, GridError> {
        let entries = match ctx.store.existing_map(&ctx.header.name) {
            Some(map) => map
                .entries()
                .into_iter()
                .filter(|(k, v)| self.predicate.matches(k, v))
                .collect(),
            None => vec![],
        };
        Ok(OpResponse::Query(QueryResult {
            partition_ids: vec![ctx.partition],
            entries,
        }))
    }

    fn is_partition_level(&self) -> bool {
        true
    }
}
