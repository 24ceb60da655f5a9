//! Partitioning of the keyspace and partition ownership.

mod table;

pub use table::{
    partition_id_for_key, PartitionId, PartitionReplicas, PartitionTable,
    MAX_BACKUP_COUNT,
};
