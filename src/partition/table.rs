//! Partition ownership table and key -> partition mapping.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::cluster::Address;
use crate::utils::GridError;

use serde::{Deserialize, Serialize};

use xxhash_rust::xxh64::xxh64;

/// Partition ID type.
pub type PartitionId = u32;

/// Maximum number of backups a partition may have.
pub const MAX_BACKUP_COUNT: usize = 6;

/// Owner and ordered backup list of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartitionReplicas {
    /// Current owner, `None` while the cluster is still stabilizing.
    pub owner: Option<Address>,

    /// Backup owners in replica order.
    pub backups: Vec<Address>,
}

/// Seed of the key hash. Part of the wire contract between members.
const KEY_HASH_SEED: u64 = 0;

/// Maps a serialized key to its partition ID: XXH64 of the key bytes modulo
/// the partition count. Stable across builds and platforms, so every member
/// routes a key the same way.
pub fn partition_id_for_key(key: &[u8], partition_count: u32) -> PartitionId {
    (xxh64(key, KEY_HASH_SEED) % partition_count as u64) as PartitionId
}

/// Read-mostly partition ownership table of one member. Updated only by the
/// membership/migration side; every invocation re-reads it at invoke time.
#[derive(Debug)]
pub struct PartitionTable {
    /// Fixed number of partitions.
    count: u32,

    /// Replica assignment indexed by partition ID.
    replicas: RwLock<Vec<PartitionReplicas>>,

    /// Partitions whose data is still being migrated to this member.
    migrating: RwLock<BTreeSet<PartitionId>>,

    /// Bumped on every update.
    version: AtomicU64,
}

impl PartitionTable {
    /// Creates a table of `count` partitions, all without owner.
    pub fn new(count: u32) -> Result<Self, GridError> {
        if count == 0 {
            return Err(GridError::Misuse("partition count must be > 0".into()));
        }
        Ok(PartitionTable {
            count,
            replicas: RwLock::new(vec![
                PartitionReplicas::default();
                count as usize
            ]),
            migrating: RwLock::new(BTreeSet::new()),
            version: AtomicU64::new(0),
        })
    }

    /// Number of partitions.
    #[inline]
    pub fn partition_count(&self) -> u32 {
        self.count
    }

    /// Table version, bumped on every update.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Partition ID of a serialized key.
    #[inline]
    pub fn partition_id_for_key(&self, key: &[u8]) -> PartitionId {
        partition_id_for_key(key, self.count)
    }

    #[inline]
    fn check_id(&self, partition: PartitionId) -> Result<(), GridError> {
        if partition >= self.count {
            return Err(GridError::Misuse(format!(
                "partition {} out of range [0, {})",
                partition, self.count
            )));
        }
        Ok(())
    }

    /// Snapshot of one partition's replica assignment.
    pub fn replicas(
        &self,
        partition: PartitionId,
    ) -> Result<PartitionReplicas, GridError> {
        self.check_id(partition)?;
        let replicas = self.replicas.read().unwrap_or_else(|e| e.into_inner());
        Ok(replicas[partition as usize].clone())
    }

    /// Current owner of a partition.
    pub fn owner_of(
        &self,
        partition: PartitionId,
    ) -> Result<Address, GridError> {
        self.replicas(partition)?
            .owner
            .ok_or(GridError::NoOwner { partition })
    }

    /// Current backup owners of a partition, in replica order.
    pub fn backups_of(
        &self,
        partition: PartitionId,
    ) -> Result<Vec<Address>, GridError> {
        Ok(self.replicas(partition)?.backups)
    }

    /// Partitions currently owned by given member.
    pub fn owned_by(&self, member: Address) -> Vec<PartitionId> {
        let replicas = self.replicas.read().unwrap_or_else(|e| e.into_inner());
        replicas
            .iter()
            .enumerate()
            .filter(|(_, r)| r.owner == Some(member))
            .map(|(p, _)| p as PartitionId)
            .collect()
    }

    /// Partitions owned by given member whose data is fully in place, i.e.,
    /// not mid-migration. This is what a member answers for in queries.
    pub fn covered_by(&self, member: Address) -> Vec<PartitionId> {
        let migrating = self.migrating.read().unwrap_or_else(|e| e.into_inner());
        self.owned_by(member)
            .into_iter()
            .filter(|p| !migrating.contains(p))
            .collect()
    }

    /// Flags a partition as mid-migration (or clears the flag).
    pub fn set_migrating(
        &self,
        partition: PartitionId,
        flag: bool,
    ) -> Result<(), GridError> {
        self.check_id(partition)?;
        let mut migrating =
            self.migrating.write().unwrap_or_else(|e| e.into_inner());
        if flag {
            migrating.insert(partition);
        } else {
            migrating.remove(&partition);
        }
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Replaces one partition's assignment.
    pub fn set_replicas(
        &self,
        partition: PartitionId,
        assignment: PartitionReplicas,
    ) -> Result<(), GridError> {
        self.check_id(partition)?;
        if assignment.backups.len() > MAX_BACKUP_COUNT {
            return Err(GridError::Misuse(format!(
                "too many backups ({}) for partition {}",
                assignment.backups.len(),
                partition
            )));
        }
        if let Some(owner) = assignment.owner {
            if assignment.backups.contains(&owner) {
                return Err(GridError::Misuse(format!(
                    "owner {} also listed as backup of partition {}",
                    owner, partition
                )));
            }
        }

        let mut replicas =
            self.replicas.write().unwrap_or_else(|e| e.into_inner());
        replicas[partition as usize] = assignment;
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Assigns every partition round-robin over `members`: partition `p` is
    /// owned by `members[p % n]` and backed up by the next members in order,
    /// up to `backup_count` of them.
    pub fn assign_round_robin(
        &self,
        members: &[Address],
        backup_count: usize,
    ) -> Result<(), GridError> {
        if members.is_empty() {
            return Err(GridError::Misuse("empty member list".into()));
        }
        if backup_count > MAX_BACKUP_COUNT {
            return Err(GridError::Misuse(format!(
                "invalid backup count {}",
                backup_count
            )));
        }

        let n = members.len();
        let backups = backup_count.min(n - 1);
        let mut replicas =
            self.replicas.write().unwrap_or_else(|e| e.into_inner());
        for (p, assignment) in replicas.iter_mut().enumerate() {
            assignment.owner = Some(members[p % n]);
            assignment.backups =
                (1..=backups).map(|i| members[(p + i) % n]).collect();
        }
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Drops a departed member from every assignment, promoting the first
    /// backup to owner where the departed member was the owner. Returns the
    /// partitions whose owner changed.
    pub fn remove_member(&self, member: Address) -> Vec<PartitionId> {
        let mut promoted = vec![];
        let mut replicas =
            self.replicas.write().unwrap_or_else(|e| e.into_inner());
        for (p, assignment) in replicas.iter_mut().enumerate() {
            assignment.backups.retain(|&b| b != member);
            if assignment.owner == Some(member) {
                assignment.owner = if assignment.backups.is_empty() {
                    None
                } else {
                    Some(assignment.backups.remove(0))
                };
                promoted.push(p as PartitionId);
            }
        }
        self.version.fetch_add(1, Ordering::AcqRel);
        promoted
    }
}
