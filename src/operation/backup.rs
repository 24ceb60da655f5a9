//! Replica-side counterparts of backup-aware operations. A backup op carries
//! the resolved effect (e.g. an index, a concrete value) rather than the
//! client input, so applying it never re-derives anything.

use crate::cluster::Data;
use crate::engine::PartitionStore;
use crate::operation::ThreadId;

use serde::{Deserialize, Serialize};

/// Map effects replicated to backups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapBackup {
    Put {
        key: Data,
        value: Data,
        ttl_ms: Option<u64>,
    },
    PutTransient {
        key: Data,
        value: Data,
        ttl_ms: Option<u64>,
    },
    Remove { key: Data },
    Clear,
    Lock { key: Data, thread: ThreadId },
    Unlock {
        key: Data,
        thread: ThreadId,
        force: bool,
    },
    AddIndex { attribute: String, ordered: bool },
}

/// List effects replicated to backups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListBackup {
    Add { value: Data },
    Clear,
    RemoveIndex { index: i64 },
}

/// Backup operation shipped to every backup owner of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupOperation {
    Map { name: String, op: MapBackup },
    List { name: String, op: ListBackup },
    Batch(Vec<BackupOperation>),
}

impl BackupOperation {
    /// Applies the effect to a replica's partition store. Duplicate delivery
    /// is filtered out by the caller through the backup version.
    pub fn apply(&self, store: &mut PartitionStore) {
        match self {
            BackupOperation::Map { name, op } => match op {
                MapBackup::Put { key, value, ttl_ms } => {
                    store.map(name).put(key.clone(), value.clone(), *ttl_ms);
                }
                MapBackup::PutTransient { key, value, ttl_ms } => {
                    store
                        .map(name)
                        .put_transient(key.clone(), value.clone(), *ttl_ms);
                }
                MapBackup::Remove { key } => {
                    store.map(name).remove(key);
                }
                MapBackup::Clear => {
                    store.map(name).clear();
                }
                MapBackup::Lock { key, thread } => {
                    store.lock(name, key, *thread);
                }
                MapBackup::Unlock { key, thread, force } => {
                    if *force {
                        store.force_unlock(name, key);
                    } else {
                        let _ = store.unlock(name, key, *thread);
                    }
                }
                MapBackup::AddIndex { attribute, ordered } => {
                    store.map(name).add_index(attribute, *ordered);
                }
            },

            BackupOperation::List { name, op } => {
                let list = store.list(name);
                match op {
                    ListBackup::Add { value } => list.push(value.clone()),
                    ListBackup::Clear => list.clear(),
                    ListBackup::RemoveIndex { index } => {
                        if *index >= 0 && (*index as usize) < list.len() {
                            list.remove(*index as usize);
                        }
                    }
                }
            }

            BackupOperation::Batch(ops) => {
                for op in ops {
                    op.apply(store);
                }
            }
        }
    }

    /// Whether applying would do nothing.
    pub fn is_noop(&self) -> bool {
        match self {
            BackupOperation::Batch(ops) => ops.iter().all(|op| op.is_noop()),
            _ => false,
        }
    }
}
