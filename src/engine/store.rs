//! Partition-local data: record stores, lists, key locks, transaction undo
//! logs. A `PartitionStore` is owned by exactly one executor worker, so
//! nothing in here is synchronized.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::cluster::{Address, Data};
use crate::operation::{ThreadId, TxnId};
use crate::partition::PartitionId;
use crate::utils::DomainError;

use serde::{Deserialize, Serialize};

/// One map entry.
#[derive(Debug, Clone)]
pub struct Record {
    pub value: Data,
    pub expires_at: Option<Instant>,

    /// Put through `put_transient`: held in memory only, never handed to
    /// anything persisting the map.
    pub transient: bool,
}

/// Snapshot of one live entry with its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryView {
    pub key: Data,
    pub value: Data,

    /// Time left before expiry, `None` if the entry never expires.
    pub expires_in_ms: Option<u64>,
    pub transient: bool,
}

impl Record {
    fn new(value: Data, ttl_ms: Option<u64>, transient: bool) -> Self {
        Record {
            value,
            expires_at: ttl_ms
                .filter(|&ttl| ttl > 0)
                .map(|ttl| Instant::now() + Duration::from_millis(ttl)),
            transient,
        }
    }

    #[inline]
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// Entries of one map inside one partition.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: HashMap<Data, Record>,

    /// Attribute name -> ordered flag of indexes added to this map.
    indexes: BTreeMap<String, bool>,
}

impl RecordStore {
    /// Drops expired records.
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.records.retain(|_, r| !r.expired(now));
    }

    /// Value of a live record.
    pub fn get(&mut self, key: &Data) -> Option<Data> {
        let now = Instant::now();
        match self.records.get(key) {
            Some(r) if r.expired(now) => {
                self.records.remove(key);
                None
            }
            Some(r) => Some(r.value.clone()),
            None => None,
        }
    }

    /// Inserts or overwrites, returning the previous live value.
    pub fn put(
        &mut self,
        key: Data,
        value: Data,
        ttl_ms: Option<u64>,
    ) -> Option<Data> {
        self.insert(key, Record::new(value, ttl_ms, false))
    }

    /// Like `put`, marking the record transient.
    pub fn put_transient(
        &mut self,
        key: Data,
        value: Data,
        ttl_ms: Option<u64>,
    ) -> Option<Data> {
        self.insert(key, Record::new(value, ttl_ms, true))
    }

    fn insert(&mut self, key: Data, record: Record) -> Option<Data> {
        let now = Instant::now();
        self.records
            .insert(key, record)
            .filter(|old| !old.expired(now))
            .map(|old| old.value)
    }

    /// Live entry of `key` with its metadata.
    pub fn view(&mut self, key: &Data) -> Option<EntryView> {
        let now = Instant::now();
        match self.records.get(key) {
            Some(r) if r.expired(now) => {
                self.records.remove(key);
                None
            }
            Some(r) => Some(EntryView {
                key: key.clone(),
                value: r.value.clone(),
                expires_in_ms: r.expires_at.map(|at| {
                    at.saturating_duration_since(now).as_millis() as u64
                }),
                transient: r.transient,
            }),
            None => None,
        }
    }

    /// Removes a record, returning its live value.
    pub fn remove(&mut self, key: &Data) -> Option<Data> {
        let now = Instant::now();
        self.records
            .remove(key)
            .filter(|old| !old.expired(now))
            .map(|old| old.value)
    }

    pub fn contains_key(&mut self, key: &Data) -> bool {
        self.get(key).is_some()
    }

    pub fn contains_value(&mut self, value: &Data) -> bool {
        self.purge_expired();
        self.records.values().any(|r| &r.value == value)
    }

    pub fn len(&mut self) -> usize {
        self.purge_expired();
        self.records.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Snapshot of live entries.
    pub fn entries(&mut self) -> Vec<(Data, Data)> {
        self.purge_expired();
        self.records
            .iter()
            .map(|(k, r)| (k.clone(), r.value.clone()))
            .collect()
    }

    /// Removes everything, returning how many live entries were dropped.
    pub fn clear(&mut self) -> usize {
        self.purge_expired();
        let n = self.records.len();
        self.records.clear();
        n
    }

    /// Registers an index; returns false if it already existed.
    pub fn add_index(&mut self, attribute: &str, ordered: bool) -> bool {
        self.indexes.insert(attribute.into(), ordered).is_none()
    }

    pub fn indexes(&self) -> &BTreeMap<String, bool> {
        &self.indexes
    }
}

/// Holder of a key lock with reentrancy count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockState {
    pub owner: ThreadId,
    pub count: u32,
}

/// Undo record kept for a transactional mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRecord {
    pub map: String,
    pub key: Data,
    pub previous: Option<Data>,
}

/// All data of one partition held by this member.
#[derive(Debug)]
pub struct PartitionStore {
    id: PartitionId,

    maps: HashMap<String, RecordStore>,

    lists: HashMap<String, Vec<Data>>,

    /// (map name, key) -> lock holder.
    locks: HashMap<(String, Data), LockState>,

    /// Transaction ID -> undo records in mutation order.
    txn_logs: HashMap<TxnId, Vec<UndoRecord>>,

    /// Version stamped on the last backup this member emitted as owner.
    backup_version: u64,

    /// Origin member -> highest backup version applied from it.
    applied_versions: HashMap<Address, u64>,
}

impl PartitionStore {
    pub fn new(id: PartitionId) -> Self {
        PartitionStore {
            id,
            maps: HashMap::new(),
            lists: HashMap::new(),
            locks: HashMap::new(),
            txn_logs: HashMap::new(),
            backup_version: 0,
            applied_versions: HashMap::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// Record store of a map, created on first touch.
    pub fn map(&mut self, name: &str) -> &mut RecordStore {
        self.maps.entry(name.into()).or_default()
    }

    /// Record store of a map if it exists.
    pub fn existing_map(&mut self, name: &str) -> Option<&mut RecordStore> {
        self.maps.get_mut(name)
    }

    /// List container, created on first touch.
    pub fn list(&mut self, name: &str) -> &mut Vec<Data> {
        self.lists.entry(name.into()).or_default()
    }

    /// List container if it exists.
    pub fn existing_list(&mut self, name: &str) -> Option<&mut Vec<Data>> {
        self.lists.get_mut(name)
    }

    /// Current lock holder of a key.
    pub fn lock_state(&self, map: &str, key: &Data) -> Option<LockState> {
        self.locks.get(&(map.to_string(), key.clone())).copied()
    }

    /// Checks that `thread` may mutate `key`.
    pub fn check_writable(
        &self,
        map: &str,
        key: &Data,
        thread: ThreadId,
    ) -> Result<(), DomainError> {
        match self.lock_state(map, key) {
            Some(lock) if lock.owner != thread => {
                Err(DomainError::KeyLocked { holder: lock.owner })
            }
            _ => Ok(()),
        }
    }

    /// Acquires (or re-enters) a key lock. Returns false if another thread
    /// holds it.
    pub fn lock(&mut self, map: &str, key: &Data, thread: ThreadId) -> bool {
        let lock = self
            .locks
            .entry((map.to_string(), key.clone()))
            .or_insert(LockState {
                owner: thread,
                count: 0,
            });
        if lock.owner != thread {
            return false;
        }
        lock.count += 1;
        true
    }

    /// Releases one level of a key lock held by `thread`.
    pub fn unlock(
        &mut self,
        map: &str,
        key: &Data,
        thread: ThreadId,
    ) -> Result<(), DomainError> {
        let slot = (map.to_string(), key.clone());
        match self.locks.get_mut(&slot) {
            Some(lock) if lock.owner == thread => {
                lock.count -= 1;
                if lock.count == 0 {
                    self.locks.remove(&slot);
                }
                Ok(())
            }
            _ => Err(DomainError::NotLockOwner),
        }
    }

    /// Drops a key lock regardless of owner. Returns whether it was held.
    pub fn force_unlock(&mut self, map: &str, key: &Data) -> bool {
        self.locks.remove(&(map.to_string(), key.clone())).is_some()
    }

    /// Appends an undo record to a transaction's log.
    pub fn record_undo(&mut self, txn: TxnId, undo: UndoRecord) {
        self.txn_logs.entry(txn).or_default().push(undo);
    }

    /// Takes a transaction's undo log out.
    pub fn take_undo_log(&mut self, txn: TxnId) -> Vec<UndoRecord> {
        self.txn_logs.remove(&txn).unwrap_or_default()
    }

    /// Bumps and returns the version for the next emitted backup.
    pub fn next_backup_version(&mut self) -> u64 {
        self.backup_version += 1;
        self.backup_version
    }

    /// Records a backup version from `origin`; returns false if it was
    /// already applied (duplicate or stale retransmission).
    pub fn admit_backup(&mut self, origin: Address, version: u64) -> bool {
        let applied = self.applied_versions.entry(origin).or_insert(0);
        if version <= *applied {
            return false;
        }
        *applied = version;
        true
    }
}
