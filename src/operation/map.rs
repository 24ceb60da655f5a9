//! Map service operations.

use crate::cluster::Data;
use crate::engine::{EntryEvent, EntryEventKind, UndoRecord};
use crate::operation::{
    BackupAware, BackupOperation, MapBackup, OpContext, OpHeader, OpResponse,
    Operation,
};
use crate::utils::{DomainError, GridError};

use serde::{Deserialize, Serialize};

/// Operations of the map service. Key-addressed variants are partition-aware
/// (routed by their key); `Size`, `ContainsValue`, the bulk reads, `Clear`
/// and `AddIndex` are partition-level and fanned out to every partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapOperation {
    Get { key: Data },
    GetEntry { key: Data },
    ContainsKey { key: Data },
    ContainsValue { value: Data },
    Size,
    KeySet,
    Values,
    EntrySet,

    Put {
        key: Data,
        value: Data,
        ttl_ms: Option<u64>,
    },
    Set {
        key: Data,
        value: Data,
        ttl_ms: Option<u64>,
    },
    PutIfAbsent {
        key: Data,
        value: Data,
        ttl_ms: Option<u64>,
    },
    /// `Set` whose record is marked transient.
    PutTransient {
        key: Data,
        value: Data,
        ttl_ms: Option<u64>,
    },
    Replace { key: Data, value: Data },
    ReplaceIfSame {
        key: Data,
        expect: Data,
        value: Data,
    },
    Remove { key: Data },
    RemoveIfSame { key: Data, value: Data },
    Evict { key: Data },
    Clear,

    /// Runs the member-registered entry processor `processor` on the entry.
    ExecuteOnKey {
        key: Data,
        processor: String,
        arg: Data,
    },

    Lock { key: Data },
    Unlock { key: Data },
    ForceUnlock { key: Data },
    IsLocked { key: Data },

    AddIndex { attribute: String, ordered: bool },
}

/// Local execution context of map operations.
#[derive(Debug, Default)]
pub struct MapLocal {
    /// Whether the store was changed.
    changed: bool,

    /// Value before the mutation.
    old_value: Option<Data>,

    /// Value left by an entry processor.
    new_value: Option<Data>,

    /// Pre-clear entries, captured only when someone listens.
    snapshot: Vec<(Data, Data)>,
}

impl MapOperation {
    /// Variant name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MapOperation::Get { .. } => "Get",
            MapOperation::GetEntry { .. } => "GetEntry",
            MapOperation::ContainsKey { .. } => "ContainsKey",
            MapOperation::ContainsValue { .. } => "ContainsValue",
            MapOperation::Size => "Size",
            MapOperation::KeySet => "KeySet",
            MapOperation::Values => "Values",
            MapOperation::EntrySet => "EntrySet",
            MapOperation::Put { .. } => "Put",
            MapOperation::Set { .. } => "Set",
            MapOperation::PutIfAbsent { .. } => "PutIfAbsent",
            MapOperation::PutTransient { .. } => "PutTransient",
            MapOperation::Replace { .. } => "Replace",
            MapOperation::ReplaceIfSame { .. } => "ReplaceIfSame",
            MapOperation::Remove { .. } => "Remove",
            MapOperation::RemoveIfSame { .. } => "RemoveIfSame",
            MapOperation::Evict { .. } => "Evict",
            MapOperation::Clear => "Clear",
            MapOperation::ExecuteOnKey { .. } => "ExecuteOnKey",
            MapOperation::Lock { .. } => "Lock",
            MapOperation::Unlock { .. } => "Unlock",
            MapOperation::ForceUnlock { .. } => "ForceUnlock",
            MapOperation::IsLocked { .. } => "IsLocked",
            MapOperation::AddIndex { .. } => "AddIndex",
        }
    }

    /// Whether the operation may change the store.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            MapOperation::Get { .. }
                | MapOperation::GetEntry { .. }
                | MapOperation::ContainsKey { .. }
                | MapOperation::ContainsValue { .. }
                | MapOperation::Size
                | MapOperation::KeySet
                | MapOperation::Values
                | MapOperation::EntrySet
                | MapOperation::IsLocked { .. }
        )
    }

    /// Stores a value under a key on behalf of a write, honoring key locks
    /// and recording transactional undo.
    fn write(
        ctx: &mut OpContext<'_>,
        local: &mut MapLocal,
        key: &Data,
        value: &Data,
        ttl_ms: Option<u64>,
    ) -> Option<Data> {
        Self::write_record(ctx, local, key, value, ttl_ms, false)
    }

    fn write_record(
        ctx: &mut OpContext<'_>,
        local: &mut MapLocal,
        key: &Data,
        value: &Data,
        ttl_ms: Option<u64>,
        transient: bool,
    ) -> Option<Data> {
        let name = &ctx.header.name;
        let map = ctx.store.map(name);
        let old = if transient {
            map.put_transient(key.clone(), value.clone(), ttl_ms)
        } else {
            map.put(key.clone(), value.clone(), ttl_ms)
        };
        if let Some(txn) = ctx.header.txn {
            ctx.store.record_undo(
                txn,
                UndoRecord {
                    map: name.clone(),
                    key: key.clone(),
                    previous: old.clone(),
                },
            );
        }
        local.changed = true;
        local.old_value = old.clone();
        old
    }

    /// Removes a key on behalf of a write, recording transactional undo.
    fn erase(
        ctx: &mut OpContext<'_>,
        local: &mut MapLocal,
        key: &Data,
    ) -> Option<Data> {
        let name = &ctx.header.name;
        let old = ctx.store.map(name).remove(key);
        if let (Some(txn), Some(previous)) = (ctx.header.txn, &old) {
            ctx.store.record_undo(
                txn,
                UndoRecord {
                    map: name.clone(),
                    key: key.clone(),
                    previous: Some(previous.clone()),
                },
            );
        }
        local.changed = old.is_some();
        local.old_value = old.clone();
        old
    }
}

impl Operation for MapOperation {
    type Local = MapLocal;

    fn before_run(
        &mut self,
        ctx: &mut OpContext<'_>,
    ) -> Result<MapLocal, GridError> {
        let mut local = MapLocal::default();
        if let MapOperation::Clear = self {
            if ctx.has_listener() {
                if let Some(map) = ctx.store.existing_map(&ctx.header.name) {
                    local.snapshot = map.entries();
                }
            }
        }
        Ok(local)
    }

    fn run(
        &mut self,
        ctx: &mut OpContext<'_>,
        local: &mut MapLocal,
    ) -> Result<OpResponse, GridError> {
        let name = ctx.header.name.clone();
        let thread = ctx.header.thread;

        // writes to a key locked by someone else are refused
        match &*self {
            MapOperation::Put { key, .. }
            | MapOperation::Set { key, .. }
            | MapOperation::PutIfAbsent { key, .. }
            | MapOperation::PutTransient { key, .. }
            | MapOperation::Replace { key, .. }
            | MapOperation::ReplaceIfSame { key, .. }
            | MapOperation::Remove { key }
            | MapOperation::RemoveIfSame { key, .. }
            | MapOperation::Evict { key }
            | MapOperation::ExecuteOnKey { key, .. } => {
                if let Err(e) = ctx.store.check_writable(&name, key, thread) {
                    return Ok(OpResponse::Error(e));
                }
            }
            _ => {}
        }

        let response = match &*self {
            MapOperation::Get { key } => {
                OpResponse::Value(ctx.store.map(&name).get(key))
            }
            MapOperation::GetEntry { key } => {
                OpResponse::Entry(ctx.store.map(&name).view(key))
            }
            MapOperation::ContainsKey { key } => {
                OpResponse::Bool(ctx.store.map(&name).contains_key(key))
            }
            MapOperation::ContainsValue { value } => {
                OpResponse::Bool(ctx.store.map(&name).contains_value(value))
            }
            MapOperation::Size => {
                OpResponse::Size(ctx.store.map(&name).len() as u64)
            }
            MapOperation::KeySet => OpResponse::Keys(
                ctx.store
                    .map(&name)
                    .entries()
                    .into_iter()
                    .map(|(k, _)| k)
                    .collect(),
            ),
            MapOperation::Values => OpResponse::Values(
                ctx.store
                    .map(&name)
                    .entries()
                    .into_iter()
                    .map(|(_, v)| v)
                    .collect(),
            ),
            MapOperation::EntrySet => {
                OpResponse::Entries(ctx.store.map(&name).entries())
            }

            MapOperation::Put { key, value, ttl_ms } => {
                OpResponse::Value(Self::write(ctx, local, key, value, *ttl_ms))
            }
            MapOperation::Set { key, value, ttl_ms } => {
                Self::write(ctx, local, key, value, *ttl_ms);
                OpResponse::None
            }
            MapOperation::PutIfAbsent { key, value, ttl_ms } => {
                match ctx.store.map(&name).get(key) {
                    Some(existing) => OpResponse::Value(Some(existing)),
                    None => {
                        Self::write(ctx, local, key, value, *ttl_ms);
                        OpResponse::Value(None)
                    }
                }
            }
            MapOperation::PutTransient { key, value, ttl_ms } => {
                Self::write_record(ctx, local, key, value, *ttl_ms, true);
                OpResponse::None
            }
            MapOperation::Replace { key, value } => {
                if ctx.store.map(&name).contains_key(key) {
                    OpResponse::Value(Self::write(ctx, local, key, value, None))
                } else {
                    OpResponse::Value(None)
                }
            }
            MapOperation::ReplaceIfSame { key, expect, value } => {
                if ctx.store.map(&name).get(key).as_ref() == Some(expect) {
                    Self::write(ctx, local, key, value, None);
                    OpResponse::Bool(true)
                } else {
                    OpResponse::Bool(false)
                }
            }
            MapOperation::Remove { key } => {
                OpResponse::Value(Self::erase(ctx, local, key))
            }
            MapOperation::RemoveIfSame { key, value } => {
                if ctx.store.map(&name).get(key).as_ref() == Some(value) {
                    Self::erase(ctx, local, key);
                    OpResponse::Bool(true)
                } else {
                    OpResponse::Bool(false)
                }
            }
            MapOperation::Evict { key } => {
                OpResponse::Bool(Self::erase(ctx, local, key).is_some())
            }
            MapOperation::Clear => {
                let removed = ctx
                    .store
                    .existing_map(&name)
                    .map_or(0, |map| map.clear());
                local.changed = removed > 0;
                OpResponse::Size(removed as u64)
            }
            MapOperation::ExecuteOnKey {
                key,
                processor: processor_name,
                arg,
            } => {
                let processor = match ctx.processor(processor_name) {
                    Some(processor) => processor,
                    None => {
                        return Ok(OpResponse::Error(
                            DomainError::UnknownProcessor {
                                name: processor_name.clone(),
                            },
                        ))
                    }
                };
                let old = ctx.store.map(&name).get(key);
                let mut value = old.clone();
                let result = processor.process(key, &mut value, arg)?;
                if value != old {
                    match &value {
                        Some(value) => {
                            Self::write(ctx, local, key, value, None);
                        }
                        None => {
                            Self::erase(ctx, local, key);
                        }
                    }
                }
                local.new_value = value;
                OpResponse::Value(result)
            }

            MapOperation::Lock { key } => {
                local.changed = ctx.store.lock(&name, key, thread);
                OpResponse::Bool(local.changed)
            }
            MapOperation::Unlock { key } => {
                match ctx.store.unlock(&name, key, thread) {
                    Ok(()) => {
                        local.changed = true;
                        OpResponse::None
                    }
                    Err(e) => OpResponse::Error(e),
                }
            }
            MapOperation::ForceUnlock { key } => {
                local.changed = ctx.store.force_unlock(&name, key);
                OpResponse::Bool(local.changed)
            }
            MapOperation::IsLocked { key } => {
                OpResponse::Bool(ctx.store.lock_state(&name, key).is_some())
            }

            MapOperation::AddIndex { attribute, ordered } => {
                local.changed =
                    ctx.store.map(&name).add_index(attribute, *ordered);
                OpResponse::Bool(local.changed)
            }
        };

        Ok(response)
    }

    fn after_run(
        &mut self,
        ctx: &mut OpContext<'_>,
        local: MapLocal,
    ) -> Result<(), GridError> {
        if !ctx.has_listener() {
            return Ok(());
        }

        match self {
            MapOperation::Put { key, value, .. }
            | MapOperation::Set { key, value, .. }
            | MapOperation::PutIfAbsent { key, value, .. }
            | MapOperation::PutTransient { key, value, .. }
            | MapOperation::Replace { key, value }
            | MapOperation::ReplaceIfSame { key, value, .. }
                if local.changed =>
            {
                let kind = if local.old_value.is_some() {
                    EntryEventKind::Updated
                } else {
                    EntryEventKind::Added
                };
                ctx.publish(EntryEvent {
                    kind,
                    key: Some(key.clone()),
                    value: Some(value.clone()),
                    old_value: local.old_value,
                });
            }
            MapOperation::Remove { key } | MapOperation::RemoveIfSame { key, .. }
                if local.changed =>
            {
                ctx.publish(EntryEvent {
                    kind: EntryEventKind::Removed,
                    key: Some(key.clone()),
                    value: None,
                    old_value: local.old_value,
                });
            }
            MapOperation::ExecuteOnKey { key, .. } if local.changed => {
                let kind = match (&local.new_value, &local.old_value) {
                    (None, _) => EntryEventKind::Removed,
                    (Some(_), Some(_)) => EntryEventKind::Updated,
                    (Some(_), None) => EntryEventKind::Added,
                };
                ctx.publish(EntryEvent {
                    kind,
                    key: Some(key.clone()),
                    value: local.new_value,
                    old_value: local.old_value,
                });
            }
            MapOperation::Evict { key } if local.changed => {
                ctx.publish(EntryEvent {
                    kind: EntryEventKind::Evicted,
                    key: Some(key.clone()),
                    value: None,
                    old_value: local.old_value,
                });
            }
            MapOperation::Clear => {
                for (key, value) in local.snapshot {
                    ctx.publish(EntryEvent {
                        kind: EntryEventKind::Removed,
                        key: Some(key),
                        value: None,
                        old_value: Some(value),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn routing_key(&self) -> Option<&Data> {
        match self {
            MapOperation::Get { key }
            | MapOperation::GetEntry { key }
            | MapOperation::ContainsKey { key }
            | MapOperation::Put { key, .. }
            | MapOperation::Set { key, .. }
            | MapOperation::PutIfAbsent { key, .. }
            | MapOperation::PutTransient { key, .. }
            | MapOperation::ExecuteOnKey { key, .. }
            | MapOperation::Replace { key, .. }
            | MapOperation::ReplaceIfSame { key, .. }
            | MapOperation::Remove { key }
            | MapOperation::RemoveIfSame { key, .. }
            | MapOperation::Evict { key }
            | MapOperation::Lock { key }
            | MapOperation::Unlock { key }
            | MapOperation::ForceUnlock { key }
            | MapOperation::IsLocked { key } => Some(key),
            _ => None,
        }
    }

    fn as_backup_aware(&self) -> Option<&dyn BackupAware<MapLocal>> {
        if self.is_mutation() {
            Some(self)
        } else {
            None
        }
    }

    fn is_partition_level(&self) -> bool {
        self.routing_key().is_none()
    }
}

impl BackupAware<MapLocal> for MapOperation {
    fn should_backup(&self, local: &MapLocal, response: &OpResponse) -> bool {
        local.changed && !response.is_error()
    }

    fn backup_operation(
        &self,
        header: &OpHeader,
        local: &MapLocal,
    ) -> BackupOperation {
        let op = match self {
            MapOperation::Put { key, value, ttl_ms }
            | MapOperation::Set { key, value, ttl_ms }
            | MapOperation::PutIfAbsent { key, value, ttl_ms } => {
                MapBackup::Put {
                    key: key.clone(),
                    value: value.clone(),
                    ttl_ms: *ttl_ms,
                }
            }
            MapOperation::PutTransient { key, value, ttl_ms } => {
                MapBackup::PutTransient {
                    key: key.clone(),
                    value: value.clone(),
                    ttl_ms: *ttl_ms,
                }
            }
            // replicas get the resolved value, never rerun the processor
            MapOperation::ExecuteOnKey { key, .. } => match &local.new_value {
                Some(value) => MapBackup::Put {
                    key: key.clone(),
                    value: value.clone(),
                    ttl_ms: None,
                },
                None => MapBackup::Remove { key: key.clone() },
            },
            MapOperation::Replace { key, value }
            | MapOperation::ReplaceIfSame { key, value, .. } => MapBackup::Put {
                key: key.clone(),
                value: value.clone(),
                ttl_ms: None,
            },
            MapOperation::Remove { key }
            | MapOperation::RemoveIfSame { key, .. }
            | MapOperation::Evict { key } => MapBackup::Remove { key: key.clone() },
            MapOperation::Clear => MapBackup::Clear,
            MapOperation::Lock { key } => MapBackup::Lock {
                key: key.clone(),
                thread: header.thread,
            },
            MapOperation::Unlock { key } => MapBackup::Unlock {
                key: key.clone(),
                thread: header.thread,
                force: false,
            },
            MapOperation::ForceUnlock { key } => MapBackup::Unlock {
                key: key.clone(),
                thread: header.thread,
                force: true,
            },
            MapOperation::AddIndex { attribute, ordered } => MapBackup::AddIndex {
                attribute: attribute.clone(),
                ordered: *ordered,
            },
            // reads are never backup-aware
            _ => return BackupOperation::Batch(vec![]),
        };
        BackupOperation::Map {
            name: header.name.clone(),
            op,
        }
    }
}

#[cfg(test)]
mod map_tests {
    use super::*;
    use crate::cluster::to_data;
    use crate::engine::{EntryProcessors, EventService, PartitionStore};
    use crate::operation::{Executed, OpEnvelope};
    use crate::partition::partition_id_for_key;
    use crate::utils::DomainError;

    const COUNT: u32 = 8;

    fn d(s: &str) -> Data {
        to_data(s).unwrap()
    }

    fn exec(
        store: &mut PartitionStore,
        events: &EventService,
        op: MapOperation,
        thread: u64,
        txn: Option<u64>,
    ) -> Executed {
        OpEnvelope::map("m", op)
            .with_thread(thread)
            .with_txn(txn)
            .execute(COUNT, store, events, &EntryProcessors::new())
    }

    fn store_for(key: &Data) -> PartitionStore {
        PartitionStore::new(partition_id_for_key(key, COUNT))
    }

    #[test]
    fn put_get_backups() {
        let events = EventService::new();
        let key = d("k");
        let mut store = store_for(&key);

        let put = MapOperation::Put {
            key: key.clone(),
            value: d("v1"),
            ttl_ms: None,
        };
        let executed = exec(&mut store, &events, put, 1, None);
        assert_eq!(executed.response, Ok(OpResponse::Value(None)));
        assert_eq!(
            executed.backup,
            Some(BackupOperation::Map {
                name: "m".into(),
                op: MapBackup::Put {
                    key: key.clone(),
                    value: d("v1"),
                    ttl_ms: None
                }
            })
        );

        let get = MapOperation::Get { key: key.clone() };
        let executed = exec(&mut store, &events, get, 1, None);
        assert_eq!(executed.response, Ok(OpResponse::Value(Some(d("v1")))));
        assert!(executed.backup.is_none());

        // remove of absent key is a no-op with no backup
        let rm = MapOperation::Remove { key: d("absent") };
        let mut other = store_for(&d("absent"));
        let executed = exec(&mut other, &events, rm, 1, None);
        assert_eq!(executed.response, Ok(OpResponse::Value(None)));
        assert!(executed.backup.is_none());
    }

    #[test]
    fn put_if_absent_keeps_existing() {
        let events = EventService::new();
        let key = d("k");
        let mut store = store_for(&key);
        let pia = |v: &str| MapOperation::PutIfAbsent {
            key: key.clone(),
            value: d(v),
            ttl_ms: None,
        };
        let executed = exec(&mut store, &events, pia("a"), 1, None);
        assert_eq!(executed.response, Ok(OpResponse::Value(None)));
        assert!(executed.backup.is_some());
        let executed = exec(&mut store, &events, pia("b"), 1, None);
        assert_eq!(executed.response, Ok(OpResponse::Value(Some(d("a")))));
        assert!(executed.backup.is_none());
    }

    #[test]
    fn locked_key_refuses_other_threads() {
        let events = EventService::new();
        let key = d("k");
        let mut store = store_for(&key);

        let lock = MapOperation::Lock { key: key.clone() };
        let executed = exec(&mut store, &events, lock.clone(), 1, None);
        assert_eq!(executed.response, Ok(OpResponse::Bool(true)));
        assert!(executed.backup.is_some());
        let executed = exec(&mut store, &events, lock, 2, None);
        assert_eq!(executed.response, Ok(OpResponse::Bool(false)));
        assert!(executed.backup.is_none());

        let put = MapOperation::Put {
            key: key.clone(),
            value: d("v"),
            ttl_ms: None,
        };
        let executed = exec(&mut store, &events, put.clone(), 2, None);
        assert_eq!(
            executed.response,
            Ok(OpResponse::Error(DomainError::KeyLocked { holder: 1 }))
        );
        assert!(executed.backup.is_none());
        let executed = exec(&mut store, &events, put, 1, None);
        assert!(executed.backup.is_some());

        let unlock = MapOperation::Unlock { key: key.clone() };
        let executed = exec(&mut store, &events, unlock.clone(), 2, None);
        assert_eq!(
            executed.response,
            Ok(OpResponse::Error(DomainError::NotLockOwner))
        );
        let executed = exec(&mut store, &events, unlock, 1, None);
        assert_eq!(executed.response, Ok(OpResponse::None));
        let is_locked = MapOperation::IsLocked { key };
        let executed = exec(&mut store, &events, is_locked, 2, None);
        assert_eq!(executed.response, Ok(OpResponse::Bool(false)));
    }

    #[test]
    fn clear_backs_up_only_if_nonempty() {
        let events = EventService::new();
        let mut store = PartitionStore::new(0);
        let executed = exec(&mut store, &events, MapOperation::Clear, 1, None);
        assert_eq!(executed.response, Ok(OpResponse::Size(0)));
        assert!(executed.backup.is_none());

        store.map("m").put(d("a"), d("1"), None);
        store.map("m").put(d("b"), d("2"), None);
        let executed = exec(&mut store, &events, MapOperation::Clear, 1, None);
        assert_eq!(executed.response, Ok(OpResponse::Size(2)));
        assert!(matches!(
            executed.backup,
            Some(BackupOperation::Map {
                op: MapBackup::Clear,
                ..
            })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn clear_publishes_removals() -> Result<(), GridError> {
        let events = EventService::new();
        let mut store = PartitionStore::new(0);
        store.map("m").put(d("a"), d("1"), None);

        // no listener: nothing captured
        exec(&mut store, &events, MapOperation::Clear, 1, None);

        store.map("m").put(d("a"), d("1"), None);
        let mut rx = events.subscribe("m");
        exec(&mut store, &events, MapOperation::Clear, 1, None);
        let event = rx.recv().await?;
        assert_eq!(event.kind, EntryEventKind::Removed);
        assert_eq!(event.key, Some(d("a")));
        assert_eq!(event.old_value, Some(d("1")));
        Ok(())
    }

    #[test]
    fn txn_writes_record_undo() {
        let events = EventService::new();
        let key = d("k");
        let mut store = store_for(&key);
        store.map("m").put(key.clone(), d("old"), None);
        let put = MapOperation::Put {
            key: key.clone(),
            value: d("new"),
            ttl_ms: None,
        };
        exec(&mut store, &events, put, 1, Some(9));
        assert_eq!(
            store.take_undo_log(9),
            vec![UndoRecord {
                map: "m".into(),
                key,
                previous: Some(d("old")),
            }]
        );
    }

    #[test]
    fn transient_put_and_entry_view() {
        let events = EventService::new();
        let key = d("k");
        let mut store = store_for(&key);
        let put = MapOperation::PutTransient {
            key: key.clone(),
            value: d("v"),
            ttl_ms: None,
        };
        let executed = exec(&mut store, &events, put, 1, None);
        assert_eq!(executed.response, Ok(OpResponse::None));
        assert_eq!(
            executed.backup,
            Some(BackupOperation::Map {
                name: "m".into(),
                op: MapBackup::PutTransient {
                    key: key.clone(),
                    value: d("v"),
                    ttl_ms: None
                }
            })
        );

        let get = MapOperation::GetEntry { key: key.clone() };
        let executed = exec(&mut store, &events, get, 1, None);
        assert!(executed.backup.is_none());
        match executed.response {
            Ok(OpResponse::Entry(Some(view))) => {
                assert_eq!(view.value, d("v"));
                assert!(view.transient);
                assert_eq!(view.expires_in_ms, None);
            }
            r => panic!("unexpected {:?}", r),
        }

        // locked keys refuse transient writes too
        store.lock("m", &key, 2);
        let put = MapOperation::PutTransient {
            key: key.clone(),
            value: d("w"),
            ttl_ms: None,
        };
        let executed = exec(&mut store, &events, put, 1, None);
        assert_eq!(
            executed.response,
            Ok(OpResponse::Error(DomainError::KeyLocked { holder: 2 }))
        );
    }

    #[test]
    fn processor_result_replicated() {
        let events = EventService::new();
        let processors = EntryProcessors::new();
        processors.register(
            "swap",
            std::sync::Arc::new(
                |_: &Data, value: &mut Option<Data>, arg: &Data| -> Result<Option<Data>, GridError> {
                    Ok(std::mem::replace(value, Some(arg.clone())))
                },
            ),
        );
        processors.register(
            "drop",
            std::sync::Arc::new(
                |_: &Data, value: &mut Option<Data>, _: &Data| -> Result<Option<Data>, GridError> {
                    Ok(value.take())
                },
            ),
        );
        let key = d("k");
        let mut store = store_for(&key);
        store.map("m").put(key.clone(), d("old"), None);
        let run = |store: &mut PartitionStore, processor: &str| {
            OpEnvelope::map(
                "m",
                MapOperation::ExecuteOnKey {
                    key: key.clone(),
                    processor: processor.into(),
                    arg: d("new"),
                },
            )
            .execute(COUNT, store, &events, &processors)
        };

        let executed = run(&mut store, "swap");
        assert_eq!(executed.response, Ok(OpResponse::Value(Some(d("old")))));
        assert_eq!(store.map("m").get(&key), Some(d("new")));
        assert_eq!(
            executed.backup,
            Some(BackupOperation::Map {
                name: "m".into(),
                op: MapBackup::Put {
                    key: key.clone(),
                    value: d("new"),
                    ttl_ms: None
                }
            })
        );

        // same value again: nothing to replicate
        let executed = run(&mut store, "swap");
        assert_eq!(executed.response, Ok(OpResponse::Value(Some(d("new")))));
        assert!(executed.backup.is_none());

        let executed = run(&mut store, "drop");
        assert_eq!(store.map("m").get(&key), None);
        assert_eq!(
            executed.backup,
            Some(BackupOperation::Map {
                name: "m".into(),
                op: MapBackup::Remove { key: key.clone() }
            })
        );

        let executed = run(&mut store, "nope");
        assert_eq!(
            executed.response,
            Ok(OpResponse::Error(DomainError::UnknownProcessor {
                name: "nope".into()
            }))
        );
        assert!(executed.backup.is_none());
    }
}
