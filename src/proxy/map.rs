//! Typed distributed map facade.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::cluster::{to_data, to_object, Data};
use crate::engine::{EntryEvent, EventService, InvocationFuture, OperationService};
use crate::operation::{
    InterceptorOperation, MapOperation, OpBody, OpEnvelope, OpResponse,
    Operation, Predicate, MAP_SERVICE,
};
use crate::partition::PartitionId;
use crate::proxy::{scatter_gather, Decoder, NearCache, NearCacheStats, ProxyFuture};
use crate::txn::{CallContext, TransactionTracker};
use crate::utils::{DomainError, GridError, Timer};

use futures::future::join_all;

use serde::{de::DeserializeOwned, Serialize};

use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};

fn decode_opt<T: DeserializeOwned>(data: Option<Data>) -> Result<Option<T>, GridError> {
    data.map(|d| to_object(&d)).transpose()
}

fn value_decoder<T: DeserializeOwned + 'static>() -> Decoder<Option<T>> {
    Box::new(|r: OpResponse| -> Result<Option<T>, GridError> {
        decode_opt(r.into_value()?)
    })
}

fn decode_all<T: DeserializeOwned>(data: Vec<Data>) -> Result<Vec<T>, GridError> {
    data.iter().map(|d| to_object(d)).collect()
}

fn decode_entries<K: DeserializeOwned, V: DeserializeOwned>(
    entries: Vec<(Data, Data)>,
) -> Result<Vec<(K, V)>, GridError> {
    entries
        .iter()
        .map(|(k, v)| Ok((to_object(k)?, to_object(v)?)))
        .collect()
}

/// Typed entry with its metadata, as returned by `MapProxy::get_entry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntryView<K, V> {
    pub key: K,
    pub value: V,

    /// Time left before expiry, `None` if the entry never expires.
    pub expires_in: Option<Duration>,

    /// Whether the entry was stored through `put_transient`.
    pub transient: bool,
}

/// Client facade of the distributed map `name`. Every call takes the
/// caller's `CallContext`; calls made inside a transaction enlist the
/// partitions they write to.
pub struct MapProxy<K, V> {
    name: String,
    service: Arc<OperationService>,
    txns: Arc<TransactionTracker>,
    events: Arc<EventService>,

    /// This member's near cache of the map, shared with its other proxies.
    near_cache: Option<Arc<NearCache>>,

    /// Wait bound of each call.
    timeout: Duration,

    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> MapProxy<K, V>
where
    K: Serialize + DeserializeOwned + Send + 'static,
    V: Serialize + DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(
        name: &str,
        service: Arc<OperationService>,
        txns: Arc<TransactionTracker>,
        events: Arc<EventService>,
        near_cache: Option<Arc<NearCache>>,
    ) -> Self {
        let timeout = Duration::from_millis(service.config().proxy_call_timeout_ms);
        MapProxy {
            name: name.into(),
            service,
            txns,
            events,
            near_cache,
            timeout,
            _types: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Counters of the near cache, if enabled for this map.
    pub fn near_cache_stats(&self) -> Option<NearCacheStats> {
        self.near_cache.as_deref().map(NearCache::stats)
    }

    pub async fn get(&self, ctx: &CallContext, key: &K) -> Result<Option<V>, GridError> {
        async {
            let (key, partition) = self.keyed(key)?;
            if let Some(value) = self.cached(ctx, &key) {
                return Ok(Some(to_object(&value)?));
            }
            let epoch = self.near_cache.as_ref().map(|cache| cache.epoch());
            let value = self
                .call(ctx, MapOperation::Get { key: key.clone() }, partition)
                .await?
                .into_value()?;
            if let (Some(cache), Some(epoch), Some(value), None) =
                (&self.near_cache, epoch, &value, ctx.txn)
            {
                cache.fill(key, value.clone(), epoch);
            }
            Ok::<_, GridError>(decode_opt(value)?)
        }
        .await
        .map_err(|e| e.at_proxy("get"))
    }

    pub fn get_async(&self, ctx: &CallContext, key: &K) -> ProxyFuture<Option<V>> {
        match self.keyed(key) {
            Ok((key, partition)) => match self.cached(ctx, &key) {
                Some(value) => ProxyFuture::settled(
                    "get_async",
                    Ok(OpResponse::Value(Some(value))),
                    value_decoder(),
                ),
                None => self.dispatch_async(
                    "get_async",
                    ctx,
                    MapOperation::Get { key },
                    partition,
                    value_decoder(),
                ),
            },
            Err(e) => ProxyFuture::settled("get_async", Err(e), value_decoder()),
        }
    }

    /// Stores a value, returning the previous one.
    pub async fn put(&self, ctx: &CallContext, key: &K, value: &V) -> Result<Option<V>, GridError> {
        self.put_ttl(ctx, key, value, None).await
    }

    /// Stores a value that expires after `ttl` (`None` or zero: never).
    pub async fn put_ttl(
        &self,
        ctx: &CallContext,
        key: &K,
        value: &V,
        ttl: Option<Duration>,
    ) -> Result<Option<V>, GridError> {
        async {
            let (key, partition) = self.keyed(key)?;
            let op = MapOperation::Put {
                key,
                value: to_data(value)?,
                ttl_ms: ttl.map(|d| d.as_millis() as u64),
            };
            let old = self.write(ctx, op, partition).await?.into_value()?;
            Ok::<_, GridError>(decode_opt(old)?)
        }
        .await
        .map_err(|e| e.at_proxy("put"))
    }

    pub fn put_async(&self, ctx: &CallContext, key: &K, value: &V) -> ProxyFuture<Option<V>> {
        let decode = value_decoder();
        let prepared = self.keyed(key).and_then(|(key, partition)| {
            Ok((
                MapOperation::Put {
                    key,
                    value: to_data(value)?,
                    ttl_ms: None,
                },
                partition,
            ))
        });
        match prepared {
            Ok((op, partition)) => {
                self.invalidate(&op);
                self.dispatch_async("put_async", ctx, op, partition, decode)
            }
            Err(e) => ProxyFuture::settled("put_async", Err(e), decode),
        }
    }

    /// Stores a value without fetching the previous one.
    pub async fn set(&self, ctx: &CallContext, key: &K, value: &V) -> Result<(), GridError> {
        async {
            let (key, partition) = self.keyed(key)?;
            let op = MapOperation::Set {
                key,
                value: to_data(value)?,
                ttl_ms: None,
            };
            self.write(ctx, op, partition).await?;
            Ok::<_, GridError>(())
        }
        .await
        .map_err(|e| e.at_proxy("set"))
    }

    /// Stores a value marked transient: held in memory only, never handed to
    /// anything persisting the map. Replicated like any other write.
    pub async fn put_transient(
        &self,
        ctx: &CallContext,
        key: &K,
        value: &V,
        ttl: Option<Duration>,
    ) -> Result<(), GridError> {
        async {
            let (key, partition) = self.keyed(key)?;
            let op = MapOperation::PutTransient {
                key,
                value: to_data(value)?,
                ttl_ms: ttl.map(|d| d.as_millis() as u64),
            };
            self.write(ctx, op, partition).await?;
            Ok::<_, GridError>(())
        }
        .await
        .map_err(|e| e.at_proxy("put_transient"))
    }

    /// The entry of `key` with its expiry and transient mark. Always read
    /// from the owner.
    pub async fn get_entry(
        &self,
        ctx: &CallContext,
        key: &K,
    ) -> Result<Option<MapEntryView<K, V>>, GridError> {
        async {
            let (key, partition) = self.keyed(key)?;
            let view = self
                .call(ctx, MapOperation::GetEntry { key }, partition)
                .await?
                .into_entry()?;
            let view = match view {
                Some(view) => view,
                None => return Ok(None),
            };
            Ok::<_, GridError>(Some(MapEntryView {
                key: to_object(&view.key)?,
                value: to_object(&view.value)?,
                expires_in: view.expires_in_ms.map(Duration::from_millis),
                transient: view.transient,
            }))
        }
        .await
        .map_err(|e| e.at_proxy("get_entry"))
    }

    /// Runs the entry processor registered as `processor` on the owner of
    /// `key`, atomically with respect to every other operation on the key.
    /// Returns the processor's result.
    pub async fn execute_on_key<A, R>(
        &self,
        ctx: &CallContext,
        key: &K,
        processor: &str,
        arg: &A,
    ) -> Result<Option<R>, GridError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        async {
            let (key, partition) = self.keyed(key)?;
            let op = MapOperation::ExecuteOnKey {
                key,
                processor: processor.into(),
                arg: to_data(arg)?,
            };
            let result = self.write(ctx, op, partition).await?.into_value()?;
            Ok::<_, GridError>(decode_opt(result)?)
        }
        .await
        .map_err(|e| e.at_proxy("execute_on_key"))
    }

    /// Stores a value, retrying while another caller holds the key lock.
    /// Returns false if the lock was not released within `timeout`.
    pub async fn try_put(
        &self,
        ctx: &CallContext,
        key: &K,
        value: &V,
        timeout: Duration,
    ) -> Result<bool, GridError> {
        async {
            let (key, partition) = self.keyed(key)?;
            let op = MapOperation::Set {
                key,
                value: to_data(value)?,
                ttl_ms: None,
            };
            let done = self
                .until_unlocked(ctx, op, partition, Some(Instant::now() + timeout))
                .await?;
            Ok::<_, GridError>(done.is_some())
        }
        .await
        .map_err(|e| e.at_proxy("try_put"))
    }

    /// Stores a value only if the key is absent. Returns the existing value
    /// otherwise.
    pub async fn put_if_absent(&self, ctx: &CallContext, key: &K, value: &V) -> Result<Option<V>, GridError> {
        async {
            let (key, partition) = self.keyed(key)?;
            let op = MapOperation::PutIfAbsent {
                key,
                value: to_data(value)?,
                ttl_ms: None,
            };
            let existing = self.write(ctx, op, partition).await?.into_value()?;
            Ok::<_, GridError>(decode_opt(existing)?)
        }
        .await
        .map_err(|e| e.at_proxy("put_if_absent"))
    }

    /// Replaces the value of a present key, returning the previous one.
    pub async fn replace(&self, ctx: &CallContext, key: &K, value: &V) -> Result<Option<V>, GridError> {
        async {
            let (key, partition) = self.keyed(key)?;
            let op = MapOperation::Replace {
                key,
                value: to_data(value)?,
            };
            let old = self.write(ctx, op, partition).await?.into_value()?;
            Ok::<_, GridError>(decode_opt(old)?)
        }
        .await
        .map_err(|e| e.at_proxy("replace"))
    }

    /// Replaces the value only if it currently equals `expect`.
    pub async fn replace_if_same(
        &self,
        ctx: &CallContext,
        key: &K,
        expect: &V,
        value: &V,
    ) -> Result<bool, GridError> {
        async {
            let (key, partition) = self.keyed(key)?;
            let op = MapOperation::ReplaceIfSame {
                key,
                expect: to_data(expect)?,
                value: to_data(value)?,
            };
            self.write(ctx, op, partition).await?.into_bool()
        }
        .await
        .map_err(|e| e.at_proxy("replace_if_same"))
    }

    pub async fn remove(&self, ctx: &CallContext, key: &K) -> Result<Option<V>, GridError> {
        async {
            let (key, partition) = self.keyed(key)?;
            let old = self
                .write(ctx, MapOperation::Remove { key }, partition)
                .await?
                .into_value()?;
            Ok::<_, GridError>(decode_opt(old)?)
        }
        .await
        .map_err(|e| e.at_proxy("remove"))
    }

    /// Removes the key only if its value equals `value`.
    pub async fn remove_if_same(&self, ctx: &CallContext, key: &K, value: &V) -> Result<bool, GridError> {
        async {
            let (key, partition) = self.keyed(key)?;
            let op = MapOperation::RemoveIfSame {
                key,
                value: to_data(value)?,
            };
            self.write(ctx, op, partition).await?.into_bool()
        }
        .await
        .map_err(|e| e.at_proxy("remove_if_same"))
    }

    pub fn remove_async(&self, ctx: &CallContext, key: &K) -> ProxyFuture<Option<V>> {
        let decode = value_decoder();
        match self.keyed(key) {
            Ok((key, partition)) => {
                let op = MapOperation::Remove { key };
                self.invalidate(&op);
                self.dispatch_async("remove_async", ctx, op, partition, decode)
            }
            Err(e) => ProxyFuture::settled("remove_async", Err(e), decode),
        }
    }

    /// Removes the key, retrying while another caller holds its lock.
    /// Returns false if the lock was not released within `timeout`.
    pub async fn try_remove(&self, ctx: &CallContext, key: &K, timeout: Duration) -> Result<bool, GridError> {
        async {
            let (key, partition) = self.keyed(key)?;
            let done = self
                .until_unlocked(
                    ctx,
                    MapOperation::Remove { key },
                    partition,
                    Some(Instant::now() + timeout),
                )
                .await?;
            Ok::<_, GridError>(done.is_some())
        }
        .await
        .map_err(|e| e.at_proxy("try_remove"))
    }

    /// Drops the key without it counting as a removal. Returns whether it
    /// was present.
    pub async fn evict(&self, ctx: &CallContext, key: &K) -> Result<bool, GridError> {
        async {
            let (key, partition) = self.keyed(key)?;
            self.write(ctx, MapOperation::Evict { key }, partition)
                .await?
                .into_bool()
        }
        .await
        .map_err(|e| e.at_proxy("evict"))
    }

    pub async fn contains_key(&self, ctx: &CallContext, key: &K) -> Result<bool, GridError> {
        async {
            let (key, partition) = self.keyed(key)?;
            if self.cached(ctx, &key).is_some() {
                return Ok(true);
            }
            self.call(ctx, MapOperation::ContainsKey { key }, partition)
                .await?
                .into_bool()
        }
        .await
        .map_err(|e| e.at_proxy("contains_key"))
    }

    pub async fn contains_value(&self, ctx: &CallContext, value: &V) -> Result<bool, GridError> {
        async {
            let op = MapOperation::ContainsValue {
                value: to_data(value)?,
            };
            let mut found = false;
            for response in self.on_all_partitions(ctx, op).await? {
                found |= response.into_bool()?;
            }
            Ok::<_, GridError>(found)
        }
        .await
        .map_err(|e| e.at_proxy("contains_value"))
    }

    /// Total number of entries. Fails if any partition did not answer.
    pub async fn size(&self, ctx: &CallContext) -> Result<u64, GridError> {
        async {
            let mut total = 0;
            for response in self.on_all_partitions(ctx, MapOperation::Size).await? {
                total += response.into_size()?;
            }
            Ok::<_, GridError>(total)
        }
        .await
        .map_err(|e| e.at_proxy("size"))
    }

    pub async fn is_empty(&self, ctx: &CallContext) -> Result<bool, GridError> {
        Ok(self.size(ctx).await? == 0)
    }

    pub async fn key_set(&self, ctx: &CallContext) -> Result<Vec<K>, GridError> {
        async {
            let mut keys = vec![];
            for response in self.on_all_partitions(ctx, MapOperation::KeySet).await? {
                keys.extend(decode_all(response.into_keys()?)?);
            }
            Ok::<_, GridError>(keys)
        }
        .await
        .map_err(|e| e.at_proxy("key_set"))
    }

    /// Keys held by the partitions this member owns.
    pub async fn local_key_set(&self, ctx: &CallContext) -> Result<Vec<K>, GridError> {
        async {
            let op = OpEnvelope::map(&self.name, MapOperation::KeySet)
                .with_thread(ctx.thread);
            let responses = self
                .service
                .invoke_on_target_partitions(MAP_SERVICE, op, self.service.me())
                .await
                .into_complete()?;
            let mut keys = vec![];
            for response in responses.into_values() {
                keys.extend(decode_all(response.into_keys()?)?);
            }
            Ok::<_, GridError>(keys)
        }
        .await
        .map_err(|e| e.at_proxy("local_key_set"))
    }

    pub async fn values(&self, ctx: &CallContext) -> Result<Vec<V>, GridError> {
        async {
            let mut values = vec![];
            for response in self.on_all_partitions(ctx, MapOperation::Values).await? {
                values.extend(decode_all(response.into_values()?)?);
            }
            Ok::<_, GridError>(values)
        }
        .await
        .map_err(|e| e.at_proxy("values"))
    }

    pub async fn entry_set(&self, ctx: &CallContext) -> Result<Vec<(K, V)>, GridError> {
        async {
            let mut entries = vec![];
            for response in self.on_all_partitions(ctx, MapOperation::EntrySet).await? {
                entries.extend(decode_entries(response.into_entries()?)?);
            }
            Ok::<_, GridError>(entries)
        }
        .await
        .map_err(|e| e.at_proxy("entry_set"))
    }

    /// Present entries among `keys`, fetched concurrently.
    pub async fn get_all(&self, ctx: &CallContext, keys: &[K]) -> Result<Vec<(K, V)>, GridError> {
        async {
            let mut waits = vec![];
            for key in keys {
                let (key, partition) = self.keyed(key)?;
                let future =
                    self.invoke(ctx, MapOperation::Get { key: key.clone() }, partition)?;
                waits.push((key, future));
            }
            let timeout = self.timeout;
            let results = join_all(waits.into_iter().map(|(key, mut future)| async move {
                (key, future.get_timeout(timeout).await)
            }))
            .await;

            let mut entries = vec![];
            for (key, result) in results {
                if let Some(value) = result?.into_value()? {
                    entries.push((to_object(&key)?, to_object(&value)?));
                }
            }
            Ok::<_, GridError>(entries)
        }
        .await
        .map_err(|e| e.at_proxy("get_all"))
    }

    /// Stores every entry, concurrently.
    pub async fn put_all(&self, ctx: &CallContext, entries: &[(K, V)]) -> Result<(), GridError> {
        async {
            let mut futures = vec![];
            for (key, value) in entries {
                let (key, partition) = self.keyed(key)?;
                let op = MapOperation::Set {
                    key,
                    value: to_data(value)?,
                    ttl_ms: None,
                };
                self.invalidate(&op);
                futures.push(self.invoke(ctx, op, partition)?);
            }
            let timeout = self.timeout;
            for result in join_all(
                futures
                    .iter_mut()
                    .map(|future| future.get_timeout(timeout)),
            )
            .await
            {
                result?.into_result()?;
            }
            Ok::<_, GridError>(())
        }
        .await
        .map_err(|e| e.at_proxy("put_all"))
    }

    /// Removes every entry. Returns how many were removed.
    pub async fn clear(&self, ctx: &CallContext) -> Result<u64, GridError> {
        async {
            if let Some(cache) = &self.near_cache {
                cache.invalidate_all();
            }
            let mut removed = 0;
            for response in self.on_all_partitions(ctx, MapOperation::Clear).await? {
                removed += response.into_size()?;
            }
            Ok::<_, GridError>(removed)
        }
        .await
        .map_err(|e| e.at_proxy("clear"))
    }

    /// Acquires the key lock for the calling thread, waiting as long as it
    /// takes. Reentrant.
    pub async fn lock(&self, ctx: &CallContext, key: &K) -> Result<(), GridError> {
        async {
            let (key, partition) = self.keyed(key)?;
            self.until_unlocked(ctx, MapOperation::Lock { key }, partition, None)
                .await?;
            Ok::<_, GridError>(())
        }
        .await
        .map_err(|e| e.at_proxy("lock"))
    }

    /// Like `lock`, giving up after `timeout`.
    pub async fn try_lock(&self, ctx: &CallContext, key: &K, timeout: Duration) -> Result<bool, GridError> {
        async {
            let (key, partition) = self.keyed(key)?;
            let done = self
                .until_unlocked(
                    ctx,
                    MapOperation::Lock { key },
                    partition,
                    Some(Instant::now() + timeout),
                )
                .await?;
            Ok::<_, GridError>(done.is_some())
        }
        .await
        .map_err(|e| e.at_proxy("try_lock"))
    }

    /// Releases one hold of the key lock. Fails with `NotLockOwner` if the
    /// calling thread does not hold it.
    pub async fn unlock(&self, ctx: &CallContext, key: &K) -> Result<(), GridError> {
        async {
            let (key, partition) = self.keyed(key)?;
            self.call(ctx, MapOperation::Unlock { key }, partition).await?;
            Ok::<_, GridError>(())
        }
        .await
        .map_err(|e| e.at_proxy("unlock"))
    }

    pub async fn is_locked(&self, ctx: &CallContext, key: &K) -> Result<bool, GridError> {
        async {
            let (key, partition) = self.keyed(key)?;
            self.call(ctx, MapOperation::IsLocked { key }, partition)
                .await?
                .into_bool()
        }
        .await
        .map_err(|e| e.at_proxy("is_locked"))
    }

    /// Releases the key lock regardless of its holder.
    pub async fn force_unlock(&self, ctx: &CallContext, key: &K) -> Result<(), GridError> {
        async {
            let (key, partition) = self.keyed(key)?;
            self.call(ctx, MapOperation::ForceUnlock { key }, partition)
                .await?;
            Ok::<_, GridError>(())
        }
        .await
        .map_err(|e| e.at_proxy("force_unlock"))
    }

    /// Registers an interceptor on this member and broadcasts the
    /// registration to every other member. Returns false if the ID was
    /// already taken locally. Registrations are bookkeeping only: reads and
    /// writes do not consult them.
    pub async fn add_interceptor<I: Serialize>(
        &self,
        ctx: &CallContext,
        id: &str,
        interceptor: &I,
    ) -> Result<bool, GridError> {
        async {
            let interceptor = to_data(interceptor)?;
            let added = self.service.interceptors().add(&self.name, id, interceptor.clone());
            self.broadcast_interceptor(
                ctx,
                InterceptorOperation::Add {
                    id: id.into(),
                    interceptor,
                },
            )
            .await?;
            Ok::<_, GridError>(added)
        }
        .await
        .map_err(|e| e.at_proxy("add_interceptor"))
    }

    /// Removes an interceptor on every member. Returns whether it was
    /// registered locally.
    pub async fn remove_interceptor(&self, ctx: &CallContext, id: &str) -> Result<bool, GridError> {
        async {
            let removed = self.service.interceptors().remove(&self.name, id);
            self.broadcast_interceptor(ctx, InterceptorOperation::Remove { id: id.into() })
                .await?;
            Ok::<_, GridError>(removed)
        }
        .await
        .map_err(|e| e.at_proxy("remove_interceptor"))
    }

    /// Listens to entry events of the partitions executing on this member.
    pub fn add_entry_listener(&self) -> broadcast::Receiver<EntryEvent> {
        self.events.subscribe(&self.name)
    }

    /// Registers an attribute index on every partition. A missing or empty
    /// attribute name fails right away.
    pub async fn add_index(
        &self,
        ctx: &CallContext,
        attribute: Option<&str>,
        ordered: bool,
    ) -> Result<(), GridError> {
        async {
            let attribute = match attribute {
                Some(a) if !a.is_empty() => a.to_string(),
                _ => {
                    return Err(GridError::Misuse(
                        "index attribute name must be given".into(),
                    ))
                }
            };
            self.on_all_partitions(ctx, MapOperation::AddIndex { attribute, ordered })
                .await?;
            Ok(())
        }
        .await
        .map_err(|e| e.at_proxy("add_index"))
    }

    pub async fn key_set_where(&self, ctx: &CallContext, predicate: &Predicate) -> Result<Vec<K>, GridError> {
        async {
            let result = scatter_gather(&self.service, &self.name, ctx.thread, predicate).await?;
            result
                .entries
                .iter()
                .map(|(k, _)| to_object(k))
                .collect::<Result<Vec<K>, _>>()
        }
        .await
        .map_err(|e| e.at_proxy("key_set_where"))
    }

    pub async fn values_where(&self, ctx: &CallContext, predicate: &Predicate) -> Result<Vec<V>, GridError> {
        async {
            let result = scatter_gather(&self.service, &self.name, ctx.thread, predicate).await?;
            result
                .entries
                .iter()
                .map(|(_, v)| to_object(v))
                .collect::<Result<Vec<V>, _>>()
        }
        .await
        .map_err(|e| e.at_proxy("values_where"))
    }

    pub async fn entry_set_where(
        &self,
        ctx: &CallContext,
        predicate: &Predicate,
    ) -> Result<Vec<(K, V)>, GridError> {
        async {
            let result = scatter_gather(&self.service, &self.name, ctx.thread, predicate).await?;
            decode_entries(result.entries)
        }
        .await
        .map_err(|e| e.at_proxy("entry_set_where"))
    }
}

// MapProxy invocation helpers
impl<K, V> MapProxy<K, V>
where
    K: Serialize + DeserializeOwned + Send + 'static,
    V: Serialize + DeserializeOwned + Send + 'static,
{
    fn keyed(&self, key: &K) -> Result<(Data, PartitionId), GridError> {
        let key = to_data(key)?;
        let partition = self.service.table().partition_id_for_key(&key);
        Ok((key, partition))
    }

    /// Near cache lookup; transactional reads always go to the owner.
    fn cached(&self, ctx: &CallContext, key: &Data) -> Option<Data> {
        match (&self.near_cache, ctx.txn) {
            (Some(cache), None) => cache.get(key),
            _ => None,
        }
    }

    fn invalidate(&self, op: &MapOperation) {
        if let (Some(cache), Some(key)) = (&self.near_cache, op.routing_key()) {
            cache.invalidate(key);
        }
    }

    /// Builds the envelope, enlisting the partition if this is a
    /// transactional write.
    fn envelope(
        &self,
        ctx: &CallContext,
        op: MapOperation,
        partition: PartitionId,
    ) -> Result<OpEnvelope, GridError> {
        if let Some(txn) = ctx.txn {
            if op.is_mutation() && self.txns.enlist(txn, partition)? {
                pf_trace!(self.service.me(); "txn {} enlisted partition {}", txn, partition);
            }
        }
        Ok(OpEnvelope::map(&self.name, op)
            .with_thread(ctx.thread)
            .with_txn(ctx.txn))
    }

    fn invoke(
        &self,
        ctx: &CallContext,
        op: MapOperation,
        partition: PartitionId,
    ) -> Result<InvocationFuture, GridError> {
        let op = self.envelope(ctx, op, partition)?;
        Ok(self.service.invoke_on_partition(MAP_SERVICE, op, partition))
    }

    /// One round trip; domain failure values become errors.
    async fn call(
        &self,
        ctx: &CallContext,
        op: MapOperation,
        partition: PartitionId,
    ) -> Result<OpResponse, GridError> {
        let mut future = self.invoke(ctx, op, partition)?;
        future.get_timeout(self.timeout).await?.into_result()
    }

    async fn write(
        &self,
        ctx: &CallContext,
        op: MapOperation,
        partition: PartitionId,
    ) -> Result<OpResponse, GridError> {
        self.invalidate(&op);
        let key = op.routing_key().cloned();
        let result = self.call(ctx, op, partition).await;
        // a read racing the write may have refilled the old value
        if let (Some(cache), Some(key)) = (&self.near_cache, key) {
            cache.invalidate(&key);
        }
        result
    }

    fn dispatch_async<T>(
        &self,
        name: &'static str,
        ctx: &CallContext,
        op: MapOperation,
        partition: PartitionId,
        decode: Decoder<T>,
    ) -> ProxyFuture<T> {
        match self.invoke(ctx, op, partition) {
            Ok(future) => ProxyFuture::dispatched(name, future, self.timeout, decode),
            Err(e) => ProxyFuture::settled(name, Err(e), decode),
        }
    }

    /// Repeats `op` with backoff while the key is locked by someone else.
    /// Returns `None` if still locked at `deadline`.
    async fn until_unlocked(
        &self,
        ctx: &CallContext,
        op: MapOperation,
        partition: PartitionId,
        deadline: Option<Instant>,
    ) -> Result<Option<OpResponse>, GridError> {
        let is_lock = matches!(op, MapOperation::Lock { .. });
        let config = self.service.config();
        let mut timer = Timer::new(Duration::from_millis(config.retry_backoff_max_ms));
        loop {
            match self.write(ctx, op.clone(), partition).await {
                Ok(OpResponse::Bool(false)) if is_lock => {}
                Err(GridError::Domain(DomainError::KeyLocked { .. })) => {}
                Ok(response) => return Ok(Some(response)),
                Err(e) => return Err(e),
            }
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Ok(None);
            }
            timer.backoff(Duration::from_millis(config.retry_backoff_ms))?;
            timer.timeout().await;
        }
    }

    /// Runs `op` on every partition; any failed partition fails the call.
    async fn on_all_partitions(
        &self,
        ctx: &CallContext,
        op: MapOperation,
    ) -> Result<Vec<OpResponse>, GridError> {
        let op = OpEnvelope::map(&self.name, op).with_thread(ctx.thread);
        let responses = self
            .service
            .invoke_on_all_partitions(MAP_SERVICE, op)
            .await
            .into_complete()?;
        responses
            .into_values()
            .map(OpResponse::into_result)
            .collect()
    }

    async fn broadcast_interceptor(
        &self,
        ctx: &CallContext,
        op: InterceptorOperation,
    ) -> Result<(), GridError> {
        let me = self.service.me();
        let timeout = self.timeout;
        let waits = self
            .service
            .view()
            .current_members()
            .into_iter()
            .filter(|&member| member != me)
            .map(|member| {
                let op = OpEnvelope::new(MAP_SERVICE, &self.name, OpBody::Interceptor(op.clone()))
                    .with_thread(ctx.thread);
                let mut future = self.service.invoke_on_target(MAP_SERVICE, op, member);
                async move { future.get_timeout(timeout).await }
            });
        for result in join_all(waits).await {
            result?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod map_tests {
    use super::*;
    use crate::config::GridConfig;
    use crate::engine::EntryEventKind;
    use crate::testkit::TestCluster;
    use tokio::time;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn basic_crud() -> Result<(), GridError> {
        let cluster = TestCluster::start(3, 16, 1).await?;
        let map = cluster.nodes[0].map_proxy::<String, u64>("m");
        let ctx = CallContext::new();
        assert_eq!(map.put(&ctx, &"a".into(), &1).await?, None);
        assert_eq!(map.put(&ctx, &"a".into(), &2).await?, Some(1));
        map.set(&ctx, &"b".into(), &3).await?;
        assert_eq!(map.get(&ctx, &"a".into()).await?, Some(2));
        assert_eq!(map.put_if_absent(&ctx, &"a".into(), &9).await?, Some(2));
        assert!(map.replace_if_same(&ctx, &"a".into(), &2, &4).await?);
        assert!(!map.remove_if_same(&ctx, &"a".into(), &2).await?);
        assert_eq!(map.replace(&ctx, &"zz".into(), &1).await?, None);
        assert!(map.contains_key(&ctx, &"b".into()).await?);
        assert!(map.contains_value(&ctx, &4).await?);
        assert_eq!(map.size(&ctx).await?, 2);

        // visible from any member
        let other = cluster.nodes[2].map_proxy::<String, u64>("m");
        assert_eq!(other.get(&ctx, &"a".into()).await?, Some(4));
        let mut keys = other.key_set(&ctx).await?;
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

        assert_eq!(map.remove(&ctx, &"a".into()).await?, Some(4));
        assert!(map.evict(&ctx, &"b".into()).await?);
        assert!(map.is_empty(&ctx).await?);
        cluster.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn async_calls_and_bulk() -> Result<(), GridError> {
        let cluster = TestCluster::start(2, 8, 1).await?;
        let map = cluster.nodes[1].map_proxy::<u32, String>("m");
        let ctx = CallContext::new();
        let entries: Vec<(u32, String)> = (0..10).map(|i| (i, format!("v{}", i))).collect();
        map.put_all(&ctx, &entries).await?;
        assert_eq!(map.put_async(&ctx, &3, &"w".into()).get().await?, Some("v3".into()));
        assert_eq!(map.get_async(&ctx, &3).get().await?, Some("w".into()));
        assert_eq!(map.remove_async(&ctx, &4).get().await?, Some("v4".into()));

        let mut got = map.get_all(&ctx, &[1, 4, 5, 42]).await?;
        got.sort();
        assert_eq!(got, vec![(1, "v1".into()), (5, "v5".into())]);
        assert_eq!(map.entry_set(&ctx).await?.len(), 9);
        assert_eq!(map.values(&ctx).await?.len(), 9);

        // the local key set holds exactly the keys of owned partitions
        let local = map.local_key_set(&ctx).await?;
        let owned = cluster.nodes[1].table().owned_by(cluster.addr(1));
        for key in &local {
            let p = cluster.nodes[1].table().partition_id_for_key(&to_data(key)?);
            assert!(owned.contains(&p));
        }
        assert_eq!(map.clear(&ctx).await?, 9);
        assert_eq!(map.size(&ctx).await?, 0);
        cluster.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn locks_block_other_threads() -> Result<(), GridError> {
        let cluster = TestCluster::start(2, 8, 1).await?;
        let map = cluster.nodes[0].map_proxy::<String, u64>("m");
        let (alice, bob) = (CallContext::with_thread(1), CallContext::with_thread(2));
        let key = "k".to_string();

        map.lock(&alice, &key).await?;
        map.lock(&alice, &key).await?;
        assert!(map.is_locked(&bob, &key).await?);
        assert!(!map.try_lock(&bob, &key, Duration::from_millis(50)).await?);
        assert!(!map.try_put(&bob, &key, &1, Duration::from_millis(50)).await?);
        let err = map.put(&bob, &key, &1).await.unwrap_err();
        assert_eq!(
            err.root_cause(),
            &GridError::Domain(DomainError::KeyLocked { holder: 1 })
        );
        let err = map.unlock(&bob, &key).await.unwrap_err();
        assert_eq!(err.root_cause(), &GridError::Domain(DomainError::NotLockOwner));

        // owner writes through its own lock
        map.put(&alice, &key, &7).await?;
        map.unlock(&alice, &key).await?;
        assert!(map.is_locked(&bob, &key).await?);
        map.unlock(&alice, &key).await?;
        assert!(map.try_put(&bob, &key, &8, Duration::from_millis(50)).await?);

        map.lock(&alice, &key).await?;
        map.force_unlock(&bob, &key).await?;
        assert!(map.try_remove(&bob, &key, Duration::from_millis(50)).await?);
        cluster.shutdown().await;
        Ok(())
    }

    fn near_cache_config(ttl_ms: u64) -> GridConfig {
        let mut config = GridConfig {
            partition_count: 8,
            ..Default::default()
        };
        config.default_map.backup_count = 0;
        config.default_map.near_cache_enabled = true;
        config.default_map.near_cache_max_size = 16;
        config.default_map.near_cache_ttl_ms = ttl_ms;
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn near_cache_short_circuits() -> Result<(), GridError> {
        let cluster = TestCluster::start_with(2, near_cache_config(60000)).await?;
        let map = cluster.nodes[0].map_proxy::<String, u64>("m");
        let ctx = CallContext::new();
        // owned remotely, so no local entry event races the fill
        let key = cluster.key_owned_by::<String>(1, |i| format!("a{}", i))?;

        map.put(&ctx, &key, &1).await?;
        assert_eq!(map.get(&ctx, &key).await?, Some(1));
        cluster.fabric.clear_log();
        assert_eq!(map.get(&ctx, &key).await?, Some(1));
        assert!(cluster.fabric.frames().is_empty());
        let stats = map.near_cache_stats().ok_or_else(|| GridError::msg("no cache"))?;
        assert_eq!((stats.hits, stats.misses), (1, 1));

        // own writes invalidate
        map.put(&ctx, &key, &2).await?;
        assert_eq!(map.get(&ctx, &key).await?, Some(2));
        cluster.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn near_cache_shared_by_proxies() -> Result<(), GridError> {
        let cluster = TestCluster::start_with(2, near_cache_config(60000)).await?;
        let a = cluster.nodes[0].map_proxy::<u32, u64>("m");
        let b = cluster.nodes[0].map_proxy::<u32, u64>("m");
        let ctx = CallContext::new();

        a.set(&ctx, &1, &10).await?;
        assert_eq!(a.get(&ctx, &1).await?, Some(10));
        b.set(&ctx, &1, &20).await?;
        assert_eq!(a.get(&ctx, &1).await?, Some(20));
        match (&a.near_cache, &b.near_cache) {
            (Some(ca), Some(cb)) => assert!(Arc::ptr_eq(ca, cb)),
            _ => panic!("near cache not enabled"),
        }

        // writes from another member show up through the owner's events
        let key = cluster.key_owned_by(0, |i| i)?;
        let remote = cluster.nodes[1].map_proxy::<u32, u64>("m");
        a.set(&ctx, &key, &1).await?;
        assert_eq!(a.get(&ctx, &key).await?, Some(1));
        remote.set(&ctx, &key, &2).await?;
        let mut seen = None;
        for _ in 0..50 {
            seen = a.get(&ctx, &key).await?;
            if seen == Some(2) {
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(seen, Some(2));
        cluster.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn near_cache_entries_expire() -> Result<(), GridError> {
        let cluster = TestCluster::start_with(3, near_cache_config(150)).await?;
        let map = cluster.nodes[0].map_proxy::<u32, u64>("m");
        let writer = cluster.nodes[2].map_proxy::<u32, u64>("m");
        let ctx = CallContext::new();
        // owned by a member neither proxy lives on: no event reaches member 0
        let key = cluster.key_owned_by(1, |i| i)?;

        map.set(&ctx, &key, &1).await?;
        assert_eq!(map.get(&ctx, &key).await?, Some(1));
        writer.set(&ctx, &key, &2).await?;
        assert_eq!(map.get(&ctx, &key).await?, Some(1));
        time::sleep(Duration::from_millis(300)).await;
        assert_eq!(map.get(&ctx, &key).await?, Some(2));
        cluster.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn processors_and_entry_views() -> Result<(), GridError> {
        let cluster = TestCluster::start(3, 4, 1).await?;
        let add = |_: &Data,
                   value: &mut Option<Data>,
                   arg: &Data|
         -> Result<Option<Data>, GridError> {
            let sum = value.as_ref().map_or(Ok(0), |v| to_object::<u64>(v))?
                + to_object::<u64>(arg)?;
            *value = Some(to_data(&sum)?);
            Ok(Some(to_data(&sum)?))
        };
        for node in &cluster.nodes {
            assert!(node.register_entry_processor("add", Arc::new(add)));
        }
        let map = cluster.nodes[0].map_proxy::<String, u64>("m");
        let ctx = CallContext::new();

        let key = "counter".to_string();
        cluster.fabric.clear_log();
        assert_eq!(map.execute_on_key::<u64, u64>(&ctx, &key, "add", &5).await?, Some(5));
        assert_eq!(map.execute_on_key::<u64, u64>(&ctx, &key, "add", &2).await?, Some(7));
        assert_eq!(map.get(&ctx, &key).await?, Some(7));
        // the resolved value went to the backup owner each time
        assert_eq!(cluster.backup_sends(None), 2);

        let err = map
            .execute_on_key::<u64, u64>(&ctx, &key, "missing", &1)
            .await
            .unwrap_err();
        assert_eq!(
            err.root_cause(),
            &GridError::Domain(DomainError::UnknownProcessor {
                name: "missing".into()
            })
        );

        let view = map.get_entry(&ctx, &key).await?.unwrap();
        assert_eq!((view.key.as_str(), view.value), ("counter", 7));
        assert!(!view.transient);
        assert_eq!(view.expires_in, None);

        map.put_transient(&ctx, &"session".into(), &1, Some(Duration::from_secs(60)))
            .await?;
        let view = map.get_entry(&ctx, &"session".into()).await?.unwrap();
        assert!(view.transient);
        assert!(view.expires_in.map_or(false, |d| d <= Duration::from_secs(60)));
        assert_eq!(map.get_entry(&ctx, &"nothing".into()).await?, None);
        cluster.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn listeners_interceptors_indexes() -> Result<(), GridError> {
        let cluster = TestCluster::start(3, 4, 1).await?;
        let map = cluster.nodes[0].map_proxy::<String, u64>("m");
        let ctx = CallContext::new();

        // listener sees events of partitions executing on this member
        let key = cluster.key_owned_by::<String>(0, |i| format!("k{}", i))?;
        let mut events = map.add_entry_listener();
        map.put(&ctx, &key, &1).await?;
        map.put(&ctx, &key, &2).await?;
        map.remove(&ctx, &key).await?;
        let kinds: Vec<EntryEventKind> = vec![
            events.recv().await?.kind,
            events.recv().await?.kind,
            events.recv().await?.kind,
        ];
        assert_eq!(
            kinds,
            vec![EntryEventKind::Added, EntryEventKind::Updated, EntryEventKind::Removed]
        );

        assert!(map.add_interceptor(&ctx, "audit", &"cfg").await?);
        for node in &cluster.nodes {
            assert_eq!(node.service().interceptors().ids("m"), vec!["audit".to_string()]);
        }
        assert!(map.remove_interceptor(&ctx, "audit").await?);
        for node in &cluster.nodes {
            assert!(node.service().interceptors().ids("m").is_empty());
        }

        // misuse fails before any round trip
        cluster.fabric.clear_log();
        let err = map.add_index(&ctx, None, true).await.unwrap_err();
        assert!(matches!(err.root_cause(), GridError::Misuse(_)));
        assert!(cluster.fabric.frames().is_empty());
        map.add_index(&ctx, Some("age"), true).await?;
        cluster.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn predicate_queries() -> Result<(), GridError> {
        let cluster = TestCluster::start(3, 8, 1).await?;
        let map = cluster.nodes[1].map_proxy::<u32, String>("m");
        let ctx = CallContext::new();
        for i in 0..6 {
            map.set(&ctx, &i, &(if i % 2 == 0 { "even" } else { "odd" }).to_string())
                .await?;
        }
        let mut evens = map
            .key_set_where(&ctx, &Predicate::value_equals(&"even")?)
            .await?;
        evens.sort();
        assert_eq!(evens, vec![0, 2, 4]);
        let odd = map
            .values_where(&ctx, &Predicate::key_in(&[1u32, 2])?.negate())
            .await?;
        assert_eq!(odd.len(), 4);
        assert_eq!(map.entry_set_where(&ctx, &Predicate::All).await?.len(), 6);
        cluster.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn txn_writes_enlist_and_roll_back() -> Result<(), GridError> {
        let cluster = TestCluster::start(2, 8, 1).await?;
        let node = &cluster.nodes[0];
        let map = node.map_proxy::<String, u64>("m");
        let ctx = CallContext::new();
        map.put(&ctx, &"a".into(), &1).await?;

        let txn = node.transactions().begin();
        let in_txn = ctx.in_txn(txn);
        map.put(&in_txn, &"a".into(), &2).await?;
        map.put(&in_txn, &"a".into(), &3).await?;
        map.put(&in_txn, &"b".into(), &9).await?;
        let _ = map.get(&in_txn, &"c".into()).await?;
        let pa = node.table().partition_id_for_key(&to_data("a")?);
        let pb = node.table().partition_id_for_key(&to_data("b")?);
        let expected = if pa == pb { 1 } else { 2 };
        assert_eq!(node.transactions().participants(txn).len(), expected);

        node.rollback(txn).await?;
        assert!(!node.transactions().is_active(txn));
        assert_eq!(map.get(&ctx, &"a".into()).await?, Some(1));
        assert_eq!(map.get(&ctx, &"b".into()).await?, None);

        let txn = node.transactions().begin();
        map.put(&ctx.in_txn(txn), &"a".into(), &5).await?;
        node.commit(txn).await?;
        assert_eq!(map.get(&ctx, &"a".into()).await?, Some(5));
        cluster.shutdown().await;
        Ok(())
    }
}
