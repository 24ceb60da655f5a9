//! Typed distributed list facade. A list lives whole in the partition its
//! name hashes to.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::cluster::{to_data, to_object};
use crate::engine::OperationService;
use crate::operation::{
    AddOperation, ClearOperation, ListReadOperation, OpBody, OpEnvelope,
    OpResponse, RemoveIndexOperation, LIST_SERVICE,
};
use crate::partition::PartitionId;
use crate::txn::CallContext;
use crate::utils::GridError;

use serde::{de::DeserializeOwned, Serialize};

use tokio::time::Duration;

/// Client facade of the distributed list `name`.
pub struct ListProxy<V> {
    name: String,
    partition: PartitionId,
    service: Arc<OperationService>,
    timeout: Duration,
    _types: PhantomData<fn() -> V>,
}

impl<V> ListProxy<V>
where
    V: Serialize + DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(
        name: &str,
        service: Arc<OperationService>,
    ) -> Result<Self, GridError> {
        let partition = service.table().partition_id_for_key(&to_data(name)?);
        let timeout = Duration::from_millis(service.config().proxy_call_timeout_ms);
        Ok(ListProxy {
            name: name.into(),
            partition,
            service,
            timeout,
            _types: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Partition holding the list.
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Appends a value.
    pub async fn add(&self, ctx: &CallContext, value: &V) -> Result<bool, GridError> {
        async {
            let op = OpBody::ListAdd(AddOperation {
                value: to_data(value)?,
            });
            self.call(ctx, op).await?.into_bool()
        }
        .await
        .map_err(|e| e.at_proxy("add"))
    }

    /// Value at `index`; an index outside the list fails with
    /// `IndexOutOfRange`.
    pub async fn get(&self, ctx: &CallContext, index: i64) -> Result<V, GridError> {
        async {
            let op = OpBody::ListRead(ListReadOperation::Get { index });
            let value = self.call(ctx, op).await?.into_value()?;
            match value {
                Some(value) => to_object(&value),
                None => Err(GridError::msg("list read returned no value")),
            }
        }
        .await
        .map_err(|e| e.at_proxy("get"))
    }

    /// Removes and returns the value at `index`. An index outside the list
    /// fails with `IndexOutOfRange` and changes nothing anywhere.
    pub async fn remove_at(&self, ctx: &CallContext, index: i64) -> Result<V, GridError> {
        async {
            let op = OpBody::ListRemoveIndex(RemoveIndexOperation { index });
            let value = self.call(ctx, op).await?.into_value()?;
            match value {
                Some(value) => to_object(&value),
                None => Err(GridError::msg("list removal returned no value")),
            }
        }
        .await
        .map_err(|e| e.at_proxy("remove_at"))
    }

    pub async fn contains(&self, ctx: &CallContext, value: &V) -> Result<bool, GridError> {
        async {
            let op = OpBody::ListRead(ListReadOperation::Contains {
                value: to_data(value)?,
            });
            self.call(ctx, op).await?.into_bool()
        }
        .await
        .map_err(|e| e.at_proxy("contains"))
    }

    pub async fn size(&self, ctx: &CallContext) -> Result<u64, GridError> {
        self.call(ctx, OpBody::ListRead(ListReadOperation::Size))
            .await
            .and_then(OpResponse::into_size)
            .map_err(|e| e.at_proxy("size"))
    }

    /// Removes every element. Returns how many were removed.
    pub async fn clear(&self, ctx: &CallContext) -> Result<u64, GridError> {
        self.call(ctx, OpBody::ListClear(ClearOperation))
            .await
            .and_then(OpResponse::into_size)
            .map_err(|e| e.at_proxy("clear"))
    }

    async fn call(&self, ctx: &CallContext, body: OpBody) -> Result<OpResponse, GridError> {
        let op = OpEnvelope::new(LIST_SERVICE, &self.name, body).with_thread(ctx.thread);
        let mut future = self
            .service
            .invoke_on_partition(LIST_SERVICE, op, self.partition);
        future.get_timeout(self.timeout).await?.into_result()
    }
}
