//! Per-structure client facades composing the operation engine into typed
//! map and list calls.

mod list;
mod map;
mod nearcache;
mod query;

pub use list::ListProxy;
pub use map::{MapEntryView, MapProxy};
pub use nearcache::{NearCache, NearCacheStats, NearCaches};
pub use query::{scatter_gather, QueryResultSet};

use crate::engine::InvocationFuture;
use crate::operation::OpResponse;
use crate::utils::GridError;

use tokio::time::Duration;

/// Turns a raw response into the typed proxy result.
type Decoder<T> = Box<dyn Fn(OpResponse) -> Result<T, GridError> + Send + Sync>;

enum ProxyState {
    Dispatched(InvocationFuture),

    /// Settled without a round trip (near cache hit, or rejected locally).
    Settled(Result<OpResponse, GridError>),
}

/// Typed handle on one asynchronous proxy call. Waits are bounded by the
/// proxy call timeout; failures come out wrapped at the proxy boundary.
pub struct ProxyFuture<T> {
    op: &'static str,
    state: ProxyState,
    timeout: Duration,
    decode: Decoder<T>,
}

impl<T> ProxyFuture<T> {
    pub(crate) fn dispatched(
        op: &'static str,
        future: InvocationFuture,
        timeout: Duration,
        decode: Decoder<T>,
    ) -> Self {
        ProxyFuture {
            op,
            state: ProxyState::Dispatched(future),
            timeout,
            decode,
        }
    }

    pub(crate) fn settled(
        op: &'static str,
        result: Result<OpResponse, GridError>,
        decode: Decoder<T>,
    ) -> Self {
        ProxyFuture {
            op,
            state: ProxyState::Settled(result),
            timeout: Duration::ZERO,
            decode,
        }
    }

    /// Waits for the typed outcome.
    pub async fn get(&mut self) -> Result<T, GridError> {
        let response = match &mut self.state {
            ProxyState::Dispatched(future) => {
                future.get_timeout(self.timeout).await
            }
            ProxyState::Settled(result) => result.clone(),
        };
        response
            .and_then(OpResponse::into_result)
            .and_then(|r| (self.decode)(r))
            .map_err(|e| e.at_proxy(self.op))
    }

    /// Stops waiting locally. Returns false if already settled.
    pub fn cancel(&mut self) -> bool {
        match &mut self.state {
            ProxyState::Dispatched(future) => future.cancel(),
            ProxyState::Settled(_) => false,
        }
    }

    pub fn is_done(&mut self) -> bool {
        match &mut self.state {
            ProxyState::Dispatched(future) => future.is_done(),
            ProxyState::Settled(_) => true,
        }
    }

    /// Runs `callback` with the typed outcome once it arrives.
    pub fn on_complete<F>(mut self, callback: F)
    where
        T: Send + 'static,
        F: FnOnce(Result<T, GridError>) + Send + 'static,
    {
        tokio::spawn(async move {
            let result = self.get().await;
            callback(result);
        });
    }
}
