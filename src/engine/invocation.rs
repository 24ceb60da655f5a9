//! Invocation registry and the future handed back to invokers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::cluster::Address;
use crate::engine::InvocationId;
use crate::operation::OpResponse;
use crate::utils::GridError;

use tokio::sync::oneshot;
use tokio::time::{self, Duration, Instant};

/// Completion channel of one invocation.
pub type Completion = oneshot::Sender<Result<OpResponse, GridError>>;

struct PendingInvocation {
    target: Address,
    tx_done: Completion,
}

/// Remote round trips waiting for their `Response`, by invocation ID.
#[derive(Default)]
pub struct InvocationRegistry {
    next_id: AtomicU64,
    pending: Mutex<HashMap<InvocationId, PendingInvocation>>,
}

impl InvocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh invocation ID.
    #[inline]
    pub fn next_id(&self) -> InvocationId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a round trip of invocation `id` to `target`. Retries of
    /// one invocation register the same ID again, one attempt at a time.
    pub fn register(
        &self,
        id: InvocationId,
        target: Address,
    ) -> oneshot::Receiver<Result<OpResponse, GridError>> {
        let (tx_done, rx_done) = oneshot::channel();
        self.lock()
            .insert(id, PendingInvocation { target, tx_done });
        rx_done
    }

    /// Completes a round trip with a response that came back from `from`.
    /// Returns false if it was not pending on that member (already settled,
    /// or a late answer to an earlier attempt), in which case the result is
    /// dropped.
    pub fn complete(
        &self,
        id: InvocationId,
        from: Address,
        result: Result<OpResponse, GridError>,
    ) -> bool {
        let mut pending = self.lock();
        match pending.get(&id) {
            Some(p) if p.target == from => {}
            _ => return false,
        }
        match pending.remove(&id) {
            Some(p) => {
                let _ = p.tx_done.send(result);
                true
            }
            None => false,
        }
    }

    /// Drops a registration without completing it.
    pub fn forget(&self, id: InvocationId) {
        self.lock().remove(&id);
    }

    /// Fails every round trip waiting on `target`. Returns how many.
    pub fn fail_target(&self, target: Address, err: GridError) -> usize {
        let mut pending = self.lock();
        let ids: Vec<InvocationId> = pending
            .iter()
            .filter(|(_, p)| p.target == target)
            .map(|(&id, _)| id)
            .collect();
        for id in &ids {
            if let Some(p) = pending.remove(id) {
                let _ = p.tx_done.send(Err(err.clone()));
            }
        }
        ids.len()
    }

    /// Fails every pending round trip.
    pub fn fail_all(&self, err: GridError) -> usize {
        let drained: Vec<PendingInvocation> =
            self.lock().drain().map(|(_, p)| p).collect();
        let n = drained.len();
        for p in drained {
            let _ = p.tx_done.send(Err(err.clone()));
        }
        n
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<InvocationId, PendingInvocation>>
    {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum FutureState {
    Pending(oneshot::Receiver<Result<OpResponse, GridError>>),
    Done(Result<OpResponse, GridError>),
    Cancelled,
}

/// Caller's handle on one invocation. Completes exactly once; after that,
/// every `get` returns the same outcome. A timed-out or cancelled future
/// abandons the local invocation (pending retries and the wait for a remote
/// response); the remote execution is not told. Merely dropping the future
/// lets the invocation run to its end.
pub struct InvocationFuture {
    id: InvocationId,
    state: FutureState,

    /// Tells the driving task to give up; `None` once used or if there is
    /// no task.
    tx_abandon: Option<oneshot::Sender<()>>,
}

impl InvocationFuture {
    pub(crate) fn new(
        id: InvocationId,
        rx_done: oneshot::Receiver<Result<OpResponse, GridError>>,
    ) -> Self {
        InvocationFuture {
            id,
            state: FutureState::Pending(rx_done),
            tx_abandon: None,
        }
    }

    /// A future whose driving task stops when the future times out or is
    /// cancelled.
    pub(crate) fn abandonable(
        id: InvocationId,
        rx_done: oneshot::Receiver<Result<OpResponse, GridError>>,
        tx_abandon: oneshot::Sender<()>,
    ) -> Self {
        InvocationFuture {
            id,
            state: FutureState::Pending(rx_done),
            tx_abandon: Some(tx_abandon),
        }
    }

    /// An already completed future.
    pub(crate) fn ready(
        id: InvocationId,
        result: Result<OpResponse, GridError>,
    ) -> Self {
        InvocationFuture {
            id,
            state: FutureState::Done(result),
            tx_abandon: None,
        }
    }

    fn abandon(&mut self) {
        if let Some(tx_abandon) = self.tx_abandon.take() {
            let _ = tx_abandon.send(());
        }
    }

    #[inline]
    pub fn id(&self) -> InvocationId {
        self.id
    }

    /// Whether an outcome (of any kind) is already settled.
    pub fn is_done(&mut self) -> bool {
        if let FutureState::Pending(rx_done) = &mut self.state {
            match rx_done.try_recv() {
                Ok(result) => self.state = FutureState::Done(result),
                Err(oneshot::error::TryRecvError::Empty) => return false,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.state = FutureState::Done(Err(GridError::ShuttingDown))
                }
            }
        }
        true
    }

    /// Waits for the outcome without bound.
    pub async fn get(&mut self) -> Result<OpResponse, GridError> {
        match &mut self.state {
            FutureState::Done(result) => result.clone(),
            FutureState::Cancelled => Err(GridError::Cancelled),
            FutureState::Pending(rx_done) => {
                let result = rx_done.await.unwrap_or(Err(GridError::ShuttingDown));
                self.state = FutureState::Done(result.clone());
                result
            }
        }
    }

    /// Waits for the outcome up to `dur`. On expiry the future settles as
    /// timed out for good; later calls return the same timeout failure.
    pub async fn get_timeout(
        &mut self,
        dur: Duration,
    ) -> Result<OpResponse, GridError> {
        let rx_done = match &mut self.state {
            FutureState::Pending(rx_done) => rx_done,
            _ => return self.get().await,
        };
        let start = Instant::now();
        let result = match time::timeout(dur, rx_done).await {
            Ok(result) => result.unwrap_or(Err(GridError::ShuttingDown)),
            Err(_) => {
                pf_debug!("invocation {} timed out after {:?}", self.id, dur);
                self.abandon();
                Err(GridError::Timeout {
                    invocation: self.id,
                    waited_ms: start.elapsed().as_millis() as u64,
                })
            }
        };
        self.state = FutureState::Done(result.clone());
        result
    }

    /// Stops waiting locally. Returns false if already settled.
    pub fn cancel(&mut self) -> bool {
        if self.is_done() {
            return false;
        }
        self.abandon();
        self.state = FutureState::Cancelled;
        true
    }

    /// Runs `callback` with the outcome once it arrives, on a spawned task.
    pub fn on_complete<F>(mut self, callback: F)
    where
        F: FnOnce(Result<OpResponse, GridError>) + Send + 'static,
    {
        tokio::spawn(async move {
            let result = self.get().await;
            callback(result);
        });
    }
}

#[cfg(test)]
mod invocation_tests {
    use super::*;
    use std::sync::Arc;

    fn addr(port: u16) -> Address {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timeout_sticks() -> Result<(), GridError> {
        let registry = InvocationRegistry::new();
        let id = registry.next_id();
        let (tx_abandon, rx_abandon) = oneshot::channel();
        let mut future = InvocationFuture::abandonable(
            id,
            registry.register(id, addr(5702)),
            tx_abandon,
        );

        let start = Instant::now();
        let first = future.get_timeout(Duration::from_millis(100)).await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(matches!(first, Err(GridError::Timeout { invocation, .. }) if invocation == id));

        // the driving side is told to give up
        assert_eq!(rx_abandon.await, Ok(()));

        // a late response does not change the settled outcome
        registry.complete(id, addr(5702), Ok(OpResponse::None));
        let second = future.get_timeout(Duration::from_millis(100)).await;
        assert_eq!(second, first);
        assert_eq!(future.get().await, first);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn complete_once() -> Result<(), GridError> {
        let registry = InvocationRegistry::new();
        let id = registry.next_id();
        let mut future = InvocationFuture::new(id, registry.register(id, addr(5702)));
        assert!(!future.is_done());
        // an answer from some other member does not settle it
        assert!(!registry.complete(id, addr(5703), Ok(OpResponse::Bool(false))));
        assert!(registry.complete(id, addr(5702), Ok(OpResponse::Bool(true))));
        assert!(!registry.complete(id, addr(5702), Ok(OpResponse::Bool(false))));
        assert_eq!(future.get().await, Ok(OpResponse::Bool(true)));
        assert_eq!(future.get().await, Ok(OpResponse::Bool(true)));
        assert!(!future.cancel());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fail_target_and_all() -> Result<(), GridError> {
        let registry = InvocationRegistry::new();
        let id0 = registry.next_id();
        let rx0 = registry.register(id0, addr(5702));
        let rx1 = registry.register(registry.next_id(), addr(5703));
        let rx2 = registry.register(registry.next_id(), addr(5702));
        let gone = GridError::MemberLeft { member: addr(5702) };
        assert_eq!(registry.fail_target(addr(5702), gone.clone()), 2);
        assert_eq!(InvocationFuture::new(id0, rx0).get().await, Err(gone));
        assert_eq!(registry.fail_all(GridError::ShuttingDown), 1);
        assert_eq!(
            InvocationFuture::new(9, rx1).get().await,
            Err(GridError::ShuttingDown)
        );
        drop(rx2);
        assert_eq!(registry.len(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_and_callback() -> Result<(), GridError> {
        let registry = Arc::new(InvocationRegistry::new());
        let id = registry.next_id();
        let (tx_abandon, mut rx_abandon) = oneshot::channel();
        let mut future = InvocationFuture::abandonable(
            id,
            registry.register(id, addr(5702)),
            tx_abandon,
        );
        assert!(future.cancel());
        assert_eq!(rx_abandon.try_recv(), Ok(()));
        assert_eq!(future.get().await, Err(GridError::Cancelled));
        // completion after cancel goes nowhere
        registry.complete(id, addr(5702), Ok(OpResponse::None));

        let id = registry.next_id();
        let rx = registry.register(id, addr(5702));
        let (tx_cb, rx_cb) = oneshot::channel();
        InvocationFuture::new(id, rx).on_complete(move |result| {
            let _ = tx_cb.send(result);
        });
        registry.complete(id, addr(5702), Ok(OpResponse::Size(7)));
        assert_eq!(rx_cb.await?, Ok(OpResponse::Size(7)));
        Ok(())
    }
}
