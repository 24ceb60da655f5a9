//! In-process transport fabric connecting several members that live in the
//! same process. Records every frame it carries and can sever members, which
//! makes it the transport used by tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::cluster::{Address, Inbox, Transport};
use crate::utils::GridError;

use async_trait::async_trait;

use bytes::Bytes;

use tokio::sync::mpsc;

/// One frame carried by the fabric.
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub from: Address,
    pub to: Address,
    pub frame: Bytes,
}

#[derive(Debug, Default)]
struct FabricInner {
    /// Map from member address -> sender side of its inbox.
    endpoints: HashMap<Address, mpsc::UnboundedSender<(Address, Bytes)>>,

    /// Members currently cut off from everyone.
    severed: HashSet<Address>,

    /// Log of every frame delivered so far.
    log: Vec<SentFrame>,
}

/// Shared in-process fabric; members join it to get a `LocalTransport`.
#[derive(Debug, Clone, Default)]
pub struct LocalFabric {
    inner: Arc<Mutex<FabricInner>>,
}

impl LocalFabric {
    /// Creates an empty fabric.
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins a member at `addr`, returning its transport end and inbox.
    pub fn join(
        &self,
        addr: Address,
    ) -> Result<(Arc<LocalTransport>, Inbox), GridError> {
        let mut inner = self.lock();
        if inner.endpoints.contains_key(&addr) {
            return Err(GridError::Misuse(format!(
                "address {} already joined",
                addr
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.endpoints.insert(addr, tx);
        Ok((
            Arc::new(LocalTransport {
                me: addr,
                fabric: self.clone(),
            }),
            rx,
        ))
    }

    /// Cuts a member off: frames to or from it fail as unreachable.
    pub fn sever(&self, addr: Address) {
        self.lock().severed.insert(addr);
    }

    /// Reconnects a severed member.
    pub fn heal(&self, addr: Address) {
        self.lock().severed.remove(&addr);
    }

    /// Snapshot of all frames delivered so far.
    pub fn frames(&self) -> Vec<SentFrame> {
        self.lock().log.clone()
    }

    /// Forgets the frame log.
    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FabricInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deliver(
        &self,
        from: Address,
        to: Address,
        frame: Bytes,
    ) -> Result<(), GridError> {
        let mut inner = self.lock();
        if inner.severed.contains(&to) || inner.severed.contains(&from) {
            return Err(GridError::Unreachable {
                target: to,
                cause: "link severed".into(),
            });
        }
        let tx = match inner.endpoints.get(&to) {
            Some(tx) => tx,
            None => {
                return Err(GridError::Unreachable {
                    target: to,
                    cause: "no such member".into(),
                })
            }
        };
        if tx.send((from, frame.clone())).is_err() {
            inner.endpoints.remove(&to);
            return Err(GridError::Unreachable {
                target: to,
                cause: "member inbox closed".into(),
            });
        }
        inner.log.push(SentFrame { from, to, frame });
        Ok(())
    }
}

/// A member's end of a `LocalFabric`.
#[derive(Debug)]
pub struct LocalTransport {
    me: Address,
    fabric: LocalFabric,
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_addr(&self) -> Address {
        self.me
    }

    fn send(&self, to: Address, frame: Bytes) -> Result<(), GridError> {
        self.fabric.deliver(self.me, to, frame)
    }

    async fn shutdown(&self) {
        self.fabric.lock().endpoints.remove(&self.me);
    }
}
