//! Backup durability mode and tracking of outstanding backup acks.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use tokio::sync::oneshot;

/// Whether the primary response waits for backup acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    /// Fire-and-track: the response returns as soon as the primary effect is
    /// done. A primary crash before the backup lands loses the write.
    #[default]
    Async,

    /// The response waits until every backup owner acked (bounded by the
    /// backup ack timeout).
    Sync,
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BackupMode::Async => write!(f, "async"),
            BackupMode::Sync => write!(f, "sync"),
        }
    }
}

struct PendingAcks {
    remaining: usize,
    tx_done: oneshot::Sender<()>,
}

/// Outstanding backup acks of this member's sync-mode writes.
#[derive(Default)]
pub struct BackupTracker {
    next_ack: AtomicU64,
    pending: Mutex<HashMap<u64, PendingAcks>>,
}

impl BackupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a write waiting for `count` acks. The receiver resolves once
    /// all of them arrived.
    pub fn expect(&self, count: usize) -> (u64, oneshot::Receiver<()>) {
        let ack = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx_done, rx_done) = oneshot::channel();
        if count == 0 {
            let _ = tx_done.send(());
        } else {
            self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(
                ack,
                PendingAcks {
                    remaining: count,
                    tx_done,
                },
            );
        }
        (ack, rx_done)
    }

    /// Records one ack. Unknown (already done or forgotten) acks are ignored.
    pub fn ack(&self, ack: u64) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let done = match pending.get_mut(&ack) {
            Some(p) => {
                p.remaining -= 1;
                p.remaining == 0
            }
            None => false,
        };
        if done {
            if let Some(p) = pending.remove(&ack) {
                let _ = p.tx_done.send(());
            }
        }
    }

    /// Gives up waiting for an ack ID.
    pub fn forget(&self, ack: u64) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&ack);
    }

    /// Number of writes still waiting for acks.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
