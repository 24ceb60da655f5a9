//! Local entry event service. Events published by operations in `after_run`
//! reach listeners registered on the member that executed the operation.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::cluster::Data;

use serde::{Deserialize, Serialize};

use tokio::sync::broadcast;

/// Capacity of each structure's event channel; slow listeners lag behind
/// and lose the oldest events.
const EVENT_CHANNEL_CAP: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryEventKind {
    Added,
    Updated,
    Removed,
    Evicted,
}

/// Change notification of one entry (map) or item (list, `key` is `None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryEvent {
    pub kind: EntryEventKind,
    pub key: Option<Data>,
    pub value: Option<Data>,
    pub old_value: Option<Data>,
}

/// Per-structure broadcast channels of entry events.
#[derive(Debug, Default)]
pub struct EventService {
    channels: RwLock<HashMap<String, broadcast::Sender<EntryEvent>>>,
}

impl EventService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener on structure `name`.
    pub fn subscribe(&self, name: &str) -> broadcast::Receiver<EntryEvent> {
        let mut channels =
            self.channels.write().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(name.into())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAP).0)
            .subscribe()
    }

    /// Whether any live listener exists on structure `name`.
    pub fn has_listener(&self, name: &str) -> bool {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map_or(false, |tx| tx.receiver_count() > 0)
    }

    /// Delivers an event to the listeners of structure `name`.
    pub fn publish(&self, name: &str, event: EntryEvent) {
        let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = channels.get(name) {
            // no receivers left is fine
            let _ = tx.send(event);
        }
    }
}
