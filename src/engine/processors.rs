//! Member-local table of named entry processors. Processors are code, so
//! only their names travel on the wire; every member registers the same
//! table at startup.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::cluster::Data;
use crate::utils::GridError;

/// Logic run against one map entry on the partition owning it, under the
/// partition's exclusive execution.
pub trait EntryProcessor: Send + Sync {
    /// Processes the entry of `key`. `value` holds the current value and is
    /// left as the new one: `None` removes the entry. The return value is
    /// handed back to the caller.
    fn process(
        &self,
        key: &Data,
        value: &mut Option<Data>,
        arg: &Data,
    ) -> Result<Option<Data>, GridError>;
}

impl<F> EntryProcessor for F
where
    F: Fn(&Data, &mut Option<Data>, &Data) -> Result<Option<Data>, GridError>
        + Send
        + Sync,
{
    fn process(
        &self,
        key: &Data,
        value: &mut Option<Data>,
        arg: &Data,
    ) -> Result<Option<Data>, GridError> {
        self(key, value, arg)
    }
}

/// Processor name -> processor.
#[derive(Default)]
pub struct EntryProcessors {
    table: RwLock<HashMap<String, Arc<dyn EntryProcessor>>>,
}

impl EntryProcessors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a processor under `name`; returns false if it replaced an
    /// earlier one.
    pub fn register(&self, name: &str, processor: Arc<dyn EntryProcessor>) -> bool {
        self.table
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), processor)
            .is_none()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn EntryProcessor>> {
        self.table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}
