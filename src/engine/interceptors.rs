//! Member-local registry of map interceptors, kept identical on every member
//! by broadcasting registrations.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::cluster::Data;

/// Map name -> interceptor ID -> serialized interceptor.
#[derive(Debug, Default)]
pub struct InterceptorRegistry {
    maps: RwLock<HashMap<String, BTreeMap<String, Data>>>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an interceptor; returns false if the ID was already taken.
    pub fn add(&self, map: &str, id: &str, interceptor: Data) -> bool {
        self.maps
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(map.into())
            .or_default()
            .insert(id.into(), interceptor)
            .is_none()
    }

    /// Removes an interceptor; returns whether it existed.
    pub fn remove(&self, map: &str, id: &str) -> bool {
        let mut maps = self.maps.write().unwrap_or_else(|e| e.into_inner());
        match maps.get_mut(map) {
            Some(ids) => {
                let removed = ids.remove(id).is_some();
                if ids.is_empty() {
                    maps.remove(map);
                }
                removed
            }
            None => false,
        }
    }

    /// IDs of the interceptors registered on a map, in ID order.
    pub fn ids(&self, map: &str) -> Vec<String> {
        self.maps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(map)
            .map_or(vec![], |ids| ids.keys().cloned().collect())
    }
}
