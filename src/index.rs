use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::Deserializer;
use serde::ser::Error as _;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::history::History;

/// The primary index: key bytes to version-chain head.
///
/// One process-wide mutex serializes every structural operation, lookups
/// included. That is a documented scalability ceiling, not an oversight:
/// chain scans do the heavy lifting and run under their own per-key locks.
/// Lookups take `&[u8]`, so a volatile caller key and the owned key stored
/// in the map hash identically for free.
#[derive(Debug, Default)]
pub struct Index {
    map: Mutex<HashMap<Vec<u8>, Arc<History>>>,
}

impl Index {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Looks up the history for a key, releasing the index lock before
    /// returning the handle.
    pub fn get(&self, key: &[u8]) -> Option<Arc<History>> {
        self.map.lock().unwrap().get(key).map(Arc::clone)
    }

    /// Inserts a history for a key. Returns false if the key was already
    /// present, leaving the existing history in place.
    pub fn put(&self, key: &[u8], history: Arc<History>) -> bool {
        let mut map = self.map.lock().unwrap();
        if map.contains_key(key) {
            return false;
        }
        map.insert(key.to_vec(), history);
        true
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Locks the whole map. Used where lookup and insertion must be one
    /// critical section (version installation) and by the recovery scan,
    /// which holds the guard for its entire pass.
    pub(crate) fn guard(&self) -> MutexGuard<'_, HashMap<Vec<u8>, Arc<History>>> {
        self.map.lock().unwrap()
    }
}

impl Serialize for Index {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let map = self
            .map
            .lock()
            .map_err(|_| S::Error::custom("index mutex poisoned"))?;
        map.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Index {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = HashMap::<Vec<u8>, Arc<History>>::deserialize(deserializer)?;
        Ok(Self {
            map: Mutex::new(map),
        })
    }
}
