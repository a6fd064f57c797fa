use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::Deserializer;
use serde::ser::Error as _;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::version::Version;

/// The version chain of one key, newest first.
///
/// All chain access goes through the mutex; there are no lock-free reads.
/// The mutex itself is volatile: it is not part of the durable image, so a
/// freshly opened pool always starts with every history unlocked, whatever
/// state the previous session died in.
#[derive(Debug)]
pub struct History {
    chain: Mutex<Vec<Arc<Version>>>,
}

impl History {
    pub fn new() -> Self {
        Self {
            chain: Mutex::new(Vec::new()),
        }
    }

    /// Locks the chain. The guard is the only way to scan or mutate it;
    /// newest versions sit at the front.
    pub fn lock(&self) -> MutexGuard<'_, Vec<Arc<Version>>> {
        self.chain.lock().unwrap()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

impl Serialize for History {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let chain = self
            .chain
            .lock()
            .map_err(|_| S::Error::custom("history mutex poisoned"))?;
        chain.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for History {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let chain = Vec::<Arc<Version>>::deserialize(deserializer)?;
        Ok(Self {
            chain: Mutex::new(chain),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stamp::TS_INFINITY;

    #[test]
    fn test_prepend_keeps_newest_first() {
        let history = History::new();
        {
            let mut chain = history.lock();
            chain.insert(0, Arc::new(Version::new(2, 4, b"old".to_vec())));
            chain.insert(0, Arc::new(Version::new(4, TS_INFINITY, b"new".to_vec())));
        }
        let chain = history.lock();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].data(), b"new");
        assert_eq!(chain[1].data(), b"old");
    }

    #[test]
    fn test_serde_roundtrip_unlocks_mutex() {
        let history = History::new();
        history
            .lock()
            .insert(0, Arc::new(Version::new(2, TS_INFINITY, b"v".to_vec())));

        let bytes = bincode::serialize(&history).unwrap();
        let back: History = bincode::deserialize(&bytes).unwrap();

        // The deserialized mutex is fresh, so locking cannot block.
        let chain = back.lock();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].begin(), 2);
    }
}
