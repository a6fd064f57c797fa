use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::Deserializer;
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};

use crate::stamp::{self, Stamp, TS_INFINITY, TS_ZERO};

/// One value of a key, durable once its history is flushed.
///
/// `begin` is written by its creator (the odd transaction id while in
/// flight, the commit timestamp once finalized) and by recovery when it
/// rebases survivors. `end` is the ownership word: `TS_INFINITY` while the
/// version is current, an odd id while an updater holds it, an even stamp
/// once an invalidation committed. `data` never changes after construction.
#[derive(Debug)]
pub struct Version {
    begin: AtomicU64,
    end: AtomicU64,
    data: Vec<u8>,
}

impl Version {
    pub fn new(begin: Stamp, end: Stamp, data: Vec<u8>) -> Self {
        Self {
            begin: AtomicU64::new(begin),
            end: AtomicU64::new(end),
            data,
        }
    }

    pub fn begin(&self) -> Stamp {
        self.begin.load(Ordering::SeqCst)
    }

    pub fn end(&self) -> Stamp {
        self.end.load(Ordering::SeqCst)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn store_begin(&self, stamp: Stamp) {
        self.begin.store(stamp, Ordering::SeqCst);
    }

    pub fn store_end(&self, stamp: Stamp) {
        self.end.store(stamp, Ordering::SeqCst);
    }

    /// Swings `end` from `current` to `new` if no one got there first.
    /// Returns false when another transaction already took ownership.
    pub fn cas_end(&self, current: Stamp, new: Stamp) -> bool {
        self.end
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// A version no transaction will ever see again: invalidated by a
    /// committed transaction, or zeroed out by a rollback.
    pub fn is_permanently_invalid(&self) -> bool {
        let end = self.end();
        end == TS_ZERO || (!stamp::is_tx_id(end) && end != TS_INFINITY)
    }
}

// The atomics are read and rebuilt by hand: an in-flight snapshot of the
// stamps is exactly what recovery expects to find after a crash.
impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Version", 3)?;
        state.serialize_field("begin", &self.begin())?;
        state.serialize_field("end", &self.end())?;
        state.serialize_field("data", &self.data)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            begin: Stamp,
            end: Stamp,
            data: Vec<u8>,
        }
        let raw = Raw::deserialize(deserializer)?;
        Ok(Version::new(raw.begin, raw.end, raw.data))
    }
}
