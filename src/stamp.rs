use std::sync::atomic::{AtomicU64, Ordering};

/// A 64-bit stamp. The least significant bit discriminates: even values are
/// commit timestamps, odd values are transaction identifiers.
pub type Stamp = u64;

/// Tombstone stamp, invisible to every transaction.
pub const TS_ZERO: Stamp = 0;

/// End stamp of a version that is valid until further notice.
pub const TS_INFINITY: Stamp = u64::MAX - 1;

/// Increment applied by both counters, preserving parity.
pub const TS_DELTA: Stamp = 2;

/// First timestamp handed out by a fresh clock (even).
pub const TS_START: Stamp = 2;

/// First transaction id handed out by a fresh clock (odd).
pub const ID_START: Stamp = 1;

/// Tests whether the given stamp is a transaction id.
#[inline]
pub fn is_tx_id(stamp: Stamp) -> bool {
    stamp & 1 == 1
}

/// Logical clock handing out commit timestamps and transaction ids.
///
/// Both counters are wait-free fetch-adds. Timestamps stay even and ids stay
/// odd for the lifetime of the process; the counters are never reset to an
/// unaligned value.
#[derive(Debug)]
pub struct Clock {
    next_ts: AtomicU64,
    next_id: AtomicU64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            next_ts: AtomicU64::new(TS_START),
            next_id: AtomicU64::new(ID_START),
        }
    }

    /// Hands out the next commit timestamp (even).
    pub fn allocate_ts(&self) -> Stamp {
        self.next_ts.fetch_add(TS_DELTA, Ordering::SeqCst)
    }

    /// Hands out the next transaction id (odd).
    pub fn allocate_id(&self) -> Stamp {
        self.next_id.fetch_add(TS_DELTA, Ordering::SeqCst)
    }

    /// The timestamp the next call to [`Clock::allocate_ts`] would return.
    pub fn current_ts(&self) -> Stamp {
        self.next_ts.load(Ordering::SeqCst)
    }

    /// Skips one timestamp slot. Recovery uses this so that every stamp of
    /// the new session strictly exceeds the stamps it rebased.
    pub fn advance_ts(&self) {
        self.next_ts.fetch_add(TS_DELTA, Ordering::SeqCst);
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
