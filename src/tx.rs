use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_skiplist::SkipMap;

use crate::stamp::Stamp;
use crate::version::Version;

/// Lifecycle of a transaction. Transitions are monotonic: `Active` moves to
/// exactly one of `Committed` or `Failed` and never back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TxStatus {
    Active = 0,
    Committed = 1,
    Failed = 2,
}

impl TxStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TxStatus::Active,
            1 => TxStatus::Committed,
            _ => TxStatus::Failed,
        }
    }
}

/// What a pending change does to its key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChangeKind {
    Insert,
    Update,
    Remove,
}

/// One staged modification.
///
/// `v_origin` is the pre-existing version the transaction invalidated (its
/// `end` carries our id); absent for inserts. `v_new` is filled in while
/// versions are installed at commit time; absent for removals. Neither
/// handle is owning in the durable sense: the history keeps the versions
/// alive, the change set only points at them.
#[derive(Debug)]
pub(crate) struct Change {
    pub kind: ChangeKind,
    pub v_origin: Option<Arc<Version>>,
    pub v_new: Option<Arc<Version>>,
    pub delta: Vec<u8>,
}

/// A client transaction.
///
/// The handle is shared between the caller, the transaction table and any
/// concurrent visibility check that resolved our id out of a version stamp,
/// so the fields those checks read (`status`, `end`) are atomic. The change
/// set is only ever touched by the owning thread; the mutex merely makes
/// the sharing sound.
#[derive(Debug)]
pub struct Transaction {
    id: Stamp,
    begin: Stamp,
    end: AtomicU64,
    status: AtomicU8,
    changes: Mutex<HashMap<Vec<u8>, Change>>,
}

/// Shared handle to a transaction.
pub type TxHandle = Arc<Transaction>;

impl Transaction {
    pub fn new(id: Stamp, begin: Stamp) -> Self {
        Self {
            id,
            begin,
            end: AtomicU64::new(0),
            status: AtomicU8::new(TxStatus::Active as u8),
            changes: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> Stamp {
        self.id
    }

    pub fn begin(&self) -> Stamp {
        self.begin
    }

    /// The commit timestamp. Meaningful once the transaction entered commit;
    /// visibility checks only read it after observing `Committed`, and the
    /// engine stores it before flipping the status.
    pub fn end(&self) -> Stamp {
        self.end.load(Ordering::SeqCst)
    }

    pub fn set_end(&self, end: Stamp) {
        self.end.store(end, Ordering::SeqCst);
    }

    pub fn status(&self) -> TxStatus {
        TxStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn set_status(&self, status: TxStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    pub(crate) fn changes(&self) -> MutexGuard<'_, HashMap<Vec<u8>, Change>> {
        self.changes.lock().unwrap()
    }
}

/// The global transaction table: id to handle, for resolving transaction
/// ids embedded in version stamps. Lock-free; callers hold no outer lock.
#[derive(Debug, Default)]
pub(crate) struct TxTable {
    map: SkipMap<Stamp, TxHandle>,
}

impl TxTable {
    pub fn new() -> Self {
        Self {
            map: SkipMap::new(),
        }
    }

    pub fn insert(&self, tx: TxHandle) {
        self.map.insert(tx.id(), tx);
    }

    pub fn get(&self, id: Stamp) -> Option<TxHandle> {
        self.map.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: Stamp) -> bool {
        self.map.contains_key(&id)
    }

    pub fn remove(&self, id: Stamp) {
        self.map.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}
