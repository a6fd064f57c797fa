use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::StoreConfig;
use crate::errdata;
use crate::error::{Error, Result};
use crate::history::History;
use crate::index::Index;
use crate::pool::Pool;
use crate::recovery;
use crate::stamp::{Clock, TS_INFINITY, TS_ZERO};
use crate::tx::{Change, ChangeKind, Transaction, TxHandle, TxStatus, TxTable};
use crate::version::Version;
use crate::visibility::{has_valid_snapshots, is_readable, is_writable};

#[cfg(any(test, debug_assertions))]
use crate::stamp;

const LAYOUT: &str = "emberdb";

/// A persistent multi-version key/value store under snapshot isolation.
///
/// All methods take `&self`; concurrent calls from parallel threads are
/// supported as long as each transaction handle stays confined to one
/// thread. Every committed state is durable in the pool file before the
/// call returns.
pub struct Store {
    config: StoreConfig,
    pool: Pool,
    index: Arc<Index>,
    tx_table: TxTable,
    clock: Clock,
}

/// A point-in-time summary of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub keys: usize,
    pub versions: usize,
    pub live_transactions: usize,
}

impl Store {
    /// Open a store with default configuration.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(StoreConfig::new(path))
    }

    /// Open a store with custom configuration. The pool takes an exclusive
    /// lock on open; the recovery pass runs before any transaction starts.
    pub fn open_with_config(config: StoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let pool = if config.path.exists() {
            Pool::check(&config.path, LAYOUT)?;
            Pool::open(&config.path, LAYOUT, config.sync_writes)?
        } else if config.create_if_missing {
            Pool::create(&config.path, LAYOUT, config.sync_writes)?
        } else {
            return Err(Error::IO(format!(
                "pool file {} does not exist",
                config.path.display()
            )));
        };

        let index = pool.index();
        let clock = Clock::new();
        recovery::run(&pool, &index, &clock)?;

        Ok(Self {
            config,
            pool,
            index,
            tx_table: TxTable::new(),
            clock,
        })
    }

    /// Flushes the image and releases the pool.
    pub fn close(self) -> Result<()> {
        self.pool.flush()
    }

    /// Starts a new transaction and registers it in the transaction table.
    pub fn begin(&self) -> TxHandle {
        let tx: TxHandle = Arc::new(Transaction::new(
            self.clock.allocate_id(),
            self.clock.allocate_ts(),
        ));
        self.tx_table.insert(Arc::clone(&tx));
        tracing::debug!(id = tx.id(), begin = tx.begin(), "transaction started");
        tx
    }

    /// Reads the value of `key` visible to the transaction's snapshot.
    ///
    /// The read path never consults the change set: a transaction does not
    /// observe its own uncommitted writes. On a miss the transaction is
    /// aborted and `ValueNotFound` returned.
    pub fn read(&self, tx: &TxHandle, key: &[u8]) -> Result<Vec<u8>> {
        self.validate(tx)?;

        let Some(history) = self.index.get(key) else {
            return Err(self.fail(tx, Error::ValueNotFound));
        };

        let candidate = {
            let chain = history.lock();
            chain
                .iter()
                .find(|v| is_readable(&self.tx_table, v.as_ref(), tx))
                .map(Arc::clone)
        };

        match candidate {
            Some(version) => Ok(version.data().to_vec()),
            None => Err(self.fail(tx, Error::ValueNotFound)),
        }
    }

    /// Stages an insert or update of `key`.
    ///
    /// Updates claim ownership of the current version immediately (first
    /// writer wins); inserts stay entirely in the change set until commit.
    pub fn write(&self, tx: &TxHandle, key: &[u8], value: &[u8]) -> Result<()> {
        self.validate(tx)?;

        // A key already in the change set only needs its delta replaced. A
        // removal staged earlier in this transaction becomes an update of
        // the same origin; inserts and updates keep their kind.
        {
            let mut changes = tx.changes();
            if let Some(change) = changes.get_mut(key) {
                change.delta = value.to_vec();
                if change.kind == ChangeKind::Remove {
                    change.kind = ChangeKind::Update;
                }
                return Ok(());
            }
        }

        let Some(history) = self.index.get(key) else {
            return self.stage_insert(tx, key, value);
        };

        let origin = {
            let chain = history.lock();
            match chain
                .iter()
                .find(|v| is_writable(&self.tx_table, v.as_ref(), tx))
            {
                Some(candidate) => {
                    // Claim ownership while the chain is locked, so no
                    // competing writer can pick the same candidate.
                    candidate.store_end(tx.id());
                    Some(Arc::clone(candidate))
                }
                None if !has_valid_snapshots(&chain) => None,
                None => {
                    drop(chain);
                    return Err(self.fail(tx, Error::ValueNotFound));
                }
            }
        };

        // Only permanently invalidated versions left: treat as an insert
        // into the (logically empty) history, resolved at commit time.
        let Some(origin) = origin else {
            return self.stage_insert(tx, key, value);
        };

        tx.changes().insert(
            key.to_vec(),
            Change {
                kind: ChangeKind::Update,
                v_origin: Some(origin),
                v_new: None,
                delta: value.to_vec(),
            },
        );

        // Make the ownership stamp durable. The flush runs without the
        // chain lock; an unflushed claim is indistinguishable from never
        // claiming, and recovery normalizes either state.
        if let Err(e) = self.pool.flush() {
            return Err(self.fail(tx, e));
        }
        Ok(())
    }

    /// Stages a removal of `key`.
    pub fn delete(&self, tx: &TxHandle, key: &[u8]) -> Result<()> {
        self.validate(tx)?;

        {
            let mut changes = tx.changes();
            if let Some(kind) = changes.get(key).map(|change| change.kind) {
                match kind {
                    ChangeKind::Update => {
                        let change = changes.get_mut(key).unwrap();
                        change.kind = ChangeKind::Remove;
                        change.delta.clear();
                        return Ok(());
                    }
                    ChangeKind::Insert => {
                        // Discard the staged insert. Inserts carry no
                        // origin; if one were present, releasing the
                        // ownership stamp would be our job.
                        let change = changes.remove(key).unwrap();
                        drop(changes);
                        if let Some(origin) = &change.v_origin {
                            self.pool.durable(|| {
                                origin.store_end(TS_INFINITY);
                                Ok(())
                            })?;
                        }
                        return Ok(());
                    }
                    ChangeKind::Remove => {
                        // Already removed in this transaction. The
                        // transaction itself stays active.
                        return Err(Error::ValueNotFound);
                    }
                }
            }
        }

        let Some(history) = self.index.get(key) else {
            return Err(self.fail(tx, Error::ValueNotFound));
        };

        let origin = {
            let chain = history.lock();
            match chain
                .iter()
                .find(|v| is_writable(&self.tx_table, v.as_ref(), tx))
            {
                Some(candidate) => {
                    candidate.store_end(tx.id());
                    Arc::clone(candidate)
                }
                None => {
                    drop(chain);
                    return Err(self.fail(tx, Error::ValueNotFound));
                }
            }
        };

        tx.changes().insert(
            key.to_vec(),
            Change {
                kind: ChangeKind::Remove,
                v_origin: Some(origin),
                v_new: None,
                delta: Vec::new(),
            },
        );

        if let Err(e) = self.pool.flush() {
            return Err(self.fail(tx, e));
        }
        Ok(())
    }

    /// Commits the transaction: installs new versions durably, flips the
    /// status, and propagates the commit timestamp into every touched
    /// version. A conflicting insert surfaces as `WriteConflict` and aborts
    /// the transaction.
    pub fn commit(&self, tx: &TxHandle) -> Result<()> {
        self.validate(tx)?;

        tx.set_end(self.clock.allocate_ts());

        if let Err(e) = self.persist(tx) {
            if e != Error::WriteConflict {
                tracing::warn!(id = tx.id(), error = %e, "version installation failed");
            }
            return Err(self.fail(tx, Error::WriteConflict));
        }

        // Status flips before stamps are finalized: concurrent visibility
        // checks that resolve our id must already see the outcome.
        tx.set_status(TxStatus::Committed);

        let finalized = self.finalize(tx);
        self.tx_table.remove(tx.id());
        tracing::debug!(
            id = tx.id(),
            begin = tx.begin(),
            end = tx.end(),
            "transaction committed"
        );
        finalized
    }

    /// Aborts the transaction, rolling back every staged change.
    pub fn abort(&self, tx: &TxHandle) -> Result<()> {
        self.validate(tx)?;
        self.finish_abort(tx);
        Ok(())
    }

    /// Current size of the store.
    pub fn stats(&self) -> StoreStats {
        let map = self.index.guard();
        let keys = map.len();
        let versions = map.values().map(|history| history.lock().len()).sum();
        StoreStats {
            keys,
            versions,
            live_transactions: self.tx_table.len(),
        }
    }

    /// Writes every key and its version chain to `w`, newest first.
    pub fn dump(&self, mut w: impl Write) -> Result<()> {
        let map = self.index.guard();
        for (key, history) in map.iter() {
            writeln!(w, "key: {}", String::from_utf8_lossy(key))?;
            for v in history.lock().iter() {
                writeln!(
                    w,
                    "  began: {:>20}  ended: {:>20}  bytes: {}",
                    v.begin(),
                    v.end(),
                    v.data().len()
                )?;
            }
        }
        Ok(())
    }

    /// Asserts the structural invariants of every version chain. At a
    /// quiescent point each chain holds at most one current version and
    /// every committed version's stamps are even with `begin < end`.
    #[cfg(any(test, debug_assertions))]
    pub fn check_invariants(&self) -> Result<()> {
        let map = self.index.guard();
        for (key, history) in map.iter() {
            let chain = history.lock();
            let mut current = 0usize;
            for v in chain.iter() {
                let (begin, end) = (v.begin(), v.end());
                if end == TS_INFINITY {
                    current += 1;
                }
                let committed = !stamp::is_tx_id(begin)
                    && !stamp::is_tx_id(end)
                    && begin != TS_ZERO
                    && end != TS_ZERO
                    && end != TS_INFINITY;
                if committed && begin >= end {
                    return Err(errdata!(
                        "key {:?}: version stamped backwards, begin {begin} >= end {end}",
                        String::from_utf8_lossy(key)
                    ));
                }
            }
            if current > 1 {
                return Err(errdata!(
                    "key {:?}: {current} current versions in one chain",
                    String::from_utf8_lossy(key)
                ));
            }
        }
        Ok(())
    }

    /// A handle is valid while it is registered and still active.
    fn validate(&self, tx: &TxHandle) -> Result<()> {
        if self.tx_table.contains(tx.id()) && tx.status() == TxStatus::Active {
            Ok(())
        } else {
            Err(Error::InvalidTx)
        }
    }

    /// Aborts `tx` (if still valid) and hands the reason back to the caller.
    fn fail(&self, tx: &TxHandle, reason: Error) -> Error {
        if self.validate(tx).is_ok() {
            self.finish_abort(tx);
        }
        reason
    }

    fn finish_abort(&self, tx: &TxHandle) {
        tx.set_status(TxStatus::Failed);
        self.rollback(tx);
        self.tx_table.remove(tx.id());
        tracing::debug!(id = tx.id(), "transaction aborted");
    }

    fn stage_insert(&self, tx: &TxHandle, key: &[u8], value: &[u8]) -> Result<()> {
        tx.changes().insert(
            key.to_vec(),
            Change {
                kind: ChangeKind::Insert,
                v_origin: None,
                v_new: None,
                delta: value.to_vec(),
            },
        );
        Ok(())
    }

    /// Installs a new version for every staged insert and update inside one
    /// durable block. Removals need no installation: their origin already
    /// carries our id. A staged insert whose key gained a live history in
    /// the meantime is a write/write conflict; the block then publishes
    /// nothing and the caller aborts.
    fn persist(&self, tx: &TxHandle) -> Result<()> {
        let tid = tx.id();
        self.pool.durable(|| {
            let mut changes = tx.changes();
            for (key, change) in changes.iter_mut() {
                if change.kind == ChangeKind::Remove {
                    continue;
                }

                let v_new = Arc::new(Version::new(tid, TS_INFINITY, change.delta.clone()));

                match change.kind {
                    ChangeKind::Update => {
                        let history = self
                            .index
                            .get(key)
                            .ok_or_else(|| errdata!("history vanished under a staged update"))?;
                        history.lock().insert(0, Arc::clone(&v_new));
                    }
                    ChangeKind::Insert => {
                        // Lookup, conflict check and prepend form one
                        // critical section: a racing insert of the same key
                        // must either see our version or conflict.
                        let mut map = self.index.guard();
                        let history = match map.get(key) {
                            Some(existing) => {
                                if has_valid_snapshots(&existing.lock()) {
                                    tracing::debug!(
                                        id = tid,
                                        "write/write conflict installing insert"
                                    );
                                    return Err(Error::WriteConflict);
                                }
                                Arc::clone(existing)
                            }
                            None => {
                                let fresh = Arc::new(History::new());
                                map.insert(key.clone(), Arc::clone(&fresh));
                                fresh
                            }
                        };
                        history.lock().insert(0, Arc::clone(&v_new));
                    }
                    ChangeKind::Remove => unreachable!(),
                }

                change.v_new = Some(v_new);
            }
            Ok(())
        })
    }

    /// Propagates the commit timestamp to every version the transaction
    /// touched. No chain lock is needed: the versions already carry our id
    /// and the transaction is visibly committed, so every transition here
    /// replaces one valid stamp with another.
    fn finalize(&self, tx: &TxHandle) -> Result<()> {
        let end = tx.end();
        self.pool.durable(|| {
            let changes = tx.changes();
            for change in changes.values() {
                match change.kind {
                    ChangeKind::Insert => {
                        if let Some(v_new) = &change.v_new {
                            v_new.store_begin(end);
                        }
                    }
                    ChangeKind::Update => {
                        if let Some(v_new) = &change.v_new {
                            v_new.store_begin(end);
                        }
                        if let Some(origin) = &change.v_origin {
                            // A plain store suffices: nobody contends for an
                            // outdated version, unlike the rollback path.
                            origin.store_end(end);
                        }
                    }
                    ChangeKind::Remove => {
                        if let Some(origin) = &change.v_origin {
                            origin.store_end(end);
                        }
                    }
                }
            }
            Ok(())
        })
    }

    /// Undoes every staged change. New versions are zeroed out (they may
    /// already sit in a chain if version installation ran); claimed origins
    /// are released by compare-and-swap, because a competitor that saw us
    /// fail may have taken ownership already, and then it is theirs.
    fn rollback(&self, tx: &TxHandle) {
        let tid = tx.id();
        let result = self.pool.durable(|| {
            let changes = tx.changes();
            for change in changes.values() {
                if let Some(v_new) = &change.v_new {
                    v_new.store_begin(TS_ZERO);
                    v_new.store_end(TS_ZERO);
                }
                if matches!(change.kind, ChangeKind::Update | ChangeKind::Remove) {
                    if let Some(origin) = &change.v_origin {
                        let _ = origin.cas_end(tid, TS_INFINITY);
                    }
                }
            }
            Ok(())
        });
        if let Err(e) = result {
            tracing::warn!(id = tid, error = %e, "rollback not flushed; recovery will normalize on restart");
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.config.path)
            .field("live_transactions", &self.tx_table.len())
            .finish()
    }
}
