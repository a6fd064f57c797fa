use std::sync::Arc;

use crate::stamp::{self, Stamp, TS_INFINITY};
use crate::tx::{Transaction, TxStatus, TxTable};
use crate::version::Version;

/// May `tx` read `v`? Both sides of the version must have been settled
/// relative to the transaction's snapshot: the creator committed before
/// `tx` began, and no invalidation committed before `tx` began.
pub(crate) fn is_readable(table: &TxTable, v: &Version, tx: &Transaction) -> bool {
    if !begin_visible(table, v, tx) {
        return false;
    }

    let mut last_miss: Option<Stamp> = None;
    loop {
        let v_end = v.end();
        if stamp::is_tx_id(v_end) {
            match table.get(v_end) {
                // The invalidation only hides v if its writer committed
                // before our snapshot. Active and failed owners leave the
                // version readable.
                Some(owner) => {
                    return !(owner.status() == TxStatus::Committed && owner.end() < tx.begin())
                }
                None => {
                    if unresolvable(&mut last_miss, v_end) {
                        return false;
                    }
                }
            }
        } else {
            // An invalidation stamped before our snapshot hides v; one at or
            // after it does not. This is weaker than the write-side rule: a
            // version may stay readable long after it stopped being current.
            return v_end >= tx.begin();
        }
    }
}

/// May `tx` claim `v` for an update or removal? The begin side is the read
/// test; the end side is stricter: the version must be fully current
/// (`TS_INFINITY`), or owned by a transaction that already failed, in which
/// case ownership can be reclaimed. Anything else means a competing writer
/// got here first, which is exactly the first-writer-wins rule.
pub(crate) fn is_writable(table: &TxTable, v: &Version, tx: &Transaction) -> bool {
    if !begin_visible(table, v, tx) {
        return false;
    }

    let mut last_miss: Option<Stamp> = None;
    loop {
        let v_end = v.end();
        if stamp::is_tx_id(v_end) {
            match table.get(v_end) {
                Some(owner) => return owner.status() == TxStatus::Failed,
                None => {
                    if unresolvable(&mut last_miss, v_end) {
                        return false;
                    }
                }
            }
        } else {
            return v_end == TS_INFINITY;
        }
    }
}

/// Shared begin-side test: the creator of `v` must have committed before
/// `tx` began, whether we learn that from its still-registered transaction
/// or from an already finalized stamp.
fn begin_visible(table: &TxTable, v: &Version, tx: &Transaction) -> bool {
    let mut last_miss: Option<Stamp> = None;
    loop {
        let v_begin = v.begin();
        if stamp::is_tx_id(v_begin) {
            match table.get(v_begin) {
                Some(creator) => {
                    return creator.status() == TxStatus::Committed && creator.end() <= tx.begin()
                }
                None => {
                    if unresolvable(&mut last_miss, v_begin) {
                        return false;
                    }
                }
            }
        } else {
            return v_begin < tx.begin();
        }
    }
}

/// A transaction id embedded in a stamp resolves while its owner is still in
/// the table; a miss means the field was finalized concurrently and the
/// reread will observe the new value. Seeing the same unresolvable id twice
/// violates that protocol.
fn unresolvable(last_miss: &mut Option<Stamp>, observed: Stamp) -> bool {
    if *last_miss == Some(observed) {
        debug_assert!(false, "stamp {observed} resolves to no transaction");
        return true;
    }
    *last_miss = Some(observed);
    false
}

/// True iff the chain still holds at least one version that is not
/// permanently invalidated: a current version, or one whose end carries a
/// transaction id (live or not). Empty-looking histories with only
/// finalized invalidations may be reused by inserts.
pub(crate) fn has_valid_snapshots(chain: &[Arc<Version>]) -> bool {
    chain.iter().any(|v| {
        let end = v.end();
        end == TS_INFINITY || stamp::is_tx_id(end)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stamp::{TS_INFINITY, TS_ZERO};
    use crate::tx::TxHandle;

    fn observer(begin: Stamp) -> Transaction {
        Transaction::new(901, begin)
    }

    fn registered(table: &TxTable, id: Stamp, begin: Stamp) -> TxHandle {
        let tx: TxHandle = Arc::new(Transaction::new(id, begin));
        table.insert(Arc::clone(&tx));
        tx
    }

    #[test]
    fn test_committed_version_visible_after_begin() {
        let table = TxTable::new();
        let tx = observer(10);
        let v = Version::new(4, TS_INFINITY, b"v".to_vec());
        assert!(is_readable(&table, &v, &tx));
        assert!(is_writable(&table, &v, &tx));
    }

    #[test]
    fn test_version_from_the_future_is_invisible() {
        let table = TxTable::new();
        let tx = observer(10);
        let v = Version::new(12, TS_INFINITY, b"v".to_vec());
        assert!(!is_readable(&table, &v, &tx));
        assert!(!is_writable(&table, &v, &tx));
    }

    #[test]
    fn test_uncommitted_creator_hides_version() {
        let table = TxTable::new();
        let tx = observer(10);
        let writer = registered(&table, 7, 6);
        let v = Version::new(writer.id(), TS_INFINITY, b"v".to_vec());

        // Writer still active: invisible.
        assert!(!is_readable(&table, &v, &tx));

        // Writer committed before our snapshot: visible.
        writer.set_end(8);
        writer.set_status(TxStatus::Committed);
        assert!(is_readable(&table, &v, &tx));
        assert!(is_writable(&table, &v, &tx));
    }

    #[test]
    fn test_creator_committed_after_snapshot_stays_hidden() {
        let table = TxTable::new();
        let tx = observer(10);
        let writer = registered(&table, 7, 6);
        writer.set_end(14);
        writer.set_status(TxStatus::Committed);

        let v = Version::new(writer.id(), TS_INFINITY, b"v".to_vec());
        assert!(!is_readable(&table, &v, &tx));
    }

    #[test]
    fn test_owned_version_readable_but_not_writable() {
        let table = TxTable::new();
        let tx = observer(10);
        let owner = registered(&table, 11, 8);

        // Current version claimed by a live updater: readers still see it,
        // writers must not touch it.
        let v = Version::new(4, owner.id(), b"v".to_vec());
        assert!(is_readable(&table, &v, &tx));
        assert!(!is_writable(&table, &v, &tx));
    }

    #[test]
    fn test_ownership_reclaimable_from_aborter() {
        let table = TxTable::new();
        let tx = observer(10);
        let owner = registered(&table, 11, 8);
        owner.set_status(TxStatus::Failed);

        let v = Version::new(4, owner.id(), b"v".to_vec());
        assert!(is_readable(&table, &v, &tx));
        assert!(is_writable(&table, &v, &tx));
    }

    #[test]
    fn test_invalidation_before_snapshot_hides_version() {
        let table = TxTable::new();
        let tx = observer(10);

        let v = Version::new(2, 6, b"v".to_vec());
        assert!(!is_readable(&table, &v, &tx));
        assert!(!is_writable(&table, &v, &tx));
    }

    #[test]
    fn test_invalidation_after_snapshot_keeps_version_readable() {
        let table = TxTable::new();
        let tx = observer(10);

        // Invalidated at 14, after our snapshot at 10: readable, but not
        // writable because a committed successor exists.
        let v = Version::new(2, 14, b"v".to_vec());
        assert!(is_readable(&table, &v, &tx));
        assert!(!is_writable(&table, &v, &tx));
    }

    #[test]
    fn test_invalidator_committed_after_snapshot_keeps_version_readable() {
        let table = TxTable::new();
        let tx = observer(10);
        let invalidator = registered(&table, 13, 12);
        invalidator.set_end(14);
        invalidator.set_status(TxStatus::Committed);

        let v = Version::new(2, invalidator.id(), b"v".to_vec());
        assert!(is_readable(&table, &v, &tx));
        assert!(!is_writable(&table, &v, &tx));
    }

    #[test]
    fn test_zeroed_version_invisible_to_everyone() {
        let table = TxTable::new();
        let tx = observer(10);
        let v = Version::new(TS_ZERO, TS_ZERO, vec![]);
        assert!(!is_readable(&table, &v, &tx));
        assert!(!is_writable(&table, &v, &tx));
    }

    #[test]
    fn test_readability_is_stable_under_unrelated_commits() {
        let table = TxTable::new();
        let tx = observer(10);
        let v = Version::new(4, TS_INFINITY, b"v".to_vec());
        assert!(is_readable(&table, &v, &tx));

        // Registering and committing an unrelated transaction must not
        // change the verdict for an untouched version.
        let other = registered(&table, 21, 12);
        other.set_end(14);
        other.set_status(TxStatus::Committed);
        assert!(is_readable(&table, &v, &tx));
    }

    #[test]
    fn test_has_valid_snapshots() {
        let current = Arc::new(Version::new(2, TS_INFINITY, vec![]));
        let owned = Arc::new(Version::new(2, 5, vec![]));
        let dead = Arc::new(Version::new(2, 4, vec![]));
        let zeroed = Arc::new(Version::new(TS_ZERO, TS_ZERO, vec![]));

        assert!(has_valid_snapshots(&[Arc::clone(&current)]));
        assert!(has_valid_snapshots(&[Arc::clone(&owned)]));
        assert!(!has_valid_snapshots(&[Arc::clone(&dead)]));
        assert!(!has_valid_snapshots(&[zeroed, dead]));
        assert!(has_valid_snapshots(&[
            Arc::new(Version::new(2, 4, vec![])),
            current
        ]));
        assert!(!has_valid_snapshots(&[]));
    }
}
