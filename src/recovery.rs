use crate::error::Result;
use crate::index::Index;
use crate::pool::Pool;
use crate::stamp::{self, Clock, TS_INFINITY};

/// Startup purge: reconciles version state left behind by the last session.
///
/// Stamps are session-local (the clock is not persisted), so every surviving
/// version is rebased to look like it committed at the very start of this
/// session, and everything else is deleted:
///
/// - odd `begin`: the creator never finalized, the version was never
///   visible, delete it;
/// - `end == TS_INFINITY`: the current version, keep it and rebase `begin`;
/// - odd `end`: the invalidator never finalized, revalidate the version
///   (rebase `begin`, reset `end`);
/// - even finalized `end`: superseded by a committed transaction, delete.
///
/// Afterwards the clock skips one slot so that every transaction of this
/// session observes a begin stamp strictly above the rebased versions.
pub(crate) fn run(pool: &Pool, index: &Index, clock: &Clock) -> Result<()> {
    let first_stamp = clock.current_ts();
    let mut versions_dropped = 0usize;
    let mut histories_removed = 0usize;

    pool.durable(|| {
        // The scan owns the index for the whole pass; nothing else runs yet.
        let mut map = index.guard();
        map.retain(|_, history| {
            // Chain mutexes deserialize released, so this lock cannot block
            // on state inherited from the previous session.
            let mut chain = history.lock();
            chain.retain(|v| {
                if stamp::is_tx_id(v.begin()) {
                    versions_dropped += 1;
                    false
                } else if v.end() == TS_INFINITY {
                    v.store_begin(first_stamp);
                    true
                } else if stamp::is_tx_id(v.end()) {
                    v.store_begin(first_stamp);
                    v.store_end(TS_INFINITY);
                    true
                } else {
                    versions_dropped += 1;
                    false
                }
            });
            let keep = !chain.is_empty();
            if !keep {
                histories_removed += 1;
            }
            keep
        });
        Ok(())
    })?;

    clock.advance_ts();

    tracing::info!(
        versions_dropped,
        histories_removed,
        first_stamp,
        "recovery pass complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::History;
    use crate::stamp::{TS_DELTA, TS_START};
    use crate::version::Version;
    use std::sync::Arc;
    use tempfile::TempDir;

    const LAYOUT: &str = "emberdb";

    fn seeded_pool(dir: &TempDir) -> Pool {
        Pool::create(dir.path().join("recovery.pool"), LAYOUT, false).unwrap()
    }

    fn chain_of(pool: &Pool, key: &[u8], versions: Vec<Version>) {
        let history = Arc::new(History::new());
        {
            let mut chain = history.lock();
            for v in versions {
                chain.push(Arc::new(v));
            }
        }
        pool.index().put(key, history);
    }

    #[test]
    fn test_unfinalized_creation_is_deleted() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let pool = seeded_pool(&dir);
        // Version installed by a transaction that crashed before finalize.
        chain_of(
            &pool,
            b"k",
            vec![
                Version::new(9, TS_INFINITY, b"in-flight".to_vec()),
                Version::new(4, 9, b"stable".to_vec()),
            ],
        );

        let clock = Clock::new();
        run(&pool, &pool.index(), &clock)?;

        let history = pool.index().get(b"k").unwrap();
        let chain = history.lock();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].data(), b"stable");
        assert_eq!(chain[0].begin(), TS_START);
        assert_eq!(chain[0].end(), TS_INFINITY);
        Ok(())
    }

    #[test]
    fn test_current_version_is_rebased() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let pool = seeded_pool(&dir);
        chain_of(
            &pool,
            b"k",
            vec![
                Version::new(40, TS_INFINITY, b"current".to_vec()),
                Version::new(20, 40, b"old".to_vec()),
            ],
        );

        let clock = Clock::new();
        run(&pool, &pool.index(), &clock)?;

        let history = pool.index().get(b"k").unwrap();
        let chain = history.lock();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].data(), b"current");
        assert_eq!(chain[0].begin(), TS_START);

        // Session stamps start above the rebase value.
        assert_eq!(clock.current_ts(), TS_START + TS_DELTA);
        assert!(clock.allocate_ts() > chain[0].begin());
        Ok(())
    }

    #[test]
    fn test_dead_versions_and_empty_history_are_purged() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let pool = seeded_pool(&dir);
        chain_of(
            &pool,
            b"gone",
            vec![Version::new(4, 6, b"a".to_vec()), Version::new(2, 4, b"b".to_vec())],
        );
        chain_of(&pool, b"kept", vec![Version::new(4, TS_INFINITY, b"c".to_vec())]);

        let clock = Clock::new();
        run(&pool, &pool.index(), &clock)?;

        assert!(pool.index().get(b"gone").is_none());
        assert!(pool.index().get(b"kept").is_some());
        assert_eq!(pool.index().len(), 1);
        Ok(())
    }

    #[test]
    fn test_orphaned_ownership_is_revalidated() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let pool = seeded_pool(&dir);
        // The invalidator (id 11) claimed the version but never committed.
        chain_of(&pool, b"k", vec![Version::new(4, 11, b"claimed".to_vec())]);

        let clock = Clock::new();
        run(&pool, &pool.index(), &clock)?;

        let history = pool.index().get(b"k").unwrap();
        let chain = history.lock();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].begin(), TS_START);
        assert_eq!(chain[0].end(), TS_INFINITY);
        Ok(())
    }

    #[test]
    fn test_recovery_result_is_durable() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("recovery.pool");
        {
            let pool = Pool::create(&path, LAYOUT, false)?;
            chain_of(&pool, b"junk", vec![Version::new(7, TS_INFINITY, b"x".to_vec())]);
            pool.flush()?;
        }

        {
            let pool = Pool::open(&path, LAYOUT, false)?;
            let clock = Clock::new();
            run(&pool, &pool.index(), &clock)?;
        }

        // A third session must not see the purged version again.
        let pool = Pool::open(&path, LAYOUT, false)?;
        assert!(pool.index().get(b"junk").is_none());
        Ok(())
    }
}
