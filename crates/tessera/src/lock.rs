//! The move-keys singleton lock.
//!
//! Two keys guard every write to the shard map, the data-move range and the
//! audit range: an owner token and a writer token. Taking the lock records
//! the pair it displaced; every later locked write re-checks that nobody
//! else has taken over, so at most one distributor's writes are ever valid.

use tracing::debug;

use crate::error::{Error, Result};
use crate::keys;
use crate::snapshot::DdEnabledState;
use crate::store::{SystemStore, Transaction};
use crate::Uid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MoveKeysLock {
    /// Owner token observed when this lock was taken.
    pub prev_owner: Uid,
    /// Writer token observed when this lock was taken.
    pub prev_write: Uid,
    /// Our owner token, written when the lock was taken.
    pub my_owner: Uid,
}

fn read_token(tr: &mut Transaction<'_>, key: &[u8]) -> Uid {
    tr.get(key)
        .and_then(|v| Uid::from_slice(&v).ok())
        .unwrap_or(Uid::nil())
}

/// Displace whoever holds the lock. The displaced pair is remembered so a
/// racing checkpoint by the old owner fails with a conflict, not a torn
/// write.
pub async fn take_move_keys_lock(store: &SystemStore, dd_id: Uid) -> Result<MoveKeysLock> {
    let lock = store
        .run_txn(|tr| {
            let prev_owner = read_token(tr, &keys::move_keys_lock_owner_key());
            let prev_write = read_token(tr, &keys::move_keys_lock_write_key());
            let my_owner = Uid::new_v4();
            let writer = Uid::new_v4();
            tr.set(&keys::move_keys_lock_owner_key(), my_owner.as_bytes());
            tr.set(&keys::move_keys_lock_write_key(), writer.as_bytes());
            Ok(MoveKeysLock {
                prev_owner,
                prev_write,
                my_owner,
            })
        })
        .await?;
    debug!(
        dd_id = %dd_id,
        prev_owner = %lock.prev_owner,
        my_owner = %lock.my_owner,
        "took move keys lock"
    );
    Ok(lock)
}

/// Verify lock ownership inside `tr`; with `is_write` the lock is also
/// re-asserted (fresh writer token) so overlapping acquisition attempts
/// conflict at commit.
pub fn check_move_keys_lock(
    tr: &mut Transaction<'_>,
    lock: &MoveKeysLock,
    enabled: &DdEnabledState,
    is_write: bool,
) -> Result<()> {
    if !enabled.is_enabled() {
        debug!("distributor disabled by in-memory check");
        return Err(Error::MoveKeysConflict);
    }
    let current_owner = read_token(tr, &keys::move_keys_lock_owner_key());

    if current_owner == lock.prev_owner {
        // The owner key still carries the pair we displaced; make sure the
        // previous owner has not touched the lock since our snapshot.
        let last_write = read_token(tr, &keys::move_keys_lock_write_key());
        if last_write != lock.prev_write {
            debug!(current_owner = %current_owner, "conflict with previous lock owner");
            return Err(Error::MoveKeysConflict);
        }
        if is_write {
            tr.set(&keys::move_keys_lock_owner_key(), lock.my_owner.as_bytes());
            tr.set(
                &keys::move_keys_lock_write_key(),
                Uid::new_v4().as_bytes(),
            );
        }
        Ok(())
    } else if current_owner == lock.my_owner {
        if is_write {
            // Touch the writer token, invalidating any in-flight takeover
            // that snapshotted the old one.
            tr.set(
                &keys::move_keys_lock_write_key(),
                Uid::new_v4().as_bytes(),
            );
        }
        Ok(())
    } else {
        debug!(
            current_owner = %current_owner,
            my_owner = %lock.my_owner,
            "conflict with new lock owner"
        );
        Err(Error::MoveKeysConflict)
    }
}

/// Periodically re-check the lock; returns (with a conflict) as soon as
/// another owner appears, unwinding the distributor to its bootstrap loop.
pub async fn poll_move_keys_lock(
    store: &SystemStore,
    lock: MoveKeysLock,
    enabled: &DdEnabledState,
    interval: std::time::Duration,
) -> Result<()> {
    loop {
        tokio::time::sleep(interval).await;
        store
            .run_txn(|tr| check_move_keys_lock(tr, &lock, enabled, false))
            .await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, SystemStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SystemStore::open(dir.path().join("sys")).expect("open store");
        (dir, store)
    }

    #[tokio::test]
    async fn lock_exchange_invalidates_the_old_owner() {
        let (_dir, store) = store().await;
        let enabled = DdEnabledState::new();

        let lock_a = take_move_keys_lock(&store, Uid::new_v4()).await.expect("A");
        // A can keep writing under its own lock.
        store
            .run_txn(|tr| check_move_keys_lock(tr, &lock_a, &enabled, true))
            .await
            .expect("A holds the lock");

        let lock_b = take_move_keys_lock(&store, Uid::new_v4()).await.expect("B");
        assert_eq!(lock_b.prev_owner, lock_a.my_owner);

        // A's next locked write must observe B and fail.
        let res = store
            .run_txn(|tr| check_move_keys_lock(tr, &lock_a, &enabled, true))
            .await;
        assert_eq!(res, Err(Error::MoveKeysConflict));

        // B remains valid.
        store
            .run_txn(|tr| check_move_keys_lock(tr, &lock_b, &enabled, true))
            .await
            .expect("B holds the lock");
    }

    #[tokio::test]
    async fn stale_takeover_attempt_conflicts_on_writer_token() {
        let (_dir, store) = store().await;
        let enabled = DdEnabledState::new();

        let lock_a = take_move_keys_lock(&store, Uid::new_v4()).await.expect("A");

        // A touches the writer token (keep-alive) after a would-be taker
        // snapshotted the pair.
        let stale = MoveKeysLock {
            prev_owner: lock_a.my_owner,
            prev_write: Uid::new_v4(), // not what is stored
            my_owner: Uid::new_v4(),
        };
        let res = store
            .run_txn(|tr| check_move_keys_lock(tr, &stale, &enabled, true))
            .await;
        assert_eq!(res, Err(Error::MoveKeysConflict));
    }

    #[tokio::test]
    async fn disabled_state_blocks_locked_writes() {
        let (_dir, store) = store().await;
        let enabled = DdEnabledState::new();
        let lock = take_move_keys_lock(&store, Uid::new_v4()).await.expect("A");

        let snap_uid = Uid::new_v4();
        assert!(enabled.try_set_snapshot(snap_uid));
        let res = store
            .run_txn(|tr| check_move_keys_lock(tr, &lock, &enabled, true))
            .await;
        assert_eq!(res, Err(Error::MoveKeysConflict));
        assert!(enabled.try_set_enabled(snap_uid));
    }
}
