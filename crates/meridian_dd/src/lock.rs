//! The move-keys lock: a cluster-wide single-writer token for mutating
//! placement metadata. Taking it fences out any previous distributor;
//! every subsequent write transaction revalidates it, and a background
//! poller revalidates it even when the distributor is idle.

use std::sync::Arc;
use std::time::Duration;

use crate::enabled::DdEnabledState;
use crate::errors::{DdError, Result};
use crate::system_data::{decode_lock_owner, encode_lock_owner, MOVE_KEYS_LOCK_OWNER_KEY};
use crate::system_db::{SystemDb, SystemTxn};
use crate::Uid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MoveKeysLock {
    pub prev_owner: Uid,
    pub owner: Uid,
}

/// Transactionally replace the lock owner with `dd_id`, fencing out the
/// previous holder.
pub async fn take_move_keys_lock(db: &Arc<SystemDb>, dd_id: Uid) -> Result<MoveKeysLock> {
    loop {
        let mut tr = db.begin();
        let result = (|| {
            let prev_owner = match tr.get(MOVE_KEYS_LOCK_OWNER_KEY)? {
                Some(value) => decode_lock_owner(&value)?,
                None => Uid::default(),
            };
            tr.set(MOVE_KEYS_LOCK_OWNER_KEY, &encode_lock_owner(dd_id));
            Ok(prev_owner)
        })();
        match result.and_then(|prev_owner| tr.commit().map(|()| prev_owner)) {
            Ok(prev_owner) => {
                return Ok(MoveKeysLock {
                    prev_owner,
                    owner: dd_id,
                })
            }
            Err(err) => db.on_error(err).await?,
        }
    }
}

/// Fail with `movekeys_conflict` when the persisted owner no longer
/// matches `lock`, or when DD has been transiently disabled. Called inside
/// every transaction that reads or writes placement metadata.
pub fn check_move_keys_lock_read_only(
    tr: &SystemTxn<'_>,
    lock: &MoveKeysLock,
    enabled: &DdEnabledState,
) -> Result<()> {
    if !enabled.is_enabled() {
        return Err(DdError::MoveKeysConflict);
    }
    let owner = match tr.get(MOVE_KEYS_LOCK_OWNER_KEY)? {
        Some(value) => decode_lock_owner(&value)?,
        None => Uid::default(),
    };
    if owner != lock.owner {
        tracing::warn!(
            current_owner = %owner,
            lock_owner = %lock.owner,
            "move keys lock lost"
        );
        return Err(DdError::MoveKeysConflict);
    }
    Ok(())
}

/// Periodic background revalidation; a conflict terminates the owning
/// distributor's inner stack.
pub async fn poll_move_keys_lock(
    db: Arc<SystemDb>,
    lock: MoveKeysLock,
    enabled: Arc<DdEnabledState>,
    interval: Duration,
) -> Result<()> {
    loop {
        tokio::time::sleep(interval).await;
        loop {
            let tr = db.begin();
            match check_move_keys_lock_read_only(&tr, &lock, &enabled) {
                Ok(()) => break,
                Err(err) if err.is_retryable() => db.on_error(err).await?,
                Err(err) => return Err(err),
            }
        }
    }
}
