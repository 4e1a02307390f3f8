//! Block lock manager
//!
//! Per-block reader/writer locks held by sessions. Every acquisition gets its
//! own lock id, which is what the holder later presents to read or unlock.
//! A session may take the same mode on a block more than once; asking for the
//! other mode while holding one would deadlock and fails immediately.
//!
//! The lock table is striped by block id. Each stripe has one mutex over its
//! blocks and one condvar that waiters park on until a release or their
//! deadline.

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use stratus_common::{BlockId, Error, LockId, LockMode, Result, SessionId};
use tracing::{debug, warn};

const LOCK_STRIPES: usize = 64;

/// A granted lock
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRecord {
    pub lock_id: LockId,
    pub block_id: BlockId,
    pub session_id: SessionId,
    pub mode: LockMode,
}

#[derive(Debug, Default)]
struct BlockLockState {
    /// Read holds per session
    readers: HashMap<SessionId, usize>,
    /// Write holder and its hold count
    writer: Option<(SessionId, usize)>,
    lock_ids: HashSet<LockId>,
}

impl BlockLockState {
    fn is_free(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none()
    }

    /// Grant `mode` to `session` if compatible with the current holders
    fn try_acquire(&mut self, block_id: BlockId, session_id: SessionId, mode: LockMode) -> Result<bool> {
        match mode {
            LockMode::Read => {
                if let Some((writer, _)) = self.writer {
                    if writer == session_id {
                        return Err(Error::invalid_state(format!(
                            "session {session_id} holds a WRITE lock on block {block_id} and asked for READ"
                        )));
                    }
                    return Ok(false);
                }
                *self.readers.entry(session_id).or_insert(0) += 1;
                Ok(true)
            }
            LockMode::Write => {
                if let Some((writer, count)) = self.writer.as_mut() {
                    if *writer == session_id {
                        *count += 1;
                        return Ok(true);
                    }
                    return Ok(false);
                }
                if self.readers.contains_key(&session_id) {
                    return Err(Error::invalid_state(format!(
                        "session {session_id} holds a READ lock on block {block_id} and asked for WRITE"
                    )));
                }
                if !self.readers.is_empty() {
                    return Ok(false);
                }
                self.writer = Some((session_id, 1));
                Ok(true)
            }
        }
    }

    fn release(&mut self, record: &LockRecord) {
        self.lock_ids.remove(&record.lock_id);
        match record.mode {
            LockMode::Read => {
                if let Some(count) = self.readers.get_mut(&record.session_id) {
                    *count -= 1;
                    if *count == 0 {
                        self.readers.remove(&record.session_id);
                    }
                }
            }
            LockMode::Write => {
                if let Some((_, count)) = self.writer.as_mut() {
                    *count -= 1;
                    if *count == 0 {
                        self.writer = None;
                    }
                }
            }
        }
    }
}

#[derive(Default)]
struct LockStripe {
    blocks: Mutex<HashMap<BlockId, BlockLockState>>,
    released: Condvar,
}

/// Reader/writer locks on blocks, owned by sessions
pub struct BlockLockManager {
    stripes: Vec<LockStripe>,
    locks: DashMap<LockId, LockRecord>,
    session_locks: DashMap<SessionId, HashSet<LockId>>,
    next_lock_id: AtomicU64,
    default_timeout: Duration,
}

impl BlockLockManager {
    /// Create a lock manager whose `lock` waits at most `default_timeout`
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| LockStripe::default()).collect(),
            locks: DashMap::new(),
            session_locks: DashMap::new(),
            next_lock_id: AtomicU64::new(1),
            default_timeout,
        }
    }

    fn stripe(&self, block_id: BlockId) -> &LockStripe {
        &self.stripes[(block_id.as_u64() % LOCK_STRIPES as u64) as usize]
    }

    /// Called with the stripe mutex held so the record and the holder count
    /// appear together
    fn register(&self, state: &mut BlockLockState, block_id: BlockId, session_id: SessionId, mode: LockMode) -> LockId {
        let lock_id = LockId::new(self.next_lock_id.fetch_add(1, Ordering::Relaxed));
        state.lock_ids.insert(lock_id);
        self.locks.insert(
            lock_id,
            LockRecord {
                lock_id,
                block_id,
                session_id,
                mode,
            },
        );
        self.session_locks.entry(session_id).or_default().insert(lock_id);
        lock_id
    }

    fn forget_session_lock(&self, session_id: SessionId, lock_id: LockId) {
        if let Some(mut ids) = self.session_locks.get_mut(&session_id) {
            ids.remove(&lock_id);
        }
        self.session_locks.remove_if(&session_id, |_, ids| ids.is_empty());
    }

    /// Lock a block, waiting up to the default timeout
    pub fn lock(&self, block_id: BlockId, session_id: SessionId, mode: LockMode) -> Result<LockId> {
        self.lock_with_timeout(block_id, session_id, mode, self.default_timeout)
    }

    /// Lock a block, waiting up to `timeout` for conflicting holders to leave
    pub fn lock_with_timeout(
        &self,
        block_id: BlockId,
        session_id: SessionId,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<LockId> {
        let deadline = Instant::now() + timeout;
        let stripe = self.stripe(block_id);
        let mut blocks = stripe.blocks.lock();

        loop {
            let state = blocks.entry(block_id).or_default();
            match state.try_acquire(block_id, session_id, mode) {
                Ok(true) => {
                    let lock_id = self.register(state, block_id, session_id, mode);
                    debug!("Session {} locked block {} for {} ({})", session_id, block_id, mode, lock_id);
                    return Ok(lock_id);
                }
                Ok(false) => {}
                Err(e) => {
                    if state.is_free() {
                        blocks.remove(&block_id);
                    }
                    return Err(e);
                }
            }

            if Instant::now() >= deadline || stripe.released.wait_until(&mut blocks, deadline).timed_out() {
                // One last look: a release may have raced with the deadline
                let state = blocks.entry(block_id).or_default();
                if state.try_acquire(block_id, session_id, mode)? {
                    return Ok(self.register(state, block_id, session_id, mode));
                }
                warn!(
                    "Session {} timed out after {:?} waiting for {} lock on block {}",
                    session_id, timeout, mode, block_id
                );
                return Err(Error::Timeout(timeout));
            }
        }
    }

    /// Lock a block only if it can be granted right away
    pub fn try_lock(&self, block_id: BlockId, session_id: SessionId, mode: LockMode) -> Result<LockId> {
        let mut blocks = self.stripe(block_id).blocks.lock();
        let state = blocks.entry(block_id).or_default();
        match state.try_acquire(block_id, session_id, mode) {
            Ok(true) => Ok(self.register(state, block_id, session_id, mode)),
            Ok(false) => Err(Error::BlockInUse { block_id }),
            Err(e) => {
                if state.is_free() {
                    blocks.remove(&block_id);
                }
                Err(e)
            }
        }
    }

    /// Take the WRITE lock on a block for the evictor
    ///
    /// With `revoke_readers`, read leases are cancelled instead of blocking
    /// eviction; their holders get `LockNotFound` on their next use of the
    /// lock id. Blocks with a writer are never taken, whichever session
    /// holds it, so two evictions can never share a victim.
    pub fn try_lock_for_eviction(&self, block_id: BlockId, revoke_readers: bool) -> Option<LockId> {
        let session_id = SessionId::EVICTOR;
        let mut blocks = self.stripe(block_id).blocks.lock();
        let state = blocks.entry(block_id).or_default();

        if state.writer.is_some() {
            return None;
        }
        if !state.readers.is_empty() && revoke_readers {
            let revoked: Vec<_> = state.lock_ids.drain().collect();
            for lock_id in revoked {
                if let Some((_, record)) = self.locks.remove(&lock_id) {
                    self.forget_session_lock(record.session_id, lock_id);
                    warn!(
                        "Revoked READ lock {} of session {} on block {} for eviction",
                        lock_id, record.session_id, block_id
                    );
                }
            }
            state.readers.clear();
        }

        match state.try_acquire(block_id, session_id, LockMode::Write) {
            Ok(true) => Some(self.register(state, block_id, session_id, LockMode::Write)),
            _ => {
                if state.is_free() {
                    blocks.remove(&block_id);
                }
                None
            }
        }
    }

    /// Release a lock
    pub fn unlock(&self, lock_id: LockId) -> Result<()> {
        let (_, record) = self.locks.remove(&lock_id).ok_or(Error::LockNotFound(lock_id))?;
        self.forget_session_lock(record.session_id, lock_id);

        let stripe = self.stripe(record.block_id);
        let mut blocks = stripe.blocks.lock();
        if let Some(state) = blocks.get_mut(&record.block_id) {
            state.release(&record);
            if state.is_free() {
                blocks.remove(&record.block_id);
            }
        }
        drop(blocks);
        stripe.released.notify_all();

        debug!(
            "Session {} unlocked block {} ({})",
            record.session_id, record.block_id, lock_id
        );
        Ok(())
    }

    /// Check that `lock_id` is held by `session_id` on `block_id`
    pub fn validate_lock(&self, session_id: SessionId, block_id: BlockId, lock_id: LockId) -> Result<LockRecord> {
        let record = self
            .locks
            .get(&lock_id)
            .map(|r| r.value().clone())
            .ok_or(Error::LockNotFound(lock_id))?;
        if record.session_id != session_id || record.block_id != block_id {
            return Err(Error::InvalidLock {
                lock_id,
                session_id,
                block_id,
            });
        }
        Ok(record)
    }

    #[must_use]
    pub fn lock_record(&self, lock_id: LockId) -> Option<LockRecord> {
        self.locks.get(&lock_id).map(|r| r.value().clone())
    }

    /// Whether any session holds a lock on the block
    #[must_use]
    pub fn is_locked(&self, block_id: BlockId) -> bool {
        self.stripe(block_id)
            .blocks
            .lock()
            .get(&block_id)
            .is_some_and(|state| !state.is_free())
    }

    #[must_use]
    pub fn has_writer(&self, block_id: BlockId) -> bool {
        self.stripe(block_id)
            .blocks
            .lock()
            .get(&block_id)
            .is_some_and(|state| state.writer.is_some())
    }

    /// Lock ids currently held by a session
    #[must_use]
    pub fn session_locks(&self, session_id: SessionId) -> Vec<LockId> {
        let mut ids: Vec<_> = self
            .session_locks
            .get(&session_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Release every lock of a session, returning how many were released
    pub fn cleanup_session(&self, session_id: SessionId) -> usize {
        let Some((_, ids)) = self.session_locks.remove(&session_id) else {
            return 0;
        };
        let released = ids
            .into_iter()
            .filter(|lock_id| self.unlock(*lock_id).is_ok())
            .count();
        if released > 0 {
            debug!("Released {} locks of session {}", released, session_id);
        }
        released
    }

    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    const BLOCK: BlockId = BlockId::new(1);

    fn manager() -> BlockLockManager {
        BlockLockManager::new(Duration::from_millis(100))
    }

    #[test]
    fn test_shared_readers() {
        let locks = manager();
        let a = locks.lock(BLOCK, SessionId::new(1), LockMode::Read).unwrap();
        let b = locks.lock(BLOCK, SessionId::new(2), LockMode::Read).unwrap();
        assert_ne!(a, b);
        assert!(matches!(
            locks.try_lock(BLOCK, SessionId::new(3), LockMode::Write),
            Err(Error::BlockInUse { .. })
        ));

        locks.unlock(a).unwrap();
        locks.unlock(b).unwrap();
        assert!(!locks.is_locked(BLOCK));
        locks.try_lock(BLOCK, SessionId::new(3), LockMode::Write).unwrap();
        assert!(locks.has_writer(BLOCK));
    }

    #[test]
    fn test_writer_excludes_readers() {
        let locks = manager();
        let w = locks.lock(BLOCK, SessionId::new(1), LockMode::Write).unwrap();

        let err = locks.lock(BLOCK, SessionId::new(2), LockMode::Read).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.is_retryable());

        locks.unlock(w).unwrap();
        locks.lock(BLOCK, SessionId::new(2), LockMode::Read).unwrap();
    }

    #[test]
    fn test_reentrant_same_mode() {
        let locks = manager();
        let session = SessionId::new(1);
        let first = locks.lock(BLOCK, session, LockMode::Write).unwrap();
        let second = locks.lock(BLOCK, session, LockMode::Write).unwrap();
        assert_eq!(locks.session_locks(session), vec![first, second]);

        locks.unlock(first).unwrap();
        assert!(locks.has_writer(BLOCK));
        locks.unlock(second).unwrap();
        assert!(!locks.is_locked(BLOCK));
    }

    #[test]
    fn test_cross_mode_self_request_fails_fast() {
        let locks = BlockLockManager::new(Duration::from_secs(30));
        let session = SessionId::new(1);

        let read = locks.lock(BLOCK, session, LockMode::Read).unwrap();
        let start = Instant::now();
        assert!(matches!(
            locks.lock(BLOCK, session, LockMode::Write),
            Err(Error::InvalidState(_))
        ));
        assert!(start.elapsed() < Duration::from_secs(1));
        locks.unlock(read).unwrap();

        let write = locks.lock(BLOCK, session, LockMode::Write).unwrap();
        assert!(matches!(
            locks.try_lock(BLOCK, session, LockMode::Read),
            Err(Error::InvalidState(_))
        ));
        locks.unlock(write).unwrap();
    }

    #[test]
    fn test_unlock_unknown() {
        let locks = manager();
        let id = locks.lock(BLOCK, SessionId::new(1), LockMode::Read).unwrap();
        locks.unlock(id).unwrap();
        assert!(matches!(locks.unlock(id), Err(Error::LockNotFound(_))));
    }

    #[test]
    fn test_validate_lock() {
        let locks = manager();
        let id = locks.lock(BLOCK, SessionId::new(1), LockMode::Read).unwrap();

        let record = locks.validate_lock(SessionId::new(1), BLOCK, id).unwrap();
        assert_eq!(record.mode, LockMode::Read);
        assert!(matches!(
            locks.validate_lock(SessionId::new(2), BLOCK, id),
            Err(Error::InvalidLock { .. })
        ));
        assert!(matches!(
            locks.validate_lock(SessionId::new(1), BlockId::new(2), id),
            Err(Error::InvalidLock { .. })
        ));
        assert!(matches!(
            locks.validate_lock(SessionId::new(1), BLOCK, LockId::new(999)),
            Err(Error::LockNotFound(_))
        ));
    }

    #[test]
    fn test_cleanup_session() {
        let locks = manager();
        let session = SessionId::new(7);
        locks.lock(BlockId::new(1), session, LockMode::Read).unwrap();
        locks.lock(BlockId::new(2), session, LockMode::Write).unwrap();
        locks.lock(BlockId::new(3), SessionId::new(8), LockMode::Read).unwrap();

        assert_eq!(locks.cleanup_session(session), 2);
        assert_eq!(locks.cleanup_session(session), 0);
        assert!(!locks.is_locked(BlockId::new(2)));
        assert!(locks.is_locked(BlockId::new(3)));
        assert_eq!(locks.lock_count(), 1);
    }

    #[test]
    fn test_eviction_lock() {
        let locks = manager();
        let reader = locks.lock(BLOCK, SessionId::new(1), LockMode::Read).unwrap();

        assert!(locks.try_lock_for_eviction(BLOCK, false).is_none());
        assert!(locks.is_locked(BLOCK));

        let evict = locks.try_lock_for_eviction(BLOCK, true).unwrap();
        assert!(matches!(
            locks.validate_lock(SessionId::new(1), BLOCK, reader),
            Err(Error::LockNotFound(_))
        ));
        assert!(locks.session_locks(SessionId::new(1)).is_empty());

        // Writers are never revoked
        assert!(locks.try_lock_for_eviction(BLOCK, true).is_none());
        locks.unlock(evict).unwrap();
        assert!(!locks.is_locked(BLOCK));
    }

    #[test]
    fn test_eviction_lease_is_exclusive() {
        let locks = manager();
        let first = locks.try_lock_for_eviction(BLOCK, false).unwrap();
        assert!(locks.try_lock_for_eviction(BLOCK, false).is_none());
        assert!(locks.try_lock_for_eviction(BLOCK, true).is_none());
        assert_eq!(locks.lock_count(), 1);

        locks.unlock(first).unwrap();
        let second = locks.try_lock_for_eviction(BLOCK, false).unwrap();
        locks.unlock(second).unwrap();
        assert!(!locks.is_locked(BLOCK));
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let locks = Arc::new(BlockLockManager::new(Duration::from_secs(5)));
        let w = locks.lock(BLOCK, SessionId::new(1), LockMode::Write).unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || locks.lock(BLOCK, SessionId::new(2), LockMode::Write))
        };
        thread::sleep(Duration::from_millis(50));
        locks.unlock(w).unwrap();

        let id = waiter.join().unwrap().unwrap();
        assert_eq!(locks.lock_record(id).unwrap().session_id, SessionId::new(2));
    }

    #[test]
    fn test_mutual_exclusion() {
        let locks = Arc::new(BlockLockManager::new(Duration::from_secs(10)));
        let writers = Arc::new(AtomicUsize::new(0));
        let readers = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let locks = Arc::clone(&locks);
                let writers = Arc::clone(&writers);
                let readers = Arc::clone(&readers);
                thread::spawn(move || {
                    let session = SessionId::new(t);
                    for i in 0..50 {
                        let mode = if (t + i) % 3 == 0 { LockMode::Write } else { LockMode::Read };
                        let id = locks.lock(BLOCK, session, mode).unwrap();
                        match mode {
                            LockMode::Write => {
                                assert_eq!(writers.fetch_add(1, Ordering::SeqCst), 0);
                                assert_eq!(readers.load(Ordering::SeqCst), 0);
                                writers.fetch_sub(1, Ordering::SeqCst);
                            }
                            LockMode::Read => {
                                readers.fetch_add(1, Ordering::SeqCst);
                                assert_eq!(writers.load(Ordering::SeqCst), 0);
                                readers.fetch_sub(1, Ordering::SeqCst);
                            }
                        }
                        locks.unlock(id).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!locks.is_locked(BLOCK));
        assert_eq!(locks.lock_count(), 0);
    }
}
