//! Process-wide reader/writer coordination over the shared connection.
//!
//! Locks are owned by threads. A thread may re-acquire a lock it already
//! holds, may take a shared lock while holding the exclusive one, and may
//! upgrade to exclusive when it is the only reader. Any other conflicting
//! request blocks until the holders release, or until the caller's
//! [`CancelToken`] fires.
//!
//! Two readers that both try to upgrade will wait on each other; cancel one
//! of them to break the cycle.

use super::sqlite::acquire_lock;
use crate::{Error, Result};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Interval at which a blocked acquisition re-checks its cancel token.
const CANCEL_POLL: Duration = Duration::from_millis(25);

/// The two lock kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Many holders at once.
    Shared,
    /// One holder, excluding everyone else.
    Exclusive,
}

impl LockKind {
    const fn label(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
        }
    }
}

/// Cancels a blocked lock wait from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token that has not fired.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the token. Waiters observe it within one poll interval.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Re-arms the token.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct LockState {
    shared: HashMap<ThreadId, usize>,
    exclusive: Option<(ThreadId, usize)>,
}

impl LockState {
    fn can_grant(&self, me: ThreadId, kind: LockKind) -> bool {
        let exclusive_free = self.exclusive.is_none_or(|(owner, _)| owner == me);
        match kind {
            LockKind::Shared => exclusive_free,
            LockKind::Exclusive => exclusive_free && self.shared.keys().all(|t| *t == me),
        }
    }

    fn grant(&mut self, me: ThreadId, kind: LockKind) {
        match kind {
            LockKind::Shared => *self.shared.entry(me).or_default() += 1,
            LockKind::Exclusive => match &mut self.exclusive {
                Some((_, depth)) => *depth += 1,
                None => self.exclusive = Some((me, 1)),
            },
        }
    }

    fn release(&mut self, me: ThreadId, kind: LockKind) {
        match kind {
            LockKind::Shared => {
                if let Some(depth) = self.shared.get_mut(&me) {
                    *depth -= 1;
                    if *depth == 0 {
                        self.shared.remove(&me);
                    }
                }
            },
            LockKind::Exclusive => {
                if let Some((owner, depth)) = &mut self.exclusive {
                    if *owner == me {
                        *depth -= 1;
                        if *depth == 0 {
                            self.exclusive = None;
                        }
                    }
                }
            },
        }
    }
}

/// Reader/writer lock with per-thread re-entrancy.
#[derive(Debug, Default)]
pub struct Synchronizer {
    state: Mutex<LockState>,
    released: Condvar,
}

impl Synchronizer {
    /// Creates an unlocked synchronizer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until a shared lock is granted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires while waiting.
    pub fn acquire_shared(
        &self,
        operation: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<SyncGuard<'_>> {
        self.acquire(LockKind::Shared, operation, cancel)
    }

    /// Blocks until the exclusive lock is granted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires while waiting.
    pub fn acquire_exclusive(
        &self,
        operation: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<SyncGuard<'_>> {
        self.acquire(LockKind::Exclusive, operation, cancel)
    }

    fn acquire(
        &self,
        kind: LockKind,
        operation: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<SyncGuard<'_>> {
        let me = thread::current().id();
        let start = Instant::now();
        let mut state = acquire_lock(&self.state);

        while !state.can_grant(me, kind) {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                metrics::counter!("sync_lock_cancelled_total", "kind" => kind.label())
                    .increment(1);
                tracing::debug!(operation, kind = kind.label(), "lock wait cancelled");
                return Err(Error::Cancelled {
                    operation: operation.to_string(),
                });
            }
            state = match self.released.wait_timeout(state, CANCEL_POLL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        state.grant(me, kind);
        drop(state);

        metrics::histogram!("sync_lock_wait_ms", "kind" => kind.label())
            .record(start.elapsed().as_secs_f64() * 1000.0);

        Ok(SyncGuard {
            sync: self,
            kind,
            owner: me,
            _not_send: PhantomData,
        })
    }

    /// Returns true if the calling thread holds the exclusive lock.
    #[must_use]
    pub fn holds_exclusive(&self) -> bool {
        let me = thread::current().id();
        acquire_lock(&self.state)
            .exclusive
            .is_some_and(|(owner, _)| owner == me)
    }

    fn release(&self, owner: ThreadId, kind: LockKind) {
        acquire_lock(&self.state).release(owner, kind);
        self.released.notify_all();
    }
}

/// Scoped lock handle. Dropping it releases the lock.
///
/// Guards are tied to the thread that acquired them and cannot be sent
/// elsewhere.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SyncGuard<'a> {
    sync: &'a Synchronizer,
    kind: LockKind,
    owner: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl SyncGuard<'_> {
    /// The kind of lock this guard holds.
    #[must_use]
    pub const fn kind(&self) -> LockKind {
        self.kind
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.sync.release(self.owner, self.kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_shared_locks_coexist() {
        let sync = Synchronizer::new();
        let barrier = Barrier::new(3);
        let inside = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    let _guard = sync.acquire_shared("read", None).unwrap();
                    inside.fetch_add(1, Ordering::SeqCst);
                    // All three must be inside at once to pass the barrier.
                    barrier.wait();
                });
            }
        });

        assert_eq!(inside.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exclusive_excludes_writers() {
        let sync = Synchronizer::new();
        let active = AtomicUsize::new(0);
        let max_seen = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..20 {
                        let _guard = sync.acquire_exclusive("write", None).unwrap();
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_acquisition() {
        let sync = Synchronizer::new();
        let outer = sync.acquire_exclusive("outer", None).unwrap();
        let inner = sync.acquire_exclusive("inner", None).unwrap();
        let read = sync.acquire_shared("nested_read", None).unwrap();
        assert!(sync.holds_exclusive());
        drop(read);
        drop(inner);
        assert!(sync.holds_exclusive());
        drop(outer);
        assert!(!sync.holds_exclusive());
    }

    #[test]
    fn test_sole_reader_upgrades() {
        let sync = Synchronizer::new();
        let _read = sync.acquire_shared("read", None).unwrap();
        let write = sync.acquire_exclusive("write", None).unwrap();
        assert_eq!(write.kind(), LockKind::Exclusive);
    }

    #[test]
    fn test_cancelled_wait_holds_no_lock() {
        let sync = Synchronizer::new();
        let token = CancelToken::new();
        let writer = sync.acquire_exclusive("writer", None).unwrap();

        thread::scope(|s| {
            let waiter = s.spawn(|| sync.acquire_shared("reader", Some(&token)).map(|_| ()));
            thread::sleep(Duration::from_millis(60));
            token.cancel();
            let result = waiter.join().unwrap();
            assert!(matches!(result, Err(Error::Cancelled { ref operation }) if operation == "reader"));
        });

        drop(writer);
        let state = acquire_lock(&sync.state);
        assert!(state.shared.is_empty());
        assert!(state.exclusive.is_none());
    }

    #[test]
    fn test_writer_waits_for_reader() {
        let sync = Synchronizer::new();
        let released = AtomicBool::new(false);

        thread::scope(|s| {
            let reader = sync.acquire_shared("reader", None).unwrap();
            let handle = s.spawn(|| {
                let _guard = sync.acquire_exclusive("writer", None).unwrap();
                released.load(Ordering::SeqCst)
            });
            thread::sleep(Duration::from_millis(50));
            released.store(true, Ordering::SeqCst);
            drop(reader);
            assert!(handle.join().unwrap(), "writer entered before reader released");
        });
    }
}
