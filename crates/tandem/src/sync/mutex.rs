//! Dispatch-suppressing Mutex

use super::MutexGuard;
use crate::context::{self, ContextId};
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex as ParkingLotMutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a Mutex
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MutexId(u64);

static NEXT_MUTEX_ID: AtomicU64 = AtomicU64::new(1);

impl MutexId {
    fn next() -> Self {
        MutexId(NEXT_MUTEX_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Mutual exclusion lock that suppresses scheduler dispatch while held
///
/// Acquisition is always a genuine blocking wait, never routed to a
/// scheduler. The lock is not reentrant: locking it again from the thread that
/// holds it blocks forever.
pub struct Mutex<T: ?Sized> {
    id: MutexId,

    /// Context of the holding thread (None if unlocked)
    held_by: AtomicCell<Option<ContextId>>,

    inner: ParkingLotMutex<T>,
}

impl<T> Mutex<T> {
    /// Create an unlocked mutex protecting `value`
    pub fn new(value: T) -> Self {
        Self {
            id: MutexId::next(),
            held_by: AtomicCell::new(None),
            inner: ParkingLotMutex::new(value),
        }
    }

    /// Consume the mutex, returning the protected value
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Get the mutex ID
    pub fn id(&self) -> MutexId {
        self.id
    }

    /// Acquire the lock, blocking the thread while it is contended
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let guard = self.inner.lock();
        self.acquired(guard)
    }

    /// Acquire the lock only if it is free
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock().map(|guard| self.acquired(guard))
    }

    /// Run `f` with the lock held
    ///
    /// The lock is released and suppression restored even if `f` panics.
    pub fn synchronize<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    fn acquired<'a>(&'a self, guard: parking_lot::MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let ctx = context::current();
        let was_suppressed = ctx.acquire_suppression();
        self.held_by.store(Some(ctx.id()));
        log::trace!(
            "mutex {} locked on thread context {} (previously suppressed: {})",
            self.id.as_u64(),
            ctx.id().as_u64(),
            was_suppressed
        );
        MutexGuard::new(self, ctx, guard)
    }

    pub(super) fn released(&self) {
        self.held_by.store(None);
    }

    /// Context of the thread holding the lock
    pub fn held_by(&self) -> Option<ContextId> {
        self.held_by.load()
    }

    /// Check if the mutex is locked
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Mutable access without locking, through exclusive ownership
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("id", &self.id)
            .field("held_by", &self.held_by())
            .finish_non_exhaustive()
    }
}
