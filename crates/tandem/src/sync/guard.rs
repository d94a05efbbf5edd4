//! RAII guard for automatic mutex unlock

use super::Mutex;
use crate::context::ThreadContext;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// RAII guard for [`Mutex`] (auto-unlocks on drop)
///
/// Dropping the guard, including while unwinding, clears the holder and
/// lifts this guard's share of dispatch suppression before the lock itself
/// is released.
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    /// Context whose suppression this guard holds
    ctx: Arc<ThreadContext>,
    guard: parking_lot::MutexGuard<'a, T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub(super) fn new(
        mutex: &'a Mutex<T>,
        ctx: Arc<ThreadContext>,
        guard: parking_lot::MutexGuard<'a, T>,
    ) -> Self {
        Self { mutex, ctx, guard }
    }

    /// The mutex this guard holds
    pub fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.released();
        self.ctx.release_suppression();
        log::trace!(
            "mutex {} unlocked on thread context {}",
            self.mutex.id().as_u64(),
            self.ctx.id().as_u64()
        );
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.guard, f)
    }
}
