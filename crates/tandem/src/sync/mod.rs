//! Synchronization primitives aware of scheduler dispatch
//!
//! Holding a [`Mutex`] disables dispatcher routing for the holding thread, so
//! a fiber cannot be suspended by the scheduler while it owns the lock. Any
//! blocking operation performed under the lock blocks the whole thread.

mod guard;
mod mutex;

pub use guard::MutexGuard;
pub use mutex::{Mutex, MutexId};
