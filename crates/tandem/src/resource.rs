//! Readiness-pollable resources, event masks, and wait outcomes
//!
//! A [`Resource`] is a non-owning wrapper around a native descriptor. It never
//! closes the descriptor and carries no I/O semantics of its own; schedulers
//! use it as a hashable key for their bookkeeping.

use crate::dispatch;
use crate::error::Result;
use std::fmt;
use std::time::Duration;

/// Raw descriptor type wrapped by [`Resource`]
#[cfg(unix)]
pub type RawDescriptor = std::os::unix::io::RawFd;

/// Raw descriptor type wrapped by [`Resource`]
#[cfg(not(unix))]
pub type RawDescriptor = i64;

bitflags::bitflags! {
    /// Event mask for readiness waits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        /// Data can be read without blocking
        const READABLE = 0b001;
        /// Urgent/out-of-band data is available
        const PRIORITY = 0b010;
        /// Data can be written without blocking
        const WRITABLE = 0b100;
    }
}

/// Opaque, non-owning handle to a readiness-pollable descriptor
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    raw: RawDescriptor,
}

impl Resource {
    /// Wrap a raw descriptor without taking ownership
    pub fn from_raw_fd(raw: RawDescriptor) -> Self {
        Resource { raw }
    }

    /// Borrow the descriptor of any fd-backed value
    #[cfg(unix)]
    pub fn of<T: std::os::unix::io::AsRawFd + ?Sized>(value: &T) -> Self {
        Resource::from_raw_fd(value.as_raw_fd())
    }

    /// Get the wrapped descriptor
    pub fn raw(self) -> RawDescriptor {
        self.raw
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd:{}", self.raw)
    }
}

/// Outcome of a [`wait_any`](crate::dispatch::wait_any) call
///
/// A timeout is a regular outcome, not an error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// At least one requested event occurred
    Ready(Interest),
    /// The timeout elapsed before any requested event occurred
    TimedOut,
}

impl Readiness {
    /// Whether this outcome reports readiness
    pub fn is_ready(self) -> bool {
        matches!(self, Readiness::Ready(_))
    }

    /// The satisfied event set, empty on timeout
    pub fn events(self) -> Interest {
        match self {
            Readiness::Ready(events) => events,
            Readiness::TimedOut => Interest::empty(),
        }
    }
}

// Native fd adapters: wrap a raw descriptor and forward to the dispatcher.
// The caller keeps the descriptor open for the duration of the wait.

/// Wait until `fd` is readable
pub fn wait_fd_readable(fd: RawDescriptor) -> Result<()> {
    dispatch::wait_readable(&Resource::from_raw_fd(fd))
}

/// Wait until `fd` is writable
pub fn wait_fd_writable(fd: RawDescriptor) -> Result<()> {
    dispatch::wait_writable(&Resource::from_raw_fd(fd))
}

/// Wait for any of `interest` on `fd`, or until `timeout` elapses
pub fn wait_fd(
    fd: RawDescriptor,
    interest: Interest,
    timeout: Option<Duration>,
) -> Result<Readiness> {
    dispatch::wait_any(&Resource::from_raw_fd(fd), interest, timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    #[test]
    fn test_interest_bits() {
        assert_eq!(Interest::READABLE.bits(), 1);
        assert_eq!(Interest::PRIORITY.bits(), 2);
        assert_eq!(Interest::WRITABLE.bits(), 4);
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.contains(Interest::WRITABLE));
        assert!(!both.contains(Interest::PRIORITY));
    }

    #[test]
    fn test_resource_is_hashable_key() {
        let mut set = FxHashSet::default();
        set.insert(Resource::from_raw_fd(3));
        set.insert(Resource::from_raw_fd(3));
        set.insert(Resource::from_raw_fd(4));
        assert_eq!(set.len(), 2);
        assert_eq!(Resource::from_raw_fd(4).raw(), 4);
    }

    #[test]
    fn test_readiness_events() {
        assert!(Readiness::Ready(Interest::READABLE).is_ready());
        assert_eq!(Readiness::TimedOut.events(), Interest::empty());
        assert!(!Readiness::TimedOut.is_ready());
    }
}
