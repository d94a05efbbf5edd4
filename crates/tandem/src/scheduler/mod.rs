//! Scheduler capability interface
//!
//! A scheduler virtualizes the blocking operations of non-blocking fibers on
//! one thread. Every hook has a default body equal to the real blocking
//! equivalent, so a partial implementation only overrides what it handles:
//!
//! | Hook | Default |
//! |---|---|
//! | `wait_readable` / `wait_writable` | block the thread until ready |
//! | `wait_any` | poll with the given timeout |
//! | `wait_sleep` | sleep the thread |
//! | `enter_blocking_region` / `exit_blocking_region` | nothing |
//! | `fiber` | create a non-blocking fiber and resume it immediately |
//! | `run` | nothing |
//!
//! Wrapping one scheduler in another is done with [`Layer`] / [`Layered`].

mod instrument;
mod layer;

pub use instrument::{HookStats, Instrument, Instrumented};
pub use layer::{ForwardGuard, Layer, Layered};

use crate::blocking;
use crate::error::Result;
use crate::fiber::{Fiber, FiberBody};
use crate::resource::{Interest, Readiness, Resource};
use std::fmt;
use std::time::Duration;

/// Identity of a scheduler hook
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Hook {
    /// `wait_readable(resource)`
    WaitReadable,
    /// `wait_writable(resource)`
    WaitWritable,
    /// `wait_any(resource, interest, timeout)`
    WaitAny,
    /// `wait_sleep(duration)`
    WaitSleep,
    /// `enter_blocking_region()`
    EnterBlockingRegion,
    /// `exit_blocking_region()`
    ExitBlockingRegion,
    /// `fiber(body)`
    Fiber,
    /// `run()`
    Run,
}

impl Hook {
    /// Every hook, in interface order
    pub const ALL: [Hook; 8] = [
        Hook::WaitReadable,
        Hook::WaitWritable,
        Hook::WaitAny,
        Hook::WaitSleep,
        Hook::EnterBlockingRegion,
        Hook::ExitBlockingRegion,
        Hook::Fiber,
        Hook::Run,
    ];

    /// Hook name as it appears in the interface
    pub fn name(self) -> &'static str {
        match self {
            Hook::WaitReadable => "wait_readable",
            Hook::WaitWritable => "wait_writable",
            Hook::WaitAny => "wait_any",
            Hook::WaitSleep => "wait_sleep",
            Hook::EnterBlockingRegion => "enter_blocking_region",
            Hook::ExitBlockingRegion => "exit_blocking_region",
            Hook::Fiber => "fiber",
            Hook::Run => "run",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-thread policy object receiving the blocking operations of non-blocking fibers
///
/// Hooks run on the calling fiber. A hook that needs to wait suspends that
/// fiber (typically with [`fiber::suspend`](crate::fiber::suspend) after
/// registering it with an event loop) and returns once the loop resumes it.
/// Calls to the dispatcher made from inside a hook take the real blocking
/// path, so a hook cannot re-enter itself through the dispatcher.
pub trait Scheduler: Send + Sync {
    /// Suspend until `resource` is readable
    ///
    /// Fails with `Error::InvalidResource` if the resource is invalidated.
    fn wait_readable(&self, resource: &Resource) -> Result<()> {
        blocking::wait_readable(resource)
    }

    /// Suspend until `resource` is writable
    fn wait_writable(&self, resource: &Resource) -> Result<()> {
        blocking::wait_writable(resource)
    }

    /// Suspend until any of `interest` occurs or `timeout` elapses
    ///
    /// `None` waits indefinitely; a zero timeout must answer without
    /// suspending. Returns the satisfied events or [`Readiness::TimedOut`].
    fn wait_any(
        &self,
        resource: &Resource,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> Result<Readiness> {
        blocking::wait_any(resource, interest, timeout)
    }

    /// Suspend for at least `duration`, or until woken when `None`
    ///
    /// Returns the time actually spent suspended.
    fn wait_sleep(&self, duration: Option<Duration>) -> Result<Duration> {
        blocking::sleep(duration)
    }

    /// The thread is about to enter a native call that blocks regardless
    fn enter_blocking_region(&self) -> Result<()> {
        Ok(())
    }

    /// The native blocking call announced by `enter_blocking_region` returned
    fn exit_blocking_region(&self) -> Result<()> {
        Ok(())
    }

    /// Start `body` as a non-blocking fiber
    ///
    /// The scheduler decides whether to start it immediately or defer it, and
    /// whether to use `resume` or `transfer`.
    fn fiber(&self, body: FiberBody) -> Result<Fiber> {
        start_nonblocking(body)
    }

    /// Drive the event loop until no non-blocking fiber is pending
    ///
    /// Invoked at most once per thread, from the root fiber, by
    /// [`ThreadContext::finish`](crate::context::ThreadContext::finish).
    fn run(&self) -> Result<()> {
        Ok(())
    }
}

/// Create a non-blocking fiber and resume it immediately (asymmetric start)
pub fn start_nonblocking(body: FiberBody) -> Result<Fiber> {
    let fiber = Fiber::builder().blocking(false).build_boxed(body);
    fiber.resume()?;
    Ok(fiber)
}
