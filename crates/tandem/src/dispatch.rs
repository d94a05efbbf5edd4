//! Dispatcher that routes potentially-blocking operations
//!
//! Every operation here asks one question of the calling thread's context:
//! should the installed scheduler handle this call, or should the thread
//! really block? A hook is invoked iff
//!
//! 1. a scheduler is installed,
//! 2. dispatch is not suppressed (no `sync::Mutex` held, no blocking region open),
//! 3. the running fiber is non-blocking, and
//! 4. that fiber is not already inside a hook.
//!
//! Otherwise the real blocking equivalent from [`blocking`] runs on the
//! current thread.

use crate::blocking;
use crate::context::{self, ThreadContext};
use crate::error::{Error, Result};
use crate::fiber::Fiber;
use crate::resource::{Interest, Readiness, Resource};
use crate::scheduler::{self, Hook, Scheduler};
use std::sync::Arc;
use std::time::Duration;

/// Scheduler that should receive a hook call from `fiber`, if any
fn route(ctx: &ThreadContext, fiber: &Fiber, hook: Hook) -> Option<Arc<dyn Scheduler>> {
    if fiber.is_blocking() {
        return None;
    }
    if ctx.is_dispatch_suppressed() {
        log::trace!("{} from fiber {}: suppressed, blocking the thread", hook, fiber.id());
        return None;
    }
    if let Some(outer) = fiber.waiting_in() {
        log::trace!("{} from fiber {} inside {}: blocking the thread", hook, fiber.id(), outer);
        return None;
    }
    let scheduler = ctx.scheduler();
    if scheduler.is_some() {
        log::trace!("{} from fiber {}: dispatching to scheduler", hook, fiber.id());
    }
    scheduler
}

/// Invoke `hook` on the routed scheduler, or run `fallback`
fn dispatch<T>(
    hook: Hook,
    call: impl FnOnce(&dyn Scheduler) -> Result<T>,
    fallback: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let ctx = context::current();
    let fiber = ctx.current_fiber();
    match route(&ctx, &fiber, hook) {
        Some(scheduler) => {
            let _hook = ctx.enter_hook(&fiber, hook);
            call(scheduler.as_ref())
        }
        None => fallback(),
    }
}

/// Wait until `resource` is readable
pub fn wait_readable(resource: &Resource) -> Result<()> {
    dispatch(
        Hook::WaitReadable,
        |s| s.wait_readable(resource),
        || blocking::wait_readable(resource),
    )
}

/// Wait until `resource` is writable
pub fn wait_writable(resource: &Resource) -> Result<()> {
    dispatch(
        Hook::WaitWritable,
        |s| s.wait_writable(resource),
        || blocking::wait_writable(resource),
    )
}

/// Wait until any of `interest` occurs on `resource`, or `timeout` elapses
///
/// `None` waits indefinitely; `Some(Duration::ZERO)` reports current readiness
/// without waiting. Expiry yields [`Readiness::TimedOut`].
pub fn wait_any(
    resource: &Resource,
    interest: Interest,
    timeout: Option<Duration>,
) -> Result<Readiness> {
    dispatch(
        Hook::WaitAny,
        |s| s.wait_any(resource, interest, timeout),
        || blocking::wait_any(resource, interest, timeout),
    )
}

/// Sleep for at least `duration`, or until woken when `None`
///
/// Returns the time actually slept.
pub fn sleep(duration: Option<Duration>) -> Result<Duration> {
    dispatch(
        Hook::WaitSleep,
        |s| s.wait_sleep(duration),
        || blocking::sleep(duration),
    )
}

/// Announce a native call that blocks the OS thread regardless of scheduling
///
/// Must be paired with [`exit_blocking_region`]. Dispatch is suppressed until
/// the outermost region exits; the scheduler hears only about the outermost
/// region. The scheduler that receives the enter hook is the one that later
/// receives the exit hook, and it cannot be replaced while the region is open.
pub fn enter_blocking_region() -> Result<()> {
    let ctx = context::current();
    let fiber = ctx.current_fiber();
    let outermost = ctx.blocking_region_depth() == 0;
    let scheduler = if outermost {
        route(&ctx, &fiber, Hook::EnterBlockingRegion)
    } else {
        None
    };
    ctx.increment_region_depth();

    if let Some(scheduler) = scheduler {
        let _hook = ctx.enter_hook(&fiber, Hook::EnterBlockingRegion);
        if let Err(e) = scheduler.enter_blocking_region() {
            // The caller will not exit a region it failed to enter
            let _ = ctx.decrement_region_depth();
            return Err(e);
        }
        ctx.open_region(scheduler);
    }
    Ok(())
}

/// Close the region opened by the matching [`enter_blocking_region`]
///
/// The exit hook goes to the scheduler that heard the enter, and only if one
/// did, whatever the routing state is now. Fails with
/// [`Error::UnpairedBlockingRegion`] when no region is open.
pub fn exit_blocking_region() -> Result<()> {
    let ctx = context::current();
    let fiber = ctx.current_fiber();
    let depth = ctx.decrement_region_depth().map_err(|e| {
        log::warn!("unpaired exit_blocking_region on fiber {}", fiber.id());
        e
    })?;
    if depth > 0 {
        return Ok(());
    }
    match ctx.close_region() {
        Some(scheduler) => {
            log::trace!(
                "{} from fiber {}: closing notified region",
                Hook::ExitBlockingRegion,
                fiber.id()
            );
            let _hook = ctx.enter_hook(&fiber, Hook::ExitBlockingRegion);
            scheduler.exit_blocking_region()
        }
        None => Ok(()),
    }
}

/// Run `native` inside a blocking region
///
/// The region is exited even if `native` panics.
pub fn blocking_region<R>(native: impl FnOnce() -> R) -> Result<R> {
    struct ExitOnUnwind {
        armed: bool,
    }

    impl Drop for ExitOnUnwind {
        fn drop(&mut self) {
            if self.armed {
                if let Err(e) = exit_blocking_region() {
                    log::warn!("failed to exit blocking region while unwinding: {}", e);
                }
            }
        }
    }

    enter_blocking_region()?;
    let mut guard = ExitOnUnwind { armed: true };
    let value = native();
    guard.armed = false;
    exit_blocking_region()?;
    Ok(value)
}

/// Start `body` as a non-blocking fiber
///
/// The installed scheduler decides how (see [`Scheduler::fiber`]). Without a
/// scheduler the fiber is created and resumed immediately.
pub fn spawn<F>(body: F) -> Result<Fiber>
where
    F: FnOnce() + Send + 'static,
{
    let ctx = context::current();
    if ctx.is_finished() {
        return Err(Error::ContextFinished);
    }
    match ctx.scheduler() {
        Some(scheduler) => {
            let fiber = ctx.current_fiber();
            let _hook = ctx.enter_hook(&fiber, Hook::Fiber);
            scheduler.fiber(Box::new(body))
        }
        None => scheduler::start_nonblocking(Box::new(body)),
    }
}
