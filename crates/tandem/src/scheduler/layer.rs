//! Layered scheduler composition
//!
//! A [`Layer`] sees every hook together with the scheduler it wraps. Hooks it
//! does not override are forwarded verbatim, so the caller suspends and
//! resumes exactly as it would with the inner scheduler alone.
//!
//! The "wraps" relation must be acyclic. Building a cycle (possible only
//! through late-bound inner schedulers) is a caller error; forwarding is
//! bounded per fiber by `Config::max_forward_depth` and fails with
//! `Error::ForwardingTooDeep` instead of recursing without end.

use super::Scheduler;
use crate::context;
use crate::error::{Error, Result};
use crate::fiber::{Fiber, FiberBody};
use crate::resource::{Interest, Readiness, Resource};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Behavior added around a wrapped scheduler
///
/// Every method receives the wrapped scheduler as `inner`; the defaults
/// forward to it unchanged.
pub trait Layer: Send + Sync {
    /// See [`Scheduler::wait_readable`]
    fn wait_readable(&self, inner: &dyn Scheduler, resource: &Resource) -> Result<()> {
        inner.wait_readable(resource)
    }

    /// See [`Scheduler::wait_writable`]
    fn wait_writable(&self, inner: &dyn Scheduler, resource: &Resource) -> Result<()> {
        inner.wait_writable(resource)
    }

    /// See [`Scheduler::wait_any`]
    fn wait_any(
        &self,
        inner: &dyn Scheduler,
        resource: &Resource,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> Result<Readiness> {
        inner.wait_any(resource, interest, timeout)
    }

    /// See [`Scheduler::wait_sleep`]
    fn wait_sleep(&self, inner: &dyn Scheduler, duration: Option<Duration>) -> Result<Duration> {
        inner.wait_sleep(duration)
    }

    /// See [`Scheduler::enter_blocking_region`]
    fn enter_blocking_region(&self, inner: &dyn Scheduler) -> Result<()> {
        inner.enter_blocking_region()
    }

    /// See [`Scheduler::exit_blocking_region`]
    fn exit_blocking_region(&self, inner: &dyn Scheduler) -> Result<()> {
        inner.exit_blocking_region()
    }

    /// See [`Scheduler::fiber`]
    fn fiber(&self, inner: &dyn Scheduler, body: FiberBody) -> Result<Fiber> {
        inner.fiber(body)
    }

    /// See [`Scheduler::run`]
    fn run(&self, inner: &dyn Scheduler) -> Result<()> {
        inner.run()
    }
}

/// A scheduler made of a [`Layer`] wrapped around an inner scheduler
pub struct Layered<L> {
    layer: L,
    inner: Arc<dyn Scheduler>,
}

impl<L: Layer> Layered<L> {
    /// Wrap `inner` with `layer`
    pub fn new(layer: L, inner: Arc<dyn Scheduler>) -> Self {
        Self { layer, inner }
    }

    /// The wrapping layer
    pub fn layer(&self) -> &L {
        &self.layer
    }

    /// The wrapped scheduler
    pub fn inner(&self) -> &Arc<dyn Scheduler> {
        &self.inner
    }
}

impl<L: Layer> Scheduler for Layered<L> {
    fn wait_readable(&self, resource: &Resource) -> Result<()> {
        let _depth = ForwardGuard::enter()?;
        self.layer.wait_readable(self.inner.as_ref(), resource)
    }

    fn wait_writable(&self, resource: &Resource) -> Result<()> {
        let _depth = ForwardGuard::enter()?;
        self.layer.wait_writable(self.inner.as_ref(), resource)
    }

    fn wait_any(
        &self,
        resource: &Resource,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> Result<Readiness> {
        let _depth = ForwardGuard::enter()?;
        self.layer
            .wait_any(self.inner.as_ref(), resource, interest, timeout)
    }

    fn wait_sleep(&self, duration: Option<Duration>) -> Result<Duration> {
        let _depth = ForwardGuard::enter()?;
        self.layer.wait_sleep(self.inner.as_ref(), duration)
    }

    fn enter_blocking_region(&self) -> Result<()> {
        let _depth = ForwardGuard::enter()?;
        self.layer.enter_blocking_region(self.inner.as_ref())
    }

    fn exit_blocking_region(&self) -> Result<()> {
        let _depth = ForwardGuard::enter()?;
        self.layer.exit_blocking_region(self.inner.as_ref())
    }

    fn fiber(&self, body: FiberBody) -> Result<Fiber> {
        let _depth = ForwardGuard::enter()?;
        self.layer.fiber(self.inner.as_ref(), body)
    }

    fn run(&self) -> Result<()> {
        let _depth = ForwardGuard::enter()?;
        self.layer.run(self.inner.as_ref())
    }
}

/// Counts one level of forwarding for the current fiber
///
/// Hand-written forwarding schedulers should hold one of these across each
/// forwarded call so cyclic layering fails instead of overflowing the stack.
pub struct ForwardGuard {
    fiber: Fiber,
}

impl ForwardGuard {
    /// Enter one forwarding level, failing past `Config::max_forward_depth`
    pub fn enter() -> Result<Self> {
        let ctx = context::current();
        let fiber = ctx.current_fiber();
        let limit = ctx.config().max_forward_depth;
        let depth = fiber.forward_depth().fetch_add(1, Ordering::AcqRel) + 1;
        if depth > limit {
            fiber.forward_depth().fetch_sub(1, Ordering::AcqRel);
            log::error!(
                "fiber {} exceeded {} levels of scheduler forwarding",
                fiber.id(),
                limit
            );
            return Err(Error::ForwardingTooDeep { limit });
        }
        Ok(Self { fiber })
    }

    /// Forwarding depth of the current fiber, this level included
    pub fn depth(&self) -> usize {
        self.fiber.forward_depth().load(Ordering::Acquire)
    }
}

impl Drop for ForwardGuard {
    fn drop(&mut self) {
        self.fiber.forward_depth().fetch_sub(1, Ordering::AcqRel);
    }
}
