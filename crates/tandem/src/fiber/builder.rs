//! Fiber construction

use super::{Fiber, FiberBody};
use crate::context;
use crate::error::Result;
use std::sync::Arc;

/// Configures and creates fibers on the current thread
///
/// ```rust,ignore
/// let fiber = Fiber::builder()
///     .blocking(false)
///     .name("reader")
///     .build(|| { /* ... */ });
/// ```
#[derive(Debug, Clone)]
pub struct FiberBuilder {
    blocking: bool,
    name: Option<String>,
    stack_size: Option<usize>,
}

impl FiberBuilder {
    /// Blocking, unnamed, default stack size
    pub fn new() -> Self {
        Self {
            blocking: true,
            name: None,
            stack_size: None,
        }
    }

    /// Classify the fiber as blocking (`true`, the default) or non-blocking
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Name the fiber (also used for its carrier thread)
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Override the carrier stack size for this fiber
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Create the fiber in the `Created` state
    pub fn build<F>(self, body: F) -> Fiber
    where
        F: FnOnce() + Send + 'static,
    {
        self.build_boxed(Box::new(body))
    }

    /// Create the fiber from an already boxed body
    pub fn build_boxed(self, body: FiberBody) -> Fiber {
        let ctx = context::current();
        let stack_size = self.stack_size.or(ctx.config().fiber_stack_size);
        let fiber = Fiber::with_inner(
            Arc::downgrade(&ctx),
            false,
            self.blocking,
            self.name,
            stack_size,
            Some(body),
        );
        ctx.register_fiber(&fiber);
        log::trace!(
            "created {} fiber {}",
            if fiber.is_blocking() { "blocking" } else { "non-blocking" },
            fiber.id()
        );
        fiber
    }

    /// Create the fiber and resume it immediately
    pub fn spawn<F>(self, body: F) -> Result<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let fiber = self.build(body);
        fiber.resume()?;
        Ok(fiber)
    }
}

impl Default for FiberBuilder {
    fn default() -> Self {
        Self::new()
    }
}
