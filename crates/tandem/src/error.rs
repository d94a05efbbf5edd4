//! Error types for dispatch, registration, and layering

use crate::fiber::FiberError;
use crate::resource::Resource;

/// Errors reported by the dispatcher, the thread context, and scheduler hooks
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `exit_blocking_region` without a matching `enter_blocking_region`
    #[error("exit_blocking_region called without a matching enter_blocking_region")]
    UnpairedBlockingRegion,

    /// Scheduler replacement attempted while hook calls are still suspended
    #[error("cannot replace the scheduler while {0} hook call(s) are in flight")]
    SchedulerBusy(usize),

    /// Forwarding through wrapped schedulers exceeded the configured depth
    #[error("scheduler forwarding exceeded {limit} layers (cyclic layering?)")]
    ForwardingTooDeep {
        /// Configured maximum depth
        limit: usize,
    },

    /// The awaited resource was closed or otherwise invalidated
    #[error("resource {0} was invalidated while waiting")]
    InvalidResource(Resource),

    /// A configuration was supplied after the thread's context was created
    #[error("thread context is already initialized")]
    AlreadyInitialized,

    /// The thread already ran its scheduler's `run()` and is shutting down
    #[error("thread context has already finished")]
    ContextFinished,

    /// Operation is not available on this platform
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Failure raised by a scheduler implementation
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Fiber control-transfer error or a failed fiber body
    #[error(transparent)]
    Fiber(#[from] FiberError),

    /// OS error from a real blocking operation
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a scheduler-defined error from any displayable value
    pub fn scheduler(msg: impl std::fmt::Display) -> Self {
        Error::Scheduler(msg.to_string())
    }

    /// Whether this error reports a failed fiber body
    pub fn is_fiber_panic(&self) -> bool {
        matches!(self, Error::Fiber(FiberError::Panicked(_)))
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
