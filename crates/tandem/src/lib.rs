//! Tandem: cooperative scheduling hooks for fibers
//!
//! This crate intercepts potentially-blocking operations and routes them to a
//! pluggable per-thread scheduler:
//! - Fibers, classified blocking or non-blocking at creation
//! - Per-thread context (installed scheduler, running fiber, suppression state)
//! - Scheduler capability interface with real-blocking fallbacks
//! - Dispatcher deciding between a hook call and a real blocking call
//! - Dispatch-suppressing Mutex
//! - Layered scheduler composition and instrumentation

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod blocking;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod fiber;
pub mod resource;
pub mod scheduler;
pub mod sync;
pub mod thread;

pub use config::Config;
pub use context::{ContextId, ThreadContext};
pub use error::{Error, Result};
pub use fiber::{Fiber, FiberBuilder, FiberError, FiberId, FiberState, FiberStatus, Wake};
pub use resource::{Interest, Readiness, Resource};
pub use scheduler::{Hook, Instrumented, Layer, Layered, Scheduler};
pub use sync::{Mutex, MutexGuard};
