//! Fibers: cooperative execution units
//!
//! A fiber runs a body closure and gives up control only at explicit points:
//! [`suspend`], [`Fiber::resume`] of another fiber, or [`Fiber::transfer`].
//! Each fiber is classified at creation as blocking (the default) or
//! non-blocking; only non-blocking fibers have their potentially-blocking
//! operations routed to the thread's scheduler.
//!
//! The execution context of a fiber is parked on a dedicated carrier thread
//! and control is handed over through a baton channel, so exactly one fiber
//! of a [`ThreadContext`] executes at any time.

mod builder;
mod carrier;

pub use builder::FiberBuilder;

use crate::context::{self, ThreadContext};
use crate::error::{Error, Result};
use crate::resource::{Interest, Resource};
use crate::scheduler::Hook;
use crossbeam::atomic::AtomicCell;
use crossbeam::channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Body of a fiber
pub type FiberBody = Box<dyn FnOnce() + Send + 'static>;

/// Unique identifier for a Fiber
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FiberId(u64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    /// Generate a new unique FiberId
    pub fn new() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for FiberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a Fiber
///
/// `Created → Running → Suspended → Running → … → Terminated`. A suspended
/// fiber must run again before it can terminate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FiberState {
    /// Built but never resumed
    Created,
    /// Currently executing (at most one per thread)
    Running,
    /// Waiting to be resumed or transferred to
    Suspended,
    /// Body completed or panicked
    Terminated,
}

/// Where a fiber stands after a [`Fiber::resume`] returns control
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FiberStatus {
    /// The fiber suspended and can be resumed again
    Suspended,
    /// The body completed normally
    Terminated,
}

/// Value delivered to a suspended fiber when it regains control
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wake {
    /// Plain resumption
    Resume,
    /// The awaited events occurred
    Ready(Interest),
    /// The wait timed out
    TimedOut,
    /// The awaited resource was invalidated
    Invalidated(Resource),
}

/// Fiber control-transfer errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FiberError {
    /// Resumed or transferred to after termination
    #[error("fiber {0} is dead")]
    Dead(FiberId),

    /// Resumed while already running
    #[error("fiber {0} is already running")]
    AlreadyRunning(FiberId),

    /// Resumed while it is itself resuming another fiber
    #[error("fiber {0} is resuming another fiber")]
    DoubleResume(FiberId),

    /// Resumed after control was transferred to it; only `transfer` may reach it
    #[error("fiber {0} is transferring and cannot be resumed")]
    Transferring(FiberId),

    /// Touched from a thread that does not own it
    #[error("fiber {0} belongs to another thread")]
    WrongThread(FiberId),

    /// Yield attempted with nobody to yield to (root or transferred fiber)
    #[error("fiber {0} has no resumer to yield to")]
    NoResumer(FiberId),

    /// Operation reserved to the root fiber attempted from another fiber
    #[error("operation must run on the root fiber, not fiber {0}")]
    NotRoot(FiberId),

    /// The body panicked; the fiber is terminated
    #[error("fiber panicked: {0}")]
    Panicked(String),

    /// The carrier thread could not be started
    #[error("failed to start fiber carrier: {0}")]
    Spawn(String),
}

/// Baton passed between fibers on a hand-off
pub(crate) enum Baton {
    Wake(Wake),
    /// Unwind the parked fiber (thread shutdown)
    Cancel,
}

pub(crate) struct Inner {
    id: FiberId,
    name: Option<String>,
    blocking: bool,
    root: bool,
    state: AtomicCell<FiberState>,
    context: Weak<ThreadContext>,
    body: Mutex<Option<FiberBody>>,
    stack_size: Option<usize>,
    /// Fiber blocked in `resume` on us; receives control when we suspend
    resumer: Mutex<Option<Fiber>>,
    /// We are blocked in `resume` on another fiber
    resuming: AtomicBool,
    /// Control reached us through `transfer`; `resume` is no longer allowed
    transferred: AtomicBool,
    failure: Mutex<Option<FiberError>>,
    waiting_in: AtomicCell<Option<Hook>>,
    forward_depth: AtomicUsize,
    baton_tx: Sender<Baton>,
    baton_rx: Receiver<Baton>,
    carrier: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a fiber (cheap to clone)
#[derive(Clone)]
pub struct Fiber {
    inner: Arc<Inner>,
}

/// Non-owning handle kept in the thread context's fiber registry
pub(crate) struct WeakFiber(Weak<Inner>);

impl WeakFiber {
    pub(crate) fn upgrade(&self) -> Option<Fiber> {
        self.0.upgrade().map(|inner| Fiber { inner })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl Fiber {
    /// Create a blocking fiber on the current thread
    pub fn new<F>(body: F) -> Fiber
    where
        F: FnOnce() + Send + 'static,
    {
        FiberBuilder::new().build(body)
    }

    /// Create a non-blocking fiber on the current thread
    pub fn nonblocking<F>(body: F) -> Fiber
    where
        F: FnOnce() + Send + 'static,
    {
        FiberBuilder::new().blocking(false).build(body)
    }

    /// Start configuring a new fiber
    pub fn builder() -> FiberBuilder {
        FiberBuilder::new()
    }

    /// The fiber currently running on this thread
    pub fn current() -> Fiber {
        context::current().current_fiber()
    }

    fn with_inner(
        context: Weak<ThreadContext>,
        root: bool,
        blocking: bool,
        name: Option<String>,
        stack_size: Option<usize>,
        body: Option<FiberBody>,
    ) -> Fiber {
        let (baton_tx, baton_rx) = crossbeam::channel::unbounded();
        Fiber {
            inner: Arc::new(Inner {
                id: FiberId::new(),
                name,
                blocking,
                root,
                state: AtomicCell::new(if root {
                    FiberState::Running
                } else {
                    FiberState::Created
                }),
                context,
                body: Mutex::new(body),
                stack_size,
                resumer: Mutex::new(None),
                resuming: AtomicBool::new(false),
                // The root is only ever reached by transfer or by hand-back
                transferred: AtomicBool::new(root),
                failure: Mutex::new(None),
                waiting_in: AtomicCell::new(None),
                forward_depth: AtomicUsize::new(0),
                baton_tx,
                baton_rx,
                carrier: Mutex::new(None),
            }),
        }
    }

    /// The fiber standing for a thread's own stack
    pub(crate) fn new_root(context: Weak<ThreadContext>) -> Fiber {
        Self::with_inner(context, true, true, Some("root".to_string()), None, None)
    }

    pub(crate) fn downgrade(&self) -> WeakFiber {
        WeakFiber(Arc::downgrade(&self.inner))
    }

    /// Get the fiber's unique ID
    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    /// Optional name given at creation
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Whether this fiber bypasses the scheduler (fixed at creation)
    pub fn is_blocking(&self) -> bool {
        self.inner.blocking
    }

    /// Whether this is the thread's root fiber
    pub fn is_root(&self) -> bool {
        self.inner.root
    }

    /// Current lifecycle state
    pub fn state(&self) -> FiberState {
        self.inner.state.load()
    }

    /// Whether the fiber has not terminated yet
    pub fn is_alive(&self) -> bool {
        self.state() != FiberState::Terminated
    }

    /// The hook this fiber is currently inside, if any
    pub fn waiting_in(&self) -> Option<Hook> {
        self.inner.waiting_in.load()
    }

    /// Failure of the body, once it has panicked
    pub fn failure(&self) -> Option<FiberError> {
        self.inner.failure.lock().clone()
    }

    /// The owning thread context, while that thread is alive
    pub fn context(&self) -> Option<Arc<ThreadContext>> {
        self.inner.context.upgrade()
    }

    /// Resume the fiber until it suspends or terminates
    pub fn resume(&self) -> Result<FiberStatus> {
        self.resume_with(Wake::Resume)
    }

    /// Resume the fiber, delivering `wake` as the result of its pending suspension
    ///
    /// The caller is suspended until the fiber suspends or terminates. A
    /// panicked body is reported here as [`FiberError::Panicked`].
    pub fn resume_with(&self, wake: Wake) -> Result<FiberStatus> {
        let ctx = self.owning_context()?;
        let current = ctx.current_fiber();
        self.check_resumable(&current)?;
        carrier::ensure_started(&ctx, self)?;

        *self.inner.resumer.lock() = Some(current.clone());
        current.inner.resuming.store(true, Ordering::Release);
        current.set_state(FiberState::Suspended);

        carrier::switch(&ctx, &current, self, wake);

        current.inner.resuming.store(false, Ordering::Release);
        if self.state() == FiberState::Terminated {
            if let Some(failure) = self.failure() {
                return Err(Error::Fiber(failure));
            }
            return Ok(FiberStatus::Terminated);
        }
        Ok(FiberStatus::Suspended)
    }

    /// Hand control directly to this fiber (symmetric transfer)
    ///
    /// Returns the value the caller is eventually woken with. A fiber reached
    /// by transfer can no longer be resumed; when it terminates, control goes
    /// to its resumer if it has one, otherwise to the root fiber.
    pub fn transfer(&self, wake: Wake) -> Result<Wake> {
        let ctx = self.owning_context()?;
        let current = ctx.current_fiber();
        if current == *self {
            return Ok(wake);
        }
        match self.state() {
            FiberState::Terminated => return Err(FiberError::Dead(self.id()).into()),
            FiberState::Running => return Err(FiberError::AlreadyRunning(self.id()).into()),
            FiberState::Created | FiberState::Suspended => {}
        }
        if self.inner.resuming.load(Ordering::Acquire) {
            return Err(FiberError::DoubleResume(self.id()).into());
        }
        carrier::ensure_started(&ctx, self)?;

        self.inner.transferred.store(true, Ordering::Release);
        current.set_state(FiberState::Suspended);
        Ok(carrier::switch(&ctx, &current, self, wake))
    }

    fn owning_context(&self) -> Result<Arc<ThreadContext>> {
        let current = context::current();
        match self.context() {
            Some(ctx) if Arc::ptr_eq(&ctx, &current) => Ok(ctx),
            _ => Err(FiberError::WrongThread(self.id()).into()),
        }
    }

    fn check_resumable(&self, current: &Fiber) -> Result<()> {
        let id = self.id();
        if current == self {
            return Err(FiberError::AlreadyRunning(id).into());
        }
        match self.state() {
            FiberState::Terminated => return Err(FiberError::Dead(id).into()),
            FiberState::Running => return Err(FiberError::AlreadyRunning(id).into()),
            FiberState::Created | FiberState::Suspended => {}
        }
        if self.inner.resuming.load(Ordering::Acquire) {
            return Err(FiberError::DoubleResume(id).into());
        }
        if self.inner.transferred.load(Ordering::Acquire) {
            return Err(FiberError::Transferring(id).into());
        }
        Ok(())
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.inner.state.store(state);
    }

    pub(crate) fn set_waiting_in(&self, hook: Option<Hook>) -> Option<Hook> {
        self.inner.waiting_in.swap(hook)
    }

    pub(crate) fn forward_depth(&self) -> &AtomicUsize {
        &self.inner.forward_depth
    }

    /// Unwind a parked fiber and wait for its carrier to exit
    pub(crate) fn cancel(&self) {
        carrier::cancel(self);
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Fiber {}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("blocking", &self.inner.blocking)
            .field("state", &self.state())
            .finish()
    }
}

/// Yield from the current fiber back to the fiber that resumed it
///
/// Returns the [`Wake`] value passed by whoever resumes this fiber next.
pub fn suspend() -> Result<Wake> {
    let ctx = context::current();
    let me = ctx.current_fiber();
    let target = me
        .inner
        .resumer
        .lock()
        .take()
        .ok_or(FiberError::NoResumer(me.id()))?;
    me.set_state(FiberState::Suspended);
    Ok(carrier::switch(&ctx, &me, &target, Wake::Resume))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_fiber_id_uniqueness() {
        let id1 = FiberId::new();
        let id2 = FiberId::new();
        assert_ne!(id1, id2);
        assert!(id2.as_u64() > id1.as_u64());
    }

    #[test]
    fn test_fiber_default_is_blocking() {
        let fiber = Fiber::new(|| {});
        assert!(fiber.is_blocking());
        assert_eq!(fiber.state(), FiberState::Created);
        assert!(!Fiber::nonblocking(|| {}).is_blocking());
    }

    #[test]
    fn test_root_fiber_is_running_and_blocking() {
        let root = Fiber::current();
        assert!(root.is_root());
        assert!(root.is_blocking());
        assert_eq!(root.state(), FiberState::Running);
    }

    #[test]
    fn test_resume_runs_to_completion() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let fiber = Fiber::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fiber.resume().unwrap(), FiberStatus::Terminated);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Terminated);
        assert!(matches!(
            fiber.resume(),
            Err(Error::Fiber(FiberError::Dead(id))) if id == fiber.id()
        ));
    }

    #[test]
    fn test_suspend_and_resume_with_value() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let fiber = Fiber::new(move || {
            let wake = suspend().unwrap();
            s.lock().push(wake);
            let wake = suspend().unwrap();
            s.lock().push(wake);
        });

        assert_eq!(fiber.resume().unwrap(), FiberStatus::Suspended);
        assert_eq!(fiber.state(), FiberState::Suspended);
        assert_eq!(
            fiber.resume_with(Wake::Ready(Interest::READABLE)).unwrap(),
            FiberStatus::Suspended
        );
        assert_eq!(fiber.resume_with(Wake::TimedOut).unwrap(), FiberStatus::Terminated);
        assert_eq!(
            *seen.lock(),
            vec![Wake::Ready(Interest::READABLE), Wake::TimedOut]
        );
    }

    #[test]
    fn test_current_fiber_inside_body() {
        let observed = Arc::new(Mutex::new(None));
        let o = observed.clone();
        let fiber = Fiber::builder().name("worker").build(move || {
            let me = Fiber::current();
            *o.lock() = Some((me.id(), me.name().map(str::to_string), me.state()));
        });
        fiber.resume().unwrap();
        let (id, name, state) = observed.lock().clone().unwrap();
        assert_eq!(id, fiber.id());
        assert_eq!(name.as_deref(), Some("worker"));
        assert_eq!(state, FiberState::Running);
        assert!(Fiber::current().is_root());
    }

    #[test]
    fn test_panic_is_reported_to_resumer() {
        let fiber = Fiber::new(|| panic!("kaboom"));
        let err = fiber.resume().unwrap_err();
        assert!(matches!(err, Error::Fiber(FiberError::Panicked(ref msg)) if msg == "kaboom"));
        assert_eq!(fiber.state(), FiberState::Terminated);
        assert_eq!(fiber.failure(), Some(FiberError::Panicked("kaboom".to_string())));
        // The resuming thread keeps going
        assert_eq!(Fiber::current().state(), FiberState::Running);
    }

    #[test]
    fn test_root_cannot_suspend() {
        let err = suspend().unwrap_err();
        assert!(matches!(err, Error::Fiber(FiberError::NoResumer(_))));
    }

    #[test]
    fn test_cannot_resume_self_or_root() {
        let result = Arc::new(Mutex::new(Vec::new()));
        let r = result.clone();
        let root = Fiber::current();
        let fiber = Fiber::new(move || {
            let me = Fiber::current();
            r.lock().push(me.resume().map(|_| ()).map_err(|e| e.to_string()));
            r.lock().push(root.resume().map(|_| ()).map_err(|e| e.to_string()));
        });
        fiber.resume().unwrap();
        let result = result.lock();
        assert!(result[0].as_ref().unwrap_err().contains("already running"));
        assert!(result[1].as_ref().unwrap_err().contains("resuming another fiber"));
    }

    #[test]
    fn test_wrong_thread_is_rejected() {
        let fiber = Fiber::new(|| {});
        let handle = std::thread::spawn(move || fiber.resume().map(|_| ()));
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::Fiber(FiberError::WrongThread(_))));
    }

    #[test]
    fn test_transfer_returns_to_root_on_termination() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        let fiber = Fiber::new(move || {
            o.lock().push("fiber");
        });
        let wake = fiber.transfer(Wake::Resume).unwrap();
        order.lock().push("root");
        assert_eq!(wake, Wake::Resume);
        assert_eq!(*order.lock(), vec!["fiber", "root"]);
        assert_eq!(fiber.state(), FiberState::Terminated);
    }

    #[test]
    fn test_transferred_fiber_cannot_be_resumed() {
        let root = Fiber::current();
        let fiber = Fiber::new(move || {
            // Hand control back to the root explicitly
            root.transfer(Wake::Resume).unwrap();
        });
        fiber.transfer(Wake::Resume).unwrap();
        assert_eq!(fiber.state(), FiberState::Suspended);
        assert!(matches!(
            fiber.resume(),
            Err(Error::Fiber(FiberError::Transferring(_)))
        ));
        // Transfer is still allowed and lets it finish
        fiber.transfer(Wake::Resume).unwrap();
        assert_eq!(fiber.state(), FiberState::Terminated);
    }

    #[test]
    fn test_nested_resume_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l1 = log.clone();
        let outer = Fiber::new(move || {
            let l2 = l1.clone();
            let inner = Fiber::new(move || {
                l2.lock().push("inner-1");
                suspend().unwrap();
                l2.lock().push("inner-2");
            });
            inner.resume().unwrap();
            l1.lock().push("outer");
            suspend().unwrap();
            inner.resume().unwrap();
            l1.lock().push("outer-done");
        });
        outer.resume().unwrap();
        log.lock().push("root");
        outer.resume().unwrap();
        assert_eq!(
            *log.lock(),
            vec!["inner-1", "outer", "root", "inner-2", "outer-done"]
        );
    }
}
