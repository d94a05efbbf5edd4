//! Per-thread scheduling state
//!
//! A [`ThreadContext`] exists for every thread that touches the crate. It holds
//! the installed scheduler, the running fiber, the blocking-region depth, and
//! the mutex suppression state the dispatcher consults on every
//! potentially-blocking call. Carrier threads of a context's fibers are bound
//! to the same context, so from the program's point of view they are the
//! owning thread.

use crate::config::{default_config, Config};
use crate::error::{Error, Result};
use crate::fiber::{Fiber, FiberError, WeakFiber};
use crate::scheduler::{Hook, Scheduler};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

thread_local! {
    static BOUND: RefCell<Option<Binding>> = const { RefCell::new(None) };
}

/// A thread's tie to its context
///
/// The owning thread's binding cancels the context's leftover fibers when the
/// thread exits, so no carrier outlives it.
struct Binding {
    ctx: Arc<ThreadContext>,
    owner: bool,
}

impl Drop for Binding {
    fn drop(&mut self) {
        if self.owner {
            self.ctx.cancel_fibers();
        }
    }
}

/// Unique identifier for a ThreadContext
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

impl ContextId {
    fn next() -> Self {
        ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Scheduling state owned by one thread
pub struct ThreadContext {
    id: ContextId,
    config: Config,
    scheduler: Mutex<Option<Arc<dyn Scheduler>>>,
    /// Scheduler notified of the open outermost blocking region
    region_scheduler: Mutex<Option<Arc<dyn Scheduler>>>,
    root: Fiber,
    current: Mutex<Fiber>,
    blocking_region_depth: AtomicUsize,
    /// Number of `sync::Mutex` guards held; suppressed while non-zero
    mutex_holds: AtomicUsize,
    hooks_in_flight: AtomicUsize,
    running: AtomicBool,
    finished: AtomicBool,
    fibers: Mutex<Vec<WeakFiber>>,
}

/// The calling thread's context, created on first use
pub fn current() -> Arc<ThreadContext> {
    BOUND.with(|slot| {
        let mut slot = slot.borrow_mut();
        let binding = slot.get_or_insert_with(|| Binding {
            ctx: ThreadContext::new(default_config().clone()),
            owner: true,
        });
        Arc::clone(&binding.ctx)
    })
}

/// Create the calling thread's context with `config` instead of the default
///
/// Fails with [`Error::AlreadyInitialized`] once the thread has a context.
pub fn init(config: Config) -> Result<Arc<ThreadContext>> {
    BOUND.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        let ctx = ThreadContext::new(config);
        *slot = Some(Binding {
            ctx: Arc::clone(&ctx),
            owner: true,
        });
        Ok(ctx)
    })
}

/// Bind a carrier thread to the context of the fiber it carries
pub(crate) fn bind(ctx: Arc<ThreadContext>) {
    BOUND.with(|slot| *slot.borrow_mut() = Some(Binding { ctx, owner: false }));
}

/// Install (or, with `None`, uninstall) the current thread's scheduler
///
/// Returns the previously installed scheduler.
pub fn set_scheduler(scheduler: Option<Arc<dyn Scheduler>>) -> Result<Option<Arc<dyn Scheduler>>> {
    current().set_scheduler(scheduler)
}

/// Run the current thread's scheduler to completion and shut the context down
pub fn finish() -> Result<()> {
    current().finish()
}

impl ThreadContext {
    fn new(config: Config) -> Arc<Self> {
        let ctx = Arc::new_cyclic(|weak| {
            let root = Fiber::new_root(weak.clone());
            ThreadContext {
                id: ContextId::next(),
                config,
                scheduler: Mutex::new(None),
                region_scheduler: Mutex::new(None),
                current: Mutex::new(root.clone()),
                fibers: Mutex::new(vec![root.downgrade()]),
                root,
                blocking_region_depth: AtomicUsize::new(0),
                mutex_holds: AtomicUsize::new(0),
                hooks_in_flight: AtomicUsize::new(0),
                running: AtomicBool::new(false),
                finished: AtomicBool::new(false),
            }
        });
        log::trace!("thread context {} created", ctx.id.as_u64());
        ctx
    }

    /// Get the context's unique ID
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Configuration snapshot taken when the context was created
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The installed scheduler, if any
    pub fn scheduler(&self) -> Option<Arc<dyn Scheduler>> {
        self.scheduler.lock().clone()
    }

    /// Whether a scheduler is installed
    pub fn has_scheduler(&self) -> bool {
        self.scheduler.lock().is_some()
    }

    /// Replace the installed scheduler, returning the previous one
    ///
    /// Fails with [`Error::SchedulerBusy`] while any hook call is in flight
    /// (e.g. a fiber is suspended inside `wait_readable`) or a blocking region
    /// the scheduler was told about is still open, and with
    /// [`Error::ContextFinished`] when installing after [`finish`](Self::finish).
    pub fn set_scheduler(
        &self,
        scheduler: Option<Arc<dyn Scheduler>>,
    ) -> Result<Option<Arc<dyn Scheduler>>> {
        let open_region = usize::from(self.region_scheduler.lock().is_some());
        let in_flight = self.hooks_in_flight.load(Ordering::Acquire) + open_region;
        if in_flight > 0 {
            return Err(Error::SchedulerBusy(in_flight));
        }
        if scheduler.is_some() && self.is_finished() {
            return Err(Error::ContextFinished);
        }
        let installing = scheduler.is_some();
        let previous = std::mem::replace(&mut *self.scheduler.lock(), scheduler);
        if installing {
            log::debug!("scheduler installed on thread context {}", self.id.as_u64());
        } else if previous.is_some() {
            log::debug!("scheduler removed from thread context {}", self.id.as_u64());
        }
        Ok(previous)
    }

    /// Install `scheduler`, returning the previous one
    pub fn install(&self, scheduler: Arc<dyn Scheduler>) -> Result<Option<Arc<dyn Scheduler>>> {
        self.set_scheduler(Some(scheduler))
    }

    /// Remove the installed scheduler, returning it
    pub fn uninstall(&self) -> Result<Option<Arc<dyn Scheduler>>> {
        self.set_scheduler(None)
    }

    /// The fiber standing for the thread's own stack
    pub fn root_fiber(&self) -> Fiber {
        self.root.clone()
    }

    /// The fiber presently executing
    pub fn current_fiber(&self) -> Fiber {
        self.current.lock().clone()
    }

    pub(crate) fn set_current_fiber(&self, fiber: Fiber) {
        *self.current.lock() = fiber;
    }

    /// Live fibers owned by this context, root included
    pub fn fibers(&self) -> Vec<Fiber> {
        self.fibers
            .lock()
            .iter()
            .filter_map(WeakFiber::upgrade)
            .collect()
    }

    pub(crate) fn register_fiber(&self, fiber: &Fiber) {
        let mut fibers = self.fibers.lock();
        fibers.retain(WeakFiber::is_alive);
        fibers.push(fiber.downgrade());
    }

    /// Current nesting of blocking regions
    pub fn blocking_region_depth(&self) -> usize {
        self.blocking_region_depth.load(Ordering::Acquire)
    }

    pub(crate) fn increment_region_depth(&self) -> usize {
        self.blocking_region_depth.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the region depth, refusing to go below zero
    pub(crate) fn decrement_region_depth(&self) -> Result<usize> {
        self.blocking_region_depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| depth.checked_sub(1))
            .map(|previous| previous - 1)
            .map_err(|_| Error::UnpairedBlockingRegion)
    }

    /// Remember the scheduler that heard the outermost region enter
    pub(crate) fn open_region(&self, scheduler: Arc<dyn Scheduler>) {
        *self.region_scheduler.lock() = Some(scheduler);
    }

    /// Take the scheduler owed the matching region exit, if any
    pub(crate) fn close_region(&self) -> Option<Arc<dyn Scheduler>> {
        self.region_scheduler.lock().take()
    }

    /// Whether a `sync::Mutex` is held on this thread
    pub fn is_mutex_suppressed(&self) -> bool {
        self.mutex_holds.load(Ordering::Acquire) > 0
    }

    pub(crate) fn acquire_suppression(&self) -> bool {
        self.mutex_holds.fetch_add(1, Ordering::AcqRel) > 0
    }

    pub(crate) fn release_suppression(&self) {
        let _ = self
            .mutex_holds
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |holds| holds.checked_sub(1));
    }

    /// Whether hook dispatch is disabled for the whole thread
    ///
    /// True while a mutex is held or a native blocking region is open.
    pub fn is_dispatch_suppressed(&self) -> bool {
        self.is_mutex_suppressed() || self.blocking_region_depth() > 0
    }

    /// Number of hook calls that have not returned yet
    pub fn hooks_in_flight(&self) -> usize {
        self.hooks_in_flight.load(Ordering::Acquire)
    }

    /// Mark `fiber` as inside `hook` until the guard drops
    pub(crate) fn enter_hook(&self, fiber: &Fiber, hook: Hook) -> HookGuard<'_> {
        self.hooks_in_flight.fetch_add(1, Ordering::AcqRel);
        let previous = fiber.set_waiting_in(Some(hook));
        HookGuard {
            ctx: self,
            fiber: fiber.clone(),
            previous,
        }
    }

    /// Whether [`finish`](Self::finish) has completed
    ///
    /// Stays false while the scheduler's `run()` is still driving fibers.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Run the scheduler's `run()` hook and shut the context down
    ///
    /// Must be called from the root fiber when the thread is about to exit.
    /// The first call invokes `run()` (if a scheduler is installed), then
    /// uninstalls the scheduler and cancels any fiber still parked. Fibers
    /// driven by `run()` may keep creating fibers; creation is refused only
    /// once `run()` has returned. Later calls do nothing.
    pub fn finish(&self) -> Result<()> {
        let current = self.current_fiber();
        if !current.is_root() {
            return Err(FiberError::NotRoot(current.id()).into());
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let result = match self.scheduler() {
            Some(scheduler) => {
                log::debug!("running scheduler of thread context {}", self.id.as_u64());
                let _hook = self.enter_hook(&current, Hook::Run);
                scheduler.run()
            }
            None => Ok(()),
        };
        self.finished.store(true, Ordering::Release);
        self.scheduler.lock().take();
        self.cancel_fibers();
        log::debug!("thread context {} finished", self.id.as_u64());
        result
    }

    fn cancel_fibers(&self) {
        let fibers = self.fibers();
        let leftover = fibers
            .iter()
            .filter(|fiber| !fiber.is_root() && fiber.is_alive())
            .count();
        if leftover > 0 {
            log::debug!("cancelling {} unfinished fiber(s)", leftover);
        }
        for fiber in fibers.iter().filter(|fiber| !fiber.is_root()) {
            fiber.cancel();
        }
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("id", &self.id)
            .field("has_scheduler", &self.has_scheduler())
            .field("current_fiber", &self.current_fiber().id())
            .field("blocking_region_depth", &self.blocking_region_depth())
            .field("mutex_suppressed", &self.is_mutex_suppressed())
            .field("hooks_in_flight", &self.hooks_in_flight())
            .finish()
    }
}

/// Keeps a hook call accounted for until it returns (or unwinds)
pub(crate) struct HookGuard<'a> {
    ctx: &'a ThreadContext,
    fiber: Fiber,
    previous: Option<Hook>,
}

impl Drop for HookGuard<'_> {
    fn drop(&mut self) {
        self.fiber.set_waiting_in(self.previous);
        self.ctx.hooks_in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
