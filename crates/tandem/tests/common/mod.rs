//! Shared fixtures for the integration tests
//!
//! [`TestScheduler`] is a minimal single-thread event loop: sleeping fibers sit
//! in a timer heap, fibers waiting on descriptors are polled with zero-timeout
//! polls, and fibers created through the `fiber` hook are started from `run()`.
//! Every hook call is logged with the fiber that made it.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tandem::fiber::{self, FiberBody};
use tandem::{
    blocking, context, Error, Fiber, FiberId, Hook, Interest, Readiness, Resource, Result,
    Scheduler, Wake,
};

/// Initialize test logging once per process
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Run `test` on a fresh OS thread so it gets a fresh thread context
pub fn isolated<F>(test: F)
where
    F: FnOnce() + Send + 'static,
{
    init_logging();
    if let Err(payload) = thread::spawn(test).join() {
        std::panic::resume_unwind(payload);
    }
}

/// Connected pair of blocking unix sockets
pub fn socket_pair() -> (UnixStream, UnixStream) {
    UnixStream::pair().unwrap()
}

/// Entry in the timer heap
struct SleepEntry {
    /// When to wake the fiber
    wake_at: Instant,
    /// Registration order, breaks ties between equal deadlines
    seq: u64,
    fiber: Fiber,
}

// Reverse ordering for min-heap (earliest wake time first)
impl Ord for SleepEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .wake_at
            .cmp(&self.wake_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for SleepEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SleepEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for SleepEntry {}

/// A fiber suspended until a descriptor is ready
struct IoWait {
    resource: Resource,
    interest: Interest,
    deadline: Option<Instant>,
    fiber: Fiber,
}

/// Hook call as seen by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookCall {
    pub fiber: FiberId,
    pub hook: Hook,
}

#[derive(Default)]
pub struct TestScheduler {
    calls: Mutex<Vec<HookCall>>,
    /// Durations passed to `wait_sleep`
    sleeps: Mutex<Vec<Option<Duration>>>,
    sleeping: Mutex<BinaryHeap<SleepEntry>>,
    /// Fibers sleeping without a deadline, woken once nothing else is pending
    parked: Mutex<VecDeque<Fiber>>,
    waiting: Mutex<Vec<IoWait>>,
    /// Fibers created through the `fiber` hook, started by `run()`
    pending: Mutex<VecDeque<Fiber>>,
    failures: Mutex<Vec<Error>>,
    seq: AtomicU64,
}

impl TestScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a scheduler and install it on the current thread
    pub fn install() -> Arc<Self> {
        let scheduler = Self::new();
        context::set_scheduler(Some(scheduler.clone())).unwrap();
        scheduler
    }

    pub fn calls(&self) -> Vec<HookCall> {
        self.calls.lock().clone()
    }

    pub fn hooks(&self) -> Vec<Hook> {
        self.calls.lock().iter().map(|c| c.hook).collect()
    }

    pub fn hooks_from(&self, fiber: FiberId) -> Vec<Hook> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.fiber == fiber)
            .map(|c| c.hook)
            .collect()
    }

    pub fn requested_sleeps(&self) -> Vec<Option<Duration>> {
        self.sleeps.lock().clone()
    }

    /// Errors returned while resuming fibers from `run()`
    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().iter().map(|e| e.to_string()).collect()
    }

    fn record(&self, hook: Hook) {
        let fiber = Fiber::current().id();
        self.calls.lock().push(HookCall { fiber, hook });
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, AtomicOrdering::Relaxed)
    }

    fn wait_io(
        &self,
        resource: &Resource,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> Result<Readiness> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        self.waiting.lock().push(IoWait {
            resource: *resource,
            interest,
            deadline,
            fiber: Fiber::current(),
        });
        match fiber::suspend()? {
            Wake::Ready(events) => Ok(Readiness::Ready(events)),
            Wake::TimedOut => Ok(Readiness::TimedOut),
            Wake::Invalidated(resource) => Err(Error::InvalidResource(resource)),
            Wake::Resume => Err(Error::scheduler("woken without an I/O outcome")),
        }
    }

    fn is_idle(&self) -> bool {
        self.sleeping.lock().is_empty()
            && self.waiting.lock().is_empty()
            && self.pending.lock().is_empty()
            && self.parked.lock().is_empty()
    }

    fn resume(&self, fiber: &Fiber, wake: Wake) {
        if let Err(e) = fiber.resume_with(wake) {
            self.failures.lock().push(e);
        }
    }

    /// Start pending fibers and wake every waiter that is due
    ///
    /// Returns whether any fiber ran.
    fn tick(&self) -> bool {
        let mut progressed = false;

        let started: Vec<Fiber> = self.pending.lock().drain(..).collect();
        for fiber in started {
            self.resume(&fiber, Wake::Resume);
            progressed = true;
        }

        let now = Instant::now();
        let mut woken = Vec::new();
        {
            let mut waiting = self.waiting.lock();
            let mut i = 0;
            while i < waiting.len() {
                let wait = &waiting[i];
                let readiness =
                    blocking::wait_any(&wait.resource, wait.interest, Some(Duration::ZERO));
                let wake = match readiness {
                    Ok(Readiness::Ready(events)) => Some(Wake::Ready(events)),
                    Err(Error::InvalidResource(resource)) => Some(Wake::Invalidated(resource)),
                    Ok(Readiness::TimedOut) | Err(_) => match wait.deadline {
                        Some(deadline) if deadline <= now => Some(Wake::TimedOut),
                        _ => None,
                    },
                };
                match wake {
                    Some(wake) => woken.push((waiting.swap_remove(i).fiber, wake)),
                    None => i += 1,
                }
            }
        }
        {
            let mut sleeping = self.sleeping.lock();
            while sleeping.peek().is_some_and(|entry| entry.wake_at <= now) {
                if let Some(entry) = sleeping.pop() {
                    woken.push((entry.fiber, Wake::Resume));
                }
            }
        }
        for (fiber, wake) in woken {
            self.resume(&fiber, wake);
            progressed = true;
        }

        if !progressed && self.sleeping.lock().is_empty() && self.waiting.lock().is_empty() {
            let parked = self.parked.lock().pop_front();
            if let Some(fiber) = parked {
                self.resume(&fiber, Wake::Resume);
                progressed = true;
            }
        }
        progressed
    }

    /// Time to wait before the next tick can make progress
    fn idle_wait(&self) -> Duration {
        let granularity = Duration::from_millis(1);
        match self.sleeping.lock().peek() {
            Some(entry) => entry
                .wake_at
                .saturating_duration_since(Instant::now())
                .min(granularity),
            None => granularity,
        }
    }
}

impl Scheduler for TestScheduler {
    fn wait_readable(&self, resource: &Resource) -> Result<()> {
        self.record(Hook::WaitReadable);
        self.wait_io(resource, Interest::READABLE, None).map(|_| ())
    }

    fn wait_writable(&self, resource: &Resource) -> Result<()> {
        self.record(Hook::WaitWritable);
        self.wait_io(resource, Interest::WRITABLE, None).map(|_| ())
    }

    fn wait_any(
        &self,
        resource: &Resource,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> Result<Readiness> {
        self.record(Hook::WaitAny);
        if timeout == Some(Duration::ZERO) {
            return blocking::wait_any(resource, interest, timeout);
        }
        self.wait_io(resource, interest, timeout)
    }

    fn wait_sleep(&self, duration: Option<Duration>) -> Result<Duration> {
        self.record(Hook::WaitSleep);
        self.sleeps.lock().push(duration);
        let started = Instant::now();
        let fiber = Fiber::current();
        match duration.and_then(|d| started.checked_add(d)) {
            Some(wake_at) => {
                let seq = self.next_seq();
                self.sleeping.lock().push(SleepEntry { wake_at, seq, fiber });
            }
            None => self.parked.lock().push_back(fiber),
        }
        fiber::suspend()?;
        Ok(started.elapsed())
    }

    fn enter_blocking_region(&self) -> Result<()> {
        self.record(Hook::EnterBlockingRegion);
        Ok(())
    }

    fn exit_blocking_region(&self) -> Result<()> {
        self.record(Hook::ExitBlockingRegion);
        Ok(())
    }

    fn fiber(&self, body: FiberBody) -> Result<Fiber> {
        self.record(Hook::Fiber);
        let fiber = Fiber::builder().blocking(false).build_boxed(body);
        self.pending.lock().push_back(fiber.clone());
        Ok(fiber)
    }

    fn run(&self) -> Result<()> {
        self.record(Hook::Run);
        while !self.is_idle() {
            if !self.tick() {
                thread::sleep(self.idle_wait());
            }
        }
        Ok(())
    }
}
