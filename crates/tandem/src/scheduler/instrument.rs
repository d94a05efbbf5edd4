//! Instrumentation layer: per-hook call counts and time spent

use super::{Hook, Layer, Layered, Scheduler};
use crate::error::Result;
use crate::fiber::{Fiber, FiberBody};
use crate::resource::{Interest, Readiness, Resource};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counters for one hook
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookStats {
    /// Number of invocations
    pub calls: u64,

    /// Invocations that returned an error
    pub failures: u64,

    /// Wall time between invocation and return, suspension included
    pub total: Duration,
}

/// Layer that records every hook call and forwards it unchanged
#[derive(Debug, Default)]
pub struct Instrument {
    stats: Mutex<FxHashMap<Hook, HookStats>>,
}

/// A scheduler wrapped with [`Instrument`]
pub type Instrumented = Layered<Instrument>;

impl Instrument {
    /// Create an empty instrument
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters recorded for `hook`
    pub fn stats(&self, hook: Hook) -> HookStats {
        self.stats.lock().get(&hook).copied().unwrap_or_default()
    }

    /// Counters of every hook called at least once, in interface order
    pub fn snapshot(&self) -> Vec<(Hook, HookStats)> {
        let stats = self.stats.lock();
        Hook::ALL
            .iter()
            .filter_map(|hook| stats.get(hook).map(|s| (*hook, *s)))
            .collect()
    }

    /// Total number of hook calls recorded
    pub fn total_calls(&self) -> u64 {
        self.stats.lock().values().map(|s| s.calls).sum()
    }

    fn record<T>(&self, hook: Hook, call: impl FnOnce() -> Result<T>) -> Result<T> {
        let started = Instant::now();
        let result = call();
        let elapsed = started.elapsed();
        {
            let mut stats = self.stats.lock();
            let entry = stats.entry(hook).or_default();
            entry.calls += 1;
            entry.total += elapsed;
            if result.is_err() {
                entry.failures += 1;
            }
        }
        log::trace!("{} returned after {:?}", hook, elapsed);
        result
    }
}

impl Layered<Instrument> {
    /// Wrap `inner` with a fresh instrument
    pub fn instrument(inner: Arc<dyn Scheduler>) -> Self {
        Layered::new(Instrument::new(), inner)
    }
}

impl Layer for Instrument {
    fn wait_readable(&self, inner: &dyn Scheduler, resource: &Resource) -> Result<()> {
        self.record(Hook::WaitReadable, || inner.wait_readable(resource))
    }

    fn wait_writable(&self, inner: &dyn Scheduler, resource: &Resource) -> Result<()> {
        self.record(Hook::WaitWritable, || inner.wait_writable(resource))
    }

    fn wait_any(
        &self,
        inner: &dyn Scheduler,
        resource: &Resource,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> Result<Readiness> {
        self.record(Hook::WaitAny, || inner.wait_any(resource, interest, timeout))
    }

    fn wait_sleep(&self, inner: &dyn Scheduler, duration: Option<Duration>) -> Result<Duration> {
        self.record(Hook::WaitSleep, || inner.wait_sleep(duration))
    }

    fn enter_blocking_region(&self, inner: &dyn Scheduler) -> Result<()> {
        self.record(Hook::EnterBlockingRegion, || inner.enter_blocking_region())
    }

    fn exit_blocking_region(&self, inner: &dyn Scheduler) -> Result<()> {
        self.record(Hook::ExitBlockingRegion, || inner.exit_blocking_region())
    }

    fn fiber(&self, inner: &dyn Scheduler, body: FiberBody) -> Result<Fiber> {
        self.record(Hook::Fiber, || inner.fiber(body))
    }

    fn run(&self, inner: &dyn Scheduler) -> Result<()> {
        self.record(Hook::Run, || inner.run())
    }
}
