use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;
use tandem::scheduler::{Instrumented, Layer, Layered};
use tandem::{dispatch, fiber, Fiber, Mutex, Result, Scheduler};

/// Answers every sleep immediately
struct Immediate;

impl Scheduler for Immediate {
    fn wait_sleep(&self, duration: Option<Duration>) -> Result<Duration> {
        Ok(duration.unwrap_or_default())
    }
}

struct PassThrough;

impl Layer for PassThrough {}

fn bench_fallback(c: &mut Criterion) {
    let mut group = c.benchmark_group("fallback");

    group.bench_function("sleep_zero", |b| {
        b.iter(|| dispatch::sleep(black_box(Some(Duration::ZERO))).unwrap());
    });

    let mutex = Mutex::new(0u64);
    group.bench_function("sleep_zero_under_mutex", |b| {
        b.iter(|| {
            mutex.synchronize(|n| {
                *n += 1;
                dispatch::sleep(black_box(Some(Duration::ZERO))).unwrap()
            })
        });
    });

    group.bench_function("blocking_region", |b| {
        b.iter(|| dispatch::blocking_region(|| black_box(1)).unwrap());
    });

    group.finish();
}

fn bench_layering(c: &mut Criterion) {
    let mut group = c.benchmark_group("layering");

    for depth in [1usize, 4, 16] {
        let mut scheduler: Arc<dyn Scheduler> = Arc::new(Immediate);
        for _ in 0..depth {
            scheduler = Arc::new(Layered::new(PassThrough, scheduler));
        }
        group.bench_with_input(BenchmarkId::new("forward", depth), &scheduler, |b, s| {
            b.iter(|| s.wait_sleep(black_box(Some(Duration::from_millis(1)))).unwrap());
        });
    }

    let instrumented = Instrumented::instrument(Arc::new(Immediate));
    group.bench_function("instrumented", |b| {
        b.iter(|| {
            instrumented
                .wait_sleep(black_box(Some(Duration::from_millis(1))))
                .unwrap()
        });
    });

    group.finish();
}

fn bench_switch(c: &mut Criterion) {
    let ping = Fiber::new(|| loop {
        if fiber::suspend().is_err() {
            break;
        }
    });

    c.bench_function("resume_suspend_round_trip", |b| {
        b.iter(|| ping.resume().unwrap());
    });
}

criterion_group!(benches, bench_fallback, bench_layering, bench_switch);
criterion_main!(benches);
