//! Synchronization primitive benchmarks.

use core::sync::atomic::AtomicU32;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use filament_bench::ensure_runtime;
use filament_core::{self as rt, RtMutex, Semaphore};

fn bench_mutex(c: &mut Criterion) {
    ensure_runtime();
    let mut group = c.benchmark_group("mutex");

    let dynamic = RtMutex::new();
    group.bench_function("dynamic_uncontended", |b| {
        b.iter(|| {
            dynamic.lock();
            dynamic.unlock();
        });
    });

    static STATIC: RtMutex = RtMutex::new_static();
    group.bench_function("static_uncontended", |b| {
        b.iter(|| {
            STATIC.lock();
            STATIC.unlock();
        });
    });
    group.finish();
}

fn bench_clock(c: &mut Criterion) {
    ensure_runtime();
    c.bench_function("clock_now", |b| {
        b.iter(|| black_box(rt::now()));
    });
}

fn bench_semaphore(c: &mut Criterion) {
    ensure_runtime();
    let sem = Semaphore::new(0);
    c.bench_function("sem_post_wait", |b| {
        b.iter(|| {
            sem.post();
            sem.wait();
        });
    });
}

fn bench_wake(c: &mut Criterion) {
    ensure_runtime();
    let word = AtomicU32::new(0);
    c.bench_function("wake_all_no_waiters", |b| {
        b.iter(|| rt::wake_all(black_box(&word)));
    });
}

criterion_group!(benches, bench_mutex, bench_clock, bench_semaphore, bench_wake);
criterion_main!(benches);
