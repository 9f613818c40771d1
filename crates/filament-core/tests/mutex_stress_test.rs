//! Mutual-exclusion stress tests for both mutex forms.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};

use filament_core::{self as rt, RtMutex, SpawnOptions};

fn ensure_runtime() {
    static ONCE: Once = Once::new();
    ONCE.call_once(rt::init);
}

/// Non-atomic read-modify-write; only mutual exclusion keeps it exact.
fn bump(counter: &AtomicU64) {
    let value = counter.load(Ordering::Relaxed);
    counter.store(value + 1, Ordering::Relaxed);
}

#[test]
fn dynamic_mutex_counter_is_exact() {
    ensure_runtime();
    const THREADS: usize = 100;
    const INCREMENTS: usize = 1000;

    let mutex = Arc::new(RtMutex::new());
    let counter = Arc::new(AtomicU64::new(0));
    let mut threads = Vec::with_capacity(THREADS);
    for _ in 0..THREADS {
        let mutex = Arc::clone(&mutex);
        let counter = Arc::clone(&counter);
        threads.push(
            rt::spawn(SpawnOptions::default(), move || {
                for _ in 0..INCREMENTS {
                    mutex.lock();
                    bump(&counter);
                    mutex.unlock();
                }
            })
            .unwrap(),
        );
    }
    for thread in threads {
        assert_eq!(thread.join(), Some(()));
    }
    assert_eq!(counter.load(Ordering::Relaxed), (THREADS * INCREMENTS) as u64);
}

#[test]
fn static_mutex_counter_is_exact_before_and_after_materialization() {
    ensure_runtime();
    const THREADS: usize = 8;
    const INCREMENTS: usize = 500;

    static MUTEX: RtMutex = RtMutex::new_static();
    let counter = Arc::new(AtomicU64::new(0));

    for round in 0..2 {
        let mut threads = Vec::with_capacity(THREADS);
        for _ in 0..THREADS {
            let counter = Arc::clone(&counter);
            threads.push(
                rt::spawn(SpawnOptions::default(), move || {
                    for _ in 0..INCREMENTS {
                        MUTEX.lock();
                        bump(&counter);
                        MUTEX.unlock();
                    }
                })
                .unwrap(),
            );
        }
        for thread in threads {
            assert_eq!(thread.join(), Some(()));
        }
        if round == 0 {
            MUTEX.materialize();
        }
    }
    assert_eq!(
        counter.load(Ordering::Relaxed),
        (2 * THREADS * INCREMENTS) as u64
    );
}

#[test]
fn guard_scoped_sections_exclude_each_other() {
    ensure_runtime();
    const THREADS: usize = 16;
    const INCREMENTS: usize = 1000;

    let mutex = Arc::new(RtMutex::new());
    let counter = Arc::new(AtomicU64::new(0));
    let mut threads = Vec::with_capacity(THREADS);
    for _ in 0..THREADS {
        let mutex = Arc::clone(&mutex);
        let counter = Arc::clone(&counter);
        threads.push(
            rt::spawn(SpawnOptions::default(), move || {
                for _ in 0..INCREMENTS {
                    let _guard = mutex.guard();
                    bump(&counter);
                }
            })
            .unwrap(),
        );
    }
    for thread in threads {
        assert_eq!(thread.join(), Some(()));
    }
    assert_eq!(counter.load(Ordering::Relaxed), (THREADS * INCREMENTS) as u64);
}

#[test]
fn try_lock_never_claims_a_held_mutex() {
    ensure_runtime();
    let mutex = Arc::new(RtMutex::new());
    mutex.lock();
    let contender = {
        let mutex = Arc::clone(&mutex);
        rt::spawn(SpawnOptions::default(), move || mutex.try_lock()).unwrap()
    };
    assert_eq!(contender.join(), Some(false));
    mutex.unlock();
}
