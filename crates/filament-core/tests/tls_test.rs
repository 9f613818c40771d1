//! Thread-local slot registry and exit-destructor sweep tests.
//!
//! These tests share the process-wide slot registry and global recording
//! state, so they serialize on one lock (the registry itself is safe for
//! concurrent use; the recorded assertions are not).

use std::sync::{Mutex, MutexGuard, Once};

use filament_core::{self as rt, RuntimeError, SpawnOptions, TlsKey, tls};

fn ensure_runtime() {
    static ONCE: Once = Once::new();
    ONCE.call_once(rt::init);
}

static TEST_LOCK: Mutex<()> = Mutex::new(());
static RECORDED: Mutex<Vec<u64>> = Mutex::new(Vec::new());
static VICTIM: Mutex<Option<TlsKey>> = Mutex::new(None);

fn lock_and_reset() -> MutexGuard<'static, ()> {
    ensure_runtime();
    let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    RECORDED.lock().unwrap().clear();
    *VICTIM.lock().unwrap() = None;
    guard
}

fn record(value: u64) {
    RECORDED.lock().unwrap().push(value);
}

fn record_and_delete_victim(value: u64) {
    record(value);
    if let Some(key) = VICTIM.lock().unwrap().take() {
        tls::delete(key);
    }
}

#[test]
fn exactly_the_set_values_are_destroyed() {
    let _guard = lock_and_reset();
    let first = tls::create(Some(record)).unwrap();
    let second = tls::create(Some(record)).unwrap();
    let third = tls::create(Some(record)).unwrap();

    let thread = rt::spawn(SpawnOptions::default(), move || {
        tls::set(first, 11);
        tls::set(second, 22);
        // third is never set; its destructor must not run.
    })
    .unwrap();
    assert_eq!(thread.join(), Some(()));

    let mut seen = RECORDED.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![11, 22]);

    tls::delete(first);
    tls::delete(second);
    tls::delete(third);
}

#[test]
fn destructor_may_delete_an_unrelated_slot() {
    let _guard = lock_and_reset();
    let victim = tls::create(None).unwrap();
    *VICTIM.lock().unwrap() = Some(victim);
    let key = tls::create(Some(record_and_delete_victim)).unwrap();

    let thread = rt::spawn(SpawnOptions::default(), move || tls::set(key, 7)).unwrap();
    assert_eq!(thread.join(), Some(()));

    assert_eq!(*RECORDED.lock().unwrap(), vec![7]);
    assert!(VICTIM.lock().unwrap().is_none(), "destructor did not run");
    tls::delete(key);
}

#[test]
fn sweep_runs_for_threads_not_spawned_by_the_runtime() {
    let _guard = lock_and_reset();
    let key = tls::create(Some(record)).unwrap();

    std::thread::spawn(move || tls::set(key, 99))
        .join()
        .unwrap();

    assert_eq!(*RECORDED.lock().unwrap(), vec![99]);
    tls::delete(key);
}

#[test]
fn cancelled_thread_still_runs_destructors() {
    let _guard = lock_and_reset();
    let key = tls::create(Some(record)).unwrap();
    let sem = std::sync::Arc::new(rt::Semaphore::new(0));

    let thread = {
        let sem = std::sync::Arc::clone(&sem);
        rt::spawn(SpawnOptions::default(), move || {
            tls::set(key, 5);
            sem.wait();
        })
        .unwrap()
    };
    std::thread::sleep(std::time::Duration::from_millis(50));
    thread.request_cancel();
    assert_eq!(thread.join(), None);

    assert_eq!(*RECORDED.lock().unwrap(), vec![5]);
    tls::delete(key);
}

#[test]
fn slots_without_destructor_are_ignored_by_the_sweep() {
    let _guard = lock_and_reset();
    let key = tls::create(None).unwrap();

    let thread = rt::spawn(SpawnOptions::default(), move || tls::set(key, 123)).unwrap();
    assert_eq!(thread.join(), Some(()));

    assert!(RECORDED.lock().unwrap().is_empty());
    tls::delete(key);
}

#[test]
fn registry_exhaustion_is_reported_not_fatal() {
    let _guard = lock_and_reset();
    let mut keys = Vec::new();
    loop {
        match tls::create(None) {
            Ok(key) => keys.push(key),
            Err(RuntimeError::TlsExhausted) => break,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(keys.len() <= tls::TLS_SLOTS_MAX);
    assert!(!keys.is_empty());
    for key in keys {
        tls::delete(key);
    }
}
