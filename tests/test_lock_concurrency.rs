//! Multi-threaded lock manager and transaction tests.

use curvedb::core::lock_manager::AcquireOutcome;
use curvedb::{EngineOptions, Error, IsolationLevel, LockManager, LockMode, StorageEngine};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const LONG: Duration = Duration::from_secs(5);

#[test]
fn test_exclusive_holders_never_overlap() {
    let _ = env_logger::builder().is_test(true).try_init();
    let locks = Arc::new(LockManager::new(Duration::from_micros(200)));
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (1..=8u64)
        .map(|txn| {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            thread::spawn(move || {
                for _ in 0..20 {
                    assert!(locks.acquire(txn, "counter", LockMode::Exclusive, LONG));
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_micros(50));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    locks.release(txn, Some("counter"));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
}

#[test]
fn test_shared_is_shared_but_blocks_exclusive() {
    let locks = Arc::new(LockManager::default());
    for txn in 1..=5 {
        assert!(locks.acquire(txn, "doc", LockMode::Shared, Duration::from_millis(10)));
    }
    assert_eq!(locks.holders("doc").len(), 5);

    assert!(!locks.acquire(9, "doc", LockMode::Exclusive, Duration::from_millis(30)));

    let waiter = {
        let locks = Arc::clone(&locks);
        thread::spawn(move || locks.acquire(9, "doc", LockMode::Exclusive, LONG))
    };
    thread::sleep(Duration::from_millis(20));
    for txn in 1..=5 {
        locks.release(txn, None);
    }
    assert!(waiter.join().unwrap());
    assert_eq!(locks.holders("doc"), vec![(9, LockMode::Exclusive)]);
}

#[test]
fn test_crossed_requests_deadlock_exactly_once() {
    for _ in 0..10 {
        let locks = Arc::new(LockManager::new(Duration::from_micros(500)));
        assert!(locks.acquire(1, "x", LockMode::Exclusive, LONG));
        assert!(locks.acquire(2, "y", LockMode::Exclusive, LONG));

        let barrier = Arc::new(Barrier::new(2));
        let spawn = |txn: u64, want: &'static str| {
            let locks = Arc::clone(&locks);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let outcome = locks.acquire_detailed(txn, want, LockMode::Exclusive, LONG);
                // The victim aborting is what lets the survivor through.
                locks.release(txn, None);
                outcome
            })
        };

        let a = spawn(1, "y");
        let b = spawn(2, "x");
        let outcomes = [a.join().unwrap(), b.join().unwrap()];

        let deadlocks = outcomes.iter().filter(|o| **o == AcquireOutcome::Deadlock).count();
        let granted = outcomes.iter().filter(|o| **o == AcquireOutcome::Granted).count();
        assert_eq!((deadlocks, granted), (1, 1), "outcomes: {:?}", outcomes);
    }
}

#[test]
fn test_transactions_surface_deadlock_as_error() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(
        StorageEngine::open_with_options(
            dir.path(),
            EngineOptions {
                lock_timeout: LONG,
                sync_on_append: false,
                ..EngineOptions::default()
            },
        )
        .unwrap(),
    );

    let barrier = Arc::new(Barrier::new(2));
    let run = |first: &'static str, second: &'static str| {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            engine.transaction(None, |txn| {
                txn.write(first, None, json!(first))?;
                barrier.wait();
                txn.write(second, None, json!(second))?;
                Ok(())
            })
        })
    };

    let a = run("left", "right");
    let b = run("right", "left");
    let results = [a.join().unwrap(), b.join().unwrap()];

    let deadlocked = results
        .iter()
        .filter(|r| matches!(r, Err(Error::Deadlock { .. })))
        .count();
    let committed = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!((deadlocked, committed), (1, 1), "results: {:?}", results);

    assert!(engine.transactions().active_transactions().is_empty());
    assert!(engine.transactions().committed_value("left").is_some());
    assert!(engine.transactions().committed_value("right").is_some());
}

#[test]
fn test_repeatable_read_blocks_writer_until_commit() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(
        StorageEngine::open_with_options(
            dir.path(),
            EngineOptions {
                lock_timeout: Duration::from_millis(50),
                sync_on_append: false,
                ..EngineOptions::default()
            },
        )
        .unwrap(),
    );

    let mut reader = engine.begin(Some(IsolationLevel::RepeatableRead)).unwrap();
    assert_eq!(reader.read("balance", json!(100)).unwrap(), json!(100));

    let mut writer = engine.begin(None).unwrap();
    let err = writer.write("balance", Some(json!(100)), json!(50)).unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));
    writer.abort().unwrap();

    reader.commit().unwrap();

    let mut writer = engine.begin(None).unwrap();
    writer.write("balance", Some(json!(100)), json!(50)).unwrap();
    writer.commit().unwrap();
    assert_eq!(engine.transactions().committed_value("balance"), Some(json!(50)));
}
