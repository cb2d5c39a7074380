
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use build_coordinator::error::CoordError;
use build_coordinator::lock::{LockDocument, LockFactory};
use build_coordinator::store::{MemoryRepository, Repository};
use tokio_util::sync::CancellationToken;

use test_harness::{assert_eventually, test_lock_factory};

async fn document(repo: &MemoryRepository<LockDocument>, id: &str) -> LockDocument {
    repo.get(&|d: &LockDocument| d.id == id)
        .await
        .unwrap()
        .expect("lock document exists")
}

async fn queue_len(repo: &MemoryRepository<LockDocument>, id: &str) -> usize {
    repo.get(&|d: &LockDocument| d.id == id)
        .await
        .unwrap()
        .map_or(0, |d| d.writer_queue.len())
}

#[tokio::test]
async fn test_writers_are_mutually_exclusive() {
    let repo = MemoryRepository::new();
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..50 {
        // Spread the writers over several hosts sharing one store.
        let factory = test_lock_factory(&format!("host{}", i % 5), &repo);
        let inside = inside.clone();
        let max_inside = max_inside.clone();
        let completed = completed.clone();
        handles.push(tokio::spawn(async move {
            factory
                .get("engine1")
                .with_writer_lock(None, &CancellationToken::new(), || async {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    // Read-modify-write split by a yield: loses updates
                    // unless the section is exclusive.
                    let seen = completed.load(Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    completed.store(seen + 1, Ordering::SeqCst);
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
        }));
    }

    let results = tokio::time::timeout(
        Duration::from_secs(30),
        futures::future::join_all(handles),
    )
    .await
    .expect("writers finished in time");
    for result in results {
        result.unwrap().unwrap();
    }

    assert_eq!(completed.load(Ordering::SeqCst), 50);
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);

    let doc = document(&repo, "engine1").await;
    assert!(doc.writer_lock.is_none());
    assert!(doc.writer_queue.is_empty());
}

#[tokio::test]
async fn test_readers_hold_concurrently_and_block_writer() {
    let repo = MemoryRepository::new();
    let factory = test_lock_factory("h1", &repo);
    let lock = factory.get("engine1");
    let cancel = CancellationToken::new();

    let r1 = lock.reader_lock(None, &cancel).await.unwrap();
    let r2 = lock.reader_lock(None, &cancel).await.unwrap();
    assert_eq!(document(&repo, "engine1").await.reader_locks.len(), 2);

    let writer_lock = lock.clone();
    let writer = tokio::spawn(async move {
        writer_lock
            .writer_lock(None, &CancellationToken::new())
            .await
    });

    assert_eventually(
        || async { queue_len(&repo, "engine1").await == 1 },
        Duration::from_secs(2),
        "writer should queue behind readers",
    )
    .await;
    assert!(!writer.is_finished());

    r1.release().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!writer.is_finished(), "one reader still holds the lock");

    r2.release().await.unwrap();
    let guard = tokio::time::timeout(Duration::from_secs(2), writer)
        .await
        .expect("writer acquired after readers left")
        .unwrap()
        .unwrap();

    let doc = document(&repo, "engine1").await;
    assert_eq!(
        doc.writer_lock.as_ref().map(|l| l.lock_id.as_str()),
        Some(guard.lock_id())
    );
    assert!(doc.writer_queue.is_empty());
    guard.release().await.unwrap();
}

#[tokio::test]
async fn test_queued_writer_blocks_new_readers() {
    let repo = MemoryRepository::new();
    let factory = test_lock_factory("h1", &repo);
    let lock = factory.get("engine1");
    let cancel = CancellationToken::new();

    let r1 = lock.reader_lock(None, &cancel).await.unwrap();

    let writer_lock = lock.clone();
    let writer = tokio::spawn(async move {
        writer_lock
            .writer_lock(None, &CancellationToken::new())
            .await
    });
    assert_eventually(
        || async { queue_len(&repo, "engine1").await == 1 },
        Duration::from_secs(2),
        "writer should queue",
    )
    .await;

    // A late reader must not overtake the queued writer.
    let reader_lock = lock.clone();
    let late_reader = tokio::spawn(async move {
        reader_lock
            .reader_lock(None, &CancellationToken::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!late_reader.is_finished());

    r1.release().await.unwrap();
    let w = tokio::time::timeout(Duration::from_secs(2), writer)
        .await
        .expect("writer acquired first")
        .unwrap()
        .unwrap();
    assert!(!late_reader.is_finished());

    w.release().await.unwrap();
    let r2 = tokio::time::timeout(Duration::from_secs(2), late_reader)
        .await
        .expect("reader acquired after the writer")
        .unwrap()
        .unwrap();
    r2.release().await.unwrap();
}

#[tokio::test]
async fn test_writers_are_served_in_arrival_order_before_late_readers() {
    let repo = MemoryRepository::new();
    let factory = test_lock_factory("h1", &repo);
    let lock = factory.get("engine1");
    let order = Arc::new(Mutex::new(Vec::new()));

    let holder = lock
        .writer_lock(None, &CancellationToken::new())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 1..=3 {
        let lock = lock.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            lock.with_writer_lock(None, &CancellationToken::new(), || async {
                order.lock().unwrap().push(i);
                Ok(())
            })
            .await
        }));
        // Wait for this writer to be queued before starting the next one.
        let expected = i;
        assert_eventually(
            || async { queue_len(&repo, "engine1").await == expected },
            Duration::from_secs(2),
            "writer should join the queue",
        )
        .await;
    }

    // A reader arriving now must wait for every queued writer.
    let reader = {
        let lock = lock.clone();
        let order = order.clone();
        tokio::spawn(async move {
            lock.with_reader_lock(None, &CancellationToken::new(), || async {
                order.lock().unwrap().push(0);
                Ok(())
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    holder.release().await.unwrap();
    handles.push(reader);
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("lock holder finished in time")
            .unwrap()
            .unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 0]);
}

#[tokio::test]
async fn test_with_writer_lock_releases_on_error() {
    let repo = MemoryRepository::new();
    let factory = test_lock_factory("h1", &repo);
    let lock = factory.get("engine1");

    let result: Result<(), CoordError> = lock
        .with_writer_lock(None, &CancellationToken::new(), || async {
            Err(CoordError::Internal("boom".into()))
        })
        .await;
    assert!(matches!(result, Err(CoordError::Internal(_))));

    let doc = document(&repo, "engine1").await;
    assert!(doc.writer_lock.is_none());

    // Immediately available again.
    let guard = tokio::time::timeout(
        Duration::from_millis(500),
        lock.writer_lock(None, &CancellationToken::new()),
    )
    .await
    .expect("lock free after failed section")
    .unwrap();
    guard.release().await.unwrap();
}

#[tokio::test]
async fn test_dropped_guard_releases_lease() {
    let repo = MemoryRepository::new();
    let factory = test_lock_factory("h1", &repo);
    let lock = factory.get("engine1");

    let guard = lock
        .writer_lock(None, &CancellationToken::new())
        .await
        .unwrap();
    drop(guard);

    assert_eventually(
        || async { document(&repo, "engine1").await.writer_lock.is_none() },
        Duration::from_secs(2),
        "dropped guard should release its lease",
    )
    .await;
}

#[tokio::test]
async fn test_cancelled_writer_leaves_queue() {
    let repo = MemoryRepository::new();
    let factory = test_lock_factory("h1", &repo);
    let lock = factory.get("engine1");

    let holder = lock
        .writer_lock(None, &CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let waiter_lock = lock.clone();
    let waiter_cancel = cancel.clone();
    let waiter =
        tokio::spawn(async move { waiter_lock.writer_lock(None, &waiter_cancel).await });
    assert_eventually(
        || async { queue_len(&repo, "engine1").await == 1 },
        Duration::from_secs(2),
        "waiter should queue",
    )
    .await;

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("cancelled waiter returns")
        .unwrap();
    assert!(matches!(result, Err(CoordError::Cancelled)));
    assert_eq!(queue_len(&repo, "engine1").await, 0);

    // The next writer is not stuck behind the abandoned slot.
    holder.release().await.unwrap();
    let next = tokio::time::timeout(
        Duration::from_millis(500),
        lock.writer_lock(None, &CancellationToken::new()),
    )
    .await
    .expect("next writer acquires")
    .unwrap();
    next.release().await.unwrap();
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed() {
    let repo = MemoryRepository::new();
    let crashed = test_lock_factory("crashed-host", &repo);
    let survivor = test_lock_factory("survivor", &repo);

    let guard = crashed
        .get("engine1")
        .writer_lock(Some(Duration::from_millis(200)), &CancellationToken::new())
        .await
        .unwrap();
    // Simulate a crash: the guard never runs its release.
    std::mem::forget(guard);

    let started = tokio::time::Instant::now();
    let guard = tokio::time::timeout(
        Duration::from_secs(3),
        survivor
            .get("engine1")
            .writer_lock(None, &CancellationToken::new()),
    )
    .await
    .expect("expired lease should not block forever")
    .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));

    let doc = document(&repo, "engine1").await;
    assert_eq!(
        doc.writer_lock.as_ref().map(|l| l.host_id.as_str()),
        Some("survivor")
    );
    guard.release().await.unwrap();
}

#[tokio::test]
async fn test_init_recovers_locks_of_previous_run() {
    let repo = MemoryRepository::new();
    let before_crash = test_lock_factory("h1", &repo);
    before_crash.create("engine1").await.unwrap();
    before_crash.create("engine2").await.unwrap();

    std::mem::forget(
        before_crash
            .get("engine1")
            .writer_lock(None, &CancellationToken::new())
            .await
            .unwrap(),
    );
    std::mem::forget(
        before_crash
            .get("engine2")
            .reader_lock(None, &CancellationToken::new())
            .await
            .unwrap(),
    );

    let other = test_lock_factory("h2", &repo);
    let unrelated = other
        .get("engine2")
        .reader_lock(None, &CancellationToken::new())
        .await
        .unwrap();

    // Same host id, new process.
    let restarted: LockFactory = test_lock_factory("h1", &repo);
    assert_eq!(restarted.init().await.unwrap(), 2);

    let engine1 = document(&repo, "engine1").await;
    assert!(engine1.writer_lock.is_none());
    let engine2 = document(&repo, "engine2").await;
    assert_eq!(engine2.reader_locks.len(), 1);
    assert_eq!(engine2.reader_locks[0].host_id, "h2");

    let guard = tokio::time::timeout(
        Duration::from_millis(500),
        other
            .get("engine1")
            .writer_lock(None, &CancellationToken::new()),
    )
    .await
    .expect("recovered lock is free")
    .unwrap();
    guard.release().await.unwrap();
    unrelated.release().await.unwrap();
}
