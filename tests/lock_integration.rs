//! End-to-end lock service scenarios over real TCP connections.

mod common;

use common::TestServer;
use lockstep::{LockOptions, LockstepError, LogKind, SessionEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::sleep;

/// Collect error-kind log entries already sitting in an event receiver.
fn drain_error_kinds(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<LogKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SessionEvent::Log(entry) = event {
            if matches!(
                entry.kind,
                LogKind::ConnectError
                    | LogKind::ConnectionError
                    | LogKind::ExtendLockError
                    | LogKind::ReleaseLockError
            ) {
                kinds.push(entry.kind);
            }
        }
    }
    kinds
}

#[tokio::test]
async fn test_simple_fifo_handover() {
    let server = TestServer::start().await;
    let c1 = server.client();
    let c2 = server.client();
    let mut events1 = c1.subscribe();
    let mut events2 = c2.subscribe();

    let options = LockOptions::new(10.0, 10.0);

    let first = c1.lock("a", &options).await.unwrap();

    let pending = {
        let c2 = c2.clone();
        let options = options.clone();
        tokio::spawn(async move { c2.lock("a", &options).await })
    };
    sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    c1.release_lock(&first).await.unwrap();

    let second = pending.await.unwrap().unwrap();
    assert_ne!(first, second);

    assert!(drain_error_kinds(&mut events1).is_empty());
    assert!(drain_error_kinds(&mut events2).is_empty());
}

#[tokio::test]
async fn test_locking_timeout_leaves_holder_untouched() {
    let server = TestServer::start().await;
    let c1 = server.client();
    let c2 = server.client();

    let held = c1.lock("a", &LockOptions::new(10.0, 10.0)).await.unwrap();

    let start = Instant::now();
    let err = c2
        .lock("a", &LockOptions::new(10.0, 0.3))
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, LockstepError::LockingTimeout));
    assert!(elapsed >= Duration::from_millis(250), "elapsed: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(900), "elapsed: {elapsed:?}");

    let stats = server.manager.stats().await;
    assert_eq!(stats.held_locks, 1);

    c1.release_lock(&held).await.unwrap();
}

#[tokio::test]
async fn test_multi_resource_deadlock_avoidance() {
    let server = TestServer::start().await;
    let c1 = server.client();
    let c2 = server.client();

    let options = LockOptions::new(10.0, 10.0);

    let first = c1.lock(["a", "b"], &options).await.unwrap();

    // Opposite declaration order must not deadlock.
    let pending = {
        let c2 = c2.clone();
        let options = options.clone();
        tokio::spawn(async move { c2.lock(["b", "a"], &options).await })
    };
    sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    c1.release_lock(&first).await.unwrap();
    let second = pending.await.unwrap().unwrap();

    c2.release_lock(&second).await.unwrap();
}

#[tokio::test]
async fn test_fifo_grant_order_matches_arrival_order() {
    let server = TestServer::start().await;
    let holder = server.client();

    let held = holder
        .lock("r", &LockOptions::new(10.0, 10.0))
        .await
        .unwrap();

    let (grants_tx, mut grants_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut waiter_clients = Vec::new();
    let mut waiters = Vec::new();
    for i in 0..3u32 {
        let client = server.client();
        let grants_tx = grants_tx.clone();
        waiter_clients.push(client.clone());
        waiters.push(tokio::spawn(async move {
            let lock_id = client.lock("r", &LockOptions::new(10.0, 30.0)).await.unwrap();
            grants_tx.send(i).unwrap();
            client.release_lock(&lock_id).await.unwrap();
        }));
        // Space out arrivals so queue order is deterministic.
        sleep(Duration::from_millis(60)).await;
    }

    holder.release_lock(&held).await.unwrap();
    for waiter in waiters {
        waiter.await.unwrap();
    }

    let mut order = Vec::new();
    while let Ok(i) = grants_rx.try_recv() {
        order.push(i);
    }
    assert_eq!(order, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_mutual_exclusion_under_contention() {
    let server = TestServer::start().await;

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for _ in 0..4 {
        let client = server.client();
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        workers.push(tokio::spawn(async move {
            for _ in 0..3 {
                client
                    .with_lock("counter", &LockOptions::new(10.0, 30.0), |_lock| {
                        let current = Arc::clone(&current);
                        let peak = Arc::clone(&peak);
                        async move {
                            let inside = current.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(inside, Ordering::SeqCst);
                            sleep(Duration::from_millis(10)).await;
                            current.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        }
                    })
                    .await
                    .unwrap();
            }
        }));
    }

    for worker in workers {
        worker.await.unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(server.manager.stats().await.held_locks, 0);
}

#[tokio::test]
async fn test_owner_isolation_across_connections() {
    let server = TestServer::start().await;
    let c1 = server.client();
    let c2 = server.client();

    let lock_id = c1.lock("a", &LockOptions::new(10.0, 10.0)).await.unwrap();

    let err = c2.release_lock(&lock_id).await.unwrap_err();
    assert!(matches!(err, LockstepError::NotOwner(_)));
    let err = c2.extend_lock(&lock_id, None).await.unwrap_err();
    assert!(matches!(err, LockstepError::NotOwner(_)));

    // The rejected calls did not mutate the lock.
    assert_eq!(server.manager.stats().await.held_locks, 1);
    c1.release_lock(&lock_id).await.unwrap();
}

#[tokio::test]
async fn test_ttl_expiry_hands_lock_to_waiter() {
    let server = TestServer::start().await;
    let c1 = server.client();
    let c2 = server.client();

    let expiring = c1.lock("a", &LockOptions::new(0.2, 10.0)).await.unwrap();

    // The waiter is granted within the holder's ttl, no release needed.
    let start = Instant::now();
    let lock_id = c2.lock("a", &LockOptions::new(10.0, 2.0)).await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(1500));

    // The expired id is gone: exactly one release accepts an id.
    let err = c1.release_lock(&expiring).await.unwrap_err();
    assert!(matches!(err, LockstepError::UnknownLock(_)));

    c2.release_lock(&lock_id).await.unwrap();
    let err = c2.release_lock(&lock_id).await.unwrap_err();
    assert!(matches!(err, LockstepError::UnknownLock(_)));
}

#[tokio::test]
async fn test_disconnect_releases_locks() {
    let server = TestServer::start().await;
    let c1 = server.client();
    let c2 = server.client();

    c1.lock("r", &LockOptions::new(30.0, 10.0)).await.unwrap();

    let pending = {
        let c2 = c2.clone();
        tokio::spawn(async move { c2.lock("r", &LockOptions::new(10.0, 30.0)).await })
    };
    sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    // Closing c1's connection must free the resource long before its ttl.
    let start = Instant::now();
    c1.close().await;

    let lock_id = pending.await.unwrap().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));

    c2.release_lock(&lock_id).await.unwrap();
}

#[tokio::test]
async fn test_disconnect_cancels_pending_acquisition() {
    let server = TestServer::start().await;
    let c1 = server.client();
    let c2 = server.client();

    let held = c1.lock("r", &LockOptions::new(10.0, 10.0)).await.unwrap();

    let pending = {
        let c2 = c2.clone();
        tokio::spawn(async move { c2.lock("r", &LockOptions::new(10.0, 30.0)).await })
    };
    sleep(Duration::from_millis(50)).await;

    // The waiter's own connection goes away; its in-flight call fails.
    c2.close().await;
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, LockstepError::ConnectionLost));

    // The holder is unaffected and the queue is clean.
    sleep(Duration::from_millis(50)).await;
    let stats = server.manager.stats().await;
    assert_eq!(stats.held_locks, 1);
    assert_eq!(stats.waiting_acquisitions, 0);

    c1.release_lock(&held).await.unwrap();
}

#[tokio::test]
async fn test_invalid_requests_over_the_wire() {
    let server = TestServer::start().await;
    let client = server.client();

    let err = client
        .lock(Vec::<String>::new(), &LockOptions::new(10.0, 10.0))
        .await
        .unwrap_err();
    assert!(matches!(err, LockstepError::InvalidRequest(_)));

    let err = client
        .lock("a", &LockOptions::new(0.0, 10.0))
        .await
        .unwrap_err();
    assert!(matches!(err, LockstepError::InvalidRequest(_)));

    let err = client.release_lock("no-such-lock").await.unwrap_err();
    assert!(matches!(err, LockstepError::UnknownLock(_)));
}

#[tokio::test]
async fn test_single_resource_id_is_normalized() {
    let server = TestServer::start().await;
    let c1 = server.client();
    let c2 = server.client();

    // "a" as a plain id and ["a"] as a set contend for the same resource.
    let held = c1.lock("a", &LockOptions::new(10.0, 10.0)).await.unwrap();
    let err = c2
        .lock(["a"], &LockOptions::new(10.0, 0.1))
        .await
        .unwrap_err();
    assert!(matches!(err, LockstepError::LockingTimeout));

    c1.release_lock(&held).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_calls_share_one_connection() {
    let server = TestServer::start().await;
    let client = server.client();

    // In-flight requests on one connection interleave; ids correlate them.
    let mut tasks = Vec::new();
    for i in 0..8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let resource = format!("r{}", i);
            let lock_id = client
                .lock(resource, &LockOptions::new(10.0, 10.0))
                .await
                .unwrap();
            client.release_lock(&lock_id).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stats = server.manager.stats().await;
    assert_eq!(stats.acquired, 8);
    assert_eq!(stats.held_locks, 0);
}
