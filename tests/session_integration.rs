//! Session behaviour: reconnect backoff, auto-extend, and event streams.

mod common;

use common::{client_for, find_available_port, TestServer};
use lockstep::{Extends, LockOptions, LockstepError, LogKind, SessionEvent};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

/// Wait for the next event matching `predicate`, with a timeout.
async fn wait_for_event(
    rx: &mut broadcast::Receiver<SessionEvent>,
    mut predicate: impl FnMut(&SessionEvent) -> bool,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event stream open");
            if predicate(&event) {
                return;
            }
        }
    })
    .await
    .expect("expected event within timeout");
}

#[tokio::test]
async fn test_reconnect_backoff_schedule() {
    let port = find_available_port();
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

    // No listener yet: the client backs off between attempts.
    let client = client_for(addr);
    let mut rx = client.subscribe();

    let mut delays = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while delays.len() < 5 {
            if let SessionEvent::Log(entry) = rx.recv().await.unwrap() {
                if entry.kind == LogKind::ConnectDelay {
                    delays.push(entry.data["delay"].as_f64().unwrap());
                }
            }
        }
    })
    .await
    .expect("expected connect-delay events");

    // initial 0.05, multiplier 1.5, capped at 0.2.
    let expected = [0.05, 0.075, 0.1125, 0.16875, 0.2];
    for (delay, expected) in delays.iter().zip(expected) {
        assert!(
            (delay - expected).abs() < 1e-9,
            "delays: {delays:?}, expected: {expected:?}"
        );
    }

    // Once the server appears, the session connects and calls go through.
    let _server = TestServer::start_on(addr).await;
    wait_for_event(&mut rx, |e| matches!(e, SessionEvent::Connected)).await;

    let lock_id = client
        .lock("a", &LockOptions::new(10.0, 10.0))
        .await
        .unwrap();
    client.release_lock(&lock_id).await.unwrap();
}

#[tokio::test]
async fn test_auto_extend_keeps_lock_alive() {
    let server = TestServer::start().await;
    let c1 = server.client();
    let c2 = server.client();
    let mut events1 = c1.subscribe();

    let options = LockOptions::new(0.4, 2.0)
        .extend_schedule(0.5)
        .extends(Extends::Count(10));

    let contender = {
        let c2 = c2.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            c2.lock("x", &LockOptions::new(0.4, 0.6)).await
        })
    };

    // The handler outlives the raw ttl several times over.
    let result = c1
        .with_lock("x", &options, |_lock| async move {
            sleep(Duration::from_millis(1000)).await;
            Ok("done")
        })
        .await
        .unwrap();
    assert_eq!(result, "done");

    // The contender saw a continuously-held lock and timed out.
    let err = contender.await.unwrap().unwrap_err();
    assert!(matches!(err, LockstepError::LockingTimeout));

    // Reissued after the handler finished, it succeeds.
    let lock_id = c2.lock("x", &LockOptions::new(0.4, 2.0)).await.unwrap();
    c2.release_lock(&lock_id).await.unwrap();

    // The extender never failed.
    while let Ok(event) = events1.try_recv() {
        if let SessionEvent::Log(entry) = event {
            assert_ne!(entry.kind, LogKind::ExtendLockError);
            assert_ne!(entry.kind, LogKind::ReleaseLockError);
        }
    }
}

#[tokio::test]
async fn test_exhausted_extend_policy_lets_lock_expire() {
    let server = TestServer::start().await;
    let c1 = server.client();
    let c2 = server.client();
    let mut events1 = c1.subscribe();

    // One extension, then the lease is allowed to lapse mid-handler.
    let options = LockOptions::new(0.25, 2.0).extends(Extends::Count(1));

    let waiter = {
        let c2 = c2.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            c2.lock("x", &LockOptions::new(10.0, 3.0)).await
        })
    };

    // The handler keeps running past the lock loss and its result stands.
    let result = c1
        .with_lock("x", &options, |_lock| async move {
            sleep(Duration::from_millis(800)).await;
            Ok("finished")
        })
        .await
        .unwrap();
    assert_eq!(result, "finished");

    // The waiter was granted the resource before the handler ended.
    let lock_id = waiter.await.unwrap().unwrap();
    c2.release_lock(&lock_id).await.unwrap();

    // The cleanup release hit UnknownLock and was swallowed into the log.
    let mut saw_release_error = false;
    while let Ok(event) = events1.try_recv() {
        if let SessionEvent::Log(entry) = event {
            if entry.kind == LogKind::ReleaseLockError {
                saw_release_error = true;
                assert_eq!(entry.data["error"]["name"], "UnknownLock");
            }
        }
    }
    assert!(saw_release_error);
}

#[tokio::test]
async fn test_extend_decision_function_with_custom_ttl() {
    let server = TestServer::start().await;
    let client = server.client();

    // First tick extends with a long custom ttl, second stops.
    let options = LockOptions::new(0.3, 2.0).extends(Extends::Decide(std::sync::Arc::new(
        |attempt| {
            if attempt == 0 {
                lockstep::ExtendDecision::ExtendFor(5.0)
            } else {
                lockstep::ExtendDecision::Stop
            }
        },
    )));

    let result = client
        .with_lock("y", &options, |_lock| async move {
            sleep(Duration::from_millis(600)).await;
            Ok(1)
        })
        .await
        .unwrap();
    assert_eq!(result, 1);

    // The custom extension outlived the handler, so cleanup released it.
    assert_eq!(server.manager.stats().await.held_locks, 0);
}

#[tokio::test]
async fn test_manual_extend_through_lock_handle() {
    let server = TestServer::start().await;
    let client = server.client();

    let options = LockOptions::new(0.3, 2.0);

    let result = client
        .with_lock("z", &options, |lock| async move {
            // Handler keeps the lease alive by hand.
            for _ in 0..3 {
                sleep(Duration::from_millis(100)).await;
                lock.extend(None).await?;
            }
            Ok(lock.id().to_string())
        })
        .await
        .unwrap();
    assert!(!result.is_empty());

    assert_eq!(server.manager.stats().await.held_locks, 0);
}

#[tokio::test]
async fn test_disconnect_event_and_recovery() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client = client_for(addr);
    let mut rx = client.subscribe();

    // Accept the first connection, then slam it shut.
    let (socket, _) = listener.accept().await.unwrap();
    wait_for_event(&mut rx, |e| matches!(e, SessionEvent::Connected)).await;
    drop(socket);
    wait_for_event(&mut rx, |e| matches!(e, SessionEvent::Disconnected)).await;

    // Replace the bare listener with a real server on the same port.
    drop(listener);
    let _server = TestServer::start_on(addr).await;

    // Awaiters of the current connection see the next established one;
    // earlier attempts may race the handover, so retry briefly.
    let lock_id = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.lock("a", &LockOptions::new(10.0, 10.0)).await {
                Ok(lock_id) => return lock_id,
                Err(e) if e.is_connection_error() => {
                    sleep(Duration::from_millis(50)).await;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    })
    .await
    .expect("client should recover");

    client.release_lock(&lock_id).await.unwrap();
}

#[tokio::test]
async fn test_calls_after_close_fail_with_connection_lost() {
    let server = TestServer::start().await;
    let client = server.client();

    let lock_id = client.lock("a", &LockOptions::new(10.0, 10.0)).await.unwrap();
    client.release_lock(&lock_id).await.unwrap();

    client.close().await;

    let err = client
        .lock("a", &LockOptions::new(10.0, 10.0))
        .await
        .unwrap_err();
    assert!(err.is_connection_error(), "got: {err}");
}
