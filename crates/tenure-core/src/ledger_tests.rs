use super::*;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> SyncRelease) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = log.clone();
    let make = move |name: &'static str| -> SyncRelease {
        let l = l.clone();
        Box::new(move || {
            l.lock().push(name);
            Ok(())
        })
    };
    (log, make)
}

#[tokio::test]
async fn test_drain_runs_lifo() {
    let ledger = ResourceLedger::new();
    let (log, make) = recorder();

    ledger.register("a", make("a")).unwrap();
    ledger.register("b", make("b")).unwrap();
    ledger.register("c", make("c")).unwrap();
    assert_eq!(ledger.len(), 3);
    assert_eq!(ledger.labels(), vec!["a", "b", "c"]);

    ledger.drain().await.unwrap();

    assert_eq!(*log.lock(), vec!["c", "b", "a"]);
    assert!(ledger.is_drained());
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn test_failure_does_not_stop_remaining_releases() {
    let ledger = ResourceLedger::new();
    let (log, make) = recorder();

    ledger.register("a", make("a")).unwrap();
    ledger
        .register("b", || Err("b exploded".into()))
        .unwrap();
    ledger.register("c", make("c")).unwrap();

    let err = ledger.drain().await.unwrap_err();

    assert_eq!(*log.lock(), vec!["c", "a"]);
    match err {
        LedgerError::Teardown(aggregate) => {
            assert_eq!(aggregate.labels(), vec!["b"]);
            assert!(aggregate.to_string().contains("b exploded"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_panicking_release_is_collected() {
    let ledger = ResourceLedger::new();
    let (log, make) = recorder();

    ledger.register("a", make("a")).unwrap();
    ledger.defer("boom", || panic!("release panicked")).unwrap();

    let err = ledger.drain().await.unwrap_err();
    assert_eq!(*log.lock(), vec!["a"]);
    assert!(err.to_string().contains("release panicked"));
}

#[tokio::test]
async fn test_second_drain_is_noop() {
    let ledger = ResourceLedger::new();
    let count = Arc::new(AtomicUsize::new(0));

    let c = count.clone();
    ledger
        .defer("counter", move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    ledger.drain().await.unwrap();
    ledger.drain().await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_register_after_drain_fails() {
    let ledger = ResourceLedger::new();
    ledger.drain().await.unwrap();

    let result = ledger.defer("late", || {});
    assert!(matches!(result, Err(LedgerError::AlreadyDrained)));
}

#[tokio::test]
async fn test_async_release_interleaves_with_sync() {
    let ledger = ResourceLedger::new();
    let (log, make) = recorder();

    ledger.register("sync-1", make("sync-1")).unwrap();
    let l = log.clone();
    ledger
        .register_async("async", move || async move {
            tokio::task::yield_now().await;
            l.lock().push("async");
            Ok(())
        })
        .unwrap();
    ledger.register("sync-2", make("sync-2")).unwrap();

    ledger.drain().await.unwrap();
    assert_eq!(*log.lock(), vec!["sync-2", "async", "sync-1"]);
}

#[tokio::test]
async fn test_async_release_panic_is_collected() {
    let ledger = ResourceLedger::new();
    ledger
        .register_async("panics", || async {
            if true {
                panic!("async release panicked");
            }
            Ok(())
        })
        .unwrap();

    let err = ledger.drain().await.unwrap_err();
    assert!(err.to_string().contains("async release panicked"));
}

#[tokio::test]
async fn test_bracket_registers_release_with_acquired_value() {
    let ledger = ResourceLedger::new();
    let released = Arc::new(Mutex::new(None));

    let r = released.clone();
    ledger
        .register_bracket(
            "handle",
            || Ok(42u32),
            move |handle| {
                *r.lock() = Some(handle);
                Ok(())
            },
        )
        .unwrap();
    assert_eq!(ledger.len(), 1);

    ledger.drain().await.unwrap();
    assert_eq!(*released.lock(), Some(42));
}

#[tokio::test]
async fn test_bracket_acquire_failure_registers_nothing() {
    let ledger = ResourceLedger::new();

    let result = ledger.register_bracket(
        "broken",
        || Err::<(), _>("no handle".into()),
        |_| Ok(()),
    );

    assert!(matches!(result, Err(LedgerError::AcquireFailed { .. })));
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn test_bracket_after_drain_skips_acquire() {
    let ledger = ResourceLedger::new();
    ledger.drain().await.unwrap();

    let acquired = Arc::new(AtomicUsize::new(0));
    let a = acquired.clone();
    let result = ledger.register_bracket(
        "late",
        move || {
            a.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        |_| Ok(()),
    );

    assert!(matches!(result, Err(LedgerError::AlreadyDrained)));
    assert_eq!(acquired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_bracket_async() {
    let ledger = ResourceLedger::new();
    let released = Arc::new(AtomicUsize::new(0));

    let r = released.clone();
    ledger
        .register_bracket_async(
            "conn",
            || async { Ok::<_, BoxError>(String::from("conn-1")) },
            move |conn| async move {
                assert_eq!(conn, "conn-1");
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await
        .unwrap();

    ledger.drain().await.unwrap();
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bracket_async_released_when_drain_wins_race() {
    let ledger = Arc::new(ResourceLedger::new());
    let released = Arc::new(AtomicUsize::new(0));
    let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<u32>();

    let l = ledger.clone();
    let r = released.clone();
    let registration = tokio::spawn(async move {
        l.register_bracket_async(
            "socket",
            move || async move {
                let _ = started_tx.send(());
                ready_rx.await.map_err(BoxError::from)
            },
            move |socket| async move {
                assert_eq!(socket, 7);
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await
    });

    started_rx.await.unwrap();
    ledger.drain().await.unwrap();
    ready_tx.send(7).unwrap();

    let result = registration.await.unwrap();
    assert!(matches!(
        result,
        Err(LedgerError::DrainedDuringAcquire { release: None, .. })
    ));
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn test_bracket_released_when_drained_during_acquire() {
    let ledger = ResourceLedger::new();
    let released = Arc::new(AtomicUsize::new(0));

    let r = released.clone();
    let result = ledger.register_bracket(
        "file",
        || {
            futures::executor::block_on(ledger.drain()).unwrap();
            Ok(3u8)
        },
        move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Err("close failed".into())
        },
    );

    match result {
        Err(LedgerError::DrainedDuringAcquire { label, release }) => {
            assert_eq!(label, "file");
            assert_eq!(release.unwrap().to_string(), "close failed");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert!(ledger.is_drained());
}
