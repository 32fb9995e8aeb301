use super::*;
use crate::error::OperationCancelled;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tokio::sync::{Notify, oneshot};

/// A command whose body blocks until `gate` is notified or its token fires.
fn gated(gate: Arc<Notify>) -> AsyncCommand<()> {
    AsyncCommand::builder("gated").build(move |(), token: CancellationToken| {
        let gate = gate.clone();
        async move {
            tokio::select! {
                _ = gate.notified() => Ok(()),
                _ = token.cancelled() => Err(BoxError::from(OperationCancelled)),
            }
        }
    })
}

#[tokio::test]
async fn test_execute_completes() {
    let runs = Arc::new(AtomicUsize::new(0));
    let r = runs.clone();
    let command = AsyncCommand::builder("count").build(move |step: usize, _token| {
        let r = r.clone();
        async move {
            r.fetch_add(step, Ordering::SeqCst);
            Ok(())
        }
    });

    let outcome = command.execute(3).unwrap().await.unwrap();

    assert_eq!(outcome, CommandOutcome::Completed);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert!(!command.is_executing());
}

#[tokio::test]
async fn test_at_most_one_rejects_second_execute() {
    let gate = Arc::new(Notify::new());
    let command = gated(gate.clone());

    let first = command.execute(()).unwrap();
    assert!(command.is_executing());
    assert!(!command.can_execute(&()));

    let second = command.execute(());
    assert!(matches!(
        second,
        Err(CommandError::Rejected {
            reason: RejectReason::Busy,
            ..
        })
    ));

    gate.notify_one();
    assert_eq!(first.await.unwrap(), CommandOutcome::Completed);
    assert!(!command.is_executing());
    assert!(command.can_execute(&()));
}

#[tokio::test]
async fn test_unbounded_tracks_every_invocation() {
    let command = AsyncCommand::builder("fan-out")
        .unbounded()
        .build(|release: oneshot::Receiver<()>, _token| async move {
            let _ = release.await;
            Ok(())
        });

    let (release_a, rx_a) = oneshot::channel();
    let (release_b, rx_b) = oneshot::channel();
    let a = command.execute(rx_a).unwrap();
    let b = command.execute(rx_b).unwrap();

    assert_eq!(command.in_flight(), 2);
    assert!(matches!(
        command.current_token(),
        Err(CommandError::AmbiguousToken { in_flight: 2, .. })
    ));

    release_a.send(()).unwrap();
    a.await.unwrap();
    assert!(command.is_executing());
    assert!(command.current_token().is_ok());

    release_b.send(()).unwrap();
    b.await.unwrap();
    assert!(!command.is_executing());
}

#[tokio::test]
async fn test_cancel_yields_cancelled_outcome() {
    let gate = Arc::new(Notify::new());
    let command = gated(gate);

    let handle = command.execute(()).unwrap();
    command.cancel();

    assert_eq!(handle.await.unwrap(), CommandOutcome::Cancelled);
    assert!(!command.is_executing());
}

#[tokio::test]
async fn test_cancel_without_invocations_is_noop() {
    let command = gated(Arc::new(Notify::new()));
    command.cancel();
    command.cancel();
    assert!(!command.is_executing());
}

#[tokio::test]
async fn test_failure_and_panic_clear_executing() {
    let failing = AsyncCommand::builder("failing")
        .build(|(), _token| async { Err::<(), BoxError>("bad input".into()) });
    assert_eq!(
        failing.execute_async(()).await.unwrap(),
        CommandOutcome::Failed
    );
    assert!(!failing.is_executing());

    let panicking = AsyncCommand::builder("panicking").build(|(), _token| async {
        if true {
            panic!("body panicked");
        }
        Ok(())
    });
    assert_eq!(
        panicking.execute(()).unwrap().await.unwrap(),
        CommandOutcome::Failed
    );
    assert!(!panicking.is_executing());
}

#[tokio::test]
async fn test_predicate_gates_execution() {
    let command = AsyncCommand::builder("positive")
        .can_execute(|n: &i32| *n > 0)
        .build(|_n: i32, _token| async { Ok(()) });

    assert!(command.can_execute(&1));
    assert!(!command.can_execute(&-1));
    assert!(matches!(
        command.execute(-1),
        Err(CommandError::Rejected {
            reason: RejectReason::Predicate,
            ..
        })
    ));
}

#[tokio::test]
async fn test_invocation_scope_is_child_of_parent_scope() {
    let parent = CancellationScope::new_root();
    let command = AsyncCommand::builder("scoped")
        .within(&parent)
        .build(|(), token: CancellationToken| async move {
            token.cancelled().await;
            Err(BoxError::from(OperationCancelled))
        });

    let handle = command.execute(()).unwrap();
    parent.cancel();
    assert_eq!(handle.await.unwrap(), CommandOutcome::Cancelled);
}

#[tokio::test]
async fn test_current_token_not_executing() {
    let command = gated(Arc::new(Notify::new()));
    assert!(matches!(
        command.current_token(),
        Err(CommandError::NotExecuting(_))
    ));
}

#[tokio::test]
async fn test_wait_until_idle() {
    let gate = Arc::new(Notify::new());
    let command = gated(gate.clone());
    let token = CancellationToken::new();

    // Idle commands return immediately, even with a cancelled token.
    let cancelled = CancellationToken::new();
    cancelled.cancel();
    command.wait_until_idle(&cancelled).await.unwrap();

    let handle = command.execute(()).unwrap();
    let waiter = {
        let command = command.clone();
        let token = token.clone();
        tokio::spawn(async move { command.wait_until_idle(&token).await })
    };
    tokio::task::yield_now().await;
    assert!(!waiter.is_finished());

    gate.notify_one();
    handle.await.unwrap();
    waiter.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_wait_until_idle_cancelled() {
    let command = gated(Arc::new(Notify::new()));
    let _handle = command.execute(()).unwrap();

    let token = CancellationToken::new();
    let t = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        t.cancel();
    });

    let result = command.wait_until_idle(&token).await;
    assert!(matches!(result, Err(CommandError::Cancelled)));
    assert!(command.is_executing());
    command.cancel();
}

#[tokio::test]
async fn test_executing_notifications() {
    let gate = Arc::new(Notify::new());
    let command = gated(gate.clone());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let s = seen.clone();
    command.notifier().subscribe(move |change| {
        s.lock().push((change.property.clone(), change.value));
    });

    let handle = command.execute(()).unwrap();
    gate.notify_one();
    handle.await.unwrap();

    let property = Property::IsExecuting("gated".to_string());
    assert_eq!(
        *seen.lock(),
        vec![(property.clone(), true), (property, false)]
    );
}

#[tokio::test]
async fn test_abort_clears_executing() {
    let command = AsyncCommand::builder("stuck").build(|(), _token| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    });

    let handle = command.execute(()).unwrap();
    tokio::task::yield_now().await;
    assert!(command.is_executing());

    handle.abort();
    let _ = handle.await;
    assert!(!command.is_executing());
}

#[test]
fn test_execute_without_runtime() {
    let command = gated(Arc::new(Notify::new()));
    assert!(matches!(
        command.execute(()),
        Err(CommandError::NoRuntime(_))
    ));
    assert!(!command.is_executing());
}
