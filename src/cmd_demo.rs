//! `demo` subcommand.
//!
//! Builds one component on a dispatcher thread, gives it a few sleeping
//! commands and ledger-tracked resources, disposes it while the commands are
//! still running and prints what teardown did.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use tenure_core::{
    AsyncCommand, BoxError, CancellationToken, CommandOutcome, Component, Dispatcher,
    LifecycleResult, NoHooks, OperationCancelled,
};

use crate::cli::DemoArgs;

type Releases = Arc<Mutex<Vec<String>>>;

struct Running {
    component: Component,
    invocations: Vec<(String, JoinHandle<CommandOutcome>)>,
}

/// Handle the `demo` subcommand.
pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), Box<dyn std::error::Error>> {
    let dispatcher = Dispatcher::spawn("tenure-demo")?;
    let releases: Releases = Arc::new(Mutex::new(Vec::new()));

    let setup = args.clone();
    let log = releases.clone();
    let running = dispatcher
        .invoke(move || async move { start(setup, log).await })
        .await??;
    info!(
        component = %running.component.label(),
        invocations = running.invocations.len(),
        "Commands started"
    );

    tokio::time::sleep(Duration::from_millis(args.dispose_after_ms)).await;

    let component = running.component.clone();
    let started = Instant::now();
    let disposed = dispatcher
        .invoke(move || async move { component.dispose().await })
        .await?;
    let elapsed = started.elapsed();

    // Collected before shutdown; dropping the dispatcher runtime would cancel them.
    let mut outcomes = Vec::with_capacity(running.invocations.len());
    for (name, handle) in running.invocations {
        let outcome = match handle.await {
            Ok(outcome) => format!("{outcome:?}"),
            Err(err) => format!("join error: {err}"),
        };
        outcomes.push((name, outcome));
    }

    println!("component: {}", running.component.label());
    println!("state:     {:?}", running.component.state());
    match &disposed {
        Ok(()) => println!("dispose:   ok in {elapsed:?}"),
        Err(err) => println!("dispose:   failed in {elapsed:?}: {err}"),
    }
    println!("releases:");
    for label in releases.lock().iter() {
        println!("  {label}");
    }
    println!("commands:");
    for (name, outcome) in &outcomes {
        println!("  {name}: {outcome}");
    }

    dispatcher.shutdown().await?;
    Ok(())
}

/// Runs on the dispatcher thread, which becomes the component's owner.
async fn start(args: DemoArgs, releases: Releases) -> LifecycleResult<Running> {
    let component = Component::builder().name("demo").build(NoHooks);
    let work = Duration::from_millis(args.work_ms);

    for i in 0..args.commands {
        let label = format!("resource-{i}");
        let released = label.clone();
        let log = releases.clone();
        component
            .ledger()
            .defer(label, move || log.lock().push(released))?;
    }

    component.on_disposing("demo", |component: Component| async move {
        info!(component = %component.label(), "Disposal started");
        Ok::<(), BoxError>(())
    })?;

    let mut commands = Vec::with_capacity(args.commands);
    for i in 0..args.commands {
        let name = format!("work-{i}");
        let mut builder = AsyncCommand::<()>::builder(name.clone());
        if args.unbounded {
            builder = builder.unbounded();
        }
        // Even commands stop on cancellation, odd ones run to completion.
        let cooperative = i % 2 == 0;
        let command = component.register_command(
            builder,
            move |(), token: CancellationToken| async move {
                if cooperative {
                    tokio::select! {
                        _ = token.cancelled() => Err(BoxError::from(OperationCancelled)),
                        _ = tokio::time::sleep(work) => Ok(()),
                    }
                } else {
                    tokio::time::sleep(work).await;
                    Ok(())
                }
            },
        )?;
        commands.push((name, command));
    }

    component.initialize(CancellationToken::new()).await?;

    let runs = if args.unbounded { 2 } else { 1 };
    let mut invocations = Vec::with_capacity(commands.len() * runs);
    for (name, command) in &commands {
        for _ in 0..runs {
            invocations.push((name.clone(), command.execute(())?));
        }
    }

    Ok(Running {
        component,
        invocations,
    })
}
