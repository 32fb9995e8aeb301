//! Cancellable asynchronous commands.
//!
//! An [`AsyncCommand`] wraps an async body. Every invocation runs under its
//! own child [`CancellationScope`], and the command tracks whether any
//! invocation is in flight (`is_executing`). That flag is published three
//! ways: a `watch` channel for waiters, the command's own
//! [`ChangeNotifier`], and the owning component's notifier.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span};
use uuid::Uuid;

use crate::affinity::AffinityViolation;
use crate::error::{BoxError, CommandError, Panicked, RejectReason, is_cancellation};
use crate::notify::{ChangeNotifier, Property, PropertyChange};
use crate::scope::CancellationScope;

/// How many invocations may be in flight at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyPolicy {
    /// A second `execute` while one is running is rejected.
    #[default]
    AtMostOne,
    /// Any number of concurrent invocations.
    Unbounded,
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Completed,
    /// The body stopped because its token fired.
    Cancelled,
    /// The body failed or panicked; the error went to `on_error`.
    Failed,
}

/// What a command needs from the component that owns it.
pub(crate) trait CommandHost: Send + Sync {
    fn is_usable(&self) -> bool;
    fn verify_access(&self) -> Result<(), AffinityViolation>;
    fn notify(&self, change: PropertyChange);
    fn report_error(self: Arc<Self>, error: &BoxError, command: &str);
}

/// Type-erased view of a command, used by the registry and the component.
pub trait TrackedCommand: Send + Sync {
    fn command_id(&self) -> Uuid;
    fn name(&self) -> &str;
    fn policy(&self) -> ConcurrencyPolicy;
    fn is_executing(&self) -> bool;
    /// Number of invocations currently in flight.
    fn in_flight(&self) -> usize;
    /// Cancel every in-flight invocation. Idempotent.
    fn cancel(&self);
    fn current_token(&self) -> Result<CancellationToken, CommandError>;
    fn subscribe_executing(&self) -> watch::Receiver<bool>;
    fn notifier(&self) -> &ChangeNotifier;
}

/// Wait until `command` is idle, or fail once `token` is cancelled.
///
/// Returns immediately when the command is not executing.
pub async fn wait_until_idle(
    command: &dyn TrackedCommand,
    token: &CancellationToken,
) -> Result<(), CommandError> {
    let mut executing = command.subscribe_executing();
    if !*executing.borrow_and_update() {
        return Ok(());
    }
    if token.is_cancelled() {
        return Err(CommandError::Cancelled);
    }

    tokio::select! {
        biased;
        idle = executing.wait_for(|running| !*running) => {
            // A closed channel means the command itself is gone.
            drop(idle);
            Ok(())
        }
        _ = token.cancelled() => Err(CommandError::Cancelled),
    }
}

type Body<P> =
    Arc<dyn Fn(P, CancellationToken) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;
pub(crate) type Predicate<P> = Arc<dyn Fn(&P) -> bool + Send + Sync>;

/// Builder for [`AsyncCommand`].
pub struct CommandBuilder<P> {
    name: String,
    policy: ConcurrencyPolicy,
    scope: Option<CancellationScope>,
    host: Option<Weak<dyn CommandHost>>,
    predicate: Option<Predicate<P>>,
}

impl<P: Send + 'static> CommandBuilder<P> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy: ConcurrencyPolicy::default(),
            scope: None,
            host: None,
            predicate: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn unbounded(self) -> Self {
        self.policy(ConcurrencyPolicy::Unbounded)
    }

    /// Extra gate checked before every invocation.
    pub fn can_execute<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&P) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Parent scope for invocation scopes. Defaults to a fresh root.
    pub fn within(mut self, scope: &CancellationScope) -> Self {
        self.scope = Some(scope.clone());
        self
    }

    pub(crate) fn host(mut self, host: Weak<dyn CommandHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn build<F, Fut>(self, body: F) -> AsyncCommand<P>
    where
        F: Fn(P, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let (executing_tx, _) = watch::channel(false);
        AsyncCommand {
            inner: Arc::new(CommandInner {
                id: Uuid::new_v4(),
                name: self.name,
                policy: self.policy,
                scope: self.scope.unwrap_or_default(),
                host: self.host,
                predicate: self.predicate,
                body: Arc::new(move |parameter: P, token: CancellationToken| {
                    body(parameter, token).boxed()
                }),
                invocations: Mutex::new(HashMap::new()),
                next_invocation: AtomicU64::new(0),
                executing: AtomicBool::new(false),
                executing_tx,
                notifier: ChangeNotifier::new(),
            }),
        }
    }
}

struct CommandInner<P> {
    id: Uuid,
    name: String,
    policy: ConcurrencyPolicy,
    scope: CancellationScope,
    host: Option<Weak<dyn CommandHost>>,
    predicate: Option<Predicate<P>>,
    body: Body<P>,
    invocations: Mutex<HashMap<u64, CancellationScope>>,
    next_invocation: AtomicU64,
    executing: AtomicBool,
    executing_tx: watch::Sender<bool>,
    notifier: ChangeNotifier,
}

/// Clears the in-flight entry when the invocation ends, even on abort or panic.
struct Invocation<P: Send + 'static> {
    command: Arc<CommandInner<P>>,
    id: u64,
    token: CancellationToken,
}

impl<P: Send + 'static> Drop for Invocation<P> {
    fn drop(&mut self) {
        self.command.finish(self.id);
    }
}

impl<P: Send + 'static> CommandInner<P> {
    fn host(&self) -> Option<Arc<dyn CommandHost>> {
        self.host.as_ref().and_then(Weak::upgrade)
    }

    fn is_host_usable(&self) -> bool {
        match &self.host {
            None => true,
            Some(host) => host.upgrade().is_some_and(|h| h.is_usable()),
        }
    }

    fn verify_access(&self) -> Result<(), CommandError> {
        match self.host() {
            Some(host) => host
                .verify_access()
                .map_err(|source| CommandError::CrossThreadAccess {
                    command: self.name.clone(),
                    source,
                }),
            None => Ok(()),
        }
    }

    fn rejection(&self, parameter: &P) -> Option<RejectReason> {
        if !self.is_host_usable() {
            return Some(RejectReason::NotUsable);
        }
        if self.policy == ConcurrencyPolicy::AtMostOne && self.executing.load(Ordering::SeqCst) {
            return Some(RejectReason::Busy);
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(parameter) {
                return Some(RejectReason::Predicate);
            }
        }
        None
    }

    fn rejected(&self, reason: RejectReason) -> CommandError {
        debug!(command = %self.name, %reason, "Command rejected");
        CommandError::Rejected {
            command: self.name.clone(),
            reason,
        }
    }

    fn begin(self: &Arc<Self>, parameter: &P) -> Result<Invocation<P>, CommandError> {
        self.verify_access()?;
        if let Some(reason) = self.rejection(parameter) {
            return Err(self.rejected(reason));
        }

        let (id, scope) = {
            let mut invocations = self.invocations.lock();
            if self.policy == ConcurrencyPolicy::AtMostOne && !invocations.is_empty() {
                drop(invocations);
                return Err(self.rejected(RejectReason::Busy));
            }
            let id = self.next_invocation.fetch_add(1, Ordering::Relaxed);
            let scope = self.scope.child();
            invocations.insert(id, scope.clone());
            self.executing.store(true, Ordering::SeqCst);
            (id, scope)
        };
        self.publish_executing();

        debug!(command = %self.name, invocation = id, "Command started");
        Ok(Invocation {
            command: Arc::clone(self),
            id,
            token: scope.token(),
        })
    }

    fn finish(&self, id: u64) {
        {
            let mut invocations = self.invocations.lock();
            invocations.remove(&id);
            if invocations.is_empty() {
                self.executing.store(false, Ordering::SeqCst);
            }
        }
        self.publish_executing();
    }

    /// Push the current `executing` value out, if it differs from the last one sent.
    fn publish_executing(&self) {
        let mut value = false;
        let changed = self.executing_tx.send_if_modified(|sent| {
            value = self.executing.load(Ordering::SeqCst);
            if *sent == value {
                false
            } else {
                *sent = value;
                true
            }
        });
        if !changed {
            return;
        }

        let change = PropertyChange::new(Property::IsExecuting(self.name.clone()), value);
        self.notifier.notify(change.clone());
        if let Some(host) = self.host() {
            host.notify(change);
        }
    }

    fn report_failure(&self, error: &BoxError) {
        match self.host() {
            Some(host) => host.report_error(error, &self.name),
            None => error!(command = %self.name, error = %error, "Command failed"),
        }
    }

    async fn run(self: Arc<Self>, parameter: P, invocation: Invocation<P>) -> CommandOutcome {
        let body = Arc::clone(&self.body);
        let token = invocation.token.clone();
        let result = AssertUnwindSafe(async move { body(parameter, token).await })
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(())) => CommandOutcome::Completed,
            Ok(Err(error)) if is_cancellation(&error) => CommandOutcome::Cancelled,
            Ok(Err(error)) => {
                self.report_failure(&error);
                CommandOutcome::Failed
            }
            Err(payload) => {
                let error: BoxError = Panicked::from_payload(payload).into();
                self.report_failure(&error);
                CommandOutcome::Failed
            }
        };

        drop(invocation);
        debug!(command = %self.name, ?outcome, "Command finished");
        outcome
    }
}

impl<P: Send + 'static> TrackedCommand for CommandInner<P> {
    fn command_id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> ConcurrencyPolicy {
        self.policy
    }

    fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    fn in_flight(&self) -> usize {
        self.invocations.lock().len()
    }

    fn cancel(&self) {
        let scopes: Vec<CancellationScope> = self.invocations.lock().values().cloned().collect();
        if !scopes.is_empty() {
            debug!(command = %self.name, count = scopes.len(), "Cancelling invocations");
        }
        for scope in scopes {
            scope.cancel();
        }
    }

    fn current_token(&self) -> Result<CancellationToken, CommandError> {
        let invocations = self.invocations.lock();
        let mut scopes = invocations.values();
        match (scopes.next(), invocations.len()) {
            (Some(scope), 1) => Ok(scope.token()),
            (None, _) => Err(CommandError::NotExecuting(self.name.clone())),
            (Some(_), in_flight) => Err(CommandError::AmbiguousToken {
                command: self.name.clone(),
                in_flight,
            }),
        }
    }

    fn subscribe_executing(&self) -> watch::Receiver<bool> {
        self.executing_tx.subscribe()
    }

    fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }
}

/// A cancellable async command taking a parameter of type `P`.
pub struct AsyncCommand<P = ()> {
    inner: Arc<CommandInner<P>>,
}

impl<P> Clone for AsyncCommand<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Send + 'static> AsyncCommand<P> {
    pub fn builder(name: impl Into<String>) -> CommandBuilder<P> {
        CommandBuilder::new(name)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn policy(&self) -> ConcurrencyPolicy {
        self.inner.policy
    }

    pub fn is_executing(&self) -> bool {
        self.inner.is_executing()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight()
    }

    /// Whether `execute(parameter)` would currently be accepted.
    pub fn can_execute(&self, parameter: &P) -> bool {
        self.inner.rejection(parameter).is_none()
    }

    /// Start an invocation on the current tokio runtime.
    ///
    /// The returned handle resolves to the invocation's outcome. Body errors
    /// never surface here; they go to the owner's `on_error`.
    pub fn execute(&self, parameter: P) -> Result<JoinHandle<CommandOutcome>, CommandError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| CommandError::NoRuntime(self.inner.name.clone()))?;
        let invocation = self.inner.begin(&parameter)?;
        let span = info_span!("command", command = %self.inner.name, invocation = invocation.id);
        Ok(runtime.spawn(
            Arc::clone(&self.inner)
                .run(parameter, invocation)
                .instrument(span),
        ))
    }

    /// Run an invocation inline and wait for its outcome.
    pub async fn execute_async(&self, parameter: P) -> Result<CommandOutcome, CommandError> {
        let invocation = self.inner.begin(&parameter)?;
        let span = info_span!("command", command = %self.inner.name, invocation = invocation.id);
        Ok(Arc::clone(&self.inner)
            .run(parameter, invocation)
            .instrument(span)
            .await)
    }

    /// Cancel every in-flight invocation.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Token of the single in-flight invocation.
    pub fn current_token(&self) -> Result<CancellationToken, CommandError> {
        self.inner.current_token()
    }

    pub async fn wait_until_idle(&self, token: &CancellationToken) -> Result<(), CommandError> {
        wait_until_idle(self.inner.as_ref(), token).await
    }

    pub fn subscribe_executing(&self) -> watch::Receiver<bool> {
        self.inner.subscribe_executing()
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.inner.notifier
    }

    /// Type-erased handle for registries.
    pub fn tracked(&self) -> Arc<dyn TrackedCommand> {
        self.inner.clone()
    }
}

impl<P> fmt::Debug for AsyncCommand<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCommand")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("policy", &self.inner.policy)
            .field("executing", &self.inner.executing.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
#[path = "command_tests.rs"]
mod tests;
