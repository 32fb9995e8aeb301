//! Synchronous commands.
//!
//! A [`DelegateCommand`] runs its body inline on the calling thread. It has
//! no cancellation scope and cannot overlap with itself on the owning
//! thread, but otherwise behaves like an [`AsyncCommand`](crate::AsyncCommand):
//! it is gated on the owner being usable, publishes `is_executing` and routes
//! failures and panics to the owner's `on_error`.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use crate::command::{CommandHost, CommandOutcome, ConcurrencyPolicy, Predicate, TrackedCommand};
use crate::error::{BoxError, CommandError, Panicked, RejectReason, is_cancellation};
use crate::notify::{ChangeNotifier, Property, PropertyChange};

type SyncBody<P> = Arc<dyn Fn(P) -> Result<(), BoxError> + Send + Sync>;

/// Builder for [`DelegateCommand`].
pub struct DelegateBuilder<P> {
    name: String,
    host: Option<Weak<dyn CommandHost>>,
    predicate: Option<Predicate<P>>,
}

impl<P: Send + 'static> DelegateBuilder<P> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: None,
            predicate: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Extra gate checked before every invocation.
    pub fn can_execute<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&P) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub(crate) fn host(mut self, host: Weak<dyn CommandHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn build<F>(self, body: F) -> DelegateCommand<P>
    where
        F: Fn(P) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let (executing_tx, _) = watch::channel(false);
        DelegateCommand {
            inner: Arc::new(DelegateInner {
                id: Uuid::new_v4(),
                name: self.name,
                host: self.host,
                predicate: self.predicate,
                body: Arc::new(body),
                running: AtomicUsize::new(0),
                publish: Mutex::new(()),
                executing_tx,
                notifier: ChangeNotifier::new(),
            }),
        }
    }
}

struct DelegateInner<P> {
    id: Uuid,
    name: String,
    host: Option<Weak<dyn CommandHost>>,
    predicate: Option<Predicate<P>>,
    body: SyncBody<P>,
    running: AtomicUsize,
    /// Serializes counter updates with their notifications.
    publish: Mutex<()>,
    executing_tx: watch::Sender<bool>,
    notifier: ChangeNotifier,
}

impl<P: Send + 'static> DelegateInner<P> {
    fn host(&self) -> Option<Arc<dyn CommandHost>> {
        self.host.as_ref().and_then(Weak::upgrade)
    }

    fn rejection(&self, parameter: &P) -> Option<RejectReason> {
        if let Some(host) = &self.host {
            if !host.upgrade().is_some_and(|h| h.is_usable()) {
                return Some(RejectReason::NotUsable);
            }
        }
        match &self.predicate {
            Some(predicate) if !predicate(parameter) => Some(RejectReason::Predicate),
            _ => None,
        }
    }

    fn set_running(&self, delta: isize) {
        let _publish = self.publish.lock();
        let running = if delta > 0 {
            self.running.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.running.fetch_sub(1, Ordering::SeqCst) - 1
        };
        let executing = running > 0;
        let changed = self.executing_tx.send_if_modified(|sent| {
            if *sent == executing {
                false
            } else {
                *sent = executing;
                true
            }
        });
        if changed {
            let change = PropertyChange::new(Property::IsExecuting(self.name.clone()), executing);
            self.notifier.notify(change.clone());
            if let Some(host) = self.host() {
                host.notify(change);
            }
        }
    }

    fn report_failure(&self, error: &BoxError) {
        match self.host() {
            Some(host) => host.report_error(error, &self.name),
            None => error!(command = %self.name, error = %error, "Command failed"),
        }
    }
}

impl<P: Send + 'static> TrackedCommand for DelegateInner<P> {
    fn command_id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> ConcurrencyPolicy {
        ConcurrencyPolicy::Unbounded
    }

    fn is_executing(&self) -> bool {
        self.running.load(Ordering::SeqCst) > 0
    }

    fn in_flight(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    fn cancel(&self) {}

    fn current_token(&self) -> Result<CancellationToken, CommandError> {
        Err(CommandError::NotExecuting(self.name.clone()))
    }

    fn subscribe_executing(&self) -> watch::Receiver<bool> {
        self.executing_tx.subscribe()
    }

    fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }
}

/// A command whose body runs synchronously.
pub struct DelegateCommand<P = ()> {
    inner: Arc<DelegateInner<P>>,
}

impl<P> Clone for DelegateCommand<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Send + 'static> DelegateCommand<P> {
    pub fn builder(name: impl Into<String>) -> DelegateBuilder<P> {
        DelegateBuilder::new(name)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_executing(&self) -> bool {
        self.inner.is_executing()
    }

    pub fn can_execute(&self, parameter: &P) -> bool {
        self.inner.rejection(parameter).is_none()
    }

    /// Run the body now.
    ///
    /// Body errors and panics are reported to the owner's `on_error` and
    /// show up as [`CommandOutcome::Failed`], never as `Err`.
    pub fn execute(&self, parameter: P) -> Result<CommandOutcome, CommandError> {
        let inner = &self.inner;
        if let Some(host) = inner.host() {
            host.verify_access()
                .map_err(|source| CommandError::CrossThreadAccess {
                    command: inner.name.clone(),
                    source,
                })?;
        }
        if let Some(reason) = inner.rejection(&parameter) {
            debug!(command = %inner.name, %reason, "Command rejected");
            return Err(CommandError::Rejected {
                command: inner.name.clone(),
                reason,
            });
        }

        inner.set_running(1);
        let body = Arc::clone(&inner.body);
        let result = catch_unwind(AssertUnwindSafe(move || body(parameter)));
        inner.set_running(-1);

        let outcome = match result {
            Ok(Ok(())) => CommandOutcome::Completed,
            Ok(Err(error)) if is_cancellation(&error) => CommandOutcome::Cancelled,
            Ok(Err(error)) => {
                inner.report_failure(&error);
                CommandOutcome::Failed
            }
            Err(payload) => {
                let error: BoxError = Panicked::from_payload(payload).into();
                inner.report_failure(&error);
                CommandOutcome::Failed
            }
        };
        debug!(command = %inner.name, ?outcome, "Command finished");
        Ok(outcome)
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

impl<P> fmt::Debug for DelegateCommand<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegateCommand")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("running", &self.inner.running.load(Ordering::SeqCst))
            .finish()
    }
}
