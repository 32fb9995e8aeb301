//! Component lifecycle.
//!
//! A [`Component`] moves through
//! `Uninitialized -> Initializing -> Initialized -> Disposing -> Disposed`.
//! It owns a root [`CancellationScope`], a [`CommandRegistry`] and a
//! [`ResourceLedger`]. Disposal cancels the root scope, waits for every
//! command to go idle, runs the dispose hook and then drains the ledger.
//!
//! Every observable flag flip is published through the component's
//! [`ChangeNotifier`]:
//!
//! - initialize: `is_initialized`, then `is_usable`
//! - dispose start: `is_disposing`, then `is_usable`
//! - dispose end: `is_disposed`, then `is_disposing` (false)

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tenure_config::{ComponentConfig, UndisposedPolicy};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::affinity::{AffinityViolation, ThreadAffinity};
use crate::command::{AsyncCommand, CommandBuilder, CommandHost, TrackedCommand};
use crate::delegate::{DelegateBuilder, DelegateCommand};
use crate::command_registry::CommandRegistry;
use crate::error::{
    AggregateTeardownFailure, BoxError, CommandError, LedgerError, LifecycleError,
    LifecycleResult, catch_panic, is_cancellation,
};
use crate::hooks::{ComponentHooks, NoHooks};
use crate::ledger::ResourceLedger;
use crate::notify::{ChangeNotifier, Property, PropertyChange, SubscriptionId};
use crate::scope::CancellationScope;

/// Component lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Uninitialized = 0,
    Initializing = 1,
    Initialized = 2,
    Disposing = 3,
    Disposed = 4,
}

impl From<u8> for LifecycleState {
    fn from(v: u8) -> Self {
        match v {
            0 => LifecycleState::Uninitialized,
            1 => LifecycleState::Initializing,
            2 => LifecycleState::Initialized,
            3 => LifecycleState::Disposing,
            _ => LifecycleState::Disposed,
        }
    }
}

/// Snapshot of the observable flags, diffed to produce notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Flags {
    initialized: bool,
    usable: bool,
    disposing: bool,
    disposed: bool,
}

type DisposingHandler =
    Arc<dyn Fn(Component) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Handle returned by [`Component::on_disposing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisposingHandlerId(u64);

struct DisposingEntry {
    id: DisposingHandlerId,
    label: String,
    handler: DisposingHandler,
}

struct ComponentInner {
    id: Uuid,
    name: Option<String>,
    label: String,
    config: ComponentConfig,
    affinity: ThreadAffinity,
    state: AtomicU8,
    initialized: AtomicBool,
    root: CancellationScope,
    ledger: ResourceLedger,
    registry: CommandRegistry,
    commands: DashMap<String, Arc<dyn TrackedCommand>>,
    notifier: ChangeNotifier,
    disposing: Mutex<Vec<DisposingEntry>>,
    next_handler: AtomicU64,
    hooks: Arc<dyn ComponentHooks>,
    parent: RwLock<Option<Weak<ComponentInner>>>,
    parameter: OnceLock<serde_json::Value>,
    /// True while `on_initialize` runs.
    initializing: watch::Sender<bool>,
}

impl ComponentInner {
    fn state(&self) -> LifecycleState {
        LifecycleState::from(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn flags(&self) -> Flags {
        let state = self.state();
        Flags {
            initialized: self.initialized.load(Ordering::SeqCst),
            usable: state == LifecycleState::Initialized,
            disposing: state == LifecycleState::Disposing,
            disposed: state == LifecycleState::Disposed,
        }
    }

    /// Run `change` and publish every flag it flipped.
    fn apply<R>(&self, change: impl FnOnce() -> R) -> R {
        let before = self.flags();
        let result = change();
        let after = self.flags();

        let diffs = [
            (Property::IsInitialized, before.initialized, after.initialized),
            (Property::IsDisposed, before.disposed, after.disposed),
            (Property::IsDisposing, before.disposing, after.disposing),
            (Property::IsUsable, before.usable, after.usable),
        ];
        for (property, was, now) in diffs {
            if was != now {
                self.notifier.notify(PropertyChange::new(property, now));
            }
        }
        result
    }
}

/// Clears the initializing flag when `initialize` returns or is dropped.
struct InitializingGuard<'a>(&'a watch::Sender<bool>);

impl Drop for InitializingGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

impl CommandHost for ComponentInner {
    fn is_usable(&self) -> bool {
        self.state() == LifecycleState::Initialized
    }

    fn verify_access(&self) -> Result<(), AffinityViolation> {
        self.affinity.verify_access()
    }

    fn notify(&self, change: PropertyChange) {
        self.notifier.notify(change);
    }

    fn report_error(self: Arc<Self>, error: &BoxError, command: &str) {
        let hooks = Arc::clone(&self.hooks);
        let component = Component { inner: self };
        hooks.on_error(&component, error, command);
    }
}

impl Drop for ComponentInner {
    fn drop(&mut self) {
        if self.state() == LifecycleState::Disposed {
            return;
        }
        let initialized = self.initialized.load(Ordering::SeqCst);
        let pending = self.ledger.len();
        if !initialized && pending == 0 {
            return;
        }

        match self.config.effective_undisposed_policy() {
            UndisposedPolicy::Ignore => {}
            UndisposedPolicy::Warn => warn!(
                component = %self.label,
                pending,
                "Component dropped without being disposed"
            ),
            UndisposedPolicy::Panic => {
                if std::thread::panicking() {
                    error!(component = %self.label, "Component dropped without being disposed");
                } else {
                    panic!("{} was dropped without being disposed", self.label);
                }
            }
        }
    }
}

/// Builder for [`Component`].
#[derive(Debug, Default)]
pub struct ComponentBuilder {
    name: Option<String>,
    config: Option<ComponentConfig>,
    affinity: Option<ThreadAffinity>,
}

impl ComponentBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Defaults to [`ComponentConfig::global_default`].
    pub fn config(mut self, config: ComponentConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Defaults to the calling thread.
    pub fn affinity(mut self, affinity: ThreadAffinity) -> Self {
        self.affinity = Some(affinity);
        self
    }

    pub fn build(self, hooks: impl ComponentHooks) -> Component {
        let config = self.config.unwrap_or_else(ComponentConfig::global_default);
        let affinity = self
            .affinity
            .unwrap_or_else(ThreadAffinity::current)
            .enforced(config.enforce_thread_affinity);
        let id = Uuid::new_v4();
        let label = format!("{} ({id})", self.name.as_deref().unwrap_or("Unnamed"));

        debug!(component = %label, "Component created");
        Component {
            inner: Arc::new(ComponentInner {
                id,
                name: self.name,
                label,
                config,
                affinity,
                state: AtomicU8::new(LifecycleState::Uninitialized as u8),
                initialized: AtomicBool::new(false),
                root: CancellationScope::new_root(),
                ledger: ResourceLedger::new(),
                registry: CommandRegistry::new(),
                commands: DashMap::new(),
                notifier: ChangeNotifier::new(),
                disposing: Mutex::new(Vec::new()),
                next_handler: AtomicU64::new(0),
                hooks: Arc::new(hooks),
                parent: RwLock::new(None),
                parameter: OnceLock::new(),
                initializing: watch::channel(false).0,
            }),
        }
    }
}

/// A unit of UI-bound or service-bound logic with an explicit lifecycle.
///
/// Cloning yields another handle to the same component.
#[derive(Clone)]
pub struct Component {
    inner: Arc<ComponentInner>,
}

impl Component {
    /// Component with the given hooks and the global default config.
    pub fn new(hooks: impl ComponentHooks) -> Self {
        Self::builder().build(hooks)
    }

    /// Component without hooks.
    pub fn plain() -> Self {
        Self::new(NoHooks)
    }

    pub fn builder() -> ComponentBuilder {
        ComponentBuilder::default()
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Display name and id, used in logs and errors.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn config(&self) -> &ComponentConfig {
        &self.inner.config
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.state()
    }

    /// True once initialization has succeeded. Stays true after disposal.
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Initialized, not disposing, not disposed.
    pub fn is_usable(&self) -> bool {
        self.state() == LifecycleState::Initialized
    }

    pub fn is_disposing(&self) -> bool {
        self.state() == LifecycleState::Disposing
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == LifecycleState::Disposed
    }

    /// Whether the calling thread owns this component.
    pub fn check_access(&self) -> bool {
        self.inner.affinity.check_access()
    }

    /// Fails with [`LifecycleError::CrossThreadAccess`] off the owning thread.
    pub fn verify_access(&self) -> LifecycleResult<()> {
        self.inner
            .affinity
            .verify_access()
            .map_err(|source| LifecycleError::CrossThreadAccess {
                component: self.inner.label.clone(),
                source,
            })
    }

    pub fn affinity(&self) -> &ThreadAffinity {
        &self.inner.affinity
    }

    pub fn root_scope(&self) -> &CancellationScope {
        &self.inner.root
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.inner.ledger
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.inner.registry
    }

    pub fn has_active_commands(&self) -> bool {
        self.inner.registry.has_active_commands()
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&PropertyChange) + Send + Sync + 'static,
    {
        self.inner.notifier.subscribe(handler)
    }

    pub fn subscribe_property<F>(&self, property: Property, handler: F) -> SubscriptionId
    where
        F: Fn(&PropertyChange) + Send + Sync + 'static,
    {
        self.inner.notifier.subscribe_property(property, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.notifier.unsubscribe(id)
    }

    fn ensure_not_initialized(&self) -> LifecycleResult<()> {
        match self.state() {
            LifecycleState::Uninitialized => Ok(()),
            LifecycleState::Disposing => Err(LifecycleError::AlreadyDisposing {
                component: self.inner.label.clone(),
            }),
            LifecycleState::Disposed => Err(LifecycleError::AlreadyDisposed {
                component: self.inner.label.clone(),
            }),
            LifecycleState::Initializing | LifecycleState::Initialized => {
                Err(LifecycleError::AlreadyInitialized {
                    component: self.inner.label.clone(),
                })
            }
        }
    }

    fn ensure_not_disposing(&self) -> LifecycleResult<()> {
        match self.state() {
            LifecycleState::Disposing => Err(LifecycleError::AlreadyDisposing {
                component: self.inner.label.clone(),
            }),
            LifecycleState::Disposed => Err(LifecycleError::AlreadyDisposed {
                component: self.inner.label.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Set the parent context. Only allowed before `initialize`.
    pub fn set_parent(&self, parent: &Component) -> LifecycleResult<()> {
        self.verify_access()?;
        self.ensure_not_initialized()?;
        *self.inner.parent.write() = Some(Arc::downgrade(&parent.inner));
        Ok(())
    }

    /// The parent, if one was set and is still alive.
    pub fn parent(&self) -> Option<Component> {
        self.inner
            .parent
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Component { inner })
    }

    /// Set the initialization parameter. Only allowed once, before `initialize`.
    pub fn set_parameter(&self, parameter: serde_json::Value) -> LifecycleResult<()> {
        self.verify_access()?;
        self.ensure_not_initialized()?;
        self.inner
            .parameter
            .set(parameter)
            .map_err(|_| LifecycleError::ParameterAlreadySet {
                component: self.inner.label.clone(),
            })
    }

    pub fn parameter(&self) -> Option<&serde_json::Value> {
        self.inner.parameter.get()
    }

    /// Deserialize the parameter into `T`.
    pub fn parameter_as<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.parameter()
            .map(|value| serde_json::from_value(value.clone()))
    }

    /// Make `child` a child of this component.
    ///
    /// The child is disposed when this component's ledger drains, unless it
    /// was disposed earlier.
    pub fn adopt_child(&self, child: &Component) -> LifecycleResult<()> {
        child.set_parent(self)?;
        let owned = child.clone();
        self.inner
            .ledger
            .register_async(format!("child:{}", child.label()), move || async move {
                if owned.is_disposed() || owned.is_disposing() {
                    return Ok(());
                }
                owned.dispose().await.map_err(BoxError::from)
            })?;
        Ok(())
    }

    /// Register an async handler that runs when disposal starts, before any
    /// command is cancelled.
    pub fn on_disposing<F, Fut>(
        &self,
        label: impl Into<String>,
        handler: F,
    ) -> LifecycleResult<DisposingHandlerId>
    where
        F: Fn(Component) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.verify_access()?;
        self.ensure_not_disposing()?;
        let id = DisposingHandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        self.inner.disposing.lock().push(DisposingEntry {
            id,
            label: label.into(),
            handler: Arc::new(move |component| handler(component).boxed()),
        });
        Ok(id)
    }

    pub fn remove_disposing_handler(&self, id: DisposingHandlerId) -> bool {
        let mut handlers = self.inner.disposing.lock();
        let before = handlers.len();
        handlers.retain(|entry| entry.id != id);
        handlers.len() != before
    }

    /// Create a command owned by this component.
    ///
    /// Invocation scopes are children of the component's root scope, the
    /// command is tracked by the registry, and a ledger entry makes sure it
    /// is cancelled and unregistered when disposal starts.
    pub fn register_command<P, F, Fut>(
        &self,
        builder: CommandBuilder<P>,
        body: F,
    ) -> LifecycleResult<AsyncCommand<P>>
    where
        P: Send + 'static,
        F: Fn(P, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.verify_access()?;
        self.ensure_not_disposing()?;

        let inner = &self.inner;
        let name = builder.name().to_string();
        let host: Weak<dyn CommandHost> = Arc::downgrade(inner) as Weak<dyn CommandHost>;
        let command = builder.within(&inner.root).host(host).build(body);
        let tracked = command.tracked();

        match inner.commands.entry(name.clone()) {
            Entry::Occupied(_) => return Err(CommandError::DuplicateName(name).into()),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&tracked));
            }
        }
        inner.registry.register(Arc::clone(&tracked));

        let on_disposing = {
            let owner = Arc::downgrade(inner);
            let command = Arc::downgrade(&tracked);
            move |change: &PropertyChange| {
                if !change.value {
                    return;
                }
                if let (Some(owner), Some(command)) = (owner.upgrade(), command.upgrade()) {
                    command.cancel();
                    owner.registry.unregister(command.command_id());
                }
            }
        };
        let owner = Arc::downgrade(inner);
        let registered = inner.ledger.register_bracket(
            format!("command:{name}"),
            || {
                Ok(inner
                    .notifier
                    .subscribe_property(Property::IsDisposing, on_disposing))
            },
            move |subscription| {
                if let Some(owner) = owner.upgrade() {
                    owner.notifier.unsubscribe(subscription);
                }
                Ok(())
            },
        );
        if let Err(err) = registered {
            inner.commands.remove(&name);
            inner.registry.unregister(tracked.command_id());
            return Err(err.into());
        }

        debug!(component = %inner.label, command = %name, "Registered command");
        Ok(command)
    }

    /// Create a synchronous command owned by this component.
    ///
    /// It shares the name space of [`Component::register_command`] and is
    /// gated on the component being usable. Failures go to
    /// [`ComponentHooks::on_error`]. Disposal forgets it.
    pub fn register_delegate<P, F>(
        &self,
        builder: DelegateBuilder<P>,
        body: F,
    ) -> LifecycleResult<DelegateCommand<P>>
    where
        P: Send + 'static,
        F: Fn(P) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.verify_access()?;
        self.ensure_not_disposing()?;

        let inner = &self.inner;
        let name = builder.name().to_string();
        let host: Weak<dyn CommandHost> = Arc::downgrade(inner) as Weak<dyn CommandHost>;
        let command = builder.host(host).build(body);

        match inner.commands.entry(name.clone()) {
            Entry::Occupied(_) => return Err(CommandError::DuplicateName(name).into()),
            Entry::Vacant(slot) => {
                slot.insert(command.tracked());
            }
        }

        debug!(component = %inner.label, command = %name, "Registered delegate command");
        Ok(command)
    }

    /// Look up a command by name.
    pub fn command(&self, name: &str) -> Option<Arc<dyn TrackedCommand>> {
        self.inner
            .commands
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Token of the named command's in-flight invocation.
    pub fn current_token(&self, name: &str) -> Result<CancellationToken, CommandError> {
        self.command(name)
            .ok_or_else(|| CommandError::NotFound(name.to_string()))?
            .current_token()
    }

    /// Initialize the component.
    ///
    /// Runs [`ComponentHooks::on_initialize`] with a child of the root scope.
    /// Cancelling `token` cancels that child and waits for the hook to
    /// return; the component then stays uninitialized and the call fails
    /// with [`LifecycleError::Cancelled`], even if the hook ignored the
    /// token and returned `Ok`. Resources the hook registered stay in the
    /// ledger until disposal.
    pub async fn initialize(&self, token: CancellationToken) -> LifecycleResult<()> {
        let span = info_span!("initialize", component = %self.inner.label);
        self.initialize_inner(token).instrument(span).await
    }

    async fn initialize_inner(&self, token: CancellationToken) -> LifecycleResult<()> {
        self.verify_access()?;
        let inner = &self.inner;

        if inner.config.require_parent && self.parent().is_none() {
            error!(component = %inner.label, "Initialize called without a parent");
            return Err(LifecycleError::MissingParentContext {
                component: inner.label.clone(),
            });
        }

        match self.ensure_not_initialized() {
            Ok(()) => {}
            Err(LifecycleError::AlreadyInitialized { component }) => {
                if inner.config.strict_initialize {
                    error!(component = %component, "Component is already initialized");
                    return Err(LifecycleError::AlreadyInitialized { component });
                }
                debug!(component = %component, "Already initialized, ignoring");
                return Ok(());
            }
            Err(other) => return Err(other),
        }

        if token.is_cancelled() {
            return Err(LifecycleError::Cancelled);
        }
        if !inner.transition(LifecycleState::Uninitialized, LifecycleState::Initializing) {
            return Err(LifecycleError::AlreadyInitialized {
                component: inner.label.clone(),
            });
        }
        info!(component = %inner.label, "Initializing component");
        inner.initializing.send_replace(true);
        let _initializing = InitializingGuard(&inner.initializing);

        let scope = inner.root.child();
        let mut hook = inner.hooks.on_initialize(self, scope.token());
        let mut cancelled = false;
        let result = tokio::select! {
            result = &mut hook => result,
            _ = token.cancelled() => {
                cancelled = true;
                scope.cancel();
                hook.await
            }
        };

        if cancelled {
            inner.transition(LifecycleState::Initializing, LifecycleState::Uninitialized);
            match &result {
                Ok(()) => info!(component = %inner.label, "Initialization cancelled"),
                Err(error) => info!(
                    component = %inner.label,
                    error = %error,
                    "Initialization cancelled"
                ),
            }
            return Err(LifecycleError::Cancelled);
        }

        match result {
            Ok(()) => {
                let completed = inner.apply(|| {
                    let ok = inner
                        .transition(LifecycleState::Initializing, LifecycleState::Initialized);
                    if ok {
                        inner.initialized.store(true, Ordering::SeqCst);
                    }
                    ok
                });
                if !completed {
                    warn!(component = %inner.label, "Disposed while initializing");
                    return self.ensure_not_disposing();
                }
                info!(component = %inner.label, "Component initialized");
                Ok(())
            }
            Err(error) => {
                inner.transition(LifecycleState::Initializing, LifecycleState::Uninitialized);
                if token.is_cancelled() || is_cancellation(&error) {
                    info!(component = %inner.label, "Initialization cancelled");
                    Err(LifecycleError::Cancelled)
                } else {
                    error!(component = %inner.label, error = %error, "Initialization failed");
                    Err(LifecycleError::InitializationFailed {
                        component: inner.label.clone(),
                        source: error,
                    })
                }
            }
        }
    }

    /// Dispose the component.
    ///
    /// Teardown always runs to the end and leaves the component `Disposed`.
    /// Every failure along the way is collected into
    /// [`LifecycleError::Teardown`].
    pub async fn dispose(&self) -> LifecycleResult<()> {
        let span = info_span!("dispose", component = %self.inner.label);
        self.dispose_inner().instrument(span).await
    }

    async fn dispose_inner(&self) -> LifecycleResult<()> {
        self.verify_access()?;
        let inner = &self.inner;

        loop {
            let from = inner.state();
            match from {
                LifecycleState::Disposing | LifecycleState::Disposed => {
                    if !inner.config.strict_dispose {
                        debug!(component = %inner.label, "Already disposed, ignoring");
                        return Ok(());
                    }
                    error!(component = %inner.label, "Component is already disposed");
                    return self.ensure_not_disposing();
                }
                _ => {
                    if inner.apply(|| inner.transition(from, LifecycleState::Disposing)) {
                        break;
                    }
                }
            }
        }
        info!(component = %inner.label, "Disposing component");

        let mut failures = AggregateTeardownFailure::new();

        let handlers: Vec<(String, DisposingHandler)> = inner
            .disposing
            .lock()
            .iter()
            .map(|entry| (entry.label.clone(), Arc::clone(&entry.handler)))
            .collect();
        for (label, handler) in handlers {
            if let Err(error) = catch_panic(handler(self.clone())).await {
                warn!(component = %inner.label, handler = %label, error = %error, "Disposing handler failed");
                failures.push(label, error);
            }
        }

        inner.root.cancel();
        inner.registry.cancel_all();

        // on_initialize sees the root cancellation through its child token.
        let mut initializing = inner.initializing.subscribe();
        if *initializing.borrow_and_update() {
            debug!(component = %inner.label, "Waiting for initialization to finish");
            let wait = initializing.wait_for(|busy| !*busy);
            let finished = match inner.config.shutdown_timeout() {
                Some(timeout) => tokio::time::timeout(timeout, wait).await.is_ok(),
                None => {
                    let _ = wait.await;
                    true
                }
            };
            if !finished {
                warn!(component = %inner.label, "Initialization still running at shutdown timeout");
                failures.push(
                    "initialization",
                    "initialization still running at shutdown timeout".into(),
                );
            }
        }

        let barrier = match inner.config.shutdown_timeout() {
            Some(timeout) => inner.registry.wait_all_timeout(timeout).await,
            None => inner.registry.wait_all(&CancellationToken::new()).await,
        };
        if let Err(error) = barrier {
            warn!(
                component = %inner.label,
                error = %error,
                "Commands still running at shutdown timeout, continuing teardown"
            );
            failures.push("command barrier", Box::new(error));
        }

        if let Err(error) = catch_panic(inner.hooks.on_dispose(self)).await {
            warn!(component = %inner.label, error = %error, "Dispose hook failed");
            failures.push("on_dispose", error);
        }

        match inner.ledger.drain().await {
            Ok(()) => {}
            Err(LedgerError::Teardown(aggregate)) => failures.extend(aggregate),
            Err(other) => failures.push("ledger", Box::new(other)),
        }

        inner.commands.clear();
        inner.registry.sweep_pending();
        if inner.config.is_debug_mode() {
            let violations = final_state_violations(inner);
            if !violations.is_empty() {
                let report = violations.join("; ");
                error!(component = %inner.label, violations = %report, "Final state check failed");
                failures.push("final state", report.into());
            }
        }
        inner.registry.clear();
        inner.disposing.lock().clear();

        inner.apply(|| {
            inner
                .state
                .store(LifecycleState::Disposed as u8, Ordering::SeqCst)
        });

        if failures.is_empty() {
            info!(component = %inner.label, "Component disposed");
            Ok(())
        } else {
            warn!(
                component = %inner.label,
                failed = failures.len(),
                "Component disposed with teardown failures"
            );
            Err(LifecycleError::Teardown(failures))
        }
    }
}

/// What a fully disposed component must not hold on to.
fn final_state_violations(inner: &ComponentInner) -> Vec<String> {
    let mut violations = Vec::new();
    if inner.registry.has_active_commands() {
        violations.push("commands are still executing".to_string());
    }
    if !inner.registry.is_empty() {
        violations.push(format!("{} command(s) still registered", inner.registry.len()));
    }
    if !inner.commands.is_empty() {
        violations.push(format!("{} named command(s) still held", inner.commands.len()));
    }
    if !inner.ledger.is_empty() {
        violations.push(format!("{} ledger entries still pending", inner.ledger.len()));
    }
    if let Err(violation) = inner.affinity.verify_access() {
        violations.push(violation.to_string());
    }
    violations
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .field("commands", &self.inner.commands.len())
            .field("pending_resources", &self.inner.ledger.len())
            .finish()
    }
}

#[cfg(test)]
#[path = "component_tests.rs"]
mod tests;
