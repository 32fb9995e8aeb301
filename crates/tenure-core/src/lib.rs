//! Lifecycle and async-command coordination for single-owner components.
//!
//! A [`Component`] is initialized once and disposed once. While usable it
//! runs [`AsyncCommand`]s, each under a child of the component's root
//! [`CancellationScope`]; synchronous [`DelegateCommand`]s run inline.
//! Disposal cancels that scope, waits on the
//! [`CommandRegistry`] barrier and then drains the [`ResourceLedger`] in
//! reverse registration order.

pub mod affinity;
pub mod command;
pub mod command_registry;
pub mod component;
pub mod delegate;
pub mod dispatcher;
pub mod error;
pub mod hooks;
pub mod ledger;
pub mod notify;
pub mod scope;

pub use affinity::{AffinityViolation, ThreadAffinity};
pub use command::{
    AsyncCommand, CommandBuilder, CommandOutcome, ConcurrencyPolicy, TrackedCommand,
    wait_until_idle,
};
pub use command_registry::{CommandRegistry, EntryStatus};
pub use component::{Component, ComponentBuilder, DisposingHandlerId, LifecycleState};
pub use delegate::{DelegateBuilder, DelegateCommand};
pub use dispatcher::Dispatcher;
pub use error::{
    AggregateTeardownFailure, BoxError, CommandError, DispatchError, LedgerError,
    LifecycleError, LifecycleResult, OperationCancelled, Panicked, RejectReason,
    TeardownFailure, is_cancellation,
};
pub use hooks::{ComponentHooks, NoHooks};
pub use ledger::{LedgerState, ResourceLedger};
pub use notify::{ChangeNotifier, Property, PropertyChange, SubscriptionId};
pub use scope::CancellationScope;

pub use tenure_config::{ComponentConfig, UndisposedPolicy};
pub use tokio_util::sync::CancellationToken;
