//! Error types for component lifecycle, commands and the resource ledger.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;

use crate::affinity::AffinityViolation;

/// Boxed error supplied by collaborators (hooks, release actions, command bodies).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Marker error for cooperative cancellation.
///
/// Command bodies and hooks return this (boxed) to report that they stopped
/// because their token fired. It is an expected exit path and is never routed
/// to `on_error`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error)]
#[error("Operation cancelled")]
pub struct OperationCancelled;

/// A panic caught at a command or release boundary.
#[derive(Debug, Clone, Error)]
#[error("panicked: {0}")]
pub struct Panicked(pub String);

impl Panicked {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Panicked(message)
    }
}

/// Await `fut`, turning a panic into a [`Panicked`] error.
pub(crate) async fn catch_panic<F>(fut: F) -> Result<(), BoxError>
where
    F: Future<Output = Result<(), BoxError>>,
{
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(Panicked::from_payload(payload).into()))
}

/// Whether a collaborator error means "cancelled" rather than "failed".
pub fn is_cancellation(error: &BoxError) -> bool {
    error.downcast_ref::<OperationCancelled>().is_some()
        || matches!(
            error.downcast_ref::<CommandError>(),
            Some(CommandError::Cancelled)
        )
        || matches!(
            error.downcast_ref::<LifecycleError>(),
            Some(LifecycleError::Cancelled)
        )
}

/// Why a command refused to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The owning component is not initialized, or is disposing/disposed.
    NotUsable,
    /// An `AtMostOne` command is already executing.
    Busy,
    /// The command's own predicate returned false.
    Predicate,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NotUsable => write!(f, "owning component is not usable"),
            RejectReason::Busy => write!(f, "already executing"),
            RejectReason::Predicate => write!(f, "can-execute predicate returned false"),
        }
    }
}

/// Command errors.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Command '{command}' rejected: {reason}")]
    Rejected {
        command: String,
        reason: RejectReason,
    },

    #[error("Command already registered: {0}")]
    DuplicateName(String),

    #[error("Command not found: {0}")]
    NotFound(String),

    #[error("Command '{0}' is not executing")]
    NotExecuting(String),

    #[error("Command '{command}' has {in_flight} invocations in flight, its token is ambiguous")]
    AmbiguousToken { command: String, in_flight: usize },

    #[error("Command '{command}' {source}")]
    CrossThreadAccess {
        command: String,
        #[source]
        source: AffinityViolation,
    },

    #[error("No tokio runtime available to execute command '{0}'")]
    NoRuntime(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

/// One failed release action.
#[derive(Debug)]
pub struct TeardownFailure {
    pub label: String,
    pub error: BoxError,
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.error)
    }
}

/// Every failure collected while tearing something down.
#[derive(Debug, Default)]
pub struct AggregateTeardownFailure {
    failures: Vec<TeardownFailure>,
}

impl AggregateTeardownFailure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: impl Into<String>, error: BoxError) {
        self.failures.push(TeardownFailure {
            label: label.into(),
            error,
        });
    }

    pub fn extend(&mut self, other: AggregateTeardownFailure) {
        self.failures.extend(other.failures);
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn failures(&self) -> &[TeardownFailure] {
        &self.failures
    }

    /// Labels of the failed entries, in the order they failed.
    pub fn labels(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.label.as_str()).collect()
    }

    pub fn into_failures(self) -> Vec<TeardownFailure> {
        self.failures
    }

    /// `Ok(())` when nothing failed.
    pub fn into_result(self) -> Result<(), AggregateTeardownFailure> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for AggregateTeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} teardown action(s) failed", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateTeardownFailure {}

/// Resource ledger errors.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Resource ledger already drained")]
    AlreadyDrained,

    #[error("Acquire failed for '{label}': {source}")]
    AcquireFailed {
        label: String,
        #[source]
        source: BoxError,
    },

    /// Draining started while the resource was being acquired. The release
    /// already ran; `release` holds its failure, if any.
    #[error("Resource ledger drained while acquiring '{label}', released immediately")]
    DrainedDuringAcquire {
        label: String,
        #[source]
        release: Option<BoxError>,
    },

    #[error(transparent)]
    Teardown(#[from] AggregateTeardownFailure),
}

/// Component lifecycle errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{component} has already been initialized and cannot be reinitialized")]
    AlreadyInitialized { component: String },

    #[error("{component} has been disposed")]
    AlreadyDisposed { component: String },

    #[error("{component} is already disposing")]
    AlreadyDisposing { component: String },

    #[error("{component}: method was called from an invalid thread ({source})")]
    CrossThreadAccess {
        component: String,
        #[source]
        source: AffinityViolation,
    },

    #[error("{component}: parent component is not set")]
    MissingParentContext { component: String },

    #[error("{component}: parameter has already been set")]
    ParameterAlreadySet { component: String },

    #[error("Initialization of {component} failed: {source}")]
    InitializationFailed {
        component: String,
        #[source]
        source: BoxError,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Teardown(#[from] AggregateTeardownFailure),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Ledger(LedgerError),
}

impl From<LedgerError> for LifecycleError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Teardown(aggregate) => LifecycleError::Teardown(aggregate),
            other => LifecycleError::Ledger(other),
        }
    }
}

/// Dispatcher errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Dispatcher '{0}' is shut down")]
    Closed(String),

    #[error("Dispatched work was dropped before producing a result")]
    Dropped,

    #[error("Failed to start dispatcher thread: {0}")]
    Io(#[from] std::io::Error),
}
