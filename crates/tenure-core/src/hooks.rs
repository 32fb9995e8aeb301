//! Extension points for concrete components.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::component::Component;
use crate::error::BoxError;

/// Behaviour plugged into a [`Component`].
///
/// Every method has a default, so an implementation only overrides what it
/// needs. Hooks receive the component so they can register commands and
/// resources on it.
#[async_trait]
pub trait ComponentHooks: Send + Sync + 'static {
    /// Runs once inside `initialize`. Returning an error (or
    /// [`OperationCancelled`](crate::OperationCancelled)) leaves the
    /// component uninitialized.
    async fn on_initialize(
        &self,
        _component: &Component,
        _token: CancellationToken,
    ) -> Result<(), BoxError> {
        Ok(())
    }

    /// Runs during `dispose`, after every command is idle and before the
    /// ledger drains.
    async fn on_dispose(&self, _component: &Component) -> Result<(), BoxError> {
        Ok(())
    }

    /// Receives failures of command bodies. Called on the task that ran the body.
    fn on_error(&self, component: &Component, error: &BoxError, operation: &str) {
        error!(
            component = %component.label(),
            operation,
            error = %error,
            "Command failed"
        );
    }
}

/// Hooks that do nothing beyond the defaults.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

#[async_trait]
impl ComponentHooks for NoHooks {}
