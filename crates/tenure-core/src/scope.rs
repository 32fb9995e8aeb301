//! Hierarchical cancellation scopes.
//!
//! A [`CancellationScope`] wraps a `tokio_util` [`CancellationToken`]. Child
//! scopes observe their parent's cancellation; cancelling a child never
//! reaches the parent or its siblings.

use std::future::Future;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::OperationCancelled;

/// A node in a cancellation tree.
#[derive(Debug, Clone)]
pub struct CancellationScope {
    token: CancellationToken,
    depth: u32,
}

impl CancellationScope {
    /// A new root with no parent.
    pub fn new_root() -> Self {
        Self {
            token: CancellationToken::new(),
            depth: 0,
        }
    }

    /// Adopt an externally supplied token as a root.
    pub fn from_token(token: CancellationToken) -> Self {
        Self { token, depth: 0 }
    }

    /// A child that is cancelled whenever this scope is.
    ///
    /// A child created after this scope was cancelled starts out cancelled.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            depth: self.depth + 1,
        }
    }

    /// Cancel this scope and every descendant. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A clone of the underlying token, handed to bodies and hooks.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Resolves once this scope is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn is_root(&self) -> bool {
        self.depth == 0
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Fails with [`OperationCancelled`] once cancellation was requested.
    pub fn check(&self) -> Result<(), OperationCancelled> {
        if self.token.is_cancelled() {
            Err(OperationCancelled)
        } else {
            Ok(())
        }
    }

    /// Run `fut` until it completes or this scope is cancelled.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, OperationCancelled>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(OperationCancelled),
            output = fut => Ok(output),
        }
    }
}

impl Default for CancellationScope {
    fn default() -> Self {
        Self::new_root()
    }
}
