//! Resource ledger.
//!
//! Every resource a component acquires registers a release action here. At
//! teardown the ledger is drained exactly once, newest entry first. A failing
//! (or panicking) release never prevents the remaining ones from running; all
//! failures are collected into one [`AggregateTeardownFailure`].

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU8, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{AggregateTeardownFailure, BoxError, LedgerError, Panicked, catch_panic};

type SyncRelease = Box<dyn FnOnce() -> Result<(), BoxError> + Send>;
type AsyncRelease = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

enum Release {
    Sync(SyncRelease),
    Async(AsyncRelease),
}

struct Entry {
    label: String,
    release: Release,
}

/// Ledger state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LedgerState {
    Open = 0,
    Draining = 1,
    Drained = 2,
}

impl From<u8> for LedgerState {
    fn from(v: u8) -> Self {
        match v {
            0 => LedgerState::Open,
            1 => LedgerState::Draining,
            _ => LedgerState::Drained,
        }
    }
}

/// LIFO registry of release actions.
pub struct ResourceLedger {
    state: AtomicU8,
    entries: Mutex<Vec<Entry>>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LedgerState::Open as u8),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> LedgerState {
        LedgerState::from(self.state.load(Ordering::SeqCst))
    }

    fn push(&self, label: String, release: Release) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock();
        // Checked under the entries lock so nothing slips in after drain starts.
        if self.state() != LedgerState::Open {
            return Err(LedgerError::AlreadyDrained);
        }
        debug!(label = %label, "Registered ledger entry");
        entries.push(Entry { label, release });
        Ok(())
    }

    /// Register a fallible release action.
    pub fn register<F>(&self, label: impl Into<String>, release: F) -> Result<(), LedgerError>
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        self.push(label.into(), Release::Sync(Box::new(release)))
    }

    /// Register an infallible release action.
    pub fn defer<F>(&self, label: impl Into<String>, release: F) -> Result<(), LedgerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(label, move || {
            release();
            Ok(())
        })
    }

    /// Register an asynchronous release action.
    pub fn register_async<F, Fut>(
        &self,
        label: impl Into<String>,
        release: F,
    ) -> Result<(), LedgerError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.push(
            label.into(),
            Release::Async(Box::new(move || release().boxed())),
        )
    }

    /// Run `acquire` now and register `release` for its result.
    ///
    /// Nothing is registered when `acquire` fails. Fails with
    /// [`LedgerError::AlreadyDrained`] without calling `acquire` once the
    /// ledger has left the open state. If draining starts while `acquire`
    /// runs, `release` is called right away and
    /// [`LedgerError::DrainedDuringAcquire`] is returned.
    pub fn register_bracket<T, A, R>(
        &self,
        label: impl Into<String>,
        acquire: A,
        release: R,
    ) -> Result<(), LedgerError>
    where
        A: FnOnce() -> Result<T, BoxError>,
        R: FnOnce(T) -> Result<(), BoxError> + Send + 'static,
        T: Send + 'static,
    {
        let label = label.into();
        if self.state() != LedgerState::Open {
            return Err(LedgerError::AlreadyDrained);
        }
        let acquired = acquire().map_err(|source| LedgerError::AcquireFailed {
            label: label.clone(),
            source,
        })?;
        {
            let mut entries = self.entries.lock();
            if self.state() == LedgerState::Open {
                debug!(label = %label, "Registered ledger entry");
                entries.push(Entry {
                    label,
                    release: Release::Sync(Box::new(move || release(acquired))),
                });
                return Ok(());
            }
        }
        // Drain started while acquiring; release now instead of leaking.
        let result = run_sync(Box::new(move || release(acquired)));
        Err(drained_during_acquire(label, result))
    }

    /// Async counterpart of [`register_bracket`](Self::register_bracket).
    pub async fn register_bracket_async<T, A, AFut, R, RFut>(
        &self,
        label: impl Into<String>,
        acquire: A,
        release: R,
    ) -> Result<(), LedgerError>
    where
        A: FnOnce() -> AFut,
        AFut: Future<Output = Result<T, BoxError>>,
        R: FnOnce(T) -> RFut + Send + 'static,
        RFut: Future<Output = Result<(), BoxError>> + Send + 'static,
        T: Send + 'static,
    {
        let label = label.into();
        if self.state() != LedgerState::Open {
            return Err(LedgerError::AlreadyDrained);
        }
        let acquired = acquire()
            .await
            .map_err(|source| LedgerError::AcquireFailed {
                label: label.clone(),
                source,
            })?;
        {
            let mut entries = self.entries.lock();
            if self.state() == LedgerState::Open {
                debug!(label = %label, "Registered ledger entry");
                entries.push(Entry {
                    label,
                    release: Release::Async(Box::new(move || release(acquired).boxed())),
                });
                return Ok(());
            }
        }
        let result = catch_panic(release(acquired)).await;
        Err(drained_during_acquire(label, result))
    }

    /// Run every release action, newest first.
    ///
    /// Only the first call does any work; later calls return `Ok(())`.
    pub async fn drain(&self) -> Result<(), LedgerError> {
        {
            let _entries = self.entries.lock();
            if self
                .state
                .compare_exchange(
                    LedgerState::Open as u8,
                    LedgerState::Draining as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_err()
            {
                debug!("Ledger already drained, skipping");
                return Ok(());
            }
        }

        let mut failures = AggregateTeardownFailure::new();
        let mut released = 0usize;

        loop {
            // Never hold the lock across a release.
            let next = self.entries.lock().pop();
            let Some(Entry { label, release }) = next else {
                break;
            };

            let result = match release {
                Release::Sync(f) => run_sync(f),
                Release::Async(f) => catch_panic(async move { f().await }).await,
            };

            released += 1;
            match result {
                Ok(()) => debug!(label = %label, "Released ledger entry"),
                Err(error) => {
                    warn!(label = %label, error = %error, "Ledger release failed");
                    failures.push(label, error);
                }
            }
        }

        self.state
            .store(LedgerState::Drained as u8, Ordering::SeqCst);
        debug!(released, failed = failures.len(), "Ledger drained");

        failures.into_result().map_err(LedgerError::Teardown)
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn is_drained(&self) -> bool {
        self.state() == LedgerState::Drained
    }

    /// Labels of pending entries in registration order.
    pub fn labels(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.label.clone()).collect()
    }
}

fn drained_during_acquire(label: String, result: Result<(), BoxError>) -> LedgerError {
    warn!(label = %label, "Ledger drained during acquire, released immediately");
    if let Err(error) = &result {
        warn!(label = %label, error = %error, "Ledger release failed");
    }
    LedgerError::DrainedDuringAcquire {
        label,
        release: result.err(),
    }
}

fn run_sync(release: SyncRelease) -> Result<(), BoxError> {
    catch_unwind(AssertUnwindSafe(release))
        .unwrap_or_else(|payload| Err(Panicked::from_payload(payload).into()))
}

impl Default for ResourceLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResourceLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLedger")
            .field("state", &self.state())
            .field("pending", &self.len())
            .finish()
    }
}

impl Drop for ResourceLedger {
    fn drop(&mut self) {
        let pending = self.entries.get_mut().len();
        if pending > 0 {
            warn!(pending, "Resource ledger dropped without being drained");
        }
    }
}

#[cfg(test)]
#[path = "ledger_tests.rs"]
mod tests;
