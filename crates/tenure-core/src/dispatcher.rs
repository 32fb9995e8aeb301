//! Single-threaded dispatch queue.
//!
//! A [`Dispatcher`] owns one OS thread running a current-thread tokio
//! runtime inside a [`LocalSet`]. Components created on that thread are
//! owned by it; other threads marshal work onto it with
//! [`Dispatcher::invoke`].

use std::future::Future;
use std::thread::{self, ThreadId};

use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tracing::{debug, info, warn};

use crate::affinity::ThreadAffinity;
use crate::error::DispatchError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Owner thread for thread-affine components.
pub struct Dispatcher {
    name: String,
    sender: Option<mpsc::UnboundedSender<Job>>,
    thread_id: ThreadId,
    handle: Option<thread::JoinHandle<()>>,
}

impl Dispatcher {
    /// Start the dispatcher thread.
    pub fn spawn(name: impl Into<String>) -> Result<Self, DispatchError> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let local = LocalSet::new();
            local.block_on(&runtime, async move {
                while let Some(job) = receiver.recv().await {
                    job();
                }
            });
            debug!(dispatcher = %thread_name, "Dispatcher loop exited");
        })?;

        let thread_id = handle.thread().id();
        info!(dispatcher = %name, thread = ?thread_id, "Dispatcher started");
        Ok(Self {
            name,
            sender: Some(sender),
            thread_id,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Whether the calling thread is the dispatcher thread.
    pub fn check_access(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Affinity bound to the dispatcher thread.
    pub fn affinity(&self) -> ThreadAffinity {
        ThreadAffinity::with_owner(self.thread_id, self.name.clone())
    }

    fn sender(&self) -> Result<&mpsc::UnboundedSender<Job>, DispatchError> {
        self.sender
            .as_ref()
            .ok_or_else(|| DispatchError::Closed(self.name.clone()))
    }

    /// Queue a closure on the dispatcher thread without waiting for it.
    pub fn post<F>(&self, f: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender()?
            .send(Box::new(f))
            .map_err(|_| DispatchError::Closed(self.name.clone()))
    }

    /// Run `f` on the dispatcher thread and wait for its result.
    ///
    /// The future `f` returns may be `!Send`; it is spawned onto the
    /// dispatcher's `LocalSet`.
    pub async fn invoke<F, Fut, R>(&self, f: F) -> Result<R, DispatchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = R> + 'static,
        R: Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        self.post(move || {
            tokio::task::spawn_local(async move {
                let _ = reply.send(f().await);
            });
        })?;
        result.await.map_err(|_| DispatchError::Dropped)
    }

    /// Stop accepting work and wait for the thread to exit.
    ///
    /// Work already queued runs first. Tasks still pending on the
    /// `LocalSet` afterwards are dropped.
    pub async fn shutdown(mut self) -> Result<(), DispatchError> {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let joined = tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|_| DispatchError::Dropped)?;
            if joined.is_err() {
                warn!(dispatcher = %self.name, "Dispatcher thread panicked");
                return Err(DispatchError::Dropped);
            }
        }
        info!(dispatcher = %self.name, "Dispatcher stopped");
        Ok(())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Closing the channel lets the thread exit on its own.
        self.sender.take();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field("thread_id", &self.thread_id)
            .field("open", &self.sender.is_some())
            .finish()
    }
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
