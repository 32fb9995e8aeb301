//! Thread affinity for components.

use std::thread::{self, ThreadId};

use thiserror::Error;
use tracing::error;

/// A mutating call arrived on the wrong thread.
#[derive(Debug, Clone, Error)]
#[error("called from thread {caller_name} ({caller:?}), owned by {owner_name} ({owner:?})")]
pub struct AffinityViolation {
    pub owner: ThreadId,
    pub owner_name: String,
    pub caller: ThreadId,
    pub caller_name: String,
}

/// Records the owning thread and checks callers against it.
#[derive(Debug, Clone)]
pub struct ThreadAffinity {
    owner: ThreadId,
    owner_name: String,
    enforced: bool,
}

impl ThreadAffinity {
    /// Owned by the calling thread.
    pub fn current() -> Self {
        let current = thread::current();
        Self {
            owner: current.id(),
            owner_name: thread_label(&current),
            enforced: true,
        }
    }

    /// Owned by a specific thread, e.g. a dispatcher's.
    pub fn with_owner(owner: ThreadId, owner_name: impl Into<String>) -> Self {
        Self {
            owner,
            owner_name: owner_name.into(),
            enforced: true,
        }
    }

    /// Turn enforcement on or off. `check_access` still reports the truth.
    pub fn enforced(mut self, enforced: bool) -> Self {
        self.enforced = enforced;
        self
    }

    pub fn is_enforced(&self) -> bool {
        self.enforced
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn owner_name(&self) -> &str {
        &self.owner_name
    }

    /// True iff the calling thread is the owner.
    pub fn check_access(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Fails when enforced and the caller is not the owner.
    pub fn verify_access(&self) -> Result<(), AffinityViolation> {
        if !self.enforced || self.check_access() {
            return Ok(());
        }

        let caller = thread::current();
        let violation = AffinityViolation {
            owner: self.owner,
            owner_name: self.owner_name.clone(),
            caller: caller.id(),
            caller_name: thread_label(&caller),
        };
        error!(
            owner = ?violation.owner,
            caller = ?violation.caller,
            "Cross-thread access rejected"
        );
        Err(violation)
    }
}

fn thread_label(thread: &thread::Thread) -> String {
    thread.name().unwrap_or("<unnamed>").to_string()
}
