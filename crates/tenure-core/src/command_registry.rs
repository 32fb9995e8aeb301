//! Registry of tracked commands.
//!
//! The registry answers "are any commands still running?" and provides the
//! teardown barrier. Unregistering a command that is still executing only
//! marks it; the entry is removed once that command reports idle.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::command::{TrackedCommand, wait_until_idle};
use crate::error::CommandError;
use crate::notify::{Property, SubscriptionId};

/// Entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryStatus {
    Active = 0,
    /// Unregistered while executing; removed when it goes idle.
    PendingRemoval = 1,
}

struct RegistryEntry {
    command: Arc<dyn TrackedCommand>,
    status: EntryStatus,
    subscription: SubscriptionId,
}

struct RegistryInner {
    entries: DashMap<Uuid, RegistryEntry>,
}

impl RegistryInner {
    /// Drop `id` if it is pending removal and idle.
    fn sweep(&self, id: Uuid) {
        let removed = self.entries.remove_if(&id, |_, entry| {
            entry.status == EntryStatus::PendingRemoval && !entry.command.is_executing()
        });
        if let Some((_, entry)) = removed {
            entry.command.notifier().unsubscribe(entry.subscription);
            debug!(command = %entry.command.name(), "Removed pending command");
        }
    }
}

/// Tracks the commands of one component.
#[derive(Clone)]
pub struct CommandRegistry {
    inner: Arc<RegistryInner>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: DashMap::new(),
            }),
        }
    }

    /// Track `command`. Returns false if it was already tracked.
    pub fn register(&self, command: Arc<dyn TrackedCommand>) -> bool {
        let id = command.command_id();
        if self.inner.entries.contains_key(&id) {
            return false;
        }

        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let name = command.name().to_string();
        let subscription = command.notifier().subscribe_property(
            Property::IsExecuting(name.clone()),
            move |change| {
                if !change.value {
                    if let Some(inner) = weak.upgrade() {
                        inner.sweep(id);
                    }
                }
            },
        );

        match self.inner.entries.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                command.notifier().unsubscribe(subscription);
                false
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(RegistryEntry {
                    command,
                    status: EntryStatus::Active,
                    subscription,
                });
                debug!(command = %name, "Registered command");
                true
            }
        }
    }

    /// Stop tracking `id`.
    ///
    /// An idle command is removed at once. An executing one is marked
    /// [`EntryStatus::PendingRemoval`] and removed when it finishes. Returns
    /// false if `id` was not tracked.
    pub fn unregister(&self, id: Uuid) -> bool {
        let Some(mut entry) = self.inner.entries.get_mut(&id) else {
            return false;
        };
        entry.status = EntryStatus::PendingRemoval;
        drop(entry);

        // Also covers a command that went idle between the lookup and the mark.
        self.inner.sweep(id);
        true
    }

    /// Cancel every tracked command.
    pub fn cancel_all(&self) {
        let commands = self.commands();
        if !commands.is_empty() {
            debug!(count = commands.len(), "Cancelling all commands");
        }
        for command in commands {
            command.cancel();
        }
    }

    /// Resolves once every currently executing command is idle.
    ///
    /// Returns immediately when nothing is executing. Fails with
    /// [`CommandError::Cancelled`] if `token` fires first.
    pub async fn wait_all(&self, token: &CancellationToken) -> Result<(), CommandError> {
        let executing: Vec<Arc<dyn TrackedCommand>> = self
            .commands()
            .into_iter()
            .filter(|c| c.is_executing())
            .collect();
        if executing.is_empty() {
            return Ok(());
        }

        info!(count = executing.len(), "Waiting for commands to finish");
        try_join_all(
            executing
                .iter()
                .map(|command| wait_until_idle(command.as_ref(), token)),
        )
        .await?;
        Ok(())
    }

    /// [`wait_all`](Self::wait_all) bounded by `timeout`.
    pub async fn wait_all_timeout(&self, timeout: Duration) -> Result<(), CommandError> {
        let token = CancellationToken::new();
        match tokio::time::timeout(timeout, self.wait_all(&token)).await {
            Ok(result) => result,
            Err(_) => Err(CommandError::Timeout(timeout)),
        }
    }

    pub fn has_active_commands(&self) -> bool {
        self.inner
            .entries
            .iter()
            .any(|entry| entry.command.is_executing())
    }

    /// Snapshot of every tracked command.
    pub fn commands(&self) -> Vec<Arc<dyn TrackedCommand>> {
        self.inner
            .entries
            .iter()
            .map(|entry| Arc::clone(&entry.command))
            .collect()
    }

    /// Whether every tracked command satisfies `predicate`.
    pub fn all<F>(&self, predicate: F) -> bool
    where
        F: Fn(&dyn TrackedCommand) -> bool,
    {
        self.inner
            .entries
            .iter()
            .all(|entry| predicate(entry.command.as_ref()))
    }

    pub fn status(&self, id: Uuid) -> Option<EntryStatus> {
        self.inner.entries.get(&id).map(|entry| entry.status)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.inner.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Remove every entry that is pending removal and already idle.
    pub(crate) fn sweep_pending(&self) {
        let ids: Vec<Uuid> = self.inner.entries.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.inner.sweep(id);
        }
    }

    /// Forget every command, executing or not.
    pub fn clear(&self) {
        let ids: Vec<Uuid> = self.inner.entries.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.inner.entries.remove(&id) {
                entry.command.notifier().unsubscribe(entry.subscription);
            }
        }
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("len", &self.len())
            .field("active", &self.has_active_commands())
            .finish()
    }
}

#[cfg(test)]
#[path = "command_registry_tests.rs"]
mod tests;
