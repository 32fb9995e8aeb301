//! Property change notifications.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Observable boolean properties.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Property {
    IsInitialized,
    IsUsable,
    IsDisposing,
    IsDisposed,
    /// `is_executing` of the named command.
    IsExecuting(String),
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Property::IsInitialized => write!(f, "is_initialized"),
            Property::IsUsable => write!(f, "is_usable"),
            Property::IsDisposing => write!(f, "is_disposing"),
            Property::IsDisposed => write!(f, "is_disposed"),
            Property::IsExecuting(command) => write!(f, "is_executing[{command}]"),
        }
    }
}

/// A property flipped to `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    pub property: Property,
    pub value: bool,
}

impl PropertyChange {
    pub fn new(property: Property, value: bool) -> Self {
        Self { property, value }
    }
}

/// Handle returned by [`ChangeNotifier::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&PropertyChange) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    filter: Option<Property>,
    handler: Handler,
}

/// Synchronous fan-out of [`PropertyChange`]s.
///
/// Handlers run on the notifying thread, outside the subscriber lock, so a
/// handler may subscribe or unsubscribe (itself included).
#[derive(Default)]
pub struct ChangeNotifier {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every change.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&PropertyChange) + Send + Sync + 'static,
    {
        self.add(None, Arc::new(handler))
    }

    /// Subscribe to changes of one property.
    pub fn subscribe_property<F>(&self, property: Property, handler: F) -> SubscriptionId
    where
        F: Fn(&PropertyChange) + Send + Sync + 'static,
    {
        self.add(Some(property), Arc::new(handler))
    }

    fn add(&self, filter: Option<Property>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push(Subscriber {
            id,
            filter,
            handler,
        });
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    pub fn notify(&self, change: PropertyChange) {
        let handlers: Vec<Handler> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.filter.as_ref().is_none_or(|p| *p == change.property))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in handlers {
            handler(&change);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn clear(&self) {
        self.subscribers.write().clear();
    }
}

impl fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
