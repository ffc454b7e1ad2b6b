//! In-process notifications about plugin and instance lifecycle.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    PluginDiscovered { path: PathBuf },
    PluginInitialized { name: String },
    PluginInitFailed { name: String, reason: String },
    PluginsUnloaded { count: usize },
    /// A command forwarded by a secondary instance was accepted.
    CommandReceived { argv: Vec<String> },
    ShutdownRequested,
}

type Subscriber = Box<dyn Fn(&RuntimeEvent) + Send + Sync>;

/// Broadcasts [`RuntimeEvent`]s to subscribers synchronously, in
/// subscription order.
///
/// Subscribers run under a read lock and must not subscribe from inside a
/// callback.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&RuntimeEvent) + Send + Sync + 'static,
    {
        self.subscribers.write().push(Box::new(callback));
    }

    pub fn publish(&self, event: &RuntimeEvent) {
        for subscriber in self.subscribers.read().iter() {
            subscriber(event);
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_subscribers_receive_events_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |event| {
                if let RuntimeEvent::PluginsUnloaded { count } = event {
                    seen.lock().push((tag, *count));
                }
            });
        }

        bus.publish(&RuntimeEvent::PluginsUnloaded { count: 2 });
        bus.publish(&RuntimeEvent::ShutdownRequested);

        assert_eq!(*seen.lock(), vec![("first", 2), ("second", 2)]);
    }

    #[test]
    fn test_clones_share_subscribers() {
        let bus = EventBus::new();
        let clone = bus.clone();
        clone.subscribe(|_| {});
        assert_eq!(bus.subscriber_count(), 1);
    }
}
