//! In-process event bus between the core and the display layer

use crate::image_loader::DecodedImage;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Kind of user file operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    Move,
    Delete,
    Undo,
}

/// Events published by the core
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A requested image finished decoding (or was already cached)
    ImageReady {
        path: PathBuf,
        image: Arc<DecodedImage>,
    },

    /// An image could not be decoded and was dropped from the list
    ImageUnavailable { path: PathBuf },

    /// The list grew or shrank
    ListSizeChanged { len: usize },

    /// A scan batch was appended
    ListUpdated,

    /// The display should re-resolve the current image
    DisplayRefreshRequested { current: Option<PathBuf> },

    ScanStarted,
    ScanFinished,

    /// A move, delete or undo completed
    FileTaskFinished {
        action: FileAction,
        path: PathBuf,
        success: bool,
    },
}

/// Subscription identifier returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&CoreEvent) + Send + Sync>;

/// Synchronous publish/subscribe hub.
///
/// Subscribers run on the publishing thread, which is usually a worker or
/// the watcher thread; they must not block.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<(SubscriptionId, Subscriber)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&CoreEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(f)));
        id
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn publish(&self, event: &CoreEvent) {
        // Snapshot so subscribers may (un)subscribe from inside a callback
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();

        for subscriber in subscribers {
            subscriber(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_publish_reaches_subscribers() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);

        bus.subscribe(move |event| {
            if let CoreEvent::ListSizeChanged { len } = event {
                s.lock().push(*len);
            }
        });

        bus.publish(&CoreEvent::ListSizeChanged { len: 3 });
        bus.publish(&CoreEvent::ScanStarted);
        assert_eq!(*seen.lock(), vec![3]);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let id = bus.subscribe(|_| {});
        assert_eq!(bus.subscriber_count(), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscriber_can_unsubscribe_itself() {
        let bus = Arc::new(EventBus::new());
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(Mutex::new(0));

        let b = Arc::clone(&bus);
        let sl = Arc::clone(&slot);
        let c = Arc::clone(&calls);
        let id = bus.subscribe(move |_| {
            *c.lock() += 1;
            if let Some(id) = *sl.lock() {
                b.unsubscribe(id);
            }
        });
        *slot.lock() = Some(id);

        bus.publish(&CoreEvent::ListUpdated);
        bus.publish(&CoreEvent::ListUpdated);
        assert_eq!(*calls.lock(), 1);
    }
}
