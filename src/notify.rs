use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Receives a signal whenever a store write changes which words are favorites.
pub trait FavoritesObserver: Send + Sync {
    fn favorites_changed(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PageId(u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum PageEvent {
    FavoritesChanged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
    pub pruned: usize,
}

#[derive(Debug)]
enum DeliveryError {
    Closed,
    Full,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Closed => write!(f, "page listener is gone"),
            DeliveryError::Full => write!(f, "page event queue is full"),
        }
    }
}

impl<T> From<TrySendError<T>> for DeliveryError {
    fn from(value: TrySendError<T>) -> Self {
        match value {
            TrySendError::Closed(_) => DeliveryError::Closed,
            TrySendError::Full(_) => DeliveryError::Full,
        }
    }
}

struct PageSubscriber {
    id: PageId,
    sender: mpsc::Sender<PageEvent>,
}

/// Best-effort fan-out of [`PageEvent`]s to every connected page.
///
/// Delivery never blocks: each page gets a bounded queue and a full or closed
/// queue only costs that page the event. Closed queues are pruned.
#[derive(Default)]
pub struct ChangeNotifier {
    pages: Mutex<Vec<PageSubscriber>>,
    next_id: AtomicU64,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, capacity: usize) -> (PageId, mpsc::Receiver<PageEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let id = PageId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.pages.lock().push(PageSubscriber { id, sender });
        debug!(page = %id, "page subscribed to store events");
        (id, receiver)
    }

    pub fn unsubscribe(&self, id: PageId) -> bool {
        let mut pages = self.pages.lock();
        let before = pages.len();
        pages.retain(|page| page.id != id);
        pages.len() != before
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn broadcast(&self, event: PageEvent) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut pages = self.pages.lock();
        pages.retain(|page| match page.sender.try_send(event).map_err(DeliveryError::from) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(err @ DeliveryError::Full) => {
                warn!(page = %page.id, error = %err, ?event, "dropping page event");
                report.dropped += 1;
                true
            }
            Err(err @ DeliveryError::Closed) => {
                warn!(page = %page.id, error = %err, ?event, "pruning unreachable page");
                report.dropped += 1;
                report.pruned += 1;
                false
            }
        });
        debug!(
            delivered = report.delivered,
            dropped = report.dropped,
            ?event,
            "broadcast finished"
        );
        report
    }
}

impl FavoritesObserver for ChangeNotifier {
    fn favorites_changed(&self) {
        self.broadcast(PageEvent::FavoritesChanged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_reaches_every_live_page() {
        let notifier = ChangeNotifier::new();
        let (_, mut first) = notifier.subscribe(4);
        let (_, mut second) = notifier.subscribe(4);
        let report = notifier.broadcast(PageEvent::FavoritesChanged);
        assert_eq!(report.delivered, 2);
        assert_eq!(first.try_recv().unwrap(), PageEvent::FavoritesChanged);
        assert_eq!(second.try_recv().unwrap(), PageEvent::FavoritesChanged);
    }

    #[test]
    fn closed_pages_are_pruned_without_failing() {
        let notifier = ChangeNotifier::new();
        let (_, receiver) = notifier.subscribe(4);
        let (_, mut alive) = notifier.subscribe(4);
        drop(receiver);
        notifier.favorites_changed();
        assert_eq!(notifier.page_count(), 1);
        assert!(alive.try_recv().is_ok());
    }

    #[test]
    fn full_queue_drops_event_but_keeps_page() {
        let notifier = ChangeNotifier::new();
        let (_, mut receiver) = notifier.subscribe(1);
        notifier.broadcast(PageEvent::FavoritesChanged);
        let report = notifier.broadcast(PageEvent::FavoritesChanged);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.pruned, 0);
        assert_eq!(notifier.page_count(), 1);
        assert!(receiver.try_recv().is_ok());
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_removes_page() {
        let notifier = ChangeNotifier::new();
        let (id, _receiver) = notifier.subscribe(2);
        assert!(notifier.unsubscribe(id));
        assert!(!notifier.unsubscribe(id));
        assert_eq!(notifier.page_count(), 0);
    }
}
