//! In-process publish/subscribe for sync status and notices.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::queue_model::{SyncNotice, SyncStatusEvent};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Channel<E> {
    listeners: Mutex<Vec<(u64, Listener<E>)>>,
    // Events waiting for the active dispatcher, in publish order.
    pending: Mutex<VecDeque<E>>,
    dispatching: AtomicBool,
    next_id: AtomicU64,
}

/// Clears the dispatching flag even if a listener panics.
struct DispatchGuard<'a>(&'a AtomicBool);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<E> Channel<E> {
    fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            dispatching: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    fn add(&self, listener: Listener<E>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.listeners.lock() {
            guard.push((id, listener));
        }
        id
    }

    fn remove(&self, id: u64) {
        if let Ok(mut guard) = self.listeners.lock() {
            guard.retain(|(existing, _)| *existing != id);
        }
    }

    fn len(&self) -> usize {
        self.listeners.lock().map(|g| g.len()).unwrap_or(0)
    }

    /// Queue `event` and deliver everything queued unless another call is
    /// already delivering. A publish from inside a listener is delivered
    /// after the event being dispatched, never interleaved with it.
    fn publish(&self, event: E) {
        match self.pending.lock() {
            Ok(mut pending) => pending.push_back(event),
            Err(_) => return,
        }
        while !self.dispatching.swap(true, Ordering::Acquire) {
            let guard = DispatchGuard(&self.dispatching);
            while let Some(next) = self.next_pending() {
                self.dispatch(&next);
            }
            drop(guard);
            // An event queued between the last pop and the release above
            // would otherwise wait for the next publish.
            if self.pending.lock().map(|p| p.is_empty()).unwrap_or(true) {
                break;
            }
        }
    }

    fn next_pending(&self) -> Option<E> {
        self.pending.lock().ok().and_then(|mut p| p.pop_front())
    }

    fn dispatch(&self, event: &E) {
        // Snapshot so listeners may (un)subscribe from inside a callback.
        let listeners: Vec<Listener<E>> = match self.listeners.lock() {
            Ok(guard) => guard.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(event);
        }
    }
}

trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: u64);
}

impl<E: Send + Sync + 'static> Unsubscribe for Channel<E> {
    fn unsubscribe(&self, id: u64) {
        self.remove(id);
    }
}

/// Registration returned by `subscribe`. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    channel: Weak<dyn Unsubscribe>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.unsubscribe(self.id);
        }
    }
}

/// Fan-out of [`SyncStatusEvent`]s and [`SyncNotice`]s to UI listeners.
///
/// Delivery is best effort: events published while nobody listens are
/// dropped, not retained. Listeners run on the publishing thread, one event
/// at a time. A listener may publish; its event is delivered once the
/// current one has reached every listener.
pub struct StatusBroadcaster {
    status: Arc<Channel<SyncStatusEvent>>,
    notices: Arc<Channel<SyncNotice>>,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self {
            status: Arc::new(Channel::new()),
            notices: Arc::new(Channel::new()),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncStatusEvent) + Send + Sync + 'static,
    {
        let id = self.status.add(Arc::new(callback));
        let channel: Arc<dyn Unsubscribe> = self.status.clone();
        Subscription {
            id,
            channel: Arc::downgrade(&channel),
        }
    }

    pub fn subscribe_notices<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncNotice) + Send + Sync + 'static,
    {
        let id = self.notices.add(Arc::new(callback));
        let channel: Arc<dyn Unsubscribe> = self.notices.clone();
        Subscription {
            id,
            channel: Arc::downgrade(&channel),
        }
    }

    pub fn publish(&self, event: SyncStatusEvent) {
        self.status.publish(event);
    }

    pub fn publish_notice(&self, notice: SyncNotice) {
        self.notices.publish(notice);
    }

    pub fn subscriber_count(&self) -> usize {
        self.status.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::queue_model::SyncPhase;

    fn recorder() -> (Arc<Mutex<Vec<SyncStatusEvent>>>, impl Fn(&SyncStatusEvent) + Send + Sync) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, move |e: &SyncStatusEvent| sink.lock().unwrap().push(*e))
    }

    #[test]
    fn every_subscriber_sees_events_in_order() {
        let broadcaster = StatusBroadcaster::new();
        let (badge, badge_cb) = recorder();
        let (panel, panel_cb) = recorder();
        let _badge_sub = broadcaster.subscribe(badge_cb);
        let _panel_sub = broadcaster.subscribe(panel_cb);

        broadcaster.publish(SyncStatusEvent::syncing(1, 2));
        broadcaster.publish(SyncStatusEvent::syncing(2, 2));
        broadcaster.publish(SyncStatusEvent::finished(SyncPhase::Complete, 2, 2));

        let expected = vec![
            SyncStatusEvent::syncing(1, 2),
            SyncStatusEvent::syncing(2, 2),
            SyncStatusEvent::finished(SyncPhase::Complete, 2, 2),
        ];
        assert_eq!(*badge.lock().unwrap(), expected);
        assert_eq!(*panel.lock().unwrap(), expected);
    }

    #[test]
    fn events_without_subscribers_are_not_retained() {
        let broadcaster = StatusBroadcaster::new();
        broadcaster.publish(SyncStatusEvent::syncing(1, 1));

        let (events, cb) = recorder();
        let _sub = broadcaster.subscribe(cb);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn dropping_or_unsubscribing_stops_delivery() {
        let broadcaster = StatusBroadcaster::new();
        let (events, cb) = recorder();
        let sub = broadcaster.subscribe(cb);
        assert_eq!(broadcaster.subscriber_count(), 1);

        sub.unsubscribe();
        assert_eq!(broadcaster.subscriber_count(), 0);
        broadcaster.publish(SyncStatusEvent::syncing(1, 1));
        assert!(events.lock().unwrap().is_empty());

        let (_, cb) = recorder();
        drop(broadcaster.subscribe(cb));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn listener_may_publish_from_its_callback() {
        let broadcaster = Arc::new(StatusBroadcaster::new());
        let (events, cb) = recorder();
        let relay = Arc::downgrade(&broadcaster);
        let _relay_sub = broadcaster.subscribe(move |e: &SyncStatusEvent| {
            if e.phase == SyncPhase::Syncing && e.completed == e.total {
                if let Some(b) = relay.upgrade() {
                    b.publish(SyncStatusEvent::finished(SyncPhase::Complete, e.completed, e.total));
                }
            }
        });
        let _sub = broadcaster.subscribe(cb);

        broadcaster.publish(SyncStatusEvent::syncing(1, 1));
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                SyncStatusEvent::syncing(1, 1),
                SyncStatusEvent::finished(SyncPhase::Complete, 1, 1),
            ]
        );
    }

    #[test]
    fn notices_use_their_own_channel() {
        let broadcaster = StatusBroadcaster::new();
        let notices = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&notices);
        let _sub = broadcaster.subscribe_notices(move |n: &SyncNotice| {
            sink.lock().unwrap().push(n.clone())
        });

        broadcaster.publish(SyncStatusEvent::syncing(0, 1));
        broadcaster.publish_notice(SyncNotice::PermanentFailure {
            operation_id: "op-1".into(),
            entity_type: "batch".into(),
            entity_local_id: "b1".into(),
            reason: "HTTP 422".into(),
        });
        assert_eq!(notices.lock().unwrap().len(), 1);
    }
}
