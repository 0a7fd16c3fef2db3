//! Online/offline signal with transition callbacks.

use log::info;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

type TransitionCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Handle returned by [`ConnectivityMonitor::on_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Holds the current connectivity state and notifies on changes.
///
/// The platform adapter feeds it through [`set_online`](Self::set_online);
/// tests drive it directly.
pub struct ConnectivityMonitor {
    sender: watch::Sender<bool>,
    callbacks: Mutex<Vec<(CallbackId, TransitionCallback)>>,
    next_callback_id: AtomicU64,
}

impl ConnectivityMonitor {
    /// Seeded from the platform's indicator at startup.
    pub fn new(initially_online: bool) -> Self {
        let (sender, _) = watch::channel(initially_online);
        Self {
            sender,
            callbacks: Mutex::new(Vec::new()),
            next_callback_id: AtomicU64::new(1),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    /// Record a platform signal. Callbacks run only on an actual transition.
    pub fn set_online(&self, online: bool) {
        let changed = self.sender.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if !changed {
            return;
        }

        info!(
            "[Connectivity] Now {}",
            if online { "online" } else { "offline" }
        );
        let callbacks: Vec<TransitionCallback> = match self.callbacks.lock() {
            Ok(guard) => guard.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(online);
        }
    }

    pub fn on_transition<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = CallbackId(self.next_callback_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut guard) = self.callbacks.lock() {
            guard.push((id, Arc::new(callback)));
        }
        id
    }

    pub fn remove_callback(&self, id: CallbackId) {
        if let Ok(mut guard) = self.callbacks.lock() {
            guard.retain(|(existing, _)| *existing != id);
        }
    }

    /// Receiver for async observers.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}
