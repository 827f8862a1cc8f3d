// src/io/subscribers.rs
//
// Callback registry with unsubscribe-by-id.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Handle returned by a subscription; pass it back to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Set of callbacks invoked in subscription order.
pub struct Subscribers<T> {
    next_id: AtomicU64,
    callbacks: Mutex<BTreeMap<u64, Callback<T>>>,
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Subscribers {
            next_id: AtomicU64::new(1),
            callbacks: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.insert(id, Arc::new(callback));
        }
        SubscriptionId(id)
    }

    /// Returns false if the id was unknown or already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.callbacks
            .lock()
            .map(|mut callbacks| callbacks.remove(&id.0).is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every callback. The registry is not locked while callbacks run, so a
    /// callback may subscribe or unsubscribe.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = match self.callbacks.lock() {
            Ok(callbacks) => callbacks.values().cloned().collect(),
            Err(_) => return,
        };
        for callback in snapshot {
            callback(value);
        }
    }
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Subscribers::new()
    }
}
