//! A small observer registry.
//!
//! Subscribing returns a [`Subscription`] whose drop (or explicit
//! [`Subscription::disconnect`]) removes the callback. Emission snapshots the
//! callback list before invoking, so callbacks may connect or disconnect
//! subscriptions re-entrantly, including their own.

use std::sync::{Arc, Mutex};

type Slot<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

struct Registry<T> {
    next_id: u64,
    slots: Vec<(u64, Slot<T>)>,
}

pub struct Signal<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Signal {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Signal::new()
    }
}

impl<T: 'static> Signal<T> {
    pub fn new() -> Self {
        Signal {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 1,
                slots: Vec::new(),
            })),
        }
    }

    pub fn connect<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.slots.push((id, Arc::new(callback)));
            id
        };
        let weak = Arc::downgrade(&self.registry);
        Subscription {
            disconnect: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    lock(&registry).slots.retain(|(slot_id, _)| *slot_id != id);
                }
            })),
        }
    }

    /// Invokes every connected callback, in subscription order.
    pub fn emit(&self, value: &T) {
        let slots: Vec<Slot<T>> = lock(&self.registry)
            .slots
            .iter()
            .map(|(_, slot)| Arc::clone(slot))
            .collect();
        for slot in slots {
            slot(value);
        }
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.registry).slots.is_empty()
    }
}

fn lock<T>(registry: &Mutex<Registry<T>>) -> std::sync::MutexGuard<'_, Registry<T>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scoped handle for one connected callback.
pub struct Subscription {
    disconnect: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn disconnect(mut self) {
        if let Some(disconnect) = self.disconnect.take() {
            disconnect();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(disconnect) = self.disconnect.take() {
            disconnect();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("connected", &self.disconnect.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_connect_and_emit() {
        let signal: Signal<u32> = Signal::new();
        let total = Arc::new(AtomicU32::new(0));
        let total2 = Arc::clone(&total);
        let _sub = signal.connect(move |value| {
            total2.fetch_add(*value, Ordering::SeqCst);
        });
        signal.emit(&3);
        signal.emit(&4);
        assert_eq!(total.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let signal: Signal<u32> = Signal::new();
        let total = Arc::new(AtomicU32::new(0));
        let total2 = Arc::clone(&total);
        let sub = signal.connect(move |value| {
            total2.fetch_add(*value, Ordering::SeqCst);
        });
        signal.emit(&1);
        drop(sub);
        signal.emit(&1);
        assert_eq!(total.load(Ordering::SeqCst), 1);
        assert!(signal.is_empty());
    }

    #[test]
    fn test_explicit_disconnect() {
        let signal: Signal<()> = Signal::new();
        let sub = signal.connect(|_| {});
        assert!(!signal.is_empty());
        sub.disconnect();
        assert!(signal.is_empty());
    }

    #[test]
    fn test_reentrant_connect_from_callback() {
        let signal: Signal<u32> = Signal::new();
        let total = Arc::new(AtomicU32::new(0));
        let total2 = Arc::clone(&total);
        let inner_signal = signal.clone();
        let held: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));
        let held2 = Arc::clone(&held);
        let _sub = signal.connect(move |value| {
            total2.fetch_add(*value, Ordering::SeqCst);
            // Connecting while the same signal is emitting must not deadlock.
            let sub = inner_signal.connect(|_| {});
            held2.lock().unwrap().push(sub);
        });
        signal.emit(&5);
        assert_eq!(total.load(Ordering::SeqCst), 5);
        assert!(!signal.is_empty());
    }

    #[test]
    fn test_multiple_subscribers_in_order() {
        let signal: Signal<u32> = Signal::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_a = Arc::clone(&order);
        let order_b = Arc::clone(&order);
        let _a = signal.connect(move |_| order_a.lock().unwrap().push("a"));
        let _b = signal.connect(move |_| order_b.lock().unwrap().push("b"));
        signal.emit(&0);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }
}
