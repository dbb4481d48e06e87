// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Explicit observer registration with owned subscriptions.

use std::{
    fmt::Debug,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<T>)>,
}

/// A list of callbacks notified in registration order.
///
/// Callbacks are invoked outside the internal lock, so a callback may subscribe
/// or unsubscribe other callbacks without deadlocking.
///
/// # Examples
///
/// ```
/// use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
/// use tierlink_handle::ObserverList;
///
/// let observers = ObserverList::<u32>::new();
/// let seen = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&seen);
///
/// let subscription = observers.subscribe(move |value| {
///     counter.fetch_add(*value as usize, Ordering::Relaxed);
/// });
///
/// observers.notify(&2);
/// subscription.unsubscribe();
/// observers.notify(&3);
///
/// assert_eq!(seen.load(Ordering::Relaxed), 2);
/// ```
pub struct ObserverList<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> ObserverList<T> {
    /// Creates an empty observer list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                callbacks: Vec::new(),
            })),
        }
    }

    /// Registers a callback. It stays registered until the returned subscription is dropped.
    #[must_use = "dropping the subscription unsubscribes the callback"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
        T: 'static,
    {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.callbacks.push((id, Arc::new(callback)));
        drop(registry);

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.lock().callbacks.retain(|(existing, _)| *existing != id);
                }
            })),
        }
    }

    /// Invokes every registered callback with `value`.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self
            .registry
            .lock()
            .callbacks
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in snapshot {
            callback(value);
        }
    }

    /// Returns the number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.lock().callbacks.len()
    }

    /// Returns `true` if no callback is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every registered callback.
    pub fn clear(&self) {
        self.registry.lock().callbacks.clear();
    }
}

impl<T> Default for ObserverList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for ObserverList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList").field("len", &self.len()).finish()
    }
}

/// Keeps a callback registered in an [`ObserverList`].
///
/// Call [`Subscription::unsubscribe`] or drop the value to remove the callback.
/// Use [`Subscription::detach`] to keep it registered for the lifetime of the list.
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Removes the callback from its list.
    pub fn unsubscribe(mut self) {
        self.run_detach();
    }

    /// Leaves the callback registered for as long as the list lives.
    pub fn detach(mut self) {
        self.detach = None;
    }

    fn run_detach(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_detach();
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("active", &self.detach.is_some()).finish()
    }
}
