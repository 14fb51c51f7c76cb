//! Listener bookkeeping for push-based subscriptions.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle to an active subscription.
///
/// Dropping the handle does not unsubscribe; call
/// [`ListenerRegistration::unsubscribe`].
#[must_use = "the listener stays registered until `unsubscribe` is called"]
pub struct ListenerRegistration {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerRegistration {
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Stop receiving updates.
    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// A set of listeners keyed by registration id.
///
/// Callers take a [`ListenerSet::snapshot`] under their own locks and invoke
/// the listeners after releasing them.
pub struct ListenerSet<T: ?Sized> {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<u64, Arc<T>>>,
}

impl<T: ?Sized> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, listener: Arc<T>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, listener);
        id
    }

    pub fn remove(&self, id: u64) -> bool {
        self.listeners.lock().remove(&id).is_some()
    }

    pub fn get(&self, id: u64) -> Option<Arc<T>> {
        self.listeners.lock().get(&id).cloned()
    }

    /// The current listeners, in registration order.
    pub fn snapshot(&self) -> Vec<(u64, Arc<T>)> {
        self.listeners
            .lock()
            .iter()
            .map(|(id, l)| (*id, Arc::clone(l)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }
}

impl<T: ?Sized> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Register `listener` in `set` and return a handle that removes it.
pub fn register<T>(set: &Arc<ListenerSet<T>>, listener: Arc<T>) -> (u64, ListenerRegistration)
where
    T: ?Sized + Send + Sync + 'static,
{
    let id = set.insert(listener);
    let set = Arc::downgrade(set);
    let registration = ListenerRegistration::new(move || {
        if let Some(set) = set.upgrade() {
            set.remove(id);
        }
    });
    (id, registration)
}

/// Delivers a value to a callback when it differs from the last one
/// delivered, so listeners only see real changes.
pub struct Emitter<T> {
    last: Mutex<Option<T>>,
    callback: Box<dyn Fn(T) + Send + Sync>,
}

impl<T: Clone + PartialEq> Emitter<T> {
    pub fn new(callback: Box<dyn Fn(T) + Send + Sync>) -> Self {
        Self {
            last: Mutex::new(None),
            callback,
        }
    }

    /// Deliver `value` unless it equals the previous delivery.
    pub fn offer(&self, value: T) {
        {
            let mut last = self.last.lock();
            if last.as_ref() == Some(&value) {
                return;
            }
            *last = Some(value.clone());
        }
        (self.callback)(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    type Listener = dyn Fn(usize) + Send + Sync;

    #[test]
    fn test_unsubscribe_removes_listener() {
        let set: Arc<ListenerSet<Listener>> = Arc::new(ListenerSet::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        let (_, registration) = register(
            &set,
            Arc::new(move |n: usize| {
                counter.fetch_add(n, Ordering::SeqCst);
            }) as Arc<Listener>,
        );

        for (_, listener) in set.snapshot() {
            listener(2);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        registration.unsubscribe();
        assert!(set.is_empty());
    }

    #[test]
    fn test_drop_keeps_listener() {
        let set: Arc<ListenerSet<Listener>> = Arc::new(ListenerSet::new());
        {
            let (_, registration) = register(&set, Arc::new(|_: usize| {}) as Arc<Listener>);
            drop(registration);
        }
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_emitter_skips_repeats() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let emitter = Emitter::new(Box::new(move |n: u32| sink.lock().push(n)));
        for n in [1, 1, 2, 2, 1] {
            emitter.offer(n);
        }
        assert_eq!(*seen.lock(), vec![1, 2, 1]);
    }
}
