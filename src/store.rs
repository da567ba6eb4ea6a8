/// Observable value cells and subscriptions
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Listener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// Handle returned by every `on_*` subscription in this crate
///
/// Dropping a `Subscription` does not cancel it; call [`Subscription::unsubscribe`].
/// Unsubscribing more than once is a no-op.
pub struct Subscription {
    cancel: Option<Box<dyn Fn() + Send + Sync>>,
    cancelled: AtomicBool,
}

impl Subscription {
    pub fn new(cancel: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
            cancelled: AtomicBool::new(false),
        }
    }

    /// A subscription with nothing to cancel
    pub fn noop() -> Self {
        Self {
            cancel: None,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Bundle several subscriptions into one
    pub fn merge(subscriptions: Vec<Subscription>) -> Self {
        Self::new(move || {
            for subscription in &subscriptions {
                subscription.unsubscribe();
            }
        })
    }

    pub fn unsubscribe(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(cancel) = &self.cancel {
            cancel();
        }
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("cancelled", &self.is_unsubscribed())
            .finish()
    }
}

/// Adapter point for UI layers that render from external state
///
/// `subscribe` registers a change callback, `snapshot` reads the current value.
pub trait Observable {
    type Snapshot;

    fn subscribe(&self, callback: Box<dyn Fn() + Send + Sync>) -> Subscription;

    fn snapshot(&self) -> Self::Snapshot;
}

struct Inner<T> {
    value: Mutex<T>,
    listeners: Mutex<BTreeMap<u64, Listener<T>>>,
    next_listener_id: AtomicU64,
    frozen: bool,
}

/// A minimal observable value cell
///
/// Listeners run synchronously on the thread that changed the value, after the
/// change and outside of the internal lock. Setting a value equal to the
/// current one does not notify anybody.
pub struct Store<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("value", &*self.inner.value.lock())
            .field("frozen", &self.inner.frozen)
            .finish()
    }
}

impl<T> Store<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    pub fn new(value: T) -> Self {
        Self::with_frozen(value, false)
    }

    /// Create a store whose value never changes
    ///
    /// `set` and `update` are accepted and ignored.
    pub fn frozen(value: T) -> Self {
        Self::with_frozen(value, true)
    }

    fn with_frozen(value: T, frozen: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                value: Mutex::new(value),
                listeners: Mutex::new(BTreeMap::new()),
                next_listener_id: AtomicU64::new(0),
                frozen,
            }),
        }
    }

    pub fn get(&self) -> T {
        self.inner.value.lock().clone()
    }

    pub fn set(&self, value: T) {
        self.update(|_| value);
    }

    /// Replace the value with `updater(current)` and return the new value
    ///
    /// The updater runs under the store's lock and must not access this store.
    pub fn update(&self, updater: impl FnOnce(&T) -> T) -> T {
        let (new_value, old_value) = {
            let mut current = self.inner.value.lock();
            let new_value = updater(&current);
            if self.inner.frozen || *current == new_value {
                return current.clone();
            }
            let old_value = std::mem::replace(&mut *current, new_value.clone());
            (new_value, old_value)
        };

        let listeners: Vec<Listener<T>> = self.inner.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(&new_value, &old_value);
        }
        new_value
    }

    /// Register a listener called with `(new, old)` after every change
    pub fn on_change(&self, listener: impl Fn(&T, &T) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().insert(id, Arc::new(listener));

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().remove(&id);
            }
        })
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.frozen
    }

    /// Identity comparison; two clones of one store are equal
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Address-based identity, stable for as long as the store is alive
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub fn downgrade(&self) -> WeakStore<T> {
        WeakStore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

impl<T> Observable for Store<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    type Snapshot = T;

    fn subscribe(&self, callback: Box<dyn Fn() + Send + Sync>) -> Subscription {
        self.on_change(move |_, _| callback())
    }

    fn snapshot(&self) -> T {
        self.get()
    }
}

/// Non-owning reference to a [`Store`]
pub struct WeakStore<T> {
    inner: Weak<Inner<T>>,
}

impl<T> Clone for WeakStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T> WeakStore<T> {
    pub fn upgrade(&self) -> Option<Store<T>> {
        self.inner.upgrade().map(|inner| Store { inner })
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}
