//! Callback registries shared by the object store and awareness.

use parking_lot::Mutex;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T: ?Sized> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

/// A set of callbacks notified with `&T`.
///
/// A panicking callback is logged and skipped; the others still run.
pub(crate) struct ListenerSet<T: ?Sized> {
    name: &'static str,
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: ?Sized + 'static> ListenerSet<T> {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    pub(crate) fn subscribe<F>(&self, callback: F) -> Subscription<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let callback: Callback<T> = Arc::new(callback);
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.push((id, callback));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.registry.lock().entries.len()
    }

    pub(crate) fn notify(&self, value: &T) {
        // callbacks may subscribe or unsubscribe, so call them unlocked
        let callbacks: Vec<Callback<T>> = self
            .registry
            .lock()
            .entries
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(value))) {
                tracing::error!(
                    listeners = self.name,
                    panic = panic_message(panic.as_ref()),
                    "Listener panicked during notification"
                );
            }
        }
    }
}

/// Handle returned by `subscribe`; call [`Subscription::unsubscribe`] to stop
/// receiving notifications. Dropping the handle keeps the callback registered.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription<T: ?Sized> {
    id: u64,
    registry: Weak<Mutex<Registry<T>>>,
}

impl<T: ?Sized> Subscription<T> {
    /// Remove the callback. Returns `false` if the source is already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut registry = registry.lock();
        let before = registry.entries.len();
        registry.entries.retain(|(id, _)| *id != self.id);
        registry.entries.len() != before
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
