use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::StateValue;
use super::tracking::{self, Source, Subscriber, Subscribers};
use crate::error::ContextError;

/// A mutable reactive cell.
///
/// Cloning a `Signal` yields another handle to the same cell. Writes that
/// produce an equal value are no-ops: the version stays put and dependents
/// are not invalidated.
pub struct Signal<T> {
    cell: Arc<SignalCell<T>>,
}

struct SignalCell<T> {
    id: u64,
    value: RwLock<T>,
    version: AtomicU64,
    subscribers: Subscribers,
    disposed: AtomicBool,
}

impl<T: StateValue> Signal<T> {
    pub fn new(initial: T) -> Self {
        Self {
            cell: Arc::new(SignalCell {
                id: tracking::next_node_id(),
                value: RwLock::new(initial),
                version: AtomicU64::new(0),
                subscribers: Subscribers::default(),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Reads the value, registering it as a dependency of any computed
    /// currently evaluating.
    pub fn get(&self) -> T {
        self.track();
        self.cell.value.read().clone()
    }

    /// Like [`Signal::get`], but fails once the owning component unmounted.
    pub fn try_get(&self) -> Result<T, ContextError> {
        if self.is_disposed() {
            return Err(ContextError::Disposed { id: self.cell.id });
        }
        Ok(self.get())
    }

    /// Borrows the value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.track();
        f(&self.cell.value.read())
    }

    /// Reads without registering a dependency.
    pub fn peek(&self) -> T {
        self.cell.value.read().clone()
    }

    /// Stores `value`. Returns whether anything changed.
    pub fn set(&self, value: T) -> bool {
        self.update(|_| value)
    }

    /// Replaces the value with `f(current)` under the write lock.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> bool {
        let changed = {
            let mut guard = self.cell.value.write();
            let next = f(&guard);
            if *guard == next {
                false
            } else {
                *guard = next;
                self.cell.version.fetch_add(1, Ordering::AcqRel);
                true
            }
        };
        if changed {
            self.cell.subscribers.notify();
        }
        changed
    }

    pub fn version(&self) -> u64 {
        self.cell.version.load(Ordering::Acquire)
    }

    fn track(&self) {
        let version = self.version();
        tracking::track(self.cell.clone(), version);
    }
}

impl<T> Signal<T> {
    pub fn id(&self) -> u64 {
        self.cell.id
    }

    pub fn is_disposed(&self) -> bool {
        self.cell.disposed.load(Ordering::Acquire)
    }

    /// Detaches every dependent. Later `try_get` calls fail.
    pub(crate) fn dispose(&self) {
        self.cell.disposed.store(true, Ordering::Release);
        self.cell.subscribers.clear();
    }

    /// Whether two handles point at the same cell.
    pub fn ptr_eq(&self, other: &Signal<T>) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.cell.subscribers.len()
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.cell.id)
            .field("value", &*self.cell.value.read())
            .finish_non_exhaustive()
    }
}

impl<T: StateValue> Source for SignalCell<T> {
    fn node_id(&self) -> u64 {
        self.id
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn refresh(&self) {}

    fn subscribe(&self, subscriber: Weak<dyn Subscriber>) {
        if !self.disposed.load(Ordering::Acquire) {
            self.subscribers.add(subscriber);
        }
    }
}

/// Type-erased handle used to dispose component-local signals on unmount.
pub(crate) trait Disposable: Send + Sync {
    fn dispose(&self);
}

impl<T: StateValue> Disposable for Signal<T> {
    fn dispose(&self) {
        Signal::dispose(self);
    }
}
