//! Dependency tracking shared by signals and computeds.
//!
//! Evaluation of a computed is synchronous, so the set of sources it reads is
//! collected on a thread-local frame stack while its closure runs.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_node_id() -> u64 {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Something a computed can depend on.
pub(crate) trait Source: Send + Sync {
    fn node_id(&self) -> u64;
    /// Bumped only when the value actually changes.
    fn version(&self) -> u64;
    /// Brings the value up to date. No-op for plain signals.
    fn refresh(&self);
    fn subscribe(&self, subscriber: Weak<dyn Subscriber>);
}

/// Something that must hear about upstream writes.
pub(crate) trait Subscriber: Send + Sync {
    fn node_id(&self) -> u64;
    fn mark_stale(&self);
}

/// A dependency read during evaluation, with the version observed at read time.
pub(crate) type Dependency = (Arc<dyn Source>, u64);

thread_local! {
    static FRAMES: RefCell<Vec<Vec<Dependency>>> = const { RefCell::new(Vec::new()) };
}

struct FrameGuard;

impl Drop for FrameGuard {
    fn drop(&mut self) {
        FRAMES.with(|frames| {
            frames.borrow_mut().pop();
        });
    }
}

/// Records a read of `source` in the innermost active frame, if any.
pub(crate) fn track(source: Arc<dyn Source>, version: u64) {
    FRAMES.with(|frames| {
        if let Some(frame) = frames.borrow_mut().last_mut() {
            let id = source.node_id();
            if !frame.iter().any(|(s, _)| s.node_id() == id) {
                frame.push((source, version));
            }
        }
    });
}

/// Runs `f` and returns the sources it read.
pub(crate) fn collect<T>(f: impl FnOnce() -> T) -> (T, Vec<Dependency>) {
    FRAMES.with(|frames| frames.borrow_mut().push(Vec::new()));
    let guard = FrameGuard;
    let value = f();
    let deps = FRAMES.with(|frames| frames.borrow_mut().last_mut().map(std::mem::take));
    drop(guard);
    (value, deps.unwrap_or_default())
}

/// Runs `f` without registering any reads as dependencies.
pub fn untracked<T>(f: impl FnOnce() -> T) -> T {
    collect(f).0
}

/// Weak subscriber list, deduplicated by node id.
#[derive(Default)]
pub(crate) struct Subscribers {
    entries: Mutex<Vec<(u64, Weak<dyn Subscriber>)>>,
}

impl Subscribers {
    pub(crate) fn add(&self, subscriber: Weak<dyn Subscriber>) {
        let Some(id) = subscriber.upgrade().map(|s| s.node_id()) else {
            return;
        };
        let mut entries = self.entries.lock();
        entries.retain(|(_, weak)| weak.strong_count() > 0);
        if !entries.iter().any(|(existing, _)| *existing == id) {
            entries.push((id, subscriber));
        }
    }

    /// Marks every live subscriber stale. Called outside any value lock.
    pub(crate) fn notify(&self) {
        let live: Vec<Arc<dyn Subscriber>> = {
            let mut entries = self.entries.lock();
            entries.retain(|(_, weak)| weak.strong_count() > 0);
            entries.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
        };
        for subscriber in live {
            subscriber.mark_stale();
        }
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
