use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::StateValue;
use super::tracking::{self, Dependency, Source, Subscriber, Subscribers};

type ComputeFn<T> = Box<dyn Fn() -> T + Send + Sync>;

/// A derived value, memoized and recomputed lazily.
///
/// A write upstream only marks the computed stale. The closure runs again on
/// the next read, and only if one of the sources it read last time reports a
/// new version. A recomputation that yields an equal value keeps the version,
/// so computeds further downstream stay cached.
pub struct Computed<T> {
    cell: Arc<ComputedCell<T>>,
}

struct ComputedCell<T> {
    id: u64,
    compute: ComputeFn<T>,
    state: Mutex<ComputedState<T>>,
    eval_lock: Mutex<()>,
    version: AtomicU64,
    stale: AtomicBool,
    subscribers: Subscribers,
    evaluations: AtomicU64,
    this: Weak<ComputedCell<T>>,
}

struct ComputedState<T> {
    value: Option<T>,
    deps: Vec<Dependency>,
}

impl<T: StateValue> Computed<T> {
    pub fn new(compute: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let cell = Arc::new_cyclic(|this| ComputedCell {
            id: tracking::next_node_id(),
            compute: Box::new(compute),
            state: Mutex::new(ComputedState {
                value: None,
                deps: Vec::new(),
            }),
            eval_lock: Mutex::new(()),
            version: AtomicU64::new(0),
            stale: AtomicBool::new(true),
            subscribers: Subscribers::default(),
            evaluations: AtomicU64::new(0),
            this: this.clone(),
        });
        Self { cell }
    }

    pub fn get(&self) -> T {
        let value = self.cell.read();
        let version = self.cell.version.load(Ordering::Acquire);
        tracking::track(self.cell.clone(), version);
        value
    }

    pub fn version(&self) -> u64 {
        self.cell.version.load(Ordering::Acquire)
    }
}

impl<T> Computed<T> {
    /// How many times the closure has run.
    pub fn evaluation_count(&self) -> u64 {
        self.cell.evaluations.load(Ordering::Relaxed)
    }

    pub fn is_stale(&self) -> bool {
        self.cell.stale.load(Ordering::Acquire)
    }
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.cell.id)
            .field("value", &self.cell.state.lock().value)
            .field("stale", &self.cell.stale.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T: StateValue> ComputedCell<T> {
    fn read(&self) -> T {
        self.refresh_inner();
        let cached = self.state.lock().value.clone();
        match cached {
            Some(value) => value,
            None => self.evaluate(),
        }
    }

    fn refresh_inner(&self) {
        if !self.stale.load(Ordering::Acquire) {
            return;
        }
        let _eval = self.eval_lock.lock();
        // Cleared before checking so a write landing mid-evaluation re-marks it.
        if !self.stale.swap(false, Ordering::AcqRel) {
            return;
        }
        let (has_value, deps) = {
            let state = self.state.lock();
            (state.value.is_some(), state.deps.clone())
        };
        let dirty = !has_value
            || deps.iter().any(|(source, seen)| {
                source.refresh();
                source.version() != *seen
            });
        if dirty {
            self.evaluate();
        }
    }

    fn evaluate(&self) -> T {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        let (value, deps) = tracking::collect(|| (self.compute)());
        let weak: Weak<dyn Subscriber> = self.this.clone();
        for (source, _) in &deps {
            source.subscribe(weak.clone());
        }
        let mut state = self.state.lock();
        if state.value.as_ref() != Some(&value) {
            state.value = Some(value.clone());
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        state.deps = deps;
        value
    }
}

impl<T: StateValue> Source for ComputedCell<T> {
    fn node_id(&self) -> u64 {
        self.id
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn refresh(&self) {
        self.refresh_inner();
    }

    fn subscribe(&self, subscriber: Weak<dyn Subscriber>) {
        self.subscribers.add(subscriber);
    }
}

impl<T: StateValue> Subscriber for ComputedCell<T> {
    fn node_id(&self) -> u64 {
        self.id
    }

    fn mark_stale(&self) {
        if !self.stale.swap(true, Ordering::AcqRel) {
            self.subscribers.notify();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Signal;

    #[test]
    fn test_lazy_until_first_read() {
        let a = Signal::new(2);
        let doubled = {
            let a = a.clone();
            Computed::new(move || a.get() * 2)
        };
        assert_eq!(doubled.evaluation_count(), 0);
        assert_eq!(doubled.get(), 4);
        assert_eq!(doubled.get(), 4);
        assert_eq!(doubled.evaluation_count(), 1);
    }

    #[test]
    fn test_write_invalidates_without_eager_recompute() {
        let a = Signal::new(1);
        let plus_one = {
            let a = a.clone();
            Computed::new(move || a.get() + 1)
        };
        assert_eq!(plus_one.get(), 2);
        a.set(5);
        assert!(plus_one.is_stale());
        assert_eq!(plus_one.evaluation_count(), 1);
        assert_eq!(plus_one.get(), 6);
        assert_eq!(plus_one.evaluation_count(), 2);
    }

    #[test]
    fn test_noop_write_keeps_downstream_cached() {
        let a = Signal::new(3);
        let b = {
            let a = a.clone();
            Computed::new(move || a.get() * 10)
        };
        assert_eq!(b.get(), 30);
        a.set(3);
        assert_eq!(b.get(), 30);
        assert_eq!(b.evaluation_count(), 1);
    }

    #[test]
    fn test_equal_recompute_stops_cascade() {
        let n = Signal::new(1);
        let parity = {
            let n = n.clone();
            Computed::new(move || n.get() % 2)
        };
        let label = {
            let parity = parity.clone();
            Computed::new(move || if parity.get() == 0 { "even" } else { "odd" })
        };
        assert_eq!(label.get(), "odd");
        n.set(3);
        assert_eq!(label.get(), "odd");
        assert_eq!(parity.evaluation_count(), 2);
        assert_eq!(label.evaluation_count(), 1);
    }

    #[test]
    fn test_diamond_evaluates_shared_source_once() {
        let s = Signal::new(1);
        let c = {
            let s = s.clone();
            Computed::new(move || s.get() + 1)
        };
        let a = {
            let c = c.clone();
            Computed::new(move || c.get() * 2)
        };
        let b = {
            let c = c.clone();
            Computed::new(move || c.get() * 3)
        };
        let d = {
            let (a, b) = (a.clone(), b.clone());
            Computed::new(move || a.get() + b.get())
        };

        assert_eq!(d.get(), 10);
        assert_eq!(c.evaluation_count(), 1);

        s.set(2);
        assert_eq!(d.get(), 15);
        assert_eq!(c.evaluation_count(), 2);
        assert_eq!(d.evaluation_count(), 2);
    }

    #[test]
    fn test_dependencies_follow_branches() {
        let use_left = Signal::new(true);
        let left = Signal::new("L");
        let right = Signal::new("R");
        let pick = {
            let (use_left, left, right) = (use_left.clone(), left.clone(), right.clone());
            Computed::new(move || if use_left.get() { left.get() } else { right.get() })
        };
        assert_eq!(pick.get(), "L");
        right.set("R2");
        assert_eq!(pick.get(), "L");
        assert_eq!(pick.evaluation_count(), 1);

        use_left.set(false);
        assert_eq!(pick.get(), "R2");
        left.set("L2");
        assert_eq!(pick.get(), "R2");
        assert_eq!(pick.evaluation_count(), 2);
    }

    #[test]
    fn test_untracked_read_is_not_a_dependency() {
        let a = Signal::new(1);
        let b = Signal::new(10);
        let sum = {
            let (a, b) = (a.clone(), b.clone());
            Computed::new(move || a.get() + tracking::untracked(|| b.get()))
        };
        assert_eq!(sum.get(), 11);
        b.set(20);
        assert!(!sum.is_stale());
        assert_eq!(sum.get(), 11);
        assert_eq!(b.subscriber_count(), 0);
    }
}
