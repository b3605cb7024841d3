//! Context object model: the per-execution shared store.
//!
//! One `Com` belongs to exactly one execution. It holds the shared state
//! slots components bind to, the append-only timeline and the user input
//! captured at start. Handles are cheap clones of one `Arc`.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use weft_types::{Message, TimelineEntry, TimelineEvent};

use crate::error::ContextError;
use crate::state::{Signal, StateValue};

type SnapshotFn = Box<dyn Fn() -> Option<Value> + Send + Sync>;

struct Slot {
    signal: Arc<dyn Any + Send + Sync>,
    snapshot: SnapshotFn,
}

/// Append-only ordered log of one execution.
#[derive(Default)]
pub struct Timeline {
    entries: RwLock<Vec<Arc<TimelineEntry>>>,
}

impl Timeline {
    /// Appends and returns the new entry's index.
    pub fn append(&self, entry: TimelineEntry) -> usize {
        let mut entries = self.entries.write();
        entries.push(Arc::new(entry));
        entries.len() - 1
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<TimelineEntry>> {
        self.entries.read().clone()
    }

    /// Entries from `index` on.
    pub fn since(&self, index: usize) -> Vec<Arc<TimelineEntry>> {
        let entries = self.entries.read();
        entries.get(index..).map(<[_]>::to_vec).unwrap_or_default()
    }

    /// The timeline as the model sees it.
    pub fn model_messages(&self) -> Vec<Message> {
        self.entries
            .read()
            .iter()
            .map(|entry| entry.to_model_message())
            .collect()
    }
}

/// Read-only view of the current tick handed to `on_tick_start`.
#[derive(Debug, Clone)]
pub struct TickState {
    pub tick: u32,
    /// Timeline entries appended since the previous tick boundary.
    pub current_tick_entries: Vec<Arc<TimelineEntry>>,
}

#[derive(Clone)]
pub struct Com {
    inner: Arc<ComInner>,
}

struct ComInner {
    slots: RwLock<BTreeMap<String, Slot>>,
    timeline: Timeline,
    user_input: Vec<Message>,
    tick: AtomicU32,
    tick_boundary: AtomicUsize,
}

impl Com {
    pub fn new(user_input: Vec<Message>) -> Self {
        Self {
            inner: Arc::new(ComInner {
                slots: RwLock::new(BTreeMap::new()),
                timeline: Timeline::default(),
                user_input,
                tick: AtomicU32::new(0),
                tick_boundary: AtomicUsize::new(0),
            }),
        }
    }

    /// Binds to the shared slot under `key`, seeding it with `init()` on first use.
    ///
    /// Every caller with the same key gets a handle to the same cell. Writes
    /// from concurrent tool calls are last-write-wins.
    pub fn state<T>(&self, key: &str, init: impl FnOnce() -> T) -> Result<Signal<T>, ContextError>
    where
        T: StateValue + Serialize,
    {
        if let Some(existing) = self.lookup::<T>(key)? {
            return Ok(existing);
        }
        let mut slots = self.inner.slots.write();
        // Re-check under the write lock, another writer may have seeded it.
        if let Some(slot) = slots.get(key) {
            return slot
                .signal
                .downcast_ref::<Signal<T>>()
                .cloned()
                .ok_or_else(|| ContextError::TypeMismatch {
                    key: key.to_string(),
                });
        }
        let signal = Signal::new(init());
        let reader = signal.clone();
        slots.insert(
            key.to_string(),
            Slot {
                signal: Arc::new(signal.clone()),
                snapshot: Box::new(move || serde_json::to_value(reader.peek()).ok()),
            },
        );
        tracing::trace!(key, "seeded shared state");
        Ok(signal)
    }

    fn lookup<T: StateValue>(&self, key: &str) -> Result<Option<Signal<T>>, ContextError> {
        let slots = self.inner.slots.read();
        match slots.get(key) {
            None => Ok(None),
            Some(slot) => slot
                .signal
                .downcast_ref::<Signal<T>>()
                .cloned()
                .map(Some)
                .ok_or_else(|| ContextError::TypeMismatch {
                    key: key.to_string(),
                }),
        }
    }

    /// Writes a JSON value under `key`, creating the slot when missing.
    pub fn set(&self, key: &str, value: Value) -> Result<(), ContextError> {
        let mut seed = Some(value.clone());
        let signal = self.state(key, || seed.take().unwrap_or(Value::Null))?;
        if seed.is_some() {
            signal.set(value);
        }
        Ok(())
    }

    /// Reads the JSON value under `key`. Typed slots answer with their snapshot.
    pub fn get(&self, key: &str) -> Option<Value> {
        let slots = self.inner.slots.read();
        let slot = slots.get(key)?;
        match slot.signal.downcast_ref::<Signal<Value>>() {
            Some(signal) => Some(signal.get()),
            None => (slot.snapshot)(),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.slots.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.slots.read().keys().cloned().collect()
    }

    /// Serializable view of every shared slot, in key order.
    pub fn snapshot_json(&self) -> Value {
        let slots = self.inner.slots.read();
        let map = slots
            .iter()
            .filter_map(|(key, slot)| (slot.snapshot)().map(|value| (key.clone(), value)))
            .collect();
        Value::Object(map)
    }

    pub fn timeline(&self) -> &Timeline {
        &self.inner.timeline
    }

    pub fn user_input(&self) -> &[Message] {
        &self.inner.user_input
    }

    pub fn current_tick(&self) -> u32 {
        self.inner.tick.load(Ordering::Acquire)
    }

    /// Appends a message attributed to the current tick.
    pub fn append_message(&self, message: Message) -> usize {
        self.inner
            .timeline
            .append(TimelineEntry::message(self.current_tick().max(1), message))
    }

    /// Appends a user action, system event or state change to the current tick.
    pub fn add_event(&self, event: TimelineEvent) -> usize {
        self.inner
            .timeline
            .append(TimelineEntry::event(self.current_tick().max(1), event))
    }

    /// Advances to `tick` and returns the delta since the previous boundary.
    pub(crate) fn begin_tick(&self, tick: u32) -> TickState {
        let len = self.inner.timeline.len();
        let start = self.inner.tick_boundary.swap(len, Ordering::AcqRel);
        self.inner.tick.store(tick, Ordering::Release);
        TickState {
            tick,
            current_tick_entries: self.inner.timeline.since(start),
        }
    }

    /// Tick state without advancing, for compiles outside the engine loop.
    pub fn tick_state(&self) -> TickState {
        let start = self.inner.tick_boundary.load(Ordering::Acquire);
        TickState {
            tick: self.current_tick(),
            current_tick_entries: self.inner.timeline.since(start),
        }
    }

    pub(crate) fn set_tick(&self, tick: u32) {
        self.inner.tick.store(tick, Ordering::Release);
    }
}

impl std::fmt::Debug for Com {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Com")
            .field("keys", &self.keys())
            .field("timeline_len", &self.inner.timeline.len())
            .field("tick", &self.current_tick())
            .finish()
    }
}
