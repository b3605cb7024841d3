//! Calls parked until something outside the tool task answers them.
//!
//! Entries are keyed by execution id and tool-use id, since one engine's
//! bridge and broker serve every execution and providers reuse ids across
//! runs. Each registration is owned by a [`Ticket`]; dropping it removes that
//! registration and nothing else.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

type Key = (Uuid, String);

struct Entry<T> {
    serial: u64,
    tx: oneshot::Sender<T>,
}

pub(crate) struct PendingCalls<T> {
    inner: Arc<PendingInner<T>>,
}

struct PendingInner<T> {
    entries: Mutex<HashMap<Key, Entry<T>>>,
    next_serial: AtomicU64,
}

impl<T> Clone for PendingCalls<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for PendingCalls<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(PendingInner {
                entries: Mutex::new(HashMap::new()),
                next_serial: AtomicU64::new(0),
            }),
        }
    }
}

impl<T> PendingCalls<T> {
    /// Parks a call. A later registration under the same key replaces this one.
    pub(crate) fn register(
        &self,
        execution_id: Uuid,
        tool_use_id: &str,
    ) -> (Ticket<T>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        let key = (execution_id, tool_use_id.to_string());
        self.inner
            .entries
            .lock()
            .insert(key.clone(), Entry { serial, tx });
        let ticket = Ticket {
            pending: self.clone(),
            key,
            serial,
        };
        (ticket, rx)
    }

    /// Hands `value` to the waiting call. False when nothing waits under the key.
    pub(crate) fn answer(&self, execution_id: Uuid, tool_use_id: &str, value: T) -> bool {
        let key = (execution_id, tool_use_id.to_string());
        let Some(entry) = self.inner.entries.lock().remove(&key) else {
            return false;
        };
        entry.tx.send(value).is_ok()
    }

    pub(crate) fn keys(&self) -> Vec<(Uuid, String)> {
        let mut keys: Vec<Key> = self.inner.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Owns one registration. Dropped on every exit path of the waiting call,
/// including task abort.
pub(crate) struct Ticket<T> {
    pending: PendingCalls<T>,
    key: Key,
    serial: u64,
}

impl<T> Drop for Ticket<T> {
    fn drop(&mut self) {
        let mut entries = self.pending.inner.entries.lock();
        if entries
            .get(&self.key)
            .is_some_and(|entry| entry.serial == self.serial)
        {
            entries.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_tool_use_id_in_two_executions() {
        let pending: PendingCalls<u8> = PendingCalls::default();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let (_t1, mut rx1) = pending.register(first, "toolu_1_0");
        let (_t2, mut rx2) = pending.register(second, "toolu_1_0");

        assert!(pending.answer(second, "toolu_1_0", 2));
        assert!(pending.answer(first, "toolu_1_0", 1));
        assert_eq!(rx1.try_recv().unwrap(), 1);
        assert_eq!(rx2.try_recv().unwrap(), 2);
    }

    #[test]
    fn test_stale_ticket_leaves_newer_registration() {
        let pending: PendingCalls<u8> = PendingCalls::default();
        let id = Uuid::new_v4();
        let (stale, _rx) = pending.register(id, "c1");
        let (_fresh, mut rx) = pending.register(id, "c1");

        drop(stale);
        assert_eq!(pending.keys(), vec![(id, "c1".to_string())]);
        assert!(pending.answer(id, "c1", 7));
        assert_eq!(rx.try_recv().unwrap(), 7);
    }

    #[test]
    fn test_dropped_ticket_clears_entry() {
        let pending: PendingCalls<u8> = PendingCalls::default();
        let id = Uuid::new_v4();
        let (ticket, _rx) = pending.register(id, "c1");
        drop(ticket);
        assert!(pending.keys().is_empty());
        assert!(!pending.answer(id, "c1", 1));
    }
}
