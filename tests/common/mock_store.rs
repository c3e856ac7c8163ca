//! Mock DispatchStore for testing.
//!
//! In-memory queue with the same claim semantics as the SQLite store, plus
//! helpers to simulate store outages and elapsed time.

use mirror_engine::{BoxFuture, DispatchEntry, DispatchStore, MirrorError, NewDispatch};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;

/// In-memory dispatch store.
#[derive(Default)]
pub struct MemoryDispatchStore {
    entries: Mutex<BTreeMap<u64, DispatchEntry>>,
    next_id: AtomicU64,
    fail_inserts: AtomicBool,
}

impl MemoryDispatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make insert() fail, simulating a queue outage (double-failure tests).
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// Number of pending entries.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Snapshot of all pending entries.
    pub async fn entries(&self) -> Vec<DispatchEntry> {
        self.entries.lock().await.values().cloned().collect()
    }

    /// Shift every entry's enqueue time into the past, as if `seconds` had
    /// elapsed. Lets tests drive multi-round backoff without sleeping.
    pub async fn backdate(&self, seconds: i64) {
        for entry in self.entries.lock().await.values_mut() {
            if let Some(ts) = entry.enqueued_at {
                entry.enqueued_at = Some(ts - seconds);
            }
        }
    }

    /// Insert a raw entry directly (e.g. a malformed one).
    pub async fn insert_raw(&self, entry: DispatchEntry) -> String {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut stored = entry;
        stored.id = id.to_string();
        let key_id = id;
        self.entries.lock().await.insert(key_id, stored);
        key_id.to_string()
    }
}

impl DispatchStore for MemoryDispatchStore {
    fn insert(&self, entry: NewDispatch) -> BoxFuture<'_, String> {
        Box::pin(async move {
            if self.fail_inserts.load(Ordering::SeqCst) {
                return Err(MirrorError::Internal(
                    "simulated dispatch store outage".to_string(),
                ));
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.entries.lock().await.insert(
                id,
                DispatchEntry {
                    id: id.to_string(),
                    topic: entry.topic,
                    payload: entry.payload,
                    delay_minutes: entry.delay_minutes,
                    retry_count: entry.retry_count,
                    enqueued_at: entry.enqueued_at,
                },
            );
            Ok(id.to_string())
        })
    }

    fn scan(&self) -> BoxFuture<'_, Vec<DispatchEntry>> {
        Box::pin(async move { Ok(self.entries.lock().await.values().cloned().collect()) })
    }

    fn claim(&self, id: String, retry_count: u32) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let Ok(id) = id.parse::<u64>() else {
                return Ok(false);
            };
            let mut entries = self.entries.lock().await;
            match entries.get(&id) {
                Some(entry) if entry.retry_count == retry_count => {
                    entries.remove(&id);
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }
}
