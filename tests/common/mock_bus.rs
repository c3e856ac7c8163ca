//! Mock TopicBus and DeadLetterStore for testing.
//!
//! The bus records every publish and can be told to fail the next N calls;
//! the dead-letter store records every dead letter for assertions.

use mirror_engine::{BoxFuture, DeadLetterRecord, DeadLetterStore, MirrorError, TopicBus};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// In-memory bus that records publishes.
#[derive(Default)]
pub struct MemoryBus {
    published: RwLock<Vec<(String, Value)>>,
    fail_remaining: AtomicUsize,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publish calls, then succeed again.
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Make every publish fail until reset.
    pub fn fail_always(&self) {
        self.fail_remaining.store(usize::MAX, Ordering::SeqCst);
    }

    /// Stop failing.
    #[allow(dead_code)]
    pub fn heal(&self) {
        self.fail_remaining.store(0, Ordering::SeqCst);
    }

    /// All recorded (topic, payload) publishes.
    pub async fn published(&self) -> Vec<(String, Value)> {
        self.published.read().await.clone()
    }

    /// Number of successful publishes.
    pub async fn publish_count(&self) -> usize {
        self.published.read().await.len()
    }
}

impl TopicBus for MemoryBus {
    fn publish(&self, topic: String, payload: Value) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let remaining = self.fail_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                if remaining != usize::MAX {
                    self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
                }
                return Err(MirrorError::bus(topic, "simulated publish failure"));
            }
            self.published.write().await.push((topic, payload));
            Ok(())
        })
    }
}

/// In-memory dead-letter store that records every record.
#[derive(Default)]
pub struct MemoryDeadLetters {
    records: RwLock<Vec<DeadLetterRecord>>,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded dead letters.
    pub async fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.read().await.clone()
    }

    /// Number of dead letters recorded.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

impl DeadLetterStore for MemoryDeadLetters {
    fn record(&self, record: DeadLetterRecord) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.records.write().await.push(record);
            Ok(())
        })
    }
}
