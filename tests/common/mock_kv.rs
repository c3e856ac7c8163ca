//! Mock KvStore for testing.
//!
//! Stores entries in memory, records all mutating calls for assertions, and
//! supports injected per-key failures to exercise the retry paths.

use mirror_engine::{
    BoxFuture, GetFormat, GetResult, KvStore, KvValue, ListKeysPage, ListKeysQuery, Metadata,
    MirrorError, PutOptions,
};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// A stored KV entry: value plus attached metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub value: KvValue,
    pub metadata: Option<Metadata>,
}

/// A recorded put() / put_index_meta() call.
#[derive(Debug, Clone)]
pub struct PutCall {
    pub key: String,
    pub value: KvValue,
    pub metadata: Option<Metadata>,
}

/// Mock implementation of KvStore that records all calls.
///
/// # Example
/// ```rust,ignore
/// let kv = MockKv::new();
///
/// // Inject failures
/// kv.fail_key("posts:a:b:c").await;
///
/// // Use in tests...
///
/// // Assert what happened
/// assert_eq!(kv.keys().await, vec!["idx:x".to_string()]);
/// ```
#[derive(Default)]
pub struct MockKv {
    /// Current store contents (sorted for stable assertions)
    data: RwLock<BTreeMap<String, StoredEntry>>,
    /// Remaining failures per key (usize::MAX = fail forever)
    failures: RwLock<HashMap<String, usize>>,
    /// Recorded put() calls (canonical and manifest writes)
    puts: RwLock<Vec<PutCall>>,
    /// Recorded put_index_meta() calls
    index_puts: RwLock<Vec<PutCall>>,
    /// Recorded delete() calls
    deletes: RwLock<Vec<String>>,
}

impl MockKv {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Failure Injection
    // =========================================================================

    /// Make every operation on `key` fail (HTTP 503) until cleared.
    pub async fn fail_key(&self, key: &str) {
        self.failures
            .write()
            .await
            .insert(key.to_string(), usize::MAX);
    }

    /// Make the next `n` operations on `key` fail, then succeed.
    pub async fn fail_key_times(&self, key: &str, n: usize) {
        self.failures.write().await.insert(key.to_string(), n);
    }

    /// Clear all injected failures.
    pub async fn clear_failures(&self) {
        self.failures.write().await.clear();
    }

    async fn check_failure(&self, operation: &'static str, key: &str) -> Result<(), MirrorError> {
        let mut failures = self.failures.write().await;
        if let Some(remaining) = failures.get_mut(key) {
            if *remaining > 0 {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                return Err(MirrorError::kv_status(
                    operation,
                    key,
                    503,
                    "simulated failure",
                ));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Query Methods
    // =========================================================================

    /// All keys currently in the store, sorted.
    pub async fn keys(&self) -> Vec<String> {
        self.data.read().await.keys().cloned().collect()
    }

    /// The stored entry for a key, if present.
    pub async fn entry(&self, key: &str) -> Option<StoredEntry> {
        self.data.read().await.get(key).cloned()
    }

    /// The metadata attached to a key, if present.
    pub async fn metadata_of(&self, key: &str) -> Option<Metadata> {
        self.data.read().await.get(key).and_then(|e| e.metadata.clone())
    }

    /// Whether a key exists.
    pub async fn contains(&self, key: &str) -> bool {
        self.data.read().await.contains_key(key)
    }

    /// All recorded put() calls.
    pub async fn puts(&self) -> Vec<PutCall> {
        self.puts.read().await.clone()
    }

    /// All recorded put_index_meta() calls.
    pub async fn index_puts(&self) -> Vec<PutCall> {
        self.index_puts.read().await.clone()
    }

    /// How many times an index write hit a specific key.
    pub async fn index_put_count(&self, key: &str) -> usize {
        self.index_puts
            .read()
            .await
            .iter()
            .filter(|c| c.key == key)
            .count()
    }

    /// All recorded delete() calls.
    #[allow(dead_code)] // Useful for future tests
    pub async fn deletes(&self) -> Vec<String> {
        self.deletes.read().await.clone()
    }

    /// Seed an entry directly (bypassing the recorded calls).
    #[allow(dead_code)]
    pub async fn seed(&self, key: &str, value: KvValue, metadata: Option<Metadata>) {
        self.data
            .write()
            .await
            .insert(key.to_string(), StoredEntry { value, metadata });
    }
}

impl KvStore for MockKv {
    fn put(
        &self,
        key: String,
        value: KvValue,
        metadata: Option<Metadata>,
        _opts: PutOptions,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.check_failure("put", &key).await?;
            self.puts.write().await.push(PutCall {
                key: key.clone(),
                value: value.clone(),
                metadata: metadata.clone(),
            });
            self.data
                .write()
                .await
                .insert(key, StoredEntry { value, metadata });
            Ok(())
        })
    }

    fn put_index_meta(
        &self,
        key: String,
        metadata: Metadata,
        _opts: PutOptions,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.check_failure("putIndexMeta", &key).await?;
            self.index_puts.write().await.push(PutCall {
                key: key.clone(),
                value: KvValue::Text("1".to_string()),
                metadata: Some(metadata.clone()),
            });
            self.data.write().await.insert(
                key,
                StoredEntry {
                    value: KvValue::Text("1".to_string()),
                    metadata: Some(metadata),
                },
            );
            Ok(())
        })
    }

    fn get(&self, key: String, _format: GetFormat) -> BoxFuture<'_, GetResult> {
        Box::pin(async move {
            self.check_failure("get", &key).await?;
            Ok(match self.data.read().await.get(&key) {
                Some(entry) => GetResult::Found(entry.value.clone()),
                None => GetResult::NotFound,
            })
        })
    }

    fn delete(&self, key: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.check_failure("del", &key).await?;
            self.deletes.write().await.push(key.clone());
            // Absent keys delete cleanly (idempotent)
            self.data.write().await.remove(&key);
            Ok(())
        })
    }

    fn list_keys(&self, query: ListKeysQuery) -> BoxFuture<'_, ListKeysPage> {
        Box::pin(async move {
            let data = self.data.read().await;
            let keys: Vec<String> = data
                .keys()
                .filter(|k| match &query.prefix {
                    Some(prefix) => k.starts_with(prefix.as_str()),
                    None => true,
                })
                .take(query.limit.unwrap_or(u32::MAX) as usize)
                .cloned()
                .collect();
            Ok(ListKeysPage {
                keys,
                cursor: None,
                complete: true,
            })
        })
    }
}
