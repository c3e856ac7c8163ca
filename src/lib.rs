//! # Mirror Engine
//!
//! A change-data-capture pipeline mirroring documents from a transactional
//! primary store into an external, eventually-consistent key-value store,
//! with secondary indexes, layered retries, and dead-lettering.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              mirror-engine                                │
//! │                                                                           │
//! │  change event ──▶ ┌──────────────┐    fast path    ┌───────────────────┐  │
//! │  (primary store)  │ MirrorEngine │────────────────▶│ KvClient (HTTP)   │  │
//! │                   │ (diff+fanout)│                 │ local retry/jitter│  │
//! │                   └──────┬───────┘                 └─────────▲─────────┘  │
//! │                          │ safe-op failure                   │            │
//! │                          ▼                                   │            │
//! │                   ┌──────────────┐    ┌──────────┐    ┌──────┴────────┐   │
//! │                   │ DispatchQueue│───▶│ TopicBus │───▶│ RetryWorker   │   │
//! │                   │ (sweeper)    │    └──────────┘    │ (slow path)   │   │
//! │                   └──────┬───────┘                    └──────┬────────┘   │
//! │                          │ give-up                           │ exhausted  │
//! │                          └───────────▶ DeadLetterStore ◀─────┘            │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - A transient remote failure never silently drops a write: every KV
//!   mutation either succeeds synchronously or becomes a durable retry job.
//! - Reconciliation is idempotent: replaying an event converges to the same
//!   canonical key, index key set, and manifest.
//! - Give-up is never silent: both retry layers dead-letter on exhaustion.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mirror_engine::{
//!     ChangeEvent, KvClient, KvValue, MirrorConfig, MirrorEngine, MirrorSpec, Params,
//!     DispatchQueue, SqliteDispatchStore,
//! };
//! use std::sync::Arc;
//!
//! struct PostsMirror;
//!
//! impl MirrorSpec for PostsMirror {
//!     fn canonical_key(&self, params: &Params, _doc: &serde_json::Value) -> String {
//!         match (params.get("orgId"), params.get("siteId"), params.get("postId")) {
//!             (Some(org), Some(site), Some(post)) => format!("posts:{org}:{site}:{post}"),
//!             _ => String::new(),
//!         }
//!     }
//!
//!     fn serialize(&self, doc: &serde_json::Value) -> mirror_engine::Result<KvValue> {
//!         Ok(KvValue::Json(doc.clone()))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> mirror_engine::Result<()> {
//!     let config = MirrorConfig::default();
//!     let kv = Arc::new(KvClient::new(&config.kv, config.http_retry.retry_config())?);
//!     let queue = DispatchQueue::new(Arc::new(SqliteDispatchStore::new("queue.db").await?));
//!     let engine = MirrorEngine::new(PostsMirror, kv, queue, &config);
//!
//!     // Invoked once per change event by the host platform
//!     let event = ChangeEvent::created(Params::new(), serde_json::json!({"title": "hi"}));
//!     engine.handle_change(&event).await?;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod kv;
pub mod metrics;
pub mod mirror;
pub mod queue;
pub mod resilience;
pub mod worker;

// Re-exports for convenience
pub use bus::{DeadLetterRecord, DeadLetterStore, NoOpDeadLetters, NoOpTopicBus, TopicBus};
pub use config::{
    DispatchQueueConfig, FanoutConfig, HttpRetryConfig, KvStoreConfig, MirrorConfig,
    RetryWorkerConfig,
};
pub use error::{BoxFuture, MirrorError, Result};
pub use kv::{
    GetFormat, GetResult, KvClient, KvStore, KvValue, ListKeysPage, ListKeysQuery, Metadata,
    PutOptions,
};
pub use mirror::{ChangeEvent, Manifest, MirrorEngine, MirrorSpec, Params, MANIFEST_PREFIX};
pub use queue::{
    DispatchEntry, DispatchQueue, DispatchStore, NewDispatch, QueueSweeper, SqliteDispatchStore,
    SweepStats,
};
pub use resilience::{run_with_concurrency, Bulkhead, RetryConfig};
pub use worker::{KvOp, RetryJob, RetryWorker};
