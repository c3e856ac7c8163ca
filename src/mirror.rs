// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mirror reconciliation engine.
//!
//! Consumes change events from the primary store and reconciles the remote KV
//! store against them: one canonical key per document, zero or more derived
//! index keys, and a manifest recording what was previously written so every
//! reconciliation can diff instead of rewrite.
//!
//! ```text
//! change event ──▶ MirrorEngine::handle_change
//!                    │
//!                    ├── canonical key ──▶ safe put (serialized document)
//!                    ├── index diff    ──▶ safe puts/deletes (bounded fan-out)
//!                    └── manifest      ──▶ safe put (only when changed)
//! ```
//!
//! # Safe Operations
//!
//! Every KV mutation goes through a safe operation: on failure it logs a
//! warning and enqueues a [`RetryJob`] describing the exact operation onto
//! the dispatch queue with zero delay, then reports failure to its caller
//! without propagating. A change event is therefore always acknowledged
//! quickly regardless of remote-store health; the only way to lose a
//! mutation is the double failure of the KV store *and* the queue, which is
//! logged as an error.
//!
//! # Idempotence
//!
//! Mutations are idempotent by construction (same key, same resulting
//! value/metadata), so redelivering an event or replaying a half-finished
//! fan-out converges to the same state. Concurrent events for the same
//! document race on the manifest (last writer wins - there is no
//! compare-and-swap on manifest updates).

use crate::config::MirrorConfig;
use crate::error::{BoxFuture, Result};
use crate::kv::{GetFormat, GetResult, KvStore, KvValue, Metadata, PutOptions};
use crate::metrics;
use crate::queue::DispatchQueue;
use crate::resilience::run_with_concurrency;
use crate::worker::RetryJob;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Named path parameters from the change event's document pattern
/// (e.g. `{orgId: "orgA", siteId: "siteB", postId: "postC"}`).
pub type Params = HashMap<String, String>;

/// Prefix under which manifests live, derived from the canonical key.
pub const MANIFEST_PREFIX: &str = "idx:manifest:";

/// Metadata field pointing an index entry back at its canonical key.
pub const CANONICAL_FIELD: &str = "canonical";

/// A per-document change from the primary store.
///
/// `before`/`after` are full document snapshots; `after == None` means the
/// document was deleted.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub params: Params,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl ChangeEvent {
    /// Event for a newly created document.
    pub fn created(params: Params, doc: Value) -> Self {
        Self {
            params,
            before: None,
            after: Some(doc),
        }
    }

    /// Event for an updated document.
    pub fn updated(params: Params, before: Value, after: Value) -> Self {
        Self {
            params,
            before: Some(before),
            after: Some(after),
        }
    }

    /// Event for a deleted document.
    pub fn deleted(params: Params, before: Value) -> Self {
        Self {
            params,
            before: Some(before),
            after: None,
        }
    }

    /// Whether this event removes the document.
    pub fn is_deletion(&self) -> bool {
        self.after.is_none()
    }

    /// The snapshot keys and metadata derive from: the live document, or the
    /// last known state for deletions.
    pub fn doc(&self) -> Option<&Value> {
        self.after.as_ref().or(self.before.as_ref())
    }
}

/// The engine's memory of what was previously written for one canonical key.
///
/// Stored as JSON at `idx:manifest:<canonical key>`. `index_keys` is kept
/// sorted and unique; the hash covers the full metadata so metadata drift
/// (not just key-set drift) forces an index rewrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, rename = "indexKeys")]
    pub index_keys: Vec<String>,
    #[serde(default, rename = "metadataHash")]
    pub metadata_hash: String,
}

/// Per-entity-type mirroring capability.
///
/// One implementation per mirrored collection configures the generic engine
/// with its key derivation, indexing, and serialization. Only
/// `canonical_key` and `serialize` are required; the defaults disable
/// indexing and extra metadata.
pub trait MirrorSpec: Send + Sync + 'static {
    /// The KV key uniquely identifying this document's primary record.
    ///
    /// Returning an empty string skips the event (logged as
    /// misconfiguration, not surfaced as an error).
    fn canonical_key(&self, params: &Params, doc: &Value) -> String;

    /// Derived secondary index keys, recomputed in full on every change.
    ///
    /// Returning `None` (the default) disables indexing for this entity
    /// type; returning `Some` enables it, including manifest upkeep and
    /// manifest-driven cleanup on delete. May be asynchronous (e.g. keys
    /// derived from related documents).
    fn index_keys<'a>(
        &'a self,
        params: &'a Params,
        doc: &'a Value,
    ) -> Option<BoxFuture<'a, Vec<String>>> {
        let _ = (params, doc);
        None
    }

    /// Extra metadata attached to the canonical and index entries
    /// (e.g. a denormalized title for list rendering).
    ///
    /// The engine merges in `{canonical: <canonical key>}` afterwards;
    /// the canonical pointer wins any field collision.
    fn metadata(&self, doc: &Value, params: &Params) -> Option<Metadata> {
        let _ = (doc, params);
        None
    }

    /// The value stored at the canonical key.
    fn serialize(&self, doc: &Value) -> Result<KvValue>;
}

/// Deterministic hash of a metadata map.
///
/// SHA-256 over the key-sorted JSON stringification, hex-encoded. Key order
/// in the input never affects the result.
pub fn metadata_hash(metadata: &Metadata) -> String {
    let canonical = canonicalize(&Value::Object(metadata.clone()));
    // Canonicalized values always serialize
    let rendered = serde_json::to_string(&canonical).unwrap_or_default();
    let digest = Sha256::digest(rendered.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Recursively sort object keys so stringification is deterministic.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Generic reconciliation engine, configured per entity type by a
/// [`MirrorSpec`].
///
/// Stateless between invocations; safe to share behind an `Arc` and invoke
/// concurrently (see the manifest race note in the module docs).
pub struct MirrorEngine<S: MirrorSpec> {
    spec: S,
    kv: Arc<dyn KvStore>,
    queue: DispatchQueue,
    retry_topic: String,
    fanout_width: usize,
}

impl<S: MirrorSpec> MirrorEngine<S> {
    pub fn new(spec: S, kv: Arc<dyn KvStore>, queue: DispatchQueue, config: &MirrorConfig) -> Self {
        Self {
            spec,
            kv,
            queue,
            retry_topic: config.worker.topic.clone(),
            fanout_width: config.fanout.width.max(1),
        }
    }

    /// Reconcile the KV store against one change event.
    ///
    /// Never returns a KV error: every remote failure is converted into a
    /// durable retry job or a log line. Errors out only on spec-callback
    /// failures (caller bugs).
    pub async fn handle_change(&self, event: &ChangeEvent) -> Result<()> {
        let start = Instant::now();

        let Some(doc) = event.doc() else {
            warn!("Change event carries neither before nor after snapshot, skipping");
            return Ok(());
        };

        let canonical_key = self.spec.canonical_key(&event.params, doc);
        if canonical_key.is_empty() {
            warn!(
                params = ?event.params,
                "Empty canonical key, skipping event (mirror misconfiguration)"
            );
            return Ok(());
        }

        let indexing = self.spec.index_keys(&event.params, doc).is_some();
        let manifest_key = format!("{}{}", MANIFEST_PREFIX, canonical_key);

        let result = match &event.after {
            None => {
                self.reconcile_delete(&canonical_key, &manifest_key, indexing)
                    .await
            }
            Some(after) => {
                self.reconcile_upsert(event, after, &canonical_key, &manifest_key)
                    .await
            }
        };

        metrics::record_reconcile(
            if event.is_deletion() { "delete" } else { "upsert" },
            start.elapsed(),
        );
        result
    }

    /// Deletion path: remove the canonical key plus, when indexing is
    /// enabled, the manifest and every previously recorded index key.
    ///
    /// Cleanup is manifest-driven - it never recomputes index keys, so it
    /// works even when the index function can no longer run against the
    /// deleted document.
    async fn reconcile_delete(
        &self,
        canonical_key: &str,
        manifest_key: &str,
        indexing: bool,
    ) -> Result<()> {
        let mut targets: BTreeSet<String> = BTreeSet::new();
        targets.insert(canonical_key.to_string());

        if indexing {
            let previous = self.read_manifest(manifest_key).await;
            targets.insert(manifest_key.to_string());
            targets.extend(previous.index_keys);
        }

        debug!(
            canonical_key,
            keys = targets.len(),
            "Deleting mirrored entry"
        );
        metrics::record_index_fanout("delete", targets.len());

        run_with_concurrency(
            targets.into_iter().collect(),
            self.fanout_width,
            |key| async move {
                self.safe_delete(&key).await;
            },
        )
        .await;

        Ok(())
    }

    /// Upsert path: write the canonical entry, then diff the index key set
    /// and metadata hash against the stored manifest.
    async fn reconcile_upsert(
        &self,
        event: &ChangeEvent,
        doc: &Value,
        canonical_key: &str,
        manifest_key: &str,
    ) -> Result<()> {
        // Caller metadata first; the canonical pointer wins any collision
        let mut metadata = self.spec.metadata(doc, &event.params).unwrap_or_default();
        metadata.insert(
            CANONICAL_FIELD.to_string(),
            Value::String(canonical_key.to_string()),
        );

        let value = self.spec.serialize(doc)?;
        self.safe_put(canonical_key, value, Some(metadata.clone()))
            .await;

        let Some(keys_future) = self.spec.index_keys(&event.params, doc) else {
            return Ok(());
        };

        let next_set: BTreeSet<String> = keys_future.await?.into_iter().collect();
        let next_index_keys: Vec<String> = next_set.iter().cloned().collect();

        let previous = self.read_manifest(manifest_key).await;
        let old_set: BTreeSet<String> = previous.index_keys.iter().cloned().collect();

        let current_hash = metadata_hash(&metadata);
        let metadata_drifted = current_hash != previous.metadata_hash;

        let to_add: Vec<String> = next_set.difference(&old_set).cloned().collect();
        let to_remove: Vec<String> = old_set.difference(&next_set).cloned().collect();

        // Metadata drift must propagate to every index entry, not just new ones
        let to_write = if metadata_drifted {
            next_index_keys.clone()
        } else {
            to_add
        };

        debug!(
            canonical_key,
            writes = to_write.len(),
            removals = to_remove.len(),
            metadata_drifted,
            "Index diff computed"
        );
        metrics::record_index_fanout("write", to_write.len());
        metrics::record_index_fanout("delete", to_remove.len());

        run_with_concurrency(to_write, self.fanout_width, |key| {
            let metadata = metadata.clone();
            async move {
                self.safe_put_index_meta(&key, metadata).await;
            }
        })
        .await;

        run_with_concurrency(to_remove, self.fanout_width, |key| async move {
            self.safe_delete(&key).await;
        })
        .await;

        if next_index_keys != previous.index_keys || metadata_drifted {
            let manifest = Manifest {
                index_keys: next_index_keys,
                metadata_hash: current_hash,
            };
            self.safe_put(
                manifest_key,
                KvValue::Json(serde_json::to_value(&manifest)?),
                None,
            )
            .await;
        } else {
            debug!(canonical_key, "Manifest unchanged, skipping write");
        }

        Ok(())
    }

    /// Read the manifest, tolerating absence and failure as empty.
    ///
    /// A failed read degrades to a full rewrite of the index set (plus
    /// possibly stranded old keys until the next successful pass), which is
    /// safe; surfacing the error would block the reconciliation entirely.
    async fn read_manifest(&self, manifest_key: &str) -> Manifest {
        match self
            .kv
            .get(manifest_key.to_string(), GetFormat::Json)
            .await
        {
            Ok(GetResult::Found(KvValue::Json(raw))) => match serde_json::from_value(raw) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(manifest_key, error = %e, "Manifest unreadable, assuming empty");
                    Manifest::default()
                }
            },
            Ok(GetResult::Found(_)) | Ok(GetResult::NotFound) => Manifest::default(),
            Err(e) => {
                warn!(manifest_key, error = %e, "Manifest read failed, assuming empty");
                Manifest::default()
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Safe operations: synchronously successful or durably retried
    // ─────────────────────────────────────────────────────────────────────────

    async fn safe_put(&self, key: &str, value: KvValue, metadata: Option<Metadata>) -> bool {
        match self
            .kv
            .put(
                key.to_string(),
                value.clone(),
                metadata.clone(),
                PutOptions::default(),
            )
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "KV put failed, handing to durable retry");
                metrics::record_safe_op_failure("put");
                self.enqueue_retry(RetryJob::put(key, value, metadata)).await;
                false
            }
        }
    }

    async fn safe_put_index_meta(&self, key: &str, metadata: Metadata) -> bool {
        match self
            .kv
            .put_index_meta(key.to_string(), metadata.clone(), PutOptions::default())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "KV index put failed, handing to durable retry");
                metrics::record_safe_op_failure("putIndexMeta");
                self.enqueue_retry(RetryJob::put_index_meta(key, metadata))
                    .await;
                false
            }
        }
    }

    async fn safe_delete(&self, key: &str) -> bool {
        match self.kv.delete(key.to_string()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "KV delete failed, handing to durable retry");
                metrics::record_safe_op_failure("del");
                self.enqueue_retry(RetryJob::del(key)).await;
                false
            }
        }
    }

    /// Best-effort enqueue of a retry job with zero delay.
    ///
    /// A failure here is the double-failure case: both the KV store and the
    /// queue are down, and the operation is lost (logged as an error).
    async fn enqueue_retry(&self, job: RetryJob) {
        let op = job.op.as_str();
        let key = job.key.clone();
        let payload = match serde_json::to_value(&job) {
            Ok(payload) => payload,
            Err(e) => {
                error!(op, key = %key, error = %e, "Failed to encode retry job, operation lost");
                metrics::record_retry_enqueue_failed();
                return;
            }
        };
        match self.queue.enqueue(&self.retry_topic, payload, 0).await {
            Ok(_) => metrics::record_retry_enqueued(op),
            Err(e) => {
                error!(op, key = %key, error = %e, "Failed to enqueue retry job, operation lost");
                metrics::record_retry_enqueue_failed();
            }
        }
    }
}
