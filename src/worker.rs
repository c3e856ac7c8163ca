// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry worker: the durable (slow) retry path for failed KV operations.
//!
//! The reconciliation engine converts every failed KV mutation into a
//! [`RetryJob`] and enqueues it on the dispatch queue. The queue publishes it
//! to the retry topic, the platform hands the message to this worker, and the
//! worker replays the operation:
//!
//! ```text
//! engine failure ──▶ queue (delay 0) ──▶ bus ──▶ RetryWorker ──▶ KV store
//!                       ▲                                 │
//!                       └── re-enqueue, exponential ◀─────┤ failure
//!                                                         ▼ attempts > max
//!                                                   Dead-Letter Store
//! ```
//!
//! # Attempt Accounting
//!
//! `attempt` counts completed durable attempts. On failure,
//! `next_attempt = attempt + 1`; once it exceeds `max_attempts` (default 8)
//! the job is dead-lettered exactly once and never retried again. Delays grow
//! as `min(max_delay_min, base_delay_min * 2^(next_attempt-1))` minutes.

use crate::bus::{DeadLetterRecord, DeadLetterStore};
use crate::config::RetryWorkerConfig;
use crate::error::{MirrorError, Result};
use crate::kv::{KvStore, KvValue, Metadata, PutOptions};
use crate::metrics;
use crate::queue::{now_epoch, DispatchQueue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A KV mutation kind carried inside a retry job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvOp {
    #[serde(rename = "put")]
    Put,
    #[serde(rename = "putIndexMeta")]
    PutIndexMeta,
    #[serde(rename = "del")]
    Del,
}

impl KvOp {
    /// Parse the wire name. `None` for operations this worker doesn't know.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "put" => Some(KvOp::Put),
            "putIndexMeta" => Some(KvOp::PutIndexMeta),
            "del" => Some(KvOp::Del),
            _ => None,
        }
    }

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            KvOp::Put => "put",
            KvOp::PutIndexMeta => "putIndexMeta",
            KvOp::Del => "del",
        }
    }
}

/// Description of exactly one KV mutation to replay.
///
/// Serialized as the payload of a dispatch entry / bus message, so the wire
/// shape is part of the crate's compatibility surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryJob {
    pub op: KvOp,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<KvValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opts: Option<PutOptions>,
    #[serde(default)]
    pub attempt: u32,
}

impl RetryJob {
    /// Build a put job from the failed operation's arguments.
    pub fn put(key: impl Into<String>, value: KvValue, metadata: Option<Metadata>) -> Self {
        Self {
            op: KvOp::Put,
            key: key.into(),
            value: Some(value),
            metadata,
            opts: None,
            attempt: 0,
        }
    }

    /// Build an index-metadata job.
    pub fn put_index_meta(key: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            op: KvOp::PutIndexMeta,
            key: key.into(),
            value: None,
            metadata: Some(metadata),
            opts: None,
            attempt: 0,
        }
    }

    /// Build a delete job.
    pub fn del(key: impl Into<String>) -> Self {
        Self {
            op: KvOp::Del,
            key: key.into(),
            value: None,
            metadata: None,
            opts: None,
            attempt: 0,
        }
    }

    /// Parse a bus payload.
    ///
    /// Distinguishes two failure classes per the worker's contract:
    /// a payload missing `op`/`key` is [`MirrorError::MalformedJob`] (callers
    /// log and drop), while an unknown `op` is [`MirrorError::UnsupportedOp`]
    /// (raised - it signals a producer/consumer version mismatch, not noise).
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let obj = payload
            .as_object()
            .ok_or_else(|| MirrorError::MalformedJob("payload is not an object".to_string()))?;

        let op_str = obj
            .get("op")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| MirrorError::MalformedJob("missing op".to_string()))?;
        let key = obj
            .get("key")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| MirrorError::MalformedJob("missing key".to_string()))?
            .to_string();

        let op =
            KvOp::parse(op_str).ok_or_else(|| MirrorError::UnsupportedOp(op_str.to_string()))?;

        let value = match obj.get("value") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                serde_json::from_value::<KvValue>(v.clone())
                    .map_err(|e| MirrorError::MalformedJob(format!("bad value field: {}", e)))?,
            ),
        };
        let metadata = match obj.get("metadata") {
            None | Some(Value::Null) => None,
            Some(Value::Object(m)) => Some(m.clone()),
            Some(_) => {
                return Err(MirrorError::MalformedJob(
                    "metadata is not an object".to_string(),
                ))
            }
        };
        let opts = match obj.get("opts") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                serde_json::from_value::<PutOptions>(v.clone())
                    .map_err(|e| MirrorError::MalformedJob(format!("bad opts field: {}", e)))?,
            ),
        };
        let attempt = obj.get("attempt").and_then(Value::as_u64).unwrap_or(0) as u32;

        Ok(Self {
            op,
            key,
            value,
            metadata,
            opts,
            attempt,
        })
    }
}

/// Consumer of the retry topic.
///
/// Stateless between messages; the platform invokes [`handle()`](Self::handle)
/// once per delivery.
pub struct RetryWorker {
    kv: Arc<dyn KvStore>,
    queue: DispatchQueue,
    dead_letters: Arc<dyn DeadLetterStore>,
    config: RetryWorkerConfig,
}

impl RetryWorker {
    pub fn new(
        kv: Arc<dyn KvStore>,
        queue: DispatchQueue,
        dead_letters: Arc<dyn DeadLetterStore>,
        config: RetryWorkerConfig,
    ) -> Self {
        Self {
            kv,
            queue,
            dead_letters,
            config,
        }
    }

    /// Process one retry message.
    ///
    /// Returns `Ok` whenever the message is fully handled - including the
    /// failure paths that re-enqueue or dead-letter. Only an unsupported
    /// operation raises.
    pub async fn handle(&self, payload: &Value) -> Result<()> {
        let job = match RetryJob::from_payload(payload) {
            Ok(job) => job,
            Err(e @ MirrorError::MalformedJob(_)) => {
                warn!(error = %e, "Dropping malformed retry job");
                metrics::record_retry_job(&self.config.topic, "malformed");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match self.execute(&job).await {
            Ok(()) => {
                debug!(
                    op = job.op.as_str(),
                    key = %job.key,
                    attempt = job.attempt,
                    "Retried KV operation succeeded"
                );
                metrics::record_retry_job(&self.config.topic, "ok");
                Ok(())
            }
            Err(e) => self.handle_failure(job, e).await,
        }
    }

    async fn execute(&self, job: &RetryJob) -> Result<()> {
        let opts = job.opts.clone().unwrap_or_default();
        match job.op {
            KvOp::Put => {
                let value = job.value.clone().ok_or_else(|| {
                    MirrorError::MalformedJob(format!("put job for {} has no value", job.key))
                })?;
                self.kv
                    .put(job.key.clone(), value, job.metadata.clone(), opts)
                    .await
            }
            KvOp::PutIndexMeta => {
                let metadata = job.metadata.clone().ok_or_else(|| {
                    MirrorError::MalformedJob(format!(
                        "putIndexMeta job for {} has no metadata",
                        job.key
                    ))
                })?;
                self.kv.put_index_meta(job.key.clone(), metadata, opts).await
            }
            KvOp::Del => self.kv.delete(job.key.clone()).await,
        }
    }

    async fn handle_failure(&self, job: RetryJob, err: MirrorError) -> Result<()> {
        let next_attempt = job.attempt + 1;

        if next_attempt > self.config.max_attempts {
            warn!(
                op = job.op.as_str(),
                key = %job.key,
                attempts = job.attempt,
                error = %err,
                "Retry attempts exhausted, dead-lettering"
            );
            let record = DeadLetterRecord {
                topic: self.config.topic.clone(),
                payload: serde_json::to_value(&job)?,
                error: err.to_string(),
                timestamp: now_epoch(),
            };
            match self.dead_letters.record(record).await {
                Ok(()) => {
                    metrics::record_dead_letter(&self.config.topic);
                    metrics::record_retry_job(&self.config.topic, "dead_lettered");
                }
                Err(dl_err) => {
                    error!(
                        key = %job.key,
                        error = %dl_err,
                        "Dead-letter write failed, record lost"
                    );
                }
            }
            return Ok(());
        }

        let delay = self.config.backoff_minutes(next_attempt);
        let mut retry = job;
        retry.attempt = next_attempt;
        warn!(
            op = retry.op.as_str(),
            key = %retry.key,
            attempt = next_attempt,
            delay_minutes = delay,
            error = %err,
            "Retried KV operation failed, re-enqueueing"
        );

        let payload = serde_json::to_value(&retry)?;
        match self.queue.enqueue(&self.config.topic, payload, delay).await {
            Ok(_) => {
                metrics::record_retry_job(&self.config.topic, "rescheduled");
                Ok(())
            }
            Err(enqueue_err) => {
                // Distinct error class: double failure, the operation is lost
                error!(
                    op = retry.op.as_str(),
                    key = %retry.key,
                    error = %enqueue_err,
                    "Failed to re-enqueue retry job, operation lost"
                );
                metrics::record_retry_job(&self.config.topic, "enqueue_failed");
                Ok(())
            }
        }
    }
}
