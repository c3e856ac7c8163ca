// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Delayed dispatch queue: a store-backed timer for deferred publishing.
//!
//! Entries carry a topic and a JSON payload plus a minute-granularity delay.
//! A periodic sweep scans the queue and publishes every entry whose delay has
//! elapsed to the topic bus. Publishing failures are rescheduled on a fixed
//! backoff schedule (1 min, 10 min, 30 min); an entry that fails more than
//! `max_publish_attempts` times is dead-lettered, never silently dropped.
//!
//! # Claim Semantics
//!
//! Sweeps may run concurrently (overlapping timers, multiple nodes). To avoid
//! double-publishing, each entry is claimed through a single-entry
//! transactional read-check-act: the claim removes the entry only if it still
//! exists with the retry count the sweep observed. The sweep that wins the
//! claim is the only publisher; losers skip. A publish failure re-inserts the
//! entry with its bumped retry count, which is the queue's equivalent of an
//! update.
//!
//! # Durability
//!
//! The store behind the queue is a trait; production deployments back it with
//! the primary store's queue collection. [`SqliteDispatchStore`] is the
//! bundled implementation for standalone deployments and tests - small write
//! volume, WAL mode, busy-retry with exponential backoff.

use crate::bus::{DeadLetterRecord, DeadLetterStore, TopicBus};
use crate::config::DispatchQueueConfig;
use crate::error::{BoxFuture, MirrorError, Result};
use crate::metrics;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Current wall-clock time as unix seconds.
pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Fixed reschedule delay by publish attempt number.
///
/// `1 -> 1 min, 2 -> 10 min, 3+ -> 30 min`
pub fn publish_backoff_minutes(attempt: u32) -> u32 {
    match attempt {
        0 | 1 => 1,
        2 => 10,
        _ => 30,
    }
}

/// A pending dispatch entry as read back from the store.
#[derive(Debug, Clone)]
pub struct DispatchEntry {
    /// Store-assigned identifier.
    pub id: String,
    /// Topic to publish on.
    pub topic: String,
    /// JSON payload to publish.
    pub payload: Value,
    /// Minutes the entry should wait after `enqueued_at`.
    pub delay_minutes: Option<u32>,
    /// Publish attempts so far.
    pub retry_count: u32,
    /// Unix seconds when the entry was (re)enqueued.
    pub enqueued_at: Option<i64>,
}

impl DispatchEntry {
    /// Whether the entry's delay has elapsed.
    ///
    /// Due when the timestamp or delay is unset, when the delay has elapsed,
    /// or when the timestamp sits in the future (clock anomaly - anything we
    /// cannot prove is still waiting gets published rather than stuck).
    pub fn is_due(&self, now: i64) -> bool {
        let Some(ts) = self.enqueued_at else {
            return true;
        };
        let Some(delay) = self.delay_minutes else {
            return true;
        };
        now >= ts.saturating_add(i64::from(delay) * 60) || ts > now
    }

    /// Whether the entry carries enough to publish.
    pub fn is_well_formed(&self) -> bool {
        !self.topic.is_empty() && !self.payload.is_null()
    }
}

/// A new entry headed for the store.
#[derive(Debug, Clone)]
pub struct NewDispatch {
    pub topic: String,
    pub payload: Value,
    pub delay_minutes: Option<u32>,
    pub retry_count: u32,
    pub enqueued_at: Option<i64>,
}

/// Trait defining what the queue needs from its backing collection.
///
/// Production backs this with the primary store; [`SqliteDispatchStore`] is
/// the bundled standalone implementation, and tests inject an in-memory fake.
pub trait DispatchStore: Send + Sync + 'static {
    /// Persist a new entry, returning its id.
    fn insert(&self, entry: NewDispatch) -> BoxFuture<'_, String>;

    /// Read every pending entry.
    fn scan(&self) -> BoxFuture<'_, Vec<DispatchEntry>>;

    /// Transactional read-check-act: remove the entry iff it still exists
    /// with the observed retry count. Returns whether this caller won.
    fn claim(&self, id: String, retry_count: u32) -> BoxFuture<'_, bool>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// DispatchQueue: the enqueue handle
// ═══════════════════════════════════════════════════════════════════════════════

/// Enqueue handle shared by the reconciliation engine and the retry worker.
#[derive(Clone)]
pub struct DispatchQueue {
    store: Arc<dyn DispatchStore>,
}

impl DispatchQueue {
    pub fn new(store: Arc<dyn DispatchStore>) -> Self {
        Self { store }
    }

    /// Insert an entry to be published after `delay_minutes`.
    ///
    /// Zero delay means the next sweep publishes it.
    pub async fn enqueue(&self, topic: &str, payload: Value, delay_minutes: u32) -> Result<String> {
        let id = self
            .store
            .insert(NewDispatch {
                topic: topic.to_string(),
                payload,
                delay_minutes: Some(delay_minutes),
                retry_count: 0,
                enqueued_at: Some(now_epoch()),
            })
            .await?;
        debug!(topic, id = %id, delay_minutes, "Dispatch entry enqueued");
        metrics::record_dispatch_enqueued(topic);
        Ok(id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QueueSweeper: the periodic drain
// ═══════════════════════════════════════════════════════════════════════════════

/// Counters from one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: usize,
    pub published: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    pub dropped_malformed: usize,
    pub skipped: usize,
}

/// Periodic sweep draining the dispatch queue to the topic bus.
///
/// Independent of any specific mirror: one sweeper per deployment drains
/// entries enqueued by every engine and worker.
pub struct QueueSweeper {
    store: Arc<dyn DispatchStore>,
    bus: Arc<dyn TopicBus>,
    dead_letters: Arc<dyn DeadLetterStore>,
    config: DispatchQueueConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl QueueSweeper {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        bus: Arc<dyn TopicBus>,
        dead_letters: Arc<dyn DeadLetterStore>,
        config: DispatchQueueConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            bus,
            dead_letters,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Scan the queue once, publishing every due entry.
    pub async fn sweep_once(&self) -> Result<SweepStats> {
        let now = now_epoch();
        let entries = self.store.scan().await?;
        let mut stats = SweepStats::default();

        for entry in entries {
            stats.scanned += 1;

            if !entry.is_due(now) {
                stats.skipped += 1;
                continue;
            }

            // Only the sweep that wins the claim publishes
            if !self.store.claim(entry.id.clone(), entry.retry_count).await? {
                stats.skipped += 1;
                continue;
            }

            if !entry.is_well_formed() {
                warn!(
                    id = %entry.id,
                    topic = %entry.topic,
                    "Dropping malformed dispatch entry (missing topic/payload)"
                );
                metrics::record_dispatch_malformed();
                stats.dropped_malformed += 1;
                continue;
            }

            match self
                .bus
                .publish(entry.topic.clone(), entry.payload.clone())
                .await
            {
                Ok(()) => {
                    debug!(id = %entry.id, topic = %entry.topic, "Dispatch entry published");
                    metrics::record_dispatch_published(&entry.topic);
                    stats.published += 1;
                }
                Err(e) => {
                    self.handle_publish_failure(entry, e, now, &mut stats)
                        .await;
                }
            }
        }

        if stats.scanned > 0 {
            debug!(
                scanned = stats.scanned,
                published = stats.published,
                rescheduled = stats.rescheduled,
                dead_lettered = stats.dead_lettered,
                "Sweep complete"
            );
        }
        metrics::record_sweep(&stats);
        Ok(stats)
    }

    async fn handle_publish_failure(
        &self,
        entry: DispatchEntry,
        err: MirrorError,
        now: i64,
        stats: &mut SweepStats,
    ) {
        let next = entry.retry_count + 1;
        metrics::record_publish_failure(&entry.topic);

        if next <= self.config.max_publish_attempts {
            let delay = publish_backoff_minutes(next);
            warn!(
                id = %entry.id,
                topic = %entry.topic,
                error = %err,
                attempt = next,
                delay_minutes = delay,
                "Publish failed, rescheduling"
            );
            let reinsert = NewDispatch {
                topic: entry.topic,
                payload: entry.payload,
                delay_minutes: Some(delay),
                retry_count: next,
                enqueued_at: Some(now),
            };
            match self.store.insert(reinsert).await {
                Ok(_) => stats.rescheduled += 1,
                Err(store_err) => {
                    error!(
                        error = %store_err,
                        "Failed to reschedule dispatch entry, work lost"
                    );
                }
            }
        } else {
            warn!(
                id = %entry.id,
                topic = %entry.topic,
                attempts = entry.retry_count,
                "Publish attempts exhausted, dead-lettering"
            );
            let record = DeadLetterRecord {
                topic: entry.topic.clone(),
                payload: entry.payload,
                error: err.to_string(),
                timestamp: now,
            };
            match self.dead_letters.record(record).await {
                Ok(()) => {
                    metrics::record_dead_letter(&entry.topic);
                    stats.dead_lettered += 1;
                }
                Err(dl_err) => {
                    error!(
                        id = %entry.id,
                        error = %dl_err,
                        "Dead-letter write failed, record lost"
                    );
                }
            }
        }
    }

    /// Run the sweep loop until [`shutdown()`](Self::shutdown).
    pub async fn run(&self) {
        let period = self.config.sweep_interval_duration();
        info!(period_sec = period.as_secs(), "Queue sweeper started");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup isn't a sweep
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "Sweep failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Queue sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Signal the sweep loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SqliteDispatchStore
// ═══════════════════════════════════════════════════════════════════════════════

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts, delay_ms, "SQLite busy, retrying"
                );
                metrics::record_dispatch_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// SQLite-backed dispatch store for standalone deployments and tests.
///
/// Entry volume is small (one row per in-flight retry), so a single
/// connection suffices - it also keeps `:memory:` databases coherent.
pub struct SqliteDispatchStore {
    pool: SqlitePool,
}

impl SqliteDispatchStore {
    /// Open (creating if missing) a store at the given path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| MirrorError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);
        Self::connect(options).await
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| MirrorError::Config(format!("Invalid SQLite options: {}", e)))?;
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dispatch_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT NOT NULL,
                payload TEXT NOT NULL,
                delay_minutes INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                enqueued_at INTEGER
            )
            "#,
        )
        .execute(&pool)
        .await?;

        info!("Dispatch store initialized");
        Ok(Self { pool })
    }

    /// Number of pending entries (test/ops helper).
    pub async fn len(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dispatch_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

impl DispatchStore for SqliteDispatchStore {
    fn insert(&self, entry: NewDispatch) -> BoxFuture<'_, String> {
        Box::pin(async move {
            let payload = serde_json::to_string(&entry.payload)?;
            let result = execute_with_retry("insert", || {
                sqlx::query(
                    "INSERT INTO dispatch_queue (topic, payload, delay_minutes, retry_count, enqueued_at) \
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&entry.topic)
                .bind(&payload)
                .bind(entry.delay_minutes.map(i64::from))
                .bind(i64::from(entry.retry_count))
                .bind(entry.enqueued_at)
                .execute(&self.pool)
            })
            .await?;
            Ok(result.last_insert_rowid().to_string())
        })
    }

    fn scan(&self) -> BoxFuture<'_, Vec<DispatchEntry>> {
        Box::pin(async move {
            let rows: Vec<(i64, String, String, Option<i64>, i64, Option<i64>)> =
                execute_with_retry("scan", || {
                    sqlx::query_as(
                        "SELECT id, topic, payload, delay_minutes, retry_count, enqueued_at \
                         FROM dispatch_queue ORDER BY id",
                    )
                    .fetch_all(&self.pool)
                })
                .await?;

            Ok(rows
                .into_iter()
                .map(|(id, topic, payload, delay, retry, ts)| DispatchEntry {
                    id: id.to_string(),
                    topic,
                    // An unparseable payload surfaces as null and takes the
                    // malformed-drop path
                    payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
                    delay_minutes: delay.map(|d| d.max(0) as u32),
                    retry_count: retry.max(0) as u32,
                    enqueued_at: ts,
                })
                .collect())
        })
    }

    fn claim(&self, id: String, retry_count: u32) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let Ok(id) = id.parse::<i64>() else {
                return Ok(false);
            };
            let result = execute_with_retry("claim", || {
                sqlx::query("DELETE FROM dispatch_queue WHERE id = ? AND retry_count = ?")
                    .bind(id)
                    .bind(i64::from(retry_count))
                    .execute(&self.pool)
            })
            .await?;
            Ok(result.rows_affected() == 1)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
