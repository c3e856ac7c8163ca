//! Configuration for the mirror engine.
//!
//! This module defines all configuration types needed to run the mirror
//! pipeline. Configuration is passed explicitly into constructors (never read
//! from ambient globals) and can be constructed programmatically or
//! deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use mirror_engine::config::{MirrorConfig, KvStoreConfig};
//!
//! let config = MirrorConfig {
//!     kv: KvStoreConfig {
//!         endpoint: "https://kv.example.com/client/v4".into(),
//!         account_id: "acct-1".into(),
//!         namespace_id: "ns-1".into(),
//!         api_token: "secret".into(),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! MirrorConfig
//! ├── kv: KvStoreConfig          # Remote store endpoint + credentials
//! ├── http_retry: HttpRetryConfig # KV client local retry tuning
//! ├── fanout: FanoutConfig       # Index write/delete parallelism
//! ├── queue: DispatchQueueConfig # Sweep interval, publish give-up
//! └── worker: RetryWorkerConfig  # Topic, attempts, exponential delays
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! kv:
//!   endpoint: "https://kv.example.com/client/v4"
//!   account_id: "acct-1"
//!   namespace_id: "ns-9f2"
//!   api_token: "${KV_API_TOKEN}"
//!
//! http_retry:
//!   max_retries: 4
//!   base_delay_ms: 200
//!
//! fanout:
//!   width: 20
//!
//! queue:
//!   sweep_interval: "1m"
//!
//! worker:
//!   topic: "kv-retry"
//!   max_attempts: 8
//! ```

use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object for the mirror pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MirrorConfig {
    /// Remote KV store endpoint and credentials.
    #[serde(default)]
    pub kv: KvStoreConfig,

    /// KV client local retry tuning.
    #[serde(default)]
    pub http_retry: HttpRetryConfig,

    /// Bounded-parallelism settings for index key fan-out.
    #[serde(default)]
    pub fanout: FanoutConfig,

    /// Delayed dispatch queue settings.
    #[serde(default)]
    pub queue: DispatchQueueConfig,

    /// Retry worker settings.
    #[serde(default)]
    pub worker: RetryWorkerConfig,
}

impl MirrorConfig {
    /// Create a minimal config for testing: fast retries, tiny fan-out,
    /// the given URL used verbatim as the KV namespace base.
    pub fn for_testing(kv_base_url: &str) -> Self {
        Self {
            kv: KvStoreConfig::for_testing(kv_base_url),
            http_retry: HttpRetryConfig::testing(),
            fanout: FanoutConfig { width: 4 },
            queue: DispatchQueueConfig::default(),
            worker: RetryWorkerConfig::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// KvStoreConfig: remote store endpoint + credentials
// ═══════════════════════════════════════════════════════════════════════════════

/// Remote KV store endpoint and credentials.
///
/// The value/keys routes are served under a per-namespace base URL. When
/// `account_id` and `namespace_id` are set, the base is composed as
/// `{endpoint}/accounts/{account_id}/storage/kv/namespaces/{namespace_id}`;
/// when both are empty the `endpoint` is used verbatim (tests point this at a
/// local mock server).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvStoreConfig {
    /// API root of the remote store.
    pub endpoint: String,

    /// Account the namespace lives under.
    #[serde(default)]
    pub account_id: String,

    /// Namespace holding the mirrored keys.
    #[serde(default)]
    pub namespace_id: String,

    /// Bearer token for authentication.
    pub api_token: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_sec")]
    pub request_timeout_sec: u64,
}

fn default_request_timeout_sec() -> u64 {
    30
}

impl Default for KvStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            account_id: String::new(),
            namespace_id: String::new(),
            api_token: String::new(),
            request_timeout_sec: 30,
        }
    }
}

impl KvStoreConfig {
    /// The per-namespace base URL that `/values/{key}` and `/keys` hang off.
    pub fn namespace_url(&self) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        if self.account_id.is_empty() && self.namespace_id.is_empty() {
            endpoint.to_string()
        } else {
            format!(
                "{}/accounts/{}/storage/kv/namespaces/{}",
                endpoint, self.account_id, self.namespace_id
            )
        }
    }

    /// Per-request timeout as a Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec)
    }

    /// Create a config for testing against a local mock server.
    pub fn for_testing(base_url: &str) -> Self {
        Self {
            endpoint: base_url.to_string(),
            account_id: String::new(),
            namespace_id: String::new(),
            api_token: "test-token".to_string(),
            request_timeout_sec: 5,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HttpRetryConfig: KV client local retry tuning
// ═══════════════════════════════════════════════════════════════════════════════

/// Serde-facing view of the KV client's retry tuning.
///
/// Converted to [`RetryConfig`] via [`retry_config()`](Self::retry_config)
/// where the client needs `Duration`s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRetryConfig {
    /// Maximum number of retries after the initial attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay in milliseconds for the exponential schedule.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Ceiling in milliseconds for the exponential schedule.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Upper bound in milliseconds for random jitter.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_max_retries() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_jitter_ms() -> u64 {
    200
}

impl Default for HttpRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter_ms: 200,
        }
    }
}

impl HttpRetryConfig {
    /// Fast-fail retry tuning for tests.
    pub fn testing() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 5,
            max_delay_ms: 20,
            jitter_ms: 1,
        }
    }

    /// Convert to the runtime [`RetryConfig`].
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: Duration::from_millis(self.jitter_ms),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FanoutConfig: index fan-out parallelism
// ═══════════════════════════════════════════════════════════════════════════════

/// Bounded-parallelism settings for index key writes/deletes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Maximum concurrent KV operations per reconciliation (clamped to >= 1).
    #[serde(default = "default_fanout_width")]
    pub width: usize,
}

fn default_fanout_width() -> usize {
    20
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self { width: 20 }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DispatchQueueConfig: sweep interval + publish give-up
// ═══════════════════════════════════════════════════════════════════════════════

/// Delayed dispatch queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchQueueConfig {
    /// How often the sweeper scans the queue, as a duration string (e.g. "1m").
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: String,

    /// Publish attempts before an entry is given up and dead-lettered.
    #[serde(default = "default_max_publish_attempts")]
    pub max_publish_attempts: u32,
}

fn default_sweep_interval() -> String {
    "1m".to_string()
}

fn default_max_publish_attempts() -> u32 {
    3
}

impl Default for DispatchQueueConfig {
    fn default() -> Self {
        Self {
            sweep_interval: "1m".to_string(),
            max_publish_attempts: 3,
        }
    }
}

impl DispatchQueueConfig {
    /// Parse the sweep interval string to a Duration (falls back to 60s).
    pub fn sweep_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.sweep_interval).unwrap_or(Duration::from_secs(60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetryWorkerConfig: durable retry schedule
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryWorkerConfig {
    /// Topic the failed-operation jobs travel on.
    #[serde(default = "default_retry_topic")]
    pub topic: String,

    /// Maximum durable attempts before dead-lettering.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay in minutes for the exponential re-enqueue schedule.
    #[serde(default = "default_base_delay_min")]
    pub base_delay_min: u32,

    /// Ceiling in minutes for the exponential re-enqueue schedule.
    #[serde(default = "default_max_delay_min")]
    pub max_delay_min: u32,
}

fn default_retry_topic() -> String {
    "kv-retry".to_string()
}

fn default_max_attempts() -> u32 {
    8
}

fn default_base_delay_min() -> u32 {
    1
}

fn default_max_delay_min() -> u32 {
    60
}

impl Default for RetryWorkerConfig {
    fn default() -> Self {
        Self {
            topic: "kv-retry".to_string(),
            max_attempts: 8,
            base_delay_min: 1,
            max_delay_min: 60,
        }
    }
}

impl RetryWorkerConfig {
    /// Re-enqueue delay in minutes for a given attempt number (1-indexed).
    ///
    /// `delay = min(max_delay_min, base_delay_min * 2^(attempt-1))`
    pub fn backoff_minutes(&self, attempt: u32) -> u32 {
        let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay_min
            .saturating_mul(exp)
            .min(self.max_delay_min)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
