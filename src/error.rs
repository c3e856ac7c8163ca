// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the mirror engine.
//!
//! Errors are categorized by their source (remote KV store, dispatch store,
//! topic bus) and include context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `KvStatus` (429/408/5xx) | Yes | Remote store throttling or server failure |
//! | `KvStatus` (other 4xx) | No | Bad request, auth failure, key too long |
//! | `KvTransport` | Yes | Connection refused, DNS, timeout (no status) |
//! | `RetriesExhausted` | Yes* | Local retry budget spent; durable retry applies |
//! | `Bus` | Yes | Topic bus publish failure |
//! | `DispatchStore` | No | Queue persistence errors (needs operator attention) |
//! | `DeadLetter` | No | Dead-letter store write failure |
//! | `Config` | No | Configuration invalid |
//! | `MalformedJob` | No | Retry job payload missing op/key |
//! | `UnsupportedOp` | No | Retry job names an unknown operation |
//! | `Serialization` | No | JSON encode/decode failure |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`MirrorError::is_retryable()`] to determine if an operation should be
//! retried. Retryable errors indicate transient remote conditions; the KV
//! client retries them locally, and the retry worker retries them durably.
//! Non-retryable errors indicate bugs, configuration problems, or permanent
//! rejections that retrying cannot fix.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result type alias for mirror operations.
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Errors that can occur while mirroring.
///
/// Each variant includes context about where the error occurred.
/// Use [`is_retryable()`](Self::is_retryable) to check if the operation
/// should be retried.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// The remote KV store answered with a non-success HTTP status.
    ///
    /// 429/408/5xx are transient (throttling, server trouble) and retryable.
    /// Any other 4xx is a permanent rejection and propagates immediately.
    #[error("KV store error ({operation} {key}): HTTP {status}: {message}")]
    KvStatus {
        operation: &'static str,
        key: String,
        status: u16,
        message: String,
    },

    /// Network-level failure talking to the KV store (no HTTP status).
    ///
    /// Connection refused, DNS failure, timeout. Always retryable.
    #[error("KV transport error ({operation} {key}): {message}")]
    KvTransport {
        operation: &'static str,
        key: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The KV client spent its local retry budget on transient failures.
    ///
    /// The operation is still retryable, just not synchronously: callers
    /// hand it to the durable retry path (queue + worker).
    #[error("KV retries exhausted after {attempts} attempts ({operation} {key}): {message}")]
    RetriesExhausted {
        operation: &'static str,
        key: String,
        attempts: u32,
        message: String,
    },

    /// Topic bus publish failure.
    ///
    /// Retryable via the dispatch queue's fixed backoff schedule.
    #[error("Topic bus error ({topic}): {message}")]
    Bus { topic: String, message: String },

    /// Dispatch-queue persistence error.
    ///
    /// Not retryable - indicates local/primary-store issues that need attention.
    #[error("Dispatch store error: {0}")]
    DispatchStore(#[from] sqlx::Error),

    /// Dead-letter store write failure.
    ///
    /// Not retryable - the record is lost, which is itself worth an alert.
    #[error("Dead-letter store error: {0}")]
    DeadLetter(String),

    /// Invalid or missing configuration.
    ///
    /// Not retryable - fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Retry job payload is missing its `op` or `key` field.
    ///
    /// Not retryable - the job is malformed at the source; callers log and drop.
    #[error("Malformed retry job: {0}")]
    MalformedJob(String),

    /// Retry job names an operation this worker does not implement.
    ///
    /// Not retryable - indicates a producer/consumer version mismatch.
    #[error("Unsupported retry operation: {0}")]
    UnsupportedOp(String),

    /// JSON encode/decode failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected internal error.
    ///
    /// Catch-all for errors that shouldn't happen.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MirrorError {
    /// Create a status error from an HTTP response.
    pub fn kv_status(
        operation: &'static str,
        key: impl Into<String>,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        Self::KvStatus {
            operation,
            key: key.into(),
            status,
            message: message.into(),
        }
    }

    /// Create a transport error from a reqwest error.
    pub fn kv_transport(
        operation: &'static str,
        key: impl Into<String>,
        source: reqwest::Error,
    ) -> Self {
        Self::KvTransport {
            operation,
            key: key.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a bus error.
    pub fn bus(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Bus {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Whether an HTTP status is worth retrying (throttling or server-side).
    pub fn is_retryable_status(status: u16) -> bool {
        status == 429 || status == 408 || (500..=599).contains(&status)
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::KvStatus { status, .. } => Self::is_retryable_status(*status),
            Self::KvTransport { .. } => true,
            Self::RetriesExhausted { .. } => true, // Durable retry still applies
            Self::Bus { .. } => true,
            Self::DispatchStore(_) => false, // Local persistence issues need attention
            Self::DeadLetter(_) => false,
            Self::Config(_) => false,
            Self::MalformedJob(_) => false,
            Self::UnsupportedOp(_) => false,
            Self::Serialization(_) => false,
            Self::Internal(_) => false,
        }
    }
}
