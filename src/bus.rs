// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Topic bus and dead-letter integration traits.
//!
//! The mirror pipeline publishes retry work to a pub/sub transport and
//! records exhausted operations durably. Both collaborators are external;
//! these traits define exactly what we need from them, allowing testing with
//! mocks and decoupling the pipeline from any particular transport.
//!
//! Delivery contract assumed of the bus: at-least-once, no ordering. Every
//! consumer in this crate is idempotent, so redelivery is safe.

use crate::error::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Publish/subscribe transport for asynchronous work dispatch.
///
/// The host platform provides the real implementation and invokes
/// subscribers; this crate only ever publishes.
pub trait TopicBus: Send + Sync + 'static {
    /// Publish a JSON payload to a topic.
    fn publish(&self, topic: String, payload: Value) -> BoxFuture<'_, ()>;
}

/// Record of an operation that exhausted every retry attempt.
///
/// Never mutated after the fact; retained for manual inspection and operator
/// remediation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub topic: String,
    pub payload: Value,
    pub error: String,
    pub timestamp: i64,
}

/// Durable store for dead-lettered operations.
pub trait DeadLetterStore: Send + Sync + 'static {
    /// Append a record. Implementations must never overwrite earlier records.
    fn record(&self, record: DeadLetterRecord) -> BoxFuture<'_, ()>;
}

/// A no-op bus for testing/standalone mode. Logs and discards.
#[derive(Clone)]
pub struct NoOpTopicBus;

impl TopicBus for NoOpTopicBus {
    fn publish(&self, topic: String, payload: Value) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tracing::debug!(topic = %topic, payload = %payload, "NoOp: would publish");
            Ok(())
        })
    }
}

/// A no-op dead-letter store for testing/standalone mode.
///
/// Dropping a dead letter loses the last trace of a failed operation, so this
/// logs at error level rather than debug.
#[derive(Clone)]
pub struct NoOpDeadLetters;

impl DeadLetterStore for NoOpDeadLetters {
    fn record(&self, record: DeadLetterRecord) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tracing::error!(
                topic = %record.topic,
                error = %record.error,
                "NoOp dead-letter store: record discarded"
            );
            Ok(())
        })
    }
}
