// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP client for the remote KV store.
//!
//! Wraps the store's REST surface (`PUT/GET/DELETE /values/{key}`,
//! `GET /keys`) behind the [`KvStore`] trait with a local retrying executor.
//!
//! # Retry Discipline
//!
//! Transient failures (HTTP 429/408/5xx, or any network-level error with no
//! status) are retried up to a configured maximum with exponential backoff
//! plus jitter; a `Retry-After` header overrides the computed delay when
//! larger. Permanent rejections (other 4xx) propagate immediately. A `get`
//! answering 404 is an explicit [`GetResult::NotFound`], not an error, and a
//! `delete` answering 404 counts as success - deletes stay idempotent under
//! at-least-once redelivery.
//!
//! # Value Encoding
//!
//! A put with metadata uses multipart encoding (`value` + `metadata` fields,
//! the store attaches the metadata to the key rather than the value). A put
//! without metadata sends the raw body with a content type inferred from the
//! value: object → JSON, text → plain, bytes → octet-stream.

use crate::config::KvStoreConfig;
use crate::error::{BoxFuture, MirrorError, Result};
use crate::metrics;
use crate::resilience::RetryConfig;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::multipart::{Form, Part};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-key metadata attached to a KV entry (not part of its value).
pub type Metadata = serde_json::Map<String, Value>;

/// A value stored at a KV key.
///
/// The variant determines the content type sent to the store when no
/// metadata forces multipart encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum KvValue {
    /// JSON document, sent as `application/json`.
    Json(Value),
    /// Plain text, sent as `text/plain`.
    Text(String),
    /// Raw bytes, sent as `application/octet-stream`.
    Bytes(Vec<u8>),
}

impl KvValue {
    /// Content type used when the value is sent as a raw body.
    pub fn content_type(&self) -> &'static str {
        match self {
            KvValue::Json(_) => "application/json",
            KvValue::Text(_) => "text/plain",
            KvValue::Bytes(_) => "application/octet-stream",
        }
    }

    /// The value as a JSON document, if it is one.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            KvValue::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// Requested decoding for a `get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetFormat {
    Json,
    Text,
    Bytes,
}

/// Outcome of a `get`: the store either has the key or it doesn't.
#[derive(Debug, Clone, PartialEq)]
pub enum GetResult {
    Found(KvValue),
    NotFound,
}

impl GetResult {
    /// Check whether the key was present.
    pub fn is_found(&self) -> bool {
        matches!(self, GetResult::Found(_))
    }

    /// Consume into the value, if present.
    pub fn into_value(self) -> Option<KvValue> {
        match self {
            GetResult::Found(v) => Some(v),
            GetResult::NotFound => None,
        }
    }
}

/// Expiration options for a put, forwarded as query parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PutOptions {
    /// Seconds from now until the entry expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_ttl: Option<u64>,

    /// Absolute expiration as a unix timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<u64>,
}

impl PutOptions {
    /// True when no option is set (nothing to forward).
    pub fn is_empty(&self) -> bool {
        self.expiration_ttl.is_none() && self.expiration.is_none()
    }
}

/// Filter/pagination parameters for `list_keys`.
#[derive(Debug, Clone, Default)]
pub struct ListKeysQuery {
    pub prefix: Option<String>,
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

/// One page of a key listing.
#[derive(Debug, Clone)]
pub struct ListKeysPage {
    pub keys: Vec<String>,
    pub cursor: Option<String>,
    pub complete: bool,
}

/// Trait defining what the mirror pipeline needs from the remote store.
///
/// The HTTP implementation is [`KvClient`]; tests inject an in-memory fake.
/// This trait keeps the reconciliation engine and retry worker decoupled from
/// the transport.
pub trait KvStore: Send + Sync + 'static {
    /// Write a value (with optional metadata) to a key.
    fn put(
        &self,
        key: String,
        value: KvValue,
        metadata: Option<Metadata>,
        opts: PutOptions,
    ) -> BoxFuture<'_, ()>;

    /// Write an index entry: a minimal placeholder value carrying metadata.
    fn put_index_meta(&self, key: String, metadata: Metadata, opts: PutOptions)
        -> BoxFuture<'_, ()>;

    /// Read a key. A missing key is [`GetResult::NotFound`], not an error.
    fn get(&self, key: String, format: GetFormat) -> BoxFuture<'_, GetResult>;

    /// Delete a key. Deleting an absent key succeeds.
    fn delete(&self, key: String) -> BoxFuture<'_, ()>;

    /// List keys by prefix, paginated by cursor.
    fn list_keys(&self, query: ListKeysQuery) -> BoxFuture<'_, ListKeysPage>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP implementation
// ═══════════════════════════════════════════════════════════════════════════════

/// Placeholder body stored at index keys; the metadata is the payload.
const INDEX_PLACEHOLDER: &str = "1";

/// Longest error-body excerpt kept in error messages.
const ERROR_BODY_EXCERPT: usize = 256;

/// Wire shape of the `GET /keys` response.
#[derive(Debug, Deserialize)]
struct ListKeysResponse {
    #[serde(default)]
    result: Vec<ListedKey>,
    #[serde(default)]
    result_info: Option<ListResultInfo>,
}

#[derive(Debug, Deserialize)]
struct ListedKey {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ListResultInfo {
    #[serde(default)]
    cursor: Option<String>,
}

/// Raw body plus content type, kept rebuildable so every retry attempt gets
/// a fresh request.
enum RawBody {
    Text(String),
    Bytes(Vec<u8>),
}

/// HTTP client for the remote KV store.
///
/// Stateless beyond its configuration; cheap to clone.
#[derive(Clone)]
pub struct KvClient {
    http: reqwest::Client,
    base: Url,
    token: String,
    retry: RetryConfig,
}

impl KvClient {
    /// Create a client from configuration.
    pub fn new(config: &KvStoreConfig, retry: RetryConfig) -> Result<Self> {
        if config.endpoint.is_empty() {
            return Err(MirrorError::Config("KV endpoint is not set".to_string()));
        }
        if config.api_token.is_empty() {
            return Err(MirrorError::Config("KV api_token is not set".to_string()));
        }

        let base = Url::parse(&config.namespace_url())
            .map_err(|e| MirrorError::Config(format!("Invalid KV endpoint: {}", e)))?;
        if base.cannot_be_a_base() {
            return Err(MirrorError::Config(
                "KV endpoint cannot be used as a base URL".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| MirrorError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base,
            token: config.api_token.clone(),
            retry,
        })
    }

    fn value_url(&self, key: &str, opts: &PutOptions) -> Url {
        let mut url = self.base.clone();
        // Validated non-cannot_be_a_base at construction
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push("values").push(key);
        }
        if let Some(ttl) = opts.expiration_ttl {
            url.query_pairs_mut()
                .append_pair("expiration_ttl", &ttl.to_string());
        }
        if let Some(at) = opts.expiration {
            url.query_pairs_mut()
                .append_pair("expiration", &at.to_string());
        }
        url
    }

    fn keys_url(&self, query: &ListKeysQuery) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push("keys");
        }
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(prefix) = &query.prefix {
                pairs.append_pair("prefix", prefix);
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
            if let Some(cursor) = &query.cursor {
                pairs.append_pair("cursor", cursor);
            }
        }
        url
    }

    /// Run a request through the retrying executor.
    ///
    /// `Ok(Some(response))` on success, `Ok(None)` for a 404 when
    /// `not_found_ok` is set. Transient failures sleep and retry until the
    /// budget is spent; permanent rejections return immediately.
    async fn execute<B>(
        &self,
        operation: &'static str,
        key: &str,
        not_found_ok: bool,
        build: B,
    ) -> Result<Option<reqwest::Response>>
    where
        B: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt: u32 = 0;
        loop {
            let sent = build().bearer_auth(&self.token).send().await;
            match sent {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        metrics::record_kv_request(operation, "ok");
                        return Ok(Some(resp));
                    }
                    if status == StatusCode::NOT_FOUND && not_found_ok {
                        metrics::record_kv_request(operation, "not_found");
                        return Ok(None);
                    }

                    let retry_after = parse_retry_after(resp.headers());
                    let body = excerpt(resp.text().await.unwrap_or_default());

                    if !MirrorError::is_retryable_status(status.as_u16()) {
                        metrics::record_kv_request(operation, "permanent_error");
                        return Err(MirrorError::kv_status(
                            operation,
                            key,
                            status.as_u16(),
                            body,
                        ));
                    }

                    if attempt >= self.retry.max_retries {
                        metrics::record_kv_retries_exhausted(operation);
                        return Err(MirrorError::RetriesExhausted {
                            operation,
                            key: key.to_string(),
                            attempts: attempt + 1,
                            message: format!("HTTP {}: {}", status.as_u16(), body),
                        });
                    }

                    let delay = self.retry.delay_with_jitter(attempt, retry_after);
                    warn!(
                        operation,
                        key,
                        status = status.as_u16(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient KV status, retrying"
                    );
                    metrics::record_kv_retry(operation);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if attempt >= self.retry.max_retries {
                        metrics::record_kv_retries_exhausted(operation);
                        return Err(MirrorError::RetriesExhausted {
                            operation,
                            key: key.to_string(),
                            attempts: attempt + 1,
                            message: e.to_string(),
                        });
                    }

                    let delay = self.retry.delay_with_jitter(attempt, None);
                    warn!(
                        operation,
                        key,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "KV transport error, retrying"
                    );
                    metrics::record_kv_retry(operation);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn put_impl(
        &self,
        key: &str,
        value: KvValue,
        metadata: Option<Metadata>,
        opts: &PutOptions,
    ) -> Result<()> {
        let url = self.value_url(key, opts);

        match metadata {
            Some(metadata) => {
                let metadata_json = serde_json::to_string(&Value::Object(metadata))?;
                let body = raw_body(&value)?;
                self.execute("put", key, false, || {
                    let part = match &body {
                        RawBody::Text(s) => Part::text(s.clone()),
                        RawBody::Bytes(b) => Part::bytes(b.clone()),
                    };
                    let form = Form::new()
                        .part("value", part)
                        .text("metadata", metadata_json.clone());
                    self.http.put(url.clone()).multipart(form)
                })
                .await?;
            }
            None => {
                let content_type = value.content_type();
                let body = raw_body(&value)?;
                self.execute("put", key, false, || {
                    let builder = self.http.put(url.clone()).header(CONTENT_TYPE, content_type);
                    match &body {
                        RawBody::Text(s) => builder.body(s.clone()),
                        RawBody::Bytes(b) => builder.body(b.clone()),
                    }
                })
                .await?;
            }
        }

        debug!(key, "KV put ok");
        Ok(())
    }

    async fn put_index_meta_impl(
        &self,
        key: &str,
        metadata: Metadata,
        opts: &PutOptions,
    ) -> Result<()> {
        let url = self.value_url(key, opts);
        let metadata_json = serde_json::to_string(&Value::Object(metadata))?;

        self.execute("putIndexMeta", key, false, || {
            let form = Form::new()
                .text("value", INDEX_PLACEHOLDER)
                .text("metadata", metadata_json.clone());
            self.http.put(url.clone()).multipart(form)
        })
        .await?;

        debug!(key, "KV index metadata put ok");
        Ok(())
    }

    async fn get_impl(&self, key: &str, format: GetFormat) -> Result<GetResult> {
        let url = self.value_url(key, &PutOptions::default());
        let resp = self
            .execute("get", key, true, || self.http.get(url.clone()))
            .await?;

        let Some(resp) = resp else {
            return Ok(GetResult::NotFound);
        };

        let value = match format {
            GetFormat::Json => KvValue::Json(
                resp.json::<Value>()
                    .await
                    .map_err(|e| MirrorError::kv_transport("get", key, e))?,
            ),
            GetFormat::Text => KvValue::Text(
                resp.text()
                    .await
                    .map_err(|e| MirrorError::kv_transport("get", key, e))?,
            ),
            GetFormat::Bytes => KvValue::Bytes(
                resp.bytes()
                    .await
                    .map_err(|e| MirrorError::kv_transport("get", key, e))?
                    .to_vec(),
            ),
        };
        Ok(GetResult::Found(value))
    }

    async fn delete_impl(&self, key: &str) -> Result<()> {
        let url = self.value_url(key, &PutOptions::default());
        // 404 tolerated: deleting an absent key is a success for idempotence
        self.execute("del", key, true, || self.http.delete(url.clone()))
            .await?;
        debug!(key, "KV delete ok");
        Ok(())
    }

    async fn list_keys_impl(&self, query: &ListKeysQuery) -> Result<ListKeysPage> {
        let url = self.keys_url(query);
        let resp = self
            .execute("listKeys", "", false, || self.http.get(url.clone()))
            .await?;

        // execute() only returns None for tolerated 404s, which listKeys
        // does not request
        let resp = resp.ok_or_else(|| {
            MirrorError::Internal("listKeys response missing".to_string())
        })?;

        let parsed: ListKeysResponse = resp
            .json()
            .await
            .map_err(|e| MirrorError::kv_transport("listKeys", "", e))?;

        let cursor = parsed
            .result_info
            .and_then(|info| info.cursor)
            .filter(|c| !c.is_empty());
        Ok(ListKeysPage {
            keys: parsed.result.into_iter().map(|k| k.name).collect(),
            complete: cursor.is_none(),
            cursor,
        })
    }
}

impl KvStore for KvClient {
    fn put(
        &self,
        key: String,
        value: KvValue,
        metadata: Option<Metadata>,
        opts: PutOptions,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.put_impl(&key, value, metadata, &opts).await })
    }

    fn put_index_meta(
        &self,
        key: String,
        metadata: Metadata,
        opts: PutOptions,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.put_index_meta_impl(&key, metadata, &opts).await })
    }

    fn get(&self, key: String, format: GetFormat) -> BoxFuture<'_, GetResult> {
        Box::pin(async move { self.get_impl(&key, format).await })
    }

    fn delete(&self, key: String) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.delete_impl(&key).await })
    }

    fn list_keys(&self, query: ListKeysQuery) -> BoxFuture<'_, ListKeysPage> {
        Box::pin(async move { self.list_keys_impl(&query).await })
    }
}

fn raw_body(value: &KvValue) -> Result<RawBody> {
    Ok(match value {
        KvValue::Json(v) => RawBody::Text(serde_json::to_string(v)?),
        KvValue::Text(s) => RawBody::Text(s.clone()),
        KvValue::Bytes(b) => RawBody::Bytes(b.clone()),
    })
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn excerpt(body: String) -> String {
    if body.len() <= ERROR_BODY_EXCERPT {
        body
    } else {
        let mut cut = ERROR_BODY_EXCERPT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body[..cut].to_string()
    }
}
