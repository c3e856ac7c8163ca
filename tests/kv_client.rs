// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! KV Client HTTP Tests
//!
//! Drives the real [`KvClient`] against a local wiremock server: status
//! classification, retry/backoff behavior, multipart encoding, and the
//! keys-listing wire format. No external services required.

use mirror_engine::{
    GetFormat, GetResult, KvClient, KvStore, KvValue, ListKeysQuery, Metadata, MirrorConfig,
    MirrorError, PutOptions,
};
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn client(server: &MockServer) -> KvClient {
    let config = MirrorConfig::for_testing(&server.uri());
    KvClient::new(&config.kv, config.http_retry.retry_config()).unwrap()
}

#[tokio::test]
async fn get_parses_json_value() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/values/doc1"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"title": "hi"})))
        .expect(1)
        .mount(&server)
        .await;

    let result = client(&server)
        .await
        .get("doc1".to_string(), GetFormat::Json)
        .await
        .unwrap();

    assert_eq!(result, GetResult::Found(KvValue::Json(json!({"title": "hi"}))));
}

#[tokio::test]
async fn get_returns_text_when_asked() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/values/doc2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("plain body"))
        .mount(&server)
        .await;

    let result = client(&server)
        .await
        .get("doc2".to_string(), GetFormat::Text)
        .await
        .unwrap();

    assert_eq!(result, GetResult::Found(KvValue::Text("plain body".into())));
}

#[tokio::test]
async fn get_404_is_an_explicit_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/values/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1) // no retries on not-found
        .mount(&server)
        .await;

    let result = client(&server)
        .await
        .get("missing".to_string(), GetFormat::Json)
        .await
        .unwrap();

    assert_eq!(result, GetResult::NotFound);
}

#[tokio::test]
async fn put_without_metadata_sends_raw_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/values/doc3"))
        .and(header("content-type", "application/json"))
        .and(body_string_contains("\"title\""))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .await
        .put(
            "doc3".to_string(),
            KvValue::Json(json!({"title": "hi"})),
            None,
            PutOptions::default(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn put_with_metadata_sends_multipart_fields() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/values/doc4"))
        .and(body_string_contains("name=\"value\""))
        .and(body_string_contains("name=\"metadata\""))
        .and(body_string_contains("\"canonical\""))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut metadata = Metadata::new();
    metadata.insert("canonical".to_string(), json!("doc4"));

    client(&server)
        .await
        .put(
            "doc4".to_string(),
            KvValue::Text("body".to_string()),
            Some(metadata),
            PutOptions::default(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn put_index_meta_sends_placeholder_value() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/values/idx1"))
        .and(body_string_contains("name=\"value\""))
        .and(body_string_contains("name=\"metadata\""))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut metadata = Metadata::new();
    metadata.insert("canonical".to_string(), json!("doc4"));

    client(&server)
        .await
        .put_index_meta("idx1".to_string(), metadata, PutOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn put_forwards_expiration_ttl_as_query_param() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/values/doc5"))
        .and(query_param("expiration_ttl", "3600"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .await
        .put(
            "doc5".to_string(),
            KvValue::Text("v".to_string()),
            None,
            PutOptions {
                expiration_ttl: Some(3600),
                expiration: None,
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn transient_503_is_retried_until_success() {
    let server = MockServer::start().await;
    // First attempt hits the one-shot 503, the retry falls through to the 200
    Mock::given(method("PUT"))
        .and(path("/values/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/values/flaky"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .await
        .put(
            "flaky".to_string(),
            KvValue::Text("v".to_string()),
            None,
            PutOptions::default(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn throttling_429_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/values/throttled"))
        .respond_with(
            ResponseTemplate::new(429).insert_header("retry-after", "0"),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/values/throttled"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .await
        .put(
            "throttled".to_string(),
            KvValue::Text("v".to_string()),
            None,
            PutOptions::default(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn permanent_4xx_fails_fast_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/values/bad"))
        .respond_with(ResponseTemplate::new(400).set_body_string("key too long"))
        .expect(1) // exactly one attempt
        .mount(&server)
        .await;

    let err = client(&server)
        .await
        .put(
            "bad".to_string(),
            KvValue::Text("v".to_string()),
            None,
            PutOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(!err.is_retryable());
    assert!(err.to_string().contains("400"));
    assert!(err.to_string().contains("key too long"));
}

#[tokio::test]
async fn retry_budget_exhaustion_reports_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/values/down"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3) // initial attempt + 2 retries (testing config)
        .mount(&server)
        .await;

    let err = client(&server)
        .await
        .delete("down".to_string())
        .await
        .unwrap_err();

    match err {
        MirrorError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected RetriesExhausted, got {other}"),
    }
}

#[tokio::test]
async fn deleting_an_absent_key_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/values/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .await
        .delete("gone".to_string())
        .await
        .unwrap();
}

#[tokio::test]
async fn list_keys_parses_result_and_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/keys"))
        .and(query_param("prefix", "idx:posts:"))
        .and(query_param("limit", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": [{"name": "idx:posts:a"}, {"name": "idx:posts:b"}],
            "result_info": {"cursor": "next-page", "count": 2}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let page = client(&server)
        .await
        .list_keys(ListKeysQuery {
            prefix: Some("idx:posts:".to_string()),
            limit: Some(2),
            cursor: None,
        })
        .await
        .unwrap();

    assert_eq!(page.keys, vec!["idx:posts:a", "idx:posts:b"]);
    assert_eq!(page.cursor.as_deref(), Some("next-page"));
    assert!(!page.complete);
}

#[tokio::test]
async fn list_keys_empty_cursor_means_complete() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/keys"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": [{"name": "a"}],
            "result_info": {"cursor": ""}
        })))
        .mount(&server)
        .await;

    let page = client(&server)
        .await
        .list_keys(ListKeysQuery::default())
        .await
        .unwrap();

    assert_eq!(page.keys, vec!["a"]);
    assert_eq!(page.cursor, None);
    assert!(page.complete);
}
