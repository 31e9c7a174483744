use std::collections::BTreeMap;
use std::time::Duration;

use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crew_enrich::{EnrichError, EnrichRequest, Enricher, HttpEnricher, HttpEnricherConfig, ResolveRequest};

fn client_for(server: &MockServer) -> HttpEnricher {
    HttpEnricher::new(HttpEnricherConfig {
        base_url: server.uri(),
        token: Some("test-token".to_string()),
        timeout: Duration::from_secs(5),
    })
    .expect("building client")
}

fn sample_request() -> EnrichRequest {
    EnrichRequest {
        row_index: 3,
        record: BTreeMap::from([
            ("sku".to_string(), "A-1".to_string()),
            ("title".to_string(), "laptop 14in i5".to_string()),
        ]),
        missing_columns: vec!["memory".to_string()],
    }
}

#[tokio::test]
async fn enrich_posts_request_and_decodes_result() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/enrich"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_partial_json(serde_json::json!({
            "row_index": 3,
            "missing_columns": ["memory"],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "primary": "Laptop 14\" Core i5",
            "derived": {"memory": "8GB"},
            "warning": null,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = client_for(&server)
        .enrich(&sample_request())
        .await
        .expect("enrich succeeds");
    assert_eq!(result.primary.as_deref(), Some("Laptop 14\" Core i5"));
    assert_eq!(result.derived.get("memory").map(String::as_str), Some("8GB"));
}

#[tokio::test]
async fn rate_limit_status_carries_retry_after_hint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/enrich"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .enrich(&sample_request())
        .await
        .expect_err("rate limited");
    match err {
        EnrichError::RateLimited { retry_after } => {
            assert_eq!(retry_after, Some(Duration::from_secs(7)))
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn server_errors_are_transient_and_client_errors_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/enrich"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;
    let err = client_for(&server)
        .enrich(&sample_request())
        .await
        .expect_err("server error");
    assert!(matches!(err, EnrichError::Transient(_)));

    server.reset().await;
    Mock::given(method("POST"))
        .and(path("/enrich"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    let err = client_for(&server)
        .enrich(&sample_request())
        .await
        .expect_err("auth error");
    assert!(matches!(err, EnrichError::Fatal(_)));
}

#[tokio::test]
async fn empty_or_undecodable_payloads_are_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/enrich"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&server)
        .await;
    let err = client_for(&server)
        .enrich(&sample_request())
        .await
        .expect_err("empty payload");
    assert!(matches!(err, EnrichError::Malformed(_)));

    server.reset().await;
    Mock::given(method("POST"))
        .and(path("/enrich"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json at all"))
        .expect(1)
        .mount(&server)
        .await;
    let err = client_for(&server)
        .enrich(&sample_request())
        .await
        .expect_err("garbage payload");
    assert!(matches!(err, EnrichError::Malformed(_)));
}

#[tokio::test]
async fn resolve_conflict_round_trips_optional_resolution() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/resolve"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "feature": "memory",
            "value": "16GB",
            "justification": "title mentions 16GB",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let request = ResolveRequest {
        row_index: 3,
        record: BTreeMap::from([("sku".to_string(), "A-1".to_string())]),
        conflict: "memory column disagrees with title".to_string(),
    };
    let resolution = client_for(&server)
        .resolve_conflict(&request)
        .await
        .expect("resolve succeeds")
        .expect("resolution present");
    assert_eq!(resolution.feature, "memory");
    assert_eq!(resolution.value, "16GB");

    server.reset().await;
    Mock::given(method("POST"))
        .and(path("/resolve"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::Value::Null))
        .expect(1)
        .mount(&server)
        .await;
    let declined = client_for(&server)
        .resolve_conflict(&request)
        .await
        .expect("resolve succeeds");
    assert!(declined.is_none());
}
