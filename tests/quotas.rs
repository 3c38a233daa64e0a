//! Route quota scenarios against a mocked quota authority.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::{service_fn, Layer, ServiceExt};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use turnstile::admission::{Outcome, RequestDescriptor, TransportKind};
use turnstile::config::{MatchMode, TurnstileConfig};
use turnstile::engine::Engine;
use turnstile::error::RejectionKind;
use turnstile::quota::RefreshOutcome;
use turnstile::transport::{AdmissionLayer, REASON_HEADER};

fn config(authority: &str) -> TurnstileConfig {
    let mut config = TurnstileConfig::default();
    config.admission.inflight_max = 0;
    config.admission.rate_rps = 0.0;
    config.adaptive.enabled = false;
    config.quotas.enabled = true;
    config.quotas.authority_url = authority.to_string();
    config.quotas.project_id = "shop".to_string();
    config.quotas.burst_factor = 1.0;
    config.quotas.request_timeout_ms = 500;
    config
}

async fn serve(server: &MockServer, body: serde_json::Value) {
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/quotas"))
        .and(query_param("project", "shop"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

fn call(route: &str) -> RequestDescriptor {
    RequestDescriptor::new(TransportKind::Http, route).with_peer_addr("192.0.2.10:4000")
}

fn admitted(engine: &Engine, route: &str) -> bool {
    match engine.admit(&call(route)) {
        Ok(admission) => {
            admission.complete(Outcome::Success);
            true
        }
        Err(rejection) => {
            assert_eq!(rejection.kind, RejectionKind::Quota);
            false
        }
    }
}

#[tokio::test]
async fn test_ten_per_ten_seconds() {
    let server = MockServer::start().await;
    serve(
        &server,
        json!({"items": [{"project": "shop", "route": "/v1/foo", "quota": 10, "interval": 10}]}),
    )
    .await;

    let engine = Engine::from_config(&config(&server.uri())).unwrap();
    let report = engine.quotas().unwrap().refresh_once().await;
    assert_eq!(report.outcome, RefreshOutcome::Applied);
    assert_eq!(report.routes_loaded, 1);

    let results: Vec<bool> = (0..11).map(|_| admitted(&engine, "/v1/foo")).collect();
    assert!(results[..10].iter().all(|ok| *ok));
    assert!(!results[10]);

    // other routes are unaffected
    for _ in 0..50 {
        assert!(admitted(&engine, "/v1/bar"));
    }
}

#[tokio::test]
async fn test_authority_outage_fails_open() {
    let server = MockServer::start().await;
    serve(
        &server,
        json!({"items": [{"project": "shop", "route": "/v1/foo", "quota": 1, "interval": 3600}]}),
    )
    .await;

    let engine = Engine::from_config(&config(&server.uri())).unwrap();
    let quotas = Arc::clone(engine.quotas().unwrap());
    quotas.refresh_once().await;
    assert!(admitted(&engine, "/v1/foo"));
    assert!(!admitted(&engine, "/v1/foo"));

    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let report = quotas.refresh_once().await;
    assert_eq!(report.outcome, RefreshOutcome::Cleared);
    assert_eq!(quotas.len(), 0);
    for _ in 0..100 {
        assert!(admitted(&engine, "/v1/foo"));
    }
}

#[tokio::test]
async fn test_repeated_refresh_is_idempotent() {
    let server = MockServer::start().await;
    let body = json!({"items": [
        {"project": "shop", "route": "/v1/foo", "quota": 3, "interval": 3600},
        {"project": "shop", "route": "/v1/bar", "quota": 5, "interval": 60}
    ]});
    serve(&server, body).await;

    let engine = Engine::from_config(&config(&server.uri())).unwrap();
    let quotas = engine.quotas().unwrap();
    quotas.refresh_once().await;
    assert!(admitted(&engine, "/v1/foo"));
    assert!(admitted(&engine, "/v1/foo"));

    let before = quotas.table().snapshot();
    quotas.refresh_once().await;
    let after = quotas.table().snapshot();

    assert_eq!(before.len(), after.len());
    for route in before.routes() {
        assert_eq!(before.get(route), after.get(route));
    }
    // spent tokens survive an identical refresh
    assert!(admitted(&engine, "/v1/foo"));
    assert!(!admitted(&engine, "/v1/foo"));
}

#[tokio::test]
async fn test_prefix_matching_through_engine() {
    let server = MockServer::start().await;
    serve(
        &server,
        json!({"items": [
            {"project": "shop", "route": "/v1/orders", "quota": 1, "interval": 3600},
            {"project": "shop", "route": "/v1/orders/export", "quota": 2, "interval": 3600}
        ]}),
    )
    .await;

    let mut config = config(&server.uri());
    config.quotas.match_mode = MatchMode::Prefix;
    let engine = Engine::from_config(&config).unwrap();
    engine.quotas().unwrap().refresh_once().await;

    assert!(admitted(&engine, "/v1/orders/17"));
    assert!(!admitted(&engine, "/v1/orders/18"));
    // exact entry has its own limiter
    assert!(admitted(&engine, "/v1/orders/export"));
    assert!(admitted(&engine, "/v1/orders/export"));
    assert!(!admitted(&engine, "/v1/orders/export"));
    // plain prefix: `/v1/orders` also covers `/v1/ordersbulk`
    assert!(!admitted(&engine, "/v1/ordersbulk"));
    assert!(admitted(&engine, "/v2/orders"));
}

#[tokio::test]
async fn test_background_refresh_feeds_http_layer() {
    let server = MockServer::start().await;
    serve(
        &server,
        json!({"items": [{"project": "shop", "route": "/v1/foo", "quota": 1, "interval": 3600}]}),
    )
    .await;

    let engine = Arc::new(Engine::from_config(&config(&server.uri())).unwrap());
    let shutdown = CancellationToken::new();
    let handles = engine.start(shutdown.clone());

    let quotas = Arc::clone(engine.quotas().unwrap());
    for _ in 0..50 {
        if quotas.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(quotas.len(), 1);

    let layer = AdmissionLayer::http(Arc::clone(&engine));
    let handler = service_fn(|_req: http::Request<String>| async {
        Ok::<_, std::convert::Infallible>(http::Response::new("ok".to_string()))
    });
    let request = || http::Request::builder().uri("/v1/foo").body(String::new()).unwrap();

    let first = layer.layer(handler.clone()).oneshot(request()).await.unwrap();
    assert_eq!(first.status(), http::StatusCode::OK);

    let second = layer.layer(handler).oneshot(request()).await.unwrap();
    assert_eq!(second.status(), http::StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(second.headers()[REASON_HEADER], "QUOTA_RATE_LIMITED");

    shutdown.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}
