// Integration tests for webhook ingress and queue introspection routes.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use conduit::api::{create_router, WebhookAppState};
use conduit::config::{QueuesConfig, RuntimeConfig};
use conduit::integration::{IntegrationRecord, IntegrationStore, MemoryIntegrationStore};
use conduit::queue::{Dispatcher, JobCounts, WEBHOOK_PROCESSING};
use conduit::rate_limit::RateLimiters;
use conduit::webhook::{sign_body, WebhookEvent, WEBHOOK_JOB_PRIORITY};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tower::ServiceExt;

const SECRET: &str = "gh-secret";

struct Harness {
    dispatcher: Dispatcher,
    store: Arc<MemoryIntegrationStore>,
    app: Router,
}

/// Dispatcher is never started, so accepted webhooks stay waiting.
fn harness(strict: bool, max_payload: usize) -> Harness {
    let queues = QueuesConfig::default();
    let dispatcher = Dispatcher::new(queues.dispatcher_config(), queues.definitions());
    let store = Arc::new(MemoryIntegrationStore::new());

    let runtime_config = Arc::new(RwLock::new(RuntimeConfig {
        rate_limit_enabled: false,
        webhook_strict_mode: strict,
        webhook_max_payload_bytes: max_payload,
    }));

    let state = WebhookAppState {
        dispatcher: dispatcher.clone(),
        store: store.clone(),
        runtime_config,
        secrets: Arc::new(HashMap::from([("github".to_string(), SECRET.to_string())])),
        providers: Arc::new(HashSet::from([
            "github".to_string(),
            "slack".to_string(),
        ])),
    };

    Harness {
        dispatcher,
        store,
        app: create_router(state, Arc::new(RateLimiters::default())),
    }
}

fn waiting(h: &Harness) -> usize {
    h.dispatcher.stats(WEBHOOK_PROCESSING).unwrap().waiting
}

fn post(uri: &str, body: &str, signature: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json")
        .header("X-GitHub-Event", "push");
    if let Some(sig) = signature {
        builder = builder.header("X-Hub-Signature-256", sig);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(resp: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_valid_signature_enqueues_once() {
    let h = harness(true, 1 << 20);
    let body = r#"{"ref":"refs/heads/main"}"#;
    let sig = sign_body(SECRET, body.as_bytes()).unwrap();

    let resp = h
        .app
        .clone()
        .oneshot(post("/webhooks/github", body, Some(&sig)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let json = body_json(resp).await;
    let job_id = json["jobId"].as_str().unwrap().to_string();
    assert!(json["eventId"].is_string());

    assert_eq!(waiting(&h), 1);
    let job = h.dispatcher.get_job(&job_id).unwrap();
    assert_eq!(job.priority, WEBHOOK_JOB_PRIORITY);

    let event: WebhookEvent = serde_json::from_value(job.payload).unwrap();
    assert_eq!(event.provider, "github");
    assert_eq!(event.event_type, "push");
    assert!(event.verified);
    assert_eq!(event.payload["ref"], "refs/heads/main");
}

#[tokio::test]
async fn test_invalid_signature_rejected_without_enqueue() {
    let h = harness(true, 1 << 20);
    let body = r#"{"ref":"refs/heads/main"}"#;
    let sig = sign_body("wrong-secret", body.as_bytes()).unwrap();

    let resp = h
        .app
        .clone()
        .oneshot(post("/webhooks/github", body, Some(&sig)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(waiting(&h), 0);
}

#[tokio::test]
async fn test_strict_mode_requires_signature() {
    let h = harness(true, 1 << 20);
    // Not even valid JSON: rejected before the body is looked at
    let resp = h
        .app
        .clone()
        .oneshot(post("/webhooks/github", "not json", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(waiting(&h), 0);
}

#[tokio::test]
async fn test_unsigned_accepted_unverified_when_lenient() {
    let h = harness(false, 1 << 20);
    let resp = h
        .app
        .clone()
        .oneshot(post("/webhooks/slack", r#"{"type":"event_callback"}"#, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let job_id = body_json(resp).await["jobId"].as_str().unwrap().to_string();

    let job = h.dispatcher.get_job(&job_id).unwrap();
    assert_eq!(job.payload["verified"], false);
}

#[tokio::test]
async fn test_legacy_sha1_signature_treated_as_unsigned() {
    let h = harness(false, 1 << 20);
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/github")
        .header("Content-Type", "application/json")
        .header("X-GitHub-Event", "push")
        .header("X-Hub-Signature", "sha1=9f0a5b2c4d6e8f00112233445566778899aabbcc")
        .body(Body::from(r#"{"ref":"refs/heads/main"}"#))
        .unwrap();
    let resp = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let job_id = body_json(resp).await["jobId"].as_str().unwrap().to_string();
    assert_eq!(h.dispatcher.get_job(&job_id).unwrap().payload["verified"], false);

    // Strict mode wants a signature it can check
    let h = harness(true, 1 << 20);
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/github")
        .header("X-Hub-Signature", "sha1=9f0a5b2c4d6e8f00112233445566778899aabbcc")
        .body(Body::from("{}"))
        .unwrap();
    let resp = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(waiting(&h), 0);
}

#[tokio::test]
async fn test_unknown_provider_404() {
    let h = harness(false, 1 << 20);
    let resp = h
        .app
        .clone()
        .oneshot(post("/webhooks/nope", "{}", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_non_object_body_400() {
    let h = harness(false, 1 << 20);
    let resp = h
        .app
        .clone()
        .oneshot(post("/webhooks/slack", "[1,2,3]", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(waiting(&h), 0);
}

#[tokio::test]
async fn test_oversized_body_413() {
    let h = harness(false, 16);
    let body = json!({"padding": "x".repeat(64)}).to_string();
    let resp = h
        .app
        .clone()
        .oneshot(post("/webhooks/slack", &body, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_query_challenge_echoed() {
    let h = harness(true, 1 << 20);
    let req = Request::builder()
        .method("GET")
        .uri("/webhooks/github?hub.challenge=abc123")
        .body(Body::empty())
        .unwrap();
    let resp = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    assert_eq!(body_text(resp).await, "abc123");
    assert_eq!(waiting(&h), 0);
}

#[tokio::test]
async fn test_slack_url_verification_echoed() {
    let h = harness(false, 1 << 20);
    let resp = h
        .app
        .clone()
        .oneshot(post(
            "/webhooks/slack",
            r#"{"type":"url_verification","challenge":"c-42"}"#,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "c-42");
    assert_eq!(waiting(&h), 0);
}

#[tokio::test]
async fn test_generic_integration_path() {
    let h = harness(true, 1 << 20);
    h.store
        .insert(&IntegrationRecord::new(
            "int-1",
            "org-1",
            "webhook",
            json!({"webhook_secret": "per-integration"}),
        ))
        .unwrap();

    let body = r#"{"event":"order.created"}"#;
    let sig = sign_body("per-integration", body.as_bytes()).unwrap();
    let resp = h
        .app
        .clone()
        .oneshot(post("/webhooks/integrations/int-1", body, Some(&sig)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let job_id = body_json(resp).await["jobId"].as_str().unwrap().to_string();

    let event: WebhookEvent =
        serde_json::from_value(h.dispatcher.get_job(&job_id).unwrap().payload).unwrap();
    assert_eq!(event.integration_id.as_deref(), Some("int-1"));
    assert_eq!(event.event_type, "order.created");
}

#[tokio::test]
async fn test_generic_unknown_integration_404() {
    let h = harness(false, 1 << 20);
    let resp = h
        .app
        .clone()
        .oneshot(post("/webhooks/integrations/missing", "{}", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_queue_stats_route() {
    let h = harness(false, 1 << 20);
    for _ in 0..2 {
        h.app
            .clone()
            .oneshot(post("/webhooks/slack", "{}", None))
            .await
            .unwrap();
    }

    let req = Request::builder()
        .uri("/api/queues/webhook-processing/stats")
        .body(Body::empty())
        .unwrap();
    let resp = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let counts: Value = body_json(resp).await;
    assert_eq!(counts["waiting"], 2);
    assert_eq!(counts["failed"], 0);
    assert_eq!(
        h.dispatcher.stats(WEBHOOK_PROCESSING).unwrap(),
        JobCounts {
            waiting: 2,
            ..JobCounts::default()
        }
    );

    let req = Request::builder()
        .uri("/api/queues/nope/stats")
        .body(Body::empty())
        .unwrap();
    let resp = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
