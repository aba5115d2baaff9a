// Integration tests for the integration operator API

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use conduit::api::WebhookAppState;
use conduit::config::{new_runtime_config, QueuesConfig};
use conduit::credentials::Credentials;
use conduit::integration::{IntegrationStore, MemoryIntegrationStore};
use conduit::queue::{Dispatcher, INTEGRATION_SYNC, WEBHOOK_PROCESSING};
use conduit::rate_limit::RateLimiters;
use connector_manager::api::create_router;
use connector_manager::{ConnectorRegistry, IntegrationManager, IntegrationSpec, ManagerConfig};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    manager: Arc<IntegrationManager>,
    dispatcher: Dispatcher,
}

fn test_app() -> TestApp {
    let registry = Arc::new(ConnectorRegistry::with_builtin_connectors(Duration::from_secs(5)));
    let queues = QueuesConfig::default();
    let dispatcher = Dispatcher::new(queues.dispatcher_config(), queues.definitions());
    let store: Arc<dyn IntegrationStore> = Arc::new(MemoryIntegrationStore::new());
    let manager = Arc::new(IntegrationManager::new(
        registry.clone(),
        dispatcher.clone(),
        store.clone(),
        None,
        ManagerConfig::default(),
    ));

    let webhooks = WebhookAppState {
        dispatcher: dispatcher.clone(),
        store,
        runtime_config: new_runtime_config(),
        secrets: Arc::new(HashMap::new()),
        providers: Arc::new(registry.providers().into_iter().collect::<HashSet<_>>()),
    };
    let limiters = Arc::new(RateLimiters::from_config(&Default::default()));
    let router = create_router(manager.clone(), webhooks, limiters);

    TestApp {
        router,
        manager,
        dispatcher,
    }
}

async fn add_webhook_integration(app: &TestApp, id: &str) {
    app.manager
        .create_integration(IntegrationSpec::new(
            id,
            "org-1",
            "webhook",
            json!({}),
            Credentials::bearer("unused"),
        ))
        .await
        .unwrap();
}

async fn send(app: &TestApp, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("X-Forwarded-For", "10.0.0.1");
    let request = match body {
        Some(b) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(&b).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_list_connectors() {
    let app = test_app();
    let (status, body) = send(&app, "GET", "/api/connectors", None).await;
    assert_eq!(status, StatusCode::OK);

    let providers: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["provider"].as_str().unwrap())
        .collect();
    assert_eq!(providers, vec!["slack", "smtp", "webhook"]);
}

#[tokio::test]
async fn test_status_and_test_endpoints() {
    let app = test_app();
    add_webhook_integration(&app, "hook-1").await;

    let (status, body) = send(&app, "GET", "/api/integrations/hook-1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "connected");
    assert_eq!(body["initialized"], true);

    let (status, body) = send(&app, "POST", "/api/integrations/hook-1/test", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["integrationId"], "hook-1");
    assert_eq!(body["healthy"], true);
}

#[tokio::test]
async fn test_unknown_integration_is_404() {
    let app = test_app();
    for (method, uri) in [
        ("GET", "/api/integrations/missing/status"),
        ("POST", "/api/integrations/missing/test"),
        ("POST", "/api/integrations/missing/sync"),
    ] {
        let (status, body) = send(&app, method, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{} {}", method, uri);
        assert!(body["error"].as_str().unwrap().contains("missing"));
    }
}

#[tokio::test]
async fn test_sync_endpoint_dedups_pending_job() {
    let app = test_app();
    add_webhook_integration(&app, "hook-2").await;

    let (status, body) = send(&app, "POST", "/api/integrations/hook-2/sync", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["jobId"].as_str().is_some());

    let (status, body) = send(&app, "POST", "/api/integrations/hook-2/sync", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], "already_scheduled");

    assert_eq!(app.dispatcher.stats(INTEGRATION_SYNC).unwrap().waiting, 1);
}

#[tokio::test]
async fn test_webhook_ingress_is_mounted() {
    let app = test_app();
    let (status, body) = send(
        &app,
        "POST",
        "/webhooks/webhook",
        Some(json!({"type": "order.created", "id": 7})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["jobId"].as_str().is_some());
    assert_eq!(app.dispatcher.stats(WEBHOOK_PROCESSING).unwrap().waiting, 1);
}

#[tokio::test]
async fn test_rate_limit_headers_present() {
    let app = test_app();
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/connectors")
                .header("X-Forwarded-For", "10.0.0.2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-ratelimit-limit"));
}
