// End-to-end lifecycle of an SMTP integration against a scripted transport

use async_trait::async_trait;
use conduit::config::QueuesConfig;
use conduit::credentials::Credentials;
use conduit::integration::MemoryIntegrationStore;
use conduit::queue::{Dispatcher, OUTBOUND_MESSAGES};
use connector_manager::connectors::{
    SmtpConfig, SmtpConnector, SmtpReply, SmtpSession, SmtpTransport,
};
use connector_manager::{
    Capability, ConnectorError, ConnectorRegistry, ConnectorState, FetchOptions,
    IntegrationManager, IntegrationSpec, ManagerConfig, OutboundMessage,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Wire {
    lines: Mutex<Vec<String>>,
    opened: Mutex<usize>,
}

impl Wire {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    fn opened(&self) -> usize {
        *self.opened.lock().unwrap()
    }
}

struct ScriptedTransport(Arc<Wire>);

struct ScriptedSession(Arc<Wire>);

#[async_trait]
impl SmtpTransport for ScriptedTransport {
    async fn open(&self, _config: &SmtpConfig) -> Result<Box<dyn SmtpSession>, ConnectorError> {
        *self.0.opened.lock().unwrap() += 1;
        Ok(Box::new(ScriptedSession(self.0.clone())))
    }
}

#[async_trait]
impl SmtpSession for ScriptedSession {
    async fn command(&mut self, line: &str) -> Result<SmtpReply, ConnectorError> {
        self.0.lines.lock().unwrap().push(line.to_string());
        let reply = match line.split_whitespace().next().unwrap_or("") {
            "AUTH" => SmtpReply::new(235, "authenticated"),
            "DATA" => SmtpReply::new(354, "end with ."),
            "QUIT" => SmtpReply::new(221, "bye"),
            _ => SmtpReply::new(250, "ok"),
        };
        Ok(reply)
    }

    async fn data(&mut self, _content: &str) -> Result<SmtpReply, ConnectorError> {
        Ok(SmtpReply::new(250, "queued"))
    }
}

fn setup() -> (Arc<IntegrationManager>, Arc<ConnectorRegistry>, Dispatcher, Arc<Wire>) {
    let wire = Arc::new(Wire::default());
    let registry = Arc::new(ConnectorRegistry::new(Duration::from_secs(5)));
    let w = wire.clone();
    registry.register("smtp", move || {
        Box::new(SmtpConnector::with_transport(Arc::new(ScriptedTransport(w.clone()))))
    });

    let queues = QueuesConfig::default();
    let dispatcher = Dispatcher::new(queues.dispatcher_config(), queues.definitions());
    let manager = Arc::new(IntegrationManager::new(
        registry.clone(),
        dispatcher.clone(),
        Arc::new(MemoryIntegrationStore::new()),
        None,
        ManagerConfig::default(),
    ));
    (manager, registry, dispatcher, wire)
}

fn smtp_spec(id: &str) -> IntegrationSpec {
    IntegrationSpec::new(
        id,
        "org-1",
        "smtp",
        json!({"host": "mx.test", "port": 2525, "from": "bot@test"}),
        Credentials::basic("bot@test", "secret"),
    )
}

#[tokio::test]
async fn test_smtp_create_health_delete() {
    let (manager, registry, _dispatcher, wire) = setup();

    let instance = manager.create_integration(smtp_spec("mail-1")).await.unwrap();
    assert_eq!(instance.state(), ConnectorState::Connected);
    assert!(instance.health_check().await);
    assert!(instance.status().last_health_check.is_some());

    let lines = wire.lines();
    assert_eq!(lines[0], "EHLO localhost");
    assert!(lines[1].starts_with("AUTH PLAIN "));

    manager.delete_integration("mail-1").await.unwrap();
    assert_eq!(instance.state(), ConnectorState::Uninitialized);
    assert!(registry.get_instance("mail-1", "smtp").is_none());
    assert!(manager.instance("mail-1").is_none());
    assert_eq!(wire.lines().last().map(String::as_str), Some("QUIT"));
}

#[tokio::test]
async fn test_unsupported_capability_stays_off_the_wire() {
    let (manager, _registry, _dispatcher, wire) = setup();
    let instance = manager.create_integration(smtp_spec("mail-2")).await.unwrap();
    let before = wire.lines().len();

    let err = instance
        .fetch_messages(&FetchOptions::default())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ConnectorError::UnsupportedCapability {
            provider: "smtp".to_string(),
            capability: Capability::FetchMessages,
        }
    );
    assert!(matches!(
        instance.sync(None).await,
        Err(ConnectorError::UnsupportedCapability { .. })
    ));
    assert_eq!(wire.lines().len(), before);
    assert_eq!(wire.opened(), 1);
}

#[tokio::test]
async fn test_get_or_create_returns_same_instance() {
    let (_manager, registry, _dispatcher, _wire) = setup();
    let a = registry.get_or_create_instance("mail-3", "smtp").unwrap();
    let b = registry.get_or_create_instance("mail-3", "smtp").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_double_destroy_is_harmless() {
    let (manager, _registry, _dispatcher, wire) = setup();
    let instance = manager.create_integration(smtp_spec("mail-4")).await.unwrap();

    instance.destroy().await;
    instance.destroy().await;
    assert_eq!(instance.state(), ConnectorState::Uninitialized);
    let quits = wire.lines().iter().filter(|l| l.as_str() == "QUIT").count();
    assert_eq!(quits, 1);
}

#[tokio::test]
async fn test_queue_message_enqueues_outbound_job() {
    let (manager, _registry, dispatcher, _wire) = setup();
    manager.create_integration(smtp_spec("mail-5")).await.unwrap();

    let message = OutboundMessage {
        to: vec!["alice@test".to_string()],
        subject: Some("hello".to_string()),
        body: "hi there".to_string(),
        thread_id: None,
    };
    let job = manager.queue_message("mail-5", message).unwrap();
    assert_eq!(job.queue, OUTBOUND_MESSAGES);
    assert_eq!(job.payload["integrationId"], "mail-5");
    assert_eq!(dispatcher.stats(OUTBOUND_MESSAGES).unwrap().waiting, 1);
}

#[tokio::test]
async fn test_smtp_scenario_without_sender() {
    let (manager, registry, _dispatcher, wire) = setup();
    let spec = IntegrationSpec::new(
        "mail-6",
        "org-1",
        "smtp",
        json!({"host": "smtp.test", "port": 587}),
        Credentials::basic("a", "b"),
    );

    let instance = manager.create_integration(spec).await.unwrap();
    assert_eq!(instance.state(), ConnectorState::Connected);
    assert!(instance.health_check().await);
    assert!(Arc::ptr_eq(
        &registry.get_instance("mail-6", "smtp").unwrap(),
        &instance
    ));

    // Envelope sender falls back to the login name
    let receipt = manager
        .send_message(
            "mail-6",
            &OutboundMessage {
                to: vec!["c@test".to_string()],
                subject: None,
                body: "hi".to_string(),
                thread_id: None,
            },
        )
        .await
        .unwrap();
    assert!(receipt.message_id.ends_with("@smtp.test>"));
    assert!(wire.lines().contains(&"MAIL FROM:<a>".to_string()));

    manager.delete_integration("mail-6").await.unwrap();
    assert_eq!(instance.state(), ConnectorState::Uninitialized);
    assert!(registry.get_instance("mail-6", "smtp").is_none());
}
