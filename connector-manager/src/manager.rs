//! Integration manager - orchestrates connector instances per integration.
//!
//! Creates and tears down instances through the registry, owns the auto-sync
//! timers, and reports lifecycle changes as [`IntegrationEvent`]s. A status
//! listener folds those events back into the integration store.

use crate::error::{ConnectorError, IntegrationError};
use crate::instance::{ConnectorInstance, InstanceEvent, InstanceStatus};
use crate::jobs::{SEND_JOB_TYPE, SYNC_JOB_TYPE};
use crate::registry::ConnectorRegistry;
use crate::types::{Capability, ConnectorState, OutboundMessage, SendReceipt, SyncReport, WebhookOutcome};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use conduit::config::SyncConfig;
use conduit::credentials::{CredentialStore, Credentials};
use conduit::integration::{IntegrationPatch, IntegrationRecord, IntegrationStatus, IntegrationStore};
use conduit::queue::{Dispatcher, EnqueueOptions, Job, QueueError, INTEGRATION_SYNC, OUTBOUND_MESSAGES};
use conduit::webhook::WebhookEvent;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Interval used when an auto-sync integration sets none.
    pub default_sync_interval: Duration,
}

impl ManagerConfig {
    pub fn from_sync_config(sync: &SyncConfig) -> Self {
        Self {
            default_sync_interval: Duration::from_millis(sync.default_interval_ms),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_sync_interval: Duration::from_secs(300),
        }
    }
}

/// Everything needed to bring one integration up.
#[derive(Clone, Debug)]
pub struct IntegrationSpec {
    pub id: String,
    pub organization_id: String,
    pub provider: String,
    pub config: Value,
    pub credentials: Credentials,
    /// Key in the credential store. Defaults to the integration id.
    pub credential_ref: Option<String>,
    pub webhook_url: Option<String>,
    pub auto_sync: bool,
    pub sync_interval: Option<Duration>,
}

impl IntegrationSpec {
    pub fn new(
        id: impl Into<String>,
        organization_id: impl Into<String>,
        provider: impl Into<String>,
        config: Value,
        credentials: Credentials,
    ) -> Self {
        Self {
            id: id.into(),
            organization_id: organization_id.into(),
            provider: provider.into(),
            config,
            credentials,
            credential_ref: None,
            webhook_url: None,
            auto_sync: false,
            sync_interval: None,
        }
    }

    pub fn from_record(record: &IntegrationRecord, credentials: Credentials) -> Self {
        Self {
            id: record.id.clone(),
            organization_id: record.organization_id.clone(),
            provider: record.provider.clone(),
            config: record.config.clone(),
            credentials,
            credential_ref: record.credential_ref.clone(),
            webhook_url: record.webhook_url.clone(),
            auto_sync: record.auto_sync,
            sync_interval: record.sync_interval_ms.map(Duration::from_millis),
        }
    }

    fn credential_key(&self) -> &str {
        self.credential_ref.as_deref().unwrap_or(&self.id)
    }
}

/// Partial change to a managed integration. `None` keeps the current value.
#[derive(Clone, Debug, Default)]
pub struct IntegrationUpdate {
    pub config: Option<Value>,
    pub credentials: Option<Credentials>,
    pub webhook_url: Option<Option<String>>,
    pub auto_sync: Option<bool>,
    pub sync_interval: Option<Option<Duration>>,
}

#[derive(Clone, Debug)]
pub enum IntegrationEvent {
    Created {
        integration_id: String,
        organization_id: String,
        provider: String,
    },
    Updated {
        integration_id: String,
        organization_id: String,
    },
    Deleted {
        integration_id: String,
        organization_id: String,
    },
    Error {
        integration_id: String,
        organization_id: String,
        message: String,
    },
    SyncCompleted {
        integration_id: String,
        organization_id: String,
        report: SyncReport,
    },
    WebhookProcessed {
        integration_id: String,
        organization_id: String,
        outcome: WebhookOutcome,
    },
}

struct ManagedIntegration {
    spec: IntegrationSpec,
    instance: Arc<ConnectorInstance>,
    timer: Option<JoinHandle<()>>,
    /// Relays instance errors into integration events.
    forwarder: JoinHandle<()>,
}

impl ManagedIntegration {
    fn stop(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
        self.forwarder.abort();
    }
}

/// Integration manager - one entry per live integration.
///
/// # Responsibilities
/// - Create, update and delete connector instances
/// - Health-check new instances before registering webhooks
/// - Run one auto-sync timer per integration, feeding the sync queue
/// - Route sync, send and webhook jobs to the right instance
/// - Broadcast lifecycle events for the status listener
pub struct IntegrationManager {
    registry: Arc<ConnectorRegistry>,
    dispatcher: Dispatcher,
    store: Arc<dyn IntegrationStore>,
    credential_store: Option<Arc<CredentialStore>>,
    config: ManagerConfig,
    integrations: DashMap<String, ManagedIntegration>,
    events: broadcast::Sender<IntegrationEvent>,
}

impl IntegrationManager {
    /// Creates a new integration manager.
    ///
    /// # Arguments
    /// * `registry` - Connector constructors and live instances
    /// * `dispatcher` - Queue handle for sync and outbound jobs
    /// * `store` - Persisted integration records
    /// * `credential_store` - Encrypted credential storage, if configured
    /// * `config` - Sync defaults
    pub fn new(
        registry: Arc<ConnectorRegistry>,
        dispatcher: Dispatcher,
        store: Arc<dyn IntegrationStore>,
        credential_store: Option<Arc<CredentialStore>>,
        config: ManagerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry,
            dispatcher,
            store,
            credential_store,
            config,
            integrations: DashMap::new(),
            events,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectorRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IntegrationEvent> {
        self.events.subscribe()
    }

    pub fn instance(&self, integration_id: &str) -> Option<Arc<ConnectorInstance>> {
        self.integrations
            .get(integration_id)
            .map(|m| m.instance.clone())
    }

    pub fn status(&self, integration_id: &str) -> Option<InstanceStatus> {
        self.instance(integration_id).map(|i| i.status())
    }

    /// Ids of managed integrations, sorted.
    pub fn integration_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.integrations.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn emit(&self, event: IntegrationEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn emit_error(&self, spec: &IntegrationSpec, message: String) {
        self.emit(IntegrationEvent::Error {
            integration_id: spec.id.clone(),
            organization_id: spec.organization_id.clone(),
            message,
        });
    }

    fn lookup(&self, integration_id: &str) -> Result<(Arc<ConnectorInstance>, IntegrationSpec), IntegrationError> {
        self.integrations
            .get(integration_id)
            .map(|m| (m.instance.clone(), m.spec.clone()))
            .ok_or_else(|| IntegrationError::NotFound(integration_id.to_string()))
    }

    /// Brings an integration up and starts managing it.
    ///
    /// The health check runs before any webhook is registered. On failure
    /// the instance stays registered so a later update can recover it.
    pub async fn create_integration(&self, spec: IntegrationSpec) -> Result<Arc<ConnectorInstance>, IntegrationError> {
        info!(
            integration_id = %spec.id,
            provider = %spec.provider,
            "Creating integration"
        );
        let instance = self.registry.get_or_create_instance(&spec.id, &spec.provider)?;

        if let Some((_, previous)) = self.integrations.remove(&spec.id) {
            previous.stop();
            if previous.spec.provider != spec.provider {
                self.registry
                    .remove_instance(&previous.spec.id, &previous.spec.provider)
                    .await;
            }
        }

        let forwarder = self.spawn_forwarder(&spec, instance.subscribe());
        let mut managed = ManagedIntegration {
            spec: spec.clone(),
            instance: instance.clone(),
            timer: None,
            forwarder,
        };

        if let Err(e) = self.bring_up(&spec, &instance).await {
            self.integrations.insert(spec.id.clone(), managed);
            return Err(e);
        }

        self.persist_credentials(&spec);
        if let Some(url) = &spec.webhook_url {
            self.register_webhook(&instance, url).await;
        }
        managed.timer = self.start_timer(&spec, &instance);
        self.integrations.insert(spec.id.clone(), managed);

        self.emit(IntegrationEvent::Created {
            integration_id: spec.id.clone(),
            organization_id: spec.organization_id.clone(),
            provider: spec.provider.clone(),
        });
        info!(integration_id = %spec.id, "Integration created");
        Ok(instance)
    }

    async fn bring_up(&self, spec: &IntegrationSpec, instance: &ConnectorInstance) -> Result<(), IntegrationError> {
        // Initialization errors reach the store through the forwarder
        instance
            .initialize(spec.config.clone(), spec.credentials.clone())
            .await?;

        if !instance.health_check().await {
            let err = IntegrationError::HealthCheckFailed(spec.id.clone());
            warn!(integration_id = %spec.id, "Integration failed its first health check");
            self.emit_error(spec, err.to_string());
            return Err(err);
        }
        Ok(())
    }

    /// Applies changes without destroying the instance.
    ///
    /// Re-initializes only when config or credentials actually changed.
    pub async fn update_integration(&self, integration_id: &str, update: IntegrationUpdate) -> Result<(), IntegrationError> {
        let (instance, mut spec) = self.lookup(integration_id)?;

        let config_changed = update.config.as_ref().is_some_and(|c| *c != spec.config);
        let credentials_changed = update
            .credentials
            .as_ref()
            .is_some_and(|c| *c != spec.credentials);
        if let Some(config) = update.config {
            spec.config = config;
        }
        if let Some(credentials) = update.credentials {
            spec.credentials = credentials;
        }

        if config_changed || credentials_changed {
            info!(integration_id = %integration_id, "Re-initializing integration");
            if let Err(e) = instance
                .initialize(spec.config.clone(), spec.credentials.clone())
                .await
            {
                self.replace_spec(spec, None);
                return Err(e.into());
            }
            if credentials_changed {
                self.persist_credentials(&spec);
            }
        }

        let previous_url = spec.webhook_url.clone();
        if let Some(url) = update.webhook_url {
            spec.webhook_url = url;
        }
        if spec.webhook_url != previous_url {
            if let Some(old) = &previous_url {
                self.unregister_webhook(&instance, old).await;
            }
            if let Some(new) = &spec.webhook_url {
                self.register_webhook(&instance, new).await;
            }
        }

        let previous_schedule = (spec.auto_sync, spec.sync_interval);
        if let Some(auto_sync) = update.auto_sync {
            spec.auto_sync = auto_sync;
        }
        if let Some(interval) = update.sync_interval {
            spec.sync_interval = interval;
        }
        let timer = if (spec.auto_sync, spec.sync_interval) != previous_schedule {
            debug!(integration_id = %integration_id, "Rescheduling auto-sync");
            Some(self.start_timer(&spec, &instance))
        } else {
            None
        };

        let organization_id = spec.organization_id.clone();
        self.replace_spec(spec, timer);
        self.emit(IntegrationEvent::Updated {
            integration_id: integration_id.to_string(),
            organization_id,
        });
        Ok(())
    }

    /// Stores the new spec. `Some(timer)` replaces the running timer.
    fn replace_spec(&self, spec: IntegrationSpec, timer: Option<Option<JoinHandle<()>>>) {
        match self.integrations.get_mut(&spec.id) {
            Some(mut managed) => {
                if let Some(timer) = timer {
                    if let Some(old) = managed.timer.take() {
                        old.abort();
                    }
                    managed.timer = timer;
                }
                managed.spec = spec;
            }
            None => {
                // Deleted concurrently
                if let Some(Some(timer)) = timer {
                    timer.abort();
                }
            }
        }
    }

    /// Tears an integration down. Teardown failures are logged only.
    pub async fn delete_integration(&self, integration_id: &str) -> Result<(), IntegrationError> {
        let (_, managed) = self
            .integrations
            .remove(integration_id)
            .ok_or_else(|| IntegrationError::NotFound(integration_id.to_string()))?;
        if let Some(timer) = &managed.timer {
            timer.abort();
        }

        let spec = &managed.spec;
        if let Some(url) = &spec.webhook_url {
            self.unregister_webhook(&managed.instance, url).await;
        }
        self.registry.remove_instance(&spec.id, &spec.provider).await;
        managed.forwarder.abort();

        if let Some(store) = &self.credential_store {
            if let Err(e) = store.delete(&spec.organization_id, spec.credential_key()) {
                warn!(integration_id = %spec.id, error = %e, "Failed to delete stored credentials");
            }
        }

        self.emit(IntegrationEvent::Deleted {
            integration_id: spec.id.clone(),
            organization_id: spec.organization_id.clone(),
        });
        info!(integration_id = %spec.id, "Integration deleted");
        Ok(())
    }

    pub async fn test_integration(&self, integration_id: &str) -> Result<bool, IntegrationError> {
        let (instance, _) = self.lookup(integration_id)?;
        Ok(instance.test().await)
    }

    /// Runs one sync now. `since` defaults to the record's last sync time.
    pub async fn sync_integration(
        &self,
        integration_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<SyncReport, IntegrationError> {
        let (instance, spec) = self.lookup(integration_id)?;
        let since = since.or_else(|| self.last_sync_at(&spec));
        debug!(integration_id = %integration_id, since = ?since, "Syncing integration");

        match instance.sync(since).await {
            Ok(report) => {
                info!(
                    integration_id = %integration_id,
                    items = report.items_synced,
                    "Sync completed"
                );
                self.emit(IntegrationEvent::SyncCompleted {
                    integration_id: spec.id.clone(),
                    organization_id: spec.organization_id.clone(),
                    report: report.clone(),
                });
                Ok(report)
            }
            Err(e) => {
                warn!(integration_id = %integration_id, error = %e, "Sync failed");
                self.emit_error(&spec, e.to_string());
                Err(e.into())
            }
        }
    }

    fn last_sync_at(&self, spec: &IntegrationSpec) -> Option<DateTime<Utc>> {
        match self.store.get_integration(&spec.id, &spec.organization_id) {
            Ok(record) => record.and_then(|r| r.last_sync_at),
            Err(e) => {
                warn!(integration_id = %spec.id, error = %e, "Failed to read last sync time");
                None
            }
        }
    }

    /// Enqueues a sync. `Ok(None)` when one is already pending.
    pub fn schedule_sync(&self, integration_id: &str) -> Result<Option<Job>, IntegrationError> {
        self.lookup(integration_id)?;
        match enqueue_sync(&self.dispatcher, integration_id) {
            Ok(job) => Ok(Some(job)),
            Err(QueueError::Duplicate { existing_id, .. }) => {
                debug!(integration_id = %integration_id, existing_id = %existing_id, "Sync already pending");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Enqueues an outbound message for delivery through the integration.
    pub fn queue_message(&self, integration_id: &str, message: OutboundMessage) -> Result<Job, IntegrationError> {
        let (instance, _) = self.lookup(integration_id)?;
        if !instance.descriptor().supports(Capability::SendMessages) {
            return Err(ConnectorError::UnsupportedCapability {
                provider: instance.provider().to_string(),
                capability: Capability::SendMessages,
            }
            .into());
        }
        let job = self.dispatcher.enqueue(
            OUTBOUND_MESSAGES,
            SEND_JOB_TYPE,
            json!({"integrationId": integration_id, "message": message}),
            EnqueueOptions::default(),
        )?;
        Ok(job)
    }

    pub async fn send_message(&self, integration_id: &str, message: &OutboundMessage) -> Result<SendReceipt, IntegrationError> {
        let (instance, _) = self.lookup(integration_id)?;
        Ok(instance.send_message(message).await?)
    }

    /// Routes a webhook to its integration, or to every connected instance
    /// of the provider that claims the event when it names none.
    pub async fn process_webhook(&self, event: &WebhookEvent) -> Result<Vec<WebhookOutcome>, IntegrationError> {
        let targets = match &event.integration_id {
            Some(id) => vec![self.lookup(id)?],
            None => {
                let candidates: Vec<_> = self
                    .integrations
                    .iter()
                    .filter(|m| m.spec.provider == event.provider)
                    .map(|m| (m.instance.clone(), m.spec.clone()))
                    .collect();
                let mut claimed = Vec::with_capacity(candidates.len());
                for (instance, spec) in candidates {
                    if instance.state() == ConnectorState::Connected
                        && instance.descriptor().supports(Capability::Webhooks)
                        && instance.accepts_webhook(event).await
                    {
                        claimed.push((instance, spec));
                    }
                }
                claimed
            }
        };
        if targets.is_empty() {
            debug!(provider = %event.provider, event_id = %event.id, "No instance for webhook");
            return Ok(Vec::new());
        }

        let mut outcomes = Vec::with_capacity(targets.len());
        let mut first_error = None;
        for (instance, spec) in targets {
            match instance.process_webhook(event).await {
                Ok(outcome) => {
                    self.emit(IntegrationEvent::WebhookProcessed {
                        integration_id: spec.id.clone(),
                        organization_id: spec.organization_id.clone(),
                        outcome: outcome.clone(),
                    });
                    outcomes.push(outcome);
                }
                Err(e) => {
                    warn!(
                        integration_id = %instance.integration_id(),
                        event_id = %event.id,
                        error = %e,
                        "Webhook processing failed"
                    );
                    self.emit_error(&spec, e.to_string());
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(outcomes),
        }
    }

    /// Recreates every non-disabled integration that has stored credentials.
    ///
    /// # Returns
    /// Number of integrations brought up
    pub async fn restore(&self) -> Result<usize> {
        let Some(credential_store) = &self.credential_store else {
            info!("No credential store configured, nothing to restore");
            return Ok(0);
        };
        let records = self.store.list().context("Failed to list integrations")?;

        let mut restored = 0;
        for record in records {
            if record.status == IntegrationStatus::Disabled {
                continue;
            }
            let key = record.credential_ref.as_deref().unwrap_or(&record.id);
            let credentials = match credential_store.get(&record.organization_id, key) {
                Ok(Some(credentials)) => credentials,
                Ok(None) => {
                    warn!(integration_id = %record.id, "Skipping integration without stored credentials");
                    continue;
                }
                Err(e) => {
                    warn!(integration_id = %record.id, error = %e, "Failed to load credentials");
                    continue;
                }
            };
            match self
                .create_integration(IntegrationSpec::from_record(&record, credentials))
                .await
            {
                Ok(_) => restored += 1,
                Err(e) => warn!(integration_id = %record.id, error = %e, "Failed to restore integration"),
            }
        }
        info!(restored, "Restored integrations");
        Ok(restored)
    }

    /// Cancels every timer and destroys every instance.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.integrations.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, managed)) = self.integrations.remove(&id) {
                managed.stop();
            }
        }
        self.registry.shutdown().await;
        info!("Integration manager shut down");
    }

    fn persist_credentials(&self, spec: &IntegrationSpec) {
        let Some(store) = &self.credential_store else {
            return;
        };
        if let Err(e) = store.store(&spec.organization_id, spec.credential_key(), &spec.credentials) {
            warn!(integration_id = %spec.id, error = %e, "Failed to persist credentials");
        }
    }

    async fn register_webhook(&self, instance: &ConnectorInstance, url: &str) {
        if !instance.descriptor().supports(Capability::Webhooks) {
            debug!(integration_id = %instance.integration_id(), "Provider has no webhooks, skipping registration");
            return;
        }
        match instance.setup_webhook(url).await {
            Ok(registration) => info!(
                integration_id = %instance.integration_id(),
                url = %registration.url,
                "Webhook registered"
            ),
            Err(e) => warn!(
                integration_id = %instance.integration_id(),
                error = %e,
                "Webhook registration failed"
            ),
        }
    }

    async fn unregister_webhook(&self, instance: &ConnectorInstance, url: &str) {
        if !instance.descriptor().supports(Capability::Webhooks) {
            return;
        }
        if let Err(e) = instance.remove_webhook(url).await {
            warn!(integration_id = %instance.integration_id(), error = %e, "Webhook removal failed");
        }
    }

    fn start_timer(&self, spec: &IntegrationSpec, instance: &ConnectorInstance) -> Option<JoinHandle<()>> {
        if !spec.auto_sync {
            return None;
        }
        if !instance.descriptor().supports(Capability::Sync) {
            debug!(integration_id = %spec.id, "Provider cannot sync, auto-sync ignored");
            return None;
        }
        let interval = spec.sync_interval.unwrap_or(self.config.default_sync_interval);
        Some(spawn_sync_timer(self.dispatcher.clone(), spec.id.clone(), interval))
    }

    fn spawn_forwarder(&self, spec: &IntegrationSpec, mut rx: mpsc::UnboundedReceiver<InstanceEvent>) -> JoinHandle<()> {
        let events = self.events.clone();
        let integration_id = spec.id.clone();
        let organization_id = spec.organization_id.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    InstanceEvent::Error(message) => {
                        let _ = events.send(IntegrationEvent::Error {
                            integration_id: integration_id.clone(),
                            organization_id: organization_id.clone(),
                            message,
                        });
                    }
                    InstanceEvent::Destroyed => break,
                    InstanceEvent::Connected | InstanceEvent::Disconnected => {}
                }
            }
        })
    }
}

fn enqueue_sync(dispatcher: &Dispatcher, integration_id: &str) -> Result<Job, QueueError> {
    dispatcher.enqueue(
        INTEGRATION_SYNC,
        SYNC_JOB_TYPE,
        json!({"integrationId": integration_id}),
        EnqueueOptions::default().unique_key(format!("sync:{}", integration_id)),
    )
}

/// Enqueues a sync job every `interval`. Never calls the connector itself.
fn spawn_sync_timer(dispatcher: Dispatcher, integration_id: String, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // first tick is immediate

        loop {
            ticker.tick().await;
            match enqueue_sync(&dispatcher, &integration_id) {
                Ok(job) => debug!(integration_id = %integration_id, job_id = %job.id, "Auto-sync enqueued"),
                Err(QueueError::Duplicate { .. }) => {
                    debug!(integration_id = %integration_id, "Previous sync still pending, skipping tick")
                }
                Err(QueueError::Closed) => break,
                Err(e) => warn!(integration_id = %integration_id, error = %e, "Failed to enqueue auto-sync"),
            }
        }
    })
}

/// Folds integration events into the store's status fields.
pub fn spawn_status_listener(
    mut events: broadcast::Receiver<IntegrationEvent>,
    store: Arc<dyn IntegrationStore>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => apply_event(store.as_ref(), &event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Status listener lagged behind integration events")
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn apply_event(store: &dyn IntegrationStore, event: &IntegrationEvent) {
    let (integration_id, organization_id, patch) = match event {
        IntegrationEvent::Created {
            integration_id,
            organization_id,
            ..
        } => (integration_id, organization_id, IntegrationPatch::active()),
        IntegrationEvent::Error {
            integration_id,
            organization_id,
            message,
        } => (integration_id, organization_id, IntegrationPatch::error(message.clone())),
        IntegrationEvent::SyncCompleted {
            integration_id,
            organization_id,
            report,
        } => (integration_id, organization_id, IntegrationPatch::synced(report.synced_at)),
        IntegrationEvent::WebhookProcessed {
            integration_id,
            organization_id,
            outcome,
        } if outcome.processed => (integration_id, organization_id, IntegrationPatch::active()),
        IntegrationEvent::WebhookProcessed { .. }
        | IntegrationEvent::Updated { .. }
        | IntegrationEvent::Deleted { .. } => return,
    };

    match store.update_integration(integration_id, organization_id, &patch) {
        Ok(true) => debug!(integration_id = %integration_id, status = ?patch.status, "Integration status updated"),
        Ok(false) => debug!(integration_id = %integration_id, "No persisted record for integration"),
        Err(e) => warn!(integration_id = %integration_id, error = %e, "Failed to update integration status"),
    }
}
