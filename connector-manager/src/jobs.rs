//! Queue workers that route jobs back into the integration manager.

use crate::manager::IntegrationManager;
use crate::types::OutboundMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit::queue::{Job, JobError, JobHandler, QueueError, INTEGRATION_SYNC, OUTBOUND_MESSAGES, WEBHOOK_PROCESSING};
use conduit::webhook::WebhookEvent;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tracing::debug;

pub const SYNC_JOB_TYPE: &str = "integration.sync";
pub const SEND_JOB_TYPE: &str = "message.send";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJob {
    pub integration_id: String,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendJob {
    pub integration_id: String,
    pub message: OutboundMessage,
}

fn payload<T: DeserializeOwned>(job: &Job) -> Result<T, JobError> {
    serde_json::from_value(job.payload.clone())
        .map_err(|e| JobError::permanent(format!("invalid {} payload: {}", job.job_type, e)))
}

fn upgrade(manager: &Weak<IntegrationManager>) -> Result<Arc<IntegrationManager>, JobError> {
    manager
        .upgrade()
        .ok_or_else(|| JobError::retryable("integration manager is shutting down"))
}

pub struct SyncJobHandler {
    manager: Weak<IntegrationManager>,
}

#[async_trait]
impl JobHandler for SyncJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let request: SyncJob = payload(job)?;
        let manager = upgrade(&self.manager)?;
        let report = manager
            .sync_integration(&request.integration_id, request.since)
            .await?;
        debug!(
            integration_id = %request.integration_id,
            items = report.items_synced,
            "Sync job finished"
        );
        Ok(())
    }
}

pub struct SendJobHandler {
    manager: Weak<IntegrationManager>,
}

#[async_trait]
impl JobHandler for SendJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let request: SendJob = payload(job)?;
        let manager = upgrade(&self.manager)?;
        let receipt = manager
            .send_message(&request.integration_id, &request.message)
            .await?;
        debug!(
            integration_id = %request.integration_id,
            message_id = %receipt.message_id,
            "Message delivered"
        );
        Ok(())
    }
}

pub struct WebhookJobHandler {
    manager: Weak<IntegrationManager>,
}

#[async_trait]
impl JobHandler for WebhookJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let event: WebhookEvent = payload(job)?;
        let manager = upgrade(&self.manager)?;
        let outcomes = manager.process_webhook(&event).await?;
        debug!(
            provider = %event.provider,
            event_type = %event.event_type,
            handled = outcomes.iter().filter(|o| o.processed).count(),
            messages = outcomes.iter().map(|o| o.messages.len()).sum::<usize>(),
            "Webhook job finished"
        );
        Ok(())
    }
}

/// Installs the sync, send and webhook workers on the manager's dispatcher.
pub fn register_job_handlers(manager: &Arc<IntegrationManager>) -> Result<(), QueueError> {
    let dispatcher = manager.dispatcher();
    let weak = Arc::downgrade(manager);
    dispatcher.register_handler(
        INTEGRATION_SYNC,
        Arc::new(SyncJobHandler {
            manager: weak.clone(),
        }),
    )?;
    dispatcher.register_handler(
        OUTBOUND_MESSAGES,
        Arc::new(SendJobHandler {
            manager: weak.clone(),
        }),
    )?;
    dispatcher.register_handler(WEBHOOK_PROCESSING, Arc::new(WebhookJobHandler { manager: weak }))?;
    Ok(())
}
