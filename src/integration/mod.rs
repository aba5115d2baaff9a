//! Persisted integration records and the store interface the core relies on.
//!
//! The CRUD surface that creates and edits these rows lives outside this
//! crate. The core only reads records and patches their status fields.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod memory;
mod sqlite;

pub use memory::MemoryIntegrationStore;
pub use sqlite::SqliteIntegrationStore;

/// Lifecycle status of a persisted integration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    Pending,
    Active,
    Error,
    Disabled,
}

impl IntegrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Error => "error",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "error" => Some(Self::Error),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

/// One configured association between an organization and a provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationRecord {
    pub id: String,
    pub organization_id: String,
    pub provider: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub credential_ref: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub auto_sync: bool,
    #[serde(default)]
    pub sync_interval_ms: Option<u64>,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
    pub status: IntegrationStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IntegrationRecord {
    pub fn new(
        id: impl Into<String>,
        organization_id: impl Into<String>,
        provider: impl Into<String>,
        config: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            organization_id: organization_id.into(),
            provider: provider.into(),
            config,
            credential_ref: None,
            webhook_url: None,
            auto_sync: false,
            sync_interval_ms: None,
            last_sync_at: None,
            status: IntegrationStatus::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Per-integration webhook signing secret, if the config carries one.
    pub fn webhook_secret(&self) -> Option<&str> {
        self.config.get("webhook_secret").and_then(Value::as_str)
    }
}

/// Status-only update applied by the integration manager.
///
/// `None` leaves a field untouched. `last_error: Some(None)` clears it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IntegrationPatch {
    pub status: Option<IntegrationStatus>,
    pub last_error: Option<Option<String>>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl IntegrationPatch {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Some(IntegrationStatus::Error),
            last_error: Some(Some(message.into())),
            last_sync_at: None,
        }
    }

    pub fn synced(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(IntegrationStatus::Active),
            last_error: Some(None),
            last_sync_at: Some(at),
        }
    }

    pub fn active() -> Self {
        Self {
            status: Some(IntegrationStatus::Active),
            last_error: Some(None),
            last_sync_at: None,
        }
    }

    pub fn apply(&self, record: &mut IntegrationRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(last_error) = &self.last_error {
            record.last_error = last_error.clone();
        }
        if let Some(at) = self.last_sync_at {
            record.last_sync_at = Some(at);
        }
        record.updated_at = Utc::now();
    }
}

/// Opaque row store for integration records.
///
/// Implementations are synchronous and must be shareable across tasks.
pub trait IntegrationStore: Send + Sync {
    /// Inserts or replaces a record.
    fn insert(&self, record: &IntegrationRecord) -> Result<()>;

    /// Looks up a record scoped to its organization.
    fn get_integration(&self, id: &str, organization_id: &str)
        -> Result<Option<IntegrationRecord>>;

    /// Looks up a record by id alone (generic webhook path).
    fn find_integration(&self, id: &str) -> Result<Option<IntegrationRecord>>;

    /// Applies a status patch. Returns false when no such record exists.
    fn update_integration(
        &self,
        id: &str,
        organization_id: &str,
        patch: &IntegrationPatch,
    ) -> Result<bool>;

    fn delete(&self, id: &str, organization_id: &str) -> Result<bool>;

    /// All records, oldest first.
    fn list(&self) -> Result<Vec<IntegrationRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_apply() {
        let mut record = IntegrationRecord::new("i1", "o1", "smtp", json!({}));
        IntegrationPatch::error("boom").apply(&mut record);
        assert_eq!(record.status, IntegrationStatus::Error);
        assert_eq!(record.last_error.as_deref(), Some("boom"));

        let at = Utc::now();
        IntegrationPatch::synced(at).apply(&mut record);
        assert_eq!(record.status, IntegrationStatus::Active);
        assert!(record.last_error.is_none());
        assert_eq!(record.last_sync_at, Some(at));
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let record = IntegrationRecord::new("i1", "o1", "smtp", json!({"host": "smtp.test"}));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["organizationId"], "o1");
        assert_eq!(value["status"], "pending");
        assert!(value.get("syncIntervalMs").is_some());
    }

    #[test]
    fn test_webhook_secret_from_config() {
        let record = IntegrationRecord::new("i1", "o1", "webhook", json!({"webhook_secret": "s3"}));
        assert_eq!(record.webhook_secret(), Some("s3"));
    }
}
