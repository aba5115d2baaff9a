//! Integration persistence using SQLite.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Mutex;

use super::{IntegrationPatch, IntegrationRecord, IntegrationStatus, IntegrationStore};

const COLUMNS: &str = "id, organization_id, provider, config, credential_ref, webhook_url,
     auto_sync, sync_interval_ms, last_sync_at, status, last_error, created_at, updated_at";

/// Persists integration records in SQLite.
pub struct SqliteIntegrationStore {
    conn: Mutex<Connection>,
}

impl SqliteIntegrationStore {
    /// Opens (or creates) the SQLite database and ensures the table exists.
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open integration DB at {}", db_path))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_table()?;
        Ok(store)
    }

    fn create_table(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS integrations (
                id               TEXT PRIMARY KEY,
                organization_id  TEXT NOT NULL,
                provider         TEXT NOT NULL,
                config           TEXT NOT NULL,
                credential_ref   TEXT,
                webhook_url      TEXT,
                auto_sync        INTEGER NOT NULL DEFAULT 0,
                sync_interval_ms INTEGER,
                last_sync_at     TEXT,
                status           TEXT NOT NULL,
                last_error       TEXT,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_integrations_org ON integrations(organization_id);",
        )
        .context("Failed to create integrations table")?;
        Ok(())
    }

    fn query_one(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Option<IntegrationRecord>> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(sql, args, RawRow::read)
            .optional()
            .context("Failed to query integration")?;
        raw.map(RawRow::into_record).transpose()
    }
}

/// Column values as read from SQLite, before parsing JSON and timestamps.
struct RawRow {
    id: String,
    organization_id: String,
    provider: String,
    config: String,
    credential_ref: Option<String>,
    webhook_url: Option<String>,
    auto_sync: bool,
    sync_interval_ms: Option<i64>,
    last_sync_at: Option<String>,
    status: String,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            provider: row.get(2)?,
            config: row.get(3)?,
            credential_ref: row.get(4)?,
            webhook_url: row.get(5)?,
            auto_sync: row.get(6)?,
            sync_interval_ms: row.get(7)?,
            last_sync_at: row.get(8)?,
            status: row.get(9)?,
            last_error: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<IntegrationRecord> {
        let status = IntegrationStatus::parse(&self.status)
            .with_context(|| format!("Unknown integration status '{}'", self.status))?;
        Ok(IntegrationRecord {
            config: serde_json::from_str(&self.config)
                .with_context(|| format!("Malformed config for integration {}", self.id))?,
            last_sync_at: self.last_sync_at.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            sync_interval_ms: self.sync_interval_ms.map(|ms| ms.max(0) as u64),
            id: self.id,
            organization_id: self.organization_id,
            provider: self.provider,
            credential_ref: self.credential_ref,
            webhook_url: self.webhook_url,
            auto_sync: self.auto_sync,
            status,
            last_error: self.last_error,
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp '{}'", s))
}

impl IntegrationStore for SqliteIntegrationStore {
    fn insert(&self, record: &IntegrationRecord) -> Result<()> {
        let config = serde_json::to_string(&record.config).context("Failed to encode config")?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO integrations ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                record.id,
                record.organization_id,
                record.provider,
                config,
                record.credential_ref,
                record.webhook_url,
                record.auto_sync,
                record.sync_interval_ms.map(|ms| ms as i64),
                record.last_sync_at.map(|dt| dt.to_rfc3339()),
                record.status.as_str(),
                record.last_error,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert integration")?;
        Ok(())
    }

    fn get_integration(
        &self,
        id: &str,
        organization_id: &str,
    ) -> Result<Option<IntegrationRecord>> {
        self.query_one(
            &format!("SELECT {COLUMNS} FROM integrations WHERE id = ?1 AND organization_id = ?2"),
            &[&id, &organization_id],
        )
    }

    fn find_integration(&self, id: &str) -> Result<Option<IntegrationRecord>> {
        self.query_one(
            &format!("SELECT {COLUMNS} FROM integrations WHERE id = ?1"),
            &[&id],
        )
    }

    fn update_integration(
        &self,
        id: &str,
        organization_id: &str,
        patch: &IntegrationPatch,
    ) -> Result<bool> {
        // Read-modify-write under one lock so concurrent patches don't interleave.
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM integrations WHERE id = ?1 AND organization_id = ?2"
                ),
                params![id, organization_id],
                RawRow::read,
            )
            .optional()
            .context("Failed to load integration for update")?;

        let Some(raw) = raw else {
            return Ok(false);
        };
        let mut record = raw.into_record()?;
        patch.apply(&mut record);

        conn.execute(
            "UPDATE integrations
                SET status = ?1, last_error = ?2, last_sync_at = ?3, updated_at = ?4
              WHERE id = ?5 AND organization_id = ?6",
            params![
                record.status.as_str(),
                record.last_error,
                record.last_sync_at.map(|dt| dt.to_rfc3339()),
                record.updated_at.to_rfc3339(),
                id,
                organization_id,
            ],
        )
        .context("Failed to update integration")?;
        Ok(true)
    }

    fn delete(&self, id: &str, organization_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(
                "DELETE FROM integrations WHERE id = ?1 AND organization_id = ?2",
                params![id, organization_id],
            )
            .context("Failed to delete integration")?;
        Ok(n > 0)
    }

    fn list(&self) -> Result<Vec<IntegrationRecord>> {
        let raws = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {COLUMNS} FROM integrations ORDER BY created_at ASC"
                ))
                .context("Failed to prepare list query")?;
            let rows = stmt
                .query_map([], RawRow::read)
                .context("Failed to query integrations")?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read integration rows")?;
            rows
        };
        raws.into_iter().map(RawRow::into_record).collect()
    }
}
