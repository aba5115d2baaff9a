//! Encrypted credential storage using SQLite.
//!
//! A credential blob is the JSON form of [`Credentials`], sealed as a whole.
//! Rows are keyed by the owning organization and the integration's
//! credential reference.

use super::{Cipher, Credentials, Sealed};
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

/// Encrypted credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     id INTEGER PRIMARY KEY,
///     owner_id TEXT NOT NULL,
///     credential_ref TEXT NOT NULL,
///     kind TEXT NOT NULL,          -- oauth | basic | api_key (plaintext, for listing)
///     secret TEXT NOT NULL,        -- sealed JSON blob
///     secret_nonce TEXT NOT NULL,
///     expires_at TEXT,             -- ISO 8601 (optional)
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,
///     UNIQUE(owner_id, credential_ref)
/// );
/// ```
///
/// # Thread Safety
/// The connection is wrapped in a `Mutex`; callers share the store via `Arc`.
pub struct CredentialStore {
    conn: Mutex<Connection>,
    cipher: Cipher,
}

impl CredentialStore {
    /// Creates or opens a credential store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file (`:memory:` for tests)
    /// * `encryption_key` - Base64-encoded 32-byte master key
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let cipher = Cipher::from_base64_key(encryption_key).context("Invalid encryption key")?;

        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY,
                owner_id TEXT NOT NULL,
                credential_ref TEXT NOT NULL,
                kind TEXT NOT NULL,
                secret TEXT NOT NULL,
                secret_nonce TEXT NOT NULL,
                expires_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(owner_id, credential_ref)
            );
            CREATE INDEX IF NOT EXISTS idx_owner_ref ON credentials(owner_id, credential_ref);
            "#,
        )
        .context("Failed to create credentials table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    /// Stores credentials, replacing any existing row for the same key (upsert).
    pub fn store(&self, owner_id: &str, credential_ref: &str, credentials: &Credentials) -> Result<()> {
        let plaintext =
            serde_json::to_vec(credentials).context("Failed to serialize credentials")?;
        let sealed = self
            .cipher
            .seal(&plaintext)
            .context("Failed to encrypt credentials")?;

        let expires_at = credentials.expires_at().map(|dt| dt.to_rfc3339());
        let now = Utc::now().to_rfc3339();

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO credentials (
                    owner_id, credential_ref, kind,
                    secret, secret_nonce,
                    expires_at, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(owner_id, credential_ref) DO UPDATE SET
                    kind = excluded.kind,
                    secret = excluded.secret,
                    secret_nonce = excluded.secret_nonce,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at
                "#,
                params![
                    owner_id,
                    credential_ref,
                    credentials.kind(),
                    sealed.ciphertext,
                    sealed.nonce,
                    expires_at,
                    now,
                    now,
                ],
            )
            .context("Failed to store credentials")?;

        Ok(())
    }

    /// Retrieves and decrypts credentials.
    ///
    /// # Returns
    /// * `Ok(Some(Credentials))` - Found and decrypted
    /// * `Ok(None)` - No row for this key
    /// * `Err` - Decryption or database failure
    pub fn get(&self, owner_id: &str, credential_ref: &str) -> Result<Option<Credentials>> {
        let sealed = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn
                .prepare(
                    "SELECT secret, secret_nonce FROM credentials
                     WHERE owner_id = ?1 AND credential_ref = ?2",
                )
                .context("Failed to prepare query")?;

            let mut rows = stmt
                .query(params![owner_id, credential_ref])
                .context("Failed to execute query")?;

            match rows.next().context("Failed to read row")? {
                Some(row) => Sealed {
                    ciphertext: row.get(0)?,
                    nonce: row.get(1)?,
                },
                None => return Ok(None),
            }
        };

        let plaintext = self
            .cipher
            .open(&sealed)
            .context("Failed to decrypt credentials")?;
        let credentials =
            serde_json::from_slice(&plaintext).context("Stored credentials are malformed")?;
        Ok(Some(credentials))
    }

    /// Deletes credentials. Returns whether a row was removed.
    pub fn delete(&self, owner_id: &str, credential_ref: &str) -> Result<bool> {
        let rows_affected = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM credentials WHERE owner_id = ?1 AND credential_ref = ?2",
                params![owner_id, credential_ref],
            )
            .context("Failed to delete credentials")?;

        Ok(rows_affected > 0)
    }

    /// Lists the credential references stored for an owner.
    pub fn list_by_owner(&self, owner_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT credential_ref FROM credentials WHERE owner_id = ?1 ORDER BY credential_ref",
            )
            .context("Failed to prepare query")?;

        let refs = stmt
            .query_map(params![owner_id], |row| row.get(0))
            .context("Failed to execute query")?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to read results")?;

        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use chrono::Duration;

    fn create_test_store() -> CredentialStore {
        let key = BASE64.encode([0u8; 32]);
        CredentialStore::new(":memory:", &key).expect("Failed to create test store")
    }

    #[test]
    fn test_store_and_get_each_scheme() {
        let store = create_test_store();
        let oauth = Credentials::OAuth {
            access_token: "access-token-12345".to_string(),
            refresh_token: Some("refresh-token-67890".to_string()),
            expires_at: Some(Utc::now() + Duration::hours(1)),
        };

        store.store("org1", "slack-1", &oauth).unwrap();
        store.store("org1", "smtp-1", &Credentials::basic("a", "b")).unwrap();

        assert_eq!(store.get("org1", "slack-1").unwrap(), Some(oauth));
        assert_eq!(
            store.get("org1", "smtp-1").unwrap(),
            Some(Credentials::basic("a", "b"))
        );
    }

    #[test]
    fn test_get_nonexistent() {
        let store = create_test_store();
        assert!(store.get("org1", "missing").unwrap().is_none());
    }

    #[test]
    fn test_upsert_replaces() {
        let store = create_test_store();
        store.store("org1", "smtp-1", &Credentials::basic("a", "old")).unwrap();
        store.store("org1", "smtp-1", &Credentials::basic("a", "new")).unwrap();

        assert_eq!(
            store.get("org1", "smtp-1").unwrap(),
            Some(Credentials::basic("a", "new"))
        );
        assert_eq!(store.list_by_owner("org1").unwrap().len(), 1);
    }

    #[test]
    fn test_delete() {
        let store = create_test_store();
        store.store("org1", "smtp-1", &Credentials::basic("a", "b")).unwrap();

        assert!(store.delete("org1", "smtp-1").unwrap());
        assert!(store.get("org1", "smtp-1").unwrap().is_none());
        assert!(!store.delete("org1", "smtp-1").unwrap());
    }

    #[test]
    fn test_owners_are_isolated() {
        let store = create_test_store();
        let creds = Credentials::bearer("tok");
        store.store("org1", "a", &creds).unwrap();
        store.store("org1", "b", &creds).unwrap();
        store.store("org2", "a", &creds).unwrap();

        assert_eq!(store.list_by_owner("org1").unwrap(), vec!["a", "b"]);
        assert_eq!(store.list_by_owner("org2").unwrap(), vec!["a"]);
        assert!(store.list_by_owner("org3").unwrap().is_empty());
    }

    #[test]
    fn test_survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.db");
        let key = BASE64.encode([3u8; 32]);

        CredentialStore::new(&path, &key)
            .unwrap()
            .store("org1", "smtp-1", &Credentials::basic("a", "b"))
            .unwrap();

        let reopened = CredentialStore::new(&path, &key).unwrap();
        assert!(reopened.get("org1", "smtp-1").unwrap().is_some());

        let wrong_key = CredentialStore::new(&path, &BASE64.encode([4u8; 32])).unwrap();
        assert!(wrong_key.get("org1", "smtp-1").is_err());
    }

    #[test]
    fn test_invalid_encryption_key() {
        assert!(CredentialStore::new(":memory:", "short").is_err());
        assert!(CredentialStore::new(":memory:", "not-valid-base64!@#$").is_err());
    }
}
