//! In-memory integration store, used by tests and single-process setups.

use anyhow::Result;
use dashmap::DashMap;

use super::{IntegrationPatch, IntegrationRecord, IntegrationStore};

#[derive(Default)]
pub struct MemoryIntegrationStore {
    records: DashMap<String, IntegrationRecord>,
}

impl MemoryIntegrationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IntegrationStore for MemoryIntegrationStore {
    fn insert(&self, record: &IntegrationRecord) -> Result<()> {
        self.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn get_integration(
        &self,
        id: &str,
        organization_id: &str,
    ) -> Result<Option<IntegrationRecord>> {
        Ok(self
            .records
            .get(id)
            .filter(|r| r.organization_id == organization_id)
            .map(|r| r.clone()))
    }

    fn find_integration(&self, id: &str) -> Result<Option<IntegrationRecord>> {
        Ok(self.records.get(id).map(|r| r.clone()))
    }

    fn update_integration(
        &self,
        id: &str,
        organization_id: &str,
        patch: &IntegrationPatch,
    ) -> Result<bool> {
        match self.records.get_mut(id) {
            Some(mut record) if record.organization_id == organization_id => {
                patch.apply(&mut record);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete(&self, id: &str, organization_id: &str) -> Result<bool> {
        Ok(self
            .records
            .remove_if(id, |_, r| r.organization_id == organization_id)
            .is_some())
    }

    fn list(&self) -> Result<Vec<IntegrationRecord>> {
        let mut all: Vec<IntegrationRecord> = self.records.iter().map(|r| r.clone()).collect();
        all.sort_by_key(|r| r.created_at);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::IntegrationStatus;
    use serde_json::json;

    #[test]
    fn test_org_scoping() {
        let store = MemoryIntegrationStore::new();
        store
            .insert(&IntegrationRecord::new("i1", "org1", "slack", json!({})))
            .unwrap();

        assert!(store.get_integration("i1", "org1").unwrap().is_some());
        assert!(store.get_integration("i1", "org2").unwrap().is_none());
        assert!(!store
            .update_integration("i1", "org2", &IntegrationPatch::error("x"))
            .unwrap());
        assert!(!store.delete("i1", "org2").unwrap());
        assert!(store.delete("i1", "org1").unwrap());
    }

    #[test]
    fn test_update() {
        let store = MemoryIntegrationStore::new();
        store
            .insert(&IntegrationRecord::new("i1", "org1", "slack", json!({})))
            .unwrap();
        store
            .update_integration("i1", "org1", &IntegrationPatch::error("token revoked"))
            .unwrap();

        let r = store.find_integration("i1").unwrap().unwrap();
        assert_eq!(r.status, IntegrationStatus::Error);
        assert_eq!(r.last_error.as_deref(), Some("token revoked"));
    }
}
