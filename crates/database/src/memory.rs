use crate::error::DbError;
use crate::record::{ExchangeCredential, SyncStateUpdate};
use crate::store::CredentialStore;
use async_trait::async_trait;
use chrono::Utc;
use core_types::Exchange;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

type Key = (String, Exchange);

/// A process-local credential store for tests and single-run tools.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    records: RwLock<HashMap<Key, ExchangeCredential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(
        &self,
        user_id: &str,
        exchange: Exchange,
    ) -> Result<Option<ExchangeCredential>, DbError> {
        let records = self.records.read().await;
        Ok(records.get(&(user_id.to_string(), exchange)).cloned())
    }

    async fn save(&self, record: &ExchangeCredential) -> Result<ExchangeCredential, DbError> {
        let mut records = self.records.write().await;
        let key = (record.user_id.clone(), record.exchange);
        let mut stored = record.clone();
        if let Some(existing) = records.get(&key) {
            stored.id = existing.id;
            stored.created_at = existing.created_at;
        }
        records.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, user_id: &str, exchange: Exchange) -> Result<bool, DbError> {
        let mut records = self.records.write().await;
        Ok(records.remove(&(user_id.to_string(), exchange)).is_some())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<ExchangeCredential>, DbError> {
        let records = self.records.read().await;
        let mut found: Vec<_> = records
            .values()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by_key(|record| record.exchange.as_str());
        Ok(found)
    }

    async fn update_sync_state(&self, id: Uuid, update: &SyncStateUpdate) -> Result<bool, DbError> {
        let mut records = self.records.write().await;
        let Some(record) = records.values_mut().find(|record| record.id == id) else {
            return Ok(false);
        };
        record.status = update.status;
        record.last_sync_at = Some(update.last_sync_at);
        record.last_error = update.last_error.clone();
        record.updated_at = Utc::now();
        Ok(true)
    }
}
