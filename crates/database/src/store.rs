use crate::error::DbError;
use crate::record::{ExchangeCredential, SyncStateUpdate};
use async_trait::async_trait;
use core_types::Exchange;
use uuid::Uuid;

/// Persistence contract for encrypted credential records.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(
        &self,
        user_id: &str,
        exchange: Exchange,
    ) -> Result<Option<ExchangeCredential>, DbError>;

    /// Inserts the record, or replaces the secrets and state of the existing
    /// `(user_id, exchange)` record while keeping its id and `created_at`.
    /// Returns what was stored.
    async fn save(&self, record: &ExchangeCredential) -> Result<ExchangeCredential, DbError>;

    /// Hard-deletes the record. Returns whether one existed.
    async fn delete(&self, user_id: &str, exchange: Exchange) -> Result<bool, DbError>;

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<ExchangeCredential>, DbError>;

    /// Applies a sync outcome to the record with this id in one step.
    /// Returns `false` when the record no longer exists.
    async fn update_sync_state(&self, id: Uuid, update: &SyncStateUpdate) -> Result<bool, DbError>;
}
