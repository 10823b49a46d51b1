use chrono::{DateTime, Utc};
use core_types::{CredentialStatus, CredentialSummary, Exchange, Permission};
use envelope::Envelope;
use std::collections::BTreeSet;
use uuid::Uuid;

/// A stored exchange credential. Unique per `(user_id, exchange)`.
///
/// Only envelopes are held here; plaintext exists solely inside the vault's
/// decrypt scope.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeCredential {
    pub id: Uuid,
    pub user_id: String,
    pub exchange: Exchange,
    pub api_key: Envelope,
    pub api_secret: Envelope,
    pub permissions: BTreeSet<Permission>,
    pub status: CredentialStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExchangeCredential {
    pub fn is_active(&self) -> bool {
        self.status == CredentialStatus::Active
    }

    /// The record without its envelopes, safe to show to a user.
    pub fn summary(&self) -> CredentialSummary {
        CredentialSummary {
            id: self.id,
            user_id: self.user_id.clone(),
            exchange: self.exchange,
            permissions: self.permissions.clone(),
            status: self.status,
            last_sync_at: self.last_sync_at,
            last_error: self.last_error.clone(),
            created_at: self.created_at,
        }
    }
}

/// The fields a finished sync run writes back, applied as one update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStateUpdate {
    pub status: CredentialStatus,
    pub last_sync_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl SyncStateUpdate {
    pub fn healthy(at: DateTime<Utc>) -> Self {
        Self {
            status: CredentialStatus::Active,
            last_sync_at: at,
            last_error: None,
        }
    }

    pub fn failed(status: CredentialStatus, at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            status,
            last_sync_at: at,
            last_error: Some(error.into()),
        }
    }
}
