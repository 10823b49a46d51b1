//! # Credential Vault
//!
//! Owns the lifecycle of linked exchange credentials.
//!
//! - `connect` validates the raw key, runs a live read-only permission probe
//!   and only then seals and persists it. A key that can trade, withdraw or
//!   transfer is refused and nothing is written.
//! - `disconnect` deletes the record outright and drops the credential's
//!   lane state.
//! - `decrypt_for_use` opens the envelopes into a [`DecryptedCredential`]
//!   that lives only as long as the caller's borrow of it.
//!
//! Envelopes are sealed with associated data naming the owner, exchange and
//! field, so a ciphertext copied into another record fails to open.

use api_client::{ApiError, ConnectorFactory, DecryptedCredential};
use chrono::Utc;
use core_types::{CredentialStatus, Exchange};
use database::{CredentialStore, ExchangeCredential, SyncStateUpdate};
use envelope::{Envelope, MasterKey};
use std::sync::Arc;
use uuid::Uuid;

pub mod error;

pub use error::{VaultError, VerificationError};

#[derive(Clone, Copy)]
enum Field {
    ApiKey,
    ApiSecret,
}

impl Field {
    fn as_str(&self) -> &'static str {
        match self {
            Field::ApiKey => "api_key",
            Field::ApiSecret => "api_secret",
        }
    }
}

fn context(user_id: &str, exchange: Exchange, field: Field) -> Vec<u8> {
    format!("{user_id}/{exchange}/{}", field.as_str()).into_bytes()
}

pub struct CredentialVault {
    store: Arc<dyn CredentialStore>,
    master_key: Arc<MasterKey>,
    connectors: Arc<dyn ConnectorFactory>,
}

impl CredentialVault {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        master_key: MasterKey,
        connectors: Arc<dyn ConnectorFactory>,
    ) -> Self {
        Self {
            store,
            master_key: Arc::new(master_key),
            connectors,
        }
    }

    pub fn connectors(&self) -> &Arc<dyn ConnectorFactory> {
        &self.connectors
    }

    /// Verifies and stores a credential. Reconnecting replaces the secrets of
    /// the existing record, keeps its id and resets it to `Active`.
    pub async fn connect(
        &self,
        user_id: &str,
        exchange: Exchange,
        api_key: &str,
        api_secret: &str,
    ) -> Result<ExchangeCredential, VaultError> {
        // 1. Reject obviously unusable input before touching the network.
        let user_id = user_id.trim();
        let api_key = api_key.trim();
        let api_secret = api_secret.trim();
        if user_id.is_empty() {
            return Err(VerificationError::InvalidInput("user id is empty".into()).into());
        }
        if api_key.is_empty() || api_secret.is_empty() {
            let missing = VerificationError::InvalidInput("API key and secret are required".into());
            return Err(missing.into());
        }

        let existing = self.store.load(user_id, exchange).await?;
        let id = existing.as_ref().map_or_else(Uuid::new_v4, |record| record.id);

        // 2. Live probe. Nothing is persisted unless it proves read-only access.
        let credential = DecryptedCredential::new(exchange, api_key, api_secret);
        let connector = self.connectors.connector_for(exchange, id);
        let probe = match connector.probe_permissions(&credential).await {
            Ok(probe) => probe,
            Err(e) => {
                if existing.is_none() {
                    self.connectors.release(exchange, id);
                }
                tracing::warn!(
                    %user_id,
                    %exchange,
                    error = %e,
                    "Permission probe failed; credential not stored."
                );
                return Err(verification_failure(e).into());
            }
        };

        // 3. Verify.
        let refusal = if !probe.can_read() {
            Some(VerificationError::ReadAccessMissing)
        } else if !probe.is_read_only() {
            Some(VerificationError::PermissionEscalation(probe.escalations()))
        } else {
            None
        };
        if let Some(refusal) = refusal {
            if existing.is_none() {
                self.connectors.release(exchange, id);
            }
            tracing::warn!(%user_id, %exchange, reason = %refusal, "Credential refused.");
            return Err(refusal.into());
        }

        // 4. Seal, bound to owner, exchange and field.
        let sealed_key = self.seal(user_id, exchange, Field::ApiKey, api_key)?;
        let sealed_secret = self.seal(user_id, exchange, Field::ApiSecret, api_secret)?;

        // 5. Persist.
        let now = Utc::now();
        let record = ExchangeCredential {
            id,
            user_id: user_id.to_string(),
            exchange,
            api_key: sealed_key,
            api_secret: sealed_secret,
            permissions: probe.permissions,
            status: CredentialStatus::Active,
            last_sync_at: existing.as_ref().and_then(|record| record.last_sync_at),
            last_error: None,
            created_at: existing.as_ref().map_or(now, |record| record.created_at),
            updated_at: now,
        };
        let stored = self.store.save(&record).await?;

        tracing::info!(
            %user_id,
            %exchange,
            credential_id = %stored.id,
            reconnect = existing.is_some(),
            "Exchange credential connected."
        );
        Ok(stored)
    }

    /// Deletes the credential and its lane. Returns whether one existed.
    pub async fn disconnect(&self, user_id: &str, exchange: Exchange) -> Result<bool, VaultError> {
        let existing = self.store.load(user_id, exchange).await?;
        let deleted = self.store.delete(user_id, exchange).await?;
        if let Some(record) = existing {
            self.connectors.release(exchange, record.id);
        }
        if deleted {
            tracing::info!(%user_id, %exchange, "Exchange credential disconnected.");
        }
        Ok(deleted)
    }

    pub async fn load(
        &self,
        user_id: &str,
        exchange: Exchange,
    ) -> Result<ExchangeCredential, VaultError> {
        self.store
            .load(user_id, exchange)
            .await?
            .ok_or_else(|| VaultError::NotConnected {
                user_id: user_id.to_string(),
                exchange,
            })
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<ExchangeCredential>, VaultError> {
        Ok(self.store.list_for_user(user_id).await?)
    }

    /// Opens both envelopes. The result must not outlive the operation that
    /// needs it and is never logged.
    pub fn decrypt_for_use(
        &self,
        record: &ExchangeCredential,
    ) -> Result<DecryptedCredential, VaultError> {
        let api_key = self.open(record, Field::ApiKey, &record.api_key)?;
        let api_secret = self.open(record, Field::ApiSecret, &record.api_secret)?;
        Ok(DecryptedCredential::new(record.exchange, api_key, api_secret))
    }

    /// Writes a finished run's outcome in one update. A credential
    /// disconnected while the run was in flight stays deleted.
    pub async fn record_sync_outcome(
        &self,
        record: &ExchangeCredential,
        update: &SyncStateUpdate,
    ) -> Result<bool, VaultError> {
        let applied = self.store.update_sync_state(record.id, update).await?;
        if !applied {
            tracing::debug!(
                credential_id = %record.id,
                "Credential removed during sync; outcome dropped."
            );
        }
        Ok(applied)
    }

    fn seal(
        &self,
        user_id: &str,
        exchange: Exchange,
        field: Field,
        value: &str,
    ) -> Result<Envelope, VaultError> {
        let aad = context(user_id, exchange, field);
        Ok(envelope::seal_with_context(value.as_bytes(), &self.master_key, &aad)?)
    }

    fn open(
        &self,
        record: &ExchangeCredential,
        field: Field,
        sealed: &Envelope,
    ) -> Result<String, VaultError> {
        let aad = context(&record.user_id, record.exchange, field);
        let bytes = envelope::open_with_context(sealed, &self.master_key, &aad)?;
        String::from_utf8(bytes).map_err(|_| VaultError::CorruptSecret)
    }
}

fn verification_failure(error: ApiError) -> VerificationError {
    match error {
        ApiError::Authentication(message)
        | ApiError::KeyRevoked(message)
        | ApiError::PermissionDenied(message) => VerificationError::Rejected(message),
        ApiError::Signing(e) => VerificationError::InvalidInput(e.to_string()),
        other => VerificationError::ProbeFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api_client::{ExchangeConnector, FetchItem, HistoryPlan, PermissionProbe};
    use async_trait::async_trait;
    use core_types::{Permission, RawPayload, TransactionFilter};
    use database::MemoryCredentialStore;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    struct ProbeOnly {
        exchange: Exchange,
        outcome: Result<BTreeSet<Permission>, String>,
    }

    #[async_trait]
    impl ExchangeConnector for ProbeOnly {
        fn exchange(&self) -> Exchange {
            self.exchange
        }

        async fn probe_permissions(
            &self,
            _: &DecryptedCredential,
        ) -> Result<PermissionProbe, ApiError> {
            match &self.outcome {
                Ok(permissions) => Ok(PermissionProbe::new(self.exchange, permissions.clone())),
                Err(message) => Err(ApiError::Authentication(message.clone())),
            }
        }

        async fn fetch_balances(&self, _: &DecryptedCredential) -> Result<RawPayload, ApiError> {
            Err(ApiError::InvalidData("not scripted".into()))
        }

        fn plan_history(
            &self,
            _: &[String],
            _: &RawPayload,
            _: &TransactionFilter,
        ) -> Result<HistoryPlan, ApiError> {
            Ok(HistoryPlan::default())
        }

        async fn fetch_history(
            &self,
            _: &DecryptedCredential,
            _: &FetchItem,
        ) -> Result<RawPayload, ApiError> {
            Err(ApiError::InvalidData("not scripted".into()))
        }
    }

    struct Factory {
        outcome: Result<BTreeSet<Permission>, String>,
        released: Mutex<Vec<Uuid>>,
    }

    impl Factory {
        fn granting(permissions: &[Permission]) -> Arc<Self> {
            Arc::new(Self {
                outcome: Ok(permissions.iter().copied().collect()),
                released: Mutex::new(Vec::new()),
            })
        }

        fn rejecting(message: &str) -> Arc<Self> {
            Arc::new(Self {
                outcome: Err(message.to_string()),
                released: Mutex::new(Vec::new()),
            })
        }
    }

    impl ConnectorFactory for Factory {
        fn connector_for(&self, exchange: Exchange, _: Uuid) -> Arc<dyn ExchangeConnector> {
            Arc::new(ProbeOnly {
                exchange,
                outcome: self.outcome.clone(),
            })
        }

        fn release(&self, _: Exchange, credential_id: Uuid) {
            self.released.lock().unwrap().push(credential_id);
        }
    }

    fn vault(factory: Arc<Factory>) -> (CredentialVault, Arc<MemoryCredentialStore>) {
        let store = Arc::new(MemoryCredentialStore::new());
        let vault = CredentialVault::new(store.clone(), MasterKey::generate(), factory);
        (vault, store)
    }

    #[tokio::test]
    async fn connect_seals_and_persists_a_read_only_key() {
        let (vault, store) = vault(Factory::granting(&[Permission::Read]));
        let record = vault
            .connect("alice", Exchange::Binance, " key-123 ", "secret-456")
            .await
            .unwrap();

        assert_eq!(record.status, CredentialStatus::Active);
        assert_eq!(record.permissions, BTreeSet::from([Permission::Read]));
        assert_ne!(record.api_secret.ciphertext, b"secret-456".to_vec());
        assert_eq!(store.len().await, 1);

        let credential = vault.decrypt_for_use(&record).unwrap();
        assert_eq!(credential.api_key(), "key-123");
        assert_eq!(credential.api_secret(), "secret-456");
    }

    #[tokio::test]
    async fn trading_keys_are_refused_and_not_stored() {
        let factory = Factory::granting(&[Permission::Read, Permission::Trade]);
        let (vault, store) = vault(factory.clone());
        let err = vault
            .connect("alice", Exchange::Binance, "key", "secret")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            VaultError::Verification(VerificationError::PermissionEscalation(ref p)) if p == &vec![Permission::Trade]
        ));
        assert!(store.is_empty().await);
        assert_eq!(factory.released.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn keys_without_read_access_are_refused() {
        let (vault, store) = vault(Factory::granting(&[]));
        let err = vault
            .connect("alice", Exchange::Kraken, "key", "c2VjcmV0")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VaultError::Verification(VerificationError::ReadAccessMissing)
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn rejected_probe_persists_nothing() {
        let (vault, store) = vault(Factory::rejecting("Invalid API-key"));
        let err = vault
            .connect("alice", Exchange::Binance, "key", "secret")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VaultError::Verification(VerificationError::Rejected(_))
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn blank_input_never_reaches_the_exchange() {
        let (vault, _) = vault(Factory::rejecting("should not be called"));
        let err = vault
            .connect("alice", Exchange::Binance, "  ", "secret")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VaultError::Verification(VerificationError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn reconnect_keeps_the_id_and_resets_status() {
        let (vault, store) = vault(Factory::granting(&[Permission::Read]));
        let first = vault.connect("bob", Exchange::Coinbase, "k1", "s1").await.unwrap();
        let update = SyncStateUpdate::failed(CredentialStatus::Error, Utc::now(), "key rejected");
        vault.record_sync_outcome(&first, &update).await.unwrap();

        let second = vault.connect("bob", Exchange::Coinbase, "k2", "s2").await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.status, CredentialStatus::Active);
        assert!(second.last_error.is_none());
        assert_eq!(store.len().await, 1);
        assert_eq!(vault.decrypt_for_use(&second).unwrap().api_key(), "k2");
    }

    #[tokio::test]
    async fn disconnect_deletes_and_releases_the_lane() {
        let factory = Factory::granting(&[Permission::Read]);
        let (vault, store) = vault(factory.clone());
        let record = vault.connect("carol", Exchange::Kraken, "k", "s").await.unwrap();

        assert!(vault.disconnect("carol", Exchange::Kraken).await.unwrap());
        assert!(store.is_empty().await);
        assert_eq!(*factory.released.lock().unwrap(), vec![record.id]);
        assert!(matches!(
            vault.load("carol", Exchange::Kraken).await,
            Err(VaultError::NotConnected { .. })
        ));
        assert!(!vault.disconnect("carol", Exchange::Kraken).await.unwrap());
    }

    #[tokio::test]
    async fn envelopes_cannot_be_moved_between_records() {
        let (vault, _) = vault(Factory::granting(&[Permission::Read]));
        let alice = vault.connect("alice", Exchange::Binance, "ka", "sa").await.unwrap();
        let mut mallory = vault.connect("mallory", Exchange::Binance, "km", "sm").await.unwrap();

        mallory.api_secret = alice.api_secret.clone();
        assert!(matches!(
            vault.decrypt_for_use(&mallory),
            Err(VaultError::Decryption(_))
        ));

        // Key and secret of the same record are not interchangeable either.
        let mut swapped = alice.clone();
        swapped.api_key = alice.api_secret.clone();
        assert!(vault.decrypt_for_use(&swapped).is_err());
    }

    #[tokio::test]
    async fn a_different_master_key_cannot_open_records() {
        let factory = Factory::granting(&[Permission::Read]);
        let store = Arc::new(MemoryCredentialStore::new());
        let writer = CredentialVault::new(store.clone(), MasterKey::generate(), factory.clone());
        let record = writer.connect("dan", Exchange::Binance, "k", "s").await.unwrap();

        let reader = CredentialVault::new(store, MasterKey::generate(), factory);
        assert!(matches!(
            reader.decrypt_for_use(&record),
            Err(VaultError::Decryption(_))
        ));
    }
}
