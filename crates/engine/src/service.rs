use crate::classify::{api_error_kind, vault_error_kind};
use crate::error::EngineError;
use crate::orchestrator::{OrchestratorSettings, SyncOrchestrator};
use api_client::{
    BinanceTickerOracle, ConnectorFactory, ConnectorSettings, HttpConnectorFactory, HttpTransport,
    PriceOracle, ReqwestTransport,
};
use configuration::Config;
use core_types::{
    BalanceSyncResult, CredentialSummary, Exchange, SyncItemError, TransactionFilter,
    TransactionSyncResult,
};
use database::CredentialStore;
use envelope::MasterKey;
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vault::CredentialVault;

/// The entry point callers such as a web handler or the CLI talk to.
pub struct ExchangeSyncService {
    vault: Arc<CredentialVault>,
    orchestrator: SyncOrchestrator,
}

impl ExchangeSyncService {
    pub fn new(
        vault: Arc<CredentialVault>,
        oracle: Arc<dyn PriceOracle>,
        settings: OrchestratorSettings,
    ) -> Self {
        let orchestrator = SyncOrchestrator::new(vault.clone(), oracle, settings);
        Self {
            vault,
            orchestrator,
        }
    }

    /// Wires the production stack: `reqwest` transport, real connectors and
    /// the Binance ticker oracle.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn CredentialStore>,
        master_key: MasterKey,
    ) -> Result<Self, EngineError> {
        let transport: Arc<dyn HttpTransport> =
            Arc::new(ReqwestTransport::new(config.sync.request_timeout())?);
        let connectors: Arc<dyn ConnectorFactory> = Arc::new(HttpConnectorFactory::new(
            transport.clone(),
            config.exchanges.clone(),
            ConnectorSettings::from(&config.sync),
        ));
        let oracle: Arc<dyn PriceOracle> =
            Arc::new(BinanceTickerOracle::new(transport, &config.pricing));
        let vault = Arc::new(CredentialVault::new(store, master_key, connectors));
        Ok(Self::new(
            vault,
            oracle,
            OrchestratorSettings::from(&config.sync),
        ))
    }

    /// Probes, verifies and stores a read-only credential.
    pub async fn connect_exchange(
        &self,
        user_id: &str,
        exchange: Exchange,
        api_key: &str,
        api_secret: &str,
    ) -> Result<CredentialSummary, EngineError> {
        let record = self
            .vault
            .connect(user_id, exchange, api_key, api_secret)
            .await?;
        Ok(record.summary())
    }

    pub async fn sync_balances(
        &self,
        user_id: &str,
        exchange: Exchange,
        cancel: &CancellationToken,
    ) -> Result<BalanceSyncResult, EngineError> {
        self.orchestrator.sync_balances(user_id, exchange, cancel).await
    }

    pub async fn sync_transactions(
        &self,
        user_id: &str,
        exchange: Exchange,
        filter: &TransactionFilter,
        cancel: &CancellationToken,
    ) -> Result<TransactionSyncResult, EngineError> {
        self.orchestrator
            .sync_transactions(user_id, exchange, filter, cancel)
            .await
    }

    /// Syncs balances of every linked exchange concurrently. A failing
    /// credential shows up as a failed result; it never stops the others.
    pub async fn sync_all(
        &self,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<BalanceSyncResult>, EngineError> {
        let records = self.vault.list(user_id).await?;
        let runs = records.iter().map(|record| async move {
            let exchange = record.exchange;
            match self.orchestrator.sync_balances(user_id, exchange, cancel).await {
                Ok(result) => result,
                Err(e) => {
                    let kind = match &e {
                        EngineError::Vault(v) => vault_error_kind(v),
                        EngineError::ApiClient(a) => api_error_kind(a),
                    };
                    tracing::warn!(%user_id, %exchange, error = %e, "Balance sync could not run.");
                    BalanceSyncResult::failed(
                        exchange,
                        SyncItemError::new("credential", kind, e.to_string()),
                    )
                }
            }
        });
        Ok(join_all(runs).await)
    }

    /// Deletes the credential immediately. Returns whether one existed.
    pub async fn disconnect_exchange(
        &self,
        user_id: &str,
        exchange: Exchange,
    ) -> Result<bool, EngineError> {
        Ok(self.vault.disconnect(user_id, exchange).await?)
    }

    pub async fn list_connections(
        &self,
        user_id: &str,
    ) -> Result<Vec<CredentialSummary>, EngineError> {
        let records = self.vault.list(user_id).await?;
        Ok(records.iter().map(|record| record.summary()).collect())
    }
}
