//! Per-exchange connectors.
//!
//! A connector knows one exchange's probes, pagination and error vocabulary.
//! All three share [`ConnectorParts::dispatch`], which is the only place a
//! request is budgeted, signed and sent.

use crate::auth::{RequestSigner, Signer, SigningContext};
use crate::credential::DecryptedCredential;
use crate::endpoints::{AccountId, ReadEndpoint};
use crate::error::ApiError;
use crate::lane::{CredentialLane, LaneArena};
use crate::transport::{HttpTransport, RawResponse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use configuration::{ExchangeSettings, SyncSettings};
use core_types::{Exchange, Permission, RawPayload, TradingPair, TransactionFilter};
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

mod binance;
mod coinbase;
mod kraken;

pub use binance::BinanceConnector;
pub use coinbase::CoinbaseConnector;
pub use kraken::KrakenConnector;

/// What a live probe found the key is allowed to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionProbe {
    pub exchange: Exchange,
    pub permissions: BTreeSet<Permission>,
}

impl PermissionProbe {
    pub fn new(exchange: Exchange, permissions: BTreeSet<Permission>) -> Self {
        Self {
            exchange,
            permissions,
        }
    }

    pub fn can_read(&self) -> bool {
        self.permissions.contains(&Permission::Read)
    }

    /// Permissions beyond read-only access.
    pub fn escalations(&self) -> Vec<Permission> {
        self.permissions
            .iter()
            .copied()
            .filter(Permission::is_destructive)
            .collect()
    }

    pub fn is_read_only(&self) -> bool {
        self.can_read() && self.escalations().is_empty()
    }
}

/// One unit of history fan-out. Each item succeeds or fails on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchItem {
    PairTrades { pair: TradingPair },
    TradeHistory { since: Option<DateTime<Utc>> },
    Deposits { since: Option<DateTime<Utc>> },
    Withdrawals { since: Option<DateTime<Utc>> },
    AccountTransactions { account_id: AccountId, asset: String },
}

impl FetchItem {
    pub fn label(&self) -> String {
        match self {
            FetchItem::PairTrades { pair } => format!("trades {}", pair.symbol()),
            FetchItem::TradeHistory { .. } => "trade history".to_string(),
            FetchItem::Deposits { .. } => "deposits".to_string(),
            FetchItem::Withdrawals { .. } => "withdrawals".to_string(),
            FetchItem::AccountTransactions { asset, .. } => format!("{asset} account history"),
        }
    }
}

impl fmt::Display for FetchItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// A history source the planner had to leave out, with the reason.
#[derive(Debug)]
pub struct SkippedSource {
    /// Label the source would have had as a [`FetchItem`].
    pub label: String,
    pub error: ApiError,
}

/// The fan-out for one run, plus the sources that could not be planned.
#[derive(Debug, Default)]
pub struct HistoryPlan {
    pub items: Vec<FetchItem>,
    pub skipped: Vec<SkippedSource>,
}

impl HistoryPlan {
    pub fn push(&mut self, item: FetchItem) {
        self.items.push(item);
    }

    pub fn skip(&mut self, label: impl Into<String>, error: ApiError) {
        self.skipped.push(SkippedSource {
            label: label.into(),
            error,
        });
    }
}

impl From<Vec<FetchItem>> for HistoryPlan {
    fn from(items: Vec<FetchItem>) -> Self {
        Self {
            items,
            skipped: Vec::new(),
        }
    }
}

/// The exchange-specific half of a sync.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    fn exchange(&self) -> Exchange;

    /// Live, read-only check of what the key may do.
    async fn probe_permissions(
        &self,
        credential: &DecryptedCredential,
    ) -> Result<PermissionProbe, ApiError>;

    /// The account-level balance payload.
    async fn fetch_balances(&self, credential: &DecryptedCredential)
    -> Result<RawPayload, ApiError>;

    /// Turns the held assets (already ranked and capped by the caller) into
    /// history fetch items. A source that cannot be planned is skipped on its
    /// own; only an unreadable balance payload fails the whole plan.
    fn plan_history(
        &self,
        held_assets: &[String],
        balances: &RawPayload,
        filter: &TransactionFilter,
    ) -> Result<HistoryPlan, ApiError>;

    /// Fetches every page of one item.
    async fn fetch_history(
        &self,
        credential: &DecryptedCredential,
        item: &FetchItem,
    ) -> Result<RawPayload, ApiError>;
}

/// Connector knobs taken from the sync configuration.
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub max_pages: u32,
    pub quote_assets: Vec<String>,
}

impl From<&SyncSettings> for ConnectorSettings {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            max_pages: settings.max_pages.max(1),
            quote_assets: settings
                .quote_assets
                .iter()
                .map(|quote| quote.trim().to_ascii_uppercase())
                .collect(),
        }
    }
}

/// State shared by every connector: signer, transport and the credential's lane.
pub struct ConnectorParts {
    exchange: Exchange,
    signer: Signer,
    transport: Arc<dyn HttpTransport>,
    lane: Arc<CredentialLane>,
    settings: ConnectorSettings,
}

impl ConnectorParts {
    pub fn new(
        exchange: Exchange,
        base_url: &str,
        transport: Arc<dyn HttpTransport>,
        lane: Arc<CredentialLane>,
        settings: ConnectorSettings,
    ) -> Self {
        Self {
            exchange,
            signer: Signer::for_exchange(exchange, base_url),
            transport,
            lane,
            settings,
        }
    }

    pub fn settings(&self) -> &ConnectorSettings {
        &self.settings
    }

    /// Budgets, signs and sends one request to a catalogued endpoint.
    pub async fn dispatch(
        &self,
        credential: &DecryptedCredential,
        endpoint: ReadEndpoint,
        params: Vec<(String, String)>,
    ) -> Result<RawResponse, ApiError> {
        // 1. Wait for rate budget.
        self.lane.acquire(endpoint.weight()).await?;

        // 2. Nonce lanes stay locked from nonce issue until the response, so
        //    nonces reach the exchange in the order they were issued.
        let _serial = self.lane.serialize().await;

        // 3. Sign a fresh context; bearer tokens and nonces are never reused.
        let mut ctx =
            SigningContext::new(endpoint, Utc::now().timestamp_millis()).with_params(params);
        if self.exchange.requires_nonce() {
            ctx = ctx.with_nonce(self.lane.next_nonce());
        }
        let request = self.signer.sign(credential, &ctx)?;

        tracing::debug!(
            exchange = %self.exchange,
            endpoint = %ctx.endpoint(),
            "Sending signed request."
        );

        // 4. Send.
        let response = self.transport.execute(request).await?;
        tracing::trace!(exchange = %self.exchange, status = response.status, "Response received.");
        Ok(response)
    }
}

/// Builds connectors bound to a credential's lane.
pub trait ConnectorFactory: Send + Sync {
    fn connector_for(&self, exchange: Exchange, credential_id: Uuid) -> Arc<dyn ExchangeConnector>;

    /// Frees per-credential state after a disconnect.
    fn release(&self, exchange: Exchange, credential_id: Uuid);
}

/// The production factory: real signers over an [`HttpTransport`].
pub struct HttpConnectorFactory {
    transport: Arc<dyn HttpTransport>,
    exchanges: ExchangeSettings,
    settings: ConnectorSettings,
    lanes: LaneArena,
}

impl HttpConnectorFactory {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        exchanges: ExchangeSettings,
        settings: ConnectorSettings,
    ) -> Self {
        Self {
            transport,
            exchanges,
            settings,
            lanes: LaneArena::new(),
        }
    }

    pub fn lanes(&self) -> &LaneArena {
        &self.lanes
    }
}

impl ConnectorFactory for HttpConnectorFactory {
    fn connector_for(&self, exchange: Exchange, credential_id: Uuid) -> Arc<dyn ExchangeConnector> {
        let endpoint = self.exchanges.for_exchange(exchange);
        let lane = self
            .lanes
            .lane_for(exchange, credential_id, &endpoint.rate_limit);
        let parts = ConnectorParts::new(
            exchange,
            &endpoint.base_url,
            self.transport.clone(),
            lane,
            self.settings.clone(),
        );
        match exchange {
            Exchange::Binance => Arc::new(BinanceConnector::new(parts)),
            Exchange::Kraken => Arc::new(KrakenConnector::new(parts)),
            Exchange::Coinbase => Arc::new(CoinbaseConnector::new(parts)),
        }
    }

    fn release(&self, exchange: Exchange, credential_id: Uuid) {
        self.lanes.remove(exchange, credential_id);
    }
}

pub(crate) fn parse_json<T: DeserializeOwned>(body: &str) -> Result<T, ApiError> {
    serde_json::from_str(body).map_err(|e| ApiError::Deserialization(e.to_string()))
}

pub(crate) fn flag(value: Option<bool>) -> bool {
    value.unwrap_or(false)
}

pub(crate) fn require_flag(value: Option<bool>, name: &str) -> Result<bool, ApiError> {
    value.ok_or_else(|| ApiError::InvalidData(format!("permission probe is missing `{name}`")))
}
