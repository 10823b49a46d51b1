use crate::enums::{
    CredentialStatus, Exchange, PayloadKind, Permission, SyncErrorKind, SyncStatus,
    TransactionType,
};
use crate::error::CoreError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use uuid::Uuid;

/// A normalized holding of one asset on one exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
    /// Always `free + locked`.
    pub total: Decimal,
    /// Zero when no price resolved. Never negative.
    pub value_usd: Decimal,
    pub price_usd: Decimal,
}

impl Balance {
    /// Builds an unpriced balance. Negative components are clamped to zero so
    /// that `total` can never go below zero.
    pub fn new(
        asset: impl Into<String>,
        free: Decimal,
        locked: Decimal,
    ) -> Result<Self, CoreError> {
        let asset = asset.into();
        let free = free.max(Decimal::ZERO);
        let locked = locked.max(Decimal::ZERO);
        let total = free
            .checked_add(locked)
            .ok_or_else(|| CoreError::Overflow(format!("{asset} free + locked")))?;
        Ok(Self {
            asset,
            free,
            locked,
            total,
            value_usd: Decimal::ZERO,
            price_usd: Decimal::ZERO,
        })
    }

    /// Adds another balance of the same asset into this one. On overflow
    /// `self` is left unchanged.
    pub fn merge(&mut self, other: &Balance) -> Result<(), CoreError> {
        let overflow = || CoreError::Overflow(format!("merged {} balance", self.asset));
        let free = self.free.checked_add(other.free).ok_or_else(overflow)?;
        let locked = self.locked.checked_add(other.locked).ok_or_else(overflow)?;
        let total = free.checked_add(locked).ok_or_else(overflow)?;
        self.free = free;
        self.locked = locked;
        self.total = total;
        Ok(())
    }

    /// Applies a resolved spot price and reports whether the balance ended
    /// up priced. `None`, a negative price, or a value too large to represent
    /// leaves the balance valued at zero.
    pub fn apply_price(&mut self, price_usd: Option<Decimal>) -> bool {
        let valued = price_usd
            .filter(|price| *price >= Decimal::ZERO)
            .and_then(|price| self.total.checked_mul(price).map(|value| (price, value)));
        let (price, value) = valued.unwrap_or((Decimal::ZERO, Decimal::ZERO));
        self.price_usd = price;
        self.value_usd = value;
        valued.is_some()
    }

    pub fn is_zero(&self) -> bool {
        self.total.is_zero()
    }
}

/// A base/quote pair as the fan-out planner builds it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradingPair {
    pub base: String,
    pub quote: String,
}

impl TradingPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
        }
    }

    /// Concatenated exchange symbol, e.g. `BTCUSDT`.
    pub fn symbol(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

/// A normalized transaction from any exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// `{exchange}:{kind}:{native id}`, unique across every source.
    pub id: String,
    pub exchange: Exchange,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub asset: String,
    /// The trading pair for buys and sells, when known.
    pub symbol: Option<String>,
    /// Absolute quantity of `asset`. Direction is carried by `tx_type`.
    pub amount: Decimal,
    pub price: Option<Decimal>,
    pub fee: Option<Decimal>,
    pub fee_asset: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// The exchange's original record.
    pub raw: JsonValue,
}

/// Caller-supplied filter for transaction syncs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub types: Option<HashSet<TransactionType>>,
    /// Normalized asset symbols.
    pub assets: Option<HashSet<String>>,
}

impl TransactionFilter {
    /// Whether transactions of `tx_type` can pass this filter at all.
    pub fn wants(&self, tx_type: TransactionType) -> bool {
        self.types.as_ref().is_none_or(|types| types.contains(&tx_type))
    }

    pub fn matches(&self, tx: &Transaction) -> bool {
        if self.since.is_some_and(|since| tx.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| tx.timestamp > until) {
            return false;
        }
        if let Some(types) = &self.types {
            if !types.contains(&tx.tx_type) {
                return false;
            }
        }
        if let Some(assets) = &self.assets {
            if !assets.contains(&tx.asset) {
                return false;
            }
        }
        true
    }
}

/// An exchange response body tagged with the shape it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPayload {
    pub exchange: Exchange,
    pub kind: PayloadKind,
    pub body: JsonValue,
    /// Set for per-pair trade fetches so the normalizer knows the base asset.
    pub pair: Option<TradingPair>,
}

impl RawPayload {
    pub fn new(exchange: Exchange, kind: PayloadKind, body: JsonValue) -> Self {
        Self {
            exchange,
            kind,
            body,
            pair: None,
        }
    }

    pub fn with_pair(mut self, pair: TradingPair) -> Self {
        self.pair = Some(pair);
        self
    }
}

/// One failed fetch item, reported alongside whatever data did arrive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncItemError {
    pub item: String,
    pub kind: SyncErrorKind,
    pub message: String,
}

impl SyncItemError {
    pub fn new(item: impl Into<String>, kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for SyncItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.item, self.kind, self.message)
    }
}

/// Result of `syncBalances`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSyncResult {
    pub exchange: Exchange,
    pub status: SyncStatus,
    pub balances: Vec<Balance>,
    pub total_value_usd: Decimal,
    pub errors: Vec<SyncItemError>,
    /// Assets returned with `value_usd = 0` because no price resolved.
    pub unpriced_assets: Vec<String>,
    pub synced_at: DateTime<Utc>,
}

impl BalanceSyncResult {
    pub fn failed(exchange: Exchange, error: SyncItemError) -> Self {
        Self {
            exchange,
            status: SyncStatus::Failed,
            balances: Vec::new(),
            total_value_usd: Decimal::ZERO,
            errors: vec![error],
            unpriced_assets: Vec::new(),
            synced_at: Utc::now(),
        }
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}

/// Result of `syncTransactions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSyncResult {
    pub exchange: Exchange,
    pub status: SyncStatus,
    /// Newest first, unique by `id`.
    pub transactions: Vec<Transaction>,
    pub errors: Vec<SyncItemError>,
    pub synced_at: DateTime<Utc>,
}

impl TransactionSyncResult {
    pub fn failed(exchange: Exchange, error: SyncItemError) -> Self {
        Self {
            exchange,
            status: SyncStatus::Failed,
            transactions: Vec::new(),
            errors: vec![error],
            synced_at: Utc::now(),
        }
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}

/// A credential as it may be shown to a user: no envelopes, no secrets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSummary {
    pub id: Uuid,
    pub user_id: String,
    pub exchange: Exchange,
    pub permissions: BTreeSet<Permission>,
    pub status: CredentialStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}
