use serde::Deserialize;
use serde_json::Value;

// Only the fields the connectors act on are modelled here. Data payloads stay
// as `serde_json::Value` and are interpreted by the normalizer.

/// `GET /sapi/v1/account/apiRestrictions`.
///
/// Every flag is optional so that a missing field can be told apart from
/// `false`; the probe refuses to guess.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinanceApiRestrictions {
    pub enable_reading: Option<bool>,
    pub enable_spot_and_margin_trading: Option<bool>,
    pub enable_withdrawals: Option<bool>,
    pub enable_internal_transfer: Option<bool>,
    pub enable_margin: Option<bool>,
    pub enable_futures: Option<bool>,
    pub permits_universal_transfer: Option<bool>,
    pub enable_vanilla_options: Option<bool>,
    pub enable_portfolio_margin_trading: Option<bool>,
}

/// Represents an error response from the Binance API.
#[derive(Debug, Clone, Deserialize)]
pub struct BinanceErrorBody {
    pub code: i64,
    pub msg: String,
}

/// A single trade row, reduced to the id used for `fromId` paging.
#[derive(Debug, Clone, Deserialize)]
pub struct BinanceTradeId {
    pub id: u64,
}

/// Kraken wraps every response in `{ "error": [...], "result": ... }`.
#[derive(Debug, Clone, Deserialize)]
pub struct KrakenEnvelope {
    #[serde(default)]
    pub error: Vec<String>,
    pub result: Option<Value>,
}

/// `TradesHistory` and `Ledgers` pages: a keyed map plus the total count.
#[derive(Debug, Clone, Deserialize)]
pub struct KrakenPage {
    #[serde(default, alias = "ledger")]
    pub trades: serde_json::Map<String, Value>,
    #[serde(default)]
    pub count: u64,
}

/// `GET /api/v3/brokerage/key_permissions`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoinbaseKeyPermissions {
    pub can_view: Option<bool>,
    pub can_trade: Option<bool>,
    pub can_transfer: Option<bool>,
    pub portfolio_uuid: Option<String>,
    pub portfolio_type: Option<String>,
}

/// One page of `GET /api/v3/brokerage/accounts`.
#[derive(Debug, Clone, Deserialize)]
pub struct CoinbaseAccountsPage {
    #[serde(default)]
    pub accounts: Vec<Value>,
    #[serde(default)]
    pub has_next: bool,
    pub cursor: Option<String>,
}

/// The two account fields needed to plan per-account history fetches.
#[derive(Debug, Clone, Deserialize)]
pub struct CoinbaseAccountRef {
    #[serde(default)]
    pub uuid: Option<String>,
    pub currency: String,
}

/// One page of a Coinbase v2 listing.
#[derive(Debug, Clone, Deserialize)]
pub struct CoinbaseV2Page {
    #[serde(default)]
    pub data: Vec<Value>,
    pub pagination: Option<CoinbaseV2Pagination>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoinbaseV2Pagination {
    pub next_starting_after: Option<String>,
}

/// Coinbase error bodies come in a v3 (`error`/`message`) and a v2
/// (`errors: [{id, message}]`) flavour.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoinbaseErrorBody {
    pub error: Option<String>,
    pub message: Option<String>,
    #[serde(default)]
    pub errors: Vec<CoinbaseErrorItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoinbaseErrorItem {
    pub id: Option<String>,
    pub message: Option<String>,
}

impl CoinbaseErrorBody {
    pub fn describe(&self) -> String {
        if let Some(item) = self.errors.first() {
            return format!(
                "{}: {}",
                item.id.as_deref().unwrap_or("error"),
                item.message.as_deref().unwrap_or_default()
            );
        }
        match (&self.error, &self.message) {
            (Some(error), Some(message)) => format!("{error}: {message}"),
            (Some(error), None) => error.clone(),
            (None, Some(message)) => message.clone(),
            (None, None) => "unknown error".to_string(),
        }
    }
}

/// `GET /api/v3/ticker/price?symbol=...` (public).
#[derive(Debug, Clone, Deserialize)]
pub struct BinanceTickerPrice {
    pub symbol: String,
    pub price: rust_decimal::Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_restriction_flags_stay_unknown() {
        let parsed: BinanceApiRestrictions =
            serde_json::from_str(r#"{"enableReading":true,"ipRestrict":false}"#).unwrap();
        assert_eq!(parsed.enable_reading, Some(true));
        assert_eq!(parsed.enable_withdrawals, None);
    }

    #[test]
    fn kraken_ledger_pages_share_the_trade_shape() {
        let page: KrakenPage = serde_json::from_str(
            r#"{"ledger":{"L1":{"type":"deposit"},"L2":{"type":"withdrawal"}},"count":7}"#,
        )
        .unwrap();
        assert_eq!(page.trades.len(), 2);
        assert_eq!(page.count, 7);
    }

    #[test]
    fn coinbase_errors_describe_both_flavours() {
        let v3: CoinbaseErrorBody =
            serde_json::from_str(r#"{"error":"PERMISSION_DENIED","message":"no"}"#).unwrap();
        assert_eq!(v3.describe(), "PERMISSION_DENIED: no");

        let v2: CoinbaseErrorBody = serde_json::from_str(
            r#"{"errors":[{"id":"authentication_error","message":"invalid signature"}]}"#,
        )
        .unwrap();
        assert_eq!(v2.describe(), "authentication_error: invalid signature");
    }

    #[test]
    fn ticker_price_is_decimal() {
        let ticker: BinanceTickerPrice =
            serde_json::from_str(r#"{"symbol":"BTCUSDT","price":"64000.12000000"}"#).unwrap();
        assert_eq!(ticker.price.to_string(), "64000.12000000");
    }
}
