//! The complete catalogue of exchange endpoints this crate can sign for.
//!
//! Every authenticated request starts from a [`ReadEndpoint`]. There is no
//! way to sign an arbitrary path, so order placement, cancellation, transfers
//! and withdrawals are unreachable from this code path.

use crate::error::ApiError;
use core_types::Exchange;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Coinbase account identifier, restricted to characters that cannot alter
/// the request path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountId(String);

impl AccountId {
    pub fn parse(raw: &str) -> Result<Self, ApiError> {
        let valid = !raw.is_empty()
            && raw.len() <= 64
            && raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(ApiError::InvalidData(format!("invalid account id: {raw:?}")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Read-only endpoints, one variant per call the sync ever makes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEndpoint {
    BinanceApiRestrictions,
    BinanceAccount,
    BinanceMyTrades,
    BinanceDepositHistory,
    BinanceWithdrawHistory,
    KrakenBalanceEx,
    KrakenWithdrawMethods,
    KrakenTradesHistory,
    KrakenLedgers,
    CoinbaseKeyPermissions,
    CoinbaseAccounts,
    CoinbaseAccountTransactions { account_id: AccountId },
}

impl ReadEndpoint {
    pub fn exchange(&self) -> Exchange {
        use ReadEndpoint::*;
        match self {
            BinanceApiRestrictions | BinanceAccount | BinanceMyTrades | BinanceDepositHistory
            | BinanceWithdrawHistory => Exchange::Binance,
            KrakenBalanceEx | KrakenWithdrawMethods | KrakenTradesHistory | KrakenLedgers => {
                Exchange::Kraken
            }
            CoinbaseKeyPermissions | CoinbaseAccounts | CoinbaseAccountTransactions { .. } => {
                Exchange::Coinbase
            }
        }
    }

    /// Kraken's private API is POST-only; everything else here is a GET.
    pub fn method(&self) -> HttpMethod {
        match self.exchange() {
            Exchange::Kraken => HttpMethod::Post,
            Exchange::Binance | Exchange::Coinbase => HttpMethod::Get,
        }
    }

    pub fn path(&self) -> String {
        use ReadEndpoint::*;
        match self {
            BinanceApiRestrictions => "/sapi/v1/account/apiRestrictions".into(),
            BinanceAccount => "/api/v3/account".into(),
            BinanceMyTrades => "/api/v3/myTrades".into(),
            BinanceDepositHistory => "/sapi/v1/capital/deposit/hisrec".into(),
            BinanceWithdrawHistory => "/sapi/v1/capital/withdraw/history".into(),
            KrakenBalanceEx => "/0/private/BalanceEx".into(),
            KrakenWithdrawMethods => "/0/private/WithdrawMethods".into(),
            KrakenTradesHistory => "/0/private/TradesHistory".into(),
            KrakenLedgers => "/0/private/Ledgers".into(),
            CoinbaseKeyPermissions => "/api/v3/brokerage/key_permissions".into(),
            CoinbaseAccounts => "/api/v3/brokerage/accounts".into(),
            CoinbaseAccountTransactions { account_id } => {
                format!("/v2/accounts/{}/transactions", account_id.as_str())
            }
        }
    }

    /// Cost of one call against the lane's rate budget.
    pub fn weight(&self) -> u32 {
        use ReadEndpoint::*;
        match self {
            BinanceAccount | BinanceMyTrades => 20,
            BinanceApiRestrictions | BinanceDepositHistory | BinanceWithdrawHistory => 1,
            // Kraken's history calls raise the call counter by two.
            KrakenTradesHistory | KrakenLedgers => 2,
            KrakenBalanceEx | KrakenWithdrawMethods => 1,
            CoinbaseKeyPermissions | CoinbaseAccounts | CoinbaseAccountTransactions { .. } => 1,
        }
    }
}

impl fmt::Display for ReadEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method(), self.path())
    }
}
