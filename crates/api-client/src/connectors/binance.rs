use super::{
    ConnectorParts, ExchangeConnector, FetchItem, HistoryPlan, PermissionProbe, flag, parse_json,
    require_flag,
};
use crate::credential::DecryptedCredential;
use crate::endpoints::ReadEndpoint;
use crate::error::{ApiError, SigningError};
use crate::responses::{BinanceApiRestrictions, BinanceErrorBody, BinanceTradeId};
use crate::transport::RawResponse;
use async_trait::async_trait;
use core_types::{
    Exchange, PayloadKind, Permission, RawPayload, TradingPair, TransactionFilter, TransactionType,
};
use serde_json::Value;
use std::collections::BTreeSet;

const TRADES_PAGE_LIMIT: usize = 1000;
const INVALID_SYMBOL: i64 = -1121;

pub struct BinanceConnector {
    parts: ConnectorParts,
}

impl BinanceConnector {
    pub fn new(parts: ConnectorParts) -> Self {
        Self { parts }
    }

    async fn call(
        &self,
        credential: &DecryptedCredential,
        endpoint: ReadEndpoint,
        params: Vec<(String, String)>,
    ) -> Result<Value, ApiError> {
        let response = self.parts.dispatch(credential, endpoint, params).await?;
        classify(response)
    }

    async fn fetch_pair_trades(
        &self,
        credential: &DecryptedCredential,
        pair: &TradingPair,
    ) -> Result<RawPayload, ApiError> {
        let symbol = pair.symbol();
        let mut trades: Vec<Value> = Vec::new();
        let mut from_id = 0u64;

        for page in 0..self.parts.settings().max_pages {
            let params = vec![
                ("symbol".to_string(), symbol.clone()),
                ("fromId".to_string(), from_id.to_string()),
                ("limit".to_string(), TRADES_PAGE_LIMIT.to_string()),
            ];
            let body = match self.call(credential, ReadEndpoint::BinanceMyTrades, params).await {
                Ok(body) => body,
                // The planner builds pairs from balances; not every combination is listed.
                Err(ApiError::Exchange {
                    code: Some(INVALID_SYMBOL),
                    ..
                }) => {
                    tracing::debug!(%symbol, "Symbol not listed on Binance, skipping.");
                    break;
                }
                Err(e) => return Err(e),
            };

            let rows = into_array(body)?;
            let count = rows.len();
            let last_id = rows
                .last()
                .map(|row| serde_json::from_value::<BinanceTradeId>(row.clone()))
                .transpose()
                .map_err(|e| ApiError::Deserialization(e.to_string()))?;
            trades.extend(rows);

            match last_id {
                Some(last) if count >= TRADES_PAGE_LIMIT => from_id = last.id + 1,
                _ => break,
            }
            if page + 1 == self.parts.settings().max_pages {
                tracing::warn!(
                    %symbol,
                    pages = page + 1,
                    "Page cap reached; older trades not fetched."
                );
            }
        }

        Ok(RawPayload::new(Exchange::Binance, PayloadKind::Trades, Value::Array(trades))
            .with_pair(pair.clone()))
    }
}

/// Maps a Binance response onto success or a classified error.
pub(crate) fn classify(response: RawResponse) -> Result<Value, ApiError> {
    if response.status == 429 || response.status == 418 {
        return Err(ApiError::RateLimited {
            retry_after: response.retry_after,
        });
    }
    if response.is_success() {
        return parse_json(&response.body);
    }

    let parsed: Option<BinanceErrorBody> = serde_json::from_str(&response.body).ok();
    let code = parsed.as_ref().map(|body| body.code);
    let message = parsed
        .map(|body| body.msg)
        .unwrap_or_else(|| response.body.chars().take(200).collect());

    Err(match code {
        Some(-2008) => ApiError::KeyRevoked(message),
        Some(-2014) | Some(-2015) | Some(-1022) => ApiError::Authentication(message),
        Some(-1021) => ApiError::Signing(SigningError::Clock(message)),
        _ if response.status == 401 => ApiError::Authentication(message),
        _ => ApiError::Exchange {
            status: response.status,
            code,
            message,
        },
    })
}

fn into_array(body: Value) -> Result<Vec<Value>, ApiError> {
    match body {
        Value::Array(rows) => Ok(rows),
        other => Err(ApiError::InvalidData(format!(
            "expected a JSON array, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn since_param(since: Option<chrono::DateTime<chrono::Utc>>) -> Vec<(String, String)> {
    since
        .map(|since| vec![("startTime".to_string(), since.timestamp_millis().to_string())])
        .unwrap_or_default()
}

#[async_trait]
impl ExchangeConnector for BinanceConnector {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn probe_permissions(
        &self,
        credential: &DecryptedCredential,
    ) -> Result<PermissionProbe, ApiError> {
        let body = self
            .call(credential, ReadEndpoint::BinanceApiRestrictions, Vec::new())
            .await?;
        let restrictions: BinanceApiRestrictions =
            serde_json::from_value(body).map_err(|e| ApiError::Deserialization(e.to_string()))?;

        // The core flags must be present; absence is not read as `false`.
        let mut permissions = BTreeSet::new();
        if require_flag(restrictions.enable_reading, "enableReading")? {
            permissions.insert(Permission::Read);
        }
        if require_flag(
            restrictions.enable_spot_and_margin_trading,
            "enableSpotAndMarginTrading",
        )? {
            permissions.insert(Permission::Trade);
        }
        if require_flag(restrictions.enable_withdrawals, "enableWithdrawals")? {
            permissions.insert(Permission::Withdraw);
        }
        if flag(restrictions.enable_internal_transfer)
            || flag(restrictions.permits_universal_transfer)
        {
            permissions.insert(Permission::Transfer);
        }
        if flag(restrictions.enable_margin) || flag(restrictions.enable_portfolio_margin_trading) {
            permissions.insert(Permission::Margin);
        }
        if flag(restrictions.enable_futures) || flag(restrictions.enable_vanilla_options) {
            permissions.insert(Permission::Futures);
        }

        Ok(PermissionProbe::new(Exchange::Binance, permissions))
    }

    async fn fetch_balances(
        &self,
        credential: &DecryptedCredential,
    ) -> Result<RawPayload, ApiError> {
        let body = self
            .call(
                credential,
                ReadEndpoint::BinanceAccount,
                vec![("omitZeroBalances".to_string(), "true".to_string())],
            )
            .await?;
        Ok(RawPayload::new(Exchange::Binance, PayloadKind::Balances, body))
    }

    fn plan_history(
        &self,
        held_assets: &[String],
        _balances: &RawPayload,
        filter: &TransactionFilter,
    ) -> Result<HistoryPlan, ApiError> {
        let mut items = Vec::new();

        // Binance only lists trades per symbol.
        if filter.wants(TransactionType::Buy) || filter.wants(TransactionType::Sell) {
            let quotes = &self.parts.settings().quote_assets;
            for asset in held_assets {
                let excluded = filter.assets.as_ref().is_some_and(|assets| !assets.contains(asset));
                if quotes.contains(asset) || excluded {
                    continue;
                }
                for quote in quotes {
                    items.push(FetchItem::PairTrades {
                        pair: TradingPair::new(asset.clone(), quote.clone()),
                    });
                }
            }
        }
        if filter.wants(TransactionType::Deposit) {
            items.push(FetchItem::Deposits {
                since: filter.since,
            });
        }
        if filter.wants(TransactionType::Withdrawal) {
            items.push(FetchItem::Withdrawals {
                since: filter.since,
            });
        }
        Ok(HistoryPlan::from(items))
    }

    async fn fetch_history(
        &self,
        credential: &DecryptedCredential,
        item: &FetchItem,
    ) -> Result<RawPayload, ApiError> {
        match item {
            FetchItem::PairTrades { pair } => self.fetch_pair_trades(credential, pair).await,
            FetchItem::Deposits { since } => {
                let body = self
                    .call(credential, ReadEndpoint::BinanceDepositHistory, since_param(*since))
                    .await?;
                Ok(RawPayload::new(Exchange::Binance, PayloadKind::Deposits, body))
            }
            FetchItem::Withdrawals { since } => {
                let body = self
                    .call(credential, ReadEndpoint::BinanceWithdrawHistory, since_param(*since))
                    .await?;
                Ok(RawPayload::new(Exchange::Binance, PayloadKind::Withdrawals, body))
            }
            other => Err(ApiError::InvalidData(format!(
                "Binance cannot fetch {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn response(status: u16, body: &str) -> RawResponse {
        RawResponse {
            status,
            retry_after: None,
            body: body.to_string(),
        }
    }

    #[test]
    fn rate_limits_keep_retry_after() {
        let mut limited = response(429, r#"{"code":-1003,"msg":"Too many requests"}"#);
        limited.retry_after = Some(Duration::from_secs(7));
        let error = classify(limited).unwrap_err();
        assert!(error.is_transient());
        assert_eq!(error.retry_after(), Some(Duration::from_secs(7)));

        assert!(matches!(
            classify(response(418, "")),
            Err(ApiError::RateLimited { .. })
        ));
    }

    #[test]
    fn auth_codes_are_credential_fatal() {
        for code in [-2014, -2015, -1022] {
            let body = format!(r#"{{"code":{code},"msg":"rejected"}}"#);
            let error = classify(response(400, &body)).unwrap_err();
            assert!(matches!(error, ApiError::Authentication(_)), "{code}");
            assert!(error.is_credential_fatal());
        }
        assert!(matches!(
            classify(response(401, r#"{"code":-2008,"msg":"Invalid Api-Key ID."}"#)),
            Err(ApiError::KeyRevoked(_))
        ));
        assert!(matches!(
            classify(response(400, r#"{"code":-1021,"msg":"Timestamp outside recvWindow"}"#)),
            Err(ApiError::Signing(SigningError::Clock(_)))
        ));
    }

    #[test]
    fn server_errors_are_transient() {
        let error = classify(response(503, "Service Unavailable")).unwrap_err();
        assert!(error.is_transient());
        assert!(!error.is_credential_fatal());
    }

    #[test]
    fn invalid_symbol_keeps_its_code() {
        assert!(matches!(
            classify(response(400, r#"{"code":-1121,"msg":"Invalid symbol."}"#)),
            Err(ApiError::Exchange {
                code: Some(INVALID_SYMBOL),
                ..
            })
        ));
    }
}
