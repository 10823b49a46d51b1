use super::{
    ConnectorParts, ExchangeConnector, FetchItem, HistoryPlan, PermissionProbe, parse_json,
};
use crate::credential::DecryptedCredential;
use crate::endpoints::ReadEndpoint;
use crate::error::ApiError;
use crate::responses::{KrakenEnvelope, KrakenPage};
use crate::transport::RawResponse;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{Exchange, PayloadKind, Permission, RawPayload, TransactionFilter, TransactionType};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

pub struct KrakenConnector {
    parts: ConnectorParts,
}

impl KrakenConnector {
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

    /// Walks `ofs` pages of `TradesHistory` or `Ledgers` and merges the keyed rows.
    async fn fetch_paged(
        &self,
        credential: &DecryptedCredential,
        endpoint: ReadEndpoint,
        mut params: Vec<(String, String)>,
        result_key: &str,
    ) -> Result<Value, ApiError> {
        let mut rows = Map::new();
        let mut offset = 0u64;
        params.push(("ofs".to_string(), "0".to_string()));
        let ofs_index = params.len() - 1;

        for _ in 0..self.parts.settings().max_pages {
            params[ofs_index].1 = offset.to_string();
            let result = self.call(credential, endpoint.clone(), params.clone()).await?;
            let page: KrakenPage =
                serde_json::from_value(result).map_err(|e| ApiError::Deserialization(e.to_string()))?;

            let received = page.trades.len() as u64;
            rows.extend(page.trades);
            offset += received;

            if received == 0 || offset >= page.count {
                break;
            }
            tracing::debug!(offset, count = page.count, "Fetching next Kraken page.");
        }

        let mut body = Map::new();
        body.insert(result_key.to_string(), Value::Object(rows));
        Ok(Value::Object(body))
    }
}

/// Kraken reports errors in the body, often with HTTP 200.
pub(crate) fn classify(response: RawResponse) -> Result<Value, ApiError> {
    if response.status == 429 {
        return Err(ApiError::RateLimited {
            retry_after: response.retry_after,
        });
    }
    if !response.is_success() {
        return Err(ApiError::Exchange {
            status: response.status,
            code: None,
            message: response.body.chars().take(200).collect(),
        });
    }

    let envelope: KrakenEnvelope = parse_json(&response.body)?;
    if let Some(first) = envelope.error.first() {
        let message = envelope.error.join("; ");
        return Err(classify_error(first, message, response.retry_after));
    }
    envelope
        .result
        .ok_or_else(|| ApiError::InvalidData("Kraken response has neither error nor result".into()))
}

fn classify_error(
    first: &str,
    message: String,
    retry_after: Option<std::time::Duration>,
) -> ApiError {
    let starts = |prefix: &str| first.starts_with(prefix);
    if starts("EAPI:Rate limit exceeded")
        || starts("EGeneral:Too many requests")
        || starts("EService:Throttled")
    {
        ApiError::RateLimited { retry_after }
    } else if starts("EAPI:Invalid signature") || starts("EAPI:Invalid nonce") {
        ApiError::Authentication(message)
    } else if starts("EAPI:Invalid key") {
        ApiError::KeyRevoked(message)
    } else if starts("EGeneral:Permission denied") {
        ApiError::PermissionDenied(message)
    } else if starts("EService:Unavailable") || starts("EService:Busy") {
        ApiError::Network(message)
    } else {
        ApiError::Exchange {
            status: 200,
            code: None,
            message,
        }
    }
}

fn start_param(since: Option<DateTime<Utc>>) -> Vec<(String, String)> {
    since
        .map(|since| vec![("start".to_string(), since.timestamp().to_string())])
        .unwrap_or_default()
}

#[async_trait]
impl ExchangeConnector for KrakenConnector {
    fn exchange(&self) -> Exchange {
        Exchange::Kraken
    }

    async fn probe_permissions(
        &self,
        credential: &DecryptedCredential,
    ) -> Result<PermissionProbe, ApiError> {
        let mut permissions = BTreeSet::new();

        // 1. Read access: the balance call has to work.
        self.call(credential, ReadEndpoint::KrakenBalanceEx, Vec::new())
            .await?;
        permissions.insert(Permission::Read);

        // 2. Withdraw access: listing withdrawal methods is only allowed for
        //    keys that may withdraw. Only an explicit denial counts as "no".
        match self
            .call(credential, ReadEndpoint::KrakenWithdrawMethods, Vec::new())
            .await
        {
            Ok(_) => {
                permissions.insert(Permission::Withdraw);
            }
            Err(ApiError::PermissionDenied(_)) => {}
            Err(e) => return Err(e),
        }

        Ok(PermissionProbe::new(Exchange::Kraken, permissions))
    }

    async fn fetch_balances(
        &self,
        credential: &DecryptedCredential,
    ) -> Result<RawPayload, ApiError> {
        let body = self
            .call(credential, ReadEndpoint::KrakenBalanceEx, Vec::new())
            .await?;
        Ok(RawPayload::new(Exchange::Kraken, PayloadKind::Balances, body))
    }

    fn plan_history(
        &self,
        _held_assets: &[String],
        _balances: &RawPayload,
        filter: &TransactionFilter,
    ) -> Result<HistoryPlan, ApiError> {
        // Kraken serves account-wide history; no per-pair fan-out is needed.
        let mut items = Vec::new();
        if filter.wants(TransactionType::Buy) || filter.wants(TransactionType::Sell) {
            items.push(FetchItem::TradeHistory {
                since: filter.since,
            });
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
            FetchItem::TradeHistory { since } => {
                let body = self
                    .fetch_paged(
                        credential,
                        ReadEndpoint::KrakenTradesHistory,
                        start_param(*since),
                        "trades",
                    )
                    .await?;
                Ok(RawPayload::new(Exchange::Kraken, PayloadKind::Trades, body))
            }
            FetchItem::Deposits { since } | FetchItem::Withdrawals { since } => {
                let ledger_type = if matches!(item, FetchItem::Deposits { .. }) {
                    "deposit"
                } else {
                    "withdrawal"
                };
                let mut params = start_param(*since);
                params.push(("type".to_string(), ledger_type.to_string()));
                let body = self
                    .fetch_paged(credential, ReadEndpoint::KrakenLedgers, params, "ledger")
                    .await?;
                Ok(RawPayload::new(Exchange::Kraken, PayloadKind::Ledger, body))
            }
            other => Err(ApiError::InvalidData(format!("Kraken cannot fetch {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(body: &str) -> RawResponse {
        RawResponse {
            status: 200,
            retry_after: None,
            body: body.to_string(),
        }
    }

    #[test]
    fn result_is_unwrapped() {
        let value = classify(ok(r#"{"error":[],"result":{"XXBT":{"balance":"1.0"}}}"#)).unwrap();
        assert_eq!(value["XXBT"]["balance"], "1.0");
    }

    #[test]
    fn error_array_is_classified() {
        let cases = [
            ("EAPI:Rate limit exceeded", "rate"),
            ("EService:Throttled: 1700000000", "rate"),
            ("EGeneral:Too many requests", "rate"),
            ("EAPI:Invalid nonce", "auth"),
            ("EAPI:Invalid signature", "auth"),
            ("EAPI:Invalid key", "revoked"),
            ("EGeneral:Permission denied", "denied"),
            ("EService:Unavailable", "network"),
            ("EGeneral:Invalid arguments", "other"),
        ];
        for (error, expected) in cases {
            let body = format!(r#"{{"error":["{error}"]}}"#);
            let classified = classify(ok(&body)).unwrap_err();
            let actual = match classified {
                ApiError::RateLimited { .. } => "rate",
                ApiError::Authentication(_) => "auth",
                ApiError::KeyRevoked(_) => "revoked",
                ApiError::PermissionDenied(_) => "denied",
                ApiError::Network(_) => "network",
                ApiError::Exchange { .. } => "other",
                _ => "unexpected",
            };
            assert_eq!(actual, expected, "{error}");
        }
    }

    #[test]
    fn missing_result_is_invalid() {
        assert!(matches!(
            classify(ok(r#"{"error":[]}"#)),
            Err(ApiError::InvalidData(_))
        ));
    }

    #[test]
    fn http_failures_are_classified_before_parsing() {
        let mut response = ok("<html>");
        response.status = 502;
        assert!(classify(response).unwrap_err().is_transient());
    }
}
