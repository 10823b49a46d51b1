use super::{
    ConnectorParts, ExchangeConnector, FetchItem, HistoryPlan, PermissionProbe, parse_json,
    require_flag,
};
use crate::credential::DecryptedCredential;
use crate::endpoints::{AccountId, ReadEndpoint};
use crate::error::ApiError;
use crate::responses::{
    CoinbaseAccountRef, CoinbaseAccountsPage, CoinbaseErrorBody, CoinbaseKeyPermissions,
    CoinbaseV2Page,
};
use crate::transport::RawResponse;
use async_trait::async_trait;
use core_types::{Exchange, PayloadKind, Permission, RawPayload, TransactionFilter};
use serde_json::{Value, json};
use std::collections::BTreeSet;

const ACCOUNTS_PAGE_LIMIT: &str = "250";
const TRANSACTIONS_PAGE_LIMIT: &str = "100";

pub struct CoinbaseConnector {
    parts: ConnectorParts,
}

impl CoinbaseConnector {
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
}

pub(crate) fn classify(response: RawResponse) -> Result<Value, ApiError> {
    if response.is_success() {
        return parse_json(&response.body);
    }

    let message = serde_json::from_str::<CoinbaseErrorBody>(&response.body)
        .map(|body| body.describe())
        .unwrap_or_else(|_| response.body.chars().take(200).collect());

    Err(match response.status {
        429 => ApiError::RateLimited {
            retry_after: response.retry_after,
        },
        401 => ApiError::Authentication(message),
        403 => ApiError::PermissionDenied(message),
        status => ApiError::Exchange {
            status,
            code: None,
            message,
        },
    })
}

/// Account references from a balances payload built by `fetch_balances`.
/// Entries without a currency cannot match a held asset and are left out.
fn account_refs(balances: &RawPayload) -> Result<Vec<CoinbaseAccountRef>, ApiError> {
    let accounts = match balances.body.get("accounts") {
        None => return Ok(Vec::new()),
        Some(Value::Array(accounts)) => accounts,
        Some(_) => {
            return Err(ApiError::Deserialization("`accounts` is not an array".into()));
        }
    };
    Ok(accounts
        .iter()
        .filter_map(|account| serde_json::from_value(account.clone()).ok())
        .collect())
}

#[async_trait]
impl ExchangeConnector for CoinbaseConnector {
    fn exchange(&self) -> Exchange {
        Exchange::Coinbase
    }

    async fn probe_permissions(
        &self,
        credential: &DecryptedCredential,
    ) -> Result<PermissionProbe, ApiError> {
        let body = self
            .call(credential, ReadEndpoint::CoinbaseKeyPermissions, Vec::new())
            .await?;
        let declared: CoinbaseKeyPermissions =
            serde_json::from_value(body).map_err(|e| ApiError::Deserialization(e.to_string()))?;

        let mut permissions = BTreeSet::new();
        if require_flag(declared.can_view, "can_view")? {
            permissions.insert(Permission::Read);
        }
        if require_flag(declared.can_trade, "can_trade")? {
            permissions.insert(Permission::Trade);
        }
        if require_flag(declared.can_transfer, "can_transfer")? {
            permissions.insert(Permission::Transfer);
        }
        Ok(PermissionProbe::new(Exchange::Coinbase, permissions))
    }

    async fn fetch_balances(
        &self,
        credential: &DecryptedCredential,
    ) -> Result<RawPayload, ApiError> {
        let mut accounts = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..self.parts.settings().max_pages {
            let mut params = vec![("limit".to_string(), ACCOUNTS_PAGE_LIMIT.to_string())];
            if let Some(cursor) = &cursor {
                params.push(("cursor".to_string(), cursor.clone()));
            }
            let body = self
                .call(credential, ReadEndpoint::CoinbaseAccounts, params)
                .await?;
            let page: CoinbaseAccountsPage =
                serde_json::from_value(body).map_err(|e| ApiError::Deserialization(e.to_string()))?;
            accounts.extend(page.accounts);

            match page.cursor.filter(|c| page.has_next && !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(RawPayload::new(
            Exchange::Coinbase,
            PayloadKind::Balances,
            json!({ "accounts": accounts }),
        ))
    }

    fn plan_history(
        &self,
        held_assets: &[String],
        balances: &RawPayload,
        filter: &TransactionFilter,
    ) -> Result<HistoryPlan, ApiError> {
        // One history listing per account, in the ranked order of held assets.
        let accounts = account_refs(balances)?;
        let mut plan = HistoryPlan::default();
        for asset in held_assets {
            if filter.assets.as_ref().is_some_and(|assets| !assets.contains(asset)) {
                continue;
            }
            for account in accounts
                .iter()
                .filter(|account| account.currency.eq_ignore_ascii_case(asset))
            {
                match AccountId::parse(account.uuid.as_deref().unwrap_or_default()) {
                    Ok(account_id) => plan.push(FetchItem::AccountTransactions {
                        account_id,
                        asset: asset.clone(),
                    }),
                    Err(e) => {
                        tracing::warn!(
                            %asset,
                            error = %e,
                            "Skipping a Coinbase account with an unusable id."
                        );
                        plan.skip(format!("{asset} account history"), e);
                    }
                }
            }
        }
        Ok(plan)
    }

    async fn fetch_history(
        &self,
        credential: &DecryptedCredential,
        item: &FetchItem,
    ) -> Result<RawPayload, ApiError> {
        let FetchItem::AccountTransactions { account_id, asset } = item else {
            return Err(ApiError::InvalidData(format!("Coinbase cannot fetch {item}")));
        };

        let mut rows = Vec::new();
        let mut starting_after: Option<String> = None;
        for _ in 0..self.parts.settings().max_pages {
            let mut params = vec![
                ("limit".to_string(), TRANSACTIONS_PAGE_LIMIT.to_string()),
                ("order".to_string(), "desc".to_string()),
            ];
            if let Some(after) = &starting_after {
                params.push(("starting_after".to_string(), after.clone()));
            }
            let endpoint = ReadEndpoint::CoinbaseAccountTransactions {
                account_id: account_id.clone(),
            };
            let body = self.call(credential, endpoint, params).await?;
            let page: CoinbaseV2Page =
                serde_json::from_value(body).map_err(|e| ApiError::Deserialization(e.to_string()))?;
            rows.extend(page.data);

            match page.pagination.and_then(|p| p.next_starting_after) {
                Some(next) if !next.is_empty() => starting_after = Some(next),
                _ => break,
            }
        }

        Ok(RawPayload::new(
            Exchange::Coinbase,
            PayloadKind::AccountTransactions,
            json!({ "asset": asset, "data": rows }),
        ))
    }
}
