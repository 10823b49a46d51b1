//! # Response Normalizer
//!
//! Pure functions from exchange-specific payloads to the unified
//! [`Balance`] and [`Transaction`] model.
//!
//! - All exchange numbers are parsed as decimals, never floats.
//! - Every transaction type is folded into the closed [`TransactionType`]
//!   set; anything unrecognised becomes `Other` instead of being dropped.
//! - Asset symbols are normalized (see [`normalize_asset`]) and balances of
//!   the same asset are merged; empty balances are dropped.
//! - Transaction ids are `{exchange}:{kind}:{native id}` and amounts are
//!   absolute; direction lives in the type.
//! - Rows are mapped one at a time. A malformed row lands in
//!   [`Normalized::rejected`] and the rest of the payload is still returned;
//!   only a payload whose overall shape is wrong is an error.
//!
//! [`TransactionType`]: core_types::TransactionType

use core_types::{Balance, Exchange, PayloadKind, RawPayload, Transaction};
use std::fmt;

mod assets;
mod binance;
mod coinbase;
pub mod error;
mod fields;
mod kraken;

pub use assets::{merge_balances, normalize_asset, split_kraken_pair};
pub use error::NormalizeError;

/// A row the mapper could not turn into the unified model.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRow {
    /// Native id of the row, or `#<position>` when it has none.
    pub reference: String,
    pub error: NormalizeError,
}

impl fmt::Display for RejectedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {}: {}", self.reference, self.error)
    }
}

/// The rows of one payload that normalized, and the ones that did not.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized<T> {
    pub rows: Vec<T>,
    pub rejected: Vec<RejectedRow>,
}

impl<T> Default for Normalized<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

impl<T> Normalized<T> {
    /// Sorts per-row results into kept rows and rejections.
    pub(crate) fn from_results(
        results: impl IntoIterator<Item = (String, Result<T, NormalizeError>)>,
    ) -> Self {
        let mut batch = Self::default();
        for (reference, result) in results {
            match result {
                Ok(row) => batch.rows.push(row),
                Err(error) => batch.rejected.push(RejectedRow { reference, error }),
            }
        }
        batch
    }
}

/// Normalizes an account-level balance payload.
pub fn normalize_balances(payload: &RawPayload) -> Result<Normalized<Balance>, NormalizeError> {
    if payload.kind != PayloadKind::Balances {
        return Err(NormalizeError::UnexpectedPayload {
            exchange: payload.exchange,
            kind: payload.kind,
        });
    }
    let Normalized { rows, mut rejected } = match payload.exchange {
        Exchange::Binance => binance::balances(payload)?,
        Exchange::Kraken => kraken::balances(payload)?,
        Exchange::Coinbase => coinbase::balances(payload)?,
    };
    let mut merged = merge_balances(rows);
    rejected.append(&mut merged.rejected);
    merged.rejected = rejected;
    log_rejections(payload, &merged.rejected);
    Ok(merged)
}

/// Normalizes one history payload (trades, deposits, withdrawals, ledger or
/// account transactions).
pub fn normalize_transactions(
    payload: &RawPayload,
) -> Result<Normalized<Transaction>, NormalizeError> {
    let batch = match payload.exchange {
        Exchange::Binance => binance::transactions(payload)?,
        Exchange::Kraken => kraken::transactions(payload)?,
        Exchange::Coinbase => coinbase::transactions(payload)?,
    };
    tracing::trace!(
        exchange = %payload.exchange,
        kind = ?payload.kind,
        count = batch.rows.len(),
        rejected = batch.rejected.len(),
        "Normalized transactions."
    );
    log_rejections(payload, &batch.rejected);
    Ok(batch)
}

fn log_rejections(payload: &RawPayload, rejected: &[RejectedRow]) {
    for row in rejected {
        tracing::warn!(
            exchange = %payload.exchange,
            kind = ?payload.kind,
            row = %row.reference,
            error = %row.error,
            "Skipping a row that could not be normalized."
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::TransactionType;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn balances_are_merged_across_earn_and_spot() {
        let payload = RawPayload::new(
            Exchange::Binance,
            PayloadKind::Balances,
            json!({"balances": [
                {"asset": "BTC", "free": "1", "locked": "0"},
                {"asset": "LDBTC", "free": "0.5", "locked": "0"},
                {"asset": "ETH", "free": "0", "locked": "0"}
            ]}),
        );
        let balances = normalize_balances(&payload).unwrap().rows;
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].total, dec!(1.5));
        assert_eq!(balances[0].value_usd, dec!(0));
    }

    #[test]
    fn history_payloads_are_not_balances() {
        let payload = RawPayload::new(Exchange::Kraken, PayloadKind::Ledger, json!({}));
        assert!(matches!(
            normalize_balances(&payload),
            Err(NormalizeError::UnexpectedPayload { .. })
        ));
        let payload = RawPayload::new(Exchange::Coinbase, PayloadKind::Trades, json!({}));
        assert!(normalize_transactions(&payload).is_err());
    }

    #[test]
    fn unknown_types_never_fail() {
        let payloads = [
            RawPayload::new(
                Exchange::Kraken,
                PayloadKind::Ledger,
                json!({"ledger": {"L1": {"time": 1.5, "type": "brand_new_type",
                                         "asset": "XXBT", "amount": "0.1"}}}),
            ),
            RawPayload::new(
                Exchange::Coinbase,
                PayloadKind::AccountTransactions,
                json!({"data": [{"id": "x", "type": "brand_new_type",
                                 "amount": {"amount": "1", "currency": "BTC"},
                                 "created_at": "2024-01-01T00:00:00Z"}]}),
            ),
        ];
        for payload in payloads {
            let txs = normalize_transactions(&payload).unwrap().rows;
            assert_eq!(txs.len(), 1);
            assert_eq!(txs[0].tx_type, TransactionType::Other);
        }
    }

    #[test]
    fn ids_are_prefixed_by_exchange() {
        let payload = RawPayload::new(
            Exchange::Binance,
            PayloadKind::Deposits,
            json!([{"id": "1", "amount": "1", "coin": "BTC", "insertTime": 1}]),
        );
        let txs = normalize_transactions(&payload).unwrap().rows;
        assert!(txs[0].id.starts_with("binance:"));
    }

    #[test]
    fn a_malformed_row_does_not_cost_the_others() {
        let payload = RawPayload::new(
            Exchange::Coinbase,
            PayloadKind::AccountTransactions,
            json!({"asset": "BTC", "data": [
                {"id": "good", "type": "buy",
                 "amount": {"amount": "0.5", "currency": "BTC"},
                 "created_at": "2024-01-01T00:00:00Z"},
                {"id": "bad", "type": "buy",
                 "amount": {"amount": "0.1", "currency": "BTC"}}
            ]}),
        );
        let batch = normalize_transactions(&payload).unwrap();
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rows[0].id, "coinbase:transaction:good");
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.rejected[0].reference, "bad");
        assert!(matches!(
            &batch.rejected[0].error,
            NormalizeError::MissingField { field, .. } if field == "created_at"
        ));
    }

    #[test]
    fn rows_without_an_id_are_referenced_by_position() {
        let payload = RawPayload::new(
            Exchange::Binance,
            PayloadKind::Deposits,
            json!([
                {"amount": "1", "coin": "BTC", "insertTime": 1},
                {"id": "2", "amount": "1", "coin": "BTC", "insertTime": 2}
            ]),
        );
        let batch = normalize_transactions(&payload).unwrap();
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rejected[0].reference, "#0");
    }

    #[test]
    fn oversized_balance_rows_are_rejected_alone() {
        let payload = RawPayload::new(
            Exchange::Binance,
            PayloadKind::Balances,
            json!({"balances": [
                {"asset": "BTC", "free": "1", "locked": "0"},
                {"asset": "HUGE", "free": "79228162514264337593543950335",
                 "locked": "79228162514264337593543950335"}
            ]}),
        );
        let batch = normalize_balances(&payload).unwrap();
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rows[0].asset, "BTC");
        assert_eq!(batch.rejected[0].reference, "HUGE");
        assert!(matches!(batch.rejected[0].error, NormalizeError::Core(_)));
    }
}
