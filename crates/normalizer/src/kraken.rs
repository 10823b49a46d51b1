use crate::assets::{normalize_asset, split_kraken_pair};
use crate::error::NormalizeError;
use crate::fields::{decimal, fractional_seconds, optional_decimal, parse_decimal, string};
use crate::Normalized;
use core_types::{Balance, Exchange, PayloadKind, RawPayload, Transaction, TransactionType};
use rust_decimal::Decimal;
use serde_json::{Map, Value};

const EXCHANGE: Exchange = Exchange::Kraken;

pub(crate) fn balances(payload: &RawPayload) -> Result<Normalized<Balance>, NormalizeError> {
    let entries = object(&payload.body, "Kraken balances")?;
    Ok(Normalized::from_results(
        entries
            .iter()
            .map(|(code, entry)| (code.clone(), balance(code, entry))),
    ))
}

fn balance(code: &str, entry: &Value) -> Result<Balance, NormalizeError> {
    let asset = normalize_asset(EXCHANGE, code);
    match entry {
        // `Balance` answers with bare strings.
        Value::String(_) | Value::Number(_) => {
            Ok(Balance::new(asset, parse_decimal(entry, code)?, Decimal::ZERO)?)
        }
        // `BalanceEx` splits out what is held by open orders.
        _ => {
            let total = decimal(entry, "balance", "Kraken balance")?;
            let held = optional_decimal(entry, "hold_trade")?.unwrap_or_default();
            let free = total
                .checked_sub(held)
                .ok_or_else(|| NormalizeError::InvalidNumber {
                    field: "hold_trade".into(),
                    value: held.to_string(),
                })?;
            Ok(Balance::new(asset, free, held)?)
        }
    }
}

pub(crate) fn transactions(
    payload: &RawPayload,
) -> Result<Normalized<Transaction>, NormalizeError> {
    let (rows, map): (_, fn(&str, &Value) -> Result<Transaction, NormalizeError>) =
        match payload.kind {
            PayloadKind::Trades => (
                object(keyed(&payload.body, "trades")?, "Kraken trades")?,
                trade,
            ),
            PayloadKind::Ledger => (
                object(keyed(&payload.body, "ledger")?, "Kraken ledger")?,
                ledger_entry,
            ),
            kind => {
                return Err(NormalizeError::UnexpectedPayload {
                    exchange: EXCHANGE,
                    kind,
                });
            }
        };
    Ok(Normalized::from_results(
        rows.iter().map(|(id, row)| (id.clone(), map(id, row))),
    ))
}

fn keyed<'a>(body: &'a Value, key: &str) -> Result<&'a Value, NormalizeError> {
    body.get(key).ok_or_else(|| NormalizeError::MissingField {
        field: key.to_string(),
        context: "Kraken result".into(),
    })
}

fn object<'a>(value: &'a Value, context: &str) -> Result<&'a Map<String, Value>, NormalizeError> {
    value
        .as_object()
        .ok_or_else(|| NormalizeError::InvalidShape(format!("{context} is not an object")))
}

fn trade(id: &str, row: &Value) -> Result<Transaction, NormalizeError> {
    let context = "Kraken trade";
    let pair = string(row, "pair", context)?;
    let (asset, quote) = split_kraken_pair(&pair).unwrap_or_else(|| {
        tracing::warn!(%pair, "Unrecognised Kraken pair; keeping it as the asset.");
        (pair.clone(), String::new())
    });

    let tx_type = match string(row, "type", context)?.to_ascii_lowercase().as_str() {
        "buy" => TransactionType::Buy,
        "sell" => TransactionType::Sell,
        _ => TransactionType::Other,
    };
    let fee = optional_decimal(row, "fee")?;

    Ok(Transaction {
        id: format!("kraken:trade:{id}"),
        exchange: EXCHANGE,
        tx_type,
        asset,
        symbol: Some(pair),
        amount: decimal(row, "vol", context)?.abs(),
        price: Some(decimal(row, "price", context)?),
        // Kraken charges trade fees in the quote currency.
        fee_asset: fee.filter(|_| !quote.is_empty()).map(|_| quote.clone()),
        fee,
        timestamp: fractional_seconds(row, "time", context)?,
        raw: row.clone(),
    })
}

fn ledger_entry(id: &str, row: &Value) -> Result<Transaction, NormalizeError> {
    let context = "Kraken ledger entry";
    let amount = decimal(row, "amount", context)?;
    let asset = normalize_asset(EXCHANGE, &string(row, "asset", context)?);
    let fee = optional_decimal(row, "fee")?;

    Ok(Transaction {
        id: format!("kraken:ledger:{id}"),
        exchange: EXCHANGE,
        tx_type: ledger_type(&string(row, "type", context)?, amount),
        fee_asset: fee.map(|_| asset.clone()),
        asset,
        symbol: None,
        amount: amount.abs(),
        price: None,
        fee,
        timestamp: fractional_seconds(row, "time", context)?,
        raw: row.clone(),
    })
}

/// Folds Kraken's ledger vocabulary into the closed type set.
pub(crate) fn ledger_type(kind: &str, amount: Decimal) -> TransactionType {
    match kind.to_ascii_lowercase().as_str() {
        "deposit" => TransactionType::Deposit,
        "withdrawal" => TransactionType::Withdrawal,
        "trade" if amount.is_sign_negative() => TransactionType::Sell,
        "trade" => TransactionType::Buy,
        "spend" => TransactionType::Sell,
        "receive" => TransactionType::Buy,
        _ => TransactionType::Other,
    }
}
