use crate::assets::normalize_asset;
use crate::error::NormalizeError;
use crate::fields::{
    datetime, decimal, field, optional_decimal, optional_string, row_reference, string,
};
use crate::Normalized;
use core_types::{Balance, Exchange, PayloadKind, RawPayload, Transaction, TransactionType};
use rust_decimal::Decimal;
use serde_json::Value;

const EXCHANGE: Exchange = Exchange::Coinbase;

pub(crate) fn balances(payload: &RawPayload) -> Result<Normalized<Balance>, NormalizeError> {
    let accounts = field(&payload.body, "accounts", "Coinbase accounts")?
        .as_array()
        .ok_or_else(|| NormalizeError::InvalidShape("`accounts` is not an array".into()))?;
    Ok(Normalized::from_results(accounts.iter().enumerate().map(
        |(index, account)| (row_reference(account, "uuid", index), balance(account)),
    )))
}

fn balance(account: &Value) -> Result<Balance, NormalizeError> {
    let context = "Coinbase account";
    let asset = normalize_asset(EXCHANGE, &string(account, "currency", context)?);
    let free = decimal(field(account, "available_balance", context)?, "value", context)?;
    let locked = match account.get("hold") {
        Some(hold) if !hold.is_null() => optional_decimal(hold, "value")?.unwrap_or_default(),
        _ => Decimal::ZERO,
    };
    Ok(Balance::new(asset, free, locked)?)
}

pub(crate) fn transactions(
    payload: &RawPayload,
) -> Result<Normalized<Transaction>, NormalizeError> {
    if payload.kind != PayloadKind::AccountTransactions {
        return Err(NormalizeError::UnexpectedPayload {
            exchange: EXCHANGE,
            kind: payload.kind,
        });
    }
    let rows = field(&payload.body, "data", "Coinbase transactions")?
        .as_array()
        .ok_or_else(|| NormalizeError::InvalidShape("`data` is not an array".into()))?;
    Ok(Normalized::from_results(
        rows.iter()
            .enumerate()
            .map(|(index, row)| (row_reference(row, "id", index), transaction(row))),
    ))
}

/// Folds Coinbase's v2 vocabulary into the closed type set. The sign of the
/// amount decides direction where the type alone does not.
pub(crate) fn transaction_type(kind: &str, amount: Decimal) -> TransactionType {
    let incoming = amount.is_sign_positive() && !amount.is_zero();
    match kind.to_ascii_lowercase().as_str() {
        "buy" => TransactionType::Buy,
        "sell" => TransactionType::Sell,
        // Incoming on-chain transfers are also reported as `send`.
        "send" if incoming => TransactionType::Deposit,
        "send" => TransactionType::Withdrawal,
        "receive" | "fiat_deposit" | "exchange_deposit" | "pro_deposit" => {
            TransactionType::Deposit
        }
        "fiat_withdrawal" | "exchange_withdrawal" | "pro_withdrawal" | "vault_withdrawal" => {
            TransactionType::Withdrawal
        }
        "trade" | "advanced_trade_fill" if incoming => TransactionType::Buy,
        "trade" | "advanced_trade_fill" => TransactionType::Sell,
        _ => TransactionType::Other,
    }
}

fn transaction(row: &Value) -> Result<Transaction, NormalizeError> {
    let context = "Coinbase transaction";
    let money = field(row, "amount", context)?;
    let amount = decimal(money, "amount", context)?;
    let asset = normalize_asset(EXCHANGE, &string(money, "currency", context)?);
    let kind = string(row, "type", context)?;
    let fill = row.get("advanced_trade_fill").filter(|v| v.is_object());

    Ok(Transaction {
        id: format!("coinbase:transaction:{}", string(row, "id", context)?),
        exchange: EXCHANGE,
        tx_type: transaction_type(&kind, amount),
        asset,
        symbol: fill.and_then(|fill| optional_string(fill, "product_id")),
        amount: amount.abs(),
        price: price(row, amount, fill)?,
        fee: fee(row, fill)?,
        fee_asset: fee_asset(row, fill),
        timestamp: datetime(row, "created_at", context)?,
        raw: row.clone(),
    })
}

/// Fill price for advanced trades, otherwise the USD native amount per unit.
fn price(
    row: &Value,
    amount: Decimal,
    fill: Option<&Value>,
) -> Result<Option<Decimal>, NormalizeError> {
    if let Some(fill) = fill {
        if let Some(price) = optional_decimal(fill, "fill_price")? {
            return Ok(Some(price));
        }
    }
    let Some(native) = row.get("native_amount").filter(|v| v.is_object()) else {
        return Ok(None);
    };
    let in_usd = optional_string(native, "currency").is_some_and(|c| c.eq_ignore_ascii_case("USD"));
    match optional_decimal(native, "amount")? {
        // A quotient too large to represent is left unpriced.
        Some(value) if in_usd && !amount.is_zero() => {
            Ok(value.checked_div(amount).map(|price| price.abs()))
        }
        _ => Ok(None),
    }
}

fn fee(row: &Value, fill: Option<&Value>) -> Result<Option<Decimal>, NormalizeError> {
    if let Some(fill) = fill {
        return optional_decimal(fill, "commission");
    }
    match row.get("network").and_then(|n| n.get("transaction_fee")) {
        Some(fee) if fee.is_object() => optional_decimal(fee, "amount"),
        _ => Ok(None),
    }
}

fn fee_asset(row: &Value, fill: Option<&Value>) -> Option<String> {
    if let Some(fill) = fill {
        // Commission is charged in the quote currency of the product.
        return optional_string(fill, "product_id")
            .and_then(|product| product.split_once('-').map(|(_, quote)| quote.to_string()))
            .map(|quote| normalize_asset(EXCHANGE, &quote));
    }
    row.get("network")
        .and_then(|n| n.get("transaction_fee"))
        .and_then(|fee| optional_string(fee, "currency"))
        .map(|currency| normalize_asset(EXCHANGE, &currency))
}
