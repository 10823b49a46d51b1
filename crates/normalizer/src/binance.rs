use crate::assets::normalize_asset;
use crate::error::NormalizeError;
use crate::fields::{
    datetime, decimal, field, millis, optional_decimal, optional_string, row_reference, string,
};
use crate::Normalized;
use core_types::{Balance, Exchange, PayloadKind, RawPayload, Transaction, TransactionType};
use serde_json::Value;

const EXCHANGE: Exchange = Exchange::Binance;

pub(crate) fn balances(payload: &RawPayload) -> Result<Normalized<Balance>, NormalizeError> {
    let rows = array(field(&payload.body, "balances", "Binance account")?)?;
    Ok(Normalized::from_results(rows.iter().enumerate().map(|(index, row)| {
        (row_reference(row, "asset", index), balance(row))
    })))
}

fn balance(row: &Value) -> Result<Balance, NormalizeError> {
    let context = "Binance balance";
    let asset = normalize_asset(EXCHANGE, &string(row, "asset", context)?);
    let free = decimal(row, "free", context)?;
    let locked = decimal(row, "locked", context)?;
    Ok(Balance::new(asset, free, locked)?)
}

pub(crate) fn transactions(
    payload: &RawPayload,
) -> Result<Normalized<Transaction>, NormalizeError> {
    let rows = array(&payload.body)?;
    let map: fn(&Value, &RawPayload) -> Result<Transaction, NormalizeError> = match payload.kind {
        PayloadKind::Trades => trade,
        PayloadKind::Deposits => |row, _| deposit(row),
        PayloadKind::Withdrawals => |row, _| withdrawal(row),
        kind => {
            return Err(NormalizeError::UnexpectedPayload {
                exchange: EXCHANGE,
                kind,
            });
        }
    };
    Ok(Normalized::from_results(rows.iter().enumerate().map(|(index, row)| {
        (row_reference(row, "id", index), map(row, payload))
    })))
}

fn array(value: &Value) -> Result<&Vec<Value>, NormalizeError> {
    value
        .as_array()
        .ok_or_else(|| NormalizeError::InvalidShape("expected a Binance JSON array".into()))
}

fn trade(row: &Value, payload: &RawPayload) -> Result<Transaction, NormalizeError> {
    let context = "Binance trade";
    let symbol = string(row, "symbol", context)?;
    let id = string(row, "id", context)?;

    // myTrades rows do not name the base asset; the fetch that produced them does.
    let asset = payload
        .pair
        .as_ref()
        .map(|pair| normalize_asset(EXCHANGE, &pair.base))
        .ok_or_else(|| NormalizeError::MissingField {
            field: "pair".into(),
            context: format!("{context} payload for {symbol}"),
        })?;

    let is_buyer = field(row, "isBuyer", context)?
        .as_bool()
        .ok_or_else(|| NormalizeError::InvalidShape("`isBuyer` is not a boolean".into()))?;

    Ok(Transaction {
        id: format!("binance:trade:{symbol}-{id}"),
        exchange: EXCHANGE,
        tx_type: if is_buyer {
            TransactionType::Buy
        } else {
            TransactionType::Sell
        },
        asset,
        symbol: Some(symbol),
        amount: decimal(row, "qty", context)?.abs(),
        price: Some(decimal(row, "price", context)?),
        fee: optional_decimal(row, "commission")?,
        fee_asset: optional_string(row, "commissionAsset").map(|a| normalize_asset(EXCHANGE, &a)),
        timestamp: millis(row, "time", context)?,
        raw: row.clone(),
    })
}

fn deposit(row: &Value) -> Result<Transaction, NormalizeError> {
    let context = "Binance deposit";
    let id = optional_string(row, "id")
        .or_else(|| optional_string(row, "txId"))
        .ok_or_else(|| NormalizeError::MissingField {
            field: "id".into(),
            context: context.into(),
        })?;

    Ok(Transaction {
        id: format!("binance:deposit:{id}"),
        exchange: EXCHANGE,
        tx_type: TransactionType::Deposit,
        asset: normalize_asset(EXCHANGE, &string(row, "coin", context)?),
        symbol: None,
        amount: decimal(row, "amount", context)?.abs(),
        price: None,
        fee: None,
        fee_asset: None,
        timestamp: millis(row, "insertTime", context)?,
        raw: row.clone(),
    })
}

fn withdrawal(row: &Value) -> Result<Transaction, NormalizeError> {
    let context = "Binance withdrawal";
    let asset = normalize_asset(EXCHANGE, &string(row, "coin", context)?);
    let fee = optional_decimal(row, "transactionFee")?;

    Ok(Transaction {
        id: format!("binance:withdrawal:{}", string(row, "id", context)?),
        exchange: EXCHANGE,
        tx_type: TransactionType::Withdrawal,
        fee_asset: fee.map(|_| asset.clone()),
        asset,
        symbol: None,
        amount: decimal(row, "amount", context)?.abs(),
        price: None,
        fee,
        // `applyTime` is a zone-less UTC string.
        timestamp: datetime(row, "applyTime", context)?,
        raw: row.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::TradingPair;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn account_balances() {
        let payload = RawPayload::new(
            EXCHANGE,
            PayloadKind::Balances,
            json!({
                "canTrade": true,
                "balances": [
                    {"asset": "BTC", "free": "0.50000000", "locked": "0.10000000"},
                    {"asset": "LDBTC", "free": "0.25", "locked": "0"},
                    {"asset": "LDO", "free": "10", "locked": "0"}
                ]
            }),
        );
        let balances = balances(&payload).unwrap().rows;
        assert_eq!(balances.len(), 3);
        assert_eq!(balances[1].asset, "BTC");
        assert_eq!(balances[0].total, dec!(0.6));
        assert_eq!(balances[2].asset, "LDO");
    }

    #[test]
    fn trades_map_buyer_flag() {
        let payload = RawPayload::new(
            EXCHANGE,
            PayloadKind::Trades,
            json!([
                {"symbol": "BTCUSDT", "id": 28457, "orderId": 100234, "price": "4.00000100",
                 "qty": "12.00000000", "quoteQty": "48.000012", "commission": "10.10000000",
                 "commissionAsset": "BNB", "time": 1499865549590i64, "isBuyer": true, "isMaker": false},
                {"symbol": "BTCUSDT", "id": 28458, "price": "5", "qty": "1",
                 "commission": "0", "commissionAsset": "USDT", "time": 1499865549591i64, "isBuyer": false}
            ]),
        )
        .with_pair(TradingPair::new("BTC", "USDT"));

        let txs = transactions(&payload).unwrap().rows;
        assert_eq!(txs[0].id, "binance:trade:BTCUSDT-28457");
        assert_eq!(txs[0].tx_type, TransactionType::Buy);
        assert_eq!(txs[0].asset, "BTC");
        assert_eq!(txs[0].amount, dec!(12));
        assert_eq!(txs[0].price, Some(dec!(4.000001)));
        assert_eq!(txs[0].fee_asset.as_deref(), Some("BNB"));
        assert_eq!(txs[0].timestamp.timestamp_millis(), 1_499_865_549_590);
        assert_eq!(txs[1].tx_type, TransactionType::Sell);
        assert_eq!(txs[1].raw["id"], 28458);
    }

    #[test]
    fn trades_without_pair_are_rejected() {
        let payload = RawPayload::new(
            EXCHANGE,
            PayloadKind::Trades,
            json!([{"symbol": "BTCUSDT", "id": 1, "price": "1", "qty": "1", "time": 1, "isBuyer": true}]),
        );
        let batch = transactions(&payload).unwrap();
        assert!(batch.rows.is_empty());
        assert_eq!(batch.rejected[0].reference, "1");
        assert!(matches!(
            batch.rejected[0].error,
            NormalizeError::MissingField { .. }
        ));
    }

    #[test]
    fn a_bad_trade_keeps_its_neighbours() {
        let payload = RawPayload::new(
            EXCHANGE,
            PayloadKind::Trades,
            json!([
                {"symbol": "ETHUSDT", "id": 7, "price": "2000", "qty": "1", "time": 1, "isBuyer": true},
                {"symbol": "ETHUSDT", "id": 8, "price": "n/a", "qty": "1", "time": 2, "isBuyer": true},
                {"symbol": "ETHUSDT", "id": 9, "price": "2100", "qty": "2", "time": 3, "isBuyer": false}
            ]),
        )
        .with_pair(TradingPair::new("ETH", "USDT"));
        let batch = transactions(&payload).unwrap();
        let ids: Vec<&str> = batch.rows.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["binance:trade:ETHUSDT-7", "binance:trade:ETHUSDT-9"]);
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.rejected[0].reference, "8");
    }

    #[test]
    fn non_array_history_is_a_payload_error() {
        let payload = RawPayload::new(EXCHANGE, PayloadKind::Deposits, json!({"code": -1}));
        assert!(matches!(
            transactions(&payload),
            Err(NormalizeError::InvalidShape(_))
        ));
    }

    #[test]
    fn deposits_and_withdrawals() {
        let deposits = RawPayload::new(
            EXCHANGE,
            PayloadKind::Deposits,
            json!([{"id": "769800519366885376", "amount": "0.001", "coin": "BNB", "status": 1,
                    "txId": "98A3EA56", "insertTime": 1661493146000i64}]),
        );
        let tx = &transactions(&deposits).unwrap().rows[0];
        assert_eq!(tx.id, "binance:deposit:769800519366885376");
        assert_eq!(tx.tx_type, TransactionType::Deposit);

        let withdrawals = RawPayload::new(
            EXCHANGE,
            PayloadKind::Withdrawals,
            json!([{"id": "b6ae22b3aa844210a7041aee7589627c", "amount": "8.91000000",
                    "transactionFee": "0.004", "coin": "USDT", "status": 6,
                    "applyTime": "2019-10-12 11:12:02"}]),
        );
        let tx = &transactions(&withdrawals).unwrap().rows[0];
        assert_eq!(tx.tx_type, TransactionType::Withdrawal);
        assert_eq!(tx.fee, Some(dec!(0.004)));
        assert_eq!(tx.fee_asset.as_deref(), Some("USDT"));
        assert_eq!(tx.timestamp.to_rfc3339(), "2019-10-12T11:12:02+00:00");
    }
}
