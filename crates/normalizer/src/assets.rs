//! Asset symbol normalization and balance merging.
//!
//! Normalized symbols are the lookup keys for pricing and filtering, so every
//! exchange-specific marker is removed here: Binance's `LD` Simple Earn prefix,
//! Kraken's `X`/`Z` ledger prefixes and staking suffixes, and Kraken's
//! `XBT`/`XDG` aliases.

use crate::{Normalized, RejectedRow};
use core_types::{Balance, Exchange};
use std::collections::BTreeMap;

/// Kraken's four-letter legacy codes: an `X` (crypto) or `Z` (fiat) marker
/// in front of a three-letter symbol.
const KRAKEN_LEGACY_CODES: &[&str] = &[
    "XXBT", "XETH", "XETC", "XLTC", "XXRP", "XXLM", "XXMR", "XZEC", "XREP", "XMLN", "XXDG",
    "XICN", "ZUSD", "ZEUR", "ZGBP", "ZCAD", "ZJPY", "ZAUD", "ZCHF",
];

/// Suffixes Kraken appends for staked, opt-in rewards, bonded, funding and
/// parachain balances.
const KRAKEN_SUFFIXES: &[&str] = &["S", "M", "F", "B", "P", "HOLD"];

/// Quote currencies recognised when splitting Kraken pair names.
const KRAKEN_QUOTES: &[&str] = &[
    "ZUSD", "ZEUR", "ZGBP", "ZCAD", "ZJPY", "ZAUD", "ZCHF", "XXBT", "XETH", "USDT", "USDC",
    "USD", "EUR", "GBP", "CAD", "JPY", "AUD", "CHF", "XBT", "ETH", "DAI",
];

/// Maps an exchange-native asset code onto the shared symbol space.
pub fn normalize_asset(exchange: Exchange, raw: &str) -> String {
    let upper = raw.trim().to_ascii_uppercase();
    match exchange {
        Exchange::Binance => strip_binance_earn(upper),
        Exchange::Kraken => normalize_kraken(upper),
        Exchange::Coinbase => upper,
    }
}

fn strip_binance_earn(asset: String) -> String {
    // `LDBTC` is flexible-savings BTC. Every listed asset is at least three
    // letters long, so a shorter remainder means the prefix is part of the
    // symbol, as in `LDO`.
    match asset.strip_prefix("LD") {
        Some(rest) if rest.len() >= 3 => rest.to_string(),
        _ => asset,
    }
}

fn normalize_kraken(asset: String) -> String {
    let base = match asset.split_once('.') {
        Some((base, suffix)) if KRAKEN_SUFFIXES.contains(&suffix) => base.to_string(),
        _ => asset,
    };
    let base = if KRAKEN_LEGACY_CODES.contains(&base.as_str()) {
        base[1..].to_string()
    } else {
        base
    };
    match base.as_str() {
        "XBT" => "BTC".to_string(),
        "XDG" => "DOGE".to_string(),
        _ => base,
    }
}

/// Splits a Kraken pair such as `XXBTZUSD`, `SOLUSD` or `XBT/USD` into
/// normalized `(base, quote)`.
pub fn split_kraken_pair(pair: &str) -> Option<(String, String)> {
    let pair = pair.trim().to_ascii_uppercase();
    if let Some((base, quote)) = pair.split_once('/') {
        return Some((
            normalize_asset(Exchange::Kraken, base),
            normalize_asset(Exchange::Kraken, quote),
        ));
    }

    KRAKEN_QUOTES
        .iter()
        .filter_map(|quote| {
            pair.strip_suffix(quote)
                .filter(|base| !base.is_empty())
                .map(|base| (base, *quote))
        })
        .max_by_key(|(_, quote)| quote.len())
        .map(|(base, quote)| {
            (
                normalize_asset(Exchange::Kraken, base),
                normalize_asset(Exchange::Kraken, quote),
            )
        })
}

/// Merges balances of the same normalized asset and drops empty ones.
/// The result is ordered by asset. A merge that would overflow keeps the
/// first balance and rejects the later one.
pub fn merge_balances(balances: impl IntoIterator<Item = Balance>) -> Normalized<Balance> {
    let mut merged: BTreeMap<String, Balance> = BTreeMap::new();
    let mut rejected = Vec::new();
    for balance in balances {
        match merged.get_mut(&balance.asset) {
            Some(existing) => {
                if let Err(e) = existing.merge(&balance) {
                    rejected.push(RejectedRow {
                        reference: balance.asset.clone(),
                        error: e.into(),
                    });
                }
            }
            None => {
                merged.insert(balance.asset.clone(), balance);
            }
        }
    }
    Normalized {
        rows: merged.into_values().filter(|b| !b.is_zero()).collect(),
        rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[test]
    fn binance_earn_prefix() {
        assert_eq!(normalize_asset(Exchange::Binance, "LDBTC"), "BTC");
        assert_eq!(normalize_asset(Exchange::Binance, "LDUSDT"), "USDT");
        assert_eq!(normalize_asset(Exchange::Binance, "LDO"), "LDO");
        assert_eq!(normalize_asset(Exchange::Binance, "ldeth"), "ETH");
    }

    #[test]
    fn kraken_codes() {
        let cases = [
            ("XXBT", "BTC"),
            ("XBT.M", "BTC"),
            ("XBT.F", "BTC"),
            ("ZUSD", "USD"),
            ("XETH", "ETH"),
            ("ETH2.S", "ETH2"),
            ("DOT.S", "DOT"),
            ("USD.HOLD", "USD"),
            ("XXDG", "DOGE"),
            ("XDG", "DOGE"),
            ("SOL", "SOL"),
            ("XTZ", "XTZ"),
            ("USDT", "USDT"),
        ];
        for (raw, expected) in cases {
            assert_eq!(normalize_asset(Exchange::Kraken, raw), expected, "{raw}");
        }
    }

    #[test]
    fn kraken_pairs() {
        assert_eq!(
            split_kraken_pair("XXBTZUSD"),
            Some(("BTC".into(), "USD".into()))
        );
        assert_eq!(split_kraken_pair("SOLUSD"), Some(("SOL".into(), "USD".into())));
        assert_eq!(split_kraken_pair("ETHUSDT"), Some(("ETH".into(), "USDT".into())));
        assert_eq!(
            split_kraken_pair("XETHXXBT"),
            Some(("ETH".into(), "BTC".into()))
        );
        assert_eq!(split_kraken_pair("XBT/EUR"), Some(("BTC".into(), "EUR".into())));
        assert_eq!(split_kraken_pair("USD"), None);
    }

    #[test]
    fn merging_sums_and_drops_zeros() {
        let merged = merge_balances([
            Balance::new("BTC", dec!(1.5), dec!(0)).unwrap(),
            Balance::new("ETH", Decimal::ZERO, Decimal::ZERO).unwrap(),
            Balance::new("BTC", dec!(0.25), dec!(0.25)).unwrap(),
        ]);
        assert!(merged.rejected.is_empty());
        let merged = merged.rows;
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].asset, "BTC");
        assert_eq!(merged[0].free, dec!(1.75));
        assert_eq!(merged[0].locked, dec!(0.25));
        assert_eq!(merged[0].total, dec!(2.00));
    }

    #[test]
    fn overflowing_merge_keeps_the_first_balance() {
        let merged = merge_balances([
            Balance::new("BTC", Decimal::MAX, dec!(0)).unwrap(),
            Balance::new("BTC", dec!(1), dec!(0)).unwrap(),
            Balance::new("ETH", dec!(2), dec!(0)).unwrap(),
        ]);
        assert_eq!(merged.rows.len(), 2);
        assert_eq!(merged.rows[0].total, Decimal::MAX);
        assert_eq!(merged.rejected.len(), 1);
        assert_eq!(merged.rejected[0].reference, "BTC");
    }
}
