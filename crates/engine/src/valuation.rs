use api_client::PriceOracle;
use core_types::Balance;
use futures::future::join_all;
use rust_decimal::Decimal;

/// Prices every balance in place. Returns the assets that could not be
/// valued; those stay in the list with `value_usd = 0`.
pub async fn value_balances(oracle: &dyn PriceOracle, balances: &mut [Balance]) -> Vec<String> {
    let prices = join_all(balances.iter().map(|b| oracle.spot_price_usd(&b.asset))).await;

    let mut unpriced = Vec::new();
    for (balance, price) in balances.iter_mut().zip(prices) {
        let quoted = price.is_some();
        if !balance.apply_price(price) {
            if quoted {
                tracing::warn!(
                    asset = %balance.asset,
                    "Balance value out of range; left unpriced."
                );
            }
            unpriced.push(balance.asset.clone());
        }
    }
    unpriced
}

/// Sum of the balances' USD values, saturating at the largest decimal.
pub fn total_value(balances: &[Balance]) -> Decimal {
    balances
        .iter()
        .fold(Decimal::ZERO, |total, b| total.saturating_add(b.value_usd))
}

/// The held assets worth fanning out to, most valuable first, at most `cap`.
pub fn top_assets(balances: &[Balance], cap: usize) -> Vec<String> {
    let mut held: Vec<&Balance> = balances.iter().filter(|b| !b.is_zero()).collect();
    held.sort_by(|a, b| {
        b.value_usd
            .cmp(&a.value_usd)
            .then_with(|| b.total.cmp(&a.total))
            .then_with(|| a.asset.cmp(&b.asset))
    });
    held.into_iter().take(cap).map(|b| b.asset.clone()).collect()
}
