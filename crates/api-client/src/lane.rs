//! Per-credential lanes: the rate budget, the nonce source and the
//! serialization lock for one `(exchange, credential)` pair.
//!
//! Lanes live in a [`LaneArena`] so that unrelated credentials never contend
//! on a shared lock.

use crate::error::ApiError;
use configuration::RateLimitSettings;
use core_types::Exchange;
use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Strictly increasing millisecond nonces, safe under concurrent callers.
#[derive(Debug, Default)]
pub struct NonceSource {
    last: AtomicU64,
}

impl NonceSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `max(now_ms, previous + 1)`.
    pub fn next(&self) -> u64 {
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let candidate = now_ms().max(last + 1);
            match self.last.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// The shared state behind every call made with one credential.
pub struct CredentialLane {
    exchange: Exchange,
    limiter: DefaultDirectRateLimiter,
    burst: NonZeroU32,
    max_wait: Duration,
    nonce: NonceSource,
    serial: Option<Mutex<()>>,
}

impl CredentialLane {
    pub fn new(exchange: Exchange, settings: &RateLimitSettings) -> Self {
        let burst = NonZeroU32::new(settings.burst).unwrap_or(NonZeroU32::MIN);
        let period = settings.replenish_interval().max(Duration::from_millis(1));
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);

        Self {
            exchange,
            limiter: RateLimiter::direct(quota),
            burst,
            max_wait: settings.max_wait(),
            nonce: NonceSource::new(),
            // Nonce-based protocols reject a nonce that arrives after a larger one.
            serial: exchange.requires_nonce().then(|| Mutex::new(())),
        }
    }

    pub fn exchange(&self) -> Exchange {
        self.exchange
    }

    /// Waits for `weight` units of budget, bounded by the lane's `max_wait`.
    ///
    /// Weights above the bucket capacity are clamped so a single call can
    /// always eventually proceed.
    pub async fn acquire(&self, weight: u32) -> Result<(), ApiError> {
        let weight = NonZeroU32::new(weight.min(self.burst.get())).unwrap_or(NonZeroU32::MIN);
        match tokio::time::timeout(self.max_wait, self.limiter.until_n_ready(weight)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ApiError::BudgetExhausted(self.max_wait)),
            Err(_) => {
                tracing::warn!(
                    exchange = %self.exchange,
                    weight = weight.get(),
                    "Rate budget wait exceeded."
                );
                Err(ApiError::BudgetExhausted(self.max_wait))
            }
        }
    }

    /// Holds the lane exclusively for protocols that need ordered nonces.
    /// Returns `None` for lanes that allow concurrent calls.
    pub async fn serialize(&self) -> Option<MutexGuard<'_, ()>> {
        match &self.serial {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }

    pub fn next_nonce(&self) -> u64 {
        self.nonce.next()
    }
}

/// All live lanes, keyed by `(exchange, credential id)`.
#[derive(Default)]
pub struct LaneArena {
    lanes: DashMap<(Exchange, Uuid), Arc<CredentialLane>>,
}

impl LaneArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the credential's lane, creating it on first use.
    pub fn lane_for(
        &self,
        exchange: Exchange,
        credential_id: Uuid,
        settings: &RateLimitSettings,
    ) -> Arc<CredentialLane> {
        self.lanes
            .entry((exchange, credential_id))
            .or_insert_with(|| Arc::new(CredentialLane::new(exchange, settings)))
            .clone()
    }

    /// Drops the lane of a disconnected credential.
    pub fn remove(&self, exchange: Exchange, credential_id: Uuid) {
        self.lanes.remove(&(exchange, credential_id));
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn settings(burst: u32, interval_ms: u64, max_wait_ms: u64) -> RateLimitSettings {
        RateLimitSettings {
            burst,
            replenish_interval_ms: interval_ms,
            max_wait_ms,
        }
    }

    #[test]
    fn nonces_strictly_increase() {
        let source = NonceSource::new();
        let mut previous = source.next();
        for _ in 0..10_000 {
            let next = source.next();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn nonces_are_unique_across_threads() {
        let source = Arc::new(NonceSource::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let source = source.clone();
                std::thread::spawn(move || (0..1_000).map(|_| source.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for nonce in handle.join().unwrap() {
                assert!(seen.insert(nonce), "nonce {nonce} issued twice");
            }
        }
        assert_eq!(seen.len(), 8_000);
    }

    #[tokio::test]
    async fn burst_is_served_immediately_then_bounded_wait_fails() {
        let lane = CredentialLane::new(Exchange::Binance, &settings(3, 60_000, 50));
        for _ in 0..3 {
            lane.acquire(1).await.unwrap();
        }
        assert!(matches!(
            lane.acquire(1).await,
            Err(ApiError::BudgetExhausted(_))
        ));
    }

    #[tokio::test]
    async fn oversized_weight_is_clamped_to_capacity() {
        let lane = CredentialLane::new(Exchange::Binance, &settings(5, 60_000, 50));
        lane.acquire(20).await.unwrap();
    }

    #[tokio::test]
    async fn only_nonce_protocols_serialize() {
        let kraken = CredentialLane::new(Exchange::Kraken, &settings(5, 1_000, 1_000));
        let binance = CredentialLane::new(Exchange::Binance, &settings(5, 1_000, 1_000));
        assert!(kraken.serialize().await.is_some());
        assert!(binance.serialize().await.is_none());
    }

    #[test]
    fn arena_shares_lanes_per_credential() {
        let arena = LaneArena::new();
        let id = Uuid::new_v4();
        let limits = settings(5, 100, 100);

        let a = arena.lane_for(Exchange::Kraken, id, &limits);
        let b = arena.lane_for(Exchange::Kraken, id, &limits);
        assert!(Arc::ptr_eq(&a, &b));

        let other = arena.lane_for(Exchange::Kraken, Uuid::new_v4(), &limits);
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(arena.len(), 2);

        arena.remove(Exchange::Kraken, id);
        assert_eq!(arena.len(), 1);
    }
}
