//! Exchange filter cache and step-snapping primitives.
//!
//! Venue filters (price tick, base/quote step, min notional) change rarely,
//! so they are fetched once per product and cached. Config overrides win
//! over venue values when set.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;

use super::broker::Broker;
use super::config::Config;
use super::types::ExchangeFilters;

/// Floor `v` to a multiple of `step`. The 1e-12 nudge absorbs binary
/// representation error so that e.g. 0.3/0.1 floors to 3, not 2.
pub fn snap_down(v: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return v;
    }
    ((v / step) + 1e-12).floor() * step
}

/// Ceil `v` to a multiple of `step`, with the symmetric rounding guard.
pub fn snap_up(v: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return v;
    }
    ((v / step) - 1e-12).ceil() * step
}

/// Snap a limit price in the passive direction: down for bids, up for asks.
pub fn snap_price(v: f64, tick: f64, side: super::types::Side) -> f64 {
    match side {
        super::types::Side::Buy => snap_down(v, tick),
        super::types::Side::Sell => snap_up(v, tick),
    }
}

// ─────────────────────────────────────────────────────────
// Cache
// ─────────────────────────────────────────────────────────

pub struct FilterCache {
    overrides: ExchangeFilters,
    inner: Mutex<HashMap<String, ExchangeFilters>>,
}

impl FilterCache {
    pub fn new(cfg: &Config) -> Self {
        Self {
            overrides: ExchangeFilters {
                price_tick: cfg.price_tick,
                base_step: cfg.base_step,
                quote_step: cfg.quote_step,
                min_notional: cfg.min_notional,
            },
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch (or return cached) filters for `product`, applying config
    /// overrides for any field configured > 0.
    pub async fn get(&self, broker: &dyn Broker, product: &str) -> Result<ExchangeFilters> {
        if let Some(f) = self.inner.lock().expect("filter cache poisoned").get(product) {
            return Ok(*f);
        }
        let venue = broker.get_exchange_filters(product).await?;
        let merged = self.merge(venue);
        self.inner
            .lock()
            .expect("filter cache poisoned")
            .insert(product.to_string(), merged);
        Ok(merged)
    }

    fn merge(&self, venue: ExchangeFilters) -> ExchangeFilters {
        let pick = |over: f64, venue: f64| if over > 0.0 { over } else { venue };
        ExchangeFilters {
            price_tick: pick(self.overrides.price_tick, venue.price_tick),
            base_step: pick(self.overrides.base_step, venue.base_step),
            quote_step: pick(self.overrides.quote_step, venue.quote_step),
            min_notional: pick(self.overrides.min_notional, venue.min_notional),
        }
    }

    /// Drop the cached entry, forcing a refetch on next use.
    pub fn invalidate(&self, product: &str) {
        self.inner.lock().expect("filter cache poisoned").remove(product);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trader::broker::PaperBroker;
    use crate::trader::types::Side;

    #[test]
    fn test_snap_down_exact_multiple() {
        // 0.3 is not representable; naive floor would lose a step
        assert!((snap_down(0.3, 0.1) - 0.3).abs() < 1e-9);
        assert!((snap_down(99.95, 0.01) - 99.95).abs() < 1e-9);
    }

    #[test]
    fn test_snap_down_truncates() {
        assert!((snap_down(0.00123, 0.0001) - 0.0012).abs() < 1e-12);
        assert!((snap_down(100.009, 0.01) - 100.00).abs() < 1e-9);
    }

    #[test]
    fn test_snap_up() {
        assert!((snap_up(100.001, 0.01) - 100.01).abs() < 1e-9);
        assert!((snap_up(100.01, 0.01) - 100.01).abs() < 1e-9);
    }

    #[test]
    fn test_snap_zero_step_is_identity() {
        assert!((snap_down(1.2345, 0.0) - 1.2345).abs() < 1e-12);
        assert!((snap_up(1.2345, 0.0) - 1.2345).abs() < 1e-12);
    }

    #[test]
    fn test_snap_price_direction() {
        assert!((snap_price(100.019, 0.01, Side::Buy) - 100.01).abs() < 1e-9);
        assert!((snap_price(100.011, 0.01, Side::Sell) - 100.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cache_applies_overrides() {
        let mut cfg = crate::trader::config::Config::default();
        cfg.price_tick = 0.05;
        cfg.base_step = 0.0;
        let cache = FilterCache::new(&cfg);
        let broker = PaperBroker::with_defaults(100.0);

        let f = cache.get(&broker, "BTC-USD").await.unwrap();
        assert!((f.price_tick - 0.05).abs() < 1e-12); // override wins
        assert!(f.base_step > 0.0); // venue value survives
    }

    #[tokio::test]
    async fn test_cache_hits_once() {
        let cfg = crate::trader::config::Config::default();
        let cache = FilterCache::new(&cfg);
        let broker = PaperBroker::with_defaults(100.0);

        let a = cache.get(&broker, "BTC-USD").await.unwrap();
        let b = cache.get(&broker, "BTC-USD").await.unwrap();
        assert!((a.price_tick - b.price_tick).abs() < 1e-12);
        assert_eq!(broker.filter_fetches(), 1);
    }
}
