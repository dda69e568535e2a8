//! Broker capability set consumed by the core, plus an in-memory paper
//! venue used for dry-run mode and tests.
//!
//! Real venue adapters (HTTP/REST) live outside the core and implement
//! the same trait.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use super::types::{BalanceInfo, Candle, ExchangeFilters, Fill, OrderStatus, PlacedOrder, Side};

#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &str;

    async fn get_now_price(&self, product: &str) -> Result<f64>;
    /// Best bid / best ask.
    async fn get_bbo(&self, product: &str) -> Result<(f64, f64)>;
    async fn get_recent_candles(&self, product: &str, granularity_secs: u64, limit: usize) -> Result<Vec<Candle>>;
    async fn get_available_base(&self, product: &str) -> Result<BalanceInfo>;
    async fn get_available_quote(&self, product: &str) -> Result<BalanceInfo>;
    async fn get_exchange_filters(&self, product: &str) -> Result<ExchangeFilters>;

    /// Market order sized in quote USD; returns the venue fill report.
    async fn place_market_quote(&self, product: &str, side: Side, quote_usd: f64) -> Result<PlacedOrder>;
    /// Post-only limit; rejects instead of crossing. Returns the order id.
    async fn place_limit_post_only(&self, product: &str, side: Side, limit_price: f64, base_size: f64) -> Result<String>;
    async fn get_order(&self, product: &str, order_id: &str) -> Result<PlacedOrder>;
    async fn cancel_order(&self, product: &str, order_id: &str) -> Result<()>;
}

/// Insufficient-funds classification is substring-based because venue
/// adapters surface heterogeneous error bodies.
pub fn is_insufficient_funds(err: &anyhow::Error) -> bool {
    let msg = format!("{err:#}").to_ascii_lowercase();
    msg.contains("insufficient") || msg.contains("balance")
}

// ─────────────────────────────────────────────────────────
// Paper venue
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PaperOrder {
    side: Side,
    limit_price: f64,
    base_size: f64,
    status: OrderStatus,
    fills: Vec<Fill>,
}

impl PaperOrder {
    fn filled_base(&self) -> f64 {
        self.fills.iter().map(|f| f.base_size).sum()
    }

    fn quote_filled(&self) -> f64 {
        self.fills.iter().map(|f| f.base_size * f.price).sum()
    }

    fn fee_total(&self) -> f64 {
        self.fills.iter().map(|f| f.fee_usd).sum()
    }

    fn vwap(&self) -> f64 {
        let base = self.filled_base();
        if base > 1e-12 {
            self.quote_filled() / base
        } else {
            0.0
        }
    }
}

struct PaperInner {
    price: f64,
    spread: f64,
    base_available: f64,
    quote_available: f64,
    filters: ExchangeFilters,
    orders: HashMap<String, PaperOrder>,
    candles: Vec<Candle>,
    filter_fetches: u64,
}

/// In-memory venue: market orders fill instantly at the current price;
/// post-only limits rest until a test (or the dry-run walk) fills them.
pub struct PaperBroker {
    fee_rate_pct: f64,
    inner: Mutex<PaperInner>,
}

impl PaperBroker {
    pub fn new(price: f64, base_available: f64, quote_available: f64, fee_rate_pct: f64) -> Self {
        Self {
            fee_rate_pct,
            inner: Mutex::new(PaperInner {
                price,
                spread: price * 0.0002,
                base_available,
                quote_available,
                filters: ExchangeFilters {
                    price_tick: 0.01,
                    base_step: 0.0001,
                    quote_step: 0.01,
                    min_notional: 5.0,
                },
                orders: HashMap::new(),
                candles: Vec::new(),
                filter_fetches: 0,
            }),
        }
    }

    pub fn with_defaults(price: f64) -> Self {
        Self::new(price, 1.0, 10_000.0, 0.10)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PaperInner> {
        self.inner.lock().expect("paper broker poisoned")
    }

    fn alloc_id(&self) -> String {
        format!("paper-{}", Uuid::new_v4())
    }

    // ── test / dry-run hooks ──

    pub fn set_price(&self, price: f64) {
        let mut g = self.lock();
        g.price = price;
        g.spread = price * 0.0002;
    }

    pub fn set_spread(&self, spread: f64) {
        self.lock().spread = spread;
    }

    pub fn set_balances(&self, base: f64, quote: f64) {
        let mut g = self.lock();
        g.base_available = base;
        g.quote_available = quote;
    }

    pub fn set_filters(&self, filters: ExchangeFilters) {
        self.lock().filters = filters;
    }

    pub fn set_candles(&self, candles: Vec<Candle>) {
        self.lock().candles = candles;
    }

    pub fn filter_fetches(&self) -> u64 {
        self.lock().filter_fetches
    }

    pub fn open_order_count(&self) -> usize {
        self.lock()
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .count()
    }

    /// Fill a resting order (fully or partially) at its limit price,
    /// moving balances like a real venue would.
    pub fn fill_order(&self, order_id: &str, base: f64) {
        let fee_rate = self.fee_rate_pct;
        let mut g = self.lock();
        let side = match g.orders.get_mut(order_id) {
            Some(o) => {
                let price = o.limit_price;
                let fee = base * price * fee_rate / 100.0;
                o.fills.push(Fill { price, base_size: base, fee_usd: fee });
                o.status = if o.filled_base() + 1e-12 >= o.base_size {
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                };
                Some((o.side, price))
            }
            None => None,
        };
        if let Some((side, price)) = side {
            match side {
                Side::Buy => {
                    g.quote_available -= base * price;
                    g.base_available += base;
                }
                Side::Sell => {
                    g.base_available -= base;
                    g.quote_available += base * price;
                }
            }
        }
    }

    /// Force a status, e.g. to simulate venue-side cancels or expiry.
    pub fn set_order_status(&self, order_id: &str, status: OrderStatus) {
        if let Some(o) = self.lock().orders.get_mut(order_id) {
            o.status = status;
        }
    }

    /// Seed a synthetic candle tail ending at the current price.
    pub fn seed_candles(&self, n: usize, granularity_secs: u64) {
        let (price, _) = {
            let g = self.lock();
            (g.price, g.spread)
        };
        let now = Utc::now();
        let candles = (0..n)
            .map(|i| {
                let t = now - Duration::seconds(((n - 1 - i) as i64) * granularity_secs as i64);
                Candle { time: t, open: price, high: price, low: price, close: price, volume: 1.0 }
            })
            .collect();
        self.lock().candles = candles;
    }

    fn snapshot_order(o: &PaperOrder, id: &str) -> PlacedOrder {
        PlacedOrder {
            order_id: id.to_string(),
            price: o.vwap(),
            base_size: o.filled_base(),
            quote_spent: o.quote_filled(),
            commission_usd: o.fee_total(),
            status: o.status,
            fills: o.fills.clone(),
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    fn name(&self) -> &str {
        "paper"
    }

    async fn get_now_price(&self, _product: &str) -> Result<f64> {
        Ok(self.lock().price)
    }

    async fn get_bbo(&self, _product: &str) -> Result<(f64, f64)> {
        let g = self.lock();
        let half = g.spread / 2.0;
        Ok((g.price - half, g.price + half))
    }

    async fn get_recent_candles(&self, _product: &str, _granularity_secs: u64, limit: usize) -> Result<Vec<Candle>> {
        let g = self.lock();
        let n = g.candles.len();
        Ok(g.candles[n.saturating_sub(limit)..].to_vec())
    }

    async fn get_available_base(&self, product: &str) -> Result<BalanceInfo> {
        let g = self.lock();
        Ok(BalanceInfo {
            asset: product.split('-').next().unwrap_or("BASE").to_string(),
            available: g.base_available,
            step: g.filters.base_step,
        })
    }

    async fn get_available_quote(&self, product: &str) -> Result<BalanceInfo> {
        let g = self.lock();
        Ok(BalanceInfo {
            asset: product.split('-').nth(1).unwrap_or("USD").to_string(),
            available: g.quote_available,
            step: g.filters.quote_step,
        })
    }

    async fn get_exchange_filters(&self, _product: &str) -> Result<ExchangeFilters> {
        let mut g = self.lock();
        g.filter_fetches += 1;
        Ok(g.filters)
    }

    async fn place_market_quote(&self, _product: &str, side: Side, quote_usd: f64) -> Result<PlacedOrder> {
        let fee_rate = self.fee_rate_pct;
        let mut g = self.lock();
        if quote_usd <= 0.0 {
            bail!("degenerate market order: quote {quote_usd}");
        }
        let price = g.price;
        let base = quote_usd / price;
        match side {
            Side::Buy => {
                if quote_usd > g.quote_available + 1e-9 {
                    bail!("insufficient quote balance: need {quote_usd:.2}, have {:.2}", g.quote_available);
                }
                g.quote_available -= quote_usd;
                g.base_available += base;
            }
            Side::Sell => {
                if base > g.base_available + 1e-9 {
                    bail!("insufficient base balance: need {base:.8}, have {:.8}", g.base_available);
                }
                g.base_available -= base;
                g.quote_available += quote_usd;
            }
        }
        let fee = quote_usd * fee_rate / 100.0;
        let id = format!("paper-mkt-{}", Uuid::new_v4());
        debug!("paper market {side:?} {quote_usd:.2} USD @ {price:.2}");
        Ok(PlacedOrder {
            order_id: id,
            price,
            base_size: base,
            quote_spent: quote_usd,
            commission_usd: fee,
            status: OrderStatus::Filled,
            fills: vec![Fill { price, base_size: base, fee_usd: fee }],
        })
    }

    async fn place_limit_post_only(&self, _product: &str, side: Side, limit_price: f64, base_size: f64) -> Result<String> {
        let mut g = self.lock();
        if limit_price <= 0.0 || base_size <= 0.0 {
            bail!("degenerate limit order: px={limit_price} base={base_size}");
        }
        let half = g.spread / 2.0;
        let (bid, ask) = (g.price - half, g.price + half);
        // Post-only: an order that would cross is rejected by the venue.
        let crosses = match side {
            Side::Buy => limit_price >= ask,
            Side::Sell => limit_price <= bid,
        };
        if crosses {
            bail!("post-only would cross: {side:?} limit {limit_price} vs bbo ({bid}, {ask})");
        }
        let id = self.alloc_id();
        g.orders.insert(
            id.clone(),
            PaperOrder {
                side,
                limit_price,
                base_size,
                status: OrderStatus::New,
                fills: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn get_order(&self, _product: &str, order_id: &str) -> Result<PlacedOrder> {
        let g = self.lock();
        let o = g.orders.get(order_id).ok_or_else(|| anyhow!("unknown order {order_id}"))?;
        Ok(Self::snapshot_order(o, order_id))
    }

    async fn cancel_order(&self, _product: &str, order_id: &str) -> Result<()> {
        let mut g = self.lock();
        let o = g.orders.get_mut(order_id).ok_or_else(|| anyhow!("unknown order {order_id}"))?;
        if !o.status.is_terminal() {
            o.status = OrderStatus::Canceled;
        }
        Ok(())
    }
}
