//! Order sizing: risk-percent with optional volatility adjustment and
//! per-side ramping, inventory reservation against concurrent lots and
//! pending opens, and the equity-trigger staged ladder.

use tracing::debug;

use super::config::Config;
use super::filters::snap_down;
use super::state::TraderState;
use super::types::{Candle, ExchangeFilters, Side};

/// Tolerance for inventory availability comparisons.
pub const INV_EPS: f64 = 1e-9;

/// Equity-trigger sizing ladder, fractions of the available candidate.
pub const EQUITY_STAGES: [f64; 4] = [0.25, 0.50, 0.75, 1.00];

/// Risk percent for the next add on a side holding `side_lot_count` lots.
/// Ramping replaces the flat per-trade percent when enabled.
pub fn risk_pct(cfg: &Config, side_lot_count: usize) -> f64 {
    if !cfg.ramp_enable {
        return cfg.risk_per_trade_pct;
    }
    let n = side_lot_count as f64;
    let pct = if cfg.ramp_mode == "exp" {
        cfg.ramp_start_pct * cfg.ramp_growth.max(0.0).powf(n)
    } else {
        cfg.ramp_start_pct + cfg.ramp_step_pct * n
    };
    pct.min(cfg.ramp_max_pct).max(0.0)
}

/// Optional volatility scaling: shrink size when recent candle-to-candle
/// volatility runs hot, grow it modestly when quiet. Clamped to [0.5, 1.5].
pub fn vol_factor(cfg: &Config, candles: &[Candle]) -> f64 {
    if !cfg.vol_adjust_enable || candles.len() < 21 {
        return 1.0;
    }
    let closes: Vec<f64> = candles.iter().rev().take(21).map(|c| c.close).collect();
    let rets: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[1].abs() > 1e-12)
        .map(|w| (w[0] - w[1]) / w[1])
        .collect();
    if rets.len() < 2 {
        return 1.0;
    }
    let mean = rets.iter().sum::<f64>() / rets.len() as f64;
    let var = rets.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / (rets.len() - 1) as f64;
    let stdev = var.sqrt();
    if stdev < 1e-9 {
        return 1.0;
    }
    const TARGET_VOL: f64 = 0.005;
    (TARGET_VOL / stdev).clamp(0.5, 1.5)
}

/// Base reserved against a SELL open: base held by BUY lots (they need it
/// to close) plus any base already committed by a pending SELL.
pub fn reserved_base(st: &TraderState) -> f64 {
    let pending_sell = st.pending_sell.as_ref().map(|p| p.base_at_limit).unwrap_or(0.0);
    st.book_buy.total_base() + pending_sell
}

/// Quote reserved against a BUY open: the buy-back cost of SELL lots with
/// a fee cushion, plus any quote committed by a pending BUY.
pub fn reserved_quote(st: &TraderState, fee_rate_pct: f64) -> f64 {
    let fee_mult = 1.0 + fee_rate_pct / 100.0;
    let pending_buy = st.pending_buy.as_ref().map(|p| p.quote).unwrap_or(0.0);
    st.book_sell.total_notional() * fee_mult + pending_buy
}

/// Base risk-sized quote for a normal (non-equity-trigger) open.
pub fn risk_quote(cfg: &Config, equity: f64, side_lot_count: usize, candles: &[Candle]) -> f64 {
    let pct = risk_pct(cfg, side_lot_count) * vol_factor(cfg, candles);
    let quote = pct / 100.0 * equity;
    quote.max(cfg.min_order_usd())
}

#[derive(Debug, Clone, Copy)]
pub struct StagedSize {
    /// BUY: quote USD. SELL: base units.
    pub size: f64,
    /// Stage index to store after a successful open.
    pub next_stage: usize,
}

/// Walk the equity-trigger ladder from `start_stage`, returning the first
/// stage whose snapped size clears min-notional, or None when the ladder
/// is exhausted (trigger disabled for this tick).
pub fn staged_equity_size(
    side: Side,
    candidate: f64,
    start_stage: usize,
    filters: &ExchangeFilters,
    price: f64,
) -> Option<StagedSize> {
    if candidate <= INV_EPS {
        return None;
    }
    for (idx, frac) in EQUITY_STAGES.iter().enumerate().skip(start_stage.min(EQUITY_STAGES.len() - 1)) {
        let target = candidate * frac;
        let (snapped, notional) = match side {
            Side::Sell => {
                let s = snap_down(target, filters.base_step);
                (s, s * price)
            }
            Side::Buy => {
                let s = snap_down(target, filters.quote_step);
                (s, s)
            }
        };
        if snapped <= INV_EPS {
            continue;
        }
        if notional + INV_EPS < filters.min_notional {
            debug!(
                "equity stage {idx} too small: {:.8} ({:.2} USD) < min {:.2}",
                snapped, notional, filters.min_notional
            );
            continue;
        }
        let next_stage = (idx + 1).min(EQUITY_STAGES.len() - 1);
        return Some(StagedSize { size: snapped, next_stage });
    }
    None
}
