//! Decision oracle seam.
//!
//! The core only needs a probability-of-up-move and a discrete signal;
//! model training and feature pipelines live elsewhere. The default
//! implementation is a plain momentum estimator so the bot runs without
//! any model artifacts.

use super::types::{Candle, Signal};

/// Oracle inputs the trader threads through from config/state.
#[derive(Debug, Clone)]
pub struct OracleContext {
    pub model_file: String,
    pub extended_model_file: String,
    pub buy_threshold: f64,
    pub sell_threshold: f64,
    pub use_ma_filter: bool,
}

/// Oracle output; the booleans are audit trail for the open reason.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub signal: Signal,
    pub p_up: f64,
    pub ma_ok_buy: bool,
    pub ma_ok_sell: bool,
}

impl Decision {
    pub fn flat() -> Self {
        Self { signal: Signal::Flat, p_up: 0.5, ma_ok_buy: false, ma_ok_sell: false }
    }
}

pub trait DecisionOracle: Send + Sync {
    fn decide(&self, candles: &[Candle], ctx: &OracleContext) -> Decision;
}

// ─────────────────────────────────────────────────────────
// Momentum default
// ─────────────────────────────────────────────────────────

const MOMENTUM_WINDOW: usize = 10;
const MA_WINDOW: usize = 20;

/// Logistic momentum over the last few candles, with an optional SMA trend
/// filter. Insufficient history decides Flat.
pub struct MomentumOracle;

impl DecisionOracle for MomentumOracle {
    fn decide(&self, candles: &[Candle], ctx: &OracleContext) -> Decision {
        if candles.len() < MA_WINDOW + 1 {
            return Decision::flat();
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let last = closes[closes.len() - 1];
        let ago = closes[closes.len() - 1 - MOMENTUM_WINDOW];
        if ago.abs() < 1e-12 || last.abs() < 1e-12 {
            return Decision::flat();
        }

        // Momentum in percent, squashed to a probability.
        let mom_pct = (last - ago) / ago * 100.0;
        let p_up = 1.0 / (1.0 + (-mom_pct * 2.0).exp());

        let sma: f64 = closes[closes.len() - MA_WINDOW..].iter().sum::<f64>() / MA_WINDOW as f64;
        let ma_ok_buy = last >= sma;
        let ma_ok_sell = last <= sma;

        let mut signal = if p_up >= ctx.buy_threshold {
            Signal::Buy
        } else if p_up <= ctx.sell_threshold {
            Signal::Sell
        } else {
            Signal::Flat
        };

        if ctx.use_ma_filter {
            signal = match signal {
                Signal::Buy if !ma_ok_buy => Signal::Flat,
                Signal::Sell if !ma_ok_sell => Signal::Flat,
                s => s,
            };
        }

        Decision { signal, p_up, ma_ok_buy, ma_ok_sell }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn ctx() -> OracleContext {
        OracleContext {
            model_file: String::new(),
            extended_model_file: String::new(),
            buy_threshold: 0.58,
            sell_threshold: 0.42,
            use_ma_filter: false,
        }
    }

    fn candles(closes: &[f64]) -> Vec<Candle> {
        let now = Utc::now();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                time: now - Duration::seconds(((closes.len() - i) as i64) * 60),
                open: c,
                high: c,
                low: c,
                close: c,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn test_insufficient_history_is_flat() {
        let d = MomentumOracle.decide(&candles(&[100.0; 5]), &ctx());
        assert_eq!(d.signal, Signal::Flat);
    }

    #[test]
    fn test_uptrend_signals_buy() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64 * 0.5).collect();
        let d = MomentumOracle.decide(&candles(&closes), &ctx());
        assert_eq!(d.signal, Signal::Buy);
        assert!(d.p_up > 0.58);
    }

    #[test]
    fn test_downtrend_signals_sell() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 - i as f64 * 0.5).collect();
        let d = MomentumOracle.decide(&candles(&closes), &ctx());
        assert_eq!(d.signal, Signal::Sell);
        assert!(d.p_up < 0.42);
    }

    #[test]
    fn test_flat_market_is_flat() {
        let d = MomentumOracle.decide(&candles(&[100.0; 30]), &ctx());
        assert_eq!(d.signal, Signal::Flat);
        assert!((d.p_up - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_ma_filter_vetoes_buy_below_sma() {
        // Plateau, crash, partial recovery: momentum points up over the
        // last ten candles, but price is still under the 20-candle SMA.
        let mut closes: Vec<f64> = vec![120.0; 15];
        closes.extend([
            90.0, 86.0, 84.0, 82.0, 80.0, 81.0, 83.0, 86.0, 89.0, 92.0, 93.0, 94.0, 94.5, 95.0, 95.5,
        ]);
        let mut c = ctx();
        let unfiltered = MomentumOracle.decide(&candles(&closes), &c);
        assert_eq!(unfiltered.signal, Signal::Buy);
        c.use_ma_filter = true;
        let filtered = MomentumOracle.decide(&candles(&closes), &c);
        assert_eq!(filtered.signal, Signal::Flat);
        assert!(!filtered.ma_ok_buy);
    }
}
