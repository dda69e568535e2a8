//! Fee-aware PnL arithmetic, exit-mode classification and the trailing
//! stop state machine.
//!
//! All gates act on NET USD PnL: gross minus entry fee minus the estimated
//! exit fee at the current mark.

use chrono::{DateTime, Utc};

use super::book::{ExitMode, Lot, SideBook};
use super::config::Config;
use super::types::Side;

/// Scalp lots below this book index trail; at or above they use a fixed TP.
const SCALP_TRAIL_MAX_INDEX: usize = 3;
/// Fixed-TP lots at index 4..=5 need 4x the profit gate; deeper lots 1x.
const FIXED_TP_STRICT_MAX_INDEX: usize = 5;
const FIXED_TP_STRICT_MULTIPLE: f64 = 4.0;

/// Classify a lot by runner membership and position in its side book.
pub fn classify(book: &SideBook, index: usize) -> ExitMode {
    if book.is_runner(index) {
        ExitMode::RunnerTrailing
    } else if index <= SCALP_TRAIL_MAX_INDEX {
        ExitMode::ScalpTrailing
    } else {
        ExitMode::ScalpFixedTp
    }
}

/// Unrealized PnL at `mark`: (gross, estimated exit fee, net).
pub fn unrealized(side: Side, open: f64, size: f64, entry_fee: f64, mark: f64, fee_rate_pct: f64) -> (f64, f64, f64) {
    let est_exit_fee = size * mark * fee_rate_pct / 100.0;
    let gross = match side {
        Side::Buy => (mark - open) * size,
        Side::Sell => (open - mark) * size,
    };
    (gross, est_exit_fee, gross - entry_fee - est_exit_fee)
}

/// Mark price at which the lot nets `target_usd` after both fees.
///
/// BUY:  P* = (open + (G + F)/size) / (1 - r)
/// SELL: P* = (open - (G + F)/size) / (1 + r)
pub fn activation_price(side: Side, open: f64, size: f64, entry_fee: f64, fee_rate_pct: f64, target_usd: f64) -> f64 {
    if size <= 1e-12 {
        return open;
    }
    let r = fee_rate_pct / 100.0;
    let per_base = (target_usd + entry_fee) / size;
    match side {
        Side::Buy => (open + per_base) / (1.0 - r).max(1e-9),
        Side::Sell => (open - per_base) / (1.0 + r),
    }
}

/// Net USD the profit gate demands before any exit arming for this lot.
/// Trailing modes use the flat gate; fixed-TP scalps escalate by depth and
/// optionally decay with lot age.
pub fn required_gate_usd(cfg: &Config, mode: ExitMode, index: usize, open_time: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    match mode {
        ExitMode::RunnerTrailing | ExitMode::ScalpTrailing => cfg.profit_gate_usd,
        ExitMode::ScalpFixedTp => {
            let multiple = if index <= FIXED_TP_STRICT_MAX_INDEX {
                FIXED_TP_STRICT_MULTIPLE
            } else {
                1.0
            };
            cfg.profit_gate_usd * multiple * tp_decay_ratio(cfg, open_time, now)
        }
    }
}

/// Age-based decay of the fixed-TP gate, floored at
/// `scalp_tp_min_pct / scalp_tp_dec_pct`. Returns 1.0 when disabled.
fn tp_decay_ratio(cfg: &Config, open_time: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    if !cfg.scalp_tp_decay_enable || cfg.scalp_tp_dec_pct <= 0.0 {
        return 1.0;
    }
    let hours = (now - open_time).num_seconds().max(0) as f64 / 3600.0;
    let floor = (cfg.scalp_tp_min_pct / cfg.scalp_tp_dec_pct).clamp(0.0, 1.0);
    let ratio = if cfg.scalp_tp_dec_mode == "exp" {
        cfg.scalp_tp_decay_factor.max(0.0).powf(hours)
    } else {
        1.0 - cfg.scalp_tp_dec_pct / 100.0 * hours
    };
    ratio.max(floor)
}

/// Trailing parameters for a mode: (activation USD, distance pct).
pub fn trail_params(cfg: &Config, mode: ExitMode) -> (f64, f64) {
    match mode {
        ExitMode::RunnerTrailing => (cfg.trail_activate_usd_runner, cfg.trail_distance_pct_runner),
        _ => (cfg.trail_activate_usd_scalp, cfg.trail_distance_pct_scalp),
    }
}

/// Preview take shown on the lot before any exit arms: the fee-aware
/// activation price of whichever gate applies.
pub fn preview_take(cfg: &Config, lot: &Lot, mode: ExitMode, index: usize, now: DateTime<Utc>) -> f64 {
    let target = match mode {
        ExitMode::RunnerTrailing => cfg.trail_activate_usd_runner,
        ExitMode::ScalpTrailing => cfg.trail_activate_usd_scalp,
        ExitMode::ScalpFixedTp => required_gate_usd(cfg, mode, index, lot.open_time, now),
    };
    activation_price(lot.side, lot.open_price, lot.size_base, lot.entry_fee_usd, cfg.fee_rate_pct, target)
}

/// One trailing-engine tick for a lot whose profit gate has passed.
/// Arms on the first tick where net >= activation; thereafter ratchets the
/// stop in the favorable direction only. Returns true when the stop is hit.
pub fn update_trailing(lot: &mut Lot, mark: f64, activate_usd: f64, distance_pct: f64) -> bool {
    let d = distance_pct / 100.0;
    if !lot.trail_active {
        if lot.unrealized_pnl_usd >= activate_usd {
            lot.trail_active = true;
            lot.trail_peak = mark;
            lot.trail_activate_gate_usd = activate_usd;
            lot.trail_distance_pct = distance_pct;
            lot.trail_stop = match lot.side {
                Side::Buy => mark * (1.0 - d),
                Side::Sell => mark * (1.0 + d),
            };
        }
        return false;
    }
    match lot.side {
        Side::Buy => {
            if mark > lot.trail_peak {
                lot.trail_peak = mark;
                lot.trail_stop = lot.trail_stop.max(lot.trail_peak * (1.0 - d));
            }
            mark <= lot.trail_stop
        }
        Side::Sell => {
            if mark < lot.trail_peak {
                lot.trail_peak = mark;
                lot.trail_stop = lot.trail_stop.min(lot.trail_peak * (1.0 + d));
            }
            mark >= lot.trail_stop
        }
    }
}

/// Fixed-TP working state: freeze the take one maker-offset beyond the
/// mark the first time the gate passes; a later touch closes the lot.
/// Returns true on touch.
pub fn update_fixed_tp(lot: &mut Lot, mark: f64, tp_maker_offset_bps: f64) -> bool {
    let off = tp_maker_offset_bps / 10_000.0;
    if !lot.fixed_tp_working {
        lot.fixed_tp_working = true;
        lot.take = match lot.side {
            Side::Buy => mark * (1.0 + off),
            Side::Sell => mark * (1.0 - off),
        };
        return false;
    }
    match lot.side {
        Side::Buy => mark >= lot.take,
        Side::Sell => mark <= lot.take,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn buy_lot() -> Lot {
        Lot::new(
            Side::Buy,
            100.0,
            1.0,
            0.10,
            100.0,
            Utc::now(),
            1,
            "test".to_string(),
            String::new(),
        )
    }

    #[test]
    fn test_unrealized_scenario_a() {
        // feeRate=0.10%, open=100.00, size=1.0, entryFee=0.10, mark=100.80
        let (gross, est_exit, net) = unrealized(Side::Buy, 100.0, 1.0, 0.10, 100.80, 0.10);
        assert!((gross - 0.80).abs() < 1e-9);
        assert!((est_exit - 0.1008).abs() < 1e-9);
        assert!((net - 0.5992).abs() < 1e-9);
    }

    #[test]
    fn test_trailing_scenario_a() {
        let cfg = Config::default();
        let mut lot = buy_lot();

        // Arm at 100.80
        let (_, _, net) = unrealized(Side::Buy, 100.0, 1.0, 0.10, 100.80, cfg.fee_rate_pct);
        lot.unrealized_pnl_usd = net;
        assert!(!update_trailing(&mut lot, 100.80, 0.50, 0.25));
        assert!(lot.trail_active);
        assert!((lot.trail_peak - 100.80).abs() < 1e-9);
        assert!((lot.trail_stop - 100.548).abs() < 1e-9);

        // Rise: peak and stop ratchet
        assert!(!update_trailing(&mut lot, 101.20, 0.50, 0.25));
        assert!((lot.trail_peak - 101.20).abs() < 1e-9);
        assert!((lot.trail_stop - 100.947).abs() < 1e-9);

        // Drop through the stop: trigger
        assert!(update_trailing(&mut lot, 100.90, 0.50, 0.25));
    }

    #[test]
    fn test_trailing_stop_never_loosens() {
        let mut lot = buy_lot();
        lot.unrealized_pnl_usd = 10.0;
        update_trailing(&mut lot, 110.0, 0.50, 1.0);
        let armed_stop = lot.trail_stop;
        // Price chops below peak but above stop; stop must not move down
        update_trailing(&mut lot, 109.5, 0.50, 1.0);
        assert!(lot.trail_stop >= armed_stop - 1e-12);
    }

    #[test]
    fn test_sell_trailing_mirror() {
        let mut lot = buy_lot();
        lot.side = Side::Sell;
        lot.open_price = 100.0;
        lot.unrealized_pnl_usd = 1.0;

        assert!(!update_trailing(&mut lot, 99.0, 0.50, 1.0));
        assert!(lot.trail_active);
        assert!((lot.trail_stop - 99.0 * 1.01).abs() < 1e-9);

        // Lower trough ratchets the stop down
        assert!(!update_trailing(&mut lot, 98.0, 0.50, 1.0));
        assert!((lot.trail_stop - 98.0 * 1.01).abs() < 1e-9);

        // Bounce through the stop: trigger
        assert!(update_trailing(&mut lot, 99.1, 0.50, 1.0));
    }

    #[test]
    fn test_activation_price_identity() {
        // B x ((1-r)P* - open) - F = G within 1e-6
        for (side, open, size, fee, rate, target) in [
            (Side::Buy, 100.0, 1.0, 0.10, 0.10, 0.50),
            (Side::Buy, 25_000.0, 0.004, 0.05, 0.25, 2.0),
            (Side::Sell, 100.0, 1.0, 0.10, 0.10, 0.50),
            (Side::Sell, 1.25, 800.0, 0.20, 0.40, 1.0),
        ] {
            let p = activation_price(side, open, size, fee, rate, target);
            let r = rate / 100.0;
            let net = match side {
                Side::Buy => size * ((1.0 - r) * p - open) - fee,
                Side::Sell => size * (open - (1.0 + r) * p) - fee,
            };
            assert!((net - target).abs() < 1e-6, "{side:?} net={net} target={target}");
        }
    }

    #[test]
    fn test_classification_by_index() {
        let mut book = SideBook::default();
        for i in 0..8 {
            book.push(
                Lot::new(Side::Buy, 100.0, 1.0, 0.0, 100.0, Utc::now(), i, String::new(), String::new()),
                false,
            );
        }
        book.runner_ids = vec![6];

        assert_eq!(classify(&book, 0), ExitMode::ScalpTrailing);
        assert_eq!(classify(&book, 3), ExitMode::ScalpTrailing);
        assert_eq!(classify(&book, 4), ExitMode::ScalpFixedTp);
        assert_eq!(classify(&book, 6), ExitMode::RunnerTrailing);
        assert_eq!(classify(&book, 7), ExitMode::ScalpFixedTp);
    }

    #[test]
    fn test_fixed_tp_gate_multiples() {
        let cfg = Config::default();
        let now = Utc::now();
        let g4 = required_gate_usd(&cfg, ExitMode::ScalpFixedTp, 4, now, now);
        let g6 = required_gate_usd(&cfg, ExitMode::ScalpFixedTp, 6, now, now);
        assert!((g4 - 4.0 * cfg.profit_gate_usd).abs() < 1e-9);
        assert!((g6 - cfg.profit_gate_usd).abs() < 1e-9);
    }

    #[test]
    fn test_tp_decay_linear_floor() {
        let mut cfg = Config::default();
        cfg.scalp_tp_decay_enable = true;
        cfg.scalp_tp_dec_mode = "linear".to_string();
        cfg.scalp_tp_dec_pct = 2.0;
        cfg.scalp_tp_min_pct = 0.5;

        let open = Utc::now();
        // Fresh lot: full gate
        let fresh = required_gate_usd(&cfg, ExitMode::ScalpFixedTp, 6, open, open);
        assert!((fresh - cfg.profit_gate_usd).abs() < 1e-9);
        // Very old lot: floored at min/dec ratio = 0.25
        let old = required_gate_usd(&cfg, ExitMode::ScalpFixedTp, 6, open, open + Duration::days(30));
        assert!((old - cfg.profit_gate_usd * 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_fixed_tp_freeze_then_touch() {
        let mut lot = buy_lot();
        // First pass freezes take above mark
        assert!(!update_fixed_tp(&mut lot, 101.0, 5.0));
        assert!(lot.fixed_tp_working);
        assert!((lot.take - 101.0 * 1.0005).abs() < 1e-9);
        // Below take: no touch
        assert!(!update_fixed_tp(&mut lot, 101.02, 5.0));
        // Touch
        assert!(update_fixed_tp(&mut lot, 101.06, 5.0));
    }

    #[test]
    fn test_preview_take_is_activation_price() {
        let cfg = Config::default();
        let lot = buy_lot();
        let now = Utc::now();
        let take = preview_take(&cfg, &lot, ExitMode::ScalpTrailing, 0, now);
        let expect = activation_price(Side::Buy, 100.0, 1.0, 0.10, cfg.fee_rate_pct, cfg.trail_activate_usd_scalp);
        assert!((take - expect).abs() < 1e-9);
    }
}
