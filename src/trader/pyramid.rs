//! Side-aware pyramiding gates.
//!
//! A new lot on an already-populated side must clear two gates: minimum
//! spacing since the last add, and an adverse move from the last entry
//! whose required percent decays exponentially with elapsed time. Once the
//! decay has bottomed out, the observed window extreme is latched as a
//! frozen gate so a brief wick cannot loosen the requirement afterwards.

use chrono::{DateTime, Utc};

use super::config::Config;
use super::types::Side;

#[derive(Debug, Clone, Copy)]
pub struct GateDecision {
    pub pass: bool,
    /// Price the mark had to reach.
    pub gate: f64,
    /// Effective adverse percent after decay.
    pub eff_pct: f64,
}

/// Evaluate the pyramiding gate for one side.
///
/// `win_extreme` (window low for BUY, window high for SELL) and `latched`
/// are side anchors owned by the trader state; both are updated in place.
/// A zero value means "unset" for either anchor.
pub fn evaluate(
    cfg: &Config,
    side: Side,
    mark: f64,
    now: DateTime<Utc>,
    last_add: Option<DateTime<Utc>>,
    last_entry: f64,
    win_extreme: &mut f64,
    latched: &mut f64,
) -> GateDecision {
    let elapsed_secs = match last_add {
        Some(t) => (now - t).num_milliseconds().max(0) as f64 / 1000.0,
        None => f64::MAX,
    };

    // Gate 1: spacing
    if elapsed_secs < cfg.pyramid_min_seconds_between {
        return GateDecision { pass: false, gate: 0.0, eff_pct: cfg.pyramid_min_adverse_pct };
    }

    // Gate 2: adverse move with decay
    let base_pct = cfg.pyramid_min_adverse_pct;
    let lambda = cfg.pyramid_decay_lambda;
    let floor_pct = cfg.pyramid_decay_min_pct;
    let minutes = elapsed_secs / 60.0;

    let decay_active = lambda > 0.0 && floor_pct > 0.0 && base_pct > floor_pct;
    let eff_pct = if decay_active {
        (base_pct * (-lambda * minutes).exp()).max(floor_pct)
    } else {
        base_pct
    };

    if decay_active {
        let t_floor_min = (base_pct / floor_pct).ln() / lambda;
        if minutes >= t_floor_min {
            // Track the window extreme from the time decay bottoms out.
            *win_extreme = match side {
                Side::Buy => {
                    if *win_extreme <= 0.0 {
                        mark
                    } else {
                        win_extreme.min(mark)
                    }
                }
                Side::Sell => win_extreme.max(mark),
            };
        } else {
            *win_extreme = 0.0;
        }
        // Latch once, well past the floor, with a real extreme observed.
        if minutes >= 2.0 * t_floor_min && *win_extreme > 0.0 && *latched <= 0.0 {
            *latched = *win_extreme;
        }
    }

    let baseline = match side {
        Side::Buy => last_entry * (1.0 - eff_pct / 100.0),
        Side::Sell => last_entry * (1.0 + eff_pct / 100.0),
    };
    let mut gate = if *latched > 0.0 { *latched } else { baseline };

    // Clamp toward the most restrictive of last entry and the window extreme.
    match side {
        Side::Buy => {
            let cap = if *win_extreme > 0.0 { last_entry.min(*win_extreme) } else { last_entry };
            gate = gate.min(cap);
        }
        Side::Sell => {
            let floor = if *win_extreme > 0.0 { last_entry.max(*win_extreme) } else { last_entry };
            gate = gate.max(floor);
        }
    }

    let pass = match side {
        Side::Buy => mark <= gate + 1e-9,
        Side::Sell => mark >= gate - 1e-9,
    };
    GateDecision { pass, gate, eff_pct }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn cfg() -> Config {
        let mut c = Config::default();
        c.pyramid_min_seconds_between = 0.0;
        c.pyramid_min_adverse_pct = 1.5;
        c.pyramid_decay_lambda = 0.02;
        c.pyramid_decay_min_pct = 0.4;
        c
    }

    #[test]
    fn test_scenario_c_block_then_admit() {
        // Last BUY at 100.00, 60 minutes ago.
        let c = cfg();
        let now = Utc::now();
        let last_add = Some(now - Duration::minutes(60));
        let (mut win, mut latched) = (0.0, 0.0);

        let d = evaluate(&c, Side::Buy, 99.60, now, last_add, 100.0, &mut win, &mut latched);
        assert!((d.eff_pct - 1.5 * (-1.2f64).exp()).abs() < 1e-9);
        assert!((d.gate - 100.0 * (1.0 - d.eff_pct / 100.0)).abs() < 1e-9);
        assert!(!d.pass); // 99.60 > 99.5482

        let d = evaluate(&c, Side::Buy, 99.50, now, last_add, 100.0, &mut win, &mut latched);
        assert!(d.pass); // 99.50 <= 99.5482
    }

    #[test]
    fn test_spacing_blocks() {
        let mut c = cfg();
        c.pyramid_min_seconds_between = 300.0;
        let now = Utc::now();
        let (mut win, mut latched) = (0.0, 0.0);
        let d = evaluate(
            &c,
            Side::Buy,
            50.0, // far through any price gate
            now,
            Some(now - Duration::seconds(60)),
            100.0,
            &mut win,
            &mut latched,
        );
        assert!(!d.pass);
    }

    #[test]
    fn test_window_resets_before_floor_time() {
        let c = cfg();
        let now = Utc::now();
        let (mut win, mut latched) = (99.0, 0.0);
        // t_floor = ln(1.5/0.4)/0.02 ~ 66 min; at 30 min the window resets
        evaluate(&c, Side::Buy, 99.3, now, Some(now - Duration::minutes(30)), 100.0, &mut win, &mut latched);
        assert!(win.abs() < 1e-12);
    }

    #[test]
    fn test_latching_freezes_gate() {
        let c = cfg();
        let now = Utc::now();
        // Past 2*t_floor (~133 min): extreme latches on first evaluation
        let last_add = Some(now - Duration::minutes(140));
        let (mut win, mut latched) = (0.0, 0.0);

        evaluate(&c, Side::Buy, 99.20, now, last_add, 100.0, &mut win, &mut latched);
        assert!((latched - 99.20).abs() < 1e-9);

        // A later bounce cannot loosen the gate above the latched extreme
        let d = evaluate(&c, Side::Buy, 99.60, now, last_add, 100.0, &mut win, &mut latched);
        assert!(d.gate <= 99.20 + 1e-9);
        assert!(!d.pass);
    }

    #[test]
    fn test_sell_mirror_gate() {
        let c = cfg();
        let now = Utc::now();
        let last_add = Some(now - Duration::minutes(60));
        let (mut win, mut latched) = (0.0, 0.0);
        // eff ~ 0.4518; SELL gate = 100 * (1 + 0.004518) = 100.4518
        let d = evaluate(&c, Side::Sell, 100.40, now, last_add, 100.0, &mut win, &mut latched);
        assert!(!d.pass);
        let d = evaluate(&c, Side::Sell, 100.46, now, last_add, 100.0, &mut win, &mut latched);
        assert!(d.pass);
    }

    #[test]
    fn test_no_decay_uses_base_pct() {
        let mut c = cfg();
        c.pyramid_decay_lambda = 0.0;
        let now = Utc::now();
        let (mut win, mut latched) = (0.0, 0.0);
        let d = evaluate(&c, Side::Buy, 98.49, now, Some(now - Duration::minutes(600)), 100.0, &mut win, &mut latched);
        assert!((d.eff_pct - 1.5).abs() < 1e-12);
        assert!(d.pass); // 98.49 <= 98.5
    }

    #[test]
    fn test_first_lot_side_has_no_spacing_block() {
        let c = cfg();
        let now = Utc::now();
        let (mut win, mut latched) = (0.0, 0.0);
        // No last_add recorded: spacing treats it as infinitely old
        let d = evaluate(&c, Side::Buy, 99.0, now, None, 100.0, &mut win, &mut latched);
        assert!(d.pass);
    }
}
