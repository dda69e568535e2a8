//! Per-side lot books.
//!
//! A Lot is one independently-tracked entry. Books are value-owned; runner
//! designation is a list of indices into the lot vector, fixed up on every
//! removal so ids never dangle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::Side;

/// How a lot will be exited once its profit gate passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitMode {
    RunnerTrailing,
    ScalpTrailing,
    ScalpFixedTp,
}

impl ExitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitMode::RunnerTrailing => "runner_trailing",
            ExitMode::ScalpTrailing => "scalp_trailing",
            ExitMode::ScalpFixedTp => "scalp_fixed_tp",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lot {
    pub open_price: f64,
    pub side: Side,
    pub size_base: f64,
    pub open_time: DateTime<Utc>,
    pub entry_fee_usd: f64,
    pub open_notional_usd: f64,
    /// Preview/working take-profit price.
    pub take: f64,
    pub trail_active: bool,
    pub trail_peak: f64,
    pub trail_stop: f64,
    pub trail_activate_gate_usd: f64,
    pub trail_distance_pct: f64,
    pub exit_mode: ExitMode,
    pub est_exit_fee_usd: f64,
    pub unrealized_pnl_usd: f64,
    pub fixed_tp_working: bool,
    pub fixed_tp_order_id: String,
    /// Audit: why this lot was opened.
    pub reason: String,
    pub lot_id: u64,
    pub entry_order_id: String,
}

impl Lot {
    pub fn new(
        side: Side,
        open_price: f64,
        size_base: f64,
        entry_fee_usd: f64,
        open_notional_usd: f64,
        open_time: DateTime<Utc>,
        lot_id: u64,
        reason: String,
        entry_order_id: String,
    ) -> Self {
        Self {
            open_price,
            side,
            size_base,
            open_time,
            entry_fee_usd,
            open_notional_usd,
            take: 0.0,
            trail_active: false,
            trail_peak: 0.0,
            trail_stop: 0.0,
            trail_activate_gate_usd: 0.0,
            trail_distance_pct: 0.0,
            exit_mode: ExitMode::ScalpTrailing,
            est_exit_fee_usd: 0.0,
            unrealized_pnl_usd: 0.0,
            fixed_tp_working: false,
            fixed_tp_order_id: String::new(),
            reason,
            lot_id,
            entry_order_id,
        }
    }

    /// Clear all exit-arming state (trailing + working fixed TP).
    pub fn reset_exit_state(&mut self) {
        self.trail_active = false;
        self.trail_peak = 0.0;
        self.trail_stop = 0.0;
        self.fixed_tp_working = false;
        self.fixed_tp_order_id.clear();
    }
}

// ─────────────────────────────────────────────────────────
// SideBook
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SideBook {
    pub lots: Vec<Lot>,
    pub runner_ids: Vec<usize>,
}

impl SideBook {
    pub fn len(&self) -> usize {
        self.lots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lots.is_empty()
    }

    pub fn is_runner(&self, index: usize) -> bool {
        self.runner_ids.contains(&index)
    }

    /// Append a lot; `runner` marks it as a runner at its new index.
    pub fn push(&mut self, lot: Lot, runner: bool) {
        self.lots.push(lot);
        if runner {
            self.runner_ids.push(self.lots.len() - 1);
        }
    }

    /// Remove the lot at `index` and fix up runner ids: ids above the hole
    /// shift down by one, an id at the hole is dropped, ids below stay.
    pub fn remove(&mut self, index: usize) -> Lot {
        let lot = self.lots.remove(index);
        self.runner_ids.retain(|&r| r != index);
        for r in self.runner_ids.iter_mut() {
            if *r > index {
                *r -= 1;
            }
        }
        lot
    }

    pub fn total_base(&self) -> f64 {
        self.lots.iter().map(|l| l.size_base).sum()
    }

    pub fn total_notional(&self) -> f64 {
        self.lots.iter().map(|l| l.open_notional_usd).sum()
    }

    /// Index of the most recently appended lot, if any.
    pub fn newest_index(&self) -> Option<usize> {
        if self.lots.is_empty() {
            None
        } else {
            Some(self.lots.len() - 1)
        }
    }

    pub fn find_by_lot_id(&self, lot_id: u64) -> Option<usize> {
        self.lots.iter().position(|l| l.lot_id == lot_id)
    }
}

// ─────────────────────────────────────────────────────────
// Exit history
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitRecord {
    pub time: DateTime<Utc>,
    pub side: Side,
    pub open_price: f64,
    pub close_price: f64,
    pub size_base: f64,
    pub entry_fee_usd: f64,
    pub exit_fee_usd: f64,
    pub pnl_usd: f64,
    pub reason: String,
    pub exit_mode: ExitMode,
    pub was_runner: bool,
    pub lot_id: u64,
    pub entry_order_id: String,
    pub exit_order_id: String,
}

/// Fixed-capacity ring of recent exits; oldest records fall off the front.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitHistory {
    records: Vec<ExitRecord>,
}

impl ExitHistory {
    pub fn push(&mut self, rec: ExitRecord, cap: usize) {
        self.records.push(rec);
        if cap > 0 && self.records.len() > cap {
            let excess = self.records.len() - cap;
            self.records.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExitRecord> {
        self.records.iter()
    }

    pub fn total_pnl(&self) -> f64 {
        self.records.iter().map(|r| r.pnl_usd).sum()
    }
}
