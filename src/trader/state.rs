//! Durable trader state: the persisted snapshot, crash-safe writes, and
//! the serialized apply channel pollers use to mutate state without
//! re-entering locks held by the decision tick.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use super::book::{ExitHistory, SideBook};
use super::config::Config;
use super::types::Side;

/// Displaced order ids kept per pending open after reprices.
pub const PENDING_HISTORY_CAP: usize = 5;

// ─────────────────────────────────────────────────────────
// PendingOpen
// ─────────────────────────────────────────────────────────

/// An in-flight post-only entry order. At most one per side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOpen {
    pub side: Side,
    pub limit_px: f64,
    pub base_at_limit: f64,
    pub quote: f64,
    /// Carried take preview for the lot this will become.
    pub take: f64,
    pub reason: String,
    pub product_id: String,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub equity_buy: bool,
    pub equity_sell: bool,
    pub order_id: String,
    /// Prior order ids displaced by reprices, newest last.
    pub history: Vec<String>,
    /// Session fill totals across all orders of this pending.
    pub accum_base: f64,
    pub accum_quote: f64,
    pub accum_fee_usd: f64,
    pub reprice_count: u32,
}

impl PendingOpen {
    /// Record a reprice: the displaced id goes to history (capped) and the
    /// new order becomes current.
    pub fn record_reprice(&mut self, new_order_id: String, new_limit: f64, new_base: f64) {
        let old = std::mem::replace(&mut self.order_id, new_order_id);
        self.history.push(old);
        if self.history.len() > PENDING_HISTORY_CAP {
            let excess = self.history.len() - PENDING_HISTORY_CAP;
            self.history.drain(..excess);
        }
        self.limit_px = new_limit;
        self.base_at_limit = new_base;
        self.reprice_count += 1;
    }

    /// Whether `order_id` is the current order or a displaced one.
    pub fn owns_order(&self, order_id: &str) -> bool {
        self.order_id == order_id || self.history.iter().any(|h| h == order_id)
    }
}

// ─────────────────────────────────────────────────────────
// TraderState
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderState {
    pub equity_usd: f64,
    pub daily_start: f64,
    pub daily_pnl: f64,
    /// Date (UTC, YYYY-MM-DD) the daily counters belong to.
    pub daily_date: String,

    pub model_file: String,
    pub extended_model_file: String,
    pub last_fit: Option<DateTime<Utc>>,

    pub book_buy: SideBook,
    pub book_sell: SideBook,

    pub last_add_buy: Option<DateTime<Utc>>,
    pub last_add_sell: Option<DateTime<Utc>>,
    pub win_low_buy: f64,
    pub win_high_sell: f64,
    pub latched_gate_buy: f64,
    pub latched_gate_sell: f64,

    pub last_add_equity_buy: f64,
    pub last_add_equity_sell: f64,
    pub equity_stage_buy: usize,
    pub equity_stage_sell: usize,

    pub exit_history: ExitHistory,

    pub pending_buy: Option<PendingOpen>,
    pub pending_sell: Option<PendingOpen>,
    pub pending_recheck_buy: bool,
    pub pending_recheck_sell: bool,

    pub next_lot_seq: u64,
}

impl TraderState {
    pub fn new(cfg: &Config) -> Self {
        Self {
            equity_usd: cfg.usd_equity,
            daily_start: cfg.usd_equity,
            daily_pnl: 0.0,
            daily_date: String::new(),
            model_file: cfg.model_file.clone(),
            extended_model_file: cfg.extended_model_file.clone(),
            last_fit: None,
            book_buy: SideBook::default(),
            book_sell: SideBook::default(),
            last_add_buy: None,
            last_add_sell: None,
            win_low_buy: 0.0,
            win_high_sell: 0.0,
            latched_gate_buy: 0.0,
            latched_gate_sell: 0.0,
            last_add_equity_buy: cfg.usd_equity,
            last_add_equity_sell: cfg.usd_equity,
            equity_stage_buy: 0,
            equity_stage_sell: 0,
            exit_history: ExitHistory::default(),
            pending_buy: None,
            pending_sell: None,
            pending_recheck_buy: false,
            pending_recheck_sell: false,
            next_lot_seq: 1,
        }
    }

    pub fn book(&self, side: Side) -> &SideBook {
        match side {
            Side::Buy => &self.book_buy,
            Side::Sell => &self.book_sell,
        }
    }

    pub fn book_mut(&mut self, side: Side) -> &mut SideBook {
        match side {
            Side::Buy => &mut self.book_buy,
            Side::Sell => &mut self.book_sell,
        }
    }

    pub fn pending(&self, side: Side) -> Option<&PendingOpen> {
        match side {
            Side::Buy => self.pending_buy.as_ref(),
            Side::Sell => self.pending_sell.as_ref(),
        }
    }

    pub fn pending_mut(&mut self, side: Side) -> &mut Option<PendingOpen> {
        match side {
            Side::Buy => &mut self.pending_buy,
            Side::Sell => &mut self.pending_sell,
        }
    }

    pub fn recheck(&self, side: Side) -> bool {
        match side {
            Side::Buy => self.pending_recheck_buy,
            Side::Sell => self.pending_recheck_sell,
        }
    }

    pub fn set_recheck(&mut self, side: Side, v: bool) {
        match side {
            Side::Buy => self.pending_recheck_buy = v,
            Side::Sell => self.pending_recheck_sell = v,
        }
    }

    pub fn total_lots(&self) -> usize {
        self.book_buy.len() + self.book_sell.len()
    }

    /// Reset the side's pyramiding anchors and equity baseline after an add
    /// (or after closing the newest lot on the side).
    pub fn reset_side_anchors(&mut self, side: Side, now: DateTime<Utc>) {
        match side {
            Side::Buy => {
                self.last_add_buy = Some(now);
                self.win_low_buy = 0.0;
                self.latched_gate_buy = 0.0;
                self.last_add_equity_buy = self.equity_usd;
            }
            Side::Sell => {
                self.last_add_sell = Some(now);
                self.win_high_sell = 0.0;
                self.latched_gate_sell = 0.0;
                self.last_add_equity_sell = self.equity_usd;
            }
        }
    }

    /// Reset only the pyramiding anchors (close path): spacing clock,
    /// window extreme and latched gate. Equity baselines are untouched.
    pub fn reset_pyramid_anchors(&mut self, side: Side, now: DateTime<Utc>) {
        match side {
            Side::Buy => {
                self.last_add_buy = Some(now);
                self.win_low_buy = 0.0;
                self.latched_gate_buy = 0.0;
            }
            Side::Sell => {
                self.last_add_sell = Some(now);
                self.win_high_sell = 0.0;
                self.latched_gate_sell = 0.0;
            }
        }
    }

    pub fn equity_stage(&self, side: Side) -> usize {
        match side {
            Side::Buy => self.equity_stage_buy,
            Side::Sell => self.equity_stage_sell,
        }
    }

    pub fn set_equity_stage(&mut self, side: Side, stage: usize) {
        match side {
            Side::Buy => self.equity_stage_buy = stage,
            Side::Sell => self.equity_stage_sell = stage,
        }
    }

    /// Daily rollover keyed on the UTC date of `now`.
    pub fn roll_daily(&mut self, now: DateTime<Utc>) {
        let date = now.format("%Y-%m-%d").to_string();
        if self.daily_date != date {
            self.daily_date = date;
            self.daily_start = self.equity_usd;
            self.daily_pnl = 0.0;
        }
    }
}

// ─────────────────────────────────────────────────────────
// Persistence
// ─────────────────────────────────────────────────────────

/// Write the snapshot durably: serialize, write a sibling temp file, then
/// atomically rename over the target. A crash leaves either the previous
/// or the new snapshot on disk, never a truncated one.
pub async fn save_state(path: &str, st: &TraderState) -> Result<()> {
    let data = serde_json::to_vec_pretty(st).context("serialize state")?;
    let tmp = format!("{path}.tmp");
    tokio::fs::write(&tmp, &data)
        .await
        .with_context(|| format!("write {tmp}"))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("rename {tmp} -> {path}"))?;
    Ok(())
}

/// Read the snapshot if one exists.
pub fn load_state(path: &str) -> Result<Option<TraderState>> {
    match std::fs::read(path) {
        Ok(data) => {
            let st = serde_json::from_slice(&data).with_context(|| format!("parse {path}"))?;
            Ok(Some(st))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("read {path}")),
    }
}

/// Startup check: with persistence enabled outside dry-run, the state
/// directory must exist (created if missing) and be writable, else we
/// refuse to trade rather than run without durability.
pub fn ensure_state_path(cfg: &Config) -> Result<()> {
    if !cfg.persist_state || cfg.dry_run {
        return Ok(());
    }
    let dir = Path::new(&cfg.state_file)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).with_context(|| format!("create state dir {}", dir.display()))?;
    let probe = dir.join(".tidebot-write-probe");
    std::fs::write(&probe, b"probe").with_context(|| format!("state dir {} not writable", dir.display()))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Apply channel
// ─────────────────────────────────────────────────────────

pub type ApplyFn = Box<dyn FnOnce(&mut TraderState) + Send>;

/// One serialized state mutation, optionally followed by a persist.
pub struct ApplyMsg {
    pub mutate: ApplyFn,
    pub persist: bool,
}

/// Spawn the applier task. Pollers send closures; each runs under the
/// write lock in arrival order, so background mutations never interleave
/// with a decision tick mid-flight.
pub fn spawn_applier(
    state: Arc<RwLock<TraderState>>,
    cfg: Config,
) -> mpsc::UnboundedSender<ApplyMsg> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ApplyMsg>();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let snapshot = {
                let mut st = state.write().await;
                (msg.mutate)(&mut st);
                if msg.persist && cfg.persist_state {
                    Some(st.clone())
                } else {
                    None
                }
            };
            if let Some(snap) = snapshot {
                if let Err(e) = save_state(&cfg.state_file, &snap).await {
                    warn!("⚠️ state persist failed: {e:#}");
                }
            }
        }
        info!("state applier shutting down (channel closed)");
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn state() -> TraderState {
        TraderState::new(&Config::default())
    }

    #[test]
    fn test_daily_rollover() {
        let mut st = state();
        st.equity_usd = 1234.0;
        st.daily_pnl = -5.0;

        let d1 = Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 0).unwrap();
        st.roll_daily(d1);
        assert_eq!(st.daily_date, "2024-03-01");
        assert!((st.daily_start - 1234.0).abs() < 1e-9);
        assert!(st.daily_pnl.abs() < 1e-12);

        // Same day: no reset
        st.daily_pnl = -7.0;
        st.roll_daily(Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 30).unwrap());
        assert!((st.daily_pnl + 7.0).abs() < 1e-12);

        // New day: reset
        st.roll_daily(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 30).unwrap());
        assert!(st.daily_pnl.abs() < 1e-12);
    }

    #[test]
    fn test_pending_history_cap() {
        let now = Utc::now();
        let mut p = PendingOpen {
            side: Side::Buy,
            limit_px: 99.95,
            base_at_limit: 0.2,
            quote: 20.0,
            take: 0.0,
            reason: "test".to_string(),
            product_id: "BTC-USD".to_string(),
            created_at: now,
            deadline: now,
            equity_buy: false,
            equity_sell: false,
            order_id: "ord-0".to_string(),
            history: Vec::new(),
            accum_base: 0.0,
            accum_quote: 0.0,
            accum_fee_usd: 0.0,
            reprice_count: 0,
        };

        for i in 1..=8 {
            p.record_reprice(format!("ord-{i}"), 99.95, 0.2);
        }
        assert_eq!(p.history.len(), PENDING_HISTORY_CAP);
        // Only the most recent displaced ids survive
        assert_eq!(p.history.first().unwrap(), "ord-3");
        assert_eq!(p.history.last().unwrap(), "ord-7");
        assert_eq!(p.reprice_count, 8);
        assert!(p.owns_order("ord-8"));
        assert!(p.owns_order("ord-5"));
        assert!(!p.owns_order("ord-0"));
    }

    #[test]
    fn test_reset_side_anchors() {
        let mut st = state();
        st.equity_usd = 900.0;
        st.win_low_buy = 99.0;
        st.latched_gate_buy = 98.5;
        let now = Utc::now();
        st.reset_side_anchors(Side::Buy, now);
        assert_eq!(st.last_add_buy, Some(now));
        assert!(st.win_low_buy.abs() < 1e-12);
        assert!(st.latched_gate_buy.abs() < 1e-12);
        assert!((st.last_add_equity_buy - 900.0).abs() < 1e-9);
        // Sell anchors untouched
        assert!((st.last_add_equity_sell - 1000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json").to_string_lossy().to_string();

        let mut st = state();
        st.equity_usd = 777.5;
        st.next_lot_seq = 42;
        save_state(&path, &st).await.unwrap();

        let loaded = load_state(&path).unwrap().unwrap();
        assert!((loaded.equity_usd - 777.5).abs() < 1e-9);
        assert_eq!(loaded.next_lot_seq, 42);

        // No stray temp file remains
        assert!(!std::path::Path::new(&format!("{path}.tmp")).exists());
    }

    #[test]
    fn test_load_missing_is_none() {
        assert!(load_state("/nonexistent/dir/state.json").is_err() || load_state("definitely-missing.json").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json").to_string_lossy().to_string();

        let mut st = state();
        st.equity_usd = 1.0;
        save_state(&path, &st).await.unwrap();
        st.equity_usd = 2.0;
        save_state(&path, &st).await.unwrap();

        let loaded = load_state(&path).unwrap().unwrap();
        assert!((loaded.equity_usd - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_applier_serializes_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.state_file = dir.path().join("s.json").to_string_lossy().to_string();
        cfg.persist_state = true;

        let state = Arc::new(RwLock::new(TraderState::new(&cfg)));
        let tx = spawn_applier(state.clone(), cfg.clone());

        for _ in 0..10 {
            tx.send(ApplyMsg {
                mutate: Box::new(|st| st.next_lot_seq += 1),
                persist: false,
            })
            .unwrap();
        }
        tx.send(ApplyMsg {
            mutate: Box::new(|st| st.equity_usd = 555.0),
            persist: true,
        })
        .unwrap();

        // Wait for the persisted snapshot to land.
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if let Ok(Some(s)) = load_state(&cfg.state_file) {
                if (s.equity_usd - 555.0).abs() < 1e-9 {
                    assert_eq!(s.next_lot_seq, 11);
                    return;
                }
            }
        }
        panic!("applier never persisted");
    }

    #[test]
    fn test_ensure_state_path_dry_run_skips() {
        let mut cfg = Config::default();
        cfg.dry_run = true;
        cfg.state_file = "/definitely/not/writable/state.json".to_string();
        assert!(ensure_state_path(&cfg).is_ok());
    }

    #[test]
    fn test_ensure_state_path_live_fails_on_bad_dir() {
        let mut cfg = Config::default();
        cfg.dry_run = false;
        cfg.persist_state = true;
        cfg.state_file = "/proc/no-such-dir/state.json".to_string();
        assert!(ensure_state_path(&cfg).is_err());
    }
}
