//! Exit closer: maker-first limit exits for fixed-TP lots, market exits
//! otherwise, with partial-fill accounting and exit history.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::time::{sleep, timeout, Duration};
use tracing::{info, warn};

use super::book::{ExitMode, ExitRecord};
use super::config::Config;
use super::engine::Trader;
use super::filters::{snap_down, snap_up};
use super::state::TraderState;
use super::types::{ExchangeFilters, OrderStatus, PlacedOrder, Side};

const IO_TIMEOUT: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_millis(900);

/// Close intent produced by the exit scan.
#[derive(Debug, Clone)]
pub(crate) struct CloseRequest {
    pub side: Side,
    pub lot_id: u64,
    pub requested_base: f64,
    pub exit_mode: ExitMode,
    /// Working take (fixed-TP lots place their limit exit here).
    pub take: f64,
    pub reason: String,
}

/// What the close settled at, after the maker attempt and/or market order.
#[derive(Debug, Clone)]
struct ExecReport {
    price: f64,
    base_size: f64,
    quote_spent: f64,
    commission_usd: f64,
    order_id: String,
}

impl ExecReport {
    fn from_order(o: &PlacedOrder) -> Self {
        Self {
            price: o.price,
            base_size: o.base_size,
            quote_spent: o.quote_spent,
            commission_usd: o.commission_usd,
            order_id: o.order_id.clone(),
        }
    }
}

impl Trader {
    /// Execute one close. I/O happens with the state lock released; the
    /// accounting re-acquires it and finds the lot by id.
    pub(crate) async fn close_lot(
        self: &Arc<Self>,
        req: CloseRequest,
        mark: f64,
        filters: &ExchangeFilters,
    ) -> Result<String> {
        let product = self.cfg.product_id.clone();
        let close_side = req.side.opposite();
        let quote = req.requested_base * mark;
        if quote + 1e-9 < filters.min_notional {
            return Ok(format!("EXIT-SKIP {} lot#{} below min notional", req.side.as_str(), req.lot_id));
        }

        // Maker-first exit for fixed-TP lots when limit entries are on.
        let mut exec: Option<ExecReport> = None;
        if req.exit_mode == ExitMode::ScalpFixedTp && self.cfg.maker_first_enabled() && req.take > 0.0 {
            exec = self.try_limit_exit(&req, close_side, filters).await;
        }

        let exec = match exec {
            Some(e) => e,
            None => {
                // Market close by quote, one retry never applies here: close
                // errors surface to the caller.
                let placed = timeout(IO_TIMEOUT, self.broker.place_market_quote(&product, close_side, quote))
                    .await
                    .context("market close timed out")?
                    .context("market close failed")?;
                ExecReport::from_order(&placed)
            }
        };

        let record = {
            let mut st = self.state.write().await;
            let rec = settle_close(&mut st, &self.cfg, &req, &exec, mark, Utc::now());
            self.persist_locked(&st).await;
            rec
        };

        match record {
            Some(rec) => {
                info!(
                    "💰 CLOSE {} lot#{} {:.8} @ {:.2} pnl={:+.4} ({})",
                    rec.side.as_str(),
                    rec.lot_id,
                    rec.size_base,
                    rec.close_price,
                    rec.pnl_usd,
                    rec.reason,
                );
                self.notifier
                    .notify(&format!(
                        "CLOSE {} {:.8} @ {:.2} pnl {:+.4} USD ({})",
                        rec.side.as_str(),
                        rec.size_base,
                        rec.close_price,
                        rec.pnl_usd,
                        rec.reason,
                    ))
                    .await;
                Ok(format!("CLOSE {} lot#{} pnl={:+.4} {}", rec.side.as_str(), rec.lot_id, rec.pnl_usd, rec.reason))
            }
            None => {
                warn!("close settled but lot#{} was gone", req.lot_id);
                Ok(format!("EXIT-SKIP lot#{} vanished", req.lot_id))
            }
        }
    }

    /// Post-only exit at the working take, polled until the limit timeout.
    /// Returns the execution when anything filled; None falls through to a
    /// market close (only when nothing filled at all).
    async fn try_limit_exit(
        self: &Arc<Self>,
        req: &CloseRequest,
        close_side: Side,
        filters: &ExchangeFilters,
    ) -> Option<ExecReport> {
        let product = self.cfg.product_id.clone();
        let limit = match close_side {
            Side::Sell => snap_up(req.take, filters.price_tick),
            Side::Buy => snap_down(req.take, filters.price_tick),
        };
        let base = snap_down(req.requested_base, filters.base_step);
        if base <= 0.0 || limit <= 0.0 || base * limit + 1e-9 < filters.min_notional {
            return None;
        }

        let order_id = match timeout(IO_TIMEOUT, self.broker.place_limit_post_only(&product, close_side, limit, base)).await {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                warn!("limit exit rejected, going to market: {e:#}");
                return None;
            }
            Err(_) => {
                warn!("limit exit placement timed out, going to market");
                return None;
            }
        };

        // Remember the working order id on the lot for the audit trail.
        {
            let mut st = self.state.write().await;
            let book = st.book_mut(req.side);
            if let Some(idx) = book.find_by_lot_id(req.lot_id) {
                book.lots[idx].fixed_tp_order_id = order_id.clone();
            }
        }
        info!("📤 limit exit {} {:.8} @ {:.2} id={}", close_side.as_str(), base, limit, order_id);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.cfg.limit_timeout_sec);
        while tokio::time::Instant::now() < deadline {
            sleep(POLL_INTERVAL).await;
            let o = match timeout(IO_TIMEOUT, self.broker.get_order(&product, &order_id)).await {
                Ok(Ok(o)) => o,
                _ => continue,
            };
            match o.status {
                OrderStatus::Filled => return Some(ExecReport::from_order(&o)),
                OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired => {
                    if o.base_size > 1e-12 {
                        return Some(ExecReport::from_order(&o));
                    }
                    return None;
                }
                _ => {}
            }
        }

        // Timeout: cancel and take whatever filled; zero fills fall back
        // to market.
        match timeout(IO_TIMEOUT, self.broker.cancel_order(&product, &order_id)).await {
            Ok(Ok(())) => {}
            other => warn!("limit exit cancel failed: {other:?}"),
        }
        if let Ok(Ok(o)) = timeout(IO_TIMEOUT, self.broker.get_order(&product, &order_id)).await {
            if o.base_size > 1e-12 {
                return Some(ExecReport::from_order(&o));
            }
        }
        None
    }
}

/// Apply close accounting to the state. Partial executions shrink the lot
/// (pro-rating the remaining entry fee); full executions remove it and fix
/// up runner designations and side anchors.
fn settle_close(
    st: &mut TraderState,
    cfg: &Config,
    req: &CloseRequest,
    exec: &ExecReport,
    mark: f64,
    now: DateTime<Utc>,
) -> Option<ExitRecord> {
    let book = st.book(req.side);
    let idx = book.find_by_lot_id(req.lot_id)?;
    let was_newest = idx + 1 == book.len();
    let was_runner = book.is_runner(idx);
    let lot = &book.lots[idx];

    let price_exec = if exec.price > 0.0 { exec.price } else { mark };
    let mut base_filled = if exec.base_size > 0.0 { exec.base_size } else { req.requested_base };
    base_filled = base_filled.min(lot.size_base);
    if base_filled <= 1e-12 || req.requested_base <= 1e-12 {
        return None;
    }

    let entry_portion = lot.entry_fee_usd * base_filled / req.requested_base;
    let quote_exec = if exec.quote_spent > 0.0 { exec.quote_spent } else { base_filled * price_exec };
    let exit_fee = if exec.commission_usd > 0.0 {
        exec.commission_usd
    } else {
        quote_exec * cfg.fee_rate_pct / 100.0
    };
    let gross = match req.side {
        Side::Buy => (price_exec - lot.open_price) * base_filled,
        Side::Sell => (lot.open_price - price_exec) * base_filled,
    };
    let realized = gross - entry_portion - exit_fee;

    let full = base_filled + 1e-9 >= lot.size_base;
    let record = ExitRecord {
        time: now,
        side: req.side,
        open_price: lot.open_price,
        close_price: price_exec,
        size_base: base_filled,
        entry_fee_usd: entry_portion,
        exit_fee_usd: exit_fee,
        pnl_usd: realized,
        reason: req.reason.clone(),
        exit_mode: req.exit_mode,
        was_runner,
        lot_id: req.lot_id,
        entry_order_id: lot.entry_order_id.clone(),
        exit_order_id: exec.order_id.clone(),
    };

    st.equity_usd += realized;
    st.daily_pnl += realized;

    let book = st.book_mut(req.side);
    if full {
        book.remove(idx);
    } else {
        let lot = &mut book.lots[idx];
        let frac = base_filled / lot.size_base;
        lot.size_base -= base_filled;
        lot.entry_fee_usd -= entry_portion;
        lot.open_notional_usd *= 1.0 - frac;
        lot.reset_exit_state();
        warn!(
            "partial close lot#{}: {:.8} filled, {:.8} remains",
            req.lot_id, base_filled, lot.size_base
        );
    }

    if full {
        if was_newest {
            st.reset_pyramid_anchors(req.side, now);
        }
        if was_runner {
            let stage = st.equity_stage(req.side);
            st.set_equity_stage(req.side, stage.saturating_sub(1));
        }
        if st.book(req.side).is_empty() {
            st.set_equity_stage(req.side, 0);
        }
    }

    st.exit_history.push(record.clone(), cfg.exit_history_size);
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trader::book::Lot;

    fn cfg() -> Config {
        Config::default()
    }

    fn state_with_buy_lot(size: f64, entry_fee: f64) -> TraderState {
        let c = cfg();
        let mut st = TraderState::new(&c);
        st.book_buy.push(
            Lot::new(Side::Buy, 99.97, size, entry_fee, size * 99.97, Utc::now(), 5, "signal".to_string(), "e-1".to_string()),
            false,
        );
        st
    }

    fn close_req(size: f64) -> CloseRequest {
        CloseRequest {
            side: Side::Buy,
            lot_id: 5,
            requested_base: size,
            exit_mode: ExitMode::ScalpTrailing,
            take: 0.0,
            reason: "trail_stop".to_string(),
        }
    }

    fn exec(price: f64, base: f64) -> ExecReport {
        ExecReport {
            price,
            base_size: base,
            quote_spent: price * base,
            commission_usd: 0.0,
            order_id: "x-1".to_string(),
        }
    }

    #[test]
    fn test_partial_close_scenario_b() {
        // Lot open=99.97 size=0.20 entryFee=0.01998; close 0.08 @ 101.00.
        let mut st = state_with_buy_lot(0.20, 0.01998);
        let c = cfg();
        let rec = settle_close(&mut st, &c, &close_req(0.20), &exec(101.0, 0.08), 101.0, Utc::now()).unwrap();

        let lot = &st.book_buy.lots[0];
        assert!((lot.size_base - 0.12).abs() < 1e-9);
        // EntryFee scales to 0.01998 * (0.12/0.20)
        assert!((lot.entry_fee_usd - 0.011988).abs() < 1e-9);
        assert!((rec.entry_fee_usd - 0.007992).abs() < 1e-9);
        assert!(rec.size_base > 0.0);
    }

    #[test]
    fn test_full_close_updates_equity_and_history() {
        let mut st = state_with_buy_lot(1.0, 0.10);
        let c = cfg();
        let eq0 = st.equity_usd;
        let rec = settle_close(&mut st, &c, &close_req(1.0), &exec(100.90, 1.0), 100.90, Utc::now()).unwrap();

        // gross = 0.93, exit fee = 100.90 * 0.001, entry portion = 0.10
        let expect = (100.90 - 99.97) - 0.10 - 100.90 * 0.001;
        assert!((rec.pnl_usd - expect).abs() < 1e-9);
        assert!(st.book_buy.is_empty());
        assert!((st.equity_usd - (eq0 + expect)).abs() < 1e-9);
        assert!((st.daily_pnl - expect).abs() < 1e-9);
        assert_eq!(st.exit_history.len(), 1);
        assert!((st.exit_history.total_pnl() - expect).abs() < 1e-9);
    }

    #[test]
    fn test_runner_close_decrements_stage() {
        let c = cfg();
        let mut st = TraderState::new(&c);
        for i in 0..3 {
            st.book_buy.push(
                Lot::new(Side::Buy, 100.0, 1.0, 0.1, 100.0, Utc::now(), i, String::new(), String::new()),
                false,
            );
        }
        st.book_buy.runner_ids = vec![1];
        st.equity_stage_buy = 2;

        let req = CloseRequest {
            side: Side::Buy,
            lot_id: 1,
            requested_base: 1.0,
            exit_mode: ExitMode::RunnerTrailing,
            take: 0.0,
            reason: "trail_stop".to_string(),
        };
        settle_close(&mut st, &c, &req, &exec(101.0, 1.0), 101.0, Utc::now()).unwrap();
        assert_eq!(st.equity_stage_buy, 1);
        assert!(st.book_buy.runner_ids.is_empty()); // no auto-promotion
        assert_eq!(st.book_buy.len(), 2);
    }

    #[test]
    fn test_empty_side_resets_stage() {
        let c = cfg();
        let mut st = state_with_buy_lot(1.0, 0.10);
        st.equity_stage_buy = 3;
        settle_close(&mut st, &c, &close_req(1.0), &exec(101.0, 1.0), 101.0, Utc::now()).unwrap();
        assert_eq!(st.equity_stage_buy, 0);
    }

    #[test]
    fn test_newest_close_resets_pyramid_anchors_only() {
        let c = cfg();
        let mut st = state_with_buy_lot(1.0, 0.10);
        st.win_low_buy = 98.0;
        st.latched_gate_buy = 97.5;
        st.last_add_equity_buy = 123.0;
        settle_close(&mut st, &c, &close_req(1.0), &exec(101.0, 1.0), 101.0, Utc::now()).unwrap();
        assert!(st.win_low_buy.abs() < 1e-12);
        assert!(st.latched_gate_buy.abs() < 1e-12);
        assert!(st.last_add_buy.is_some());
        // Equity baseline is NOT an anchor of the close path
        assert!((st.last_add_equity_buy - 123.0).abs() < 1e-9);
    }

    #[test]
    fn test_sell_lot_close_mirror() {
        let c = cfg();
        let mut st = TraderState::new(&c);
        st.book_sell.push(
            Lot::new(Side::Sell, 100.0, 1.0, 0.10, 100.0, Utc::now(), 9, String::new(), String::new()),
            false,
        );
        let req = CloseRequest {
            side: Side::Sell,
            lot_id: 9,
            requested_base: 1.0,
            exit_mode: ExitMode::ScalpTrailing,
            take: 0.0,
            reason: "trail_stop".to_string(),
        };
        let rec = settle_close(&mut st, &c, &req, &exec(99.0, 1.0), 99.0, Utc::now()).unwrap();
        let expect = (100.0 - 99.0) - 0.10 - 99.0 * 0.001;
        assert!((rec.pnl_usd - expect).abs() < 1e-9);
    }

    #[test]
    fn test_missing_lot_is_none() {
        let c = cfg();
        let mut st = TraderState::new(&c);
        assert!(settle_close(&mut st, &c, &close_req(1.0), &exec(101.0, 1.0), 101.0, Utc::now()).is_none());
    }

    #[test]
    fn test_zero_exec_falls_back_to_mark_and_requested() {
        let c = cfg();
        let mut st = state_with_buy_lot(1.0, 0.10);
        let e = ExecReport { price: 0.0, base_size: 0.0, quote_spent: 0.0, commission_usd: 0.0, order_id: String::new() };
        let rec = settle_close(&mut st, &c, &close_req(1.0), &e, 100.50, Utc::now()).unwrap();
        assert!((rec.close_price - 100.50).abs() < 1e-9);
        assert!((rec.size_base - 1.0).abs() < 1e-9);
    }
}
