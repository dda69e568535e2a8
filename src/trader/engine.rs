//! The Trader and its decision tick.
//!
//! One `step()` call is the whole decision cadence: roll the daily window,
//! drain maker-entry completions, scan exits (at most one close), then
//! evaluate a single new open. The write lock is released around every
//! broker call; background pollers mutate state only through the apply
//! channel.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use super::book::{ExitMode, Lot};
use super::broker::{is_insufficient_funds, Broker};
use super::closer::CloseRequest;
use super::config::Config;
use super::filters::{snap_down, FilterCache};
use super::notify::Notifier;
use super::opener::{LatestSlot, OpenCompletion, PollerSlots};
use super::oracle::{DecisionOracle, OracleContext};
use super::pnl;
use super::pyramid;
use super::sizing::{self, INV_EPS};
use super::state::{
    ensure_state_path, load_state, spawn_applier, ApplyMsg, PendingOpen, TraderState,
};
use super::types::{Candle, ExchangeFilters, OrderStatus, PlacedOrder, Side, Signal};

const IO_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Trader {
    pub(crate) cfg: Config,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) oracle: Arc<dyn DecisionOracle>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) filters: FilterCache,
    pub(crate) state: Arc<RwLock<TraderState>>,
    pub(crate) apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    completion_buy: LatestSlot<OpenCompletion>,
    completion_sell: LatestSlot<OpenCompletion>,
    pub(crate) pollers: std::sync::Mutex<PollerSlots>,
}

impl Trader {
    /// Build the trader, loading a persisted snapshot when one exists.
    /// Must be called inside a tokio runtime (spawns the state applier).
    pub fn new(
        cfg: Config,
        broker: Arc<dyn Broker>,
        oracle: Arc<dyn DecisionOracle>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Arc<Self>> {
        ensure_state_path(&cfg)?;
        let st = if cfg.persist_state {
            match load_state(&cfg.state_file)? {
                Some(st) => {
                    info!(
                        "📂 restored state: equity={:.2} lots={}/{} next_lot={}",
                        st.equity_usd,
                        st.book_buy.len(),
                        st.book_sell.len(),
                        st.next_lot_seq,
                    );
                    st
                }
                None => TraderState::new(&cfg),
            }
        } else {
            TraderState::new(&cfg)
        };
        let state = Arc::new(RwLock::new(st));
        let apply_tx = spawn_applier(state.clone(), cfg.clone());
        let filters = FilterCache::new(&cfg);
        Ok(Arc::new(Self {
            cfg,
            broker,
            oracle,
            notifier,
            filters,
            state,
            apply_tx,
            completion_buy: LatestSlot::new(),
            completion_sell: LatestSlot::new(),
            pollers: std::sync::Mutex::new(PollerSlots::default()),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub(crate) fn completion_slot(&self, side: Side) -> &LatestSlot<OpenCompletion> {
        match side {
            Side::Buy => &self.completion_buy,
            Side::Sell => &self.completion_sell,
        }
    }

    pub(crate) async fn persist_locked(&self, st: &TraderState) {
        if !self.cfg.persist_state {
            return;
        }
        if let Err(e) = super::state::save_state(&self.cfg.state_file, st).await {
            warn!("⚠️ state persist failed: {e:#}");
        }
    }

    /// Clone of the current state, for observers and tests.
    pub async fn snapshot(&self) -> TraderState {
        self.state.read().await.clone()
    }

    /// Re-attach persisted pending opens to live venue orders.
    pub async fn rehydrate(self: &Arc<Self>) -> Result<()> {
        let pendings: Vec<PendingOpen> = {
            let st = self.state.read().await;
            [st.pending_buy.clone(), st.pending_sell.clone()]
                .into_iter()
                .flatten()
                .collect()
        };
        for p in pendings {
            let side = p.side;
            let looked_up = timeout(IO_TIMEOUT, self.broker.get_order(&p.product_id, &p.order_id)).await;
            match looked_up {
                Ok(Ok(o)) if o.status == OrderStatus::Filled => {
                    info!("🔁 rehydrate: pending {} order {} already filled", side.as_str(), p.order_id);
                    self.completion_slot(side).send_latest(completion_from(&p, &o));
                }
                Ok(Ok(o)) if !o.status.is_terminal() => {
                    self.resume_pending(&p);
                }
                Ok(Ok(o)) => {
                    // Terminal non-fill; keep any session fills it caught.
                    let c = completion_from(&p, &o);
                    if c.is_fill() {
                        info!("🔁 rehydrate: pending {} terminal with partial fills", side.as_str());
                        self.completion_slot(side).send_latest(c);
                    } else {
                        warn!("🔁 rehydrate: pending {} dead ({:?}); market fallback armed", side.as_str(), o.status);
                        let mut st = self.state.write().await;
                        st.set_recheck(side, true);
                        *st.pending_mut(side) = None;
                        self.persist_locked(&st).await;
                    }
                }
                _ => {
                    warn!("🔁 rehydrate: pending {} order {} unreadable; market fallback armed", side.as_str(), p.order_id);
                    let mut st = self.state.write().await;
                    st.set_recheck(side, true);
                    *st.pending_mut(side) = None;
                    self.persist_locked(&st).await;
                }
            }
        }
        Ok(())
    }

    /// Cancel pollers and persist a final snapshot.
    pub async fn shutdown(&self) {
        self.cancel_poller(Side::Buy);
        self.cancel_poller(Side::Sell);
        let st = self.state.read().await;
        self.persist_locked(&st).await;
    }

    // ─────────────────────────────────────────────────
    // The decision tick
    // ─────────────────────────────────────────────────

    /// One decision tick over the candle history (most recent last).
    /// Returns a one-line status summary.
    pub async fn step(self: &Arc<Self>, candles: &[Candle]) -> Result<String> {
        let now = candles.last().map(|c| c.time).unwrap_or_else(Utc::now);
        let mut parts: Vec<String> = Vec::new();

        {
            let mut st = self.state.write().await;
            st.roll_daily(now);
            if self.drain_completions(&mut st, now) {
                self.persist_locked(&st).await;
            }
        }

        let mark = timeout(IO_TIMEOUT, self.broker.get_now_price(&self.cfg.product_id))
            .await
            .context("price fetch timed out")?
            .context("price fetch failed")?;
        if mark <= 0.0 {
            bail!("degenerate mark price {mark}");
        }
        let filters = self.filters.get(self.broker.as_ref(), &self.cfg.product_id).await?;

        // EXIT before OPEN; at most one close per tick.
        let close_req = {
            let mut st = self.state.write().await;
            self.scan_exits(&mut st, mark, now, &filters)
        };
        if let Some(req) = close_req {
            parts.push(self.close_lot(req, mark, &filters).await?);
        }

        parts.push(self.evaluate_open(mark, candles, &filters, now).await?);
        Ok(parts.join(" | "))
    }

    // ─────────────────────────────────────────────────
    // Completion drain
    // ─────────────────────────────────────────────────

    fn drain_completions(&self, st: &mut TraderState, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        for side in [Side::Buy, Side::Sell] {
            while let Some(c) = self.completion_slot(side).try_take() {
                changed = true;
                let pending = st.pending(side).cloned();
                if c.is_fill() {
                    let (accepted, orphan) = match &pending {
                        Some(p) => (p.owns_order(&c.order_id), false),
                        None => (true, true),
                    };
                    if !accepted {
                        warn!(
                            "⚠️ completion {} does not match pending {}; dropped",
                            c.order_id,
                            pending.as_ref().map(|p| p.order_id.as_str()).unwrap_or("-"),
                        );
                        continue;
                    }
                    if orphan {
                        warn!("⚠️ orphan completion on {}: order {}; accepting fill", side.as_str(), c.order_id);
                    }
                    let fee = if c.fee_usd > 1e-12 {
                        c.fee_usd
                    } else {
                        c.quote_spent * self.cfg.fee_rate_pct / 100.0
                    };
                    let promote = pending
                        .as_ref()
                        .map(|p| match side {
                            Side::Buy => p.equity_buy,
                            Side::Sell => p.equity_sell,
                        })
                        .unwrap_or(false);
                    let reason = pending
                        .as_ref()
                        .map(|p| p.reason.clone())
                        .unwrap_or_else(|| "orphan_fill".to_string());
                    let take = pending.as_ref().map(|p| p.take).unwrap_or(0.0);

                    let lot_id = st.next_lot_seq;
                    st.next_lot_seq += 1;
                    let mut lot = Lot::new(
                        side,
                        c.avg_price,
                        c.filled_base,
                        fee,
                        c.quote_spent,
                        now,
                        lot_id,
                        reason,
                        c.order_id.clone(),
                    );
                    lot.take = take;
                    let book = st.book_mut(side);
                    book.push(lot, promote);
                    let idx = book.len() - 1;
                    let mode = pnl::classify(book, idx);
                    book.lots[idx].exit_mode = mode;
                    st.reset_side_anchors(side, now);
                    info!(
                        "✅ maker entry filled: {} {:.8} @ {:.4} fee={:.4} lot#{}{}",
                        side.as_str(),
                        c.filled_base,
                        c.avg_price,
                        fee,
                        lot_id,
                        if promote { " (runner)" } else { "" },
                    );
                } else {
                    st.set_recheck(side, true);
                    info!("⏱️ maker entry {} ended unfilled; market fallback armed", side.as_str());
                }
                *st.pending_mut(side) = None;
            }
        }
        changed
    }

    // ─────────────────────────────────────────────────
    // Exit scan
    // ─────────────────────────────────────────────────

    fn scan_exits(
        &self,
        st: &mut TraderState,
        mark: f64,
        now: DateTime<Utc>,
        filters: &ExchangeFilters,
    ) -> Option<CloseRequest> {
        for side in [Side::Buy, Side::Sell] {
            let len = st.book(side).len();
            for idx in 0..len {
                let mode = pnl::classify(st.book(side), idx);
                let gate = {
                    let lot = &st.book(side).lots[idx];
                    pnl::required_gate_usd(&self.cfg, mode, idx, lot.open_time, now)
                };
                let lot = &mut st.book_mut(side).lots[idx];
                let (_gross, est_fee, net) = pnl::unrealized(
                    lot.side,
                    lot.open_price,
                    lot.size_base,
                    lot.entry_fee_usd,
                    mark,
                    self.cfg.fee_rate_pct,
                );
                lot.est_exit_fee_usd = est_fee;
                lot.unrealized_pnl_usd = net;
                lot.exit_mode = mode;

                if net < gate {
                    lot.reset_exit_state();
                    lot.take = pnl::preview_take(&self.cfg, lot, mode, idx, now);
                    continue;
                }

                let triggered = match mode {
                    ExitMode::RunnerTrailing | ExitMode::ScalpTrailing => {
                        let (act, dist) = pnl::trail_params(&self.cfg, mode);
                        if !lot.trail_active {
                            lot.take = pnl::preview_take(&self.cfg, lot, mode, idx, now);
                        }
                        pnl::update_trailing(lot, mark, act, dist)
                    }
                    ExitMode::ScalpFixedTp => pnl::update_fixed_tp(lot, mark, self.cfg.tp_maker_offset_bps),
                };

                if triggered {
                    if lot.size_base * mark + 1e-9 < filters.min_notional {
                        debug!("exit deferred lot#{}: notional below venue minimum", lot.lot_id);
                        continue;
                    }
                    let reason = match mode {
                        ExitMode::ScalpFixedTp => "take_profit",
                        _ => "trail_stop",
                    };
                    return Some(CloseRequest {
                        side,
                        lot_id: lot.lot_id,
                        requested_base: lot.size_base,
                        exit_mode: mode,
                        take: lot.take,
                        reason: reason.to_string(),
                    });
                }
            }
        }
        None
    }

    // ─────────────────────────────────────────────────
    // Open evaluation
    // ─────────────────────────────────────────────────

    async fn evaluate_open(
        self: &Arc<Self>,
        mark: f64,
        candles: &[Candle],
        filters: &ExchangeFilters,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let cfg = &self.cfg;

        let ctx = {
            let st = self.state.read().await;
            if cfg.max_daily_loss_pct > 0.0 && st.daily_start > 0.0 {
                let floor = -(cfg.max_daily_loss_pct / 100.0) * st.daily_start;
                if st.daily_pnl <= floor {
                    return Ok(format!("HOLD daily-loss-limit ({:+.2})", st.daily_pnl));
                }
            }
            OracleContext {
                model_file: st.model_file.clone(),
                extended_model_file: st.extended_model_file.clone(),
                buy_threshold: cfg.buy_threshold,
                sell_threshold: cfg.sell_threshold,
                use_ma_filter: cfg.use_ma_filter,
            }
        };

        let decision = self.oracle.decide(candles, &ctx);
        if decision.signal == Signal::Flat {
            return Ok(format!("HOLD flat p_up={:.3}", decision.p_up));
        }
        let side = match decision.signal {
            Signal::Buy => Side::Buy,
            Signal::Sell => Side::Sell,
            Signal::Flat => unreachable!(),
        };
        if cfg.long_only && side == Side::Sell {
            return Ok(format!("HOLD long-only p_up={:.3}", decision.p_up));
        }

        // Gating under the write lock; the recheck flag is consumed the
        // tick it is observed, whether or not an order lands.
        let mut market_pref = false;
        let mut trigger;
        {
            let mut st = self.state.write().await;
            if st.pending(side).is_some() {
                return Ok(format!("HOLD pending-open {}", side.as_str()));
            }
            if st.recheck(side) {
                st.set_recheck(side, false);
                market_pref = true;
                self.persist_locked(&st).await;
            }
            trigger = match side {
                Side::Sell => st.equity_usd >= st.last_add_equity_sell * 1.01,
                Side::Buy => st.equity_usd <= st.last_add_equity_buy * 0.99,
            };
            if !trigger {
                if let Some(hold) = self.check_open_gates(&mut st, side, mark, now) {
                    self.persist_locked(&st).await;
                    return Ok(hold);
                }
            }
        }

        // Balances with the lock released.
        let base_bal = timeout(IO_TIMEOUT, self.broker.get_available_base(&cfg.product_id))
            .await
            .context("base balance timed out")?
            .context("base balance failed")?;
        let quote_bal = timeout(IO_TIMEOUT, self.broker.get_available_quote(&cfg.product_id))
            .await
            .context("quote balance timed out")?
            .context("quote balance failed")?;

        // Sizing.
        let order_quote;
        {
            let mut st = self.state.write().await;
            let reserved_b = sizing::reserved_base(&st);
            let reserved_q = sizing::reserved_quote(&st, cfg.fee_rate_pct);

            let mut staged_quote = None;
            if trigger {
                let candidate = match side {
                    Side::Sell => base_bal.available - reserved_b,
                    Side::Buy => quote_bal.available - reserved_q,
                };
                match sizing::staged_equity_size(side, candidate, st.equity_stage(side), filters, mark) {
                    Some(ss) => {
                        st.set_equity_stage(side, ss.next_stage);
                        staged_quote = Some(match side {
                            Side::Sell => ss.size * mark,
                            Side::Buy => ss.size,
                        });
                        info!(
                            "⚡ equity trigger {}: staged {:.2} USD (next stage {})",
                            side.as_str(),
                            staged_quote.unwrap_or(0.0),
                            ss.next_stage,
                        );
                    }
                    None => {
                        debug!("equity trigger {}: no stage qualifies, disabled this tick", side.as_str());
                        trigger = false;
                        if let Some(hold) = self.check_open_gates(&mut st, side, mark, now) {
                            self.persist_locked(&st).await;
                            return Ok(hold);
                        }
                    }
                }
            }

            order_quote = match staged_quote {
                Some(q) => q,
                None => {
                    let q = sizing::risk_quote(cfg, st.equity_usd, st.book(side).len(), candles);
                    match side {
                        Side::Buy => {
                            let avail = quote_bal.available - reserved_q;
                            let mut quote = snap_down(q, filters.quote_step);
                            if quote > avail + INV_EPS {
                                quote = snap_down(avail.max(0.0), filters.quote_step);
                            }
                            if quote <= 0.0 || quote + 1e-9 < filters.min_notional {
                                return Ok(format!("HOLD insufficient-quote ({:.2} free)", avail.max(0.0)));
                            }
                            quote
                        }
                        Side::Sell => {
                            let mut base = snap_down(q / mark, filters.base_step);
                            if cfg.require_base_for_short {
                                let avail = base_bal.available - reserved_b;
                                if base > avail + INV_EPS {
                                    base = snap_down(avail.max(0.0), filters.base_step);
                                }
                            }
                            if base <= 0.0 || base * mark + 1e-9 < filters.min_notional {
                                return Ok("HOLD insufficient-base".to_string());
                            }
                            base * mark
                        }
                    }
                }
            };
        }

        let reason = if trigger {
            format!("equity_trigger p_up={:.3}", decision.p_up)
        } else {
            format!("signal p_up={:.3}", decision.p_up)
        };
        // Take preview carried on the pending, estimated at the mark.
        let est_size = order_quote / mark;
        let est_fee = order_quote * cfg.fee_rate_pct / 100.0;
        let target = if trigger { cfg.trail_activate_usd_runner } else { cfg.trail_activate_usd_scalp };
        let take = pnl::activation_price(side, mark, est_size, est_fee, cfg.fee_rate_pct, target);

        // Placement path: maker-first unless configured market or a market
        // preference was armed by a prior failed maker attempt.
        if cfg.maker_first_enabled() && !market_pref {
            match self
                .open_maker_first(
                    side,
                    mark,
                    order_quote,
                    take,
                    reason.clone(),
                    trigger && side == Side::Buy,
                    trigger && side == Side::Sell,
                    *filters,
                )
                .await
            {
                Ok(status) => return Ok(status),
                Err(e) => {
                    warn!("post-only open {} failed: {e:#}; market fallback armed", side.as_str());
                    let mut st = self.state.write().await;
                    st.set_recheck(side, true);
                    self.persist_locked(&st).await;
                    return Ok(format!("HOLD post-only-rejected {}", side.as_str()));
                }
            }
        }

        let placed = self.place_market_with_retry(side, order_quote).await?;
        let open_price = if placed.price > 0.0 { placed.price } else { mark };
        let size = if placed.base_size > 0.0 { placed.base_size } else { order_quote / mark };
        let notional = if placed.quote_spent > 0.0 { placed.quote_spent } else { order_quote };
        let fee = if placed.commission_usd > 0.0 {
            placed.commission_usd
        } else {
            notional * cfg.fee_rate_pct / 100.0
        };

        {
            let mut st = self.state.write().await;
            let lot_id = st.next_lot_seq;
            st.next_lot_seq += 1;
            let mut lot = Lot::new(side, open_price, size, fee, notional, now, lot_id, reason, placed.order_id.clone());
            lot.take = take;
            let book = st.book_mut(side);
            book.push(lot, trigger);
            let idx = book.len() - 1;
            let mode = pnl::classify(book, idx);
            book.lots[idx].exit_mode = mode;
            st.reset_side_anchors(side, now);
            self.persist_locked(&st).await;
            info!(
                "🟢 OPEN {} {:.8} @ {:.4} ({:.2} USD) lot#{}{}",
                side.as_str(),
                size,
                open_price,
                notional,
                lot_id,
                if trigger { " (runner)" } else { "" },
            );
        }
        self.notifier
            .notify(&format!("OPEN {} {:.2} USD @ {:.4}", side.as_str(), notional, open_price))
            .await;
        Ok(format!(
            "OPEN {} {:.2} USD @ {:.4}{}",
            side.as_str(),
            notional,
            open_price,
            if market_pref { " (market fallback)" } else { " (market)" },
        ))
    }

    /// Lot cap + pyramiding gates for the non-trigger path.
    /// Returns a HOLD status when the open must not proceed.
    fn check_open_gates(&self, st: &mut TraderState, side: Side, mark: f64, now: DateTime<Utc>) -> Option<String> {
        if st.total_lots() >= self.cfg.max_concurrent_lots {
            return Some(format!("HOLD lot-cap ({})", st.total_lots()));
        }
        if st.book(side).is_empty() {
            return None;
        }
        if !self.cfg.allow_pyramiding {
            return Some("HOLD pyramiding-disabled".to_string());
        }
        let last_entry = st
            .book(side)
            .lots
            .last()
            .map(|l| l.open_price)
            .unwrap_or(mark);
        let gd = match side {
            Side::Buy => pyramid::evaluate(
                &self.cfg,
                side,
                mark,
                now,
                st.last_add_buy,
                last_entry,
                &mut st.win_low_buy,
                &mut st.latched_gate_buy,
            ),
            Side::Sell => pyramid::evaluate(
                &self.cfg,
                side,
                mark,
                now,
                st.last_add_sell,
                last_entry,
                &mut st.win_high_sell,
                &mut st.latched_gate_sell,
            ),
        };
        if !gd.pass {
            return Some(format!(
                "HOLD pyramid-gate {} needs {:.4} (eff {:.3}%)",
                side.as_str(),
                gd.gate,
                gd.eff_pct,
            ));
        }
        None
    }

    /// Market order with a single retry at the configured floor when the
    /// venue reports an insufficient-funds-shaped error.
    async fn place_market_with_retry(&self, side: Side, quote: f64) -> Result<PlacedOrder> {
        let product = &self.cfg.product_id;
        match timeout(IO_TIMEOUT, self.broker.place_market_quote(product, side, quote)).await {
            Ok(Ok(p)) => Ok(p),
            Ok(Err(e)) if is_insufficient_funds(&e) && self.cfg.order_min_usd > 0.0 && self.cfg.order_min_usd < quote => {
                warn!(
                    "market {} {:.2} USD rejected ({e:#}); retrying at floor {:.2}",
                    side.as_str(),
                    quote,
                    self.cfg.order_min_usd,
                );
                timeout(IO_TIMEOUT, self.broker.place_market_quote(product, side, self.cfg.order_min_usd))
                    .await
                    .context("market retry timed out")?
                    .context("market retry failed")
            }
            Ok(Err(e)) => Err(e).context("market order failed"),
            Err(_) => bail!("market order timed out"),
        }
    }
}

fn completion_from(p: &PendingOpen, o: &PlacedOrder) -> OpenCompletion {
    let base = p.accum_base + o.base_size;
    let quote = p.accum_quote + o.quote_spent;
    OpenCompletion {
        side: p.side,
        order_id: p.order_id.clone(),
        filled_base: base,
        avg_price: if base > 1e-12 { quote / base } else { 0.0 },
        quote_spent: quote,
        fee_usd: p.accum_fee_usd + o.commission_usd,
    }
}
