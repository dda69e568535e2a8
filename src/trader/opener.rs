//! Async maker-first opener.
//!
//! A post-only limit entry rests on the book while a dedicated per-side
//! poller watches it: repricing under guardrails, folding fills across
//! reprices into a session VWAP, and reporting the terminal result through
//! a single-slot completion channel the decision tick drains.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use super::engine::Trader;
use super::filters::{snap_down, snap_up};
use super::state::{ApplyMsg, PendingOpen};
use super::types::{ExchangeFilters, OrderStatus, PlacedOrder, Side};

/// How long each broker call in the poller may take.
const IO_TIMEOUT: Duration = Duration::from_secs(3);
/// Poll cadence for a resting order.
const POLL_INTERVAL: Duration = Duration::from_millis(900);

/// Terminal result of one maker-first session (across all reprices).
#[derive(Debug, Clone)]
pub struct OpenCompletion {
    pub side: Side,
    /// Order id current at terminal time.
    pub order_id: String,
    pub filled_base: f64,
    /// Session VWAP; 0.0 on a non-fill.
    pub avg_price: f64,
    pub quote_spent: f64,
    pub fee_usd: f64,
}

impl OpenCompletion {
    pub fn is_fill(&self) -> bool {
        self.filled_base > 1e-12
    }
}

// ─────────────────────────────────────────────────────────
// Single-slot completion channel
// ─────────────────────────────────────────────────────────

/// Capacity-1 channel with drop-stale-then-send-latest semantics: the
/// consumer always observes the most recent terminal result.
pub struct LatestSlot<T> {
    tx: mpsc::Sender<T>,
    rx: std::sync::Mutex<mpsc::Receiver<T>>,
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self { tx, rx: std::sync::Mutex::new(rx) }
    }

    pub fn send_latest(&self, v: T) {
        if let Err(mpsc::error::TrySendError::Full(v)) = self.tx.try_send(v) {
            let _ = self.rx.lock().expect("slot poisoned").try_recv();
            let _ = self.tx.try_send(v);
        }
    }

    pub fn try_take(&self) -> Option<T> {
        self.rx.lock().expect("slot poisoned").try_recv().ok()
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation handles for the per-side pollers. Replacing (or dropping)
/// a sender cancels the previous poller.
#[derive(Default)]
pub(crate) struct PollerSlots {
    pub buy: Option<watch::Sender<bool>>,
    pub sell: Option<watch::Sender<bool>>,
}

impl PollerSlots {
    pub fn set(&mut self, side: Side, tx: watch::Sender<bool>) {
        match side {
            Side::Buy => self.buy = Some(tx),
            Side::Sell => self.sell = Some(tx),
        }
    }

    pub fn cancel(&mut self, side: Side) {
        let slot = match side {
            Side::Buy => &mut self.buy,
            Side::Sell => &mut self.sell,
        };
        if let Some(tx) = slot.take() {
            let _ = tx.send(true);
        }
    }
}

/// Fill totals for the order currently being watched, used to derive
/// per-observation deltas for the session accumulators.
#[derive(Debug, Clone, Copy, Default)]
struct SeenFills {
    base: f64,
    quote: f64,
    fee: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Session {
    base: f64,
    quote: f64,
    fee: f64,
}

impl Session {
    fn fold(&mut self, seen: &mut SeenFills, o: &PlacedOrder) {
        let db = (o.base_size - seen.base).max(0.0);
        let dq = (o.quote_spent - seen.quote).max(0.0);
        let df = (o.commission_usd - seen.fee).max(0.0);
        self.base += db;
        self.quote += dq;
        self.fee += df;
        seen.base = o.base_size.max(seen.base);
        seen.quote = o.quote_spent.max(seen.quote);
        seen.fee = o.commission_usd.max(seen.fee);
    }

    fn vwap(&self) -> f64 {
        if self.base > 1e-12 {
            self.quote / self.base
        } else {
            0.0
        }
    }
}

impl Trader {
    /// Compute the passive entry limit and base for a side at `mark`.
    /// Returns (limit, base) or an error when the snapped order would be
    /// degenerate or below min-notional.
    pub(crate) fn maker_entry(
        &self,
        side: Side,
        mark: f64,
        quote: f64,
        filters: &ExchangeFilters,
    ) -> Result<(f64, f64)> {
        let off = self.cfg.limit_price_offset_bps / 10_000.0;
        let limit = match side {
            Side::Buy => snap_down(mark * (1.0 - off), filters.price_tick),
            Side::Sell => snap_up(mark * (1.0 + off), filters.price_tick),
        };
        if limit <= 0.0 {
            bail!("degenerate limit price {limit}");
        }
        let base = snap_down(quote / limit, filters.base_step);
        if base <= 0.0 {
            bail!("degenerate base size for quote {quote:.2} at {limit}");
        }
        if base * limit + 1e-9 < filters.min_notional {
            bail!(
                "below min notional: {:.2} < {:.2}",
                base * limit,
                filters.min_notional
            );
        }
        Ok((limit, base))
    }

    /// Place a post-only entry and hand it to a background poller.
    /// Returns a status string once the pending is registered.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn open_maker_first(
        self: &Arc<Self>,
        side: Side,
        mark: f64,
        quote: f64,
        take: f64,
        reason: String,
        equity_buy: bool,
        equity_sell: bool,
        filters: ExchangeFilters,
    ) -> Result<String> {
        let (limit, base) = self.maker_entry(side, mark, quote, &filters)?;
        let product = self.cfg.product_id.clone();

        let order_id = timeout(IO_TIMEOUT, self.broker.place_limit_post_only(&product, side, limit, base))
            .await
            .context("post-only placement timed out")?
            .context("post-only placement failed")?;

        let now = Utc::now();
        let deadline = now + ChronoDuration::seconds(self.cfg.limit_timeout_sec as i64);
        let pending = PendingOpen {
            side,
            limit_px: limit,
            base_at_limit: base,
            quote,
            take,
            reason: reason.clone(),
            product_id: product,
            created_at: now,
            deadline,
            equity_buy,
            equity_sell,
            order_id: order_id.clone(),
            history: Vec::new(),
            accum_base: 0.0,
            accum_quote: 0.0,
            accum_fee_usd: 0.0,
            reprice_count: 0,
        };

        {
            let mut st = self.state.write().await;
            *st.pending_mut(side) = Some(pending);
            self.persist_locked(&st).await;
        }

        info!(
            "📤 post-only {} {:.8} @ {:.2} ({:.2} USD) id={} deadline={}s",
            side.as_str(),
            base,
            limit,
            quote,
            order_id,
            self.cfg.limit_timeout_sec,
        );

        self.spawn_poller(side, order_id, limit, quote, Session::default());
        Ok(format!("OPEN-PENDING {} {:.2} USD @ {:.2}", side.as_str(), quote, limit))
    }

    /// Resume a rehydrated pending: re-attach a poller to the live order.
    pub(crate) fn resume_pending(self: &Arc<Self>, p: &PendingOpen) {
        let session = Session { base: p.accum_base, quote: p.accum_quote, fee: p.accum_fee_usd };
        info!(
            "🔁 resuming pending {} order {} until {}",
            p.side.as_str(),
            p.order_id,
            p.deadline,
        );
        self.spawn_poller(p.side, p.order_id.clone(), p.limit_px, p.quote, session);
    }

    fn spawn_poller(self: &Arc<Self>, side: Side, order_id: String, init_limit: f64, quote: f64, session: Session) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut slots = self.pollers.lock().expect("poller slots poisoned");
            slots.cancel(side);
            slots.set(side, cancel_tx);
        }
        let trader = Arc::clone(self);
        tokio::spawn(async move {
            run_poller(trader, side, order_id, init_limit, quote, session, cancel_rx).await;
        });
    }

    /// Explicitly cancel a side's poller (shutdown path).
    pub fn cancel_poller(&self, side: Side) {
        self.pollers.lock().expect("poller slots poisoned").cancel(side);
    }
}

// ─────────────────────────────────────────────────────────
// Poller
// ─────────────────────────────────────────────────────────

async fn run_poller(
    trader: Arc<Trader>,
    side: Side,
    mut order_id: String,
    init_limit: f64,
    quote: f64,
    mut session: Session,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let product = trader.cfg.product_id.clone();
    let (deadline, mut reprice_count) = {
        let st = trader.state.read().await;
        match st.pending(side) {
            Some(p) => (p.deadline, p.reprice_count),
            // Pending vanished before we started; nothing to watch.
            None => return,
        }
    };

    let mut seen = SeenFills::default();
    let mut last_limit = init_limit;
    let mut last_reprice = tokio::time::Instant::now();

    let mut canceled = false;
    while Utc::now() < deadline {
        tokio::select! {
            _ = sleep(POLL_INTERVAL) => {}
            r = cancel_rx.changed() => {
                // Explicit cancel, or the trader dropped our handle.
                if r.is_err() || *cancel_rx.borrow() {
                    canceled = true;
                }
            }
        }
        if canceled {
            break;
        }

        let order = match timeout(IO_TIMEOUT, trader.broker.get_order(&product, &order_id)).await {
            Ok(Ok(o)) => o,
            Ok(Err(e)) => {
                debug!("poller {}: get_order failed: {e:#}", side.as_str());
                continue;
            }
            Err(_) => {
                debug!("poller {}: get_order timed out", side.as_str());
                continue;
            }
        };

        match order.status {
            OrderStatus::Filled => {
                session.fold(&mut seen, &order);
                emit(&trader, side, &order_id, &session);
                return;
            }
            OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired => {
                session.fold(&mut seen, &order);
                warn!(
                    "poller {}: order {} terminal ({:?}) with {:.8} filled",
                    side.as_str(),
                    order_id,
                    order.status,
                    session.base,
                );
                emit(&trader, side, &order_id, &session);
                return;
            }
            // Unknown statuses keep polling without touching the order.
            OrderStatus::Unknown => {
                session.fold(&mut seen, &order);
            }
            OrderStatus::New | OrderStatus::PartiallyFilled | OrderStatus::PendingCancel => {
                session.fold(&mut seen, &order);
                match maybe_reprice(
                    &trader,
                    side,
                    &order_id,
                    init_limit,
                    &mut last_limit,
                    quote,
                    &mut reprice_count,
                    &mut last_reprice,
                    &mut session,
                    &mut seen,
                )
                .await
                {
                    Reprice::Switched(new_id) => order_id = new_id,
                    Reprice::Unchanged => {}
                    // Old order canceled but no replacement landed; the
                    // completion was already emitted.
                    Reprice::Aborted => return,
                }
            }
        }
    }

    // Deadline or cancellation: best-effort cancel, then read once more so
    // fills that landed during the cancel are still counted.
    match timeout(IO_TIMEOUT, trader.broker.cancel_order(&product, &order_id)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("poller {}: final cancel failed: {e:#}", side.as_str()),
        Err(_) => debug!("poller {}: final cancel timed out", side.as_str()),
    }
    if let Ok(Ok(order)) = timeout(IO_TIMEOUT, trader.broker.get_order(&product, &order_id)).await {
        session.fold(&mut seen, &order);
    }
    debug!(
        "poller {}: {} with {:.8} base filled",
        side.as_str(),
        if canceled { "canceled" } else { "deadline" },
        session.base,
    );
    emit(&trader, side, &order_id, &session);
}

fn emit(trader: &Trader, side: Side, order_id: &str, session: &Session) {
    let completion = OpenCompletion {
        side,
        order_id: order_id.to_string(),
        filled_base: session.base,
        avg_price: session.vwap(),
        quote_spent: session.quote,
        fee_usd: session.fee,
    };
    trader.completion_slot(side).send_latest(completion);
}

enum Reprice {
    Unchanged,
    Switched(String),
    /// The resting order was canceled but no replacement exists.
    Aborted,
}

/// One reprice attempt; all guardrails must pass before the resting order
/// is moved.
#[allow(clippy::too_many_arguments)]
async fn maybe_reprice(
    trader: &Arc<Trader>,
    side: Side,
    order_id: &str,
    init_limit: f64,
    last_limit: &mut f64,
    quote: f64,
    reprice_count: &mut u32,
    last_reprice: &mut tokio::time::Instant,
    session: &mut Session,
    seen: &mut SeenFills,
) -> Reprice {
    let cfg = &trader.cfg;
    if !cfg.reprice_enable || *reprice_count >= cfg.reprice_max_count {
        return Reprice::Unchanged;
    }
    if last_reprice.elapsed() < Duration::from_millis(cfg.reprice_interval_ms) {
        return Reprice::Unchanged;
    }

    let product = &cfg.product_id;
    let filters = match trader.filters.get(trader.broker.as_ref(), product).await {
        Ok(f) => f,
        Err(e) => {
            debug!("reprice {}: filters unavailable: {e:#}", side.as_str());
            return Reprice::Unchanged;
        }
    };
    let tick = filters.price_tick;
    if tick <= 0.0 {
        return Reprice::Unchanged;
    }

    // Preferred target: join the touch, nudged one tick inside on a cross.
    // Fallback when the BBO is unavailable: mark +/- the entry offset.
    let target = match timeout(IO_TIMEOUT, trader.broker.get_bbo(product)).await {
        Ok(Ok((bid, ask))) if bid > 0.0 && ask > 0.0 => match side {
            Side::Buy => {
                if bid >= ask - tick / 2.0 {
                    ask - tick
                } else {
                    bid
                }
            }
            Side::Sell => {
                if ask <= bid + tick / 2.0 {
                    bid + tick
                } else {
                    ask
                }
            }
        },
        _ => match timeout(IO_TIMEOUT, trader.broker.get_now_price(product)).await {
            Ok(Ok(mark)) if mark > 0.0 => {
                let off = cfg.limit_price_offset_bps / 10_000.0;
                match side {
                    Side::Buy => mark * (1.0 - off),
                    Side::Sell => mark * (1.0 + off),
                }
            }
            _ => return Reprice::Unchanged,
        },
    };

    let new_limit = match side {
        Side::Buy => snap_down(target, tick),
        Side::Sell => snap_up(target, tick),
    };
    if new_limit <= 0.0 {
        return Reprice::Unchanged;
    }

    // Guardrails.
    if (new_limit - *last_limit).abs() + 1e-12 < tick {
        return Reprice::Unchanged;
    }
    let drift_bps = ((new_limit - init_limit) / init_limit).abs() * 10_000.0;
    if drift_bps > cfg.reprice_max_drift_bps {
        debug!("reprice {}: drift {:.1}bps over cap", side.as_str(), drift_bps);
        return Reprice::Unchanged;
    }
    let improv = match side {
        Side::Buy => new_limit - *last_limit,
        Side::Sell => *last_limit - new_limit,
    };
    if improv + 1e-12 < cfg.reprice_min_improv_ticks * tick {
        return Reprice::Unchanged;
    }
    let new_base = snap_down(quote / new_limit, filters.base_step);
    if new_base <= 0.0 || new_base * new_limit + 1e-9 < filters.min_notional {
        return Reprice::Unchanged;
    }
    if cfg.reprice_min_edge_usd > 0.0 && new_base * (new_limit - *last_limit).abs() < cfg.reprice_min_edge_usd {
        return Reprice::Unchanged;
    }

    // Cancel the resting order first; fold whatever it caught.
    match timeout(IO_TIMEOUT, trader.broker.cancel_order(product, order_id)).await {
        Ok(Ok(())) => {}
        other => {
            debug!("reprice {}: cancel failed ({other:?}), keep polling old order", side.as_str());
            return Reprice::Unchanged;
        }
    }
    if let Ok(Ok(final_old)) = timeout(IO_TIMEOUT, trader.broker.get_order(product, order_id)).await {
        session.fold(seen, &final_old);
    }

    let new_id = match timeout(IO_TIMEOUT, trader.broker.place_limit_post_only(product, side, new_limit, new_base)).await {
        Ok(Ok(id)) => id,
        other => {
            // Old order is gone and the replacement failed: surface what we
            // have so the tick can fall back to market.
            warn!("reprice {}: replacement failed ({other:?})", side.as_str());
            emit(trader, side, order_id, session);
            return Reprice::Aborted;
        }
    };

    info!(
        "🔄 repriced {} {:.2} → {:.2} (#{}) id={}",
        side.as_str(),
        *last_limit,
        new_limit,
        *reprice_count + 1,
        new_id,
    );

    *last_limit = new_limit;
    *reprice_count += 1;
    *last_reprice = tokio::time::Instant::now();
    *seen = SeenFills::default();

    // Mirror into the pending record and persist so a crash resumes here.
    let old_id = order_id.to_string();
    let new_id_clone = new_id.clone();
    let (sb, sq, sf) = (session.base, session.quote, session.fee);
    let _ = trader.apply_tx.send(ApplyMsg {
        mutate: Box::new(move |st| {
            if let Some(p) = st.pending_mut(side).as_mut() {
                if p.order_id == old_id {
                    p.record_reprice(new_id_clone, new_limit, new_base);
                    p.accum_base = sb;
                    p.accum_quote = sq;
                    p.accum_fee_usd = sf;
                }
            }
        }),
        persist: true,
    });

    Reprice::Switched(new_id)
}
