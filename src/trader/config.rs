//! Bot configuration.
//!
//! Defaults are conservative; every field can be overridden via a
//! `TIDEBOT_*` environment variable of the same name.

// ─────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    // Product & fees
    pub product_id: String,
    /// Candle granularity in seconds; also the tick cadence.
    pub granularity_secs: u64,
    /// Taker/maker fee as a percent (0.10 = 10 bps).
    pub fee_rate_pct: f64,
    /// Venue minimum notional; preferred over `order_min_usd` when > 0.
    pub min_notional: f64,
    pub order_min_usd: f64,

    // Risk & sizing
    pub risk_per_trade_pct: f64,
    /// Seed equity when no snapshot exists.
    pub usd_equity: f64,
    /// Daily loss breaker as percent of daily start; <= 0 disables.
    pub max_daily_loss_pct: f64,
    pub long_only: bool,
    /// Spot safety: SELL opens require base inventory.
    pub require_base_for_short: bool,
    pub ramp_enable: bool,
    /// "linear" or "exp".
    pub ramp_mode: String,
    pub ramp_start_pct: f64,
    pub ramp_step_pct: f64,
    pub ramp_growth: f64,
    pub ramp_max_pct: f64,
    pub vol_adjust_enable: bool,

    // Venue filter overrides (0 = use venue values)
    pub price_tick: f64,
    pub base_step: f64,
    pub quote_step: f64,

    // Pyramiding
    pub allow_pyramiding: bool,
    pub pyramid_min_seconds_between: f64,
    pub pyramid_min_adverse_pct: f64,
    /// Exponential decay rate per minute; 0 disables decay.
    pub pyramid_decay_lambda: f64,
    pub pyramid_decay_min_pct: f64,

    // Scalp fixed-TP gate decay
    pub scalp_tp_decay_enable: bool,
    /// "linear" or "exp".
    pub scalp_tp_dec_mode: String,
    pub scalp_tp_dec_pct: f64,
    pub scalp_tp_decay_factor: f64,
    pub scalp_tp_min_pct: f64,

    // USD trailing & gates
    pub profit_gate_usd: f64,
    pub trail_activate_usd_runner: f64,
    pub trail_activate_usd_scalp: f64,
    pub trail_distance_pct_runner: f64,
    pub trail_distance_pct_scalp: f64,
    pub tp_maker_offset_bps: f64,

    // Order entry
    /// "market" or "limit" (maker-first).
    pub order_type: String,
    pub limit_price_offset_bps: f64,
    pub limit_timeout_sec: u64,
    pub reprice_enable: bool,
    pub reprice_interval_ms: u64,
    pub reprice_max_count: u32,
    pub reprice_max_drift_bps: f64,
    pub reprice_min_improv_ticks: f64,
    pub reprice_min_edge_usd: f64,

    // Runtime
    pub max_concurrent_lots: usize,
    pub exit_history_size: usize,
    pub persist_state: bool,
    pub state_file: String,
    pub dry_run: bool,
    pub max_history_candles: usize,

    // Oracle thresholds
    pub buy_threshold: f64,
    pub sell_threshold: f64,
    pub use_ma_filter: bool,
    pub model_file: String,
    pub extended_model_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            product_id: "BTC-USD".to_string(),
            granularity_secs: 60,
            fee_rate_pct: 0.10,
            min_notional: 5.0,
            order_min_usd: 10.0,

            risk_per_trade_pct: 1.0,
            usd_equity: 1_000.0,
            max_daily_loss_pct: 5.0,
            long_only: true,
            require_base_for_short: true,
            ramp_enable: false,
            ramp_mode: "linear".to_string(),
            ramp_start_pct: 0.5,
            ramp_step_pct: 0.25,
            ramp_growth: 1.5,
            ramp_max_pct: 3.0,
            vol_adjust_enable: false,

            price_tick: 0.0,
            base_step: 0.0,
            quote_step: 0.0,

            allow_pyramiding: true,
            pyramid_min_seconds_between: 180.0,
            pyramid_min_adverse_pct: 1.5,
            pyramid_decay_lambda: 0.02,
            pyramid_decay_min_pct: 0.4,

            scalp_tp_decay_enable: false,
            scalp_tp_dec_mode: "linear".to_string(),
            scalp_tp_dec_pct: 2.0,
            scalp_tp_decay_factor: 0.9,
            scalp_tp_min_pct: 0.5,

            profit_gate_usd: 0.50,
            trail_activate_usd_runner: 2.0,
            trail_activate_usd_scalp: 0.50,
            trail_distance_pct_runner: 1.0,
            trail_distance_pct_scalp: 0.25,
            tp_maker_offset_bps: 5.0,

            order_type: "limit".to_string(),
            limit_price_offset_bps: 5.0,
            limit_timeout_sec: 45,
            reprice_enable: true,
            reprice_interval_ms: 3_000,
            reprice_max_count: 3,
            reprice_max_drift_bps: 25.0,
            reprice_min_improv_ticks: 1.0,
            reprice_min_edge_usd: 0.0,

            max_concurrent_lots: 10,
            exit_history_size: 200,
            persist_state: true,
            state_file: "state/tidebot.json".to_string(),
            dry_run: true,
            max_history_candles: 300,

            buy_threshold: 0.58,
            sell_threshold: 0.42,
            use_ma_filter: true,
            model_file: String::new(),
            extended_model_file: String::new(),
        }
    }
}

fn f64_var(key: &str, slot: &mut f64) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(f) = v.parse() {
            *slot = f;
        }
    }
}

fn u64_var(key: &str, slot: &mut u64) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(f) = v.parse() {
            *slot = f;
        }
    }
}

fn usize_var(key: &str, slot: &mut usize) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(f) = v.parse() {
            *slot = f;
        }
    }
}

fn u32_var(key: &str, slot: &mut u32) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(f) = v.parse() {
            *slot = f;
        }
    }
}

fn bool_var(key: &str, slot: &mut bool) {
    if let Ok(v) = std::env::var(key) {
        *slot = v != "0" && v.to_ascii_lowercase() != "false";
    }
}

fn string_var(key: &str, slot: &mut String) {
    if let Ok(v) = std::env::var(key) {
        if !v.is_empty() {
            *slot = v;
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut c = Self::default();

        string_var("TIDEBOT_PRODUCT_ID", &mut c.product_id);
        u64_var("TIDEBOT_GRANULARITY_SECS", &mut c.granularity_secs);
        f64_var("TIDEBOT_FEE_RATE_PCT", &mut c.fee_rate_pct);
        f64_var("TIDEBOT_MIN_NOTIONAL", &mut c.min_notional);
        f64_var("TIDEBOT_ORDER_MIN_USD", &mut c.order_min_usd);

        f64_var("TIDEBOT_RISK_PER_TRADE_PCT", &mut c.risk_per_trade_pct);
        f64_var("TIDEBOT_USD_EQUITY", &mut c.usd_equity);
        f64_var("TIDEBOT_MAX_DAILY_LOSS_PCT", &mut c.max_daily_loss_pct);
        bool_var("TIDEBOT_LONG_ONLY", &mut c.long_only);
        bool_var("TIDEBOT_REQUIRE_BASE_FOR_SHORT", &mut c.require_base_for_short);
        bool_var("TIDEBOT_RAMP_ENABLE", &mut c.ramp_enable);
        string_var("TIDEBOT_RAMP_MODE", &mut c.ramp_mode);
        f64_var("TIDEBOT_RAMP_START_PCT", &mut c.ramp_start_pct);
        f64_var("TIDEBOT_RAMP_STEP_PCT", &mut c.ramp_step_pct);
        f64_var("TIDEBOT_RAMP_GROWTH", &mut c.ramp_growth);
        f64_var("TIDEBOT_RAMP_MAX_PCT", &mut c.ramp_max_pct);
        bool_var("TIDEBOT_VOL_ADJUST_ENABLE", &mut c.vol_adjust_enable);

        f64_var("TIDEBOT_PRICE_TICK", &mut c.price_tick);
        f64_var("TIDEBOT_BASE_STEP", &mut c.base_step);
        f64_var("TIDEBOT_QUOTE_STEP", &mut c.quote_step);

        bool_var("TIDEBOT_ALLOW_PYRAMIDING", &mut c.allow_pyramiding);
        f64_var("TIDEBOT_PYRAMID_MIN_SECONDS_BETWEEN", &mut c.pyramid_min_seconds_between);
        f64_var("TIDEBOT_PYRAMID_MIN_ADVERSE_PCT", &mut c.pyramid_min_adverse_pct);
        f64_var("TIDEBOT_PYRAMID_DECAY_LAMBDA", &mut c.pyramid_decay_lambda);
        f64_var("TIDEBOT_PYRAMID_DECAY_MIN_PCT", &mut c.pyramid_decay_min_pct);

        bool_var("TIDEBOT_SCALP_TP_DECAY_ENABLE", &mut c.scalp_tp_decay_enable);
        string_var("TIDEBOT_SCALP_TP_DEC_MODE", &mut c.scalp_tp_dec_mode);
        f64_var("TIDEBOT_SCALP_TP_DEC_PCT", &mut c.scalp_tp_dec_pct);
        f64_var("TIDEBOT_SCALP_TP_DECAY_FACTOR", &mut c.scalp_tp_decay_factor);
        f64_var("TIDEBOT_SCALP_TP_MIN_PCT", &mut c.scalp_tp_min_pct);

        f64_var("TIDEBOT_PROFIT_GATE_USD", &mut c.profit_gate_usd);
        f64_var("TIDEBOT_TRAIL_ACTIVATE_USD_RUNNER", &mut c.trail_activate_usd_runner);
        f64_var("TIDEBOT_TRAIL_ACTIVATE_USD_SCALP", &mut c.trail_activate_usd_scalp);
        f64_var("TIDEBOT_TRAIL_DISTANCE_PCT_RUNNER", &mut c.trail_distance_pct_runner);
        f64_var("TIDEBOT_TRAIL_DISTANCE_PCT_SCALP", &mut c.trail_distance_pct_scalp);
        f64_var("TIDEBOT_TP_MAKER_OFFSET_BPS", &mut c.tp_maker_offset_bps);

        string_var("TIDEBOT_ORDER_TYPE", &mut c.order_type);
        f64_var("TIDEBOT_LIMIT_PRICE_OFFSET_BPS", &mut c.limit_price_offset_bps);
        u64_var("TIDEBOT_LIMIT_TIMEOUT_SEC", &mut c.limit_timeout_sec);
        bool_var("TIDEBOT_REPRICE_ENABLE", &mut c.reprice_enable);
        u64_var("TIDEBOT_REPRICE_INTERVAL_MS", &mut c.reprice_interval_ms);
        u32_var("TIDEBOT_REPRICE_MAX_COUNT", &mut c.reprice_max_count);
        f64_var("TIDEBOT_REPRICE_MAX_DRIFT_BPS", &mut c.reprice_max_drift_bps);
        f64_var("TIDEBOT_REPRICE_MIN_IMPROV_TICKS", &mut c.reprice_min_improv_ticks);
        f64_var("TIDEBOT_REPRICE_MIN_EDGE_USD", &mut c.reprice_min_edge_usd);

        usize_var("TIDEBOT_MAX_CONCURRENT_LOTS", &mut c.max_concurrent_lots);
        usize_var("TIDEBOT_EXIT_HISTORY_SIZE", &mut c.exit_history_size);
        bool_var("TIDEBOT_PERSIST_STATE", &mut c.persist_state);
        string_var("TIDEBOT_STATE_FILE", &mut c.state_file);
        bool_var("TIDEBOT_DRY_RUN", &mut c.dry_run);
        usize_var("TIDEBOT_MAX_HISTORY_CANDLES", &mut c.max_history_candles);

        f64_var("TIDEBOT_BUY_THRESHOLD", &mut c.buy_threshold);
        f64_var("TIDEBOT_SELL_THRESHOLD", &mut c.sell_threshold);
        bool_var("TIDEBOT_USE_MA_FILTER", &mut c.use_ma_filter);
        string_var("TIDEBOT_MODEL_FILE", &mut c.model_file);
        string_var("TIDEBOT_EXTENDED_MODEL_FILE", &mut c.extended_model_file);

        c
    }

    /// Effective order floor: venue min-notional wins when configured.
    pub fn min_order_usd(&self) -> f64 {
        if self.min_notional > 0.0 {
            self.min_notional.max(self.order_min_usd)
        } else {
            self.order_min_usd
        }
    }

    /// Maker-first entry is only attempted with a positive offset and timeout.
    pub fn maker_first_enabled(&self) -> bool {
        self.order_type == "limit" && self.limit_price_offset_bps > 0.0 && self.limit_timeout_sec > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_sane() {
        let c = Config::default();
        assert!(c.maker_first_enabled());
        assert!(c.min_order_usd() >= c.min_notional);
        assert!(c.fee_rate_pct > 0.0);
    }

    #[test]
    fn test_min_order_prefers_notional() {
        let mut c = Config::default();
        c.min_notional = 25.0;
        c.order_min_usd = 10.0;
        assert!((c.min_order_usd() - 25.0).abs() < 1e-9);
        c.min_notional = 0.0;
        assert!((c.min_order_usd() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_market_mode_disables_maker_first() {
        let mut c = Config::default();
        c.order_type = "market".to_string();
        assert!(!c.maker_first_enabled());
        c.order_type = "limit".to_string();
        c.limit_price_offset_bps = 0.0;
        assert!(!c.maker_first_enabled());
    }
}
