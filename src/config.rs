// =============================================================================
// Runtime Configuration — typed .env settings, grouped by concern
// =============================================================================
//
// Every tunable of the runtime lives here, parsed once at boot. Missing
// required keys abort startup with a non-zero exit; everything else falls
// back to the defaults below, which are also what the startup summary logs.
// =============================================================================

use anyhow::{bail, Result};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Env parse helpers
// ---------------------------------------------------------------------------

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_f64(key: &str, default: f64) -> f64 {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %v, "unparseable float in env, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %v, "unparseable int in env, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env_i64(key, default as i64).max(0) as usize
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"),
        Err(_) => default,
    }
}

/// Parse up to three floats from CSV or a bracketed list ("0.8,1.4,2.2" or
/// "[0.8, 1.4, 2.2]"). Falls back to `default` when nothing parses.
fn env_floats_csv(key: &str, default: [f64; 3]) -> [f64; 3] {
    let raw = match std::env::var(key) {
        Ok(v) => v,
        Err(_) => return default,
    };
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);
    let parsed: Vec<f64> = inner
        .split(',')
        .filter_map(|t| t.trim().parse().ok())
        .take(3)
        .collect();
    if parsed.len() == 3 {
        [parsed[0], parsed[1], parsed[2]]
    } else {
        warn!(key, value = %raw, "expected 3 floats, using default");
        default
    }
}

fn env_required(key: &str) -> Result<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => bail!("missing required env: {key}"),
    }
}

// ---------------------------------------------------------------------------
// Grouped settings
// ---------------------------------------------------------------------------

/// Position sizing knobs.
#[derive(Debug, Clone)]
pub struct SizingConfig {
    /// "capital_frac" | "risk_r" | "both".
    pub mode: String,
    pub capital_fraction: f64,
    pub max_leverage: f64,
    pub risk_pct: f64,
    /// Minimum SL distance as a fraction of entry for per-unit-loss math.
    pub min_sl_frac: f64,
    /// Absolute minimum SL distance in quote units.
    pub min_sl_abs: f64,
    pub min_qty: f64,
    pub max_qty: f64,
    /// Exchange notional floor; 0 disables.
    pub notional_min: f64,
    pub paper_start_balance: f64,
    pub paper_use_start_balance: bool,
}

/// Stop-loss construction and guard rails.
#[derive(Debug, Clone)]
pub struct SlConfig {
    /// Rails as fractions of entry (e.g. 0.0045 = 0.45%).
    pub min_sl_pct: f64,
    pub max_sl_pct: f64,
    /// Blend of ATR pad vs 1m-noise pad.
    pub mix_alpha: f64,
    pub atr_mult: f64,
    pub noise_mult: f64,
    pub noise_bars_1m: usize,
    /// Min-gap components applied by the unified guard.
    pub min_gap_atr_mult: f64,
    pub min_gap_pct: f64,
    pub min_buffer_atr: f64,
    pub min_step_atr: f64,
    pub tighten_cooldown_s: i64,
    /// Consecutive 1m closes beyond SL required before closing; 0 = touch.
    pub close_confirm_bars: usize,
    /// Freeze all SL movement before TP1 unless BE is explicitly allowed.
    pub freeze_before_tp1: bool,
}

/// Take-profit ladder construction.
#[derive(Debug, Clone)]
pub struct TpConfig {
    /// "atr" | "r".
    pub mode: String,
    pub atr_mults: [f64; 3],
    pub r_mults: [f64; 3],
    pub min_r_mult: f64,
    /// Preferred absolute TP1 distance in price units (TASER).
    pub tp1_abs: f64,
    pub mode_adapt: bool,
    pub chop_atr_pct_max: f64,
    pub chop_adx_max: f64,
    pub chop_atr_mults: [f64; 3],
    pub rally_atr_mults: [f64; 3],
    pub structured: bool,
    pub fractions: [f64; 3],
    pub chop_fractions: [f64; 3],
    pub rally_fractions: [f64; 3],
    /// TP replace de-jitter threshold (absolute).
    pub eps: f64,
    pub extend_cooldown_s: i64,
    /// Consecutive 1m closes beyond a TP before a hit counts; 0 = touch.
    pub hit_confirm_bars: usize,
}

/// TrendScalp engine knobs.
#[derive(Debug, Clone)]
pub struct ScalpConfig {
    pub enabled: bool,
    pub neighbors: usize,
    pub max_back: usize,
    pub feature_count: usize,
    pub warmup_bars: usize,
    pub tl_lookback: usize,
    /// "atr" | "linreg" | "stdev".
    pub tl_slope_method: String,
    pub tl_slope_mult: f64,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub trend_slope_len: usize,
    pub trend_slope_min: f64,
    pub vol_floor_pct: f64,
    pub adx_min: f64,
    pub adx_soft: f64,
    pub adx_slope_bonus: f64,
    pub override_ema_rsi: bool,
    pub ma_buffer_pct: f64,
    pub ma_require_15m: bool,
    pub rsi15_neutral_lo: f64,
    pub rsi15_neutral_hi: f64,
    pub rsi_overheat_hi: f64,
    pub rsi_overheat_lo: f64,
    pub use_rsi_filter: bool,
    pub use_regime_filter: bool,
    pub require_both: bool,
    pub pullback_pct: f64,
    pub wai_min: f64,
    pub tl_width_atr_mult: f64,
    pub adapt_regime: bool,
    pub adapt_adx1: f64,
    pub adapt_adx2: f64,
    pub adapt_mult1: f64,
    pub adapt_mult2: f64,
    /// "trendline" | "structural".
    pub stop_mode: String,
    pub reentry_cooldown_bars_5m: usize,
}

/// CHOP/RUNNER hysteresis thresholds plus regime-driven manage behavior.
#[derive(Debug, Clone)]
pub struct RegimeConfig {
    pub auto: bool,
    pub adx_up: f64,
    pub adx_dn: f64,
    /// ATR% thresholds as fractions of price.
    pub atr_up: f64,
    pub atr_dn: f64,
    pub partial_tp1: f64,
}

/// Milestone SL ratchet and post-TP2 trailing.
#[derive(Debug, Clone)]
pub struct MilestoneConfig {
    pub enabled: bool,
    pub step_r: f64,
    pub lock_delta_r: f64,
    pub tp2_lock_fracr: f64,
    pub post_tp2_atr_mult: f64,
    pub abs_lock_usd: f64,
    pub post_tp1_delay_bars: usize,
    /// "fracR" | "structure".
    pub trail_style: String,
    pub tp1_lock_fracr: f64,
    pub tp2_lock_fracr_trail: f64,
    pub tp1_lock_atr_mult: f64,
    pub tp2_lock_atr_mult: f64,
    pub be_eps_atr_mult: f64,
    /// Chandelier windows (bars) and ATR pads per phase.
    pub chand_n_pre_tp2: usize,
    pub chand_k_pre_tp2: f64,
    pub chand_n_post_tp2: usize,
    pub chand_k_post_tp2: f64,
    pub chand_n_post_tp3: usize,
    pub chand_k_post_tp3: f64,
    /// Momentum-stall take.
    pub stall_bars: usize,
    pub stall_near_tp_atr: f64,
    pub stall_rsi_confirm: bool,
    pub stall_tp_eps: f64,
}

/// Post-Entry-Validity guard thresholds.
#[derive(Debug, Clone)]
pub struct PevConfig {
    pub enabled: bool,
    pub grace_bars_5m: usize,
    pub grace_min_s: i64,
    pub adx_min: f64,
    pub atr_floor_pct: f64,
    pub adx_slope_bonus: f64,
    pub ema_tol_pct: f64,
}

/// Giveback guard (surrendered-MFE exit).
#[derive(Debug, Clone)]
pub struct GivebackConfig {
    pub arm_r: f64,
    pub frac: f64,
}

/// Heatmap binning, decay, and confluence gating.
#[derive(Debug, Clone)]
pub struct HeatmapConfig {
    pub bin_pct_min: f64,
    pub bin_atr_frac: f64,
    pub dwell_alpha: f64,
    pub half_life_5m: f64,
    pub half_life_15m: f64,
    pub half_life_1h: f64,
    pub half_life_1d: f64,
    pub top_k: usize,
    pub min_spacing_bins: usize,
    pub retention_days: i64,
}

/// TASER fallback-rule thresholds.
#[derive(Debug, Clone)]
pub struct TaserConfig {
    pub rsi_ob: f64,
    pub near_pdh_pct: f64,
    pub near_avwap_pct: f64,
    pub near_vwap_pct_min: f64,
    pub near_vwap_pct_max: f64,
    pub vwap_reclaim_atr_mult: f64,
    pub atr_near_mult: f64,
    pub avoid_enabled: bool,
    pub avoid_lookback_bars: usize,
    pub chop_min_flips: usize,
    pub chop_max_width_pct: f64,
    pub conf_max_spread_pct: f64,
}

/// Scheduler cadence and re-entry hygiene.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub scan_interval_s: f64,
    pub manage_poll_s: f64,
    pub single_position: bool,
    pub require_new_bar: bool,
    pub min_reentry_s: i64,
    pub block_reentry_pct: f64,
    pub engine_order: Vec<String>,
    /// "conservative" | "balanced" | "aggressive".
    pub aggression: String,
    pub engine_cooldown_after_2_sl_min: i64,
    pub check_pos_every_s: i64,
}

/// Fees and break-even padding.
#[derive(Debug, Clone)]
pub struct FeeConfig {
    /// Per-side fee on notional.
    pub fee_pct: f64,
    pub fee_pad_mult: f64,
    /// Round-trip cushion applied to BE floors.
    pub fees_pct_pad: f64,
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub pair: String,
    pub dry_run: bool,
    pub db_path: String,
    pub exchange_id: String,
    pub delta_base_url: String,
    pub delta_api_key: String,
    pub delta_api_secret: String,
    pub tg_bot_token: String,
    pub tg_chat_id: String,
    pub tg_min_interval_s: i64,

    pub sizing: SizingConfig,
    pub sl: SlConfig,
    pub tp: TpConfig,
    pub scalp: ScalpConfig,
    pub regime: RegimeConfig,
    pub milestone: MilestoneConfig,
    pub pev: PevConfig,
    pub giveback: GivebackConfig,
    pub heatmap: HeatmapConfig,
    pub taser: TaserConfig,
    pub scheduler: SchedulerConfig,
    pub fees: FeeConfig,
}

impl Config {
    /// Parse the full configuration from the process environment.
    ///
    /// Fatal when `PAIR` is missing, or when `DRY_RUN=false` without venue
    /// credentials.
    pub fn from_env() -> Result<Self> {
        let pair = env_required("PAIR")?;
        let dry_run = env_bool("DRY_RUN", true);

        let delta_api_key = env_str("DELTA_API_KEY", "");
        let delta_api_secret = env_str("DELTA_API_SECRET", "");
        if !dry_run && (delta_api_key.is_empty() || delta_api_secret.is_empty()) {
            bail!("DRY_RUN=false requires DELTA_API_KEY and DELTA_API_SECRET");
        }

        let engine_order = env_str("ENGINE_ORDER", "trendscalp")
            .split(',')
            .map(|s| normalize_engine(s))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        let engine_order = dedup_preserving(engine_order);

        let mut cfg = Self {
            pair,
            dry_run,
            db_path: env_str("DB_PATH", "helix.db"),
            exchange_id: env_str("EXCHANGE_ID", "delta"),
            delta_base_url: env_str("DELTA_BASE_URL", "https://api.india.delta.exchange"),
            delta_api_key,
            delta_api_secret,
            tg_bot_token: env_str("TG_BOT_TOKEN", ""),
            tg_chat_id: env_str("TG_CHAT_ID", ""),
            tg_min_interval_s: env_i64("TG_MIN_INTERVAL_S", 20),

            sizing: SizingConfig {
                mode: env_str("SIZING_MODE", "capital_frac").to_lowercase(),
                capital_fraction: env_f64("CAPITAL_FRACTION", 0.5),
                max_leverage: env_f64("MAX_LEVERAGE", 1.0).max(1.0),
                risk_pct: env_f64("RISK_PCT", 0.5),
                min_sl_frac: env_f64("MIN_SL_FRAC", 0.0),
                min_sl_abs: env_f64("MIN_SL_ABS", 0.0),
                min_qty: env_f64("MIN_QTY", 1.0),
                max_qty: env_f64("MAX_QTY", 1500.0),
                notional_min: env_f64("NOTIONAL_MIN", 0.0),
                paper_start_balance: env_f64("PAPER_START_BALANCE", 1000.0),
                paper_use_start_balance: env_bool("PAPER_USE_START_BALANCE", false),
            },
            sl: SlConfig {
                min_sl_pct: env_f64("MIN_SL_PCT", 0.0045),
                max_sl_pct: env_f64("MAX_SL_PCT", 0.0120),
                mix_alpha: env_f64("SL_MIX_ALPHA", 0.55),
                atr_mult: env_f64("SL_ATR_MULT", 0.80),
                noise_mult: env_f64("SL_NOISE_MULT", 1.90),
                noise_bars_1m: env_usize("SL_NOISE_BARS_1M", 10),
                min_gap_atr_mult: env_f64("SL_MIN_GAP_ATR_MULT", 0.35),
                min_gap_pct: env_f64("SL_MIN_GAP_PCT", 0.0012),
                min_buffer_atr: env_f64("TS_SL_MIN_BUFFER_ATR", 0.20),
                min_step_atr: env_f64("TS_SL_MIN_STEP_ATR", 0.05),
                tighten_cooldown_s: env_i64("SL_TIGHTEN_COOLDOWN_SEC", 55),
                close_confirm_bars: env_usize("SL_CLOSE_CONFIRM_BARS", 0),
                freeze_before_tp1: env_bool("GLOBAL_NO_TRAIL_BEFORE_TP1", true),
            },
            tp: TpConfig {
                mode: env_str("TP_MODE", "atr").to_lowercase(),
                atr_mults: [
                    env_f64("TP1_ATR_MULT", 0.60),
                    env_f64("TP2_ATR_MULT", 1.00),
                    env_f64("TP3_ATR_MULT", 1.50),
                ],
                r_mults: env_floats_csv("TP_R_MULTIS", [0.8, 1.4, 2.2]),
                min_r_mult: env_f64("MIN_R_MULT", 1.4),
                tp1_abs: env_f64("TP1_ABS", 0.50),
                mode_adapt: env_bool("MODE_ADAPT_ENABLED", false),
                chop_atr_pct_max: env_f64("MODE_CHOP_ATR_PCT_MAX", 0.0025),
                chop_adx_max: env_f64("MODE_CHOP_ADX_MAX", 25.0),
                chop_atr_mults: env_floats_csv("MODE_CHOP_TP_ATR_MULTS", [0.60, 1.00, 1.50]),
                rally_atr_mults: env_floats_csv("MODE_RALLY_TP_ATR_MULTS", [0.90, 1.60, 2.60]),
                structured: env_bool("TS_TP_STRUCTURED", false),
                fractions: env_floats_csv("TP_FRACTIONS", [0.30, 0.30, 0.40]),
                chop_fractions: env_floats_csv("MODE_CHOP_TP_FRACS", [0.50, 0.30, 0.20]),
                rally_fractions: env_floats_csv("MODE_RALLY_TP_FRACS", [0.30, 0.30, 0.40]),
                eps: env_f64("TP_EPS", 0.01),
                extend_cooldown_s: env_i64("TP_EXTEND_COOLDOWN_SEC", 55),
                hit_confirm_bars: env_usize("TP_HIT_CONFIRM_BARS", 0),
            },
            scalp: ScalpConfig {
                enabled: env_bool("TRENDSCALP_ENABLED", true),
                neighbors: env_usize("TS_NEIGHBORS", 8),
                max_back: env_usize("TS_MAX_BACK", 2000),
                feature_count: env_usize("TS_FEATURE_COUNT", 5).clamp(2, 5),
                warmup_bars: env_usize("WARMUP_BARS", 600),
                tl_lookback: env_usize("TS_TL_LOOKBACK", 14),
                tl_slope_method: env_str("TS_TL_SLOPE_METHOD", "atr").to_lowercase(),
                tl_slope_mult: env_f64("TS_TL_SLOPE_MULT", 1.0),
                ema_fast: env_usize("TS_EMA_FAST", 8),
                ema_slow: env_usize("TS_EMA_SLOW", 20),
                trend_slope_len: env_usize("TS_TREND_SLOPE_LEN", 25),
                trend_slope_min: env_f64("TS_TREND_SLOPE_MIN", 0.0),
                vol_floor_pct: env_f64("TS_VOL_FLOOR_PCT", 0.0020),
                adx_min: env_f64("TS_ADX_MIN", 20.0),
                adx_soft: env_f64("TS_ADX_SOFT", 15.0),
                adx_slope_bonus: env_f64("TS_ADX_SLOPE_BONUS", 2.0),
                override_ema_rsi: env_bool("TS_OVERRIDE_EMA_RSI", false),
                ma_buffer_pct: env_f64("TS_MA_BUFFER_PCT", 0.0015),
                ma_require_15m: env_bool("TS_MA_REQUIRE_15M", false),
                rsi15_neutral_lo: env_f64("TS_RSI15_NEUTRAL_LO", 45.0),
                rsi15_neutral_hi: env_f64("TS_RSI15_NEUTRAL_HI", 55.0),
                rsi_overheat_hi: env_f64("TS_RSI_OVERHEAT_HI", 65.0),
                rsi_overheat_lo: env_f64("TS_RSI_OVERHEAT_LO", 35.0),
                use_rsi_filter: env_bool("TS_USE_RSI_FILTER", true),
                use_regime_filter: env_bool("TS_USE_REGIME_FILTER", true),
                require_both: env_bool("TS_REQUIRE_BOTH", true),
                pullback_pct: env_f64("TS_PULLBACK_PCT", 0.0025),
                wai_min: env_f64("TS_WAI_MIN", 0.6),
                tl_width_atr_mult: env_f64("TS_TL_WIDTH_ATR_MULT", 0.5),
                adapt_regime: env_bool("TS_ADAPT_REGIME", true),
                adapt_adx1: env_f64("TS_ADAPT_ADX1", 30.0),
                adapt_adx2: env_f64("TS_ADAPT_ADX2", 40.0),
                adapt_mult1: env_f64("TS_ADAPT_MULT1", 0.35),
                adapt_mult2: env_f64("TS_ADAPT_MULT2", 0.25),
                stop_mode: env_str("TS_STOP_MODE", "trendline").to_lowercase(),
                reentry_cooldown_bars_5m: env_usize("REENTRY_COOLDOWN_BARS_5M", 1),
            },
            regime: RegimeConfig {
                auto: env_bool("TS_REGIME_AUTO", true),
                adx_up: env_f64("TS_ADX_UP", 26.0),
                adx_dn: env_f64("TS_ADX_DN", 23.0),
                atr_up: env_f64("TS_ATR_UP", 0.0040),
                atr_dn: env_f64("TS_ATR_DN", 0.0035),
                partial_tp1: env_f64("TS_PARTIAL_TP1", 0.5),
            },
            milestone: MilestoneConfig {
                enabled: env_bool("TS_MILESTONE_MODE", true),
                step_r: env_f64("TS_MS_STEP_R", 0.5),
                lock_delta_r: env_f64("TS_MS_LOCK_DELTA_R", 0.25),
                tp2_lock_fracr: env_f64("TS_TP2_LOCK_FRACR", 0.70),
                post_tp2_atr_mult: env_f64("TS_POST_TP2_ATR_MULT", 0.50),
                abs_lock_usd: env_f64("SCALP_ABS_LOCK_USD", 0.0),
                post_tp1_delay_bars: env_usize("POST_TP1_SL_DELAY_BARS", 3),
                trail_style: env_str("TRAIL_STYLE", "fracR").to_string(),
                tp1_lock_fracr: env_f64("TP1_LOCK_FRACR", 0.65),
                tp2_lock_fracr_trail: env_f64("TP2_LOCK_FRACR", 0.75),
                tp1_lock_atr_mult: env_f64("TP1_LOCK_ATR_MULT", 0.25),
                tp2_lock_atr_mult: env_f64("TP2_LOCK_ATR_MULT", 0.35),
                be_eps_atr_mult: env_f64("BE_EPS_ATR_MULT", 0.10),
                chand_n_pre_tp2: env_usize("CHAND_N_PRE_TP2", 9),
                chand_k_pre_tp2: env_f64("CHAND_K_PRE_TP2", 1.2),
                chand_n_post_tp2: env_usize("CHAND_N_POST_TP2", 7),
                chand_k_post_tp2: env_f64("CHAND_K_POST_TP2", 0.8),
                chand_n_post_tp3: env_usize("CHAND_N_POST_TP3", 5),
                chand_k_post_tp3: env_f64("CHAND_K_POST_TP3", 0.6),
                stall_bars: env_usize("STALL_BARS", 3),
                stall_near_tp_atr: env_f64("STALL_NEAR_TP_ATR", 0.50),
                stall_rsi_confirm: env_bool("STALL_RSI_CONFIRM", true),
                stall_tp_eps: env_f64("STALL_TP_EPS", 0.02),
            },
            pev: PevConfig {
                enabled: env_bool("PEV_ENABLED", true),
                grace_bars_5m: env_usize("PEV_GRACE_BARS_5M", 2),
                grace_min_s: env_i64("PEV_GRACE_MIN_S", 300),
                adx_min: env_f64("TS_ADX_MIN", 20.0),
                atr_floor_pct: env_f64("TS_ATR_FLOOR_PCT", 0.0015),
                adx_slope_bonus: env_f64("TS_ADX_SLOPE_BONUS", 2.0),
                ema_tol_pct: env_f64("EMA_TOL_PCT", 0.0015),
            },
            giveback: GivebackConfig {
                arm_r: env_f64("TS_GIVEBACK_ARM_R", 1.5),
                frac: env_f64("TS_GIVEBACK_FRAC", 0.25),
            },
            heatmap: HeatmapConfig {
                bin_pct_min: env_f64("HM_BIN_PCT_MIN", 0.0005),
                bin_atr_frac: env_f64("HM_BIN_ATR_FRAC", 0.25),
                dwell_alpha: env_f64("HM_DWELL_ALPHA", 0.70),
                half_life_5m: env_f64("HM_HALF_LIFE_5M", 120.0),
                half_life_15m: env_f64("HM_HALF_LIFE_15M", 120.0),
                half_life_1h: env_f64("HM_HALF_LIFE_1H", 96.0),
                half_life_1d: env_f64("HM_HALF_LIFE_1D", 30.0),
                top_k: env_usize("HM_TOP_K", 24),
                min_spacing_bins: env_usize("HM_MIN_SPACING_BINS", 2),
                retention_days: env_i64("HEATMAP_RETENTION_DAYS", 90),
            },
            taser: TaserConfig {
                rsi_ob: env_f64("RSI_OB", 70.0),
                near_pdh_pct: env_f64("NEAR_PDH_PCT", 0.0015),
                near_avwap_pct: env_f64("NEAR_AVWAP_PCT", 0.0015),
                near_vwap_pct_min: env_f64("NEAR_VWAP_PCT_MIN", 0.0008),
                near_vwap_pct_max: env_f64("NEAR_VWAP_PCT_MAX", 0.0030),
                vwap_reclaim_atr_mult: env_f64("VWAP_RECLAIM_ATR_MULT", 0.25),
                atr_near_mult: env_f64("ATR_NEAR_MULT", 0.25),
                avoid_enabled: env_bool("DYN_AVOID_ENABLED", true),
                avoid_lookback_bars: env_usize("AVOID_LOOKBACK_BARS", 120),
                chop_min_flips: env_usize("CHOP_MIN_FLIPS", 12),
                chop_max_width_pct: env_f64("CHOP_MAX_WIDTH_PCT", 0.006),
                conf_max_spread_pct: env_f64("CONF_MAX_SPREAD_PCT", 0.004),
            },
            scheduler: SchedulerConfig {
                scan_interval_s: env_f64("SCAN_INTERVAL_SECONDS", 2.0),
                manage_poll_s: env_f64("MANAGE_POLL_SECONDS", 5.0),
                single_position: env_bool("SINGLE_POSITION_MODE", true),
                require_new_bar: env_bool("REQUIRE_NEW_BAR", true),
                min_reentry_s: env_i64("MIN_REENTRY_SECONDS", 60),
                block_reentry_pct: env_f64("BLOCK_REENTRY_PCT", 0.003),
                engine_order: if engine_order.is_empty() {
                    vec!["trendscalp".to_string()]
                } else {
                    engine_order
                },
                aggression: env_str("AGGRESSION", "balanced").to_lowercase(),
                engine_cooldown_after_2_sl_min: env_i64("ENGINE_COOLDOWN_AFTER_2_SL_MIN", 15),
                check_pos_every_s: env_i64("TS_CHECK_POS_EVERY_S", 10),
            },
            fees: FeeConfig {
                fee_pct: env_f64("FEE_PCT", 0.0005),
                fee_pad_mult: env_f64("FEE_PAD_MULT", 2.0),
                fees_pct_pad: env_f64("FEES_PCT_PAD", 0.0007),
            },
        };

        // LIVE sizing must use free margin, never the paper start balance.
        if !cfg.dry_run && cfg.sizing.paper_use_start_balance {
            cfg.sizing.paper_use_start_balance = false;
            info!("DRY_RUN=false — forcing PAPER_USE_START_BALANCE=false");
        }

        Ok(cfg)
    }

    /// Log the effective configuration at startup. These values are the
    /// authoritative defaults for every knob.
    pub fn log_summary(&self) {
        info!(
            pair = %self.pair,
            dry_run = self.dry_run,
            exchange = %self.exchange_id,
            db = %self.db_path,
            engine_order = ?self.scheduler.engine_order,
            aggression = %self.scheduler.aggression,
            "config: runtime"
        );
        info!(
            scan_s = self.scheduler.scan_interval_s,
            manage_s = self.scheduler.manage_poll_s,
            single_position = self.scheduler.single_position,
            require_new_bar = self.scheduler.require_new_bar,
            min_reentry_s = self.scheduler.min_reentry_s,
            block_reentry_pct = self.scheduler.block_reentry_pct,
            "config: scheduler"
        );
        info!(
            mode = %self.sizing.mode,
            capital_fraction = self.sizing.capital_fraction,
            risk_pct = self.sizing.risk_pct,
            max_leverage = self.sizing.max_leverage,
            min_qty = self.sizing.min_qty,
            max_qty = self.sizing.max_qty,
            "config: sizing"
        );
        info!(
            min_sl_pct = self.sl.min_sl_pct,
            max_sl_pct = self.sl.max_sl_pct,
            mix_alpha = self.sl.mix_alpha,
            atr_mult = self.sl.atr_mult,
            noise_mult = self.sl.noise_mult,
            tighten_cooldown_s = self.sl.tighten_cooldown_s,
            "config: stop-loss"
        );
        info!(
            mode = %self.tp.mode,
            atr_mults = ?self.tp.atr_mults,
            r_mults = ?self.tp.r_mults,
            mode_adapt = self.tp.mode_adapt,
            structured = self.tp.structured,
            "config: take-profit"
        );
        info!(
            neighbors = self.scalp.neighbors,
            warmup_bars = self.scalp.warmup_bars,
            adx_min = self.scalp.adx_min,
            vol_floor_pct = self.scalp.vol_floor_pct,
            require_both = self.scalp.require_both,
            stop_mode = %self.scalp.stop_mode,
            "config: trendscalp"
        );
        info!(
            auto = self.regime.auto,
            adx_up = self.regime.adx_up,
            adx_dn = self.regime.adx_dn,
            atr_up = self.regime.atr_up,
            atr_dn = self.regime.atr_dn,
            partial_tp1 = self.regime.partial_tp1,
            "config: regime"
        );
        info!(
            milestone = self.milestone.enabled,
            step_r = self.milestone.step_r,
            lock_delta_r = self.milestone.lock_delta_r,
            tp2_lock_fracr = self.milestone.tp2_lock_fracr,
            pev_enabled = self.pev.enabled,
            giveback_arm_r = self.giveback.arm_r,
            "config: manage"
        );
    }
}

fn normalize_engine(raw: &str) -> String {
    match raw.trim().to_lowercase().as_str() {
        "trendscalp" | "scalp" | "ts" | "trend_scalp" => "trendscalp".to_string(),
        "taser" | "rules" | "directional" => "taser".to_string(),
        other => other.to_string(),
    }
}

fn dedup_preserving(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|e| seen.insert(e.clone())).collect()
}
