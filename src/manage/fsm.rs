// =============================================================================
// Manager FSM — pure proposal logic (no venue or notification side-effects)
// =============================================================================
//
// The tick loop feeds a Context snapshot in and gets back tighten-only SL
// candidates and a refreshed TP ladder. Everything here is deterministic so
// the milestone trajectory and trail behavior are directly testable.
// =============================================================================

use crate::config::{Config, FeeConfig, MilestoneConfig};
use crate::guards::{abs_lock_from_entry, be_floor, min_gap_px, round4, trail_fracr};
use crate::indicators::rsi::rsi_slope;
use crate::tp_calc::{clamp_tp1_ladder, ensure_order, ladder_regime, LadderRegime};
use crate::types::{EmaSide, EntrySnapshot, Side, StructureFlag, TfSeries};

/// Per-tick snapshot the FSM reasons over.
pub struct Context<'a> {
    pub price: f64,
    pub side: Side,
    pub entry: f64,
    pub sl: f64,
    pub tp1: Option<f64>,
    pub tp2: Option<f64>,
    pub tp3: Option<f64>,
    pub tf1m: &'a TfSeries,
    pub rsi14_1m: &'a [f64],
    pub atr5: f64,
    pub adx14: f64,
    pub hit_tp1: bool,
    pub hit_tp2: bool,
    pub hit_tp3: bool,
    pub bars_since_tp1: usize,
    pub mfe_abs: f64,
}

/// Tighten-only SL and refreshed ladder for the caller to apply.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub sl: Option<f64>,
    pub tps: Vec<f64>,
    pub why: String,
}

// ---------------------------------------------------------------------------
// Entry snapshot
// ---------------------------------------------------------------------------

/// Capture the reasons-for-entry at fill time.
pub fn entry_snapshot(
    side: Side,
    price: f64,
    atr5: f64,
    adx14: f64,
    ema200_5m: Option<f64>,
    structure_ok: Option<bool>,
    ts_ms: i64,
) -> EntrySnapshot {
    let ema200_side = match ema200_5m {
        Some(e) if price >= e => EmaSide::Above,
        Some(_) => EmaSide::Below,
        None => EmaSide::Na,
    };
    let structure = match structure_ok {
        Some(true) => StructureFlag::Ok,
        Some(false) => StructureFlag::Fail,
        None => StructureFlag::Na,
    };
    EntrySnapshot {
        side,
        adx_at_entry: adx14,
        atr_pct_at_entry: if price > 0.0 { atr5 / price } else { 0.0 },
        ema200_side,
        structure,
        ts_at_entry: ts_ms,
    }
}

// ---------------------------------------------------------------------------
// Hard invalidation
// ---------------------------------------------------------------------------

/// Diagnostics of the composite hard-invalidation check.
#[derive(Debug, Clone)]
pub struct HardDiag {
    pub hard: bool,
    pub ema_side_ok: bool,
    pub struct_break: bool,
    pub swing_high: Option<f64>,
    pub swing_low: Option<f64>,
    pub pad: f64,
}

fn ema_side_ok(price: f64, ema: Option<f64>, side: Side, tol_pct: f64) -> bool {
    let Some(e) = ema else {
        return true; // unknown never blocks
    };
    let within_tol = (price - e).abs() / e.max(1e-9) <= tol_pct;
    if side.is_long() {
        price >= e || within_tol
    } else {
        price <= e || within_tol
    }
}

/// Structure window and ATR pad for the current TP phase — the chandelier
/// parameters tighten across TP2 and TP3.
fn phase_window(hit_tp2: bool, hit_tp3: bool, ms: &MilestoneConfig) -> (usize, f64) {
    if hit_tp3 {
        (ms.chand_n_post_tp3, ms.chand_k_post_tp3)
    } else if hit_tp2 {
        (ms.chand_n_post_tp2, ms.chand_k_post_tp2)
    } else {
        (ms.chand_n_pre_tp2, ms.chand_k_pre_tp2)
    }
}

fn swing_levels(tf1m: &TfSeries, n: usize) -> (Option<f64>, Option<f64>) {
    if n == 0 || tf1m.len() < n {
        return (None, None);
    }
    let hi = tf1m.high[tf1m.len() - n..]
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let lo = tf1m.low[tf1m.len() - n..]
        .iter()
        .copied()
        .fold(f64::INFINITY, f64::min);
    (Some(hi), Some(lo))
}

/// Hard invalidation: 200-EMA side flip against the position (5m OR 15m,
/// within tolerance) AND a structural break of the recent swing with an
/// ATR pad. Both must hold.
#[allow(clippy::too_many_arguments)]
pub fn hard_invalidation(
    price: f64,
    side: Side,
    ema200_5m: Option<f64>,
    ema200_15m: Option<f64>,
    atr5: f64,
    tf1m: &TfSeries,
    hit_tp2: bool,
    hit_tp3: bool,
    cfg: &Config,
) -> HardDiag {
    let tol = cfg.pev.ema_tol_pct;
    let ema_ok = ema_side_ok(price, ema200_5m, side, tol) && ema_side_ok(price, ema200_15m, side, tol);

    let (n, k) = phase_window(hit_tp2, hit_tp3, &cfg.milestone);
    let (swing_high, swing_low) = swing_levels(tf1m, n);
    let pad = k * atr5;
    let struct_break = if side.is_long() {
        swing_low.map_or(false, |sl| price < sl - pad)
    } else {
        swing_high.map_or(false, |sh| price > sh + pad)
    };

    HardDiag {
        hard: !ema_ok && struct_break,
        ema_side_ok: ema_ok,
        struct_break,
        swing_high,
        swing_low,
        pad,
    }
}

// ---------------------------------------------------------------------------
// Milestone ratchet
// ---------------------------------------------------------------------------

/// Number of full milestones already locked, so a re-run at the same price
/// never re-proposes an old level.
#[derive(Debug, Default, Clone, Copy)]
pub struct MilestoneState {
    pub last_k: usize,
}

/// Milestone-mode SL candidate for the current tick, or None when milestone
/// mode proposes nothing beyond the current stop.
///
/// Pre-TP1: only the absolute-$ insurance lock (to BE+fees) once MFE covers
/// it. After TP1: floor at BE+fees, then `+k * lock_delta_r * R` above BE for
/// every `step_r * R` of progress beyond TP1. After TP2: jump to
/// `entry + tp2_lock_fracr * (tp2 - entry)` and trail by ATR.
pub fn milestone_candidate(
    ctx: &Context<'_>,
    r_init: f64,
    state: &mut MilestoneState,
    ms: &MilestoneConfig,
    fees: &FeeConfig,
) -> Option<f64> {
    let side = ctx.side;
    let be_price = if side.is_long() {
        ctx.entry * (1.0 + fees.fees_pct_pad)
    } else {
        ctx.entry * (1.0 - fees.fees_pct_pad)
    };
    let mut candidate = ctx.sl;

    if !ctx.hit_tp1 {
        if ms.abs_lock_usd > 0.0 && ctx.mfe_abs >= ms.abs_lock_usd {
            candidate = if side.is_long() {
                candidate.max(be_price)
            } else {
                candidate.min(be_price)
            };
        }
    } else if !ctx.hit_tp2 {
        candidate = if side.is_long() {
            candidate.max(be_price)
        } else {
            candidate.min(be_price)
        };

        if r_init > 0.0 && ms.step_r > 0.0 {
            let step_px = ms.step_r * r_init;
            let tp1 = ctx.tp1.unwrap_or(ctx.entry);
            let prog = if side.is_long() { ctx.price - tp1 } else { tp1 - ctx.price };
            let k = if prog > 0.0 && step_px > 0.0 {
                (prog / step_px).floor() as usize
            } else {
                0
            };
            if k > state.last_k {
                let delta = k as f64 * ms.lock_delta_r * r_init;
                let base = if side.is_long() { be_price + delta } else { be_price - delta };
                candidate = if side.is_long() { candidate.max(base) } else { candidate.min(base) };
                state.last_k = k;
            }
        }
    } else {
        if let Some(tp2) = ctx.tp2 {
            let base = if side.is_long() {
                ctx.entry + ms.tp2_lock_fracr * (tp2 - ctx.entry)
            } else {
                ctx.entry - ms.tp2_lock_fracr * (ctx.entry - tp2)
            };
            candidate = if side.is_long() { candidate.max(base) } else { candidate.min(base) };
        }
        if ctx.atr5 > 0.0 {
            let trail = if side.is_long() {
                ctx.price - ms.post_tp2_atr_mult * ctx.atr5
            } else {
                ctx.price + ms.post_tp2_atr_mult * ctx.atr5
            };
            candidate = if side.is_long() { candidate.max(trail) } else { candidate.min(trail) };
        }
    }

    let improved = if side.is_long() { candidate > ctx.sl } else { candidate < ctx.sl };
    improved.then_some(round4(candidate))
}

// ---------------------------------------------------------------------------
// Giveback guard
// ---------------------------------------------------------------------------

/// Exit when an armed trade has surrendered too much of its MFE while the
/// classifier confidence is falling.
pub fn giveback_exit(mfe_r: f64, curr_r: f64, ml_slope: f64, arm_r: f64, frac: f64) -> bool {
    mfe_r >= arm_r && ml_slope < 0.0 && curr_r <= (1.0 - frac) * mfe_r
}

// ---------------------------------------------------------------------------
// Proposal (trail + TP maintenance)
// ---------------------------------------------------------------------------

/// Build the tighten-only SL/TP proposal for one tick.
pub fn propose(ctx: &Context<'_>, cfg: &Config) -> Proposal {
    let side = ctx.side;
    let ms = &cfg.milestone;
    let (tp1, tp2, tp3) = ensure_order(ctx.tp1, ctx.tp2, ctx.tp3, side);
    let atr5 = ctx.atr5;
    let mut sl_new = ctx.sl;

    // ---------- pre-TP1: keep TP1 achievable, never choke the stop ----------
    if !ctx.hit_tp1 && cfg.sl.freeze_before_tp1 {
        let (t1, t2, t3) = clamp_tp1_ladder(ctx.entry, ctx.sl, tp1, tp2, tp3, side, atr5, &cfg.tp);
        return Proposal {
            sl: Some(round4(sl_new)),
            tps: [t1, t2, t3].into_iter().flatten().collect(),
            why: "preTP1_freeze".into(),
        };
    }

    // ---------- shallow BE+eps lock on the TP1 bar itself ----------
    if ctx.hit_tp1 && ctx.bars_since_tp1 == 0 {
        let eps = ms.be_eps_atr_mult * atr5;
        sl_new = be_floor(sl_new, side, ctx.entry, &cfg.fees);
        sl_new = if side.is_long() {
            sl_new.max(ctx.entry + eps)
        } else {
            sl_new.min(ctx.entry - eps)
        };
    }

    // ---------- grace window: hold the stop for the first bars after TP1 ----
    if ctx.hit_tp1 && ctx.bars_since_tp1 < ms.post_tp1_delay_bars {
        let (t1, t2, t3) = clamp_tp1_ladder(ctx.entry, ctx.sl, tp1, tp2, tp3, side, atr5, &cfg.tp);
        return Proposal {
            sl: Some(round4(sl_new)),
            tps: [t1, t2, t3].into_iter().flatten().collect(),
            why: format!("postTP1_grace={}/{}", ctx.bars_since_tp1, ms.post_tp1_delay_bars),
        };
    }

    // ---------- trailing after the grace window ----------
    if ms.trail_style == "structure" {
        let (n, k) = phase_window(ctx.hit_tp2, ctx.hit_tp3, ms);
        let (hh, ll) = swing_levels(ctx.tf1m, n);
        let pad = k * atr5;
        if side.is_long() {
            if let Some(ll) = ll {
                sl_new = sl_new.max(ll - pad);
            }
        } else if let Some(hh) = hh {
            sl_new = sl_new.min(hh + pad);
        }
    } else {
        if let Some(t1) = tp1 {
            sl_new = trail_fracr(
                sl_new,
                side,
                ctx.entry,
                t1,
                ms.tp1_lock_fracr,
                ms.tp1_lock_atr_mult * atr5,
            );
        }
        if let Some(t2) = tp2 {
            sl_new = trail_fracr(
                sl_new,
                side,
                ctx.entry,
                t2,
                ms.tp2_lock_fracr_trail,
                ms.tp2_lock_atr_mult * atr5,
            );
        }
    }

    // ---------- absolute-$ insurance lock ----------
    sl_new = abs_lock_from_entry(
        sl_new,
        side,
        ctx.entry,
        ctx.price,
        ctx.mfe_abs,
        ms.abs_lock_usd,
        &cfg.fees,
    );

    // ---------- momentum-stall take near a remaining target ----------
    let (mut t1, mut t2, mut t3) = (tp1, tp2, tp3);
    if let Some(taken) = stall_take(ctx, [t1, t2, t3], cfg) {
        t1 = Some(taken);
    }

    // ---------- guard: min-gap, BE floor after TP1 ----------
    let gap = min_gap_px(ctx.price, atr5, &cfg.sl);
    sl_new = if side.is_long() {
        sl_new.min(ctx.price - gap)
    } else {
        sl_new.max(ctx.price + gap)
    };
    if ctx.hit_tp1 {
        sl_new = be_floor(sl_new, side, ctx.entry, &cfg.fees);
    }

    // ---------- TP maintenance: clamp, then adaptive widen post-TP1 ----------
    let (c1, c2, c3) = clamp_tp1_ladder(ctx.entry, ctx.sl, t1, t2, t3, side, atr5, &cfg.tp);
    t1 = c1;
    t2 = c2;
    t3 = c3;

    let mut adapt_used = "off";
    if ctx.hit_tp1 && cfg.tp.mode_adapt && atr5 > 0.0 {
        let regime = ladder_regime(ctx.price, atr5, ctx.adx14, &cfg.tp);
        let mults = match regime {
            LadderRegime::Chop => cfg.tp.chop_atr_mults,
            LadderRegime::Rally => cfg.tp.rally_atr_mults,
        };
        adapt_used = match regime {
            LadderRegime::Chop => "chop",
            LadderRegime::Rally => "rally",
        };
        let d2 = mults[1] * atr5;
        let d3 = mults[2] * atr5;
        let (seed2, seed3) = if side.is_long() {
            (ctx.entry + d2, ctx.entry + d3)
        } else {
            (ctx.entry - d2, ctx.entry - d3)
        };
        // Extend-only: never pull a target back toward entry.
        t2 = Some(match t2 {
            Some(v) if side.is_long() => v.max(round4(seed2)),
            Some(v) => v.min(round4(seed2)),
            None => round4(seed2),
        });
        t3 = Some(match t3 {
            Some(v) if side.is_long() => v.max(round4(seed3)),
            Some(v) => v.min(round4(seed3)),
            None => round4(seed3),
        });
    }

    let (t1, t2, t3) = ensure_order(t1, t2, t3, side);

    Proposal {
        sl: Some(round4(sl_new)),
        tps: [t1, t2, t3].into_iter().flatten().collect(),
        why: format!("trail={} adapt={adapt_used}", ms.trail_style),
    }
}

/// When N consecutive 1m closes run against the position, the 1m RSI slope
/// confirms, and a remaining target sits within the stall distance, pull TP1
/// to market ± eps to take what the move still offers.
fn stall_take(ctx: &Context<'_>, tps: [Option<f64>; 3], cfg: &Config) -> Option<f64> {
    let ms = &cfg.milestone;
    let n = ms.stall_bars;
    let closes = &ctx.tf1m.close;
    if n == 0 || closes.len() < n + 1 {
        return None;
    }
    let against = (1..=n).all(|i| {
        let a = closes[closes.len() - i];
        let b = closes[closes.len() - i - 1];
        if ctx.side.is_long() {
            a < b
        } else {
            a > b
        }
    });
    if !against {
        return None;
    }

    if ms.stall_rsi_confirm && !ctx.rsi14_1m.is_empty() {
        let s = rsi_slope(ctx.rsi14_1m, 3.min(ctx.rsi14_1m.len()));
        let confirmed = if ctx.side.is_long() { s < 0.0 } else { s > 0.0 };
        if !confirmed {
            return None;
        }
    }

    let near = ms.stall_near_tp_atr * ctx.atr5;
    let some_near = tps.iter().flatten().any(|&t| {
        if ctx.side.is_long() {
            t >= ctx.price && t - ctx.price <= near
        } else {
            t <= ctx.price && ctx.price - t <= near
        }
    });
    if !some_near {
        return None;
    }

    let take = if ctx.side.is_long() {
        ctx.price - ms.stall_tp_eps
    } else {
        ctx.price + ms.stall_tp_eps
    };
    Some(round4(take))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        std::env::set_var("PAIR", "SOLUSD");
        Config::from_env().unwrap()
    }

    fn flat_1m(n: usize, px: f64) -> TfSeries {
        let mut tf = TfSeries::default();
        for i in 0..n {
            tf.push_bar(i as i64 * 60_000, px, px + 0.05, px - 0.05, px, 1.0);
        }
        tf
    }

    fn ctx<'a>(tf1m: &'a TfSeries, rsi: &'a [f64]) -> Context<'a> {
        Context {
            price: 100.0,
            side: Side::Long,
            entry: 100.0,
            sl: 99.0,
            tp1: Some(100.6),
            tp2: Some(101.0),
            tp3: Some(101.5),
            tf1m,
            rsi14_1m: rsi,
            atr5: 0.5,
            adx14: 30.0,
            hit_tp1: false,
            hit_tp2: false,
            hit_tp3: false,
            bars_since_tp1: 0,
            mfe_abs: 0.0,
        }
    }

    /// Entry LONG 100.00, SL 99.00 (R=1), TP1 100.60, TP2 101.00. The
    /// trajectory follows 99.00 -> >=100.07 at TP1 -> >=100.32 at +0.5R past
    /// TP1 -> >=100.70 after TP2.
    #[test]
    fn milestone_ratchet_trajectory() {
        let cfg = test_config();
        let tf1m = flat_1m(30, 100.0);
        let mut state = MilestoneState::default();
        let r_init = 1.0;

        // Tick 1: TP1 just hit at 100.60 — BE floor engages.
        let mut c = ctx(&tf1m, &[]);
        c.hit_tp1 = true;
        c.price = 100.60;
        let be = milestone_candidate(&c, r_init, &mut state, &cfg.milestone, &cfg.fees).unwrap();
        assert!(be >= 100.07 - 1e-9, "BE floor violated: {be}");

        // Tick 2: 100.80 — 0.20 past TP1, below the 0.50R step: k stays 0.
        let mut c = ctx(&tf1m, &[]);
        c.hit_tp1 = true;
        c.price = 100.80;
        c.sl = be;
        let out = milestone_candidate(&c, r_init, &mut state, &cfg.milestone, &cfg.fees);
        assert!(out.is_none(), "no new milestone expected at 100.80, got {out:?}");
        assert_eq!(state.last_k, 0);

        // Tick 3: 101.10 — 0.50 past TP1: k=1 locks BE + 0.25R.
        let mut c = ctx(&tf1m, &[]);
        c.hit_tp1 = true;
        c.price = 101.10;
        c.sl = be;
        let sl = milestone_candidate(&c, r_init, &mut state, &cfg.milestone, &cfg.fees).unwrap();
        assert!(sl >= 100.32 - 1e-9, "milestone k=1 violated: {sl}");
        assert_eq!(state.last_k, 1);

        // Tick 4: TP2 hit — lock to entry + 0.70 * (tp2 - entry) = 100.70.
        let mut c = ctx(&tf1m, &[]);
        c.hit_tp1 = true;
        c.hit_tp2 = true;
        c.price = 101.05;
        c.sl = sl;
        c.atr5 = 0.0; // isolate the fracR jump from the ATR trail
        let sl2 = milestone_candidate(&c, r_init, &mut state, &cfg.milestone, &cfg.fees).unwrap();
        assert!(sl2 >= 100.70 - 1e-9, "post-TP2 lock violated: {sl2}");
    }

    #[test]
    fn milestone_short_mirrors() {
        let cfg = test_config();
        let tf1m = flat_1m(30, 100.0);
        let mut state = MilestoneState::default();
        let mut c = ctx(&tf1m, &[]);
        c.side = Side::Short;
        c.entry = 100.0;
        c.sl = 101.0;
        c.tp1 = Some(99.4);
        c.tp2 = Some(99.0);
        c.hit_tp1 = true;
        c.price = 98.9; // 0.5 past TP1
        let sl = milestone_candidate(&c, 1.0, &mut state, &cfg.milestone, &cfg.fees).unwrap();
        // BE = 99.93; k=1 => 99.93 - 0.25 = 99.68
        assert!(sl <= 99.68 + 1e-9, "short milestone violated: {sl}");
    }

    #[test]
    fn milestone_pre_tp1_insurance_lock() {
        let mut cfg = test_config();
        cfg.milestone.abs_lock_usd = 0.5;
        let tf1m = flat_1m(30, 100.0);
        let mut state = MilestoneState::default();

        // MFE below the lock threshold: nothing proposed.
        let mut c = ctx(&tf1m, &[]);
        c.mfe_abs = 0.3;
        assert!(milestone_candidate(&c, 1.0, &mut state, &cfg.milestone, &cfg.fees).is_none());

        // MFE beyond: BE insurance lock proposed.
        let mut c = ctx(&tf1m, &[]);
        c.mfe_abs = 0.8;
        let sl = milestone_candidate(&c, 1.0, &mut state, &cfg.milestone, &cfg.fees).unwrap();
        assert!((sl - 100.07).abs() < 1e-6);
    }

    #[test]
    fn entry_snapshot_captures_sides() {
        let snap = entry_snapshot(Side::Long, 100.0, 0.5, 28.0, Some(99.5), Some(true), 1_000);
        assert_eq!(snap.ema200_side, EmaSide::Above);
        assert_eq!(snap.structure, StructureFlag::Ok);
        assert!((snap.atr_pct_at_entry - 0.005).abs() < 1e-9);

        let snap = entry_snapshot(Side::Long, 99.0, 0.5, 28.0, Some(99.5), None, 1_000);
        assert_eq!(snap.ema200_side, EmaSide::Below);
        assert_eq!(snap.structure, StructureFlag::Na);
    }

    /// Pre-TP1 at 99.20 with both EMAs above price and the 1m swing low
    /// broken beyond the ATR pad: hard invalidation fires.
    #[test]
    fn hard_invalidation_fires_on_flip_plus_break() {
        let cfg = test_config();
        // 1m swing low at 99.10 over the window; price 98.0 is far below
        // swing_low - k*atr.
        let mut tf1m = TfSeries::default();
        for i in 0..30 {
            tf1m.push_bar(i * 60_000, 99.3, 99.5, 99.10, 99.3, 1.0);
        }
        let d = hard_invalidation(
            98.0,
            Side::Long,
            Some(99.5),
            Some(99.8),
            0.2,
            &tf1m,
            false,
            false,
            &cfg,
        );
        assert!(!d.ema_side_ok);
        assert!(d.struct_break);
        assert!(d.hard);
    }

    #[test]
    fn hard_invalidation_needs_both_conditions() {
        let cfg = test_config();
        let mut tf1m = TfSeries::default();
        for i in 0..30 {
            tf1m.push_bar(i * 60_000, 99.3, 99.5, 99.10, 99.3, 1.0);
        }
        // EMA flip without a structure break: price above the swing pad.
        let d = hard_invalidation(
            99.2,
            Side::Long,
            Some(99.5),
            None,
            0.2,
            &tf1m,
            false,
            false,
            &cfg,
        );
        assert!(!d.hard);
        // Structure break with EMAs below price (ema ok): not hard.
        let d = hard_invalidation(
            98.0,
            Side::Long,
            Some(97.0),
            None,
            0.2,
            &tf1m,
            false,
            false,
            &cfg,
        );
        assert!(d.struct_break);
        assert!(d.ema_side_ok);
        assert!(!d.hard);
    }

    #[test]
    fn giveback_guard_arms_and_fires() {
        // Armed at 1.5R MFE, fires once 25% is surrendered on a falling slope.
        assert!(giveback_exit(2.0, 1.4, -0.1, 1.5, 0.25));
        // Slope not falling: hold.
        assert!(!giveback_exit(2.0, 1.4, 0.1, 1.5, 0.25));
        // Not armed yet.
        assert!(!giveback_exit(1.0, 0.5, -0.1, 1.5, 0.25));
        // Still holding most of the move.
        assert!(!giveback_exit(2.0, 1.8, -0.1, 1.5, 0.25));
    }

    #[test]
    fn propose_freezes_sl_pre_tp1() {
        let cfg = test_config();
        let tf1m = flat_1m(30, 100.0);
        let c = ctx(&tf1m, &[]);
        let p = propose(&c, &cfg);
        assert_eq!(p.sl, Some(99.0));
        assert!(p.why.contains("preTP1_freeze"));
        // Ladder stays monotonic.
        assert!(p.tps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn propose_grace_holds_after_tp1() {
        let cfg = test_config();
        let tf1m = flat_1m(30, 100.0);
        let mut c = ctx(&tf1m, &[]);
        c.hit_tp1 = true;
        c.bars_since_tp1 = 1; // inside the 3-bar grace
        c.price = 100.7;
        let p = propose(&c, &cfg);
        assert!(p.why.contains("postTP1_grace"));
    }

    #[test]
    fn propose_trails_after_grace() {
        let cfg = test_config();
        let tf1m = flat_1m(30, 100.9);
        let mut c = ctx(&tf1m, &[]);
        c.hit_tp1 = true;
        c.bars_since_tp1 = 5;
        c.price = 100.9;
        let p = propose(&c, &cfg);
        let sl = p.sl.unwrap();
        // fracR trail toward TP1 at 0.65 puts the stop above entry.
        assert!(sl > 100.0, "expected post-grace trail above entry, got {sl}");
        // And never inside the min gap of price.
        assert!(sl < 100.9);
    }

    #[test]
    fn propose_structure_trail_uses_swings() {
        let mut cfg = test_config();
        cfg.milestone.trail_style = "structure".into();
        // 1m lows at 100.4: chandelier = 100.4 - 1.2*0.1 = 100.28.
        let mut tf1m = TfSeries::default();
        for i in 0..30 {
            tf1m.push_bar(i * 60_000, 100.6, 100.8, 100.4, 100.6, 1.0);
        }
        let mut c = ctx(&tf1m, &[]);
        c.hit_tp1 = true;
        c.bars_since_tp1 = 5;
        c.price = 100.8;
        c.atr5 = 0.1;
        let p = propose(&c, &cfg);
        let sl = p.sl.unwrap();
        assert!((sl - 100.28).abs() < 0.06, "chandelier trail off: {sl}");
    }

    #[test]
    fn stall_take_pulls_tp1_to_market() {
        let cfg = test_config();
        // 3 consecutive falling 1m closes, falling RSI, and TP1 just above.
        let mut tf1m = TfSeries::default();
        for i in 0..27 {
            tf1m.push_bar(i * 60_000, 100.6, 100.7, 100.5, 100.6, 1.0);
        }
        for (j, px) in [100.55, 100.50, 100.45].iter().enumerate() {
            tf1m.push_bar((27 + j as i64) * 60_000, *px, *px + 0.02, *px - 0.02, *px, 1.0);
        }
        let rsi_falling = vec![60.0, 58.0, 55.0, 52.0];
        let mut c = ctx(&tf1m, &rsi_falling);
        c.hit_tp1 = true;
        c.bars_since_tp1 = 5;
        c.price = 100.45;
        c.tp1 = Some(100.6); // within 0.5 * atr5(0.5) = 0.25 of price
        let taken = stall_take(
            &c,
            [c.tp1, c.tp2, c.tp3],
            &cfg,
        );
        let t = taken.expect("stall take should fire");
        assert!((t - (100.45 - cfg.milestone.stall_tp_eps)).abs() < 1e-9);
    }

    #[test]
    fn stall_take_requires_adverse_closes() {
        let cfg = test_config();
        let tf1m = flat_1m(30, 100.5); // flat, not against
        let mut c = ctx(&tf1m, &[]);
        c.hit_tp1 = true;
        assert!(stall_take(&c, [c.tp1, c.tp2, c.tp3], &cfg).is_none());
    }

    #[test]
    fn propose_adaptive_widen_is_extend_only() {
        let mut cfg = test_config();
        cfg.tp.mode_adapt = true;
        let tf1m = flat_1m(30, 100.8);
        let mut c = ctx(&tf1m, &[]);
        c.hit_tp1 = true;
        c.bars_since_tp1 = 5;
        c.price = 100.8;
        c.atr5 = 0.5;
        c.adx14 = 40.0; // rally set: d3 = 2.60 * 0.5 = 1.30
        let p = propose(&c, &cfg);
        let last = *p.tps.last().unwrap();
        assert!(last >= 101.3 - 1e-9, "rally widen expected, got {last}");
    }
}
