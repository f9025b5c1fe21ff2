// =============================================================================
// TP Calculator — ATR / R-multiple ladders with regime-adaptive multipliers
// =============================================================================
//
// Ladder construction:
//   TP_MODE=atr — multipliers on the ATR reference; with mode-adapt on, the
//   chop set (ATR% <= chop_atr_pct_max AND ADX <= chop_adx_max) takes profit
//   earlier and the rally set rides further.
//   TP_MODE=r   — multipliers on R = |entry - sl|.
//
// Post-processing is always: order, enforce minimum R quality on TP1, fill
// and respace to 3 targets, round to 4dp. Optionally the ladder is returned
// with size fractions normalized to sum 1.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::config::TpConfig;
use crate::guards::{order_tps, round4};
use crate::types::Side;

/// One ladder rung with its share of the position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TpLevel {
    pub px: f64,
    pub size_frac: f64,
}

/// Ladder regime used by mode-adapt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderRegime {
    Chop,
    Rally,
}

/// Classify chop vs rally from ATR% of price and ADX.
pub fn ladder_regime(price: f64, atr_ref: f64, adx_last: f64, cfg: &TpConfig) -> LadderRegime {
    let atr_pct = if price > 0.0 { atr_ref / price } else { 0.0 };
    if atr_pct <= cfg.chop_atr_pct_max && adx_last <= cfg.chop_adx_max {
        LadderRegime::Chop
    } else {
        LadderRegime::Rally
    }
}

/// TP1 must clear `min(min_r_mult * R, tp1_abs)` from entry; stretch and
/// respace the ladder when it does not.
pub fn enforce_min_r(entry: f64, sl: f64, tps: &[f64], side: Side, atr: f64, cfg: &TpConfig) -> Vec<f64> {
    if tps.is_empty() {
        return Vec::new();
    }
    let r = (entry - sl).abs().max(1e-9);
    let need = (cfg.min_r_mult * r).min(cfg.tp1_abs.max(1e-9));

    if (tps[0] - entry).abs() + 1e-12 >= need {
        return order_tps(side, tps);
    }

    let gap = (0.6 * atr).max(0.8 * r);
    if side.is_long() {
        let tp1 = round4(entry + need);
        let tp2 = (tp1 + gap).max(tps.get(1).copied().unwrap_or(tp1 + 1.2 * gap));
        let tp3 = (tp2 + gap).max(tps.get(2).copied().unwrap_or(tp2 + 1.2 * gap));
        order_tps(Side::Long, &[tp1, tp2, tp3])
    } else {
        let tp1 = round4(entry - need);
        let tp2 = (tp1 - gap).min(tps.get(1).copied().unwrap_or(tp1 - 1.2 * gap));
        let tp3 = (tp2 - gap).min(tps.get(2).copied().unwrap_or(tp2 - 1.2 * gap));
        order_tps(Side::Short, &[tp1, tp2, tp3])
    }
}

/// Keep profit-side targets and pad the ladder back out to three rungs with
/// a sensible spacing of `max(0.6*ATR, 0.8*R)`.
pub fn tp_guard(side: Side, entry: f64, sl: f64, tps: &[f64], atr: f64) -> Vec<f64> {
    let r = (entry - sl).abs().max(1e-9);
    let gap = (0.6 * atr.max(0.0)).max(0.8 * r);
    let eps = 1e-8;

    let mut keep: Vec<f64> = if side.is_long() {
        tps.iter().copied().filter(|&x| x > entry + eps).collect()
    } else {
        tps.iter().copied().filter(|&x| x < entry - eps).collect()
    };
    keep = order_tps(side, &keep);

    while keep.len() < 3 {
        let step = if keep.len() > 1 {
            gap.max((keep[keep.len() - 1] - keep[keep.len() - 2]).abs())
        } else if keep.len() == 1 {
            gap.max((keep[0] - entry).abs())
        } else {
            gap
        };
        let base = keep.last().copied().unwrap_or(entry);
        let next = if side.is_long() { base + step } else { base - step };
        keep.push(round4(next));
    }
    order_tps(side, &keep[..3])
}

/// Build the full TP ladder for a signal.
pub fn compute_tps(price: f64, sl: f64, side: Side, atr_ref: f64, adx_last: f64, cfg: &TpConfig) -> Vec<f64> {
    let raw: Vec<f64> = if cfg.mode == "atr" {
        let mults = if cfg.mode_adapt {
            match ladder_regime(price, atr_ref, adx_last, cfg) {
                LadderRegime::Chop => cfg.chop_atr_mults,
                LadderRegime::Rally => cfg.rally_atr_mults,
            }
        } else {
            cfg.atr_mults
        };
        mults
            .iter()
            .map(|m| {
                let d = m * atr_ref;
                if side.is_long() {
                    price + d
                } else {
                    price - d
                }
            })
            .collect()
    } else {
        let r = (price - sl).abs().max(1e-9);
        cfg.r_mults
            .iter()
            .map(|m| {
                if side.is_long() {
                    price + m * r
                } else {
                    price - m * r
                }
            })
            .collect()
    };

    let tps = order_tps(side, &raw);
    let tps = enforce_min_r(price, sl, &tps, side, atr_ref, cfg);
    let tps = tp_guard(side, price, sl, &tps, atr_ref);
    tps.iter().map(|x| round4(*x)).collect()
}

/// Size fractions per rung, clamped non-negative and normalized to sum 1.
/// Falls back to 0.3/0.3/0.4 when everything zeroes out.
pub fn normalize_fracs(fracs: &[f64]) -> [f64; 3] {
    let mut safe = [0.0; 3];
    for (i, f) in fracs.iter().take(3).enumerate() {
        safe[i] = f.max(0.0);
    }
    let sum: f64 = safe.iter().sum();
    if sum <= 0.0 {
        return [0.3, 0.3, 0.4];
    }
    [safe[0] / sum, safe[1] / sum, safe[2] / sum]
}

/// Fractions per the mode-adapt classifier (or the flat configured split).
pub fn fractions_for_mode(price: f64, atr_ref: f64, adx_last: f64, cfg: &TpConfig) -> [f64; 3] {
    if !cfg.mode_adapt {
        return normalize_fracs(&cfg.fractions);
    }
    match ladder_regime(price, atr_ref, adx_last, cfg) {
        LadderRegime::Chop => normalize_fracs(&cfg.chop_fractions),
        LadderRegime::Rally => normalize_fracs(&cfg.rally_fractions),
    }
}

/// Structured ladder: prices paired with normalized size fractions.
pub fn compute_structured(
    price: f64,
    sl: f64,
    side: Side,
    atr_ref: f64,
    adx_last: f64,
    cfg: &TpConfig,
) -> Vec<TpLevel> {
    let tps = compute_tps(price, sl, side, atr_ref, adx_last, cfg);
    let fracs = fractions_for_mode(price, atr_ref, adx_last, cfg);
    tps.iter()
        .enumerate()
        .map(|(i, &px)| TpLevel { px, size_frac: fracs.get(i).copied().unwrap_or(0.0) })
        .collect()
}

// ---------------------------------------------------------------------------
// Manager-side ladder maintenance
// ---------------------------------------------------------------------------

/// Strictly order an optional triple, dropping violations.
pub fn ensure_order(
    tp1: Option<f64>,
    tp2: Option<f64>,
    tp3: Option<f64>,
    side: Side,
) -> (Option<f64>, Option<f64>, Option<f64>) {
    let present: Vec<f64> = [tp1, tp2, tp3].into_iter().flatten().collect();
    let ordered = order_tps(side, &present);
    (
        ordered.first().copied(),
        ordered.get(1).copied(),
        ordered.get(2).copied(),
    )
}

/// Clamp the ladder so TP1 stays achievable: TP1 never drifts beyond the
/// ATR-seeded distance, TP2/TP3 keep order and spacing. Used by the manager
/// at init and on every pre-TP1 tick (never widens at init).
pub fn clamp_tp1_ladder(
    entry: f64,
    sl: f64,
    tp1: Option<f64>,
    tp2: Option<f64>,
    tp3: Option<f64>,
    side: Side,
    atr5: f64,
    cfg: &TpConfig,
) -> (Option<f64>, Option<f64>, Option<f64>) {
    let r = (entry - sl).abs();
    let (d1, d2, d3) = if cfg.mode == "atr" && atr5 > 0.0 {
        (
            cfg.atr_mults[0] * atr5,
            cfg.atr_mults[1] * atr5,
            cfg.atr_mults[2] * atr5,
        )
    } else {
        // Modest R distances when ATR is unavailable.
        let d1 = (0.40 * r).max(0.10);
        let d2 = (0.90 * r).max(d1 + 0.10);
        let d3 = (1.40 * r).max(d2 + 0.10);
        (d1, d2, d3)
    };

    let (seed1, seed2, seed3) = if side.is_long() {
        (entry + d1, entry + d2, entry + d3)
    } else {
        (entry - d1, entry - d2, entry - d3)
    };

    // TP1: never further than the seed.
    let t1 = match tp1 {
        Some(t) if side.is_long() => t.min(seed1),
        Some(t) => t.max(seed1),
        None => seed1,
    };

    let min_step = (0.10 * d1).max(0.01);
    let (t2, t3) = if side.is_long() {
        let mut t2 = tp2.unwrap_or(seed2);
        let mut t3 = tp3.unwrap_or(seed3);
        if t2 <= t1 {
            t2 = seed2.max(t1 + min_step);
        }
        if t3 <= t2 {
            t3 = seed3.max(t2 + min_step);
        }
        (t2, t3)
    } else {
        let mut t2 = tp2.unwrap_or(seed2);
        let mut t3 = tp3.unwrap_or(seed3);
        if t2 >= t1 {
            t2 = seed2.min(t1 - min_step);
        }
        if t3 >= t2 {
            t3 = seed3.min(t2 - min_step);
        }
        (t2, t3)
    };

    ensure_order(Some(round4(t1)), Some(round4(t2)), Some(round4(t3)), side)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tp_cfg(mode: &str, adapt: bool) -> TpConfig {
        TpConfig {
            mode: mode.into(),
            atr_mults: [0.60, 1.00, 1.50],
            r_mults: [0.8, 1.4, 2.2],
            min_r_mult: 1.4,
            tp1_abs: 0.50,
            mode_adapt: adapt,
            chop_atr_pct_max: 0.0025,
            chop_adx_max: 25.0,
            chop_atr_mults: [0.60, 1.00, 1.50],
            rally_atr_mults: [0.90, 1.60, 2.60],
            structured: false,
            fractions: [0.30, 0.30, 0.40],
            chop_fractions: [0.50, 0.30, 0.20],
            rally_fractions: [0.30, 0.30, 0.40],
            eps: 0.01,
            extend_cooldown_s: 55,
            hit_confirm_bars: 0,
        }
    }

    #[test]
    fn atr_ladder_long_is_monotonic() {
        let cfg = tp_cfg("atr", false);
        let tps = compute_tps(100.0, 99.0, Side::Long, 1.0, 20.0, &cfg);
        assert_eq!(tps.len(), 3);
        assert!(tps[0] > 100.0);
        assert!(tps[0] < tps[1] && tps[1] < tps[2]);
    }

    #[test]
    fn r_ladder_short_is_descending() {
        let cfg = tp_cfg("r", false);
        let tps = compute_tps(100.0, 101.0, Side::Short, 0.5, 20.0, &cfg);
        assert_eq!(tps.len(), 3);
        assert!(tps[0] < 100.0);
        assert!(tps[0] > tps[1] && tps[1] > tps[2]);
    }

    #[test]
    fn min_r_boundary_accepts_exact() {
        let cfg = tp_cfg("atr", false);
        // R = 0.30, min need = min(1.4*0.30, 0.50) = 0.42.
        let exact = vec![100.42, 101.0, 101.5];
        let out = enforce_min_r(100.0, 99.70, &exact, Side::Long, 0.5, &cfg);
        assert!((out[0] - 100.42).abs() < 1e-9, "exact minimum must pass untouched");
        // Just below gets stretched to the need.
        let tight = vec![100.41, 101.0, 101.5];
        let out = enforce_min_r(100.0, 99.70, &tight, Side::Long, 0.5, &cfg);
        assert!(out[0] >= 100.42 - 1e-9, "tp1 {} not stretched", out[0]);
    }

    #[test]
    fn tp_guard_fills_to_three() {
        let out = tp_guard(Side::Long, 100.0, 99.0, &[100.6], 0.5);
        assert_eq!(out.len(), 3);
        assert!(out[0] < out[1] && out[1] < out[2]);
        // Wrong-side targets are discarded before filling.
        let out = tp_guard(Side::Short, 100.0, 101.0, &[101.5, 99.4], 0.5);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|&x| x < 100.0));
    }

    #[test]
    fn mode_adapt_selects_chop_and_rally() {
        let cfg = tp_cfg("atr", true);
        // Chop: atr% = 0.2/100 = 0.002 <= 0.0025 and ADX 20 <= 25.
        assert_eq!(ladder_regime(100.0, 0.2, 20.0, &cfg), LadderRegime::Chop);
        // Rally: ADX high.
        assert_eq!(ladder_regime(100.0, 0.2, 40.0, &cfg), LadderRegime::Rally);

        // Tight stop keeps the min-R stretch out of the way so the mults
        // themselves are visible.
        let chop = compute_tps(100.0, 99.9, Side::Long, 0.2, 20.0, &cfg);
        let rally = compute_tps(100.0, 99.9, Side::Long, 0.2, 40.0, &cfg);
        // Rally TP3 extends beyond the chop TP3.
        assert!(rally[2] > chop[2], "rally {rally:?} vs chop {chop:?}");
    }

    #[test]
    fn fractions_normalize_to_one() {
        let f = normalize_fracs(&[0.5, 0.3, 0.2]);
        assert!((f.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        let f = normalize_fracs(&[2.0, 1.0, 1.0]);
        assert!((f[0] - 0.5).abs() < 1e-12);
        // Degenerate input falls back.
        let f = normalize_fracs(&[0.0, -1.0, 0.0]);
        assert_eq!(f, [0.3, 0.3, 0.4]);
    }

    #[test]
    fn structured_ladder_matches_flat_prices() {
        let cfg = tp_cfg("atr", false);
        let flat = compute_tps(100.0, 99.0, Side::Long, 1.0, 20.0, &cfg);
        let structured = compute_structured(100.0, 99.0, Side::Long, 1.0, 20.0, &cfg);
        let pxs: Vec<f64> = structured.iter().map(|l| l.px).collect();
        assert_eq!(flat, pxs);
        let total: f64 = structured.iter().map(|l| l.size_frac).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn compute_is_idempotent_through_guard() {
        let cfg = tp_cfg("atr", false);
        let tps = compute_tps(100.0, 99.0, Side::Long, 1.0, 20.0, &cfg);
        let again = tp_guard(Side::Long, 100.0, 99.0, &tps, 1.0);
        assert_eq!(tps, again);
    }

    #[test]
    fn ensure_order_drops_violations() {
        let (a, b, c) = ensure_order(Some(101.0), Some(100.5), Some(102.0), Side::Long);
        assert_eq!((a, b, c), (Some(100.5), Some(101.0), Some(102.0)));
        let (a, b, _c) = ensure_order(Some(99.0), None, Some(98.0), Side::Short);
        assert_eq!((a, b), (Some(99.0), Some(98.0)));
    }

    #[test]
    fn clamp_never_widens_tp1() {
        let cfg = tp_cfg("atr", false);
        // Seed TP1 distance = 0.6 * 0.5 = 0.30 above entry.
        let (t1, t2, t3) =
            clamp_tp1_ladder(100.0, 99.0, Some(101.5), None, None, Side::Long, 0.5, &cfg);
        assert!((t1.unwrap() - 100.30).abs() < 1e-9);
        assert!(t2.unwrap() > t1.unwrap());
        assert!(t3.unwrap() > t2.unwrap());
        // A closer caller-provided TP1 is preserved.
        let (t1, _, _) =
            clamp_tp1_ladder(100.0, 99.0, Some(100.2), None, None, Side::Long, 0.5, &cfg);
        assert!((t1.unwrap() - 100.2).abs() < 1e-9);
    }

    #[test]
    fn clamp_short_mirrors() {
        let cfg = tp_cfg("atr", false);
        let (t1, t2, t3) =
            clamp_tp1_ladder(100.0, 101.0, None, None, None, Side::Short, 0.5, &cfg);
        assert!((t1.unwrap() - 99.70).abs() < 1e-9);
        assert!(t2.unwrap() < t1.unwrap());
        assert!(t3.unwrap() < t2.unwrap());
    }
}
