// =============================================================================
// Guards — SL rails, min-gap, BE floor, tighten-only clamps, TP sanitation
// =============================================================================
//
// Every helper is pure and idempotent under fixed inputs so the manager can
// re-run them each tick without drift. Polarity: LONG stops only move up,
// SHORT stops only move down.
// =============================================================================

use crate::config::{FeeConfig, SlConfig};
use crate::types::Side;

pub fn round4(x: f64) -> f64 {
    (x * 1e4).round() / 1e4
}

// ---------------------------------------------------------------------------
// Break-even floor
// ---------------------------------------------------------------------------

/// Floor (LONG) or cap (SHORT) a stop at break-even padded by the round-trip
/// fee cushion.
pub fn be_floor(sl_new: f64, side: Side, entry: f64, fees: &FeeConfig) -> f64 {
    let be = if side.is_long() {
        entry * (1.0 + fees.fees_pct_pad)
    } else {
        entry * (1.0 - fees.fees_pct_pad)
    };
    if side.is_long() {
        sl_new.max(be)
    } else {
        sl_new.min(be)
    }
}

// ---------------------------------------------------------------------------
// Min-gap
// ---------------------------------------------------------------------------

/// Minimum SL distance from price: the largest of the ATR gap, the noise
/// buffer, and the percent gap.
pub fn min_gap_px(price: f64, atr: f64, sl: &SlConfig) -> f64 {
    let g_atr = sl.min_gap_atr_mult * atr.max(0.0);
    let g_buf = sl.min_buffer_atr * atr.max(0.0);
    let g_pct = sl.min_gap_pct * price.max(0.0);
    g_atr.max(g_buf).max(g_pct).max(1e-6)
}

// ---------------------------------------------------------------------------
// Unified SL guard
// ---------------------------------------------------------------------------

/// Unified stop guard:
///   1. pre-TP1 freeze (unless BE explicitly allowed),
///   2. optional BE floor,
///   3. polarity-safe min-gap clamp around current price,
///   4. tighten-only against the current stop.
#[allow(clippy::too_many_arguments)]
pub fn guard_sl(
    sl_candidate: f64,
    sl_current: f64,
    side: Side,
    price: f64,
    entry: f64,
    atr: f64,
    hit_tp1: bool,
    allow_be: bool,
    sl_cfg: &SlConfig,
    fees: &FeeConfig,
) -> f64 {
    if !hit_tp1 && sl_cfg.freeze_before_tp1 && !allow_be {
        return sl_current;
    }

    let gap = min_gap_px(price, atr, sl_cfg);

    let mut target = sl_candidate;
    if allow_be {
        target = be_floor(target, side, entry, fees);
    }

    if side.is_long() {
        let clamped = target.min(price - gap);
        sl_current.max(clamped)
    } else {
        let clamped = target.max(price + gap);
        sl_current.min(clamped)
    }
}

// ---------------------------------------------------------------------------
// SL rail from entry
// ---------------------------------------------------------------------------

/// Pad a too-tight stop out to the minimum rail measured from the entry.
/// Stops at or beyond the rail are returned unchanged.
pub fn enforce_min_sl(entry: f64, sl: f64, side: Side, min_sl_pct: f64) -> f64 {
    let rail = (entry * min_sl_pct).max(1e-6);
    if (entry - sl).abs() >= rail {
        return sl;
    }
    let padded = if side.is_long() { entry - rail } else { entry + rail };
    round4(padded)
}

// ---------------------------------------------------------------------------
// TP ordering / sanitation
// ---------------------------------------------------------------------------

/// Strictly monotonic, deduped, 4dp, at most 3 targets.
/// LONG ascending, SHORT descending.
pub fn order_tps(side: Side, tps: &[f64]) -> Vec<f64> {
    let mut arr: Vec<f64> = tps.iter().map(|x| round4(*x)).collect();
    if arr.is_empty() {
        return arr;
    }
    arr.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if !side.is_long() {
        arr.reverse();
    }
    let mut out: Vec<f64> = Vec::with_capacity(3);
    for x in arr {
        match out.last() {
            None => out.push(x),
            Some(&last) if side.is_long() && x > last => out.push(x),
            Some(&last) if !side.is_long() && x < last => out.push(x),
            _ => {}
        }
        if out.len() == 3 {
            break;
        }
    }
    out
}

/// Keep only targets on the profit side of entry with at least a fee-cushion
/// step, then order/dedup. Idempotent.
pub fn sanitize_tps(side: Side, entry: f64, tps: &[f64], fees: &FeeConfig) -> Vec<f64> {
    let min_step = (entry * fees.fee_pct * fees.fee_pad_mult).max(1e-6);
    let kept: Vec<f64> = tps
        .iter()
        .copied()
        .filter(|&tp| {
            if side.is_long() {
                tp > entry + min_step
            } else {
                tp < entry - min_step
            }
        })
        .collect();
    order_tps(side, &kept)
}

// ---------------------------------------------------------------------------
// Lock helpers (milestone / trail building blocks)
// ---------------------------------------------------------------------------

/// Once MFE has covered `abs_lock_usd` of favorable excursion, lock the stop
/// to BE+fees plus the locked amount (never beyond current price).
pub fn abs_lock_from_entry(
    cur_sl: f64,
    side: Side,
    entry: f64,
    price: f64,
    mfe_abs: f64,
    abs_lock_usd: f64,
    fees: &FeeConfig,
) -> f64 {
    if abs_lock_usd <= 0.0 || mfe_abs < abs_lock_usd {
        return cur_sl;
    }
    let floor = if side.is_long() {
        entry * (1.0 + fees.fees_pct_pad) + abs_lock_usd
    } else {
        entry * (1.0 - fees.fees_pct_pad) - abs_lock_usd
    };
    if side.is_long() {
        cur_sl.max(floor).min(price - 1e-6)
    } else {
        cur_sl.min(floor).max(price + 1e-6)
    }
}

/// Tighten toward a target level minus an ATR buffer.
pub fn to_tp_lock(cur_sl: f64, side: Side, tp: f64, atr_mult: f64, atr: f64) -> f64 {
    let buf = atr_mult * atr.max(0.0);
    let target = if side.is_long() { tp - buf } else { tp + buf };
    if side.is_long() {
        cur_sl.max(target)
    } else {
        cur_sl.min(target)
    }
}

/// Tighten to a fraction of the entry→tp distance, padded back by `atr_pad`.
pub fn trail_fracr(cur_sl: f64, side: Side, entry: f64, tp: f64, frac: f64, atr_pad: f64) -> f64 {
    let base = if side.is_long() {
        entry + frac * (tp - entry)
    } else {
        entry - frac * (entry - tp)
    };
    let target = if side.is_long() { base - atr_pad } else { base + atr_pad };
    if side.is_long() {
        cur_sl.max(target)
    } else {
        cur_sl.min(target)
    }
}
