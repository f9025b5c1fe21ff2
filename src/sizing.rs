// =============================================================================
// Sizing & PnL — capital-fraction / risk-R quantity selection, fees
// =============================================================================
//
// choose_size returns a quantity > 0 or 0.0 to skip the entry:
//   capital_frac: qty = balance * CAPITAL_FRACTION * MAX_LEVERAGE / entry
//   risk_r:       qty = (balance * RISK_PCT/100) / per_unit_loss, where
//                 per_unit_loss = max(|entry-sl|, entry*MIN_SL_FRAC, MIN_SL_ABS)
//   both:         min of the two when both are positive
//
// A tiny positive quantity is bumped to MIN_QTY but never beyond the capital
// allowance; MAX_QTY caps the result; a configured notional floor forces a
// skip when entry*qty cannot reach it.
// =============================================================================

use crate::config::{FeeConfig, SizingConfig};
use crate::types::Side;

fn sane(x: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

/// Capital-fraction sizing with the leverage cap.
fn qty_capital(balance_quote: f64, entry: f64, cfg: &SizingConfig) -> f64 {
    let bal = sane(balance_quote);
    let e = sane(entry);
    if bal <= 0.0 || e <= 0.0 {
        return 0.0;
    }
    let notional_allowed = bal * cfg.capital_fraction.max(0.0) * cfg.max_leverage.max(1.0);
    (notional_allowed / e).max(0.0)
}

/// Risk-R sizing with the minimum-distance guards on per-unit loss.
fn qty_risk(balance_quote: f64, entry: f64, sl: f64, cfg: &SizingConfig) -> f64 {
    let bal = sane(balance_quote);
    let e = sane(entry);
    let s = sane(sl);
    if bal <= 0.0 || e <= 0.0 || s <= 0.0 {
        return 0.0;
    }
    let per_unit_loss = (e - s)
        .abs()
        .max(e * cfg.min_sl_frac.max(0.0))
        .max(cfg.min_sl_abs.max(0.0));
    if per_unit_loss <= 0.0 {
        return 0.0;
    }
    let risk_amount = bal * (cfg.risk_pct.max(0.0) / 100.0);
    (risk_amount / per_unit_loss).max(0.0)
}

/// Pick the order quantity for a new entry. `dry_run` selects the paper
/// start balance when `PAPER_USE_START_BALANCE` is set.
pub fn choose_size(balance_quote: f64, entry: f64, sl: f64, cfg: &SizingConfig, dry_run: bool) -> f64 {
    let effective_balance = if dry_run && cfg.paper_use_start_balance {
        cfg.paper_start_balance
    } else {
        balance_quote
    };

    let qc = qty_capital(effective_balance, entry, cfg);
    let qr = qty_risk(effective_balance, entry, sl, cfg);

    let mut q = match cfg.mode.as_str() {
        "capital_frac" => qc,
        "risk_r" => qr,
        _ => {
            if qc > 0.0 && qr > 0.0 {
                qc.min(qr)
            } else {
                qc.max(qr)
            }
        }
    };

    if cfg.max_qty > 0.0 {
        q = q.min(cfg.max_qty);
    }

    // Bump tiny positives to the lot floor, capped by the capital allowance.
    if q > 0.0 && q < cfg.min_qty {
        let cap = if qc > 0.0 { qc } else { qty_capital(balance_quote, entry, cfg) };
        q = if cap > 0.0 { cfg.min_qty.min(cap) } else { cfg.min_qty };
    }

    if cfg.notional_min > 0.0 && entry > 0.0 && q > 0.0 && entry * q < cfg.notional_min {
        return 0.0;
    }

    q.max(0.0)
}

// ---------------------------------------------------------------------------
// Fees & PnL
// ---------------------------------------------------------------------------

/// Round-trip fees as a NEGATIVE amount.
pub fn calc_fees(entry: f64, exit_px: f64, qty: f64, fees: &FeeConfig) -> f64 {
    let e = sane(entry);
    let x = sane(exit_px);
    let q = sane(qty);
    if e <= 0.0 || x <= 0.0 || q <= 0.0 {
        return 0.0;
    }
    -(e * q * fees.fee_pct + x * q * fees.fee_pct)
}

/// Gross PnL, no fees.
pub fn calc_pnl(side: Side, entry: f64, exit_px: f64, qty: f64) -> f64 {
    let e = sane(entry);
    let x = sane(exit_px);
    let q = sane(qty);
    if e <= 0.0 || q <= 0.0 {
        return 0.0;
    }
    side.direction() * (x - e) * q
}

/// Net PnL = gross + fees (fees are already negative).
pub fn calc_pnl_net(side: Side, entry: f64, exit_px: f64, qty: f64, fees: &FeeConfig) -> f64 {
    calc_pnl(side, entry, exit_px, qty) + calc_fees(entry, exit_px, qty, fees)
}
