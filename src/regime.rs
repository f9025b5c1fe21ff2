// =============================================================================
// Regime classification — CHOP vs RUNNER with hysteresis
// =============================================================================
//
// Transitions:
//   RUNNER -> CHOP   iff ADX <= adx_dn OR ATR% <= atr_dn
//   CHOP   -> RUNNER iff ADX >= adx_up AND ATR% >= atr_up
//                        AND ema_side * close_slope >= 0
//   initial          RUNNER when the upgrade conditions hold, else CHOP
//
// The up/down thresholds straddle each other so identical inputs can never
// oscillate the label.
// =============================================================================

use crate::config::{PevConfig, RegimeConfig};
use crate::indicators::adx::adx_slope;
use crate::types::Regime;

/// Inputs for one classification step, derived from the latest 5m features.
#[derive(Debug, Clone, Copy)]
pub struct RegimeInputs {
    pub adx: f64,
    /// ATR as a fraction of price.
    pub atr_pct: f64,
    /// +1 when price is at/above EMA200, -1 below.
    pub ema_side: f64,
    /// +1 when the last close rose, -1 when it fell.
    pub close_slope: f64,
}

impl RegimeInputs {
    pub fn from_series(
        adx_series: &[f64],
        atr_series: &[f64],
        closes: &[f64],
        ema200_last: f64,
    ) -> Option<Self> {
        let adx = *adx_series.last()?;
        let atr = *atr_series.last()?;
        let price = *closes.last()?;
        let atr_pct = atr / price.max(1e-9);
        let ema_side = if price >= ema200_last { 1.0 } else { -1.0 };
        let close_slope = if closes.len() >= 2 {
            if closes[closes.len() - 1] > closes[closes.len() - 2] {
                1.0
            } else {
                -1.0
            }
        } else {
            0.0
        };
        Some(Self { adx, atr_pct, ema_side, close_slope })
    }
}

/// One hysteresis step. Deterministic in (inputs, prev).
pub fn classify(inputs: RegimeInputs, prev: Option<Regime>, cfg: &RegimeConfig) -> Regime {
    let want_runner = inputs.adx >= cfg.adx_up
        && inputs.atr_pct >= cfg.atr_up
        && inputs.ema_side * inputs.close_slope >= 0.0;
    let want_chop = inputs.adx <= cfg.adx_dn || inputs.atr_pct <= cfg.atr_dn;

    match prev {
        Some(Regime::Runner) => {
            if want_chop {
                Regime::Chop
            } else {
                Regime::Runner
            }
        }
        Some(Regime::Chop) => {
            if want_runner {
                Regime::Runner
            } else {
                Regime::Chop
            }
        }
        None => {
            if want_runner {
                Regime::Runner
            } else {
                Regime::Chop
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Soft degrade (PEV support)
// ---------------------------------------------------------------------------

/// Soft-invalidation assessment for the post-entry validity guard.
#[derive(Debug, Clone, Copy)]
pub struct SoftDegrade {
    pub soft: bool,
    pub adx: f64,
    pub atr_pct: f64,
    /// ADX minimum after the slope bonus.
    pub adx_min_eff: f64,
    pub slope3: f64,
}

/// Soft degrade: ADX below its (slope-bonused) minimum OR ATR% under the
/// floor. Missing history degrades conservatively to soft=true.
pub fn soft_degrade(
    adx_series: &[f64],
    atr_series: &[f64],
    closes: &[f64],
    cfg: &PevConfig,
) -> SoftDegrade {
    let (Some(&adx_last), Some(&atr), Some(&price)) =
        (adx_series.last(), atr_series.last(), closes.last())
    else {
        return SoftDegrade {
            soft: true,
            adx: 0.0,
            atr_pct: 0.0,
            adx_min_eff: cfg.adx_min,
            slope3: 0.0,
        };
    };

    let atr_pct = atr / price.max(1e-9);
    let slope3 = adx_slope(adx_series, 3);
    let adx_min_eff = cfg.adx_min - if slope3 > 0.0 { cfg.adx_slope_bonus } else { 0.0 };
    let soft = adx_last < adx_min_eff || atr_pct < cfg.atr_floor_pct;

    SoftDegrade { soft, adx: adx_last, atr_pct, adx_min_eff, slope3 }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn regime_cfg() -> RegimeConfig {
        RegimeConfig {
            auto: true,
            adx_up: 26.0,
            adx_dn: 23.0,
            atr_up: 0.0040,
            atr_dn: 0.0035,
            partial_tp1: 0.5,
        }
    }

    fn pev_cfg() -> PevConfig {
        PevConfig {
            enabled: true,
            grace_bars_5m: 2,
            grace_min_s: 300,
            adx_min: 20.0,
            atr_floor_pct: 0.0015,
            adx_slope_bonus: 2.0,
            ema_tol_pct: 0.0015,
        }
    }

    fn inputs(adx: f64, atr_pct: f64) -> RegimeInputs {
        RegimeInputs { adx, atr_pct, ema_side: 1.0, close_slope: 1.0 }
    }

    #[test]
    fn initial_classification() {
        let cfg = regime_cfg();
        assert_eq!(classify(inputs(30.0, 0.0050), None, &cfg), Regime::Runner);
        assert_eq!(classify(inputs(20.0, 0.0050), None, &cfg), Regime::Chop);
        assert_eq!(classify(inputs(30.0, 0.0020), None, &cfg), Regime::Chop);
    }

    #[test]
    fn runner_downgrades_on_either_threshold() {
        let cfg = regime_cfg();
        // ADX collapse alone.
        assert_eq!(classify(inputs(22.0, 0.0050), Some(Regime::Runner), &cfg), Regime::Chop);
        // ATR collapse alone.
        assert_eq!(classify(inputs(30.0, 0.0030), Some(Regime::Runner), &cfg), Regime::Chop);
        // Neither: stays RUNNER.
        assert_eq!(classify(inputs(24.0, 0.0038), Some(Regime::Runner), &cfg), Regime::Runner);
    }

    #[test]
    fn chop_upgrades_only_on_both_and_alignment() {
        let cfg = regime_cfg();
        assert_eq!(classify(inputs(27.0, 0.0045), Some(Regime::Chop), &cfg), Regime::Runner);
        // High ADX alone is not enough.
        assert_eq!(classify(inputs(27.0, 0.0030), Some(Regime::Chop), &cfg), Regime::Chop);
        // Misaligned EMA side vs slope blocks the upgrade.
        let misaligned = RegimeInputs { adx: 27.0, atr_pct: 0.0045, ema_side: 1.0, close_slope: -1.0 };
        assert_eq!(classify(misaligned, Some(Regime::Chop), &cfg), Regime::Chop);
    }

    /// Repeated identical input never oscillates (testable property 8).
    #[test]
    fn hysteresis_is_idempotent() {
        let cfg = regime_cfg();
        for adx in [18.0, 24.0, 27.0, 35.0] {
            for atr_pct in [0.0020, 0.0037, 0.0045] {
                let inp = inputs(adx, atr_pct);
                let mut state = classify(inp, None, &cfg);
                for _ in 0..10 {
                    let next = classify(inp, Some(state), &cfg);
                    assert_eq!(next, state, "oscillation at adx={adx} atr={atr_pct}");
                    state = next;
                }
            }
        }
    }

    #[test]
    fn band_between_thresholds_is_sticky() {
        let cfg = regime_cfg();
        // In the dead band (adx 24..26) both labels are stable.
        let inp = inputs(24.5, 0.0038);
        assert_eq!(classify(inp, Some(Regime::Runner), &cfg), Regime::Runner);
        assert_eq!(classify(inp, Some(Regime::Chop), &cfg), Regime::Chop);
    }

    #[test]
    fn soft_degrade_triggers_on_weak_adx() {
        let cfg = pev_cfg();
        let adx = vec![25.0, 24.0, 22.0, 18.0]; // falling, no slope bonus
        let atr = vec![0.5; 4];
        let closes = vec![100.0; 4];
        let d = soft_degrade(&adx, &atr, &closes, &cfg);
        assert!(d.soft);
        assert_eq!(d.adx_min_eff, 20.0);
    }

    #[test]
    fn soft_degrade_slope_bonus_lowers_bar() {
        let cfg = pev_cfg();
        // ADX 19 would fail the 20 minimum, but it is rising: bar drops to 18.
        let adx = vec![15.0, 16.0, 17.5, 19.0];
        let atr = vec![0.5; 4];
        let closes = vec![100.0; 4];
        let d = soft_degrade(&adx, &atr, &closes, &cfg);
        assert_eq!(d.adx_min_eff, 18.0);
        assert!(!d.soft);
    }

    #[test]
    fn soft_degrade_triggers_on_atr_floor() {
        let cfg = pev_cfg();
        let adx = vec![30.0; 5];
        let atr = vec![0.10; 5]; // 0.10 / 100 = 0.10% < 0.15% floor
        let closes = vec![100.0; 5];
        assert!(soft_degrade(&adx, &atr, &closes, &cfg).soft);
    }

    #[test]
    fn soft_degrade_empty_input_is_soft() {
        let cfg = pev_cfg();
        assert!(soft_degrade(&[], &[], &[], &cfg).soft);
    }

    #[test]
    fn inputs_from_series() {
        let adx = vec![25.0, 26.0];
        let atr = vec![0.4, 0.5];
        let closes = vec![99.0, 100.0];
        let inp = RegimeInputs::from_series(&adx, &atr, &closes, 98.0).unwrap();
        assert_eq!(inp.adx, 26.0);
        assert!((inp.atr_pct - 0.005).abs() < 1e-9);
        assert_eq!(inp.ema_side, 1.0);
        assert_eq!(inp.close_slope, 1.0);
        assert!(RegimeInputs::from_series(&[], &[], &[], 0.0).is_none());
    }
}
