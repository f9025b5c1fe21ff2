// =============================================================================
// Post-Entry Validity guard — pre-TP1 invalidation with a grace window
// =============================================================================
//
// Soft degrade (weak ADX / ATR under the floor) starts a grace window of
// PEV_GRACE_BARS_5M bars or PEV_GRACE_MIN_S seconds, whichever is longer;
// only an exhausted window escalates to EXIT. A hard invalidation (EMA-side
// flip plus structural break, judged by the caller) exits immediately. The
// guard only runs before TP1 — once the trade has paid, the milestone logic
// owns the stop.
// =============================================================================

use serde::Serialize;

use crate::config::PevConfig;
use crate::manage::fsm::HardDiag;
use crate::regime::SoftDegrade;

/// Guard verdict for the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PevState {
    Ok,
    Warn,
    Exit,
}

impl PevState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warn => "WARN",
            Self::Exit => "EXIT",
        }
    }
}

impl std::fmt::Display for PevState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome with the hard flag and telemetry diagnostics.
#[derive(Debug, Clone)]
pub struct PevOutcome {
    pub state: PevState,
    /// True when the EXIT is a hard invalidation (immediate flatten). A soft
    /// EXIT is downgraded to WARN by the manager.
    pub hard: bool,
    pub diag: serde_json::Value,
}

/// Stateful grace-window tracker, one per managed trade.
#[derive(Debug, Default)]
pub struct PevGuard {
    warn_since_s: Option<i64>,
    warn_bars: usize,
}

impl PevGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate the guard for one tick. `bar_advanced_5m` is true when a new
    /// 5m bar closed since the last tick.
    pub fn evaluate(
        &mut self,
        soft: &SoftDegrade,
        hard: &HardDiag,
        now_s: i64,
        bar_advanced_5m: bool,
        cfg: &PevConfig,
    ) -> PevOutcome {
        let diag = serde_json::json!({
            "soft": soft.soft,
            "adx": soft.adx,
            "atr_pct": soft.atr_pct,
            "adx_min_eff": soft.adx_min_eff,
            "slope3": soft.slope3,
            "hard": hard.hard,
            "ema_side_ok": hard.ema_side_ok,
            "struct_break": hard.struct_break,
            "warn_bars": self.warn_bars,
        });

        if !cfg.enabled {
            return PevOutcome { state: PevState::Ok, hard: false, diag };
        }

        if hard.hard {
            return PevOutcome { state: PevState::Exit, hard: true, diag };
        }

        if !soft.soft {
            // Recovered: drop any running grace window.
            self.warn_since_s = None;
            self.warn_bars = 0;
            return PevOutcome { state: PevState::Ok, hard: false, diag };
        }

        // Soft degrade: start or continue the grace window.
        let since = *self.warn_since_s.get_or_insert(now_s);
        if bar_advanced_5m {
            self.warn_bars += 1;
        }
        let elapsed_s = now_s - since;

        // "Whichever longer": both the bar budget and the seconds budget must
        // be exhausted before the soft path escalates.
        let exhausted = self.warn_bars >= cfg.grace_bars_5m && elapsed_s >= cfg.grace_min_s;
        let state = if exhausted { PevState::Exit } else { PevState::Warn };
        PevOutcome { state, hard: false, diag }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> PevConfig {
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

    fn soft(is_soft: bool) -> SoftDegrade {
        SoftDegrade { soft: is_soft, adx: 18.0, atr_pct: 0.001, adx_min_eff: 20.0, slope3: -1.0 }
    }

    fn hard(is_hard: bool) -> HardDiag {
        HardDiag {
            hard: is_hard,
            ema_side_ok: !is_hard,
            struct_break: is_hard,
            swing_high: None,
            swing_low: None,
            pad: 0.0,
        }
    }

    #[test]
    fn healthy_tick_is_ok() {
        let mut g = PevGuard::new();
        let out = g.evaluate(&soft(false), &hard(false), 1_000, false, &cfg());
        assert_eq!(out.state, PevState::Ok);
        assert!(!out.hard);
    }

    #[test]
    fn hard_invalidation_exits_immediately() {
        let mut g = PevGuard::new();
        let out = g.evaluate(&soft(false), &hard(true), 1_000, false, &cfg());
        assert_eq!(out.state, PevState::Exit);
        assert!(out.hard);
    }

    #[test]
    fn soft_degrade_warns_through_grace_then_exits() {
        let mut g = PevGuard::new();
        let c = cfg();
        // First soft tick: WARN, window opens.
        let out = g.evaluate(&soft(true), &hard(false), 0, false, &c);
        assert_eq!(out.state, PevState::Warn);
        // Bars accumulate but seconds budget not spent: still WARN.
        let out = g.evaluate(&soft(true), &hard(false), 60, true, &c);
        assert_eq!(out.state, PevState::Warn);
        let out = g.evaluate(&soft(true), &hard(false), 120, true, &c);
        assert_eq!(out.state, PevState::Warn);
        // Both budgets exhausted: EXIT, soft (not hard).
        let out = g.evaluate(&soft(true), &hard(false), 301, false, &c);
        assert_eq!(out.state, PevState::Exit);
        assert!(!out.hard);
    }

    #[test]
    fn seconds_alone_do_not_exhaust_grace() {
        let mut g = PevGuard::new();
        let c = cfg();
        g.evaluate(&soft(true), &hard(false), 0, false, &c);
        // Long wall-clock wait but no 5m bars: still WARN.
        let out = g.evaluate(&soft(true), &hard(false), 10_000, false, &c);
        assert_eq!(out.state, PevState::Warn);
    }

    #[test]
    fn recovery_resets_the_window() {
        let mut g = PevGuard::new();
        let c = cfg();
        g.evaluate(&soft(true), &hard(false), 0, true, &c);
        g.evaluate(&soft(true), &hard(false), 100, true, &c);
        // Conditions recover: OK and the window resets.
        let out = g.evaluate(&soft(false), &hard(false), 200, true, &c);
        assert_eq!(out.state, PevState::Ok);
        // A fresh degrade starts a fresh window (WARN, not EXIT).
        let out = g.evaluate(&soft(true), &hard(false), 10_000, false, &c);
        assert_eq!(out.state, PevState::Warn);
    }

    #[test]
    fn disabled_guard_always_ok() {
        let mut c = cfg();
        c.enabled = false;
        let mut g = PevGuard::new();
        let out = g.evaluate(&soft(true), &hard(true), 1_000, true, &c);
        assert_eq!(out.state, PevState::Ok);
    }
}
