// =============================================================================
// Signal engines — dispatch across the configured engine order
// =============================================================================
//
// Engines share one capability: given the scan context, produce a Signal.
// The scheduler walks ENGINE_ORDER and stops at the first engine returning a
// directional side. Engine errors must never escape: a failed engine is a
// NONE signal.
// =============================================================================

pub mod taser;
pub mod trendscalp;

use crate::config::Config;
use crate::telemetry::Telemetry;
use crate::types::{Signal, TfSeries};

/// Known engines, in the order vocabulary of ENGINE_ORDER.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    TrendScalp,
    Taser,
}

impl EngineKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "trendscalp" => Some(Self::TrendScalp),
            "taser" => Some(Self::Taser),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::TrendScalp => "trendscalp",
            Self::Taser => "taser",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Immutable per-scan market context handed to every engine.
pub struct ScanCtx<'a> {
    pub price: f64,
    pub tf1m: &'a TfSeries,
    pub tf5: &'a TfSeries,
    pub tf15: &'a TfSeries,
    pub tf1h: &'a TfSeries,
    pub pdh: Option<f64>,
    pub pdl: Option<f64>,
    /// Open-interest direction proxy; None when unavailable.
    pub oi_up: Option<bool>,
    /// Taker-flow direction proxy; None when unavailable.
    pub delta_pos: Option<bool>,
}

/// Signed volume proxy from 5m candles: up-closes add volume, down-closes
/// subtract it.
pub fn pseudo_delta(tf5: &TfSeries, look: usize) -> f64 {
    let n = look.min(tf5.len());
    let mut val = 0.0;
    for i in tf5.len() - n..tf5.len() {
        let sign = if tf5.close[i] >= tf5.open[i] { 1.0 } else { -1.0 };
        val += sign * tf5.volume.get(i).copied().unwrap_or(0.0);
    }
    val
}

/// Stateful engine set. TrendScalp keeps its local re-entry memory; TASER is
/// stateless.
pub struct Engines {
    trendscalp: trendscalp::TrendScalpEngine,
}

impl Engines {
    pub fn new() -> Self {
        Self { trendscalp: trendscalp::TrendScalpEngine::new() }
    }

    /// Run one engine against the scan context.
    pub fn signal(&mut self, kind: EngineKind, ctx: &ScanCtx<'_>, cfg: &Config, tel: &Telemetry) -> Signal {
        match kind {
            EngineKind::TrendScalp => self.trendscalp.signal(ctx, cfg, tel),
            EngineKind::Taser => taser::signal(ctx, cfg),
        }
    }
}

impl Default for Engines {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_kind_parse_and_label() {
        assert_eq!(EngineKind::parse("trendscalp"), Some(EngineKind::TrendScalp));
        assert_eq!(EngineKind::parse("TASER"), Some(EngineKind::Taser));
        assert_eq!(EngineKind::parse("unknown"), None);
        assert_eq!(EngineKind::TrendScalp.label(), "trendscalp");
    }

    #[test]
    fn pseudo_delta_sign() {
        let mut tf = TfSeries::default();
        // Three up bars, one down bar with more volume.
        tf.push_bar(0, 100.0, 101.0, 99.0, 100.5, 10.0);
        tf.push_bar(1, 100.5, 101.5, 100.0, 101.0, 10.0);
        tf.push_bar(2, 101.0, 102.0, 100.5, 101.5, 10.0);
        tf.push_bar(3, 101.5, 102.0, 99.0, 99.5, 50.0);
        // Full window: +10 +10 +10 - 50 = -20.
        assert!((pseudo_delta(&tf, 4) + 20.0).abs() < 1e-9);
        // Up-bars only.
        assert!((pseudo_delta(&tf, 3) + 30.0).abs() < 1e-9);
        // Window wider than the series clamps to what exists.
        assert!((pseudo_delta(&tf, 100) + 20.0).abs() < 1e-9);
    }
}
