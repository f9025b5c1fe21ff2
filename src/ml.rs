// =============================================================================
// ML gate — k-NN Lorentzian directional classifier
// =============================================================================
//
// Features per bar: RSI(14), WaveTrend(10,11), CCI(20), ADX(20), RSI(9)
// (first `feature_count`, 2..=5). The current bar's feature vector is
// compared against history with the Lorentzian distance, walking back up to
// `max_back` bars at stride 4. A sliding set of k neighbors (kept sorted by
// increasing distance through the 3/4-quantile trim) votes with the sign of
// close[i+4] - close[i].
//
// Contract: `predict` returns (bias, confidence); warm only once
// `warmup_bars` of history exist. The neutral-and-zero result is the only
// no-signal encoding — a directional bias with zero confidence indicates an
// internal inconsistency and is logged.
// =============================================================================

use tracing::warn;

use crate::config::ScalpConfig;
use crate::indicators::adx::adx;
use crate::indicators::cci::cci;
use crate::indicators::hlc3;
use crate::indicators::lorentz::lorentz_distance;
use crate::indicators::rsi::rsi;
use crate::indicators::wavetrend::wavetrend;
use crate::types::TfSeries;

/// Neighbor-walk stride, mirroring the 4-bar label horizon.
const STRIDE: usize = 4;
/// Bars ahead used for the neighbor's direction label.
const LABEL_HORIZON: usize = 4;

/// Directional bias of the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    Long,
    Short,
    Neutral,
}

impl Bias {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
            Self::Neutral => "neutral",
        }
    }
}

impl std::fmt::Display for Bias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classifier output. `conf` is |vote sum| / k in [0, 1].
#[derive(Debug, Clone, Copy)]
pub struct MlSignal {
    pub bias: Bias,
    pub conf: f64,
    pub warm: bool,
}

impl MlSignal {
    pub fn cold() -> Self {
        Self { bias: Bias::Neutral, conf: 0.0, warm: false }
    }
}

/// Tracks confidence slope between consecutive predictions. Owned by the
/// manager; feeds the giveback guard.
#[derive(Debug, Default)]
pub struct MlTracker {
    prev_conf: Option<f64>,
    pub last_slope: f64,
}

impl MlTracker {
    pub fn observe(&mut self, sig: &MlSignal) -> f64 {
        let slope = match self.prev_conf {
            Some(prev) => sig.conf - prev,
            None => 0.0,
        };
        self.prev_conf = Some(sig.conf);
        self.last_slope = slope;
        slope
    }
}

/// Per-bar feature matrix, row-major by feature.
fn feature_series(closes: &[f64], highs: &[f64], lows: &[f64], count: usize) -> Vec<Vec<f64>> {
    let tp = hlc3(highs, lows, closes);
    let all: [Vec<f64>; 5] = [
        rsi(closes, 14),
        wavetrend(&tp, 10, 11),
        cci(closes, highs, lows, 20),
        adx(highs, lows, closes, 20),
        rsi(closes, 9),
    ];
    all.into_iter().take(count.clamp(2, 5)).collect()
}

/// Run the classifier over a 5m series.
pub fn predict(tf5: &TfSeries, cfg: &ScalpConfig) -> MlSignal {
    if tf5.len() < cfg.warmup_bars {
        return MlSignal::cold();
    }
    let (bias, sum) = knn_vote(
        &tf5.close,
        &tf5.high,
        &tf5.low,
        cfg.neighbors,
        cfg.max_back,
        cfg.feature_count,
    );
    let conf = (sum.abs() / cfg.neighbors.max(1) as f64).clamp(0.0, 1.0);

    if bias != Bias::Neutral && conf == 0.0 {
        // Contract violation: direction without confidence.
        warn!(bias = %bias, "ml gate produced directional bias with zero confidence");
    }

    MlSignal { bias, conf, warm: true }
}

/// Core k-NN vote. Returns (bias, signed vote sum).
fn knn_vote(
    closes: &[f64],
    highs: &[f64],
    lows: &[f64],
    k: usize,
    max_back: usize,
    feature_count: usize,
) -> (Bias, f64) {
    let n = closes.len();
    if n < STRIDE + 2 || k == 0 {
        return (Bias::Neutral, 0.0);
    }
    let series = feature_series(closes, highs, lows, feature_count);
    let now: Vec<f64> = series.iter().map(|s| s[n - 1]).collect();

    let back = max_back.min(n.saturating_sub(LABEL_HORIZON + 1));
    let start = n - back;

    let mut preds: Vec<f64> = Vec::with_capacity(k + 1);
    let mut dists: Vec<f64> = Vec::with_capacity(k + 1);
    let mut last_d = -1.0_f64;

    for i in start..n - (LABEL_HORIZON + 1) {
        if i % STRIDE != 0 {
            continue;
        }
        let vec_i: Vec<f64> = series.iter().map(|s| s[i]).collect();
        let d = lorentz_distance(&now, &vec_i);
        if d >= last_d {
            last_d = d;
            dists.push(d);
            let label = if closes[i + LABEL_HORIZON] > closes[i] {
                1.0
            } else if closes[i + LABEL_HORIZON] < closes[i] {
                -1.0
            } else {
                0.0
            };
            preds.push(label);
            if preds.len() > k {
                // Trim the oldest neighbor and reset the admission bar to
                // the 3/4-quantile of retained distances.
                let q = (k * 3) / 4;
                last_d = dists.get(q).copied().unwrap_or(d);
                dists.remove(0);
                preds.remove(0);
            }
        }
    }

    let sum: f64 = preds.iter().sum();
    let bias = if sum > 0.0 {
        Bias::Long
    } else if sum < 0.0 {
        Bias::Short
    } else {
        Bias::Neutral
    };
    (bias, sum)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn scalp_cfg(warmup: usize) -> ScalpConfig {
        ScalpConfig {
            enabled: true,
            neighbors: 8,
            max_back: 2000,
            feature_count: 5,
            warmup_bars: warmup,
            tl_lookback: 14,
            tl_slope_method: "atr".into(),
            tl_slope_mult: 1.0,
            ema_fast: 8,
            ema_slow: 20,
            trend_slope_len: 25,
            trend_slope_min: 0.0,
            vol_floor_pct: 0.0020,
            adx_min: 20.0,
            adx_soft: 15.0,
            adx_slope_bonus: 2.0,
            override_ema_rsi: false,
            ma_buffer_pct: 0.0015,
            ma_require_15m: false,
            rsi15_neutral_lo: 45.0,
            rsi15_neutral_hi: 55.0,
            rsi_overheat_hi: 65.0,
            rsi_overheat_lo: 35.0,
            use_rsi_filter: true,
            use_regime_filter: true,
            require_both: true,
            pullback_pct: 0.0025,
            wai_min: 0.6,
            tl_width_atr_mult: 0.5,
            adapt_regime: true,
            adapt_adx1: 30.0,
            adapt_adx2: 40.0,
            adapt_mult1: 0.35,
            adapt_mult2: 0.25,
            stop_mode: "trendline".into(),
            reentry_cooldown_bars_5m: 1,
        }
    }

    fn trending_tf(n: usize, step: f64) -> TfSeries {
        let mut tf = TfSeries::default();
        for i in 0..n {
            let base = 100.0 + i as f64 * step;
            tf.push_bar(i as i64 * 300_000, base, base + 0.6, base - 0.4, base + 0.2, 10.0);
        }
        tf
    }

    #[test]
    fn cold_below_warmup_boundary() {
        let cfg = scalp_cfg(600);
        let tf = trending_tf(599, 0.1);
        let sig = predict(&tf, &cfg);
        assert!(!sig.warm);
        assert_eq!(sig.bias, Bias::Neutral);
        assert_eq!(sig.conf, 0.0);
    }

    #[test]
    fn warm_at_exact_warmup_boundary() {
        let cfg = scalp_cfg(600);
        let tf = trending_tf(600, 0.1);
        let sig = predict(&tf, &cfg);
        assert!(sig.warm);
    }

    #[test]
    fn uptrend_votes_long() {
        let cfg = scalp_cfg(100);
        let tf = trending_tf(700, 0.3);
        let sig = predict(&tf, &cfg);
        assert_eq!(sig.bias, Bias::Long);
        assert!(sig.conf > 0.0);
        assert!(sig.conf <= 1.0);
    }

    #[test]
    fn downtrend_votes_short() {
        let cfg = scalp_cfg(100);
        let mut tf = TfSeries::default();
        for i in 0..700 {
            let base = 500.0 - i as f64 * 0.3;
            tf.push_bar(i as i64 * 300_000, base, base + 0.4, base - 0.6, base - 0.2, 10.0);
        }
        let sig = predict(&tf, &cfg);
        assert_eq!(sig.bias, Bias::Short);
    }

    #[test]
    fn flat_tape_is_neutral() {
        let cfg = scalp_cfg(100);
        let mut tf = TfSeries::default();
        for i in 0..700 {
            tf.push_bar(i as i64 * 300_000, 100.0, 100.5, 99.5, 100.0, 10.0);
        }
        let sig = predict(&tf, &cfg);
        assert_eq!(sig.bias, Bias::Neutral);
        assert_eq!(sig.conf, 0.0);
    }

    #[test]
    fn tracker_slope_follows_confidence() {
        let mut tracker = MlTracker::default();
        let first = MlSignal { bias: Bias::Long, conf: 0.5, warm: true };
        assert_eq!(tracker.observe(&first), 0.0);
        let second = MlSignal { bias: Bias::Long, conf: 0.75, warm: true };
        assert!((tracker.observe(&second) - 0.25).abs() < 1e-12);
        let third = MlSignal { bias: Bias::Long, conf: 0.25, warm: true };
        assert!((tracker.observe(&third) + 0.5).abs() < 1e-12);
        assert!(tracker.last_slope < 0.0);
    }

    #[test]
    fn knn_zero_k_is_neutral() {
        let tf = trending_tf(100, 0.3);
        let (bias, sum) = knn_vote(&tf.close, &tf.high, &tf.low, 0, 1000, 5);
        assert_eq!(bias, Bias::Neutral);
        assert_eq!(sum, 0.0);
    }
}
