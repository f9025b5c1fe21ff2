// =============================================================================
// Liquidity heatmap — volume/dwell-weighted price bins with decay
// =============================================================================
//
// Per bin:
//   score = (vol^alpha) * ((1/range)^(1-alpha)) * 0.5^(age / half_life)
//
// alpha blends volume dominance against dwell dominance (narrow ranges =
// congestion). Newer bars weigh more through the half-life decay. Adjacent
// bins within `min_spacing_bins * tick` merge into one level (score-weighted
// center). The multi-TF confluence gate blocks entries that would run
// straight into stacked walls across timeframes.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::config::HeatmapConfig;
use crate::indicators::atr::mean_range;
use crate::types::{Side, TfSeries};

/// One clustered price level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatLevel {
    pub px: f64,
    pub score: f64,
}

/// Heatmap for a single timeframe: top levels (score-desc) and a compact
/// histogram slice (px-desc) for persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TfHeatmap {
    pub levels: Vec<HeatLevel>,
    pub hist: Vec<HeatLevel>,
    pub window: usize,
    pub tick: f64,
}

/// Heatmaps across the gating timeframes. The 30d view is synthesized from
/// 1h history by the scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiHeatmap {
    pub m5: Option<TfHeatmap>,
    pub m15: Option<TfHeatmap>,
    pub h1: Option<TfHeatmap>,
    pub d1: Option<TfHeatmap>,
    pub d30: Option<TfHeatmap>,
}

impl MultiHeatmap {
    /// (label, heatmap) pairs for the populated timeframes, gating order.
    pub fn frames(&self) -> Vec<(&'static str, &TfHeatmap)> {
        [
            ("5m", self.m5.as_ref()),
            ("15m", self.m15.as_ref()),
            ("1h", self.h1.as_ref()),
            ("1d", self.d1.as_ref()),
            ("30d", self.d30.as_ref()),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.map(|hm| (k, hm)))
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.frames().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Adaptive bin size: `tick_pct = max(bin_pct_min, bin_atr_frac * atr_pct)`,
/// floored to a 0.01 step.
fn adaptive_tick(last_px: f64, atr_pct: f64, cfg: &HeatmapConfig) -> f64 {
    let pct = cfg.bin_pct_min.max(cfg.bin_atr_frac * atr_pct.max(0.0));
    let raw = (last_px * pct).max(1e-6);
    let step = 0.01;
    ((raw / step).floor() * step).max(step)
}

fn bin_price(px: f64, tick: f64) -> f64 {
    let t = if tick > 0.0 { tick } else { 0.01 };
    ((px / t).floor() * t * 1e6).round() / 1e6
}

fn decay_weight(age_bars: usize, half_life: f64) -> f64 {
    if half_life <= 0.0 {
        return 1.0;
    }
    0.5_f64.powf(age_bars as f64 / half_life)
}

/// Merge neighboring bins within `min_spacing_bins * tick`, score-weighted.
fn merge_nearby(mut levels: Vec<(f64, f64)>, min_spacing_bins: usize, tick: f64) -> Vec<(f64, f64)> {
    if levels.is_empty() {
        return levels;
    }
    levels.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    let span = min_spacing_bins.max(1) as f64 * tick.max(1e-9);

    let mut out: Vec<(f64, f64)> = Vec::new();
    let (mut cluster_px, mut cluster_score) = levels[0];
    for &(px, sc) in &levels[1..] {
        if (px - cluster_px).abs() <= span {
            let total = cluster_score + sc;
            if total > 0.0 {
                cluster_px = (cluster_px * cluster_score + px * sc) / total;
            }
            cluster_score = total;
        } else {
            out.push((round6(cluster_px), cluster_score));
            cluster_px = px;
            cluster_score = sc;
        }
    }
    out.push((round6(cluster_px), cluster_score));
    out
}

fn round6(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

/// Build a heatmap for one timeframe. `tick` is adaptive when `None`.
pub fn build(tf: &TfSeries, window: usize, tick: Option<f64>, half_life: f64, cfg: &HeatmapConfig) -> TfHeatmap {
    if tf.close.is_empty() || tf.high.is_empty() || tf.low.is_empty() {
        return TfHeatmap { tick: 0.01, ..TfHeatmap::default() };
    }

    let last_px = tf.close[tf.close.len() - 1];
    let atr = mean_range(&tf.high, &tf.low, 60.min(tf.high.len()));
    let atr_pct = if last_px > 0.0 { atr / last_px } else { 0.0 };
    let tick = match tick {
        Some(t) if t > 0.0 => t,
        _ => adaptive_tick(last_px, atr_pct, cfg),
    };

    let n = window.min(tf.len());
    if n == 0 {
        return TfHeatmap { tick, ..TfHeatmap::default() };
    }

    let alpha = cfg.dwell_alpha.clamp(0.0, 1.0);
    let base_idx = tf.len() - n;
    let mut acc: std::collections::BTreeMap<i64, f64> = std::collections::BTreeMap::new();
    for j in 0..n {
        let i = base_idx + j;
        let age = n - 1 - j; // 0 for the most recent bar
        let decay = decay_weight(age, half_life);
        let rng = (tf.high[i] - tf.low[i]).max(1e-9);
        let vol = tf.volume.get(i).copied().unwrap_or(1.0).max(0.0);
        let vol = if vol > 0.0 { vol } else { 1.0 };
        let score = vol.powf(alpha) * (1.0 / rng).powf(1.0 - alpha) * decay;
        let key = (bin_price(tf.close[i], tick) / tick).round() as i64;
        *acc.entry(key).or_insert(0.0) += score;
    }

    let binned: Vec<(f64, f64)> = acc
        .iter()
        .map(|(k, v)| (round6(*k as f64 * tick), *v))
        .collect();

    // Histogram: px descending.
    let mut hist: Vec<HeatLevel> = binned
        .iter()
        .map(|&(px, score)| HeatLevel { px, score })
        .collect();
    hist.sort_by(|a, b| b.px.partial_cmp(&a.px).unwrap_or(std::cmp::Ordering::Equal));
    hist.truncate(240);

    // Levels: cluster, then score descending.
    let mut merged = merge_nearby(binned, cfg.min_spacing_bins, tick);
    merged.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let levels = merged
        .into_iter()
        .take(cfg.top_k.max(1))
        .map(|(px, score)| HeatLevel { px, score })
        .collect();

    TfHeatmap { levels, hist, window: n, tick }
}

/// Build heatmaps across all gating timeframes. Absent inputs yield absent
/// frames.
pub fn build_multi(
    tf5: Option<&TfSeries>,
    tf15: Option<&TfSeries>,
    tf1h: Option<&TfSeries>,
    tf1d: Option<&TfSeries>,
    tf30d: Option<&TfSeries>,
    cfg: &HeatmapConfig,
) -> MultiHeatmap {
    let mk = |tf: Option<&TfSeries>, hl: f64| {
        tf.filter(|t| t.is_coherent()).map(|t| build(t, 180, None, hl, cfg))
    };
    MultiHeatmap {
        m5: mk(tf5, cfg.half_life_5m),
        m15: mk(tf15, cfg.half_life_15m),
        h1: mk(tf1h, cfg.half_life_1h),
        d1: mk(tf1d, cfg.half_life_1d),
        d30: mk(tf30d, cfg.half_life_1d),
    }
}

// ---------------------------------------------------------------------------
// Confluence gate
// ---------------------------------------------------------------------------

/// Gate thresholds, parameterized by aggression profile.
#[derive(Debug, Clone, Copy)]
pub struct GateParams {
    pub tol_pct: f64,
    pub need_tfs: usize,
    pub top_n: usize,
}

impl GateParams {
    pub fn for_aggression(aggression: &str) -> Self {
        match aggression.trim().to_lowercase().as_str() {
            "aggressive" => Self { tol_pct: 0.0010, need_tfs: 3, top_n: 12 },
            "conservative" => Self { tol_pct: 0.0025, need_tfs: 2, top_n: 16 },
            _ => Self { tol_pct: 0.0015, need_tfs: 2, top_n: 12 },
        }
    }
}

/// Outcome of the confluence check.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GateResult {
    pub near: bool,
    pub block: bool,
    pub why: String,
    pub hits_above: usize,
    pub hits_below: usize,
}

/// Block an entry when stacked walls sit within tolerance of price on the
/// side the trade would run into, across at least `need_tfs` timeframes.
pub fn confluence_gate(hm: &MultiHeatmap, price: f64, side: Side, params: GateParams) -> GateResult {
    if hm.is_empty() {
        return GateResult::default();
    }

    let tol = price * params.tol_pct;
    let mut hits_above = 0usize;
    let mut hits_below = 0usize;
    for (_, frame) in hm.frames() {
        let near: Vec<&HeatLevel> = frame
            .levels
            .iter()
            .take(params.top_n)
            .filter(|lv| (lv.px - price).abs() <= tol)
            .collect();
        if near.iter().any(|lv| lv.px >= price) {
            hits_above += 1;
        }
        if near.iter().any(|lv| lv.px <= price) {
            hits_below += 1;
        }
    }

    let near = hits_above + hits_below > 0;
    let (block, why) = match side {
        Side::Long if hits_above >= params.need_tfs => {
            (true, format!("near multi-TF resistance ({hits_above} TFs)"))
        }
        Side::Short if hits_below >= params.need_tfs => {
            (true, format!("near multi-TF support ({hits_below} TFs)"))
        }
        _ => (false, String::new()),
    };

    GateResult { near, block, why, hits_above, hits_below }
}
