// =============================================================================
// Average True Range
// =============================================================================
//
// True Range per bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// `atr` smooths TR with an EMA (the engines want a full series to measure
// slope and width against); `mean_range` is the cheap mean(H-L) proxy used
// where a full TR series is overkill (TASER structure math, heatmap tick
// sizing); `median_range` is the 1m micro-noise estimate feeding the SL pad.
// =============================================================================

use crate::indicators::ema::ema;

/// True-range series; the first element is 0 since there is no prior close.
pub fn true_range(highs: &[f64], lows: &[f64], closes: &[f64]) -> Vec<f64> {
    let n = closes.len();
    let mut trs = Vec::with_capacity(n);
    if n == 0 {
        return trs;
    }
    trs.push(0.0);
    for i in 1..n {
        let tr = (highs[i] - lows[i])
            .max((highs[i] - closes[i - 1]).abs())
            .max((lows[i] - closes[i - 1]).abs());
        trs.push(tr);
    }
    trs
}

/// EMA-smoothed ATR series (same length as input).
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], length: usize) -> Vec<f64> {
    ema(&true_range(highs, lows, closes), length)
}

/// Most recent ATR value, or 0.0 when the series is empty.
pub fn atr_last(highs: &[f64], lows: &[f64], closes: &[f64], length: usize) -> f64 {
    atr(highs, lows, closes, length).last().copied().unwrap_or(0.0)
}

/// ATR as a fraction of the last close (e.g. 0.004 = 0.40%).
pub fn atr_pct_last(highs: &[f64], lows: &[f64], closes: &[f64], length: usize) -> f64 {
    let price = closes.last().copied().unwrap_or(0.0);
    if price <= 0.0 {
        return 0.0;
    }
    atr_last(highs, lows, closes, length) / price
}

/// Mean high-low span over the last `n` bars. Cheap volatility proxy.
pub fn mean_range(highs: &[f64], lows: &[f64], n: usize) -> f64 {
    let k = n.min(highs.len()).min(lows.len());
    if k == 0 {
        return 0.0;
    }
    let hi = &highs[highs.len() - k..];
    let lo = &lows[lows.len() - k..];
    let sum: f64 = hi.iter().zip(lo).map(|(h, l)| (h - l).max(0.0)).sum();
    sum / k as f64
}

/// Median high-low span of the last `bars` bars (at least 3 when available).
/// Micro-noise estimate from 1m data, in absolute price units.
pub fn median_range(highs: &[f64], lows: &[f64], bars: usize) -> f64 {
    if highs.is_empty() || highs.len() != lows.len() {
        return 0.0;
    }
    let k = bars.max(3).min(highs.len());
    let mut spans: Vec<f64> = highs[highs.len() - k..]
        .iter()
        .zip(&lows[lows.len() - k..])
        .map(|(h, l)| (h - l).max(0.0))
        .collect();
    spans.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = spans.len();
    if n % 2 == 1 {
        spans[n / 2]
    } else {
        0.5 * (spans[n / 2 - 1] + spans[n / 2])
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn flat_bars(n: usize, span: f64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let highs = vec![100.0 + span / 2.0; n];
        let lows = vec![100.0 - span / 2.0; n];
        let closes = vec![100.0; n];
        (highs, lows, closes)
    }

    #[test]
    fn true_range_uses_prev_close_on_gaps() {
        // Gap up: |H - prevClose| dominates H - L.
        let highs = vec![105.0, 115.0];
        let lows = vec![95.0, 108.0];
        let closes = vec![95.0, 112.0];
        let trs = true_range(&highs, &lows, &closes);
        assert_eq!(trs[0], 0.0);
        assert!((trs[1] - 20.0).abs() < 1e-9); // |115 - 95|
    }

    #[test]
    fn atr_converges_to_constant_range() {
        let (h, l, c) = flat_bars(200, 2.0);
        let v = atr_last(&h, &l, &c, 14);
        assert!((v - 2.0).abs() < 0.1, "expected ATR near 2.0, got {v}");
    }

    #[test]
    fn atr_pct_scales_with_price() {
        let (h, l, c) = flat_bars(200, 1.0);
        let pct = atr_pct_last(&h, &l, &c, 14);
        assert!((pct - 0.01).abs() < 0.001, "got {pct}");
    }

    #[test]
    fn atr_empty_input() {
        assert_eq!(atr_last(&[], &[], &[], 14), 0.0);
        assert_eq!(atr_pct_last(&[], &[], &[], 14), 0.0);
    }

    #[test]
    fn mean_range_window() {
        let highs = vec![101.0, 102.0, 103.0];
        let lows = vec![100.0, 100.0, 100.0];
        assert!((mean_range(&highs, &lows, 2) - 2.5).abs() < 1e-9);
        assert_eq!(mean_range(&[], &[], 10), 0.0);
    }

    #[test]
    fn median_range_odd_and_even() {
        let highs = vec![101.0, 103.0, 102.0];
        let lows = vec![100.0; 3];
        // spans sorted: 1, 2, 3 -> median 2
        assert!((median_range(&highs, &lows, 3) - 2.0).abs() < 1e-9);

        let highs = vec![101.0, 103.0, 102.0, 104.0];
        let lows = vec![100.0; 4];
        // spans sorted: 1, 2, 3, 4 -> median 2.5
        assert!((median_range(&highs, &lows, 4) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn median_range_mismatched_lengths() {
        assert_eq!(median_range(&[1.0, 2.0], &[0.5], 3), 0.0);
    }
}
