// =============================================================================
// Commodity Channel Index
// =============================================================================
//
//   CCI = 0.015 * (tp - SMA(tp, n)) / mean_deviation
//
// Mean deviation uses the same growing-window warm-up as the SMA so the
// output is aligned with the input.
// =============================================================================

use crate::indicators::ema::sma;
use crate::indicators::hlc3;

/// CCI series over typical price, same length as the input.
pub fn cci(closes: &[f64], highs: &[f64], lows: &[f64], length: usize) -> Vec<f64> {
    let tp = hlc3(highs, lows, closes);
    let mean = sma(&tp, length);
    let n = length.max(1);
    let mut out = Vec::with_capacity(tp.len());
    for i in 0..tp.len() {
        let window = (i + 1).min(n);
        let start = i + 1 - window;
        let dev: f64 = tp[start..=i].iter().map(|x| (x - mean[i]).abs()).sum::<f64>()
            / window as f64;
        out.push(0.015 * (tp[i] - mean[i]) / dev.max(1e-12));
    }
    out
}
