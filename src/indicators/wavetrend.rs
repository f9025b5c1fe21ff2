// =============================================================================
// WaveTrend oscillator
// =============================================================================
//
//   esa = EMA(hlc3, ch_len)
//   d   = EMA(|hlc3 - esa|, ch_len)
//   ci  = (hlc3 - esa) / (0.015 * d)
//   wt  = EMA(ci, avg_len)
// =============================================================================

use crate::indicators::ema::ema;

/// WaveTrend series over a typical-price input, same length as the input.
pub fn wavetrend(hlc3: &[f64], ch_len: usize, avg_len: usize) -> Vec<f64> {
    if hlc3.is_empty() {
        return Vec::new();
    }
    let esa = ema(hlc3, ch_len);
    let d: Vec<f64> = hlc3.iter().zip(&esa).map(|(x, e)| (x - e).abs()).collect();
    let de = ema(&d, ch_len);
    let ci: Vec<f64> = hlc3
        .iter()
        .enumerate()
        .map(|(i, x)| (x - esa[i]) / (0.015 * de[i]).max(1e-12))
        .collect();
    ema(&ci, avg_len)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wavetrend_empty() {
        assert!(wavetrend(&[], 10, 11).is_empty());
    }

    #[test]
    fn wavetrend_positive_in_uptrend() {
        let tp: Vec<f64> = (0..100).map(|i| 100.0 + i as f64 * 0.5).collect();
        let out = wavetrend(&tp, 10, 11);
        assert_eq!(out.len(), 100);
        assert!(*out.last().unwrap() > 0.0);
    }

    #[test]
    fn wavetrend_negative_in_downtrend() {
        let tp: Vec<f64> = (0..100).map(|i| 200.0 - i as f64 * 0.5).collect();
        let out = wavetrend(&tp, 10, 11);
        assert!(*out.last().unwrap() < 0.0);
    }

    #[test]
    fn wavetrend_flat_is_near_zero() {
        let tp = vec![100.0; 100];
        let out = wavetrend(&tp, 10, 11);
        assert!(out.last().unwrap().abs() < 1e-6);
    }
}
