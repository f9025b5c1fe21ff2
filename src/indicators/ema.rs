// =============================================================================
// Exponential / Simple Moving Averages
// =============================================================================

/// Exponential moving average. Returns a series the same length as `values`,
/// seeded with the first value. Empty input yields an empty series.
pub fn ema(values: &[f64], length: usize) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let n = length.max(1);
    let k = 2.0 / (n as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut e = values[0];
    out.push(e);
    for &v in &values[1..] {
        e += k * (v - e);
        out.push(e);
    }
    out
}

/// Simple moving average with a growing window during warm-up, so the output
/// is the same length as the input.
pub fn sma(values: &[f64], length: usize) -> Vec<f64> {
    let n = length.max(1);
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for (i, &v) in values.iter().enumerate() {
        sum += v;
        if i >= n {
            sum -= values[i - n];
        }
        let window = (i + 1).min(n);
        out.push(sum / window as f64);
    }
    out
}

/// Slope of a series over the last `len` points, per bar.
pub fn slope(values: &[f64], len: usize) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let l = len.clamp(2, values.len() - 1);
    (values[values.len() - 1] - values[values.len() - 1 - l]) / l.max(1) as f64
}
