// =============================================================================
// Relative Strength Index — Wilder's smoothing
// =============================================================================
//
//   up_t = (up_{t-1} * (n-1) + max(Δ, 0)) / n
//   dn_t = (dn_{t-1} * (n-1) + max(-Δ, 0)) / n
//   RSI  = 100 - 100 / (1 + up/dn)
//
// The series is the same length as the input; the first element is the
// neutral 50 since no delta exists yet.
// =============================================================================

/// Wilder RSI over `closes`. Same-length output, seeded at 50.
pub fn rsi(closes: &[f64], length: usize) -> Vec<f64> {
    let n = length.max(1) as f64;
    let mut out = Vec::with_capacity(closes.len());
    let mut up = 0.0;
    let mut dn = 0.0;
    for (i, &c) in closes.iter().enumerate() {
        if i == 0 {
            out.push(50.0);
            continue;
        }
        let ch = c - closes[i - 1];
        up = (up * (n - 1.0) + ch.max(0.0)) / n;
        dn = (dn * (n - 1.0) + (-ch).max(0.0)) / n;
        let rs = up / dn.max(1e-12);
        out.push(100.0 - 100.0 / (1.0 + rs));
    }
    out
}

/// Short-horizon slope of an RSI series (last minus `bars` back).
pub fn rsi_slope(series: &[f64], bars: usize) -> f64 {
    if series.len() < bars.max(1) || bars == 0 {
        return 0.0;
    }
    series[series.len() - 1] - series[series.len() - bars]
}
