// =============================================================================
// Average Directional Index
// =============================================================================
//
// Pipeline:
//   1. +DM / -DM and True Range per bar.
//   2. EMA-smooth +DM, -DM, TR over `length`.
//   3. +DI / -DI as percentages of smoothed TR.
//   4. DX = |+DI - -DI| / (+DI + -DI) * 100, EMA-smoothed into ADX.
//
// Returns a full series so callers can measure the short-horizon slope
// (slope-bonus gates, soft-degrade checks) as well as the latest value.
//
//   ADX > 25  => trending tape
//   ADX < 20  => ranging tape
// =============================================================================

use crate::indicators::ema::ema;

/// ADX series the same length as the input.
pub fn adx(highs: &[f64], lows: &[f64], closes: &[f64], length: usize) -> Vec<f64> {
    let n = closes.len();
    if n == 0 {
        return Vec::new();
    }
    let mut tr = Vec::with_capacity(n);
    let mut plus_dm = Vec::with_capacity(n);
    let mut minus_dm = Vec::with_capacity(n);
    tr.push(0.0);
    plus_dm.push(0.0);
    minus_dm.push(0.0);
    for i in 1..n {
        let up = highs[i] - highs[i - 1];
        let dn = lows[i - 1] - lows[i];
        let tr_i = (highs[i] - lows[i])
            .max((highs[i] - closes[i - 1]).abs())
            .max((lows[i] - closes[i - 1]).abs());
        tr.push(tr_i);
        plus_dm.push(if up > dn && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if dn > up && dn > 0.0 { dn } else { 0.0 });
    }

    let tr_s = ema(&tr, length);
    let p_s = ema(&plus_dm, length);
    let m_s = ema(&minus_dm, length);

    let dx: Vec<f64> = (0..n)
        .map(|i| {
            let pdi = 100.0 * p_s[i] / tr_s[i].max(1e-12);
            let mdi = 100.0 * m_s[i] / tr_s[i].max(1e-12);
            100.0 * (pdi - mdi).abs() / (pdi + mdi).max(1e-12)
        })
        .collect();
    ema(&dx, length)
}

/// Latest ADX value, or 0.0 when the series is empty.
pub fn adx_last(highs: &[f64], lows: &[f64], closes: &[f64], length: usize) -> f64 {
    adx(highs, lows, closes, length).last().copied().unwrap_or(0.0)
}

/// Short-horizon ADX slope: last value minus the value `bars` back.
pub fn adx_slope(series: &[f64], bars: usize) -> f64 {
    if series.len() <= bars || bars == 0 {
        return 0.0;
    }
    series[series.len() - 1] - series[series.len() - 1 - bars]
}
