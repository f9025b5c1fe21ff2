// =============================================================================
// VWAP and Anchored VWAP
// =============================================================================
//
// Rolling VWAP accumulates typical-price * volume over the whole window the
// caller supplies. Anchored VWAP starts the accumulation at a swing index
// (major high/low) and yields None before the anchor.
// =============================================================================

/// Rolling volume-weighted average price, same length as the inputs.
pub fn vwap(highs: &[f64], lows: &[f64], closes: &[f64], volumes: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(closes.len());
    let mut cum_pv = 0.0;
    let mut cum_v = 0.0;
    for i in 0..closes.len() {
        let tp = (highs[i] + lows[i] + closes[i]) / 3.0;
        let v = volumes.get(i).copied().unwrap_or(0.0);
        cum_pv += tp * v;
        cum_v += v;
        out.push(cum_pv / cum_v.max(1e-9));
    }
    out
}

/// Anchored VWAP from `start_idx` (inclusive). Aligned to the inputs with
/// `None` before the anchor.
pub fn anchored_vwap(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    volumes: &[f64],
    start_idx: usize,
) -> Vec<Option<f64>> {
    let n = closes.len();
    if n == 0 {
        return Vec::new();
    }
    let start = start_idx.min(n);
    let mut out: Vec<Option<f64>> = vec![None; start];
    let mut cum_pv = 0.0;
    let mut cum_v = 0.0;
    for i in start..n {
        let tp = (highs[i] + lows[i] + closes[i]) / 3.0;
        let v = volumes.get(i).copied().unwrap_or(0.0);
        cum_pv += tp * v;
        cum_v += v;
        out.push(Some(cum_pv / cum_v.max(1e-9)));
    }
    out
}

/// Index of the highest and lowest close over the last `lookback` bars.
/// Used to anchor AVWAPs at the most recent major swings.
pub fn major_swings(closes: &[f64], lookback: usize) -> (usize, usize) {
    let start = closes.len().saturating_sub(lookback);
    let mut hi = start;
    let mut lo = start;
    for i in start..closes.len() {
        if closes[i] > closes[hi] {
            hi = i;
        }
        if closes[i] < closes[lo] {
            lo = i;
        }
    }
    (hi, lo)
}
