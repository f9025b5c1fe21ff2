// =============================================================================
// MACD — Moving Average Convergence/Divergence
// =============================================================================

use crate::indicators::ema::ema;

/// Latest (macd_line, signal, histogram) triple using EMA(fast/slow/signal).
/// Returns `None` when the input is empty.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal_len: usize) -> Option<(f64, f64, f64)> {
    if closes.is_empty() {
        return None;
    }
    let ef = ema(closes, fast);
    let es = ema(closes, slow);
    let line: Vec<f64> = ef.iter().zip(&es).map(|(f, s)| f - s).collect();
    let sig = ema(&line, signal_len);
    let m = *line.last()?;
    let s = *sig.last()?;
    Some((m, s, m - s))
}

/// MACD with the conventional 12/26/9 parameters.
pub fn macd_default(closes: &[f64]) -> Option<(f64, f64, f64)> {
    macd(closes, 12, 26, 9)
}
