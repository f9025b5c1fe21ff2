// =============================================================================
// Trendlines with breaks
// =============================================================================
//
// Pivot highs/lows over a symmetric lookback seed decaying channel lines:
// after each pivot the upper line falls (and the lower line rises) by a
// per-bar slope derived from ATR, linear-regression beta, or stdev. A break
// fires on the first close beyond the decayed line — subsequent closes on
// the same side do not re-fire.
// =============================================================================

use crate::indicators::atr::atr;

/// How the per-bar decay slope is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlopeMethod {
    Atr,
    Linreg,
    Stdev,
}

impl SlopeMethod {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "linreg" => Self::Linreg,
            "stdev" => Self::Stdev,
            _ => Self::Atr,
        }
    }
}

/// Decayed channel lines plus break markers for the most recent bar.
#[derive(Debug, Clone)]
pub struct Trendlines {
    pub upper: Vec<f64>,
    pub lower: Vec<f64>,
    /// Per-bar first-cross markers.
    pub upper_breaks: Vec<bool>,
    pub lower_breaks: Vec<bool>,
}

impl Trendlines {
    pub fn upper_break_now(&self) -> bool {
        self.upper_breaks.last().copied().unwrap_or(false)
    }

    pub fn lower_break_now(&self) -> bool {
        self.lower_breaks.last().copied().unwrap_or(false)
    }

    /// Channel width at the latest bar.
    pub fn width_now(&self) -> f64 {
        match (self.upper.last(), self.lower.last()) {
            (Some(u), Some(l)) => (u - l).abs(),
            _ => 0.0,
        }
    }
}

/// Compute decayed trendlines and break markers.
pub fn trendlines(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    length: usize,
    method: SlopeMethod,
    mult: f64,
) -> Trendlines {
    let n = closes.len();
    let len = length.max(1);
    let mut pivot_high: Vec<Option<f64>> = vec![None; n];
    let mut pivot_low: Vec<Option<f64>> = vec![None; n];

    if n > 2 * len {
        for i in len..(n - len) {
            let is_ph = (1..=len).all(|d| highs[i] >= highs[i - d])
                && (1..=len).all(|d| highs[i] > highs[i + d]);
            if is_ph {
                pivot_high[i] = Some(highs[i]);
            }
            let is_pl = (1..=len).all(|d| lows[i] <= lows[i - d])
                && (1..=len).all(|d| lows[i] < lows[i + d]);
            if is_pl {
                pivot_low[i] = Some(lows[i]);
            }
        }
    }

    let atr_series = atr(highs, lows, closes, len);

    let slope_at = |i: usize| -> f64 {
        let m = len.min(i + 1);
        match method {
            SlopeMethod::Stdev => {
                let start = i + 1 - m;
                let mean = closes[start..=i].iter().sum::<f64>() / m as f64;
                let var = closes[start..=i]
                    .iter()
                    .map(|c| (c - mean).powi(2))
                    .sum::<f64>()
                    / m as f64;
                var.sqrt() / m.max(1) as f64 * mult
            }
            SlopeMethod::Linreg => {
                let start = i + 1 - m;
                let xs: Vec<f64> = (0..m).map(|t| t as f64).collect();
                let ys = &closes[start..=i];
                let xbar = xs.iter().sum::<f64>() / m as f64;
                let ybar = ys.iter().sum::<f64>() / m as f64;
                let num: f64 = xs.iter().zip(ys).map(|(x, y)| (x - xbar) * (y - ybar)).sum();
                let den: f64 = xs.iter().map(|x| (x - xbar).powi(2)).sum::<f64>().max(1.0);
                (num / den).abs() / 2.0 * mult
            }
            SlopeMethod::Atr => atr_series[i] / len.max(1) as f64 * mult,
        }
    };

    let mut upper = vec![0.0; n];
    let mut lower = vec![0.0; n];
    let mut upper_breaks = vec![false; n];
    let mut lower_breaks = vec![false; n];
    if n == 0 {
        return Trendlines { upper, lower, upper_breaks, lower_breaks };
    }

    let mut s_ph = 0.0;
    let mut s_pl = 0.0;
    let mut prev_cond_up = false;
    let mut prev_cond_dn = false;
    for i in 0..n {
        if let Some(ph) = pivot_high[i] {
            s_ph = slope_at(i);
            upper[i] = ph;
        } else {
            upper[i] = if i > 0 { upper[i - 1] - s_ph } else { closes[0] };
        }
        if let Some(pl) = pivot_low[i] {
            s_pl = slope_at(i);
            lower[i] = pl;
        } else {
            lower[i] = if i > 0 { lower[i - 1] + s_pl } else { closes[0] };
        }

        let cond_up = pivot_high[i].is_none() && closes[i] > upper[i] - s_ph * len as f64;
        let cond_dn = pivot_low[i].is_none() && closes[i] < lower[i] + s_pl * len as f64;
        upper_breaks[i] = cond_up && i > 0 && !prev_cond_up;
        lower_breaks[i] = cond_dn && i > 0 && !prev_cond_dn;
        prev_cond_up = cond_up;
        prev_cond_dn = cond_dn;
    }

    Trendlines { upper, lower, upper_breaks, lower_breaks }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    /// Range-bound tape with one hard breakout at the end.
    fn breakout_tape() -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let mut closes = Vec::new();
        for i in 0..80 {
            closes.push(100.0 + ((i as f64) * 0.8).sin() * 1.5);
        }
        // Breakout: three strong closes above the whole range.
        closes.extend([104.0, 105.0, 106.0]);
        let highs: Vec<f64> = closes.iter().map(|c| c + 0.4).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.4).collect();
        (highs, lows, closes)
    }

    #[test]
    fn lines_cover_full_series() {
        let (h, l, c) = breakout_tape();
        let tl = trendlines(&h, &l, &c, 14, SlopeMethod::Atr, 1.0);
        assert_eq!(tl.upper.len(), c.len());
        assert_eq!(tl.lower.len(), c.len());
    }

    #[test]
    fn breakout_fires_once() {
        let (h, l, c) = breakout_tape();
        let tl = trendlines(&h, &l, &c, 14, SlopeMethod::Atr, 1.0);
        let fires: usize = tl.upper_breaks.iter().filter(|b| **b).count();
        assert!(fires >= 1, "expected at least one upper break");
        // First-cross semantics: the last three breakout bars cannot all fire.
        let tail = &tl.upper_breaks[tl.upper_breaks.len() - 3..];
        assert!(tail.iter().filter(|b| **b).count() <= 1);
    }

    #[test]
    fn no_breaks_in_quiet_tape() {
        let closes = vec![100.0; 60];
        let highs = vec![100.5; 60];
        let lows = vec![99.5; 60];
        let tl = trendlines(&highs, &lows, &closes, 14, SlopeMethod::Atr, 1.0);
        assert!(!tl.lower_break_now());
    }

    #[test]
    fn width_now_is_nonnegative() {
        let (h, l, c) = breakout_tape();
        for method in [SlopeMethod::Atr, SlopeMethod::Linreg, SlopeMethod::Stdev] {
            let tl = trendlines(&h, &l, &c, 14, method, 1.0);
            assert!(tl.width_now() >= 0.0);
        }
    }

    #[test]
    fn slope_method_parse() {
        assert_eq!(SlopeMethod::parse("ATR"), SlopeMethod::Atr);
        assert_eq!(SlopeMethod::parse("linreg"), SlopeMethod::Linreg);
        assert_eq!(SlopeMethod::parse("stdev"), SlopeMethod::Stdev);
        assert_eq!(SlopeMethod::parse("unknown"), SlopeMethod::Atr);
    }

    #[test]
    fn empty_input() {
        let tl = trendlines(&[], &[], &[], 14, SlopeMethod::Atr, 1.0);
        assert!(tl.upper.is_empty());
        assert!(!tl.upper_break_now());
        assert_eq!(tl.width_now(), 0.0);
    }
}
