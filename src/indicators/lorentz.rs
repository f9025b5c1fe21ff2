// =============================================================================
// Lorentzian distance
// =============================================================================
//
//   d(a, b) = Σ ln(1 + |a_j - b_j|)
//
// Log-compressed per-feature distance. Outliers contribute logarithmically
// instead of quadratically, which keeps the k-NN classifier stable through
// volatility spikes.
// =============================================================================

/// Lorentzian distance between two equal-length feature vectors. Extra
/// elements on the longer vector are ignored.
pub fn lorentz_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (1.0 + (x - y).abs()).ln())
        .sum()
}
