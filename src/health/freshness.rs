use serde::Serialize;
use std::collections::VecDeque;

/// Data-age percentiles in seconds. All zero when no sample exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FreshnessStats {
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

pub(crate) fn stats(samples: &VecDeque<f64>) -> FreshnessStats {
    if samples.is_empty() {
        return FreshnessStats::default();
    }
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    FreshnessStats {
        p50: percentile(&sorted, 50.0),
        p90: percentile(&sorted, 90.0),
        p99: percentile(&sorted, 99.0),
    }
}

/// Linear-interpolated percentile over ascending `sorted` values.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (pct.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
        }
    }
}
