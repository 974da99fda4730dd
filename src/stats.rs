use serde::Serialize;

use crate::aggregate::round_to;
use crate::config::FenceMode;

/// Multiplier applied to the interquartile range to place the outlier fence
pub const FENCE_MULTIPLIER: f64 = 1.5;

/// Highest band a rate can earn
pub const TOP_BAND: u8 = 5;

/// Statewide reference for one model (and optional sub-dimension).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reference {
    Comparable {
        mean: f64,
        std: f64,
        /// Rates left after trimming
        sample_size: usize,
        /// Rates discarded by the fence
        trimmed: usize,
    },
    /// Fewer than two rates survived filtering and trimming
    Degenerate { sample_size: usize },
}

impl Reference {
    pub fn mean_std(&self) -> Option<(f64, f64)> {
        match self {
            Reference::Comparable { mean, std, .. } => Some((*mean, *std)),
            Reference::Degenerate { .. } => None,
        }
    }

    pub fn is_degenerate(&self) -> bool {
        matches!(self, Reference::Degenerate { .. })
    }
}

/// Percentile of sorted data using the midpoint rule: the average of the two
/// order statistics around position p x (n - 1).
pub fn percentile_midpoint(sorted: &[f64], percentile: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = percentile / 100.0 * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    Some((sorted[lo] + sorted[hi.min(sorted.len() - 1)]) / 2.0)
}

/// Sample mean and standard deviation (n - 1 denominator).
pub fn mean_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some((mean, var.sqrt()))
}

/// Compute a trimmed reference distribution.
///
/// `samples` are (rate, eligible count) pairs. Groups below `min_sample` and
/// non-positive rates are discarded first, then rates outside the 1.5 x IQR
/// fence around the quartiles. The result is a pure function of its inputs.
pub fn compute_reference(
    samples: &[(f64, u64)],
    min_sample: u64,
    fence: FenceMode,
    decimals: Option<u32>,
) -> Reference {
    let mut rates: Vec<f64> = samples
        .iter()
        .filter(|(rate, count)| *count >= min_sample && *rate > 0.0)
        .map(|(rate, _)| *rate)
        .collect();
    rates.sort_by(f64::total_cmp);

    let (Some(q1), Some(q3)) = (percentile_midpoint(&rates, 25.0), percentile_midpoint(&rates, 75.0)) else {
        return Reference::Degenerate { sample_size: 0 };
    };
    let reach = FENCE_MULTIPLIER * (q3 - q1);
    let (low, high) = (q1 - reach, q3 + reach);

    let kept: Vec<f64> = rates
        .iter()
        .copied()
        .filter(|r| match fence {
            FenceMode::Inclusive => *r >= low && *r <= high,
            FenceMode::Exclusive => *r > low && *r < high,
        })
        .collect();

    match mean_std(&kept) {
        Some((mean, std)) => {
            let (mean, std) = match decimals {
                Some(d) => (round_to(mean, d), round_to(std, d)),
                None => (mean, std),
            };
            Reference::Comparable {
                mean,
                std,
                sample_size: kept.len(),
                trimmed: rates.len() - kept.len(),
            }
        }
        None => Reference::Degenerate {
            sample_size: kept.len(),
        },
    }
}

/// Map a rate to a band relative to the reference mean and std.
///
/// At or above the mean earns the top band and exactly zero earns 0. Below the
/// mean, each of the thresholds mean - 0.5, 1, 2 and 3 std that the rate still
/// clears is worth one point. A non-zero rate under the lowest threshold gets
/// no band.
pub fn assign_band(rate: f64, mean: f64, std: f64, decimals: Option<u32>) -> Option<u8> {
    let r = |v: f64| match decimals {
        Some(d) => round_to(v, d),
        None => v,
    };
    let rate = r(rate);

    if rate >= r(mean) {
        return Some(TOP_BAND);
    }
    if rate == 0.0 {
        return Some(0);
    }
    [(0.5, 4u8), (1.0, 3), (2.0, 2), (3.0, 1)]
        .iter()
        .find(|(k, _)| rate >= r(mean - k * std))
        .map(|(_, band)| *band)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(rates: &[f64]) -> Vec<(f64, u64)> {
        rates.iter().map(|r| (*r, 30)).collect()
    }

    #[test]
    fn test_percentile_midpoint() {
        let data = [10.0, 11.0, 11.0, 12.0, 12.0, 13.0, 90.0];
        assert_eq!(percentile_midpoint(&data, 25.0), Some(11.0));
        assert_eq!(percentile_midpoint(&data, 75.0), Some(12.5));
        assert_eq!(percentile_midpoint(&[4.0], 5.0), Some(4.0));
        assert_eq!(percentile_midpoint(&[], 50.0), None);
        // position 0.2 between 1 and 2
        assert_eq!(percentile_midpoint(&[1.0, 2.0], 20.0), Some(1.5));
    }

    #[test]
    fn test_outlier_is_trimmed() {
        let reference = compute_reference(
            &samples(&[10.0, 12.0, 11.0, 13.0, 90.0, 12.0, 11.0]),
            20,
            FenceMode::Inclusive,
            None,
        );
        let (expected_mean, expected_std) = mean_std(&[10.0, 12.0, 11.0, 13.0, 12.0, 11.0]).unwrap();
        match reference {
            Reference::Comparable {
                mean,
                std,
                sample_size,
                trimmed,
            } => {
                assert!((mean - expected_mean).abs() < 1e-12);
                assert!((std - expected_std).abs() < 1e-12);
                assert!((mean - 11.5).abs() < 1e-12);
                assert!((std - 1.1f64.sqrt()).abs() < 1e-12);
                assert_eq!(sample_size, 6);
                assert_eq!(trimmed, 1);
            }
            other => panic!("expected comparable reference, got {:?}", other),
        }
    }

    #[test]
    fn test_reference_is_idempotent() {
        let input = samples(&[3.0, 7.5, 9.25, 40.0, 41.0, 12.0, 0.0, 15.5]);
        let first = compute_reference(&input, 10, FenceMode::Inclusive, Some(2));
        let second = compute_reference(&input, 10, FenceMode::Inclusive, Some(2));
        assert_eq!(first, second);
    }

    #[test]
    fn test_small_and_zero_groups_do_not_contribute() {
        let input = vec![(50.0, 5), (0.0, 100), (10.0, 40), (11.0, 25), (12.0, 40)];
        match compute_reference(&input, 20, FenceMode::Inclusive, None) {
            Reference::Comparable { mean, sample_size, .. } => {
                assert_eq!(sample_size, 3);
                assert_eq!(mean, 11.0);
            }
            other => panic!("expected comparable reference, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_sample_is_degenerate() {
        let reference = compute_reference(&samples(&[0.0, 0.0]), 1, FenceMode::Inclusive, None);
        assert_eq!(reference, Reference::Degenerate { sample_size: 0 });
        assert!(reference.mean_std().is_none());

        let single = compute_reference(&samples(&[42.0]), 1, FenceMode::Inclusive, None);
        assert_eq!(single, Reference::Degenerate { sample_size: 1 });
    }

    #[test]
    fn test_exclusive_fence_drops_boundary() {
        // q1 = 1, q3 = 1, fence 0: inclusive keeps the ones, exclusive keeps nothing
        let input = samples(&[1.0, 1.0, 1.0, 1.0, 5.0]);
        assert!(!compute_reference(&input, 1, FenceMode::Inclusive, None).is_degenerate());
        assert!(compute_reference(&input, 1, FenceMode::Exclusive, None).is_degenerate());
    }

    #[test]
    fn test_assign_band_thresholds() {
        let (mean, std) = (50.0, 10.0);
        assert_eq!(assign_band(50.0, mean, std, None), Some(5));
        assert_eq!(assign_band(75.0, mean, std, None), Some(5));
        assert_eq!(assign_band(0.0, mean, std, None), Some(0));
        assert_eq!(assign_band(45.0, mean, std, None), Some(4));
        assert_eq!(assign_band(44.99, mean, std, None), Some(3));
        assert_eq!(assign_band(40.0, mean, std, None), Some(3));
        assert_eq!(assign_band(30.0, mean, std, None), Some(2));
        assert_eq!(assign_band(20.0, mean, std, None), Some(1));
    }

    #[test]
    fn test_assign_band_below_lowest_threshold_is_none() {
        assert_eq!(assign_band(19.99, 50.0, 10.0, None), None);
        assert_eq!(assign_band(0.5, 50.0, 10.0, None), None);
    }

    #[test]
    fn test_assign_band_rounding() {
        // 49.996 rounds to 50.00 at two decimals and reaches the mean
        assert_eq!(assign_band(49.996, 50.0, 10.0, Some(2)), Some(5));
        assert_eq!(assign_band(49.996, 50.0, 10.0, None), Some(4));
    }
}
