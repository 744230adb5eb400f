//! Reduction of the raw range sample cube into a pairwise range matrix.
//!
//! Two reductions are provided, matching the two ways a calibration run can
//! consume the cube:
//! - [`median_ranges`]: the per-pair median over every valid sample, used when
//!   a single run is performed over the whole collection.
//! - [`percentile_filtered_ranges`]: a single sample round with per-pair
//!   percentile outlier rejection, used by the per-sample Stage 2 runs.
//!
//! Neither reduction has an error path: a pair with no usable data simply
//! degrades to [`INVALID_RANGE`] and is excluded downstream.

use nalgebra::DMatrix;

use crate::{INVALID_RANGE, RangeSampleCube};

/// Per-pair median of all valid samples.
///
/// For each ordered pair `(i, k)` with `i != k`, the output entry is the
/// median of every sample with a value greater than zero; pairs with no valid
/// sample, and the diagonal, are set to [`INVALID_RANGE`].
///
/// # Arguments
/// * `cube` - Raw range sample cube.
///
/// # Returns
/// * An `N x N` pairwise range matrix.
pub fn median_ranges(cube: &RangeSampleCube) -> DMatrix<f64> {
    let n = cube.n_anchors();
    let mut ranges = DMatrix::from_element(n, n, INVALID_RANGE);
    for i in 0..n {
        for k in 0..n {
            if i == k {
                continue;
            }
            let valid: Vec<f64> = cube
                .pair_samples(i, k)
                .into_iter()
                .filter(|r| *r > 0.0)
                .collect();
            if !valid.is_empty() {
                ranges[(i, k)] = median(&valid);
            }
        }
    }
    ranges
}

/// The raw, unfiltered range matrix of a single sample round.
///
/// Entry `(i, k)` is `cube.get(i, sample_idx, k)` verbatim, sentinels
/// included. This is the Stage 1 input for a per-sample calibration run.
pub fn sample_slice(cube: &RangeSampleCube, sample_idx: usize) -> DMatrix<f64> {
    let n = cube.n_anchors();
    DMatrix::from_fn(n, n, |i, k| cube.get(i, sample_idx, k))
}

/// A single sample round with per-pair percentile outlier rejection.
///
/// For each pair `(i, k)` the acceptance band is
/// `[percentile(lower_pct), percentile(upper_pct)]` of all samples recorded
/// for that pair, sentinels included (percentiles use linear interpolation
/// between order statistics). The raw value of round `sample_idx` is kept only
/// if it falls inside the band and is replaced by [`INVALID_RANGE`] otherwise.
/// This is the outlier-rejection mechanism feeding Stage 2.
///
/// # Arguments
/// * `cube` - Raw range sample cube.
/// * `sample_idx` - Sample round to filter.
/// * `lower_pct` - Lower acceptance percentile in `[0, 100]`.
/// * `upper_pct` - Upper acceptance percentile in `[0, 100]`.
///
/// # Returns
/// * An `N x N` pairwise range matrix with out-of-band entries invalidated.
pub fn percentile_filtered_ranges(
    cube: &RangeSampleCube,
    sample_idx: usize,
    lower_pct: f64,
    upper_pct: f64,
) -> DMatrix<f64> {
    let n = cube.n_anchors();
    let mut ranges = DMatrix::from_element(n, n, INVALID_RANGE);
    for i in 0..n {
        for k in 0..n {
            let value = cube.get(i, sample_idx, k);
            let samples = cube.pair_samples(i, k);
            let lower_bound = percentile(&samples, lower_pct);
            let upper_bound = percentile(&samples, upper_pct);
            if value >= lower_bound && value <= upper_bound {
                ranges[(i, k)] = value;
            }
        }
    }
    ranges
}

/// Median of a non-empty slice. Even-length populations average the two
/// middle order statistics.
pub(crate) fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    }
}

/// Percentile `q` in `[0, 100]` of a non-empty slice, linearly interpolating
/// between order statistics.
pub(crate) fn percentile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let position = (q.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
    let below = position.floor() as usize;
    let above = (below + 1).min(n - 1);
    let fraction = position - below as f64;
    sorted[below] + fraction * (sorted[above] - sorted[below])
}
