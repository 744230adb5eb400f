//! Full calibration runs over the sample cube.
//!
//! A calibration run strings the pieces together: aggregate the cube into a
//! pairwise range matrix, refine with Stage 1, then polish with Stage 2. Two
//! flavors exist, matching how the data can be consumed:
//! - [`calibrate_sample`]: one run per sample round. Stage 1 works on the raw
//!   slice of that round; Stage 2 works on the percentile-filtered slice.
//! - [`calibrate_median`]: one run over the per-pair median of all rounds,
//!   used by both stages.
//!
//! Per-sample runs only read shared immutable inputs and write disjoint
//! outputs, so [`calibrate_all_samples`] fans them out across a rayon thread
//! pool. The sequential-update ordering inside a single Stage 1 run is left
//! untouched; parallelism exists only across sample indices.

use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::{aggregate, multilateration, refine, SolverConfig, RangeSampleCube};

/// Calibrate the network from a single sample round.
///
/// Stage 1 refines against the raw slice of round `sample_idx`; Stage 2 then
/// refines against the same round with per-pair percentile outlier rejection
/// (`config.lower_percentile` / `config.upper_percentile`).
///
/// # Arguments
/// * `cube` - Raw range sample cube.
/// * `sample_idx` - Sample round to calibrate from.
/// * `initial_guess` - `N x 3` initial anchor coordinates.
/// * `fixed` - length-`N` mask of anchors that must not move.
/// * `config` - solver configuration.
///
/// # Returns
/// * The calibrated `N x 3` coordinate estimate for this round.
pub fn calibrate_sample(
    cube: &RangeSampleCube,
    sample_idx: usize,
    initial_guess: &DMatrix<f64>,
    fixed: &[bool],
    config: &SolverConfig,
) -> DMatrix<f64> {
    let raw = aggregate::sample_slice(cube, sample_idx);
    let stage_one = multilateration::refine(&raw, initial_guess, fixed, config);
    let filtered = aggregate::percentile_filtered_ranges(
        cube,
        sample_idx,
        config.lower_percentile,
        config.upper_percentile,
    );
    refine::refine(&stage_one, &filtered, fixed, config)
}

/// Calibrate the network from the per-pair median of all sample rounds.
///
/// Both stages consume the median matrix; the percentile filter does not
/// apply here since the median is already robust to stray samples.
pub fn calibrate_median(
    cube: &RangeSampleCube,
    initial_guess: &DMatrix<f64>,
    fixed: &[bool],
    config: &SolverConfig,
) -> DMatrix<f64> {
    let medians = aggregate::median_ranges(cube);
    let stage_one = multilateration::refine(&medians, initial_guess, fixed, config);
    refine::refine(&stage_one, &medians, fixed, config)
}

/// Run [`calibrate_sample`] for every sample round in parallel.
///
/// Rounds are independent (shared immutable inputs, disjoint outputs), so the
/// batch is fanned out over rayon. The result is ordered by sample index and
/// identical to running the rounds sequentially.
pub fn calibrate_all_samples(
    cube: &RangeSampleCube,
    initial_guess: &DMatrix<f64>,
    fixed: &[bool],
    config: &SolverConfig,
) -> Vec<DMatrix<f64>> {
    (0..cube.n_samples())
        .into_par_iter()
        .map(|sample_idx| calibrate_sample(cube, sample_idx, initial_guess, fixed, config))
        .collect()
}

/// Element-wise mean of a set of per-round estimates.
///
/// The batch report averages the per-round solutions into one representative
/// coordinate set.
pub fn mean_estimate(estimates: &[DMatrix<f64>]) -> DMatrix<f64> {
    assert!(!estimates.is_empty(), "mean_estimate: no estimates given");
    let mut sum = estimates[0].clone();
    for estimate in &estimates[1..] {
        sum += estimate;
    }
    sum / estimates.len() as f64
}
