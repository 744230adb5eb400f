//! UWB anchor autocalibration toolbox
//!
//! This crate estimates the unknown 3D positions of a set of fixed ultra-wideband
//! (UWB) radio anchors from noisy pairwise inter-anchor range measurements and a
//! rough initial guess of the anchor coordinates. Calibration is a two-stage
//! procedure: Stage 1 iteratively refines each free anchor with a linearized
//! least-squares multilateration against the current estimates of its neighbors,
//! and Stage 2 jointly refines all free coordinates by minimizing a
//! sum-of-squared-range-residual cost with a derivative-free simplex search.
//! Anchors whose position is externally surveyed ("fixed anchors") are never
//! moved by either stage, not even transiently during optimizer probes.
//!
//! This crate is primarily built off of three additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the linear algebra tools for the solver.
//! - [`argmin`](https://crates.io/crates/argmin): Provides the derivative-free Nelder–Mead minimizer used in Stage 2.
//! - [`rayon`](https://crates.io/crates/rayon): Provides the parallel per-sample calibration batch.
//!
//! All other functionality is built on top of these crates or is auxiliary
//! functionality (e.g. I/O). Variables are generally named for the quantity they
//! represent rather than a mathematical symbol.
//!
//! ## Crate overview
//!
//! This crate is organized into several modules:
//! - [aggregate]: Reduces the raw sample cube into a pairwise range matrix (median or percentile-filtered single sample).
//! - [multilateration]: Stage 1, the iterative linearized multilateration refinement.
//! - [refine]: Stage 2, the nonlinear joint cost refinement.
//! - [metrics]: Per-anchor estimation error against a surveyed ground truth.
//! - [batch]: Full per-sample and median calibration runs, including the parallel batch.
//! - [io]: Ranging-log reading, network configuration, and the CSV error report.
//!
//! ## Data conventions
//!
//! All coordinates are meters in an arbitrary but consistent right-handed frame.
//! Coordinate sets are `N x 3` [`DMatrix`]s with one row per anchor. Pairwise
//! ranges are `N x N` matrices where entry `(i, k)` is the range anchor `i`
//! measured to anchor `k`; ranging is per-observer, so the matrix need not be
//! symmetric. The value [`INVALID_RANGE`] (-1.0) marks a missing or rejected
//! measurement and is excluded from every computation; it is never interpreted
//! as a zero distance. The diagonal is meaningless and always skipped.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

pub mod aggregate;
pub mod batch;
pub mod io;
pub mod metrics;
pub mod multilateration;
pub mod refine;

/// Sentinel marking a missing or rejected range measurement.
///
/// Ranging firmware reports -1.0 when no measurement was obtained for a pair;
/// the aggregation and cost layers filter this value out rather than treating
/// it as a distance.
pub const INVALID_RANGE: f64 = -1.0;

/// Solver configuration shared by both calibration stages.
///
/// The defaults match the values the calibration procedure was tuned with;
/// deployments typically widen the percentile band to 10/90.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Stage 1 maximum number of Gauss–Seidel sweeps.
    pub max_iters: usize,
    /// Stage 1 early-termination threshold: the sweep loop stops once the
    /// Frobenius norm of the coordinate change between consecutive sweeps
    /// falls below this value.
    pub convergence_thresh: f64,
    /// Minimum number of valid neighbor ranges required before an anchor is
    /// re-solved in a Stage 1 sweep. Anchors with fewer neighbors keep their
    /// current estimate for that sweep.
    pub min_anchors_for_solve: usize,
    /// Lower percentile (0-100) of the per-pair sample population used as the
    /// lower acceptance bound when filtering a single sample for Stage 2.
    pub lower_percentile: f64,
    /// Upper percentile (0-100) counterpart of `lower_percentile`.
    pub upper_percentile: f64,
    /// Report the Stage 2 cost before and after optimization through the
    /// logging facade. Diagnostic only.
    pub verbose: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            max_iters: 1500,
            convergence_thresh: 0.01,
            min_anchors_for_solve: 4,
            lower_percentile: 25.0,
            upper_percentile: 75.0,
            verbose: false,
        }
    }
}

/// Dense cube of raw inter-anchor range samples.
///
/// Indexed `(observer anchor i, sample index m, target anchor k)`: entry
/// `get(i, m, k)` is the range anchor `i` measured to anchor `k` during sample
/// round `m`, or [`INVALID_RANGE`] when that measurement failed. The cube is
/// not required to be symmetric in `i` and `k` since each anchor ranges
/// independently.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSampleCube {
    data: Vec<f64>,
    n_anchors: usize,
    n_samples: usize,
}

impl RangeSampleCube {
    /// Create a cube with every entry set to [`INVALID_RANGE`].
    pub fn filled_invalid(n_anchors: usize, n_samples: usize) -> Self {
        RangeSampleCube {
            data: vec![INVALID_RANGE; n_anchors * n_samples * n_anchors],
            n_anchors,
            n_samples,
        }
    }

    /// Create a cube by evaluating `f(i, m, k)` for every entry.
    pub fn from_fn<F>(n_anchors: usize, n_samples: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize, usize) -> f64,
    {
        let mut cube = RangeSampleCube::filled_invalid(n_anchors, n_samples);
        for i in 0..n_anchors {
            for m in 0..n_samples {
                for k in 0..n_anchors {
                    cube.set(i, m, k, f(i, m, k));
                }
            }
        }
        cube
    }

    /// Number of anchors in the network.
    pub fn n_anchors(&self) -> usize {
        self.n_anchors
    }

    /// Number of sample rounds per anchor pair.
    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    #[inline]
    fn index(&self, i: usize, m: usize, k: usize) -> usize {
        debug_assert!(i < self.n_anchors && m < self.n_samples && k < self.n_anchors);
        (i * self.n_samples + m) * self.n_anchors + k
    }

    /// Range anchor `i` measured to anchor `k` during sample round `m`.
    #[inline]
    pub fn get(&self, i: usize, m: usize, k: usize) -> f64 {
        self.data[self.index(i, m, k)]
    }

    /// Overwrite a single measurement.
    #[inline]
    pub fn set(&mut self, i: usize, m: usize, k: usize, value: f64) {
        let idx = self.index(i, m, k);
        self.data[idx] = value;
    }

    /// All `n_samples` measurements of the pair `(i, k)` in sample order,
    /// sentinels included.
    pub fn pair_samples(&self, i: usize, k: usize) -> Vec<f64> {
        (0..self.n_samples).map(|m| self.get(i, m, k)).collect()
    }

    /// Overwrite the full observer row of anchor `i` for sample round `m`.
    ///
    /// `row` must hold one value per target anchor.
    pub fn set_sample_row(&mut self, i: usize, m: usize, row: &[f64]) {
        assert_eq!(
            row.len(),
            self.n_anchors,
            "set_sample_row: row length must equal the anchor count"
        );
        for (k, value) in row.iter().enumerate() {
            self.set(i, m, k, *value);
        }
    }
}

/// Build an `N x 3` coordinate matrix from per-anchor `[x, y, z]` triples.
pub fn coordinates_from_rows(rows: &[[f64; 3]]) -> DMatrix<f64> {
    let mut coords = DMatrix::zeros(rows.len(), 3);
    for (i, row) in rows.iter().enumerate() {
        coords[(i, 0)] = row[0];
        coords[(i, 1)] = row[1];
        coords[(i, 2)] = row[2];
    }
    coords
}
