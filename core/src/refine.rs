//! Stage 2: nonlinear joint refinement of the anchor coordinates.
//!
//! The Stage 1 estimate is polished by minimizing a sum-of-squared-range-
//! residual cost over the flattened `N x 3` coordinate vector with a
//! derivative-free Nelder–Mead simplex search
//! ([`argmin`](https://crates.io/crates/argmin)). The cost surface is
//! non-convex and non-smooth around the sentinel masking, which is exactly
//! what the simplex method tolerates; only local improvement is guaranteed.
//!
//! Fixed anchors are pinned: before every single cost evaluation their
//! coordinates are overwritten with the Stage 1 values, so they cannot drift
//! even during intermediate optimizer probes. The optimizer still searches
//! over those dimensions (they are reset on every evaluation), wasting some of
//! the search space; this mirrors the established calibration procedure and is
//! deliberately kept.

use argmin::core::{CostFunction, Error, Executor, State};
use argmin::solver::neldermead::NelderMead;
use log::{info, warn};
use nalgebra::DMatrix;

use crate::SolverConfig;

/// Simplex seeding steps, matching the conventional direct-search defaults:
/// nonzero coordinates are perturbed by 5 %, zero coordinates by an absolute
/// step.
const NONZERO_STEP: f64 = 0.05;
const ZERO_STEP: f64 = 0.00025;

/// Termination threshold on the standard deviation of the simplex cost values.
const SD_TOLERANCE: f64 = 1e-12;

/// Function-evaluation budget per search dimension.
const ITERS_PER_DIMENSION: u64 = 200;

/// Sum-of-squared-range-residual cost with fixed-anchor pinning.
///
/// `cost(theta) = sum over ordered pairs (i, j), i != j, with a valid range, of
/// (|theta_i - theta_j|^2 - range(i, j)^2)^2`. Sentinel entries contribute
/// nothing. Fixed rows of `theta` are replaced by the pinned coordinates
/// before the sum is formed.
struct RangeResidualCost<'a> {
    ranges: &'a DMatrix<f64>,
    fixed: &'a [bool],
    pinned: &'a DMatrix<f64>,
}

impl RangeResidualCost<'_> {
    fn evaluate(&self, theta: &[f64]) -> f64 {
        let n_anchors = self.pinned.nrows();
        let coordinate = |i: usize, c: usize| -> f64 {
            // pinning: fixed anchors are read from the Stage 1 estimate no
            // matter what the optimizer probed
            if self.fixed[i] {
                self.pinned[(i, c)]
            } else {
                theta[3 * i + c]
            }
        };
        let mut cost = 0.0;
        for i in 0..n_anchors {
            for j in 0..n_anchors {
                if i == j {
                    continue;
                }
                let range = self.ranges[(i, j)];
                if range < 0.0 {
                    continue;
                }
                let dx = coordinate(i, 0) - coordinate(j, 0);
                let dy = coordinate(i, 1) - coordinate(j, 1);
                let dz = coordinate(i, 2) - coordinate(j, 2);
                let residual = dx * dx + dy * dy + dz * dz - range * range;
                cost += residual * residual;
            }
        }
        cost
    }
}

impl CostFunction for RangeResidualCost<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, theta: &Self::Param) -> Result<Self::Output, Error> {
        Ok(self.evaluate(theta))
    }
}

/// Jointly refine all free anchor coordinates against a pairwise range matrix.
///
/// Runs a Nelder–Mead search seeded at `estimate` over the flattened
/// coordinate vector, minimizing the squared-range-residual cost with fixed
/// anchors pinned at every evaluation. After the search the fixed rows are
/// reset from `estimate` one final time.
///
/// The result never costs more than the input: if the search cannot improve
/// on the seed (or the optimizer fails outright, which is logged), the input
/// estimate is returned unchanged.
///
/// # Arguments
/// * `estimate` - `N x 3` coordinates from Stage 1; also supplies the pinned values.
/// * `ranges` - `N x N` pairwise range matrix, [`crate::INVALID_RANGE`] for missing pairs.
/// * `fixed` - length-`N` mask of anchors that must not move.
/// * `config` - solver configuration (`verbose` toggles cost reporting).
///
/// # Returns
/// * The refined `N x 3` coordinate estimate.
pub fn refine(
    estimate: &DMatrix<f64>,
    ranges: &DMatrix<f64>,
    fixed: &[bool],
    config: &SolverConfig,
) -> DMatrix<f64> {
    let n_anchors = estimate.nrows();
    assert_eq!(estimate.ncols(), 3, "refine: coordinates must be N x 3");
    assert_eq!(ranges.nrows(), n_anchors, "refine: range matrix must be N x N");
    assert_eq!(ranges.ncols(), n_anchors, "refine: range matrix must be N x N");
    assert_eq!(fixed.len(), n_anchors, "refine: fixed mask must have length N");

    let cost_function = RangeResidualCost {
        ranges,
        fixed,
        pinned: estimate,
    };
    let seed = flatten(estimate);
    let initial_cost = cost_function.evaluate(&seed);
    if config.verbose {
        info!("stage 2 cost before optimization: {:.6e}", initial_cost);
    }

    let dimension = seed.len();
    let solver = match NelderMead::new(initial_simplex(&seed)).with_sd_tolerance(SD_TOLERANCE) {
        Ok(solver) => solver,
        Err(err) => {
            warn!("stage 2 solver setup failed ({err}); keeping stage 1 estimate");
            return estimate.clone();
        }
    };
    let outcome = Executor::new(cost_function, solver)
        .configure(|state| state.max_iters(ITERS_PER_DIMENSION * dimension as u64))
        .run();

    let refined = match outcome {
        Ok(result) => {
            let best_cost = result.state().get_best_cost();
            let best = result.state().get_best_param().cloned();
            match best {
                Some(theta) if best_cost <= initial_cost => {
                    if config.verbose {
                        info!("stage 2 cost after optimization: {:.6e}", best_cost);
                    }
                    unflatten(&theta, n_anchors)
                }
                _ => {
                    warn!("stage 2 search did not improve on the seed; keeping stage 1 estimate");
                    estimate.clone()
                }
            }
        }
        Err(err) => {
            warn!("stage 2 optimizer failed ({err}); keeping stage 1 estimate");
            estimate.clone()
        }
    };

    // final defensive reset: fixed rows are bit-identical to the input
    let mut refined = refined;
    for i in 0..n_anchors {
        if fixed[i] {
            for c in 0..3 {
                refined[(i, c)] = estimate[(i, c)];
            }
        }
    }
    refined
}

/// Flatten an `N x 3` coordinate matrix row-major into a `3N` vector.
fn flatten(coords: &DMatrix<f64>) -> Vec<f64> {
    let mut theta = Vec::with_capacity(coords.nrows() * 3);
    for i in 0..coords.nrows() {
        for c in 0..3 {
            theta.push(coords[(i, c)]);
        }
    }
    theta
}

/// Inverse of [`flatten`].
fn unflatten(theta: &[f64], n_anchors: usize) -> DMatrix<f64> {
    DMatrix::from_fn(n_anchors, 3, |i, c| theta[3 * i + c])
}

/// Build the `dim + 1` starting simplex around the seed vertex.
fn initial_simplex(seed: &[f64]) -> Vec<Vec<f64>> {
    let mut vertices = Vec::with_capacity(seed.len() + 1);
    vertices.push(seed.to_vec());
    for d in 0..seed.len() {
        let mut vertex = seed.to_vec();
        if vertex[d] != 0.0 {
            vertex[d] *= 1.0 + NONZERO_STEP;
        } else {
            vertex[d] = ZERO_STEP;
        }
        vertices.push(vertex);
    }
    vertices
}
