//! Stage 1: iterative linearized multilateration refinement.
//!
//! Each sweep visits the anchors in index order and re-solves every free
//! anchor against the ranges to its valid neighbors with a linearized
//! least-squares multilateration. The sweep is Gauss–Seidel, not Jacobi:
//! anchors updated earlier in the same sweep are seen at their new positions
//! by the anchors that follow. This in-pass visibility is part of the
//! convergence behavior and must not be reordered or batched.

use log::debug;
use nalgebra::{DMatrix, DVector, Vector3};

use crate::SolverConfig;

/// Singular values below this threshold are treated as zero when forming the
/// pseudo-inverse of the multilateration design matrix.
const PINV_EPS: f64 = 1e-12;

/// Iteratively refine all free anchor coordinates against a pairwise range
/// matrix.
///
/// Starting from `initial_guess`, performs up to `config.max_iters`
/// Gauss–Seidel sweeps. In each sweep every non-fixed anchor `i` gathers the
/// current (in-pass) coordinates and ranges of every neighbor `k != i` with a
/// valid entry `ranges[(i, k)] >= 0`; if at least
/// `config.min_anchors_for_solve` neighbors are available, anchor `i` is
/// re-solved with [`solve_position`], otherwise it keeps its estimate for that
/// sweep. The loop terminates early once the Frobenius norm of the coordinate
/// change across a full sweep drops below `config.convergence_thresh`.
///
/// Fixed anchors are never touched; their rows of the result are bit-identical
/// to `initial_guess`.
///
/// # Arguments
/// * `ranges` - `N x N` pairwise range matrix, [`crate::INVALID_RANGE`] for missing pairs.
/// * `initial_guess` - `N x 3` initial anchor coordinates.
/// * `fixed` - length-`N` mask of anchors that must not move.
/// * `config` - solver configuration (iteration cap, threshold, neighbor minimum).
///
/// # Returns
/// * The refined `N x 3` coordinate estimate.
pub fn refine(
    ranges: &DMatrix<f64>,
    initial_guess: &DMatrix<f64>,
    fixed: &[bool],
    config: &SolverConfig,
) -> DMatrix<f64> {
    let n_anchors = initial_guess.nrows();
    assert_eq!(
        ranges.nrows(),
        n_anchors,
        "refine: range matrix must be N x N"
    );
    assert_eq!(ranges.ncols(), n_anchors, "refine: range matrix must be N x N");
    assert_eq!(initial_guess.ncols(), 3, "refine: coordinates must be N x 3");
    assert_eq!(fixed.len(), n_anchors, "refine: fixed mask must have length N");

    let mut estimate = initial_guess.clone();
    for sweep in 0..config.max_iters {
        let previous = estimate.clone();

        for i in 0..n_anchors {
            if fixed[i] {
                continue;
            }
            let mut neighbor_coords = Vec::new();
            let mut neighbor_ranges = Vec::new();
            for k in 0..n_anchors {
                if k == i || ranges[(i, k)] < 0.0 {
                    continue;
                }
                // current in-pass coordinate: anchors with k < i already moved
                neighbor_coords.push(Vector3::new(
                    estimate[(k, 0)],
                    estimate[(k, 1)],
                    estimate[(k, 2)],
                ));
                neighbor_ranges.push(ranges[(i, k)]);
            }
            if neighbor_coords.len() >= config.min_anchors_for_solve {
                if let Some(position) = solve_position(&neighbor_coords, &neighbor_ranges) {
                    estimate[(i, 0)] = position.x;
                    estimate[(i, 1)] = position.y;
                    estimate[(i, 2)] = position.z;
                }
            }
        }

        let change = (&estimate - &previous).norm();
        if change < config.convergence_thresh {
            debug!("stage 1 converged after {} sweeps (change {:.3e})", sweep + 1, change);
            break;
        }
    }
    estimate
}

/// Linearized multilateration of a single point from `K` neighbor positions
/// and ranges.
///
/// The last neighbor serves as the linearization reference. With
/// `c_r = coords[K-1]` and `r_r = ranges[K-1]`, the system rows are
///
/// ```text
/// A[i] = 2 (c_r - c_i),    b[i] = r_i^2 - r_r^2 - |c_i|^2 + |c_r|^2
/// ```
///
/// for `i in 0..K-1`, solved as `x = pinv(A) b` with the Moore–Penrose
/// pseudo-inverse. No rank check is performed: a rank-deficient `A` (collinear
/// or too few neighbors) yields the minimum-norm least-squares solution, which
/// is accepted behavior. Returns `None` only if the pseudo-inverse itself
/// cannot be computed, in which case the caller keeps its previous estimate.
///
/// # Arguments
/// * `neighbor_coords` - `K` neighbor positions, `K >= 2`.
/// * `neighbor_ranges` - `K` measured ranges, aligned with `neighbor_coords`.
pub fn solve_position(
    neighbor_coords: &[Vector3<f64>],
    neighbor_ranges: &[f64],
) -> Option<Vector3<f64>> {
    let k_count = neighbor_coords.len();
    assert_eq!(
        k_count,
        neighbor_ranges.len(),
        "solve_position: coordinates and ranges must align"
    );
    if k_count < 2 {
        return None;
    }

    let reference = neighbor_coords[k_count - 1];
    let reference_norm_sq = reference.norm_squared();
    let reference_range_sq = neighbor_ranges[k_count - 1] * neighbor_ranges[k_count - 1];

    let mut a = DMatrix::zeros(k_count - 1, 3);
    let mut b = DVector::zeros(k_count - 1);
    for i in 0..k_count - 1 {
        let row = 2.0 * (reference - neighbor_coords[i]);
        a[(i, 0)] = row.x;
        a[(i, 1)] = row.y;
        a[(i, 2)] = row.z;
        b[i] = neighbor_ranges[i] * neighbor_ranges[i] - reference_range_sq
            - neighbor_coords[i].norm_squared()
            + reference_norm_sq;
    }

    let pinv = a.pseudo_inverse(PINV_EPS).ok()?;
    let solution = pinv * b;
    Some(Vector3::new(solution[0], solution[1], solution[2]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{coordinates_from_rows, INVALID_RANGE};
    use assert_approx_eq::assert_approx_eq;

    fn exact_range_matrix(truth: &DMatrix<f64>) -> DMatrix<f64> {
        let n = truth.nrows();
        DMatrix::from_fn(n, n, |i, k| {
            if i == k {
                return INVALID_RANGE;
            }
            let di = truth.row(i) - truth.row(k);
            di.norm()
        })
    }

    #[test]
    fn test_solve_position_exact() {
        let truth = Vector3::new(1.0, 2.0, 3.0);
        let neighbors = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(10.0, 0.0, 0.0),
            Vector3::new(0.0, 10.0, 0.0),
            Vector3::new(0.0, 0.0, 10.0),
            Vector3::new(10.0, 10.0, 10.0),
        ];
        let ranges: Vec<f64> = neighbors.iter().map(|c| (truth - c).norm()).collect();
        let solved = solve_position(&neighbors, &ranges).expect("solvable system");
        assert_approx_eq!((solved - truth).norm(), 0.0, 1e-9);
    }

    #[test]
    fn test_solve_position_rank_deficient_min_norm() {
        // collinear neighbors: A has rank <= 1, the pseudo-inverse still
        // produces a finite minimum-norm solution rather than an error
        let neighbors = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(2.0, 0.0, 0.0),
        ];
        let ranges = vec![2.0, 1.0, 1.0];
        let solved = solve_position(&neighbors, &ranges).expect("min-norm solution");
        assert!(solved.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_solve_position_too_few_neighbors() {
        let neighbors = vec![Vector3::new(0.0, 0.0, 0.0)];
        let ranges = vec![1.0];
        assert!(solve_position(&neighbors, &ranges).is_none());
    }

    #[test]
    fn test_refine_exact_ranges_converge() {
        // four non-coplanar fixed anchors plus four free ones; noiseless
        // ranges must pull the free anchors onto their true positions
        let truth = coordinates_from_rows(&[
            [0.0, 0.0, 0.0],
            [10.0, 0.0, 0.0],
            [0.0, 10.0, 0.0],
            [0.0, 0.0, 10.0],
            [5.0, 5.0, 5.0],
            [8.0, 2.0, 6.0],
            [2.0, 7.0, 3.0],
            [6.0, 6.0, 1.0],
        ]);
        let fixed = [true, true, true, true, false, false, false, false];
        let ranges = exact_range_matrix(&truth);

        let mut guess = truth.clone();
        for i in 4..8 {
            guess[(i, 0)] += 0.8;
            guess[(i, 1)] -= 0.6;
            guess[(i, 2)] += 0.5;
        }

        let config = SolverConfig {
            convergence_thresh: 1e-8,
            ..SolverConfig::default()
        };
        let estimate = refine(&ranges, &guess, &fixed, &config);
        for i in 4..8 {
            let err = (estimate.row(i) - truth.row(i)).norm();
            assert!(err < 1e-3, "anchor {} error {} too large", i, err);
        }
    }

    #[test]
    fn test_refine_fixed_rows_bit_identical() {
        let truth = coordinates_from_rows(&[
            [0.1, 0.2, 0.3],
            [10.0, 0.0, 0.0],
            [0.0, 10.0, 0.0],
            [0.0, 0.0, 10.0],
            [5.0, 5.0, 5.0],
            [3.0, 4.0, 5.0],
        ]);
        let fixed = [true, true, true, true, false, false];
        let ranges = exact_range_matrix(&truth);
        let estimate = refine(&ranges, &truth, &fixed, &SolverConfig::default());
        for (i, is_fixed) in fixed.iter().enumerate() {
            if *is_fixed {
                for c in 0..3 {
                    // bit-exact, not approximately equal
                    assert_eq!(estimate[(i, c)], truth[(i, c)]);
                }
            }
        }
    }

    #[test]
    fn test_refine_insufficient_neighbors_leaves_anchor() {
        // the free anchor only ever sees three valid ranges, which is below
        // the default minimum of four, so it must keep its guess
        let truth = coordinates_from_rows(&[
            [0.0, 0.0, 0.0],
            [10.0, 0.0, 0.0],
            [0.0, 10.0, 0.0],
            [5.0, 5.0, 5.0],
        ]);
        let fixed = [true, true, true, false];
        let ranges = exact_range_matrix(&truth);
        let guess = coordinates_from_rows(&[
            [0.0, 0.0, 0.0],
            [10.0, 0.0, 0.0],
            [0.0, 10.0, 0.0],
            [4.0, 4.0, 6.0],
        ]);
        let estimate = refine(&ranges, &guess, &fixed, &SolverConfig::default());
        for c in 0..3 {
            assert_eq!(estimate[(3, c)], guess[(3, c)]);
        }
    }

    #[test]
    fn test_refine_sentinel_pair_equivalent_to_absent_pair() {
        let truth = coordinates_from_rows(&[
            [0.0, 0.0, 0.0],
            [10.0, 0.0, 0.0],
            [0.0, 10.0, 0.0],
            [0.0, 0.0, 10.0],
            [10.0, 10.0, 10.0],
            [5.0, 5.0, 5.0],
        ]);
        let fixed = [true, true, true, true, true, false];
        let mut guess = truth.clone();
        guess[(5, 0)] = 4.0;
        guess[(5, 1)] = 6.0;
        guess[(5, 2)] = 4.5;

        // invalidating (5, 4) must act exactly like anchor 4 never ranging
        // with the free anchor at all
        let mut with_sentinel = exact_range_matrix(&truth);
        with_sentinel[(5, 4)] = INVALID_RANGE;

        // the same network with anchor 4 removed outright
        let truth_without = coordinates_from_rows(&[
            [0.0, 0.0, 0.0],
            [10.0, 0.0, 0.0],
            [0.0, 10.0, 0.0],
            [0.0, 0.0, 10.0],
            [5.0, 5.0, 5.0],
        ]);
        let fixed_without = [true, true, true, true, false];
        let mut guess_without = truth_without.clone();
        guess_without[(4, 0)] = 4.0;
        guess_without[(4, 1)] = 6.0;
        guess_without[(4, 2)] = 4.5;
        let ranges_without = exact_range_matrix(&truth_without);

        let config = SolverConfig::default();
        let a = refine(&with_sentinel, &guess, &fixed, &config);
        let b = refine(&ranges_without, &guess_without, &fixed_without, &config);
        for c in 0..3 {
            assert_eq!(a[(5, c)], b[(4, c)]);
        }
        // and the remaining four neighbors still pin the free anchor down
        assert!((a.row(5) - truth.row(5)).norm() < 1e-3);
    }
}
