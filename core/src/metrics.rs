//! Per-anchor estimation error against a surveyed ground truth.

use nalgebra::{DMatrix, DVector};

/// Per-anchor deviation of an estimate from the ground truth.
///
/// Without `axis`, returns the Euclidean norm of the 3D difference per anchor.
/// With `axis` (0 = x, 1 = y, 2 = z), returns the signed difference
/// `estimate - ground_truth` on that axis instead. Pure function, no side
/// effects.
///
/// # Arguments
/// * `estimate` - `N x 3` estimated anchor coordinates.
/// * `ground_truth` - `N x 3` surveyed anchor coordinates.
/// * `axis` - optional axis index for a signed per-axis error.
///
/// # Returns
/// * A length-`N` vector of per-anchor errors.
pub fn estimation_error(
    estimate: &DMatrix<f64>,
    ground_truth: &DMatrix<f64>,
    axis: Option<usize>,
) -> DVector<f64> {
    assert_eq!(
        estimate.shape(),
        ground_truth.shape(),
        "estimation_error: estimate and ground truth must have the same shape"
    );
    assert_eq!(estimate.ncols(), 3, "estimation_error: coordinates must be N x 3");

    let n_anchors = estimate.nrows();
    match axis {
        Some(axis) => {
            assert!(axis < 3, "estimation_error: axis must be 0, 1, or 2");
            DVector::from_fn(n_anchors, |i, _| {
                estimate[(i, axis)] - ground_truth[(i, axis)]
            })
        }
        None => DVector::from_fn(n_anchors, |i, _| {
            (estimate.row(i) - ground_truth.row(i)).norm()
        }),
    }
}
