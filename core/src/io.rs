//! Ranging-log reading, network configuration, and the calibration report.
//!
//! This module is the thin shell around the solver:
//! - [`read_ranging_logs`] turns one whitespace-separated text file per anchor
//!   into the [`RangeSampleCube`]. Anything missing degrades to sentinel
//!   entries; a calibration batch is never aborted by a dead anchor.
//! - [`NetworkConfig`] is the YAML deployment description (anchor ids, initial
//!   survey, optional ground truth, fixed-anchor list) and resolves into the
//!   solver's input shapes.
//! - [`write_error_report`] writes the tabular per-anchor error report as CSV.

use std::error::Error;
use std::fs;
use std::path::Path;

use log::warn;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::metrics::estimation_error;
use crate::{RangeSampleCube, SolverConfig, INVALID_RANGE};

/// One anchor of the deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorConfig {
    /// Hardware id, also the ranging-log file stem (`<id>_ranging_data.txt`).
    pub id: String,
    /// Surveyed initial coordinate guess `[x, y, z]` in meters.
    pub initial: [f64; 3],
    /// Precisely surveyed true coordinates, when available (validation only).
    #[serde(default)]
    pub ground_truth: Option<[f64; 3]>,
}

/// YAML deployment description.
///
/// ```yaml
/// anchors:
///   - id: DW51A5
///     initial: [0.0, 0.0, 2.5]
///     ground_truth: [0.05, -0.02, 2.51]
///   - id: DW8428
///     initial: [8.0, 0.0, 2.5]
/// fixed_anchors: [DW51A5]
/// solver:
///   lower_percentile: 10.0
///   upper_percentile: 90.0
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Anchors in network order; indices into the solver matrices follow this
    /// ordering.
    pub anchors: Vec<AnchorConfig>,
    /// Ids of anchors whose position is externally trusted. Ids that match no
    /// anchor are ignored.
    #[serde(default)]
    pub fixed_anchors: Vec<String>,
    /// Solver overrides; defaults apply for anything left out.
    #[serde(default)]
    pub solver: SolverConfig,
}

impl NetworkConfig {
    /// Parse a configuration from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Read and parse a YAML configuration file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn Error>> {
        let contents = fs::read_to_string(path)?;
        Ok(Self::from_yaml_str(&contents)?)
    }

    /// Anchor ids in network order.
    pub fn anchor_ids(&self) -> Vec<String> {
        self.anchors.iter().map(|a| a.id.clone()).collect()
    }

    /// Initial coordinate guess as an `N x 3` matrix.
    pub fn initial_guess(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.anchors.len(), 3, |i, c| self.anchors[i].initial[c])
    }

    /// Fixed-anchor mask in network order. Ids listed in `fixed_anchors` that
    /// match no configured anchor are silently skipped.
    pub fn fixed_mask(&self) -> Vec<bool> {
        self.anchors
            .iter()
            .map(|a| self.fixed_anchors.iter().any(|id| *id == a.id))
            .collect()
    }

    /// Ground-truth matrix, available only when every anchor carries one.
    pub fn ground_truth(&self) -> Option<DMatrix<f64>> {
        let mut truth = DMatrix::zeros(self.anchors.len(), 3);
        for (i, anchor) in self.anchors.iter().enumerate() {
            let gt = anchor.ground_truth?;
            for c in 0..3 {
                truth[(i, c)] = gt[c];
            }
        }
        Some(truth)
    }
}

/// Read the per-anchor ranging logs of a calibration session into a cube.
///
/// Anchor `i`'s log is `<data_dir>/<id>_ranging_data.txt`: one row per sample
/// round, one whitespace-separated column per target anchor. The first row is
/// discarded (the firmware's warm-up round is usually all bad readings), and
/// the next `n_samples` rows populate the cube. A missing or unreadable file
/// leaves that anchor's observations at [`INVALID_RANGE`]; short files and
/// unparseable tokens likewise degrade entry-wise. The batch never aborts on
/// bad data.
///
/// # Arguments
/// * `data_dir` - directory holding the log files.
/// * `anchor_ids` - anchor ids in network order.
/// * `n_samples` - number of sample rounds to retain after the discarded warm-up row.
///
/// # Returns
/// * A `(N, n_samples, N)` [`RangeSampleCube`].
pub fn read_ranging_logs<P: AsRef<Path>>(
    data_dir: P,
    anchor_ids: &[String],
    n_samples: usize,
) -> RangeSampleCube {
    let n_anchors = anchor_ids.len();
    let mut cube = RangeSampleCube::filled_invalid(n_anchors, n_samples);
    for (i, id) in anchor_ids.iter().enumerate() {
        let path = data_dir.as_ref().join(format!("{}_ranging_data.txt", id));
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!(
                    "no ranging log for anchor {} ({}): {}; leaving its rows invalid",
                    id,
                    path.display(),
                    err
                );
                continue;
            }
        };
        // skip the warm-up round
        for (m, line) in contents.lines().skip(1).take(n_samples).enumerate() {
            for (k, token) in line.split_whitespace().take(n_anchors).enumerate() {
                let value = token.parse::<f64>().unwrap_or(INVALID_RANGE);
                cube.set(i, m, k, value);
            }
        }
    }
    cube
}

/// One row of the calibration error report.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorReportRow {
    pub anchor_id: String,
    pub error_m: f64,
    pub x_error_m: f64,
    pub y_error_m: f64,
    pub z_error_m: f64,
}

/// Build the per-anchor error report rows for an estimate.
pub fn error_report(
    anchor_ids: &[String],
    estimate: &DMatrix<f64>,
    ground_truth: &DMatrix<f64>,
) -> Vec<ErrorReportRow> {
    let euclidean = estimation_error(estimate, ground_truth, None);
    let x = estimation_error(estimate, ground_truth, Some(0));
    let y = estimation_error(estimate, ground_truth, Some(1));
    let z = estimation_error(estimate, ground_truth, Some(2));
    anchor_ids
        .iter()
        .enumerate()
        .map(|(i, id)| ErrorReportRow {
            anchor_id: id.clone(),
            error_m: euclidean[i],
            x_error_m: x[i],
            y_error_m: y[i],
            z_error_m: z[i],
        })
        .collect()
}

/// Write the per-anchor error report to a CSV file.
///
/// # Arguments
/// * `path` - output CSV path.
/// * `anchor_ids` - anchor ids in network order.
/// * `estimate` - calibrated `N x 3` coordinates.
/// * `ground_truth` - surveyed `N x 3` coordinates.
pub fn write_error_report<P: AsRef<Path>>(
    path: P,
    anchor_ids: &[String],
    estimate: &DMatrix<f64>,
    ground_truth: &DMatrix<f64>,
) -> Result<(), Box<dyn Error>> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in error_report(anchor_ids, estimate, ground_truth) {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinates_from_rows;
    use assert_approx_eq::assert_approx_eq;
    use std::io::Write;

    const CONFIG_YAML: &str = "
anchors:
  - id: DW51A5
    initial: [0.0, 0.0, 2.5]
    ground_truth: [0.05, -0.02, 2.51]
  - id: DW8428
    initial: [8.0, 0.0, 2.5]
    ground_truth: [8.01, 0.03, 2.48]
  - id: DW90B7
    initial: [0.0, 6.0, 2.5]
fixed_anchors: [DW51A5, DWFFFF]
solver:
  lower_percentile: 10.0
  upper_percentile: 90.0
";

    #[test]
    fn test_network_config_resolution() {
        let config = NetworkConfig::from_yaml_str(CONFIG_YAML).expect("valid yaml");
        assert_eq!(config.anchor_ids(), vec!["DW51A5", "DW8428", "DW90B7"]);
        let guess = config.initial_guess();
        assert_eq!(guess.nrows(), 3);
        assert_eq!(guess[(1, 0)], 8.0);
        // the unknown id DWFFFF is ignored
        assert_eq!(config.fixed_mask(), vec![true, false, false]);
        // solver overrides applied on top of defaults
        assert_eq!(config.solver.lower_percentile, 10.0);
        assert_eq!(config.solver.upper_percentile, 90.0);
        assert_eq!(config.solver.max_iters, 1500);
    }

    #[test]
    fn test_ground_truth_requires_every_anchor() {
        let config = NetworkConfig::from_yaml_str(CONFIG_YAML).expect("valid yaml");
        // DW90B7 has no ground truth
        assert!(config.ground_truth().is_none());

        let mut config = config;
        config.anchors[2].ground_truth = Some([0.0, 6.02, 2.5]);
        let truth = config.ground_truth().expect("complete ground truth");
        assert_eq!(truth[(2, 1)], 6.02);
    }

    #[test]
    fn test_read_ranging_logs_skips_warmup_and_degrades() {
        let dir = std::env::temp_dir().join("anchorcal_log_reader_test");
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let ids = vec!["A0".to_string(), "A1".to_string(), "A2".to_string()];

        // A0: warm-up row of bad readings, then two good rounds with one
        // unparseable token
        let mut f = std::fs::File::create(dir.join("A0_ranging_data.txt")).unwrap();
        writeln!(f, "-1.0 -1.0 -1.0").unwrap();
        writeln!(f, "-1.0 4.20 7.10").unwrap();
        writeln!(f, "-1.0 4.25 bogus").unwrap();
        drop(f);
        // A1: file shorter than requested
        let mut f = std::fs::File::create(dir.join("A1_ranging_data.txt")).unwrap();
        writeln!(f, "-1.0 -1.0 -1.0").unwrap();
        writeln!(f, "3.90 -1.0 5.55").unwrap();
        drop(f);
        // A2: no file at all

        let cube = read_ranging_logs(&dir, &ids, 2);
        assert_eq!(cube.n_samples(), 2);
        assert_approx_eq!(cube.get(0, 0, 1), 4.20, 1e-12);
        assert_approx_eq!(cube.get(0, 1, 1), 4.25, 1e-12);
        assert_eq!(cube.get(0, 1, 2), INVALID_RANGE);
        assert_approx_eq!(cube.get(1, 0, 2), 5.55, 1e-12);
        // missing second round of A1 and the whole of A2 degrade to sentinels
        assert_eq!(cube.get(1, 1, 0), INVALID_RANGE);
        for m in 0..2 {
            for k in 0..3 {
                assert_eq!(cube.get(2, m, k), INVALID_RANGE);
            }
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_error_report_rows() {
        let ids = vec!["A0".to_string(), "A1".to_string()];
        let truth = coordinates_from_rows(&[[0.0, 0.0, 0.0], [10.0, 0.0, 0.0]]);
        let estimate = coordinates_from_rows(&[[0.3, -0.4, 0.0], [10.0, 0.0, 0.0]]);
        let rows = error_report(&ids, &estimate, &truth);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].anchor_id, "A0");
        assert_approx_eq!(rows[0].error_m, 0.5, 1e-12);
        assert_approx_eq!(rows[0].x_error_m, 0.3, 1e-12);
        assert_approx_eq!(rows[0].y_error_m, -0.4, 1e-12);
        assert_approx_eq!(rows[1].error_m, 0.0, 1e-12);
    }

    #[test]
    fn test_write_error_report_roundtrip() {
        let ids = vec!["A0".to_string()];
        let truth = coordinates_from_rows(&[[1.0, 2.0, 3.0]]);
        let estimate = coordinates_from_rows(&[[1.1, 2.0, 3.0]]);
        let path = std::env::temp_dir().join("anchorcal_error_report_test.csv");
        write_error_report(&path, &ids, &estimate, &truth).expect("write report");

        let mut reader = csv::Reader::from_path(&path).expect("read report");
        let rows: Vec<ErrorReportRow> = reader
            .deserialize()
            .collect::<Result<_, _>>()
            .expect("parse report");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].anchor_id, "A0");
        assert_approx_eq!(rows[0].x_error_m, 0.1, 1e-9);

        let _ = std::fs::remove_file(&path);
    }
}
