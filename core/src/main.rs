//! ANCHORCAL: batch autocalibration of UWB anchor positions.
//!
//! Reads a YAML network configuration and a directory of per-anchor ranging
//! logs, runs the two-stage calibration (per sample round in parallel, or once
//! over the per-pair median), and reports the estimated anchor coordinates.
//! When the configuration carries surveyed ground-truth positions, a
//! per-anchor error table is logged and can be written out as CSV.

use std::error::Error;
use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use log::{info, warn};

use anchorcal::io::{read_ranging_logs, write_error_report, NetworkConfig};
use anchorcal::{batch, metrics};

#[derive(Parser, Debug)]
#[command(
    name = "anchorcal",
    about = "Autocalibrate UWB anchor positions from inter-anchor ranging logs"
)]
struct Cli {
    /// YAML network configuration (anchor ids, initial coordinates, fixed anchors)
    #[arg(short, long)]
    config: PathBuf,
    /// Directory containing the per-anchor ranging logs (<id>_ranging_data.txt)
    #[arg(short, long)]
    data_dir: PathBuf,
    /// Number of sample rounds to read (after the discarded warm-up round)
    #[arg(short = 'n', long)]
    samples: usize,
    /// Calibrate once from the per-pair median instead of per sample round
    #[arg(long)]
    median: bool,
    /// Override the configured lower acceptance percentile (0-100)
    #[arg(long)]
    lower_percentile: Option<f64>,
    /// Override the configured upper acceptance percentile (0-100)
    #[arg(long)]
    upper_percentile: Option<f64>,
    /// Write the per-anchor error report to this CSV file (requires ground truth)
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Report the Stage 2 cost before and after optimization
    #[arg(short, long)]
    verbose: bool,
    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logger(log_level: &str) {
    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });
    let _ = builder.try_init();
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level);

    let config = NetworkConfig::from_yaml_file(&cli.config)?;
    let mut solver = config.solver.clone();
    if let Some(lower) = cli.lower_percentile {
        solver.lower_percentile = lower;
    }
    if let Some(upper) = cli.upper_percentile {
        solver.upper_percentile = upper;
    }
    solver.verbose = solver.verbose || cli.verbose;

    let anchor_ids = config.anchor_ids();
    let initial_guess = config.initial_guess();
    let fixed = config.fixed_mask();
    info!(
        "calibrating {} anchors ({} fixed) from {} sample rounds",
        anchor_ids.len(),
        fixed.iter().filter(|f| **f).count(),
        cli.samples
    );

    let cube = read_ranging_logs(&cli.data_dir, &anchor_ids, cli.samples);

    let estimate = if cli.median {
        info!("running one calibration over the per-pair median");
        batch::calibrate_median(&cube, &initial_guess, &fixed, &solver)
    } else {
        info!("running one calibration per sample round in parallel");
        let estimates = batch::calibrate_all_samples(&cube, &initial_guess, &fixed, &solver);
        batch::mean_estimate(&estimates)
    };

    for (i, id) in anchor_ids.iter().enumerate() {
        info!(
            "{}: [{:.3}, {:.3}, {:.3}]",
            id,
            estimate[(i, 0)],
            estimate[(i, 1)],
            estimate[(i, 2)]
        );
    }

    match config.ground_truth() {
        Some(truth) => {
            let error = metrics::estimation_error(&estimate, &truth, None);
            for (i, id) in anchor_ids.iter().enumerate() {
                info!("{}: error {:.3} m", id, error[i]);
            }
            if let Some(output) = &cli.output {
                write_error_report(output, &anchor_ids, &estimate, &truth)?;
                info!("error report written to {}", output.display());
            }
        }
        None => {
            if cli.output.is_some() {
                warn!("no complete ground truth in the configuration; skipping the error report");
            }
        }
    }

    Ok(())
}
