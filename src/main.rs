// Radio source locator - command line entry point
//
// Reads a JSON reading file, runs the configured estimator and prints the
// located source as JSON on stdout. Logs go to stderr.

use clap::Parser;
use radiolocate::config::Config;
use radiolocate::report::{ReadingFile, SourceReport};
use radiolocate::{Error, RadioSourceEstimator, RangingAndRssiEstimator, RangingEstimator};
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_logging(config.verbose);

    let text = std::fs::read_to_string(&config.readings).map_err(|e| {
        error!("Failed to read {}: {}", config.readings, e);
        e
    })?;
    let file = ReadingFile::from_json(&text).map_err(|e| {
        error!("Invalid reading file {}: {}", config.readings, e);
        e
    })?;
    info!(
        "Locating {} from {} readings ({}D)",
        file.source.identifier,
        file.readings.len(),
        config.dimensions
    );

    let located = match config.dimensions {
        2 => locate::<2>(&config, &file),
        _ => locate::<3>(&config, &file),
    };
    let report = located.map_err(|e| {
        error!("Estimation failed: {}", e);
        e
    })?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn locate<const D: usize>(config: &Config, file: &ReadingFile) -> Result<SourceReport, Error> {
    let initial_position = match &config.initial_position {
        Some(values) => Some(<[f64; D]>::try_from(values.as_slice()).map_err(|_| {
            Error::InvalidArgument(format!("initial position needs {} coordinates", D))
        })?),
        None => None,
    };

    if config.rssi {
        let readings = file.ranging_and_rssi_readings::<D>()?;
        let mut estimator = RangingAndRssiEstimator::<D>::with_readings(readings)?;
        estimator.set_non_linear_solver_enabled(!config.no_non_linear)?;
        estimator.set_homogeneous_linear_solver_used(config.homogeneous)?;
        estimator.set_use_reading_position_covariances(!config.ignore_position_covariances)?;
        estimator.set_initial_position(initial_position)?;
        estimator.set_initial_transmitted_power_dbm(config.initial_power_dbm)?;
        estimator.set_transmitted_power_estimation_enabled(!config.no_power_estimation)?;
        estimator.set_initial_path_loss_exponent(config.initial_path_loss)?;
        estimator.set_path_loss_estimation_enabled(config.estimate_path_loss)?;
        estimator.set_fallback_distance_standard_deviation(config.distance_std)?;
        estimator.set_fallback_rssi_standard_deviation(config.rssi_std)?;
        estimator.set_max_iterations(config.max_iterations)?;
        report::<D, _>(&mut estimator)
    } else {
        let mut estimator = RangingEstimator::<D>::with_readings(file.ranging_readings::<D>()?)?;
        estimator.set_non_linear_solver_enabled(!config.no_non_linear)?;
        estimator.set_homogeneous_linear_solver_used(config.homogeneous)?;
        estimator.set_use_reading_position_covariances(!config.ignore_position_covariances)?;
        estimator.set_initial_position(initial_position)?;
        estimator.set_fallback_distance_standard_deviation(config.distance_std)?;
        estimator.set_max_iterations(config.max_iterations)?;
        report::<D, _>(&mut estimator)
    }
}

fn report<const D: usize, E>(estimator: &mut E) -> Result<SourceReport, Error>
where
    E: RadioSourceEstimator<D>,
{
    if !estimator.is_ready() {
        error!("Need at least {} readings", estimator.min_readings());
        return Err(Error::NotReady);
    }
    estimator.estimate()?;
    let estimate = estimator.result().ok_or(Error::NotReady)?;
    Ok(SourceReport::from_estimate(estimate))
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;

    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_span_events(if verbose {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    if verbose {
        subscriber
            .with_max_level(tracing::Level::DEBUG)
            .init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber
            .with_max_level(tracing::Level::INFO)
            .init();
    }
}
