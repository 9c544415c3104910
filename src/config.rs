use clap::Parser;

/// Radio source locator configuration
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// JSON file with the radio source and its readings
    #[arg(value_name = "FILE")]
    pub readings: String,

    /// Number of spatial dimensions (2 or 3)
    #[arg(long, short, default_value_t = 3, value_parser = clap::value_parser!(u8).range(2..=3))]
    pub dimensions: u8,

    /// Use RSSI as well as ranges, estimating transmitted power
    #[arg(long, default_value_t = false)]
    pub rssi: bool,

    /// Skip Levenberg-Marquardt refinement and report the linear solution only
    #[arg(long, default_value_t = false)]
    pub no_non_linear: bool,

    /// Use the homogeneous linear formulation
    #[arg(long, default_value_t = false)]
    pub homogeneous: bool,

    /// Ignore receiver position covariances when weighting readings
    #[arg(long, default_value_t = false)]
    pub ignore_position_covariances: bool,

    /// Initial guess for the source position, comma separated
    #[arg(long, value_name = "X,Y[,Z]", value_delimiter = ',')]
    pub initial_position: Option<Vec<f64>>,

    /// Initial transmitted power in dBm (RSSI mode)
    #[arg(long, value_name = "DBM", allow_negative_numbers = true)]
    pub initial_power_dbm: Option<f64>,

    /// Initial path-loss exponent (RSSI mode)
    #[arg(long, default_value_t = 2.0)]
    pub initial_path_loss: f64,

    /// Estimate the path-loss exponent as well (RSSI mode)
    #[arg(long, default_value_t = false)]
    pub estimate_path_loss: bool,

    /// Hold the transmitted power at its initial value (RSSI mode)
    #[arg(long, default_value_t = false)]
    pub no_power_estimation: bool,

    /// Distance standard deviation for readings without one, meters
    #[arg(long, default_value_t = 1.0)]
    pub distance_std: f64,

    /// RSSI standard deviation for readings without one, dB
    #[arg(long, default_value_t = 1.0)]
    pub rssi_std: f64,

    /// Levenberg-Marquardt iteration limit
    #[arg(long, default_value_t = 100)]
    pub max_iterations: usize,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}
