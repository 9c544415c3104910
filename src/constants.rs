// Shared constants for radio-source estimation

/// Speed of light in vacuum (m/s).
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Free-space path-loss exponent, used as the default initial value.
pub const DEFAULT_PATH_LOSS_EXPONENT: f64 = 2.0;

/// Standard deviation applied to distance residuals when a reading carries none (m).
pub const DEFAULT_FALLBACK_DISTANCE_STD: f64 = 1.0;

/// Standard deviation applied to RSSI residuals when a reading carries none (dB).
pub const DEFAULT_FALLBACK_RSSI_STD: f64 = 1.0;

/// Maximum accepted Levenberg-Marquardt steps before giving up.
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// Relative cost improvement below which the refiner stops.
pub const DEFAULT_CONVERGENCE_TOLERANCE: f64 = 1e-12;

/// Absolute cost treated as an exact fit.
pub const EXACT_FIT_COST: f64 = 1e-24;

/// Initial Levenberg-Marquardt damping factor.
pub const INITIAL_DAMPING: f64 = 1e-3;

/// Damping beyond which no descent step is considered possible.
pub const MAX_DAMPING: f64 = 1e12;

/// Relative singular value threshold for the linear solver's rank test.
pub const RANK_TOLERANCE: f64 = 1e-10;

/// Distances below this are clamped when evaluating the path-loss model (m).
pub const MIN_MODEL_DISTANCE: f64 = 1e-9;
