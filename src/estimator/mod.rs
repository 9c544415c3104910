// Radio source estimators
//
// Both estimators run the same pipeline: a closed-form linear position
// (lateration) optionally refined by Levenberg-Marquardt, with covariance
// taken from the Jacobian at convergence. While `estimate()` runs the
// estimator is locked and every mutator fails with `Error::Locked`.

pub mod ranging;
pub mod ranging_rssi;

pub use ranging::RangingEstimator;
pub use ranging_rssi::RangingAndRssiEstimator;

use std::sync::Arc;

use nalgebra::DMatrix;
use tracing::warn;

use crate::constants::DEFAULT_FALLBACK_DISTANCE_STD;
use crate::error::{Error, Result};
use crate::lateration::{self, Formulation};
use crate::reading::Reading;
use crate::solver::LevenbergMarquardt;
use crate::source::LocatedRadioSource;

/// Callbacks invoked synchronously from `estimate()`
///
/// Both callbacks run while the estimator is locked. `on_estimate_end`
/// fires whether the estimation succeeded or failed.
pub trait EstimatorListener<E: ?Sized> {
    fn on_estimate_start(&mut self, _estimator: &mut E) {}

    fn on_estimate_end(&mut self, _estimator: &mut E) {}
}

/// Outcome of a successful estimation
#[derive(Debug, Clone)]
pub struct Estimate<const D: usize> {
    pub position: [f64; D],
    /// Covariance of every estimated parameter (position first, then
    /// transmitted power and path-loss exponent when estimated)
    pub covariance: Option<DMatrix<f64>>,
    /// D×D position block of `covariance`
    pub position_covariance: Option<DMatrix<f64>>,
    pub transmitted_power_dbm: Option<f64>,
    pub transmitted_power_variance: Option<f64>,
    pub path_loss_exponent: Option<f64>,
    pub path_loss_exponent_variance: Option<f64>,
    pub radio_source: LocatedRadioSource<D>,
}

/// Public surface shared by the estimators
///
/// This is the seam a robust (sampling consensus) wrapper drives: it
/// reconfigures readings, calls `estimate()` and reads the results.
pub trait RadioSourceEstimator<const D: usize> {
    /// Minimum number of readings for the current configuration
    fn min_readings(&self) -> usize;

    fn is_ready(&self) -> bool;

    fn is_locked(&self) -> bool;

    fn estimate(&mut self) -> Result<()>;

    /// Quality scores stored for the caller, never interpreted here
    fn quality_scores(&self) -> Option<&[f64]>;

    fn set_quality_scores(&mut self, scores: Option<Vec<f64>>) -> Result<()>;

    /// Latest successful estimate
    fn result(&self) -> Option<&Estimate<D>>;

    fn estimated_position(&self) -> Option<&[f64; D]> {
        self.result().map(|r| &r.position)
    }

    /// Flat view of the estimated position
    fn estimated_position_coordinates(&self) -> Option<&[f64]> {
        self.result().map(|r| r.position.as_slice())
    }

    fn estimated_covariance(&self) -> Option<&DMatrix<f64>> {
        self.result().and_then(|r| r.covariance.as_ref())
    }

    fn estimated_position_covariance(&self) -> Option<&DMatrix<f64>> {
        self.result().and_then(|r| r.position_covariance.as_ref())
    }

    /// Located source built by the latest successful estimate
    fn estimated_radio_source(&self) -> Option<LocatedRadioSource<D>> {
        self.result().map(|r| r.radio_source.clone())
    }
}

/// Configuration and lock state common to both estimators
#[derive(Debug, Clone)]
pub(crate) struct Settings<const D: usize, R> {
    pub readings: Option<Arc<[R]>>,
    pub initial_position: Option<[f64; D]>,
    pub non_linear_solver_enabled: bool,
    pub homogeneous_linear_solver_used: bool,
    pub use_reading_position_covariances: bool,
    pub fallback_distance_std: f64,
    pub solver: LevenbergMarquardt,
    pub quality_scores: Option<Vec<f64>>,
    pub locked: bool,
}

impl<const D: usize, R: Reading<D>> Settings<D, R> {
    pub fn new() -> Self {
        Settings {
            readings: None,
            initial_position: None,
            non_linear_solver_enabled: true,
            homogeneous_linear_solver_used: false,
            use_reading_position_covariances: true,
            fallback_distance_std: DEFAULT_FALLBACK_DISTANCE_STD,
            solver: LevenbergMarquardt::default(),
            quality_scores: None,
            locked: false,
        }
    }

    pub fn check_unlocked(&self) -> Result<()> {
        if self.locked {
            Err(Error::Locked)
        } else {
            Ok(())
        }
    }

    /// Validate and store readings
    pub fn set_readings(&mut self, readings: Arc<[R]>) -> Result<()> {
        self.check_unlocked()?;
        let first = readings
            .first()
            .ok_or_else(|| Error::invalid("readings must not be empty"))?;
        let frequency = first.source().frequency;
        if !frequency.is_finite() || frequency <= 0.0 {
            return Err(Error::invalid(format!(
                "radio source frequency must be > 0 Hz, got {}",
                frequency
            )));
        }
        if readings.iter().any(|r| r.source() != first.source()) {
            return Err(Error::invalid("all readings must belong to the same radio source"));
        }
        self.readings = Some(readings);
        Ok(())
    }

    pub fn set_initial_position(&mut self, position: Option<[f64; D]>) -> Result<()> {
        self.check_unlocked()?;
        if let Some(p) = &position {
            if p.iter().any(|v| !v.is_finite()) {
                return Err(Error::invalid("initial position must be finite"));
            }
        }
        self.initial_position = position;
        Ok(())
    }

    pub fn set_non_linear_solver_enabled(&mut self, enabled: bool) -> Result<()> {
        self.check_unlocked()?;
        self.non_linear_solver_enabled = enabled;
        Ok(())
    }

    pub fn set_homogeneous_linear_solver_used(&mut self, used: bool) -> Result<()> {
        self.check_unlocked()?;
        self.homogeneous_linear_solver_used = used;
        Ok(())
    }

    pub fn set_use_reading_position_covariances(&mut self, used: bool) -> Result<()> {
        self.check_unlocked()?;
        self.use_reading_position_covariances = used;
        Ok(())
    }

    pub fn set_fallback_distance_std(&mut self, std: f64) -> Result<()> {
        self.check_unlocked()?;
        self.fallback_distance_std = positive("fallback distance standard deviation", std)?;
        Ok(())
    }

    pub fn set_max_iterations(&mut self, max_iterations: usize) -> Result<()> {
        self.check_unlocked()?;
        if max_iterations == 0 {
            return Err(Error::invalid("max iterations must be at least 1"));
        }
        self.solver.max_iterations = max_iterations;
        Ok(())
    }

    pub fn set_convergence_tolerance(&mut self, tolerance: f64) -> Result<()> {
        self.check_unlocked()?;
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(Error::invalid(format!(
                "convergence tolerance must be >= 0, got {}",
                tolerance
            )));
        }
        self.solver.tolerance = tolerance;
        Ok(())
    }

    pub fn set_quality_scores(&mut self, scores: Option<Vec<f64>>) -> Result<()> {
        self.check_unlocked()?;
        self.quality_scores = scores;
        Ok(())
    }

    pub fn has_min_readings(&self, min: usize) -> bool {
        self.readings.as_ref().is_some_and(|r| r.len() >= min)
    }

    pub fn readings(&self) -> Result<Arc<[R]>> {
        self.readings.clone().ok_or(Error::NotReady)
    }

    /// Position the nonlinear stage starts from
    ///
    /// A caller-supplied initial position replaces the linear solve when the
    /// nonlinear stage is enabled. Otherwise the linear solution is used and,
    /// with the nonlinear stage disabled, is also the final answer.
    pub fn seed_position(&self, readings: &[R]) -> Result<[f64; D]> {
        match (self.non_linear_solver_enabled, self.initial_position) {
            (true, Some(p)) => Ok(p),
            _ => {
                let formulation =
                    Formulation::from_homogeneous_flag(self.homogeneous_linear_solver_used);
                Ok(lateration::solve(readings, formulation)?)
            }
        }
    }
}

/// Parts of an estimator driven by [`run_estimate`]
pub(crate) trait Lifecycle<const D: usize>: Sized {
    type Reading: Reading<D>;

    /// Name used in log messages
    const NAME: &'static str;

    fn settings(&self) -> &Settings<D, Self::Reading>;

    fn settings_mut(&mut self) -> &mut Settings<D, Self::Reading>;

    fn listener_slot(&mut self) -> &mut Option<Box<dyn EstimatorListener<Self>>>;

    fn ready(&self) -> bool;

    /// Run the linear and nonlinear stages on the current configuration
    fn compute(&self) -> Result<Estimate<D>>;

    fn store(&mut self, estimate: Estimate<D>);
}

/// Lock, notify, compute and unlock
///
/// `NotReady` and `Locked` return before any callback. Otherwise both
/// callbacks run while locked and the end callback fires even when the
/// computation fails. The result is only replaced on success.
pub(crate) fn run_estimate<const D: usize, E: Lifecycle<D>>(estimator: &mut E) -> Result<()> {
    if !estimator.ready() {
        return Err(Error::NotReady);
    }
    estimator.settings().check_unlocked()?;
    estimator.settings_mut().locked = true;

    let mut listener = estimator.listener_slot().take();
    if let Some(l) = listener.as_mut() {
        l.on_estimate_start(estimator);
    }

    let outcome = estimator.compute().map(|estimate| estimator.store(estimate));
    if let Err(e) = &outcome {
        warn!(error = %e, estimator = E::NAME, "Estimation failed");
    }

    if let Some(l) = listener.as_mut() {
        l.on_estimate_end(estimator);
    }
    *estimator.listener_slot() = listener;
    estimator.settings_mut().locked = false;

    outcome
}

pub(crate) fn positive(name: &str, value: f64) -> Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(Error::invalid(format!("{} must be > 0, got {}", name, value)))
    }
}

/// Leading D×D block of a parameter covariance
pub(crate) fn position_block<const D: usize>(covariance: &DMatrix<f64>) -> DMatrix<f64> {
    covariance.view((0, 0), (D, D)).into_owned()
}
