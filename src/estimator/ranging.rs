// Range-only radio source position estimator

use std::sync::Arc;

use tracing::debug;

use super::{
    position_block, run_estimate, EstimatorListener, Estimate, Lifecycle, RadioSourceEstimator,
    Settings,
};
use crate::constants::DEFAULT_FALLBACK_RSSI_STD;
use crate::error::Result;
use crate::lateration;
use crate::reading::{RangingReading, Reading};
use crate::residuals::{RangingResiduals, Weighting};
use crate::source::LocatedRadioSource;

/// Listener type accepted by [`RangingEstimator`]
pub type RangingListener<const D: usize> = Box<dyn EstimatorListener<RangingEstimator<D>>>;

/// Estimates the position of a radio source from range readings
///
/// Needs at least D+1 readings. With the nonlinear stage disabled the
/// linear solution is returned as is and no covariance is reported.
///
/// # Example
/// ```
/// use radiolocate::{RadioSource, RangingEstimator, RangingReading, RadioSourceEstimator};
///
/// let ap = RadioSource::access_point("00:11:22:33:44:55", 2.412e9);
/// let truth = [1.0, 2.0, 3.0];
/// let readings: Vec<RangingReading<3>> = [
///     [10.0, 0.0, 0.0],
///     [0.0, 10.0, 0.0],
///     [0.0, 0.0, 10.0],
///     [0.0, 0.0, 0.0],
/// ]
/// .iter()
/// .map(|x| {
///     let d = radiolocate::geometry::distance(&truth, x);
///     RangingReading::new(ap.clone(), *x, d).unwrap()
/// })
/// .collect();
///
/// let mut estimator = RangingEstimator::new();
/// estimator.set_readings(readings).unwrap();
/// estimator.estimate().unwrap();
/// let p = estimator.estimated_position().unwrap();
/// assert!((p[0] - 1.0).abs() < 1e-6);
/// ```
pub struct RangingEstimator<const D: usize> {
    settings: Settings<D, RangingReading<D>>,
    listener: Option<RangingListener<D>>,
    result: Option<Estimate<D>>,
}

impl<const D: usize> Default for RangingEstimator<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const D: usize> RangingEstimator<D> {
    pub fn new() -> Self {
        RangingEstimator {
            settings: Settings::new(),
            listener: None,
            result: None,
        }
    }

    /// Create an estimator with readings already set
    pub fn with_readings(readings: impl Into<Arc<[RangingReading<D>]>>) -> Result<Self> {
        let mut estimator = Self::new();
        estimator.set_readings(readings)?;
        Ok(estimator)
    }

    pub fn readings(&self) -> Option<&[RangingReading<D>]> {
        self.settings.readings.as_deref()
    }

    /// Set the readings; all must belong to the same radio source
    pub fn set_readings(&mut self, readings: impl Into<Arc<[RangingReading<D>]>>) -> Result<()> {
        self.settings.set_readings(readings.into())
    }

    pub fn initial_position(&self) -> Option<&[f64; D]> {
        self.settings.initial_position.as_ref()
    }

    /// Seed for the nonlinear stage; `None` uses the linear solution
    pub fn set_initial_position(&mut self, position: Option<[f64; D]>) -> Result<()> {
        self.settings.set_initial_position(position)
    }

    pub fn is_non_linear_solver_enabled(&self) -> bool {
        self.settings.non_linear_solver_enabled
    }

    pub fn set_non_linear_solver_enabled(&mut self, enabled: bool) -> Result<()> {
        self.settings.set_non_linear_solver_enabled(enabled)
    }

    pub fn is_homogeneous_linear_solver_used(&self) -> bool {
        self.settings.homogeneous_linear_solver_used
    }

    pub fn set_homogeneous_linear_solver_used(&mut self, used: bool) -> Result<()> {
        self.settings.set_homogeneous_linear_solver_used(used)
    }

    pub fn uses_reading_position_covariances(&self) -> bool {
        self.settings.use_reading_position_covariances
    }

    pub fn set_use_reading_position_covariances(&mut self, used: bool) -> Result<()> {
        self.settings.set_use_reading_position_covariances(used)
    }

    pub fn fallback_distance_standard_deviation(&self) -> f64 {
        self.settings.fallback_distance_std
    }

    /// Distance std used for readings that carry none
    pub fn set_fallback_distance_standard_deviation(&mut self, std: f64) -> Result<()> {
        self.settings.set_fallback_distance_std(std)
    }

    pub fn max_iterations(&self) -> usize {
        self.settings.solver.max_iterations
    }

    pub fn set_max_iterations(&mut self, max_iterations: usize) -> Result<()> {
        self.settings.set_max_iterations(max_iterations)
    }

    pub fn convergence_tolerance(&self) -> f64 {
        self.settings.solver.tolerance
    }

    pub fn set_convergence_tolerance(&mut self, tolerance: f64) -> Result<()> {
        self.settings.set_convergence_tolerance(tolerance)
    }

    pub fn set_listener(&mut self, listener: Option<RangingListener<D>>) -> Result<()> {
        self.settings.check_unlocked()?;
        self.listener = listener;
        Ok(())
    }

    pub fn min_readings(&self) -> usize {
        lateration::min_readings(D)
    }

    pub fn is_ready(&self) -> bool {
        self.settings.has_min_readings(self.min_readings())
    }

    pub fn is_locked(&self) -> bool {
        self.settings.locked
    }

    /// Estimate the radio source position
    ///
    /// # Returns
    /// * `Err(NotReady)` without enough readings
    /// * `Err(Locked)` when called from within a listener callback
    /// * `Err(EstimationFailed)` when the linear or nonlinear stage fails
    pub fn estimate(&mut self) -> Result<()> {
        run_estimate::<D, _>(self)
    }

    fn run(&self) -> Result<Estimate<D>> {
        let readings = self.settings.readings()?;
        debug!(
            readings = readings.len(),
            dimensions = D,
            non_linear = self.settings.non_linear_solver_enabled,
            "Estimating radio source position from ranges"
        );

        let seed = self.settings.seed_position(&readings)?;
        let (position, covariance) = if self.settings.non_linear_solver_enabled {
            let weighting = Weighting {
                fallback_distance_std: self.settings.fallback_distance_std,
                fallback_rssi_std: DEFAULT_FALLBACK_RSSI_STD,
                use_position_covariances: self.settings.use_reading_position_covariances,
            };
            let model = RangingResiduals::new(&readings, &seed, &weighting);
            let fit = self
                .settings
                .solver
                .fit(&model, RangingResiduals::initial_parameters(&seed))?;
            (RangingResiduals::<D>::position(&fit.parameters), fit.covariance)
        } else {
            (seed, None)
        };

        let position_covariance = covariance.as_ref().map(position_block::<D>);
        let mut radio_source = LocatedRadioSource::new(readings[0].source().clone(), position);
        radio_source.position_covariance = position_covariance.clone();

        debug!(?position, has_covariance = covariance.is_some(), "Radio source located");
        Ok(Estimate {
            position,
            covariance,
            position_covariance,
            transmitted_power_dbm: None,
            transmitted_power_variance: None,
            path_loss_exponent: None,
            path_loss_exponent_variance: None,
            radio_source,
        })
    }
}

impl<const D: usize> Lifecycle<D> for RangingEstimator<D> {
    type Reading = RangingReading<D>;

    const NAME: &'static str = "ranging";

    fn settings(&self) -> &Settings<D, RangingReading<D>> {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut Settings<D, RangingReading<D>> {
        &mut self.settings
    }

    fn listener_slot(&mut self) -> &mut Option<Box<dyn EstimatorListener<Self>>> {
        &mut self.listener
    }

    fn ready(&self) -> bool {
        self.is_ready()
    }

    fn compute(&self) -> Result<Estimate<D>> {
        self.run()
    }

    fn store(&mut self, estimate: Estimate<D>) {
        self.result = Some(estimate);
    }
}

impl<const D: usize> RadioSourceEstimator<D> for RangingEstimator<D> {
    fn min_readings(&self) -> usize {
        RangingEstimator::min_readings(self)
    }

    fn is_ready(&self) -> bool {
        RangingEstimator::is_ready(self)
    }

    fn is_locked(&self) -> bool {
        RangingEstimator::is_locked(self)
    }

    fn estimate(&mut self) -> Result<()> {
        RangingEstimator::estimate(self)
    }

    fn quality_scores(&self) -> Option<&[f64]> {
        self.settings.quality_scores.as_deref()
    }

    fn set_quality_scores(&mut self, scores: Option<Vec<f64>>) -> Result<()> {
        self.settings.set_quality_scores(scores)
    }

    fn result(&self) -> Option<&Estimate<D>> {
        self.result.as_ref()
    }
}
