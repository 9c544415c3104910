// Range + RSSI radio source estimator
//
// Estimates position and, optionally, transmitted power and path-loss
// exponent. Each reading contributes a distance residual and a received
// power residual to the nonlinear stage.

use std::sync::Arc;

use tracing::debug;

use super::{
    position_block, positive, run_estimate, EstimatorListener, Estimate, Lifecycle,
    RadioSourceEstimator, Settings,
};
use crate::constants::{DEFAULT_FALLBACK_RSSI_STD, DEFAULT_PATH_LOSS_EXPONENT};
use crate::error::{Error, Result};
use crate::lateration;
use crate::pathloss;
use crate::reading::{RangingAndRssiReading, Reading};
use crate::residuals::{PowerModel, RangingAndRssiResiduals, Weighting};
use crate::source::LocatedRadioSource;

/// Listener type accepted by [`RangingAndRssiEstimator`]
pub type RangingAndRssiListener<const D: usize> =
    Box<dyn EstimatorListener<RangingAndRssiEstimator<D>>>;

/// Estimates position, transmitted power and path-loss exponent of a radio
/// source from paired range and RSSI readings.
///
/// Transmitted power is estimated by default; the path-loss exponent is held
/// at its initial value (2.0, free space) unless its estimation is enabled.
/// Each jointly estimated quantity raises the minimum reading count by one.
pub struct RangingAndRssiEstimator<const D: usize> {
    settings: Settings<D, RangingAndRssiReading<D>>,
    initial_transmitted_power_dbm: Option<f64>,
    transmitted_power_estimation_enabled: bool,
    initial_path_loss_exponent: f64,
    path_loss_estimation_enabled: bool,
    fallback_rssi_std: f64,
    listener: Option<RangingAndRssiListener<D>>,
    result: Option<Estimate<D>>,
}

impl<const D: usize> Default for RangingAndRssiEstimator<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const D: usize> RangingAndRssiEstimator<D> {
    pub fn new() -> Self {
        RangingAndRssiEstimator {
            settings: Settings::new(),
            initial_transmitted_power_dbm: None,
            transmitted_power_estimation_enabled: true,
            initial_path_loss_exponent: DEFAULT_PATH_LOSS_EXPONENT,
            path_loss_estimation_enabled: false,
            fallback_rssi_std: DEFAULT_FALLBACK_RSSI_STD,
            listener: None,
            result: None,
        }
    }

    pub fn with_readings(readings: impl Into<Arc<[RangingAndRssiReading<D>]>>) -> Result<Self> {
        let mut estimator = Self::new();
        estimator.set_readings(readings)?;
        Ok(estimator)
    }

    pub fn readings(&self) -> Option<&[RangingAndRssiReading<D>]> {
        self.settings.readings.as_deref()
    }

    pub fn set_readings(
        &mut self,
        readings: impl Into<Arc<[RangingAndRssiReading<D>]>>,
    ) -> Result<()> {
        self.settings.set_readings(readings.into())
    }

    pub fn initial_position(&self) -> Option<&[f64; D]> {
        self.settings.initial_position.as_ref()
    }

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

    /// Initial transmitted power in dBm
    pub fn initial_transmitted_power_dbm(&self) -> Option<f64> {
        self.initial_transmitted_power_dbm
    }

    /// Set the initial transmitted power in dBm; `None` derives it from the readings
    pub fn set_initial_transmitted_power_dbm(&mut self, power_dbm: Option<f64>) -> Result<()> {
        self.settings.check_unlocked()?;
        if let Some(p) = power_dbm {
            if !p.is_finite() {
                return Err(Error::invalid(format!(
                    "transmitted power must be finite, got {} dBm",
                    p
                )));
            }
        }
        self.initial_transmitted_power_dbm = power_dbm;
        Ok(())
    }

    /// Initial transmitted power in milliwatts
    pub fn initial_transmitted_power(&self) -> Option<f64> {
        self.initial_transmitted_power_dbm.map(pathloss::dbm_to_power)
    }

    /// Set the initial transmitted power in milliwatts
    pub fn set_initial_transmitted_power(&mut self, power: Option<f64>) -> Result<()> {
        self.settings.check_unlocked()?;
        let power_dbm = match power {
            Some(p) => Some(pathloss::power_to_dbm(positive("transmitted power", p)?)),
            None => None,
        };
        self.initial_transmitted_power_dbm = power_dbm;
        Ok(())
    }

    pub fn is_transmitted_power_estimation_enabled(&self) -> bool {
        self.transmitted_power_estimation_enabled
    }

    pub fn set_transmitted_power_estimation_enabled(&mut self, enabled: bool) -> Result<()> {
        self.settings.check_unlocked()?;
        self.transmitted_power_estimation_enabled = enabled;
        Ok(())
    }

    pub fn initial_path_loss_exponent(&self) -> f64 {
        self.initial_path_loss_exponent
    }

    pub fn set_initial_path_loss_exponent(&mut self, exponent: f64) -> Result<()> {
        self.settings.check_unlocked()?;
        if !exponent.is_finite() {
            return Err(Error::invalid(format!(
                "path-loss exponent must be finite, got {}",
                exponent
            )));
        }
        self.initial_path_loss_exponent = exponent;
        Ok(())
    }

    pub fn is_path_loss_estimation_enabled(&self) -> bool {
        self.path_loss_estimation_enabled
    }

    pub fn set_path_loss_estimation_enabled(&mut self, enabled: bool) -> Result<()> {
        self.settings.check_unlocked()?;
        self.path_loss_estimation_enabled = enabled;
        Ok(())
    }

    pub fn fallback_distance_standard_deviation(&self) -> f64 {
        self.settings.fallback_distance_std
    }

    pub fn set_fallback_distance_standard_deviation(&mut self, std: f64) -> Result<()> {
        self.settings.set_fallback_distance_std(std)
    }

    pub fn fallback_rssi_standard_deviation(&self) -> f64 {
        self.fallback_rssi_std
    }

    /// RSSI std (dB) used for readings that carry none
    pub fn set_fallback_rssi_standard_deviation(&mut self, std: f64) -> Result<()> {
        self.settings.check_unlocked()?;
        self.fallback_rssi_std = positive("fallback rssi standard deviation", std)?;
        Ok(())
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

    pub fn set_listener(&mut self, listener: Option<RangingAndRssiListener<D>>) -> Result<()> {
        self.settings.check_unlocked()?;
        self.listener = listener;
        Ok(())
    }

    /// D+1 for position, plus one per jointly estimated power/path-loss unknown
    pub fn min_readings(&self) -> usize {
        lateration::min_readings(D)
            + usize::from(self.transmitted_power_estimation_enabled)
            + usize::from(self.path_loss_estimation_enabled)
    }

    pub fn is_ready(&self) -> bool {
        self.settings.has_min_readings(self.min_readings())
    }

    pub fn is_locked(&self) -> bool {
        self.settings.locked
    }

    /// Estimated transmitted power in dBm
    pub fn estimated_transmitted_power_dbm(&self) -> Option<f64> {
        self.result.as_ref().and_then(|r| r.transmitted_power_dbm)
    }

    /// Estimated transmitted power in milliwatts
    pub fn estimated_transmitted_power(&self) -> Option<f64> {
        self.estimated_transmitted_power_dbm().map(pathloss::dbm_to_power)
    }

    /// Variance of the estimated transmitted power (dBm²)
    pub fn estimated_transmitted_power_variance(&self) -> Option<f64> {
        self.result.as_ref().and_then(|r| r.transmitted_power_variance)
    }

    pub fn estimated_path_loss_exponent(&self) -> Option<f64> {
        self.result.as_ref().and_then(|r| r.path_loss_exponent)
    }

    pub fn estimated_path_loss_exponent_variance(&self) -> Option<f64> {
        self.result.as_ref().and_then(|r| r.path_loss_exponent_variance)
    }

    /// Estimate position and, when enabled, transmitted power and path-loss exponent
    ///
    /// Same lock and listener contract as
    /// [`RangingEstimator::estimate`](super::RangingEstimator::estimate).
    pub fn estimate(&mut self) -> Result<()> {
        run_estimate::<D, _>(self)
    }

    fn run(&self) -> Result<Estimate<D>> {
        let readings = self.settings.readings()?;
        debug!(
            readings = readings.len(),
            dimensions = D,
            non_linear = self.settings.non_linear_solver_enabled,
            estimate_power = self.transmitted_power_estimation_enabled,
            estimate_path_loss = self.path_loss_estimation_enabled,
            "Estimating radio source from ranges and RSSI"
        );

        let seed = self.settings.seed_position(&readings)?;
        let estimate = if self.settings.non_linear_solver_enabled {
            self.refine(&readings, &seed)?
        } else {
            self.linear_only(&readings, seed)?
        };

        debug!(
            position = ?estimate.position,
            transmitted_power_dbm = ?estimate.transmitted_power_dbm,
            path_loss_exponent = ?estimate.path_loss_exponent,
            "Radio source located"
        );
        Ok(estimate)
    }

    /// Linear stage only: closed-form power/path-loss at the linear position
    fn linear_only(
        &self,
        readings: &[RangingAndRssiReading<D>],
        position: [f64; D],
    ) -> Result<Estimate<D>> {
        let fixed_power = if self.transmitted_power_estimation_enabled {
            None
        } else {
            self.initial_transmitted_power_dbm
        };
        let fixed_path_loss = if self.path_loss_estimation_enabled {
            None
        } else {
            Some(self.initial_path_loss_exponent)
        };
        let (power, path_loss) =
            lateration::fit_power_and_path_loss(&position, readings, fixed_power, fixed_path_loss)?;

        Ok(self.assemble(readings, position, None, power, None, path_loss, None))
    }

    /// Joint Levenberg-Marquardt refinement from the seed position
    fn refine(
        &self,
        readings: &[RangingAndRssiReading<D>],
        seed: &[f64; D],
    ) -> Result<Estimate<D>> {
        let power_seed = match self.initial_transmitted_power_dbm {
            Some(p) => p,
            None => {
                let (p, _) = lateration::fit_power_and_path_loss(
                    seed,
                    readings,
                    None,
                    Some(self.initial_path_loss_exponent),
                )?;
                p
            }
        };

        let model = PowerModel {
            transmitted_power_dbm: power_seed,
            path_loss_exponent: self.initial_path_loss_exponent,
            estimate_transmitted_power: self.transmitted_power_estimation_enabled,
            estimate_path_loss: self.path_loss_estimation_enabled,
        };
        let weighting = Weighting {
            fallback_distance_std: self.settings.fallback_distance_std,
            fallback_rssi_std: self.fallback_rssi_std,
            use_position_covariances: self.settings.use_reading_position_covariances,
        };
        let residuals = RangingAndRssiResiduals::new(readings, seed, model, &weighting);
        let fit = self
            .settings
            .solver
            .fit(&residuals, residuals.initial_parameters(seed))?;
        let (position, power, path_loss) = residuals.unpack(&fit.parameters);

        let variance = |index: Option<usize>| -> Option<f64> {
            let cov = fit.covariance.as_ref()?;
            index.map(|i| cov[(i, i)])
        };
        let power_variance = variance(model.power_index::<D>());
        let path_loss_variance = variance(model.path_loss_index::<D>());

        Ok(self.assemble(
            readings,
            position,
            fit.covariance,
            power,
            power_variance,
            path_loss,
            path_loss_variance,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        readings: &[RangingAndRssiReading<D>],
        position: [f64; D],
        covariance: Option<nalgebra::DMatrix<f64>>,
        power_dbm: f64,
        power_variance: Option<f64>,
        path_loss: f64,
        path_loss_variance: Option<f64>,
    ) -> Estimate<D> {
        let position_covariance = covariance.as_ref().map(position_block::<D>);

        let mut radio_source = LocatedRadioSource::new(readings[0].source().clone(), position);
        radio_source.position_covariance = position_covariance.clone();
        radio_source.transmitted_power_dbm = Some(power_dbm);
        radio_source.transmitted_power_std_dbm = power_variance.map(|v| v.sqrt());
        radio_source.path_loss_exponent = Some(path_loss);
        radio_source.path_loss_exponent_std = path_loss_variance.map(|v| v.sqrt());

        Estimate {
            position,
            covariance,
            position_covariance,
            transmitted_power_dbm: Some(power_dbm),
            transmitted_power_variance: power_variance,
            path_loss_exponent: Some(path_loss),
            path_loss_exponent_variance: path_loss_variance,
            radio_source,
        }
    }
}

impl<const D: usize> Lifecycle<D> for RangingAndRssiEstimator<D> {
    type Reading = RangingAndRssiReading<D>;

    const NAME: &'static str = "ranging and rssi";

    fn settings(&self) -> &Settings<D, RangingAndRssiReading<D>> {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut Settings<D, RangingAndRssiReading<D>> {
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

impl<const D: usize> RadioSourceEstimator<D> for RangingAndRssiEstimator<D> {
    fn min_readings(&self) -> usize {
        RangingAndRssiEstimator::min_readings(self)
    }

    fn is_ready(&self) -> bool {
        RangingAndRssiEstimator::is_ready(self)
    }

    fn is_locked(&self) -> bool {
        RangingAndRssiEstimator::is_locked(self)
    }

    fn estimate(&mut self) -> Result<()> {
        RangingAndRssiEstimator::estimate(self)
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::geometry;
    use crate::source::RadioSource;

    const FREQUENCY: f64 = 2.412e9;
    const TRUE_POSITION: [f64; 3] = [1.0, 2.0, 3.0];
    const TRUE_POWER_DBM: f64 = -3.5;
    const TRUE_PATH_LOSS: f64 = 2.4;

    fn ap() -> RadioSource {
        RadioSource::access_point("12:34:56:78:9a:bc", FREQUENCY)
    }

    fn synthetic_readings(receivers: &[[f64; 3]]) -> Vec<RangingAndRssiReading<3>> {
        receivers
            .iter()
            .map(|x| {
                let d = geometry::distance(&TRUE_POSITION, x);
                let rssi =
                    pathloss::received_power_dbm(TRUE_POWER_DBM, TRUE_PATH_LOSS, FREQUENCY, d);
                RangingAndRssiReading::new(ap(), *x, d, rssi).unwrap()
            })
            .collect()
    }

    fn receivers(n: usize, seed: u64) -> Vec<[f64; 3]> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                [
                    rng.gen_range(-30.0..30.0),
                    rng.gen_range(-30.0..30.0),
                    rng.gen_range(-30.0..30.0),
                ]
            })
            .collect()
    }

    /// Estimator over `n` random receivers observing the synthetic source
    fn estimator_for(n: usize, seed: u64) -> RangingAndRssiEstimator<3> {
        RangingAndRssiEstimator::with_readings(synthetic_readings(&receivers(n, seed))).unwrap()
    }

    fn position_error(estimator: &RangingAndRssiEstimator<3>) -> f64 {
        geometry::distance(estimator.estimated_position().unwrap(), &TRUE_POSITION)
    }

    #[test]
    fn test_defaults() {
        let estimator = RangingAndRssiEstimator::<3>::new();
        assert!(estimator.is_transmitted_power_estimation_enabled());
        assert!(!estimator.is_path_loss_estimation_enabled());
        assert_eq!(estimator.initial_path_loss_exponent(), 2.0);
        assert!(estimator.initial_transmitted_power_dbm().is_none());
        assert!(estimator.estimated_transmitted_power_dbm().is_none());
        assert!(estimator.estimated_path_loss_exponent().is_none());
        assert!(!estimator.is_ready());
    }

    #[test]
    fn test_min_readings_track_unknowns() {
        let mut estimator = RangingAndRssiEstimator::<3>::new();
        estimator.set_transmitted_power_estimation_enabled(false).unwrap();
        assert_eq!(estimator.min_readings(), 4);
        estimator.set_transmitted_power_estimation_enabled(true).unwrap();
        assert_eq!(estimator.min_readings(), 5);
        estimator.set_path_loss_estimation_enabled(true).unwrap();
        assert_eq!(estimator.min_readings(), 6);

        let mut planar = RangingAndRssiEstimator::<2>::new();
        planar.set_path_loss_estimation_enabled(true).unwrap();
        assert_eq!(planar.min_readings(), 5);
    }

    #[test]
    fn test_readiness_depends_on_enabled_unknowns() {
        let mut estimator = estimator_for(5, 1);
        assert!(estimator.is_ready());
        estimator.set_path_loss_estimation_enabled(true).unwrap();
        assert!(!estimator.is_ready());
        assert_eq!(estimator.estimate(), Err(Error::NotReady));
    }

    #[test]
    fn test_transmitted_power_units_consistent() {
        let mut estimator = RangingAndRssiEstimator::<3>::new();
        estimator.set_initial_transmitted_power(Some(10.0)).unwrap();
        assert!((estimator.initial_transmitted_power_dbm().unwrap() - 10.0).abs() < 1e-12);

        estimator.set_initial_transmitted_power_dbm(Some(-20.0)).unwrap();
        assert!((estimator.initial_transmitted_power().unwrap() - 0.01).abs() < 1e-15);

        assert!(matches!(
            estimator.set_initial_transmitted_power(Some(-1.0)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(estimator.set_initial_transmitted_power_dbm(Some(f64::NAN)).is_err());
        assert!(estimator.set_initial_path_loss_exponent(f64::INFINITY).is_err());
        assert!(estimator.set_fallback_rssi_standard_deviation(-0.5).is_err());

        estimator.set_initial_transmitted_power(None).unwrap();
        assert!(estimator.initial_transmitted_power().is_none());
    }

    #[test]
    fn test_joint_power_and_path_loss_recovery() {
        let mut estimator = estimator_for(10, 3);
        estimator.set_path_loss_estimation_enabled(true).unwrap();
        estimator.estimate().unwrap();

        assert!(position_error(&estimator) < 1e-6, "{:?}", estimator.estimated_position());
        let power = estimator.estimated_transmitted_power_dbm().unwrap();
        let path_loss = estimator.estimated_path_loss_exponent().unwrap();
        assert!((power - TRUE_POWER_DBM).abs() < 1.0);
        assert!((path_loss - TRUE_PATH_LOSS).abs() < 1.0);

        assert_eq!(estimator.estimated_covariance().unwrap().shape(), (5, 5));
        assert_eq!(estimator.estimated_position_covariance().unwrap().shape(), (3, 3));
        assert!(estimator.estimated_transmitted_power_variance().unwrap() >= 0.0);
        assert!(estimator.estimated_path_loss_exponent_variance().unwrap() >= 0.0);

        let located = estimator.estimated_radio_source().unwrap();
        assert_eq!(located.source, ap());
        assert!(located.transmitted_power_std_dbm.is_some());
        assert!(located.path_loss_exponent_std.is_some());
        let true_power = pathloss::dbm_to_power(TRUE_POWER_DBM);
        assert!((located.transmitted_power().unwrap() - true_power).abs() < 0.5);
    }

    #[test]
    fn test_refinement_from_rough_initial_values() {
        let mut estimator = estimator_for(12, 5);
        estimator.set_path_loss_estimation_enabled(true).unwrap();
        estimator.set_initial_position(Some([2.0, 3.0, 2.0])).unwrap();
        estimator.set_initial_transmitted_power_dbm(Some(0.0)).unwrap();
        estimator.set_initial_path_loss_exponent(2.0).unwrap();
        estimator.estimate().unwrap();

        assert!(position_error(&estimator) < 1e-6);
        let power = estimator.estimated_transmitted_power_dbm().unwrap();
        let path_loss = estimator.estimated_path_loss_exponent().unwrap();
        assert!((power - TRUE_POWER_DBM).abs() < 1e-3);
        assert!((path_loss - TRUE_PATH_LOSS).abs() < 1e-3);
    }

    #[test]
    fn test_fixed_path_loss_reports_no_variance() {
        let mut estimator = estimator_for(8, 9);
        estimator.set_initial_path_loss_exponent(TRUE_PATH_LOSS).unwrap();
        estimator.estimate().unwrap();

        assert_eq!(estimator.estimated_covariance().unwrap().shape(), (4, 4));
        assert_eq!(estimator.estimated_path_loss_exponent(), Some(TRUE_PATH_LOSS));
        assert!(estimator.estimated_path_loss_exponent_variance().is_none());
        assert!(estimator.estimated_transmitted_power_variance().is_some());
        let power = estimator.estimated_transmitted_power_dbm().unwrap();
        assert!((power - TRUE_POWER_DBM).abs() < 1e-6);
    }

    #[test]
    fn test_fixed_power_position_only() {
        let mut estimator = estimator_for(4, 13);
        estimator.set_transmitted_power_estimation_enabled(false).unwrap();
        estimator.set_initial_transmitted_power_dbm(Some(TRUE_POWER_DBM)).unwrap();
        estimator.set_initial_path_loss_exponent(TRUE_PATH_LOSS).unwrap();
        assert!(estimator.is_ready());
        estimator.estimate().unwrap();

        assert!(position_error(&estimator) < 1e-6);
        assert_eq!(estimator.estimated_covariance().unwrap().shape(), (3, 3));
        assert_eq!(estimator.estimated_transmitted_power_dbm(), Some(TRUE_POWER_DBM));
        assert!(estimator.estimated_transmitted_power_variance().is_none());
    }

    #[test]
    fn test_linear_only_estimate() {
        let mut estimator = estimator_for(8, 17);
        estimator.set_non_linear_solver_enabled(false).unwrap();
        estimator.set_path_loss_estimation_enabled(true).unwrap();
        estimator.estimate().unwrap();

        assert!(position_error(&estimator) < 1e-6);
        let power = estimator.estimated_transmitted_power_dbm().unwrap();
        let path_loss = estimator.estimated_path_loss_exponent().unwrap();
        assert!((power - TRUE_POWER_DBM).abs() < 1e-6);
        assert!((path_loss - TRUE_PATH_LOSS).abs() < 1e-6);
        assert!(estimator.estimated_covariance().is_none());
        assert!(estimator.estimated_position_covariance().is_none());
        assert!(estimator.estimated_transmitted_power_variance().is_none());
    }

    #[test]
    fn test_homogeneous_linear_seed() {
        let mut estimator = estimator_for(6, 21);
        estimator.set_initial_path_loss_exponent(TRUE_PATH_LOSS).unwrap();

        // Linear stage alone, both formulations
        estimator.set_non_linear_solver_enabled(false).unwrap();
        estimator.set_homogeneous_linear_solver_used(true).unwrap();
        estimator.estimate().unwrap();
        let homogeneous = *estimator.estimated_position().unwrap();
        estimator.set_homogeneous_linear_solver_used(false).unwrap();
        estimator.estimate().unwrap();
        let inhomogeneous = *estimator.estimated_position().unwrap();
        assert!(geometry::distance(&homogeneous, &inhomogeneous) < 1e-6);
        assert!(geometry::distance(&homogeneous, &TRUE_POSITION) < 1e-6);

        // Refined from the homogeneous seed
        estimator.set_non_linear_solver_enabled(true).unwrap();
        estimator.set_homogeneous_linear_solver_used(true).unwrap();
        estimator.estimate().unwrap();
        assert!(position_error(&estimator) < 1e-6);
        let power = estimator.estimated_transmitted_power_dbm().unwrap();
        assert!((power - TRUE_POWER_DBM).abs() < 1e-6);
    }

    #[test]
    fn test_mismatched_path_loss_biases_position() {
        // Data generated with n = 2.4, model held at the default 2.0
        let mut estimator = estimator_for(6, 21);
        estimator.estimate().unwrap();
        assert!(position_error(&estimator) > 1e-3);

        estimator.set_path_loss_estimation_enabled(true).unwrap();
        estimator.estimate().unwrap();
        assert!(position_error(&estimator) < 1e-6);
    }

    /// Tries every mutator from inside the callbacks
    struct LockChecker {
        starts: Rc<Cell<usize>>,
        ends: Rc<Cell<usize>>,
        rejected: Rc<Cell<usize>>,
        result_at_end: Rc<Cell<bool>>,
    }

    impl LockChecker {
        fn new() -> Self {
            LockChecker {
                starts: Rc::new(Cell::new(0)),
                ends: Rc::new(Cell::new(0)),
                rejected: Rc::new(Cell::new(0)),
                result_at_end: Rc::new(Cell::new(false)),
            }
        }

        fn shared(&self) -> Self {
            LockChecker {
                starts: self.starts.clone(),
                ends: self.ends.clone(),
                rejected: self.rejected.clone(),
                result_at_end: self.result_at_end.clone(),
            }
        }

        fn try_mutators(&self, estimator: &mut RangingAndRssiEstimator<3>) {
            assert!(estimator.is_locked());
            let attempts = [
                estimator.set_readings(synthetic_readings(&receivers(6, 99))),
                estimator.set_initial_position(Some([0.0, 0.0, 0.0])),
                estimator.set_non_linear_solver_enabled(false),
                estimator.set_homogeneous_linear_solver_used(true),
                estimator.set_use_reading_position_covariances(false),
                estimator.set_initial_transmitted_power_dbm(Some(1.0)),
                estimator.set_initial_transmitted_power(Some(1.0)),
                estimator.set_transmitted_power_estimation_enabled(false),
                estimator.set_initial_path_loss_exponent(3.0),
                estimator.set_path_loss_estimation_enabled(true),
                estimator.set_fallback_distance_standard_deviation(2.0),
                estimator.set_fallback_rssi_standard_deviation(2.0),
                estimator.set_max_iterations(10),
                estimator.set_convergence_tolerance(1e-3),
                estimator.set_listener(None),
                estimator.set_quality_scores(Some(vec![1.0])),
                estimator.estimate(),
            ];
            for attempt in attempts {
                assert_eq!(attempt, Err(Error::Locked));
                self.rejected.set(self.rejected.get() + 1);
            }
        }
    }

    impl EstimatorListener<RangingAndRssiEstimator<3>> for LockChecker {
        fn on_estimate_start(&mut self, estimator: &mut RangingAndRssiEstimator<3>) {
            self.starts.set(self.starts.get() + 1);
            self.try_mutators(estimator);
        }

        fn on_estimate_end(&mut self, estimator: &mut RangingAndRssiEstimator<3>) {
            self.ends.set(self.ends.get() + 1);
            self.result_at_end
                .set(estimator.estimated_transmitted_power_dbm().is_some());
            self.try_mutators(estimator);
        }
    }

    #[test]
    fn test_lock_discipline_during_callbacks() {
        let checker = LockChecker::new();
        let mut estimator = estimator_for(6, 25);
        estimator.set_listener(Some(Box::new(checker.shared()))).unwrap();

        estimator.estimate().unwrap();
        assert_eq!(checker.starts.get(), 1);
        assert_eq!(checker.ends.get(), 1);
        assert_eq!(checker.rejected.get(), 34);
        assert!(checker.result_at_end.get());
        assert!(!estimator.is_locked());

        // Configuration untouched by the rejected calls
        assert!(estimator.is_non_linear_solver_enabled());
        assert!(!estimator.is_homogeneous_linear_solver_used());
        assert!(estimator.uses_reading_position_covariances());
        assert!(estimator.is_transmitted_power_estimation_enabled());
        assert!(!estimator.is_path_loss_estimation_enabled());
        assert!(estimator.initial_transmitted_power_dbm().is_none());
        assert!(estimator.initial_position().is_none());
        assert_eq!(estimator.max_iterations(), 100);
        assert!(estimator.quality_scores().is_none());
        estimator.set_path_loss_estimation_enabled(true).unwrap();
    }

    #[test]
    fn test_end_callback_fires_on_failure() {
        let checker = LockChecker::new();

        // Collinear receivers make the linear stage fail
        let line: Vec<[f64; 3]> = (0..5).map(|i| [5.0 * i as f64, 0.0, 0.0]).collect();
        let mut estimator =
            RangingAndRssiEstimator::with_readings(synthetic_readings(&line)).unwrap();
        estimator.set_listener(Some(Box::new(checker.shared()))).unwrap();

        assert!(matches!(estimator.estimate(), Err(Error::EstimationFailed(_))));
        assert_eq!(checker.starts.get(), 1);
        assert_eq!(checker.ends.get(), 1);
        assert_eq!(checker.rejected.get(), 34);
        assert!(!checker.result_at_end.get());
        assert!(!estimator.is_locked());
        assert!(estimator.estimated_position().is_none());
    }

    #[test]
    fn test_zero_frequency_source_rejected() {
        let source = RadioSource::beacon("beacon-0", 0.0);
        let reading = RangingAndRssiReading::new(source, [0.0, 0.0, 0.0], 1.0, -40.0).unwrap();
        let mut estimator = RangingAndRssiEstimator::<3>::new();
        assert!(matches!(
            estimator.set_readings(vec![reading]),
            Err(Error::InvalidArgument(msg)) if msg.contains("frequency")
        ));
        assert!(estimator.readings().is_none());
    }
}
