// Residual models for range-only and range+RSSI refinement
//
// Parameter layout is the position first, then (when estimated) transmitted
// power in dBm, then (when estimated) the path-loss exponent.

use nalgebra as na;
use na::{DMatrix, DVector};

use crate::geometry;
use crate::pathloss;
use crate::reading::{RangingAndRssiReading, Reading};
use crate::solver::ResidualModel;

/// How residuals are weighted
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weighting {
    /// Distance std for readings that carry none (m)
    pub fallback_distance_std: f64,
    /// RSSI std for readings that carry none (dB)
    pub fallback_rssi_std: f64,
    /// Fold reading position covariances into residual variances
    pub use_position_covariances: bool,
}

/// Effective standard deviation of a residual
///
/// `gradient` is the derivative of the predicted measurement with respect to
/// the receiver position. Readings without a covariance keep their own std.
fn effective_std(
    std: f64,
    covariance: Option<&DMatrix<f64>>,
    gradient: Option<&[f64]>,
    use_position_covariances: bool,
) -> f64 {
    match (use_position_covariances, covariance, gradient) {
        (true, Some(cov), Some(g)) => (std * std + geometry::propagate_variance(g, cov)).sqrt(),
        _ => std,
    }
}

fn position_of<const D: usize>(params: &DVector<f64>) -> [f64; D] {
    let mut p = [0.0; D];
    for (i, v) in p.iter_mut().enumerate() {
        *v = params[i];
    }
    p
}

#[derive(Debug, Clone)]
struct RangeTerm<const D: usize> {
    position: [f64; D],
    distance: f64,
    sigma: f64,
}

impl<const D: usize> RangeTerm<D> {
    fn new<R: Reading<D>>(reading: &R, seed: &[f64; D], weighting: &Weighting) -> Self {
        let std = reading
            .distance_standard_deviation()
            .unwrap_or(weighting.fallback_distance_std);
        let gradient = geometry::distance_gradient(seed, reading.position());
        RangeTerm {
            position: *reading.position(),
            distance: reading.distance(),
            sigma: effective_std(
                std,
                reading.position_covariance(),
                gradient.as_ref().map(|g| g.as_slice()),
                weighting.use_position_covariances,
            ),
        }
    }

    fn residual(&self, p: &[f64; D]) -> f64 {
        (geometry::distance(&self.position, p) - self.distance) / self.sigma
    }

    /// Derivative of the residual with respect to the candidate position
    fn gradient(&self, p: &[f64; D]) -> [f64; D] {
        let mut g = geometry::distance_gradient(&self.position, p).unwrap_or([0.0; D]);
        g.iter_mut().for_each(|v| *v /= self.sigma);
        g
    }
}

/// Range-only residuals: `(|x_i - p| - d_i) / sigma_i`
#[derive(Debug, Clone)]
pub struct RangingResiduals<const D: usize> {
    terms: Vec<RangeTerm<D>>,
}

impl<const D: usize> RangingResiduals<D> {
    /// Build the model; position covariances are propagated at `seed`
    pub fn new<R: Reading<D>>(readings: &[R], seed: &[f64; D], weighting: &Weighting) -> Self {
        RangingResiduals {
            terms: readings
                .iter()
                .map(|r| RangeTerm::new(r, seed, weighting))
                .collect(),
        }
    }

    pub fn initial_parameters(seed: &[f64; D]) -> DVector<f64> {
        DVector::from_column_slice(seed)
    }

    pub fn position(params: &DVector<f64>) -> [f64; D] {
        position_of(params)
    }
}

impl<const D: usize> ResidualModel for RangingResiduals<D> {
    fn num_parameters(&self) -> usize {
        D
    }

    fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        let p = position_of::<D>(params);
        DVector::from_iterator(self.terms.len(), self.terms.iter().map(|t| t.residual(&p)))
    }

    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64> {
        let p = position_of::<D>(params);
        let mut jacobian = DMatrix::zeros(self.terms.len(), D);
        for (i, term) in self.terms.iter().enumerate() {
            for (j, g) in term.gradient(&p).iter().enumerate() {
                jacobian[(i, j)] = *g;
            }
        }
        jacobian
    }
}

/// Which of transmitted power and path-loss exponent are free parameters,
/// and their values when held fixed or used as a seed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerModel {
    pub transmitted_power_dbm: f64,
    pub path_loss_exponent: f64,
    pub estimate_transmitted_power: bool,
    pub estimate_path_loss: bool,
}

impl PowerModel {
    /// Index of the transmitted power in the parameter vector
    pub fn power_index<const D: usize>(&self) -> Option<usize> {
        self.estimate_transmitted_power.then_some(D)
    }

    /// Index of the path-loss exponent in the parameter vector
    pub fn path_loss_index<const D: usize>(&self) -> Option<usize> {
        self.estimate_path_loss
            .then_some(D + usize::from(self.estimate_transmitted_power))
    }

    pub fn num_parameters<const D: usize>(&self) -> usize {
        D + usize::from(self.estimate_transmitted_power) + usize::from(self.estimate_path_loss)
    }
}

#[derive(Debug, Clone)]
struct RssiTerm<const D: usize> {
    position: [f64; D],
    rssi: f64,
    frequency: f64,
    sigma: f64,
}

/// Range and RSSI residuals, two per reading
///
/// The RSSI residual is `(Pr(p, Pt, n) - rssi_i) / sigma_i` with `Pr` the
/// log-distance model in dBm.
#[derive(Debug, Clone)]
pub struct RangingAndRssiResiduals<const D: usize> {
    ranges: Vec<RangeTerm<D>>,
    rssis: Vec<RssiTerm<D>>,
    model: PowerModel,
}

impl<const D: usize> RangingAndRssiResiduals<D> {
    /// Build the model; position covariances are propagated at the seed
    /// position and seed path-loss exponent
    pub fn new(
        readings: &[RangingAndRssiReading<D>],
        seed: &[f64; D],
        model: PowerModel,
        weighting: &Weighting,
    ) -> Self {
        let ranges = readings
            .iter()
            .map(|r| RangeTerm::new(r, seed, weighting))
            .collect();
        let rssis = readings
            .iter()
            .map(|r| {
                let std = r
                    .rssi_standard_deviation()
                    .unwrap_or(weighting.fallback_rssi_std);
                let d = geometry::distance(seed, r.position());
                let slope =
                    pathloss::received_power_distance_derivative(model.path_loss_exponent, d);
                let gradient = geometry::distance_gradient(seed, r.position())
                    .map(|g| g.map(|v| v * slope));
                RssiTerm {
                    position: *r.position(),
                    rssi: r.rssi(),
                    frequency: r.source().frequency,
                    sigma: effective_std(
                        std,
                        r.position_covariance(),
                        gradient.as_ref().map(|g| g.as_slice()),
                        weighting.use_position_covariances,
                    ),
                }
            })
            .collect();
        RangingAndRssiResiduals { ranges, rssis, model }
    }

    pub fn initial_parameters(&self, seed: &[f64; D]) -> DVector<f64> {
        let mut params = DVector::zeros(self.model.num_parameters::<D>());
        for (i, v) in seed.iter().enumerate() {
            params[i] = *v;
        }
        if let Some(i) = self.model.power_index::<D>() {
            params[i] = self.model.transmitted_power_dbm;
        }
        if let Some(i) = self.model.path_loss_index::<D>() {
            params[i] = self.model.path_loss_exponent;
        }
        params
    }

    /// Split a parameter vector into (position, transmitted power dBm, path-loss exponent)
    pub fn unpack(&self, params: &DVector<f64>) -> ([f64; D], f64, f64) {
        let power = self
            .model
            .power_index::<D>()
            .map_or(self.model.transmitted_power_dbm, |i| params[i]);
        let path_loss = self
            .model
            .path_loss_index::<D>()
            .map_or(self.model.path_loss_exponent, |i| params[i]);
        (position_of(params), power, path_loss)
    }
}

impl<const D: usize> ResidualModel for RangingAndRssiResiduals<D> {
    fn num_parameters(&self) -> usize {
        self.model.num_parameters::<D>()
    }

    fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        let (p, power, path_loss) = self.unpack(params);
        let mut res = DVector::zeros(2 * self.ranges.len());
        for (i, (range, rssi)) in self.ranges.iter().zip(self.rssis.iter()).enumerate() {
            res[2 * i] = range.residual(&p);
            let d = geometry::distance(&rssi.position, &p);
            let predicted = pathloss::received_power_dbm(power, path_loss, rssi.frequency, d);
            res[2 * i + 1] = (predicted - rssi.rssi) / rssi.sigma;
        }
        res
    }

    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64> {
        let (p, _, path_loss) = self.unpack(params);
        let power_index = self.model.power_index::<D>();
        let path_loss_index = self.model.path_loss_index::<D>();

        let mut jacobian = DMatrix::zeros(2 * self.ranges.len(), self.num_parameters());
        for (i, (range, rssi)) in self.ranges.iter().zip(self.rssis.iter()).enumerate() {
            let row = 2 * i;
            for (j, g) in range.gradient(&p).iter().enumerate() {
                jacobian[(row, j)] = *g;
            }

            let row = 2 * i + 1;
            let d = geometry::distance(&rssi.position, &p);
            let slope = pathloss::received_power_distance_derivative(path_loss, d);
            if let Some(g) = geometry::distance_gradient(&rssi.position, &p) {
                for j in 0..D {
                    jacobian[(row, j)] = slope * g[j] / rssi.sigma;
                }
            }
            if let Some(k) = power_index {
                jacobian[(row, k)] = 1.0 / rssi.sigma;
            }
            if let Some(k) = path_loss_index {
                jacobian[(row, k)] = pathloss::attenuation_term(rssi.frequency, d) / rssi.sigma;
            }
        }
        jacobian
    }
}
