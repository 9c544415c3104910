// Readings - observations of a radio source taken at known receiver positions
//
// Readings are immutable once built. Constructors and `with_*` builders
// validate their inputs and fail with `Error::InvalidArgument`.

use nalgebra::DMatrix;

use crate::error::{Error, Result};
use crate::source::RadioSource;

/// Tolerance for the symmetry and positive-semidefinite checks on covariances
const COVARIANCE_TOLERANCE: f64 = 1e-9;

/// Common view over readings carrying a range measurement
///
/// The linear solver and residual models only see readings through this
/// trait, so both estimator variants share them.
pub trait Reading<const D: usize> {
    fn source(&self) -> &RadioSource;

    /// Receiver position in meters
    fn position(&self) -> &[f64; D];

    /// Measured distance to the source in meters
    fn distance(&self) -> f64;

    fn distance_standard_deviation(&self) -> Option<f64>;

    /// D×D covariance of the receiver position
    fn position_covariance(&self) -> Option<&DMatrix<f64>>;
}

/// Range-only reading
#[derive(Debug, Clone)]
pub struct RangingReading<const D: usize> {
    source: RadioSource,
    position: [f64; D],
    distance: f64,
    distance_std: Option<f64>,
    position_covariance: Option<DMatrix<f64>>,
}

impl<const D: usize> RangingReading<D> {
    pub fn new(source: RadioSource, position: [f64; D], distance: f64) -> Result<Self> {
        check_position(&position)?;
        check_distance(distance)?;
        Ok(RangingReading {
            source,
            position,
            distance,
            distance_std: None,
            position_covariance: None,
        })
    }

    pub fn with_distance_standard_deviation(mut self, std: f64) -> Result<Self> {
        self.distance_std = Some(check_standard_deviation("distance", std)?);
        Ok(self)
    }

    pub fn with_position_covariance(mut self, covariance: DMatrix<f64>) -> Result<Self> {
        check_covariance::<D>(&covariance)?;
        self.position_covariance = Some(covariance);
        Ok(self)
    }
}

impl<const D: usize> Reading<D> for RangingReading<D> {
    fn source(&self) -> &RadioSource {
        &self.source
    }

    fn position(&self) -> &[f64; D] {
        &self.position
    }

    fn distance(&self) -> f64 {
        self.distance
    }

    fn distance_standard_deviation(&self) -> Option<f64> {
        self.distance_std
    }

    fn position_covariance(&self) -> Option<&DMatrix<f64>> {
        self.position_covariance.as_ref()
    }
}

/// Reading carrying both a range and a received signal strength
#[derive(Debug, Clone)]
pub struct RangingAndRssiReading<const D: usize> {
    source: RadioSource,
    position: [f64; D],
    distance: f64,
    rssi: f64,
    distance_std: Option<f64>,
    rssi_std: Option<f64>,
    position_covariance: Option<DMatrix<f64>>,
}

impl<const D: usize> RangingAndRssiReading<D> {
    /// # Arguments
    /// * `source` - Radio source the reading belongs to
    /// * `position` - Receiver position in meters
    /// * `distance` - Measured distance in meters
    /// * `rssi` - Received power in dBm
    pub fn new(source: RadioSource, position: [f64; D], distance: f64, rssi: f64) -> Result<Self> {
        check_position(&position)?;
        check_distance(distance)?;
        if !rssi.is_finite() {
            return Err(Error::invalid(format!("received power must be finite, got {}", rssi)));
        }
        Ok(RangingAndRssiReading {
            source,
            position,
            distance,
            rssi,
            distance_std: None,
            rssi_std: None,
            position_covariance: None,
        })
    }

    pub fn with_distance_standard_deviation(mut self, std: f64) -> Result<Self> {
        self.distance_std = Some(check_standard_deviation("distance", std)?);
        Ok(self)
    }

    pub fn with_rssi_standard_deviation(mut self, std: f64) -> Result<Self> {
        self.rssi_std = Some(check_standard_deviation("rssi", std)?);
        Ok(self)
    }

    pub fn with_position_covariance(mut self, covariance: DMatrix<f64>) -> Result<Self> {
        check_covariance::<D>(&covariance)?;
        self.position_covariance = Some(covariance);
        Ok(self)
    }

    /// Received power in dBm
    pub fn rssi(&self) -> f64 {
        self.rssi
    }

    pub fn rssi_standard_deviation(&self) -> Option<f64> {
        self.rssi_std
    }
}

impl<const D: usize> Reading<D> for RangingAndRssiReading<D> {
    fn source(&self) -> &RadioSource {
        &self.source
    }

    fn position(&self) -> &[f64; D] {
        &self.position
    }

    fn distance(&self) -> f64 {
        self.distance
    }

    fn distance_standard_deviation(&self) -> Option<f64> {
        self.distance_std
    }

    fn position_covariance(&self) -> Option<&DMatrix<f64>> {
        self.position_covariance.as_ref()
    }
}

fn check_position<const D: usize>(position: &[f64; D]) -> Result<()> {
    if position.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(Error::invalid("receiver position must be finite"))
    }
}

fn check_distance(distance: f64) -> Result<()> {
    if distance.is_finite() && distance >= 0.0 {
        Ok(())
    } else {
        Err(Error::invalid(format!("distance must be >= 0, got {}", distance)))
    }
}

fn check_standard_deviation(name: &str, std: f64) -> Result<f64> {
    if std.is_finite() && std > 0.0 {
        Ok(std)
    } else {
        Err(Error::invalid(format!("{} standard deviation must be > 0, got {}", name, std)))
    }
}

/// Checks that a covariance is D×D, finite, symmetric and positive semidefinite
fn check_covariance<const D: usize>(covariance: &DMatrix<f64>) -> Result<()> {
    if covariance.nrows() != D || covariance.ncols() != D {
        return Err(Error::invalid(format!(
            "position covariance must be {}x{}, got {}x{}",
            D,
            D,
            covariance.nrows(),
            covariance.ncols()
        )));
    }
    if covariance.iter().any(|v| !v.is_finite()) {
        return Err(Error::invalid("position covariance must be finite"));
    }
    let scale = covariance.amax().max(1.0);
    if (covariance - covariance.transpose()).amax() > COVARIANCE_TOLERANCE * scale {
        return Err(Error::invalid("position covariance must be symmetric"));
    }
    if covariance.symmetric_eigenvalues().min() < -COVARIANCE_TOLERANCE * scale {
        return Err(Error::invalid("position covariance must be positive semidefinite"));
    }
    Ok(())
}
