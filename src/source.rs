// Radio source identity and located results

use nalgebra::DMatrix;

/// Kind of radio source being located
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioSourceKind {
    /// WiFi access point, identified by BSSID
    AccessPoint,
    /// Bluetooth beacon, identified by its beacon identifiers
    Beacon,
}

/// Identity of a radio source: kind, identifier and carrier frequency
#[derive(Debug, Clone, PartialEq)]
pub struct RadioSource {
    pub kind: RadioSourceKind,
    /// BSSID for access points, joined beacon identifiers for beacons
    pub identifier: String,
    /// Carrier frequency in Hz
    pub frequency: f64,
}

impl RadioSource {
    pub fn access_point(bssid: impl Into<String>, frequency: f64) -> Self {
        RadioSource {
            kind: RadioSourceKind::AccessPoint,
            identifier: bssid.into(),
            frequency,
        }
    }

    pub fn beacon(identifier: impl Into<String>, frequency: f64) -> Self {
        RadioSource {
            kind: RadioSourceKind::Beacon,
            identifier: identifier.into(),
            frequency,
        }
    }
}

/// A radio source with an estimated position and, when available,
/// transmitted power and path-loss exponent.
#[derive(Debug, Clone)]
pub struct LocatedRadioSource<const D: usize> {
    pub source: RadioSource,
    pub position: [f64; D],
    /// D×D position covariance, absent when the nonlinear stage did not run
    pub position_covariance: Option<DMatrix<f64>>,
    pub transmitted_power_dbm: Option<f64>,
    pub transmitted_power_std_dbm: Option<f64>,
    pub path_loss_exponent: Option<f64>,
    pub path_loss_exponent_std: Option<f64>,
}

impl<const D: usize> LocatedRadioSource<D> {
    pub fn new(source: RadioSource, position: [f64; D]) -> Self {
        LocatedRadioSource {
            source,
            position,
            position_covariance: None,
            transmitted_power_dbm: None,
            transmitted_power_std_dbm: None,
            path_loss_exponent: None,
            path_loss_exponent_std: None,
        }
    }

    /// Transmitted power in milliwatts
    pub fn transmitted_power(&self) -> Option<f64> {
        self.transmitted_power_dbm.map(crate::pathloss::dbm_to_power)
    }

    /// RMS position error in meters (square root of the covariance trace)
    pub fn position_error(&self) -> Option<f64> {
        self.position_covariance
            .as_ref()
            .map(|cov| cov.trace().max(0.0).sqrt())
    }
}
