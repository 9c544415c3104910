// JSON reading files and located-source reports for the command line tool
//
// Positions travel as plain arrays; their length must match the dimension the
// tool was asked to solve in.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::estimator::Estimate;
use crate::reading::{RangingAndRssiReading, RangingReading};
use crate::source::{RadioSource, RadioSourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    AccessPoint,
    Beacon,
}

impl From<SourceKind> for RadioSourceKind {
    fn from(kind: SourceKind) -> Self {
        match kind {
            SourceKind::AccessPoint => RadioSourceKind::AccessPoint,
            SourceKind::Beacon => RadioSourceKind::Beacon,
        }
    }
}

impl From<RadioSourceKind> for SourceKind {
    fn from(kind: RadioSourceKind) -> Self {
        match kind {
            RadioSourceKind::AccessPoint => SourceKind::AccessPoint,
            RadioSourceKind::Beacon => SourceKind::Beacon,
        }
    }
}

/// Radio source as written in a reading file
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRecord {
    pub kind: SourceKind,
    pub identifier: String,
    /// Carrier frequency in Hz
    pub frequency: f64,
}

impl SourceRecord {
    pub fn to_source(&self) -> RadioSource {
        RadioSource {
            kind: self.kind.into(),
            identifier: self.identifier.clone(),
            frequency: self.frequency,
        }
    }
}

/// One reading: {"position": [x, y, z], "distance": 4.2, "rssi": -61.0}
#[derive(Debug, Clone, Deserialize)]
pub struct ReadingRecord {
    pub position: Vec<f64>,
    pub distance: f64,
    #[serde(default)]
    pub rssi: Option<f64>,
    #[serde(default)]
    pub distance_std: Option<f64>,
    #[serde(default)]
    pub rssi_std: Option<f64>,
    /// Row-major D×D receiver position covariance
    #[serde(default)]
    pub position_covariance: Option<Vec<Vec<f64>>>,
}

/// Readings of a single radio source
#[derive(Debug, Clone, Deserialize)]
pub struct ReadingFile {
    pub source: SourceRecord,
    pub readings: Vec<ReadingRecord>,
}

impl ReadingFile {
    pub fn from_json(text: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn ranging_readings<const D: usize>(&self) -> Result<Vec<RangingReading<D>>> {
        let source = self.source.to_source();
        self.readings
            .iter()
            .enumerate()
            .map(|(i, record)| {
                let position = position_of(i, &record.position)?;
                let mut reading = RangingReading::new(source.clone(), position, record.distance)?;
                if let Some(std) = record.distance_std {
                    reading = reading.with_distance_standard_deviation(std)?;
                }
                if let Some(rows) = &record.position_covariance {
                    reading = reading.with_position_covariance(covariance_of::<D>(i, rows)?)?;
                }
                Ok(reading)
            })
            .collect()
    }

    /// Every record must carry an `rssi` value
    pub fn ranging_and_rssi_readings<const D: usize>(
        &self,
    ) -> Result<Vec<RangingAndRssiReading<D>>> {
        let source = self.source.to_source();
        self.readings
            .iter()
            .enumerate()
            .map(|(i, record)| {
                let rssi = record
                    .rssi
                    .ok_or_else(|| Error::invalid(format!("reading {}: missing rssi", i)))?;
                let position = position_of(i, &record.position)?;
                let mut reading =
                    RangingAndRssiReading::new(source.clone(), position, record.distance, rssi)?;
                if let Some(std) = record.distance_std {
                    reading = reading.with_distance_standard_deviation(std)?;
                }
                if let Some(std) = record.rssi_std {
                    reading = reading.with_rssi_standard_deviation(std)?;
                }
                if let Some(rows) = &record.position_covariance {
                    reading = reading.with_position_covariance(covariance_of::<D>(i, rows)?)?;
                }
                Ok(reading)
            })
            .collect()
    }
}

fn position_of<const D: usize>(index: usize, values: &[f64]) -> Result<[f64; D]> {
    <[f64; D]>::try_from(values).map_err(|_| {
        Error::invalid(format!(
            "reading {}: position has {} coordinates, expected {}",
            index,
            values.len(),
            D
        ))
    })
}

fn covariance_of<const D: usize>(index: usize, rows: &[Vec<f64>]) -> Result<DMatrix<f64>> {
    if rows.len() != D || rows.iter().any(|row| row.len() != D) {
        return Err(Error::invalid(format!(
            "reading {}: position covariance must be {}x{}",
            index, D, D
        )));
    }
    Ok(DMatrix::from_fn(D, D, |i, j| rows[i][j]))
}

fn matrix_rows(m: &DMatrix<f64>) -> Vec<Vec<f64>> {
    m.row_iter().map(|row| row.iter().copied().collect()).collect()
}

/// Located radio source as printed by the command line tool
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub kind: SourceKind,
    pub identifier: String,
    pub frequency: f64,
    pub position: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_covariance: Option<Vec<Vec<f64>>>,
    /// RMS position error in meters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_error: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transmitted_power_dbm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transmitted_power_std_dbm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_loss_exponent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_loss_exponent_std: Option<f64>,
    /// Covariance of every estimated parameter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub covariance: Option<Vec<Vec<f64>>>,
}

impl SourceReport {
    pub fn from_estimate<const D: usize>(estimate: &Estimate<D>) -> Self {
        let located = &estimate.radio_source;
        SourceReport {
            kind: located.source.kind.into(),
            identifier: located.source.identifier.clone(),
            frequency: located.source.frequency,
            position: estimate.position.to_vec(),
            position_covariance: located.position_covariance.as_ref().map(matrix_rows),
            position_error: located.position_error(),
            transmitted_power_dbm: located.transmitted_power_dbm,
            transmitted_power_std_dbm: located.transmitted_power_std_dbm,
            path_loss_exponent: located.path_loss_exponent,
            path_loss_exponent_std: located.path_loss_exponent_std,
            covariance: estimate.covariance.as_ref().map(matrix_rows),
        }
    }
}
