pub mod constants;
pub mod error;
pub mod geometry;
pub mod pathloss;
pub mod source;
pub mod reading;
pub mod lateration;
pub mod solver;
pub mod residuals;
pub mod estimator;
pub mod report;
pub mod config;

pub use error::{Error, NumericalError, Result};
pub use estimator::{
    Estimate, EstimatorListener, RadioSourceEstimator, RangingAndRssiEstimator, RangingEstimator,
};
pub use reading::{RangingAndRssiReading, RangingReading, Reading};
pub use source::{LocatedRadioSource, RadioSource, RadioSourceKind};
