// Closed-form linear multilateration
//
// Each reading satisfies |p - x_i|^2 = d_i^2. Subtracting the equation of a
// reference reading (the first one) eliminates |p|^2 and leaves one linear
// equation per remaining reading:
//
//   2 (x_i - x_0) . p = |x_i|^2 - |x_0|^2 - d_i^2 + d_0^2
//
// Positions are shifted to their centroid first to keep the system well
// scaled. No uncertainty is propagated here.

use nalgebra as na;
use na::{DMatrix, DVector};
use tracing::trace;

use crate::constants::RANK_TOLERANCE;
use crate::error::NumericalError;
use crate::geometry;
use crate::pathloss;
use crate::reading::{RangingAndRssiReading, Reading};

/// Linear system formulation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Formulation {
    /// Solve in projective coordinates (p, w) as a null-space problem, then normalize
    Homogeneous,
    /// Solve directly for p in least squares
    Inhomogeneous,
}

impl Formulation {
    pub fn from_homogeneous_flag(homogeneous: bool) -> Self {
        if homogeneous {
            Formulation::Homogeneous
        } else {
            Formulation::Inhomogeneous
        }
    }
}

/// Minimum readings for a linear position solve in D dimensions
pub const fn min_readings(dimensions: usize) -> usize {
    dimensions + 1
}

/// Solve for the source position from range readings
///
/// # Arguments
/// * `readings` - At least D+1 readings with receiver positions and distances
/// * `formulation` - Homogeneous or inhomogeneous linear system
///
/// # Returns
/// * `Ok(position)` on success
/// * `Err(InsufficientReadings)` with fewer than D+1 readings
/// * `Err(RankDeficient)` for degenerate (e.g. collinear/coplanar) geometry
pub fn solve<const D: usize, R: Reading<D>>(
    readings: &[R],
    formulation: Formulation,
) -> Result<[f64; D], NumericalError> {
    let need = min_readings(D);
    if readings.len() < need {
        return Err(NumericalError::InsufficientReadings {
            need,
            have: readings.len(),
        });
    }

    let centroid = centroid(readings);
    let shifted: Vec<[f64; D]> = readings
        .iter()
        .map(|r| {
            let mut p = *r.position();
            for i in 0..D {
                p[i] -= centroid[i];
            }
            p
        })
        .collect();

    let (a, b) = build_system(&shifted, readings);

    let solution = match formulation {
        Formulation::Inhomogeneous => solve_inhomogeneous::<D>(a, b)?,
        Formulation::Homogeneous => solve_homogeneous::<D>(a, b)?,
    };

    let mut position = [0.0; D];
    for i in 0..D {
        position[i] = solution[i] + centroid[i];
    }
    if position.iter().any(|v| !v.is_finite()) {
        return Err(NumericalError::NonFinite);
    }

    trace!(?formulation, ?position, "Linear lateration solved");
    Ok(position)
}

fn centroid<const D: usize, R: Reading<D>>(readings: &[R]) -> [f64; D] {
    let mut c = [0.0; D];
    for r in readings {
        for (ci, xi) in c.iter_mut().zip(r.position().iter()) {
            *ci += xi;
        }
    }
    let n = readings.len() as f64;
    c.iter_mut().for_each(|ci| *ci /= n);
    c
}

/// Build `A p = b` with one row per non-reference reading
fn build_system<const D: usize, R: Reading<D>>(
    shifted: &[[f64; D]],
    readings: &[R],
) -> (DMatrix<f64>, DVector<f64>) {
    let rows = shifted.len() - 1;
    let x0 = &shifted[0];
    let d0 = readings[0].distance();
    let x0_sq = geometry::squared_norm(x0);

    let mut a = DMatrix::zeros(rows, D);
    let mut b = DVector::zeros(rows);
    for (row, (xi, reading)) in shifted.iter().zip(readings.iter()).skip(1).enumerate() {
        let di = reading.distance();
        for j in 0..D {
            a[(row, j)] = 2.0 * (xi[j] - x0[j]);
        }
        b[row] = geometry::squared_norm(xi) - x0_sq - di * di + d0 * d0;
    }
    (a, b)
}

fn solve_inhomogeneous<const D: usize>(
    a: DMatrix<f64>,
    b: DVector<f64>,
) -> Result<DVector<f64>, NumericalError> {
    let svd = a.svd(true, true);
    let eps = RANK_TOLERANCE * svd.singular_values.max();
    if svd.rank(eps) < D {
        return Err(NumericalError::RankDeficient);
    }
    svd.solve(&b, eps).map_err(|_| NumericalError::RankDeficient)
}

fn solve_homogeneous<const D: usize>(
    a: DMatrix<f64>,
    b: DVector<f64>,
) -> Result<DVector<f64>, NumericalError> {
    // Rows are zero padded up to D+1 so the SVD yields a full right basis
    let rows = a.nrows().max(D + 1);
    let mut m = DMatrix::zeros(rows, D + 1);
    for i in 0..a.nrows() {
        for j in 0..D {
            m[(i, j)] = a[(i, j)];
        }
        m[(i, D)] = -b[i];
    }

    let svd = m.svd(false, true);
    let v_t = svd.v_t.as_ref().ok_or(NumericalError::RankDeficient)?;
    let sv = &svd.singular_values;

    let mut order: Vec<usize> = (0..sv.len()).collect();
    order.sort_by(|&i, &j| sv[i].total_cmp(&sv[j]));
    let smallest = order[0];
    let second = order[1];

    // A second (near) null direction means the position is not determined
    let eps = RANK_TOLERANCE * sv.max();
    if sv[second] <= eps {
        return Err(NumericalError::RankDeficient);
    }

    let v = v_t.row(smallest);
    let w = v[D];
    if w.abs() <= RANK_TOLERANCE * v.norm() {
        return Err(NumericalError::RankDeficient);
    }
    Ok(DVector::from_iterator(D, (0..D).map(|j| v[j] / w)))
}

/// Closed-form transmitted power and path-loss exponent for a known position
///
/// Given a position, received power is linear in the unknowns:
/// `Pr_i = Pt + n * 10 * log10(c / (4*pi*f*d_i))`. Parameters passed as
/// `Some` are held fixed; the ones passed as `None` are fitted in least
/// squares.
///
/// # Returns
/// `(transmitted_power_dbm, path_loss_exponent)`
pub fn fit_power_and_path_loss<const D: usize>(
    position: &[f64; D],
    readings: &[RangingAndRssiReading<D>],
    transmitted_power_dbm: Option<f64>,
    path_loss_exponent: Option<f64>,
) -> Result<(f64, f64), NumericalError> {
    if let (Some(pt), Some(n)) = (transmitted_power_dbm, path_loss_exponent) {
        return Ok((pt, n));
    }
    if readings.is_empty() {
        return Err(NumericalError::InsufficientReadings { need: 1, have: 0 });
    }

    let samples: Vec<(f64, f64)> = readings
        .iter()
        .map(|r| {
            let d = geometry::distance(position, r.position());
            (pathloss::attenuation_term(r.source().frequency, d), r.rssi())
        })
        .collect();
    let n_samples = samples.len() as f64;

    let fitted = match (transmitted_power_dbm, path_loss_exponent) {
        (None, Some(n)) => {
            let pt = samples.iter().map(|(l, pr)| pr - n * l).sum::<f64>() / n_samples;
            (pt, n)
        }
        (Some(pt), None) => {
            let sll: f64 = samples.iter().map(|(l, _)| l * l).sum();
            if sll <= f64::EPSILON {
                return Err(NumericalError::RankDeficient);
            }
            let sly: f64 = samples.iter().map(|(l, pr)| l * (pr - pt)).sum();
            (pt, sly / sll)
        }
        _ => {
            // Ordinary least squares on Pr = Pt + n L, via centered sums
            let mean_l = samples.iter().map(|(l, _)| l).sum::<f64>() / n_samples;
            let mean_y = samples.iter().map(|(_, pr)| pr).sum::<f64>() / n_samples;
            let sxx: f64 = samples.iter().map(|(l, _)| (l - mean_l).powi(2)).sum();
            if readings.len() < 2 || sxx <= RANK_TOLERANCE * (1.0 + mean_l * mean_l) {
                // All receivers equidistant: power and exponent not separable
                return Err(NumericalError::RankDeficient);
            }
            let sxy: f64 = samples
                .iter()
                .map(|(l, pr)| (l - mean_l) * (pr - mean_y))
                .sum();
            let n = sxy / sxx;
            (mean_y - n * mean_l, n)
        }
    };

    if !fitted.0.is_finite() || !fitted.1.is_finite() {
        return Err(NumericalError::NonFinite);
    }
    Ok(fitted)
}
