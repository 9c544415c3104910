// Geometry helpers - distances and gradients over fixed-size positions
//
// Positions are plain `[f64; D]` arrays (D = 2 or 3), Cartesian, in meters.

use nalgebra::DMatrix;

/// Euclidean distance between two positions in meters
///
/// # Example
/// ```
/// let d = radiolocate::geometry::distance(&[0.0, 0.0, 0.0], &[3.0, 4.0, 0.0]);
/// assert!((d - 5.0).abs() < 1e-12);
/// ```
#[inline]
pub fn distance<const D: usize>(p0: &[f64; D], p1: &[f64; D]) -> f64 {
    squared_distance(p0, p1).sqrt()
}

/// Squared Euclidean distance between two positions
#[inline]
pub fn squared_distance<const D: usize>(p0: &[f64; D], p1: &[f64; D]) -> f64 {
    p0.iter()
        .zip(p1.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum()
}

/// Squared norm of a position vector
#[inline]
pub fn squared_norm<const D: usize>(p: &[f64; D]) -> f64 {
    p.iter().map(|v| v * v).sum()
}

/// Gradient of `distance(from, to)` with respect to `to`
///
/// This is the unit vector pointing from `from` to `to`. Returns `None` when
/// both positions coincide and the gradient is undefined.
pub fn distance_gradient<const D: usize>(from: &[f64; D], to: &[f64; D]) -> Option<[f64; D]> {
    let d = distance(from, to);
    if d <= f64::EPSILON {
        return None;
    }
    let mut g = [0.0; D];
    for i in 0..D {
        g[i] = (to[i] - from[i]) / d;
    }
    Some(g)
}

/// Quadratic form `gᵀ Σ g`
///
/// First-order propagation of a position covariance `Σ` into the variance of
/// a scalar function whose gradient is `g`.
pub fn propagate_variance(gradient: &[f64], covariance: &DMatrix<f64>) -> f64 {
    let n = gradient.len();
    let mut variance = 0.0;
    for i in 0..n {
        for j in 0..n {
            variance += gradient[i] * covariance[(i, j)] * gradient[j];
        }
    }
    variance
}
