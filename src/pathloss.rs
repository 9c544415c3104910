// Log-distance path-loss model and dBm/power conversions
//
// Received power follows Pr = Pt * (c / (4*pi*f))^n / d^n, which in dBm is
//   Pr_dBm = Pt_dBm + 10 * n * log10(c / (4*pi*f*d))

use std::f64::consts::{LN_10, PI};

use crate::constants::{MIN_MODEL_DISTANCE, SPEED_OF_LIGHT};

/// Converts power in dBm to milliwatts
#[inline]
pub fn dbm_to_power(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0)
}

/// Converts power in milliwatts to dBm
#[inline]
pub fn power_to_dbm(milliwatts: f64) -> f64 {
    10.0 * milliwatts.log10()
}

/// Per-unit-exponent attenuation term `10 * log10(c / (4*pi*f*d))` in dB
///
/// Multiplying by the path-loss exponent gives the attenuation between the
/// transmitter and a receiver at `distance` meters. Distances are clamped
/// away from zero so the model stays finite at the source itself.
#[inline]
pub fn attenuation_term(frequency: f64, distance: f64) -> f64 {
    let d = distance.max(MIN_MODEL_DISTANCE);
    10.0 * (SPEED_OF_LIGHT / (4.0 * PI * frequency * d)).log10()
}

/// Predicted received power in dBm
///
/// # Arguments
/// * `transmitted_power_dbm` - Transmitted power in dBm
/// * `path_loss_exponent` - Exponent `n` of the log-distance model
/// * `frequency` - Carrier frequency in Hz
/// * `distance` - Transmitter to receiver distance in meters
pub fn received_power_dbm(
    transmitted_power_dbm: f64,
    path_loss_exponent: f64,
    frequency: f64,
    distance: f64,
) -> f64 {
    transmitted_power_dbm + path_loss_exponent * attenuation_term(frequency, distance)
}

/// Derivative of the predicted received power (dBm) with respect to distance
#[inline]
pub fn received_power_distance_derivative(path_loss_exponent: f64, distance: f64) -> f64 {
    let d = distance.max(MIN_MODEL_DISTANCE);
    -10.0 * path_loss_exponent / (d * LN_10)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    #[test]
    fn test_dbm_conversion() {
        assert!((dbm_to_power(0.0) - 1.0).abs() < EPSILON);
        assert!((dbm_to_power(20.0) - 100.0).abs() < EPSILON);
        assert!((power_to_dbm(1.0)).abs() < EPSILON);
        assert!((power_to_dbm(dbm_to_power(-42.5)) + 42.5).abs() < EPSILON);
    }

    #[test]
    fn test_free_space_loss_at_one_meter() {
        // Friis at 2.4 GHz, 1 m: about 40.05 dB of loss
        let pr = received_power_dbm(0.0, 2.0, 2.4e9, 1.0);
        assert!((pr + 40.05).abs() < 0.01, "pr = {}", pr);
    }

    #[test]
    fn test_loss_grows_with_exponent() {
        // Doubling distance costs 10*n*log10(2) dB
        let f = 2.4e9;
        for n in [1.6, 2.0, 3.5] {
            let near = received_power_dbm(-10.0, n, f, 5.0);
            let far = received_power_dbm(-10.0, n, f, 10.0);
            assert!((near - far - 10.0 * n * 2f64.log10()).abs() < EPSILON);
        }
    }

    #[test]
    fn test_distance_derivative_matches_finite_difference() {
        let (n, f, d) = (2.7, 5.0e9, 12.0);
        let h = 1e-6;
        let numeric = (received_power_dbm(0.0, n, f, d + h) - received_power_dbm(0.0, n, f, d)) / h;
        let analytic = received_power_distance_derivative(n, d);
        assert!((numeric - analytic).abs() < 1e-5);
    }

    #[test]
    fn test_model_finite_at_zero_distance() {
        assert!(received_power_dbm(0.0, 2.0, 2.4e9, 0.0).is_finite());
        assert!(received_power_distance_derivative(2.0, 0.0).is_finite());
    }
}
