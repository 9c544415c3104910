// Nonlinear least-squares refinement (Levenberg-Marquardt)
//
// Residual models supply weighted residuals r(x) (already divided by their
// standard deviation) and optionally an analytic Jacobian. The covariance of
// the fitted parameters is (J^T J)^-1 at the solution.

use nalgebra as na;
use na::{DMatrix, DVector};
use tracing::{debug, trace};

use crate::constants::{
    DEFAULT_CONVERGENCE_TOLERANCE, DEFAULT_MAX_ITERATIONS, EXACT_FIT_COST, INITIAL_DAMPING,
    MAX_DAMPING,
};
use crate::error::NumericalError;

/// Smallest diagonal entry used when scaling the damping term
const MIN_DIAGONAL: f64 = 1e-12;

/// Lower bound on the damping factor after successful steps
const MIN_DAMPING: f64 = 1e-15;

/// A weighted least-squares problem over a parameter vector
pub trait ResidualModel {
    /// Number of unknown parameters
    fn num_parameters(&self) -> usize;

    /// Weighted residuals at `params`
    fn residuals(&self, params: &DVector<f64>) -> DVector<f64>;

    /// Jacobian of the weighted residuals, one row per residual
    ///
    /// Defaults to forward differences; models override it with analytic
    /// derivatives when they have them.
    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64> {
        numerical_jacobian(self, params)
    }
}

/// Compute the Jacobian of a model by forward differences
pub fn numerical_jacobian<M: ResidualModel + ?Sized>(model: &M, x: &DVector<f64>) -> DMatrix<f64> {
    let residuals = model.residuals(x);
    let n_residuals = residuals.len();
    let n_params = x.len();
    let mut jacobian = DMatrix::zeros(n_residuals, n_params);

    for j in 0..n_params {
        let delta = 1e-7 * x[j].abs().max(1.0);
        let mut x_plus = x.clone();
        x_plus[j] += delta;
        let residuals_plus = model.residuals(&x_plus);

        for i in 0..n_residuals {
            jacobian[(i, j)] = (residuals_plus[i] - residuals[i]) / delta;
        }
    }
    jacobian
}

/// Result of a converged fit
#[derive(Debug, Clone)]
pub struct FitResult {
    pub parameters: DVector<f64>,
    /// (J^T J)^-1 at the solution, `None` when not invertible
    pub covariance: Option<DMatrix<f64>>,
    /// Sum of squared weighted residuals at the solution
    pub cost: f64,
    /// Number of accepted steps
    pub iterations: usize,
}

/// Levenberg-Marquardt fitter settings
#[derive(Debug, Clone, Copy)]
pub struct LevenbergMarquardt {
    /// Maximum accepted steps before reporting non-convergence
    pub max_iterations: usize,
    /// Relative cost improvement below which the fit is converged
    pub tolerance: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        LevenbergMarquardt {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tolerance: DEFAULT_CONVERGENCE_TOLERANCE,
        }
    }
}

impl LevenbergMarquardt {
    /// Minimize the model's squared residuals starting from `initial`
    ///
    /// # Returns
    /// * `Ok(FitResult)` once the relative cost improvement drops below the
    ///   tolerance, the fit is exact, or no damped step can reduce the cost
    /// * `Err(DidNotConverge)` if `max_iterations` steps were not enough
    /// * `Err(SingularJacobian)` if the normal equations cannot be factored
    /// * `Err(NonFinite)` if residuals or derivatives blow up
    pub fn fit<M: ResidualModel + ?Sized>(
        &self,
        model: &M,
        initial: DVector<f64>,
    ) -> Result<FitResult, NumericalError> {
        let n_params = model.num_parameters();
        debug_assert_eq!(initial.len(), n_params);

        let mut x = initial;
        let mut residuals = model.residuals(&x);
        let mut cost = residuals.norm_squared();
        if !cost.is_finite() {
            return Err(NumericalError::NonFinite);
        }

        let mut lambda = INITIAL_DAMPING;
        let mut iterations = 0;
        let mut converged = cost <= EXACT_FIT_COST;

        while !converged {
            if iterations >= self.max_iterations {
                debug!(iterations, cost, "Levenberg-Marquardt did not converge");
                return Err(NumericalError::DidNotConverge { iterations, cost });
            }

            let jacobian = model.jacobian(&x);
            if jacobian.iter().any(|v| !v.is_finite()) {
                return Err(NumericalError::NonFinite);
            }

            // (J^T J + lambda * diag(J^T J)) dx = -J^T r
            let jt = jacobian.transpose();
            let jtj = &jt * &jacobian;
            let jtr = &jt * &residuals;

            let mut factored = false;
            loop {
                let mut jtj_damped = jtj.clone();
                for i in 0..n_params {
                    jtj_damped[(i, i)] += lambda * jtj[(i, i)].max(MIN_DIAGONAL);
                }

                if let Some(chol) = jtj_damped.cholesky() {
                    factored = true;
                    let step = chol.solve(&(-&jtr));
                    let x_new = &x + &step;
                    let new_residuals = model.residuals(&x_new);
                    let new_cost = new_residuals.norm_squared();

                    if new_cost.is_finite() && new_cost < cost {
                        // Good step, accept it and decrease damping
                        let improvement = (cost - new_cost) / cost;
                        x = x_new;
                        residuals = new_residuals;
                        cost = new_cost;
                        lambda = (lambda * 0.1).max(MIN_DAMPING);
                        iterations += 1;
                        trace!(iterations, cost, lambda, "Accepted step");

                        converged = improvement < self.tolerance || cost <= EXACT_FIT_COST;
                        break;
                    }
                }

                // Bad step or singular system, increase damping and try again
                lambda *= 10.0;
                if lambda > MAX_DAMPING {
                    if !factored {
                        return Err(NumericalError::SingularJacobian);
                    }
                    // No descent direction left: we are at a minimum
                    converged = true;
                    break;
                }
            }
        }

        let covariance = covariance_at(model, &x);
        debug!(
            iterations,
            cost,
            has_covariance = covariance.is_some(),
            "Levenberg-Marquardt converged"
        );

        Ok(FitResult {
            parameters: x,
            covariance,
            cost,
            iterations,
        })
    }
}

/// Gauss-Newton covariance (J^T J)^-1 at `x`
///
/// The residuals are already weighted by 1/sigma, so J^T J approximates the
/// inverse covariance of the parameters.
pub fn covariance_at<M>(model: &M, x: &DVector<f64>) -> Option<DMatrix<f64>>
where
    M: ResidualModel + ?Sized,
{
    let jacobian = model.jacobian(x);
    let jtj = jacobian.transpose() * &jacobian;
    let inverse = jtj.try_inverse()?;
    let valid = inverse.iter().all(|v| v.is_finite())
        && inverse.diagonal().iter().all(|&v| v >= 0.0);
    if valid {
        Some(inverse)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// y = a * exp(b * t), sampled without noise
    struct ExpModel {
        samples: Vec<(f64, f64)>,
    }

    impl ResidualModel for ExpModel {
        fn num_parameters(&self) -> usize {
            2
        }

        fn residuals(&self, p: &DVector<f64>) -> DVector<f64> {
            DVector::from_iterator(
                self.samples.len(),
                self.samples.iter().map(|(t, y)| p[0] * (p[1] * t).exp() - y),
            )
        }
    }

    /// Residuals independent of the second parameter
    struct RankDeficientModel;

    impl ResidualModel for RankDeficientModel {
        fn num_parameters(&self) -> usize {
            2
        }

        fn residuals(&self, p: &DVector<f64>) -> DVector<f64> {
            DVector::from_vec(vec![p[0] - 1.0, 2.0 * (p[0] - 1.0) + 0.5])
        }
    }

    fn exp_model(a: f64, b: f64) -> ExpModel {
        ExpModel {
            samples: (0..10)
                .map(|i| {
                    let t = i as f64 * 0.3;
                    (t, a * (b * t).exp())
                })
                .collect(),
        }
    }

    #[test]
    fn test_fit_exponential() {
        let model = exp_model(2.0, -0.7);
        let result = LevenbergMarquardt::default()
            .fit(&model, DVector::from_vec(vec![1.0, 0.0]))
            .unwrap();

        assert!((result.parameters[0] - 2.0).abs() < 1e-6, "a = {}", result.parameters[0]);
        assert!((result.parameters[1] + 0.7).abs() < 1e-6, "b = {}", result.parameters[1]);
        assert!(result.cost < 1e-12);
        assert!(result.covariance.is_some());
    }

    #[test]
    fn test_exact_initial_guess_needs_no_iterations() {
        let model = exp_model(1.5, 0.2);
        let result = LevenbergMarquardt::default()
            .fit(&model, DVector::from_vec(vec![1.5, 0.2]))
            .unwrap();
        assert_eq!(result.iterations, 0);
    }

    #[test]
    fn test_iteration_budget_exhausted() {
        let model = exp_model(2.0, -0.7);
        let solver = LevenbergMarquardt {
            max_iterations: 1,
            tolerance: 0.0,
        };
        let result = solver.fit(&model, DVector::from_vec(vec![10.0, 1.0]));
        assert!(matches!(result, Err(NumericalError::DidNotConverge { iterations: 1, .. })));
    }

    #[test]
    fn test_rank_deficient_covariance_is_none() {
        let result = LevenbergMarquardt::default()
            .fit(&RankDeficientModel, DVector::from_vec(vec![0.0, 0.0]))
            .unwrap();
        assert!(result.covariance.is_none());
    }

    #[test]
    fn test_numerical_jacobian() {
        let model = exp_model(2.0, -0.7);
        let x = DVector::from_vec(vec![2.0, -0.7]);
        let jacobian = numerical_jacobian(&model, &x);
        for (i, (t, _)) in model.samples.iter().enumerate() {
            let e = (-0.7 * t).exp();
            assert!((jacobian[(i, 0)] - e).abs() < 1e-5);
            assert!((jacobian[(i, 1)] - 2.0 * t * e).abs() < 1e-5);
        }
    }
}
