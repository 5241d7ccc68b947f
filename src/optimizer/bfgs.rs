//! Dense BFGS backend.
//!
//! Maintains a full inverse-Hessian approximation. Quadratic memory in the
//! coordinate count, so the default backend for large layouts is L-BFGS;
//! this one is kept as an alternate with a richer curvature model for small
//! and mid-size tables.

use crate::observers::OptObserverVec;
use crate::optimizer::line_search::{self, inf_norm};
use crate::optimizer::{
    BackendOutcome, Minimizer, OptimizationMethod, OptimizerError, OptimizerResult, Termination,
    Tolerances,
};
use crate::stress::Stress;
use nalgebra::{DMatrix, DVector};

#[derive(Default)]
pub struct Bfgs;

impl Minimizer for Bfgs {
    fn minimize(
        &self,
        stress: &Stress,
        x: &mut [f64],
        tolerances: &Tolerances,
        observers: &OptObserverVec,
    ) -> OptimizerResult<BackendOutcome> {
        const METHOD: OptimizationMethod = OptimizationMethod::Bfgs;
        let n = x.len();
        let max_iterations = tolerances.max_iterations.unwrap_or(usize::MAX);

        let mut value = stress.value_of_buffer(x);
        let mut gradient_buffer = vec![0.0; n];
        stress.gradient_of_buffer(x, &mut gradient_buffer);
        let mut gradient = DVector::from_column_slice(&gradient_buffer);
        let mut evaluations = 1usize;

        let mut inverse_hessian = DMatrix::<f64>::identity(n, n);
        let mut trial = vec![0.0; n];
        let mut iteration = 0usize;

        loop {
            if !value.is_finite() || gradient.iter().any(|g| !g.is_finite()) {
                return Err(OptimizerError::NumericalInstability {
                    method: METHOD,
                    message: format!("stress {value} at iteration {iteration}"),
                }
                .log());
            }
            if inf_norm(gradient.as_slice()) < tolerances.gradient {
                return Ok(BackendOutcome {
                    termination: Termination::GradientToleranceReached,
                    iterations: iteration,
                    evaluations,
                });
            }
            if iteration >= max_iterations {
                return Ok(BackendOutcome {
                    termination: Termination::MaxIterationsReached,
                    iterations: iteration,
                    evaluations,
                });
            }

            let mut direction = -(&inverse_hessian * &gradient);
            let mut dd = gradient.dot(&direction);
            if dd >= 0.0 {
                inverse_hessian = DMatrix::identity(n, n);
                direction = -gradient.clone();
                dd = -gradient.dot(&gradient);
            }

            let initial_step = if iteration == 0 {
                1.0 / inf_norm(gradient.as_slice()).max(1.0)
            } else {
                1.0
            };
            let Some(accepted) = line_search::backtracking(
                stress,
                x,
                direction.as_slice(),
                value,
                dd,
                initial_step,
                &mut trial,
            ) else {
                return Ok(BackendOutcome {
                    termination: Termination::LineSearchStalled,
                    iterations: iteration,
                    evaluations,
                });
            };
            evaluations += accepted.evaluations;

            let s = DVector::from_iterator(n, trial.iter().zip(x.iter()).map(|(t, xi)| t - xi));
            let step_norm = s.norm();
            x.copy_from_slice(&trial);

            stress.gradient_of_buffer(x, &mut gradient_buffer);
            evaluations += 1;
            let new_gradient = DVector::from_column_slice(&gradient_buffer);
            let y = &new_gradient - &gradient;

            let sy = s.dot(&y);
            if sy > 1e-10 {
                // Inverse BFGS update:
                // H+ = H + (sy + y'Hy)/(sy)^2 ss' - (Hys' + sy'H)/sy
                let hy = &inverse_hessian * &y;
                let yhy = y.dot(&hy);
                let ss = &s * s.transpose();
                let hys = &hy * s.transpose();
                inverse_hessian += ((sy + yhy) / (sy * sy)) * ss
                    - (&hys + hys.transpose()) / sy;
            } else {
                inverse_hessian = DMatrix::identity(n, n);
            }

            let cost_change = value - accepted.value;
            value = accepted.value;
            gradient = new_gradient;
            iteration += 1;
            observers.notify(x, iteration);

            if step_norm < tolerances.step {
                return Ok(BackendOutcome {
                    termination: Termination::StepToleranceReached,
                    iterations: iteration,
                    evaluations,
                });
            }
            if cost_change.abs() < tolerances.cost * value.max(1e-10) {
                return Ok(BackendOutcome {
                    termination: Termination::CostToleranceReached,
                    iterations: iteration,
                    evaluations,
                });
            }
        }
    }
}
