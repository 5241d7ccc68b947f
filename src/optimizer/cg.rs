//! Nonlinear conjugate gradient backend (Polak-Ribiere+).
//!
//! Cheaper per iteration than the quasi-Newton backends (no correction-pair
//! storage), at the cost of slower convergence on ill-conditioned layouts.
//! The PR+ beta (clamped at zero) gives an automatic restart whenever the
//! conjugacy assumption degrades; a periodic full restart every `n` steps
//! bounds error accumulation.

use crate::observers::OptObserverVec;
use crate::optimizer::line_search::{self, dot, inf_norm};
use crate::optimizer::{
    BackendOutcome, Minimizer, OptimizationMethod, OptimizerError, OptimizerResult, Termination,
    Tolerances,
};
use crate::stress::Stress;

#[derive(Default)]
pub struct ConjugateGradient;

impl Minimizer for ConjugateGradient {
    fn minimize(
        &self,
        stress: &Stress,
        x: &mut [f64],
        tolerances: &Tolerances,
        observers: &OptObserverVec,
    ) -> OptimizerResult<BackendOutcome> {
        const METHOD: OptimizationMethod = OptimizationMethod::ConjugateGradient;
        let n = x.len();
        let max_iterations = tolerances.max_iterations.unwrap_or(usize::MAX);

        let mut value = stress.value_of_buffer(x);
        let mut gradient = vec![0.0; n];
        stress.gradient_of_buffer(x, &mut gradient);
        let mut evaluations = 1usize;

        let mut direction: Vec<f64> = gradient.iter().map(|g| -g).collect();
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
            if inf_norm(&gradient) < tolerances.gradient {
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

            let mut dd = dot(&gradient, &direction);
            if dd >= 0.0 {
                direction = gradient.iter().map(|g| -g).collect();
                dd = -dot(&gradient, &gradient);
            }

            let initial_step = 1.0 / inf_norm(&gradient).max(1.0);
            let Some(accepted) = line_search::backtracking(
                stress,
                x,
                &direction,
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

            let step_norm = trial
                .iter()
                .zip(x.iter())
                .map(|(t, xi)| (t - xi) * (t - xi))
                .sum::<f64>()
                .sqrt();
            x.copy_from_slice(&trial);

            let mut new_gradient = vec![0.0; n];
            stress.gradient_of_buffer(x, &mut new_gradient);
            evaluations += 1;

            // Polak-Ribiere+ with clamping at zero
            let gg = dot(&gradient, &gradient);
            let beta = if (iteration + 1) % n == 0 {
                0.0 // periodic restart
            } else {
                let pr = new_gradient
                    .iter()
                    .zip(gradient.iter())
                    .map(|(ng, g)| ng * (ng - g))
                    .sum::<f64>()
                    / gg.max(1e-300);
                pr.max(0.0)
            };
            for (d, ng) in direction.iter_mut().zip(new_gradient.iter()) {
                *d = -ng + beta * *d;
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
