//! Limited-memory quasi-Newton (L-BFGS) backend.
//!
//! The default backend for layout relaxation. L-BFGS approximates the
//! inverse Hessian from the last `memory` position/gradient difference pairs
//! via the two-loop recursion, giving superlinear convergence without ever
//! forming a matrix. Steps are validated by a backtracking Armijo line
//! search, so the stress sequence is monotonically non-increasing.
//!
//! Reference: Nocedal, J. & Wright, S. (2006). *Numerical Optimization*
//! (2nd ed.). Springer. Algorithm 7.4.

use crate::observers::OptObserverVec;
use crate::optimizer::line_search::{self, axpy, dot, inf_norm};
use crate::optimizer::{
    BackendOutcome, Minimizer, OptimizationMethod, OptimizerError, OptimizerResult, Termination,
    Tolerances,
};
use crate::stress::Stress;
use std::collections::VecDeque;

/// L-BFGS solver state. Stateless between calls; `memory` bounds the number
/// of correction pairs kept.
pub struct Lbfgs {
    pub memory: usize,
}

impl Default for Lbfgs {
    fn default() -> Self {
        Self { memory: 10 }
    }
}

impl Lbfgs {
    /// Two-loop recursion: `direction = -H_k * gradient` from the stored
    /// correction pairs.
    fn search_direction(
        &self,
        gradient: &[f64],
        history: &VecDeque<(Vec<f64>, Vec<f64>, f64)>,
    ) -> Vec<f64> {
        let mut q = gradient.to_vec();
        let mut alphas = Vec::with_capacity(history.len());
        for (s, y, rho) in history.iter().rev() {
            let alpha = rho * dot(s, &q);
            axpy(&mut q, -alpha, y);
            alphas.push(alpha);
        }
        if let Some((s, y, _)) = history.back() {
            let gamma = dot(s, y) / dot(y, y);
            for qi in q.iter_mut() {
                *qi *= gamma;
            }
        }
        for ((s, y, rho), alpha) in history.iter().zip(alphas.iter().rev()) {
            let beta = rho * dot(y, &q);
            axpy(&mut q, alpha - beta, s);
        }
        for qi in q.iter_mut() {
            *qi = -*qi;
        }
        q
    }
}

impl Minimizer for Lbfgs {
    fn minimize(
        &self,
        stress: &Stress,
        x: &mut [f64],
        tolerances: &Tolerances,
        observers: &OptObserverVec,
    ) -> OptimizerResult<BackendOutcome> {
        const METHOD: OptimizationMethod = OptimizationMethod::LbfgsQuasiNewton;
        let n = x.len();
        let max_iterations = tolerances.max_iterations.unwrap_or(usize::MAX);

        let mut value = stress.value_of_buffer(x);
        let mut gradient = vec![0.0; n];
        stress.gradient_of_buffer(x, &mut gradient);
        let mut evaluations = 1usize;

        let mut history: VecDeque<(Vec<f64>, Vec<f64>, f64)> = VecDeque::new();
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

            let mut direction = self.search_direction(&gradient, &history);
            let mut dd = dot(&gradient, &direction);
            if dd >= 0.0 {
                // Curvature information went stale; restart from steepest
                // descent
                history.clear();
                direction = gradient.iter().map(|g| -g).collect();
                dd = -dot(&gradient, &gradient);
            }

            let initial_step = if history.is_empty() {
                1.0 / inf_norm(&gradient).max(1.0)
            } else {
                1.0
            };

            let mut outcome = line_search::backtracking(
                stress,
                x,
                &direction,
                value,
                dd,
                initial_step,
                &mut trial,
            );
            if outcome.is_none() && !history.is_empty() {
                history.clear();
                direction = gradient.iter().map(|g| -g).collect();
                dd = -dot(&gradient, &gradient);
                outcome = line_search::backtracking(
                    stress,
                    x,
                    &direction,
                    value,
                    dd,
                    1.0 / inf_norm(&gradient).max(1.0),
                    &mut trial,
                );
            }
            let Some(accepted) = outcome else {
                return Ok(BackendOutcome {
                    termination: Termination::LineSearchStalled,
                    iterations: iteration,
                    evaluations,
                });
            };
            evaluations += accepted.evaluations;

            let s: Vec<f64> = trial.iter().zip(x.iter()).map(|(t, xi)| t - xi).collect();
            let step_norm = dot(&s, &s).sqrt();
            x.copy_from_slice(&trial);

            let mut new_gradient = vec![0.0; n];
            stress.gradient_of_buffer(x, &mut new_gradient);
            evaluations += 1;
            let y: Vec<f64> = new_gradient
                .iter()
                .zip(gradient.iter())
                .map(|(ng, g)| ng - g)
                .collect();
            let sy = dot(&s, &y);
            if sy > 1e-10 {
                let rho = 1.0 / sy;
                history.push_back((s, y, rho));
                if history.len() > self.memory {
                    history.pop_front();
                }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;
    use crate::stress::StressParameters;
    use crate::table::{Entry, TableDistances};

    fn triangle_stress() -> Stress {
        // Equilateral triangle with unit sides
        let entries = vec![
            Entry {
                point_1: 0,
                point_2: 1,
                distance: 1.0,
            },
            Entry {
                point_1: 0,
                point_2: 2,
                distance: 1.0,
            },
            Entry {
                point_1: 1,
                point_2: 2,
                distance: 1.0,
            },
        ];
        Stress::from_table_distances(
            TableDistances::from_entries(3, entries, Vec::new()),
            StressParameters::default(),
            2,
        )
    }

    #[test]
    fn test_converges_on_triangle() {
        let stress = triangle_stress();
        let mut layout = Layout::from_vec(3, 2, vec![0.0, 0.0, 0.5, 0.1, 0.2, 0.6]);
        let outcome = Lbfgs::default()
            .minimize(
                &stress,
                layout.as_mut_slice(),
                &crate::optimizer::OptimizationPrecision::Fine.tolerances(),
                &OptObserverVec::new(),
            )
            .unwrap();
        assert!(matches!(
            outcome.termination,
            Termination::GradientToleranceReached
                | Termination::StepToleranceReached
                | Termination::CostToleranceReached
        ));
        assert!(stress.value(&layout) < 1e-10);
        for (a, b) in [(0, 1), (0, 2), (1, 2)] {
            assert!((layout.distance(a, b) - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_terminates_immediately_at_optimum() {
        let stress = triangle_stress();
        let h = 3.0_f64.sqrt() / 2.0;
        let mut layout = Layout::from_vec(3, 2, vec![0.0, 0.0, 1.0, 0.0, 0.5, h]);
        let outcome = Lbfgs::default()
            .minimize(
                &stress,
                layout.as_mut_slice(),
                &crate::optimizer::OptimizationPrecision::Fine.tolerances(),
                &OptObserverVec::new(),
            )
            .unwrap();
        assert_eq!(outcome.iterations, 0);
        assert_eq!(outcome.termination, Termination::GradientToleranceReached);
    }

    #[test]
    fn test_iteration_cap_respected() {
        let stress = triangle_stress();
        let mut layout = Layout::from_vec(3, 2, vec![0.0, 0.0, 9.0, -3.0, -7.0, 2.0]);
        let tolerances = Tolerances {
            gradient: 1e-16,
            step: 1e-16,
            cost: 1e-16,
            max_iterations: Some(2),
        };
        let outcome = Lbfgs::default()
            .minimize(
                &stress,
                layout.as_mut_slice(),
                &tolerances,
                &OptObserverVec::new(),
            )
            .unwrap();
        assert!(outcome.iterations <= 2);
    }
}
