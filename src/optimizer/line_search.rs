//! Backtracking line search shared by the gradient-based backends.
//!
//! Armijo sufficient-decrease rule: accept the first step `a` along the
//! descent direction `p` with `f(x + a p) <= f(x) + c1 a (g . p)`, halving
//! from the initial step. Sufficient decrease alone guarantees the monotone
//! stress improvement the callers rely on; curvature conditions are left to
//! the quasi-Newton updates themselves (skipped when `s.y` is too small).

use crate::stress::Stress;

const ARMIJO_C1: f64 = 1e-4;
const SHRINK: f64 = 0.5;
const MAX_HALVINGS: usize = 40;

pub struct LineSearchOutcome {
    /// Accepted step length
    pub step: f64,
    /// Objective value at the accepted point
    pub value: f64,
    /// Objective evaluations spent
    pub evaluations: usize,
}

/// Search along `direction` from `x`. Returns `None` when `direction` is not
/// a descent direction or no acceptable step exists; `x` is untouched either
/// way. On success `trial` holds the accepted point.
pub fn backtracking(
    stress: &Stress,
    x: &[f64],
    direction: &[f64],
    value: f64,
    directional_derivative: f64,
    initial_step: f64,
    trial: &mut [f64],
) -> Option<LineSearchOutcome> {
    if directional_derivative >= 0.0 || !directional_derivative.is_finite() {
        return None;
    }

    let mut step = initial_step;
    let mut evaluations = 0;
    for _ in 0..MAX_HALVINGS {
        for (t, (xi, pi)) in trial.iter_mut().zip(x.iter().zip(direction)) {
            *t = xi + step * pi;
        }
        let trial_value = stress.value_of_buffer(trial);
        evaluations += 1;
        if trial_value.is_finite()
            && trial_value <= value + ARMIJO_C1 * step * directional_derivative
        {
            return Some(LineSearchOutcome {
                step,
                value: trial_value,
                evaluations,
            });
        }
        step *= SHRINK;
    }
    None
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `v += scale * w`
pub(crate) fn axpy(v: &mut [f64], scale: f64, w: &[f64]) {
    for (vi, wi) in v.iter_mut().zip(w) {
        *vi += scale * wi;
    }
}

pub(crate) fn inf_norm(v: &[f64]) -> f64 {
    v.iter().fold(0.0, |acc, x| acc.max(x.abs()))
}
