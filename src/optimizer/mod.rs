//! Optimization backends and dispatch for layout relaxation.
//!
//! The engine drives one of four numerical backends against the stress
//! objective:
//! - L-BFGS quasi-Newton (default; matrix-free, fast on large layouts)
//! - nonlinear conjugate gradient (Polak-Ribiere+ with restarts)
//! - BFGS (dense inverse-Hessian alternate backend)
//! - differential evolution (global, gradient-free)
//!
//! Backends share a uniform contract: given a coordinate buffer and a
//! [`Stress`], run to a stopping condition, mutate the buffer in place with
//! the best-found layout, and report a uniform [`OptimizationReport`].
//! Disconnected points are zero-masked for the duration of every backend
//! call via [`DisconnectedMask`] and restored to NaN on all exit paths.

use crate::layout::{DisconnectedMask, Layout};
use crate::observers::OptObserverVec;
use crate::pca::{self, PcaError};
use crate::randomizer::LayoutRandomizer;
use crate::stress::Stress;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, error, warn};
use web_time as time;

pub mod bfgs;
pub mod cg;
pub mod diffevo;
pub mod lbfgs;
mod line_search;

pub use bfgs::Bfgs;
pub use cg::ConjugateGradient;
pub use diffevo::DifferentialEvolution;
pub use lbfgs::Lbfgs;

/// Numerical backend selection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationMethod {
    /// Limited-memory quasi-Newton (default)
    #[default]
    LbfgsQuasiNewton,
    /// Nonlinear conjugate gradient
    ConjugateGradient,
    /// Dense BFGS (alternate backend)
    Bfgs,
    /// Differential evolution (global, gradient-free)
    DifferentialEvolution,
}

impl Display for OptimizationMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationMethod::LbfgsQuasiNewton => write!(f, "L-BFGS quasi-Newton"),
            OptimizationMethod::ConjugateGradient => write!(f, "conjugate gradient"),
            OptimizationMethod::Bfgs => write!(f, "BFGS"),
            OptimizationMethod::DifferentialEvolution => write!(f, "differential evolution"),
        }
    }
}

impl FromStr for OptimizationMethod {
    type Err = OptimizerError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "lbfgs" => Ok(OptimizationMethod::LbfgsQuasiNewton),
            "cg" => Ok(OptimizationMethod::ConjugateGradient),
            "bfgs" => Ok(OptimizationMethod::Bfgs),
            "de" => Ok(OptimizationMethod::DifferentialEvolution),
            _ => Err(OptimizerError::UnknownMethod(name.to_string()).log()),
        }
    }
}

/// Precision presets trading accuracy for speed during multi-restart search.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationPrecision {
    /// Loose tolerances, small iteration cap; used by bootstrap calibration
    VeryRough,
    /// Loose tolerances; used by grid-test re-optimization and multi-restart
    Rough,
    /// Tight tolerances, no iteration cap
    #[default]
    Fine,
}

impl OptimizationPrecision {
    /// Backend tolerance triple plus iteration cap for this preset.
    pub fn tolerances(&self) -> Tolerances {
        match self {
            OptimizationPrecision::VeryRough => Tolerances {
                gradient: 1e-3,
                step: 1e-4,
                cost: 1e-5,
                max_iterations: Some(250),
            },
            OptimizationPrecision::Rough => Tolerances {
                gradient: 1e-5,
                step: 1e-6,
                cost: 1e-7,
                max_iterations: Some(1000),
            },
            OptimizationPrecision::Fine => Tolerances {
                gradient: 1e-8,
                step: 1e-10,
                cost: 1e-12,
                max_iterations: None,
            },
        }
    }
}

impl FromStr for OptimizationPrecision {
    type Err = OptimizerError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "very-rough" => Ok(OptimizationPrecision::VeryRough),
            "rough" => Ok(OptimizationPrecision::Rough),
            "fine" => Ok(OptimizationPrecision::Fine),
            _ => Err(OptimizerError::UnknownPrecision(name.to_string()).log()),
        }
    }
}

/// Backend-specific stopping tolerances.
#[derive(Debug, Clone, Copy)]
pub struct Tolerances {
    /// Gradient infinity-norm threshold
    pub gradient: f64,
    /// Parameter update norm threshold
    pub step: f64,
    /// Relative objective change threshold
    pub cost: f64,
    /// Iteration cap; `None` means uncapped
    pub max_iterations: Option<usize>,
}

/// Why a backend stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    GradientToleranceReached,
    StepToleranceReached,
    CostToleranceReached,
    MaxIterationsReached,
    /// The line search could not improve the objective any further; the
    /// layout is at the limit of floating precision for this direction set
    LineSearchStalled,
    /// Differential evolution population collapsed to a single basin
    PopulationConverged,
}

impl Display for Termination {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Termination::GradientToleranceReached => write!(f, "gradient tolerance reached"),
            Termination::StepToleranceReached => write!(f, "step tolerance reached"),
            Termination::CostToleranceReached => write!(f, "cost tolerance reached"),
            Termination::MaxIterationsReached => write!(f, "maximum iterations reached"),
            Termination::LineSearchStalled => write!(f, "line search stalled"),
            Termination::PopulationConverged => write!(f, "population converged"),
        }
    }
}

/// Optimizer error taxonomy. Variants raised mid-run carry the method name
/// so operators can distinguish bad input from solver instability.
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// NaN or Inf detected in cost, gradient or parameters mid-run
    #[error("{method}: non-finite values detected: {message}")]
    NumericalInstability {
        method: OptimizationMethod,
        message: String,
    },

    /// Invalid optimization parameters provided
    #[error("Invalid optimization parameters: {0}")]
    InvalidParameters(String),

    /// Unknown optimization method name
    #[error("Unknown optimization method: {0:?} (expected lbfgs, cg, bfgs or de)")]
    UnknownMethod(String),

    /// Unknown precision preset name
    #[error("Unknown precision: {0:?} (expected very-rough, rough or fine)")]
    UnknownPrecision(String),

    /// Dimension annealing has no PCA pathway for this method
    #[error("{method}: dimension annealing is not supported by gradient-free methods")]
    AnnealingUnsupported { method: OptimizationMethod },

    /// Invalid dimension-annealing schedule
    #[error("Invalid dimension schedule: {0}")]
    InvalidSchedule(String),

    /// Every randomized attempt of a multi-start batch failed
    #[error("All {attempts} optimization attempts failed")]
    AllAttemptsFailed { attempts: usize },

    /// PCA failure inside the annealing pipeline
    #[error(transparent)]
    Pca(#[from] PcaError),
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with an underlying source error
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Per-run report, created once per optimizer invocation and immutable
/// thereafter.
#[derive(Debug, Clone)]
pub struct OptimizationReport {
    pub method: OptimizationMethod,
    pub termination: Termination,
    /// Outer iterations performed
    pub iterations: usize,
    /// Objective (and gradient) evaluations
    pub stress_evaluations: usize,
    /// Wall-clock time of the run
    pub elapsed_time: time::Duration,
    pub initial_stress: f64,
    pub final_stress: f64,
}

impl OptimizationReport {
    /// Fold a follow-up stage (annealing) into this report. Counts and time
    /// accumulate; the final stress and termination come from the last stage.
    fn accumulate(&mut self, next: &OptimizationReport) {
        self.iterations += next.iterations;
        self.stress_evaluations += next.stress_evaluations;
        self.elapsed_time += next.elapsed_time;
        self.final_stress = next.final_stress;
        self.termination = next.termination;
    }
}

impl Display for OptimizationReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} | stress {:.6e} -> {:.6e} | {} iterations, {} evaluations, {:.2}ms",
            self.method,
            self.termination,
            self.initial_stress,
            self.final_stress,
            self.iterations,
            self.stress_evaluations,
            self.elapsed_time.as_secs_f64() * 1000.0
        )
    }
}

/// What a backend hands back to the dispatcher.
pub(crate) struct BackendOutcome {
    pub termination: Termination,
    pub iterations: usize,
    pub evaluations: usize,
}

/// Uniform backend contract. Implementations mutate `x` in place with the
/// best-found layout; `x` is already zero-masked for disconnected points.
pub(crate) trait Minimizer {
    fn minimize(
        &self,
        stress: &Stress,
        x: &mut [f64],
        tolerances: &Tolerances,
        observers: &OptObserverVec,
    ) -> OptimizerResult<BackendOutcome>;
}

fn validate(stress: &Stress, layout: &Layout) -> OptimizerResult<()> {
    if layout.number_of_points() != stress.number_of_points() {
        return Err(OptimizerError::InvalidParameters(format!(
            "layout has {} points, stress expects {}",
            layout.number_of_points(),
            stress.number_of_points()
        ))
        .log());
    }
    if layout.number_of_dimensions() != stress.number_of_dimensions() {
        return Err(OptimizerError::InvalidParameters(format!(
            "layout has {} dimensions, stress expects {}",
            layout.number_of_dimensions(),
            stress.number_of_dimensions()
        ))
        .log());
    }
    let parameters = stress.parameters();
    for (name, points) in [
        ("disconnected", &parameters.disconnected),
        ("unmovable", &parameters.unmovable),
        (
            "unmovable-in-the-last-dimension",
            &parameters.unmovable_in_the_last_dimension,
        ),
    ] {
        if let Some(&point) = points.iter().find(|&&point| point >= layout.number_of_points()) {
            return Err(OptimizerError::InvalidParameters(format!(
                "{} point {} out of range ({} points)",
                name,
                point,
                layout.number_of_points()
            ))
            .log());
        }
    }
    Ok(())
}

/// Relax `layout` against `stress` with the selected backend, mutating it in
/// place. Non-convergence within a rough preset's iteration cap is a normal
/// termination; non-finite values or invalid parameters are fatal to the
/// attempt and never retried here (retry policy belongs to the caller).
pub fn optimize(
    method: OptimizationMethod,
    stress: &Stress,
    layout: &mut Layout,
    precision: OptimizationPrecision,
) -> OptimizerResult<OptimizationReport> {
    optimize_with_observers(method, stress, layout, precision, &OptObserverVec::new())
}

/// [`optimize`] with per-iteration observer notification (intermediate
/// layout recording and similar diagnostics).
pub fn optimize_with_observers(
    method: OptimizationMethod,
    stress: &Stress,
    layout: &mut Layout,
    precision: OptimizationPrecision,
    observers: &OptObserverVec,
) -> OptimizerResult<OptimizationReport> {
    validate(stress, layout)?;
    let tolerances = precision.tolerances();
    let start = time::Instant::now();

    // Backend math cannot tolerate NaN; the mask restores the sentinel on
    // every exit path, including error propagation below.
    let mut masked = DisconnectedMask::new(layout, &stress.parameters().disconnected);
    let initial_stress = stress.value_of_buffer(masked.as_slice());
    if !initial_stress.is_finite() {
        return Err(OptimizerError::NumericalInstability {
            method,
            message: format!("initial stress is {initial_stress}"),
        }
        .log());
    }

    let outcome = match method {
        OptimizationMethod::LbfgsQuasiNewton => {
            Lbfgs::default().minimize(stress, masked.as_mut_slice(), &tolerances, observers)?
        }
        OptimizationMethod::ConjugateGradient => ConjugateGradient::default().minimize(
            stress,
            masked.as_mut_slice(),
            &tolerances,
            observers,
        )?,
        OptimizationMethod::Bfgs => {
            Bfgs::default().minimize(stress, masked.as_mut_slice(), &tolerances, observers)?
        }
        OptimizationMethod::DifferentialEvolution => DifferentialEvolution::default().minimize(
            stress,
            masked.as_mut_slice(),
            &tolerances,
            observers,
        )?,
    };

    let final_stress = stress.value_of_buffer(masked.as_slice());
    drop(masked);

    let report = OptimizationReport {
        method,
        termination: outcome.termination,
        iterations: outcome.iterations,
        stress_evaluations: outcome.evaluations + 2,
        elapsed_time: start.elapsed(),
        initial_stress,
        final_stress,
    };
    debug!("{}", report);
    Ok(report)
}

/// Optimize through a dimension-annealing schedule: relax fully at the first
/// dimension count, PCA-reduce to the next, repeat. `schedule[0]` must match
/// the layout's current dimensionality and entries must strictly decrease.
/// The gradient-free global method has no PCA pathway and is rejected
/// eagerly.
pub fn optimize_with_dimension_annealing(
    method: OptimizationMethod,
    stress: &mut Stress,
    layout: &mut Layout,
    schedule: &[usize],
    precision: OptimizationPrecision,
) -> OptimizerResult<OptimizationReport> {
    if method == OptimizationMethod::DifferentialEvolution {
        return Err(OptimizerError::AnnealingUnsupported { method }.log());
    }
    if schedule.is_empty() {
        return Err(OptimizerError::InvalidSchedule("empty schedule".to_string()).log());
    }
    if schedule[0] != layout.number_of_dimensions() {
        return Err(OptimizerError::InvalidSchedule(format!(
            "schedule starts at {} dimensions but the layout has {}",
            schedule[0],
            layout.number_of_dimensions()
        ))
        .log());
    }
    if schedule.contains(&0) {
        return Err(OptimizerError::InvalidSchedule("zero dimensions".to_string()).log());
    }
    if schedule.windows(2).any(|pair| pair[1] >= pair[0]) {
        return Err(OptimizerError::InvalidSchedule(format!(
            "dimension counts must strictly decrease, got {schedule:?}"
        ))
        .log());
    }

    stress.set_number_of_dimensions(schedule[0]);
    let mut report = optimize(method, stress, layout, precision)?;
    for &target in &schedule[1..] {
        *layout = pca::reduce_dimensionality(layout, target, &stress.parameters().disconnected)?;
        stress.set_number_of_dimensions(target);
        let stage = optimize(method, stress, layout, precision)?;
        report.accumulate(&stage);
    }
    Ok(report)
}

/// Run `attempts` independent randomized relaxations and keep the best.
///
/// Each attempt owns its layout; the stress and randomizer are shared
/// read-only (the randomizer serializes its generator internally). A failed
/// attempt is logged and discarded; the batch fails only when every attempt
/// does. `threads` of 0 uses the global pool; 1 is the reproducible
/// degenerate case.
pub fn optimize_multi_start(
    method: OptimizationMethod,
    stress: &Stress,
    randomizer: &(dyn LayoutRandomizer + Sync),
    attempts: usize,
    precision: OptimizationPrecision,
    threads: usize,
) -> OptimizerResult<(Layout, OptimizationReport)> {
    if attempts == 0 {
        return Err(
            OptimizerError::InvalidParameters("zero optimization attempts".to_string()).log(),
        );
    }

    let attempt = |index: usize| -> OptimizerResult<(Layout, OptimizationReport)> {
        let mut layout = Layout::new(stress.number_of_points(), stress.number_of_dimensions());
        randomizer.fill(&mut layout);
        let report = optimize(method, stress, &mut layout, precision)?;
        debug!("attempt {index}: final stress {:.6e}", report.final_stress);
        Ok((layout, report))
    };

    #[cfg(feature = "parallel")]
    let results: Vec<OptimizerResult<(Layout, OptimizationReport)>> = if threads == 0 {
        (0..attempts).into_par_iter().map(attempt).collect()
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| {
                OptimizerError::InvalidParameters("cannot build thread pool".to_string())
                    .log_with_source(e)
            })?;
        pool.install(|| (0..attempts).into_par_iter().map(attempt).collect())
    };

    #[cfg(not(feature = "parallel"))]
    let results: Vec<OptimizerResult<(Layout, OptimizationReport)>> = {
        let _ = threads;
        (0..attempts).map(attempt).collect()
    };

    let mut best: Option<(Layout, OptimizationReport)> = None;
    for result in results {
        match result {
            Ok((layout, report)) => {
                let better = best
                    .as_ref()
                    .is_none_or(|(_, current)| report.final_stress < current.final_stress);
                if better {
                    best = Some((layout, report));
                }
            }
            Err(e) => warn!("discarding failed optimization attempt: {e}"),
        }
    }
    best.ok_or_else(|| OptimizerError::AllAttemptsFailed { attempts }.log())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stress::StressParameters;
    use crate::table::{Entry, TableDistances};

    fn line_stress(dims: usize) -> Stress {
        // Two points a unit apart
        let distances = TableDistances::from_entries(
            2,
            vec![Entry {
                point_1: 0,
                point_2: 1,
                distance: 1.0,
            }],
            Vec::new(),
        );
        Stress::from_table_distances(distances, StressParameters::default(), dims)
    }

    #[test]
    fn test_method_and_precision_parsing() {
        assert_eq!(
            "lbfgs".parse::<OptimizationMethod>().unwrap(),
            OptimizationMethod::LbfgsQuasiNewton
        );
        assert_eq!(
            "de".parse::<OptimizationMethod>().unwrap(),
            OptimizationMethod::DifferentialEvolution
        );
        assert!("newton".parse::<OptimizationMethod>().is_err());
        assert_eq!(
            "rough".parse::<OptimizationPrecision>().unwrap(),
            OptimizationPrecision::Rough
        );
        assert!("ultra".parse::<OptimizationPrecision>().is_err());
    }

    #[test]
    fn test_dimension_mismatch_is_rejected_eagerly() {
        let stress = line_stress(2);
        let mut layout = Layout::from_vec(2, 3, vec![0.0; 6]);
        let result = optimize(
            OptimizationMethod::LbfgsQuasiNewton,
            &stress,
            &mut layout,
            OptimizationPrecision::Rough,
        );
        assert!(matches!(result, Err(OptimizerError::InvalidParameters(_))));
    }

    #[test]
    fn test_out_of_range_pinned_points_are_rejected_eagerly() {
        let distances = TableDistances::from_entries(
            2,
            vec![Entry {
                point_1: 0,
                point_2: 1,
                distance: 1.0,
            }],
            Vec::new(),
        );
        for parameters in [
            StressParameters {
                unmovable: vec![5],
                ..StressParameters::default()
            },
            StressParameters {
                unmovable_in_the_last_dimension: vec![2],
                ..StressParameters::default()
            },
        ] {
            let stress = Stress::from_table_distances(distances.clone(), parameters, 2);
            let mut layout = Layout::from_vec(2, 2, vec![0.0, 0.0, 0.3, 0.2]);
            let result = optimize(
                OptimizationMethod::LbfgsQuasiNewton,
                &stress,
                &mut layout,
                OptimizationPrecision::Rough,
            );
            assert!(matches!(result, Err(OptimizerError::InvalidParameters(_))));
        }
    }

    #[test]
    fn test_annealing_rejects_gradient_free_method() {
        let mut stress = line_stress(5);
        let mut layout = Layout::from_vec(2, 5, vec![0.0; 10]);
        let result = optimize_with_dimension_annealing(
            OptimizationMethod::DifferentialEvolution,
            &mut stress,
            &mut layout,
            &[5, 2],
            OptimizationPrecision::Rough,
        );
        assert!(matches!(
            result,
            Err(OptimizerError::AnnealingUnsupported { .. })
        ));
    }

    #[test]
    fn test_annealing_rejects_bad_schedules() {
        let mut stress = line_stress(5);
        let mut layout = Layout::from_vec(2, 5, vec![0.0; 10]);
        for schedule in [&[][..], &[3, 2][..], &[5, 5][..], &[5, 2, 3][..], &[5, 0][..]] {
            let result = optimize_with_dimension_annealing(
                OptimizationMethod::LbfgsQuasiNewton,
                &mut stress,
                &mut layout,
                schedule,
                OptimizationPrecision::Rough,
            );
            assert!(
                matches!(result, Err(OptimizerError::InvalidSchedule(_))),
                "schedule {:?} should be rejected",
                schedule
            );
        }
    }

    #[test]
    fn test_fine_optimization_never_increases_stress() {
        let stress = line_stress(2);
        for start in [
            vec![0.0, 0.0, 0.1, 0.0],
            vec![0.0, 0.0, 5.0, 5.0],
            vec![-1.0, 2.0, 3.0, -4.0],
        ] {
            let mut layout = Layout::from_vec(2, 2, start);
            let report = optimize(
                OptimizationMethod::LbfgsQuasiNewton,
                &stress,
                &mut layout,
                OptimizationPrecision::Fine,
            )
            .unwrap();
            assert!(
                report.final_stress <= report.initial_stress,
                "stress increased: {} -> {}",
                report.initial_stress,
                report.final_stress
            );
            assert!(report.final_stress < 1e-10);
        }
    }

    #[test]
    fn test_all_methods_solve_the_unit_pair() {
        for method in [
            OptimizationMethod::LbfgsQuasiNewton,
            OptimizationMethod::ConjugateGradient,
            OptimizationMethod::Bfgs,
            OptimizationMethod::DifferentialEvolution,
        ] {
            let stress = line_stress(2);
            let mut layout = Layout::from_vec(2, 2, vec![0.0, 0.0, 0.3, 0.2]);
            let report =
                optimize(method, &stress, &mut layout, OptimizationPrecision::Rough).unwrap();
            assert!(
                report.final_stress < 1e-3,
                "{method} left stress at {}",
                report.final_stress
            );
            let distance = layout.distance(0, 1);
            assert!(
                (distance - 1.0).abs() < 0.05,
                "{method}: map distance {distance} should be near 1.0"
            );
        }
    }

    #[test]
    fn test_disconnected_points_stay_nan_through_optimization() {
        let distances = TableDistances::from_entries(
            3,
            vec![Entry {
                point_1: 0,
                point_2: 1,
                distance: 1.0,
            }],
            Vec::new(),
        );
        let parameters = StressParameters {
            disconnected: vec![2],
            ..StressParameters::default()
        };
        let stress = Stress::from_table_distances(distances, parameters, 2);
        let mut layout = Layout::new(3, 2);
        layout.set_point(0, &[0.0, 0.0]);
        layout.set_point(1, &[0.4, 0.1]);
        optimize(
            OptimizationMethod::LbfgsQuasiNewton,
            &stress,
            &mut layout,
            OptimizationPrecision::Fine,
        )
        .unwrap();
        assert!(!layout.point_has_coordinates(2));
        assert!(layout.point_has_coordinates(0));
    }
}
