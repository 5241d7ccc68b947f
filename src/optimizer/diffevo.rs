//! Differential evolution backend (DE/rand/1/bin).
//!
//! Gradient-free global search. Far slower than the quasi-Newton backends
//! but immune to the local minima a bad starting layout can trap them in,
//! so it serves as the fallback for small, badly-conditioned tables. The
//! caller's buffer seeds one population member; the rest are jittered
//! copies scaled by the coordinate spread of the starting layout.

use crate::observers::OptObserverVec;
use crate::optimizer::{
    BackendOutcome, Minimizer, OptimizationMethod, OptimizerError, OptimizerResult, Termination,
    Tolerances,
};
use crate::stress::Stress;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DIFFERENTIAL_WEIGHT: f64 = 0.8;
const CROSSOVER_RATE: f64 = 0.9;

pub struct DifferentialEvolution {
    pub seed: Option<u64>,
}

impl Default for DifferentialEvolution {
    fn default() -> Self {
        Self { seed: None }
    }
}

impl DifferentialEvolution {
    fn population_size(n: usize) -> usize {
        (10 * n).min(100).max(15)
    }

    /// Coordinates that must not move: fully unmovable points, disconnected
    /// points (zero-masked by the dispatcher), and the last dimension of
    /// points pinned there. Gradient backends get this for free from zeroed
    /// gradient rows; mutation has to respect it explicitly.
    fn pinned_coordinates(stress: &Stress) -> Vec<bool> {
        let dims = stress.number_of_dimensions();
        let mut pinned = vec![false; stress.number_of_points() * dims];
        let parameters = stress.parameters();
        for &point in parameters
            .unmovable
            .iter()
            .chain(parameters.disconnected.iter())
        {
            for d in 0..dims {
                pinned[point * dims + d] = true;
            }
        }
        for &point in &parameters.unmovable_in_the_last_dimension {
            pinned[point * dims + dims - 1] = true;
        }
        pinned
    }
}

impl Minimizer for DifferentialEvolution {
    fn minimize(
        &self,
        stress: &Stress,
        x: &mut [f64],
        tolerances: &Tolerances,
        observers: &OptObserverVec,
    ) -> OptimizerResult<BackendOutcome> {
        const METHOD: OptimizationMethod = OptimizationMethod::DifferentialEvolution;
        let n = x.len();
        let np = Self::population_size(n);
        let max_generations = tolerances.max_iterations.unwrap_or(usize::MAX);
        let pinned = Self::pinned_coordinates(stress);

        let seed_value = stress.value_of_buffer(x);
        if !seed_value.is_finite() {
            return Err(OptimizerError::NumericalInstability {
                method: METHOD,
                message: format!("stress {seed_value} at the starting layout"),
            }
            .log());
        }

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        // Jitter scale from the coordinate spread of the seed layout, with a
        // floor so a degenerate all-zero start still explores.
        let spread = x
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &c| {
                (lo.min(c), hi.max(c))
            });
        let scale = ((spread.1 - spread.0).abs()).max(1.0);

        let mut population: Vec<Vec<f64>> = Vec::with_capacity(np);
        let mut values: Vec<f64> = Vec::with_capacity(np);
        population.push(x.to_vec());
        values.push(seed_value);
        let mut evaluations = 1usize;
        for _ in 1..np {
            let member: Vec<f64> = x
                .iter()
                .zip(pinned.iter())
                .map(|(&c, &fixed)| {
                    if fixed {
                        c
                    } else {
                        c + scale * rng.gen_range(-0.5..0.5)
                    }
                })
                .collect();
            let value = stress.value_of_buffer(&member);
            evaluations += 1;
            population.push(member);
            values.push(value);
        }

        let mut trial = vec![0.0; n];
        let mut generation = 0usize;
        loop {
            let (best, worst) = values.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
            let best_index = values
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.total_cmp(b))
                .map(|(i, _)| i)
                .unwrap_or(0);

            let done = if (worst - best) / best.abs().max(1.0) < tolerances.cost {
                Some(Termination::PopulationConverged)
            } else if generation >= max_generations {
                Some(Termination::MaxIterationsReached)
            } else {
                None
            };
            if let Some(termination) = done {
                x.copy_from_slice(&population[best_index]);
                return Ok(BackendOutcome {
                    termination,
                    iterations: generation,
                    evaluations,
                });
            }

            for i in 0..np {
                // Three distinct members, none equal to i
                let mut pick = || loop {
                    let j = rng.gen_range(0..np);
                    if j != i {
                        return j;
                    }
                };
                let a = pick();
                let b = loop {
                    let j = pick();
                    if j != a {
                        break j;
                    }
                };
                let c = loop {
                    let j = pick();
                    if j != a && j != b {
                        break j;
                    }
                };

                let forced = rng.gen_range(0..n);
                for k in 0..n {
                    let crossover = k == forced || rng.r#gen::<f64>() < CROSSOVER_RATE;
                    trial[k] = if pinned[k] || !crossover {
                        population[i][k]
                    } else {
                        population[a][k]
                            + DIFFERENTIAL_WEIGHT * (population[b][k] - population[c][k])
                    };
                }
                let trial_value = stress.value_of_buffer(&trial);
                evaluations += 1;
                if trial_value.is_finite() && trial_value <= values[i] {
                    population[i].copy_from_slice(&trial);
                    values[i] = trial_value;
                }
            }

            generation += 1;
            let best_index = values
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.total_cmp(b))
                .map(|(i, _)| i)
                .unwrap_or(0);
            observers.notify(&population[best_index], generation);
        }
    }
}
