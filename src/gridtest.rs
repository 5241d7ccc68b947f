//! Grid search for points stuck in poor local optima.
//!
//! Relaxation is local: a point can converge into a secondary stress basin
//! and stay there. The grid test perturbs one point at a time over a
//! regular grid spanned by its connected neighbours, evaluating the local
//! stress contribution with everything else held fixed, and classifies the
//! point:
//! - `Trapped`: a grid cell strictly improves the contribution and a full
//!   re-relaxation from there drops the total stress past a threshold.
//! - `Hemisphering`: a distant cell matches the current contribution (a
//!   mirror basin) and survives re-relaxation without a stress penalty.
//!
//! Per-point tests are independent: workers share the original layout and
//! stress read-only and own all scratch they mutate, so any thread count
//! produces identical classifications.

use crate::layout::Layout;
use crate::optimizer::{
    self, OptimizationMethod, OptimizationPrecision, OptimizerError, OptimizerResult,
};
use crate::stress::Stress;
use crate::table::PointDistances;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use std::fmt::{self, Display, Formatter};
use tracing::{debug, warn};

/// Classification of one point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridTestState {
    /// Unmovable or disconnected; never tested
    Excluded,
    /// Test did not complete for this point
    NotTested,
    Normal,
    Trapped,
    Hemisphering,
}

impl Display for GridTestState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            GridTestState::Excluded => write!(f, "excluded"),
            GridTestState::NotTested => write!(f, "not tested"),
            GridTestState::Normal => write!(f, "normal"),
            GridTestState::Trapped => write!(f, "trapped"),
            GridTestState::Hemisphering => write!(f, "hemisphering"),
        }
    }
}

/// Diagnosis of one point.
#[derive(Debug, Clone)]
pub struct GridTestResult {
    pub point: usize,
    pub state: GridTestState,
    /// Candidate replacement position (the original position for points
    /// that are not trapped or hemisphering)
    pub position: Vec<f64>,
    /// Distance from the original position to `position`
    pub distance: f64,
    /// Local contribution improvement at the best grid cell (positive
    /// means the cell beat the original position)
    pub contribution_diff: f64,
}

/// All per-point diagnoses of one run.
#[derive(Debug, Clone)]
pub struct GridTestResults {
    results: Vec<GridTestResult>,
}

impl GridTestResults {
    pub fn results(&self) -> &[GridTestResult] {
        &self.results
    }

    pub fn trapped(&self) -> impl Iterator<Item = &GridTestResult> {
        self.results
            .iter()
            .filter(|r| r.state == GridTestState::Trapped)
    }

    pub fn hemisphering(&self) -> impl Iterator<Item = &GridTestResult> {
        self.results
            .iter()
            .filter(|r| r.state == GridTestState::Hemisphering)
    }

    /// Move every trapped and hemisphering point to its candidate position,
    /// producing the layout a follow-up relaxation should start from.
    pub fn apply_to(&self, layout: &mut Layout) {
        for result in &self.results {
            if matches!(
                result.state,
                GridTestState::Trapped | GridTestState::Hemisphering
            ) {
                layout.set_point(result.point, &result.position);
            }
        }
    }
}

impl Display for GridTestResults {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let trapped = self.trapped().count();
        let hemisphering = self.hemisphering().count();
        if trapped == 0 && hemisphering == 0 {
            write!(f, "nothing found")
        } else {
            write!(f, "trapped:{trapped} hemisphering:{hemisphering}")
        }
    }
}

/// One grid-test run over a relaxed layout.
pub struct GridTest<'a> {
    stress: &'a Stress,
    layout: &'a Layout,
    grid_step: f64,
    hemisphering_distance: f64,
    stress_delta_threshold: f64,
}

impl<'a> GridTest<'a> {
    pub const DEFAULT_GRID_STEP: f64 = 0.1;
    pub const DEFAULT_HEMISPHERING_DISTANCE: f64 = 1.0;
    pub const DEFAULT_STRESS_DELTA_THRESHOLD: f64 = 6.0;

    /// Contribution slack for a distant cell to count as a mirror basin
    const HEMISPHERING_CONTRIBUTION_TOLERANCE: f64 = 0.25;
    /// Strict-improvement guard against float noise
    const IMPROVEMENT_EPSILON: f64 = 1e-8;
    /// Moved distances in this band around the hemisphering distance get a
    /// second, fine re-relaxation before classification
    const AMBIGUOUS_BAND: (f64, f64) = (0.5, 1.5);

    pub fn new(stress: &'a Stress, layout: &'a Layout) -> Self {
        Self {
            stress,
            layout,
            grid_step: Self::DEFAULT_GRID_STEP,
            hemisphering_distance: Self::DEFAULT_HEMISPHERING_DISTANCE,
            stress_delta_threshold: Self::DEFAULT_STRESS_DELTA_THRESHOLD,
        }
    }

    pub fn with_grid_step(mut self, grid_step: f64) -> Self {
        self.grid_step = grid_step;
        self
    }

    pub fn with_thresholds(
        mut self,
        hemisphering_distance: f64,
        stress_delta_threshold: f64,
    ) -> Self {
        self.hemisphering_distance = hemisphering_distance;
        self.stress_delta_threshold = stress_delta_threshold;
        self
    }

    /// Test every point on the global thread pool.
    pub fn run(&self) -> GridTestResults {
        let original_stress = self.stress.value(self.layout);
        let points: Vec<usize> = (0..self.layout.number_of_points()).collect();

        #[cfg(feature = "parallel")]
        let results = points
            .par_iter()
            .map(|&point| self.test_point(point, original_stress))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let results = points
            .iter()
            .map(|&point| self.test_point(point, original_stress))
            .collect();

        let results = GridTestResults { results };
        debug!("grid test: {results}");
        results
    }

    /// [`run`](Self::run) on a scoped pool of `threads` workers; 0 means the
    /// global pool. Classifications are identical for every thread count.
    pub fn run_with_threads(&self, threads: usize) -> OptimizerResult<GridTestResults> {
        #[cfg(feature = "parallel")]
        {
            if threads == 0 {
                return Ok(self.run());
            }
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| {
                    OptimizerError::InvalidParameters("cannot build thread pool".to_string())
                        .log_with_source(e)
                })?;
            Ok(pool.install(|| self.run()))
        }
        #[cfg(not(feature = "parallel"))]
        {
            let _ = threads;
            Ok(self.run())
        }
    }

    fn untested(&self, point: usize, state: GridTestState) -> GridTestResult {
        GridTestResult {
            point,
            state,
            position: self.layout.point(point).to_vec(),
            distance: 0.0,
            contribution_diff: 0.0,
        }
    }

    fn test_point(&self, point: usize, original_stress: f64) -> GridTestResult {
        if self.stress.parameters().point_is_excluded(point)
            || !self.layout.point_has_coordinates(point)
        {
            return self.untested(point, GridTestState::Excluded);
        }
        let distances = self.stress.table_distances().distances_for_point(point);
        if distances.is_empty() {
            return self.untested(point, GridTestState::Excluded);
        }
        let Some(scan) = self.scan_grid(point, &distances) else {
            return self.untested(point, GridTestState::NotTested);
        };

        if let Some((position, contribution_diff)) = scan.improving {
            return self.classify_improving(point, position, contribution_diff, original_stress);
        }
        if let Some(position) = scan.mirror_candidate {
            return self.classify_mirror(point, position, original_stress);
        }
        self.untested(point, GridTestState::Normal)
    }

    /// Evaluate the point's contribution at every cell of the grid spanned
    /// by its connected neighbours.
    fn scan_grid(&self, point: usize, distances: &PointDistances) -> Option<GridScan> {
        let dims = self.layout.number_of_dimensions();
        let mut low = vec![f64::INFINITY; dims];
        let mut high = vec![f64::NEG_INFINITY; dims];
        for entry in distances.regular.iter().chain(distances.less_than.iter()) {
            let neighbour = entry.other_point(point);
            if !self.layout.point_has_coordinates(neighbour) {
                continue;
            }
            let reach = entry.distance + self.grid_step;
            for (d, &coordinate) in self.layout.point(neighbour).iter().enumerate() {
                low[d] = low[d].min(coordinate - reach);
                high[d] = high[d].max(coordinate + reach);
            }
        }
        if low.iter().any(|l| !l.is_finite()) {
            return None;
        }
        let counts: Vec<usize> = low
            .iter()
            .zip(high.iter())
            .map(|(l, h)| ((h - l) / self.grid_step).floor() as usize + 1)
            .collect();

        let original = self.layout.point(point).to_vec();
        let original_contribution = self.stress.contribution(point, distances, self.layout);

        let mut scratch = self.layout.clone();
        let mut cell = vec![0usize; dims];
        let mut position = vec![0.0; dims];
        let mut best: Option<(Vec<f64>, f64)> = None;
        let mut mirror: Option<(Vec<f64>, f64)> = None;
        loop {
            for d in 0..dims {
                position[d] = low[d] + cell[d] as f64 * self.grid_step;
            }
            scratch.set_point(point, &position);
            let contribution = self.stress.contribution(point, distances, &scratch);

            if contribution < original_contribution - Self::IMPROVEMENT_EPSILON
                && best.as_ref().is_none_or(|(_, c)| contribution < *c)
            {
                best = Some((position.clone(), contribution));
            } else if contribution
                <= original_contribution + Self::HEMISPHERING_CONTRIBUTION_TOLERANCE
            {
                let moved = euclidean(&position, &original);
                if moved > self.hemisphering_distance
                    && mirror.as_ref().is_none_or(|(_, c)| contribution < *c)
                {
                    mirror = Some((position.clone(), contribution));
                }
            }

            // odometer advance
            let mut d = 0;
            loop {
                cell[d] += 1;
                if cell[d] < counts[d] {
                    break;
                }
                cell[d] = 0;
                d += 1;
                if d == dims {
                    return Some(GridScan {
                        improving: best
                            .map(|(p, c)| (p, original_contribution - c)),
                        mirror_candidate: mirror.map(|(p, _)| p),
                    });
                }
            }
        }
    }

    /// Substitute the candidate position and re-relax the whole layout at
    /// `precision`. Returns the relaxed layout and the total stress drop.
    fn relax_candidate(
        &self,
        point: usize,
        position: &[f64],
        original_stress: f64,
        precision: OptimizationPrecision,
    ) -> OptimizerResult<(Layout, f64)> {
        let mut candidate = self.layout.clone();
        candidate.set_point(point, position);
        optimizer::optimize(
            OptimizationMethod::LbfgsQuasiNewton,
            self.stress,
            &mut candidate,
            precision,
        )?;
        let drop = original_stress - self.stress.value(&candidate);
        Ok((candidate, drop))
    }

    fn classify_improving(
        &self,
        point: usize,
        position: Vec<f64>,
        contribution_diff: f64,
        original_stress: f64,
    ) -> GridTestResult {
        let (candidate, stress_drop) = match self.relax_candidate(
            point,
            &position,
            original_stress,
            OptimizationPrecision::Rough,
        ) {
            Ok(relaxed) => relaxed,
            Err(e) => {
                warn!("grid test re-relaxation failed for point {point}: {e}");
                return self.untested(point, GridTestState::NotTested);
            }
        };
        let relaxed_position = candidate.point(point).to_vec();
        let moved = euclidean(&relaxed_position, self.layout.point(point));

        let state = if stress_drop > self.stress_delta_threshold {
            GridTestState::Trapped
        } else if moved > self.hemisphering_distance
            && stress_drop.abs() <= self.stress_delta_threshold
        {
            GridTestState::Hemisphering
        } else {
            GridTestState::Normal
        };
        GridTestResult {
            point,
            state,
            position: relaxed_position,
            distance: moved,
            contribution_diff,
        }
    }

    fn classify_mirror(
        &self,
        point: usize,
        position: Vec<f64>,
        original_stress: f64,
    ) -> GridTestResult {
        let relaxed = self.relax_candidate(
            point,
            &position,
            original_stress,
            OptimizationPrecision::Rough,
        );
        let (mut candidate, mut stress_drop) = match relaxed {
            Ok(relaxed) => relaxed,
            Err(e) => {
                warn!("grid test re-relaxation failed for point {point}: {e}");
                return self.untested(point, GridTestState::NotTested);
            }
        };
        let mut moved = euclidean(candidate.point(point), self.layout.point(point));

        // A moved distance near the threshold is inconclusive at rough
        // precision; settle it with a fine relaxation.
        let band = (
            Self::AMBIGUOUS_BAND.0 * self.hemisphering_distance,
            Self::AMBIGUOUS_BAND.1 * self.hemisphering_distance,
        );
        if moved > band.0 && moved < band.1 {
            match self.relax_candidate(
                point,
                &position,
                original_stress,
                OptimizationPrecision::Fine,
            ) {
                Ok((fine, fine_drop)) => {
                    candidate = fine;
                    stress_drop = fine_drop;
                    moved = euclidean(candidate.point(point), self.layout.point(point));
                }
                Err(e) => {
                    warn!("grid test fine re-relaxation failed for point {point}: {e}");
                    return self.untested(point, GridTestState::NotTested);
                }
            }
        }

        let state = if moved > self.hemisphering_distance
            && stress_drop.abs() <= self.stress_delta_threshold
        {
            GridTestState::Hemisphering
        } else {
            GridTestState::Normal
        };
        GridTestResult {
            point,
            state,
            position: candidate.point(point).to_vec(),
            distance: moved,
            contribution_diff: 0.0,
        }
    }
}

struct GridScan {
    /// Best strictly-improving cell and its contribution improvement
    improving: Option<(Vec<f64>, f64)>,
    /// Best distant cell with a near-original contribution
    mirror_candidate: Option<Vec<f64>>,
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
