//! The stress objective and its analytic gradient.
//!
//! Stress measures the mismatch between table-implied target distances and
//! the Euclidean distances of a candidate layout:
//!
//! ```text
//! stress = sum_regular (m - t)^2  +  sum_less_than diff^2 * sigmoid(k*diff)
//! diff   = t - m + 1
//! ```
//!
//! where `m` is the map distance and `t` the target distance. The censored
//! (less-than) term is a one-sided penalty: near zero once the map distance
//! exceeds the threshold, growing smoothly as it falls below. The sigmoid
//! weighting keeps the objective differentiable everywhere, which the
//! first-order backends require.
//!
//! `Stress` is a pure function of an external coordinate buffer: it holds no
//! layout state, so many optimizer iterations can call it without re-deriving
//! table distances.

use crate::layout::Layout;
use crate::table::{
    AvidityAdjusts, ColumnBases, PointDistances, TableDistances, TableResult, TiterTable,
};

/// Steepness of the sigmoid weighting on censored entries. Calibrated
/// against reference numeric outputs; change here only.
pub const SIGMOID_MULTIPLIER: f64 = 10.0;

#[inline]
fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Immutable per-projection movement configuration. Created once per
/// optimization run, never mutated mid-run.
#[derive(Debug, Clone, Default)]
pub struct StressParameters {
    /// Points whose coordinates must not move during optimization
    pub unmovable: Vec<usize>,
    /// Points excluded from distance constraints (NaN coordinates)
    pub disconnected: Vec<usize>,
    /// Points free to move except in the last dimension
    pub unmovable_in_the_last_dimension: Vec<usize>,
    /// Per-antigen reactivity corrections
    pub avidity_adjusts: AvidityAdjusts,
    /// Treat dodgy titers as regular measurements
    pub dodgy_titer_is_regular: bool,
    /// Clamp negative table distances to zero
    pub avoid_negative_table_distance: bool,
}

impl StressParameters {
    pub fn point_is_excluded(&self, point: usize) -> bool {
        self.unmovable.contains(&point) || self.disconnected.contains(&point)
    }
}

/// Stress objective over a table's target distances.
#[derive(Debug, Clone)]
pub struct Stress {
    number_of_dimensions: usize,
    table_distances: TableDistances,
    parameters: StressParameters,
}

impl Stress {
    /// Build the objective from a titer table, deriving target distances
    /// once.
    pub fn new(
        table: &TiterTable,
        column_bases: &ColumnBases,
        parameters: StressParameters,
        number_of_dimensions: usize,
    ) -> TableResult<Self> {
        let table_distances = TableDistances::new(
            table,
            column_bases,
            &parameters.avidity_adjusts,
            &parameters.disconnected,
            parameters.dodgy_titer_is_regular,
            parameters.avoid_negative_table_distance,
        )?;
        Ok(Self {
            number_of_dimensions,
            table_distances,
            parameters,
        })
    }

    /// Build the objective from precomputed target distances.
    pub fn from_table_distances(
        table_distances: TableDistances,
        parameters: StressParameters,
        number_of_dimensions: usize,
    ) -> Self {
        Self {
            number_of_dimensions,
            table_distances,
            parameters,
        }
    }

    pub fn table_distances(&self) -> &TableDistances {
        &self.table_distances
    }

    pub fn parameters(&self) -> &StressParameters {
        &self.parameters
    }

    pub fn number_of_points(&self) -> usize {
        self.table_distances.number_of_points()
    }

    pub fn number_of_dimensions(&self) -> usize {
        self.number_of_dimensions
    }

    /// Change the dimensionality the objective evaluates at. Used by the
    /// annealing pipeline after a PCA reduction.
    pub fn set_number_of_dimensions(&mut self, number_of_dimensions: usize) {
        self.number_of_dimensions = number_of_dimensions;
    }

    #[inline]
    fn map_distance(&self, buffer: &[f64], point_1: usize, point_2: usize) -> f64 {
        let dims = self.number_of_dimensions;
        let a = &buffer[point_1 * dims..(point_1 + 1) * dims];
        let b = &buffer[point_2 * dims..(point_2 + 1) * dims];
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f64>()
            .sqrt()
    }

    #[inline]
    fn regular_term(map_distance: f64, target: f64) -> f64 {
        let residual = map_distance - target;
        residual * residual
    }

    /// Censored penalty: `diff^2 * sigmoid(k * diff)` with
    /// `diff = target - map + 1`. Equivalently the raw hinge multiplied by
    /// `sqrt(sigmoid(k * diff))`, then squared.
    #[inline]
    fn less_than_term(map_distance: f64, target: f64) -> f64 {
        let diff = target - map_distance + 1.0;
        diff * diff * sigmoid(diff * SIGMOID_MULTIPLIER)
    }

    /// Total stress of a coordinate buffer. Entries whose endpoints have no
    /// coordinates contribute nothing.
    pub fn value(&self, layout: &Layout) -> f64 {
        self.value_of_buffer(layout.as_slice())
    }

    pub fn value_of_buffer(&self, buffer: &[f64]) -> f64 {
        let mut sum = 0.0;
        for entry in self.table_distances.regular() {
            let m = self.map_distance(buffer, entry.point_1, entry.point_2);
            if m.is_finite() {
                sum += Self::regular_term(m, entry.distance);
            }
        }
        for entry in self.table_distances.less_than() {
            let m = self.map_distance(buffer, entry.point_1, entry.point_2);
            if m.is_finite() {
                sum += Self::less_than_term(m, entry.distance);
            }
        }
        sum
    }

    /// Partial stress restricted to entries touching one point. The grid
    /// search evaluates candidate moves with this instead of the full
    /// objective.
    pub fn contribution(
        &self,
        point: usize,
        distances: &PointDistances,
        layout: &Layout,
    ) -> f64 {
        debug_assert!(distances
            .regular
            .iter()
            .chain(distances.less_than.iter())
            .all(|entry| entry.touches(point)));
        let buffer = layout.as_slice();
        let mut sum = 0.0;
        for entry in &distances.regular {
            let m = self.map_distance(buffer, entry.point_1, entry.point_2);
            if m.is_finite() {
                sum += Self::regular_term(m, entry.distance);
            }
        }
        for entry in &distances.less_than {
            let m = self.map_distance(buffer, entry.point_1, entry.point_2);
            if m.is_finite() {
                sum += Self::less_than_term(m, entry.distance);
            }
        }
        sum
    }

    /// Analytic gradient with respect to every coordinate, as a flat buffer
    /// parallel to the layout. Each entry scatter-accumulates into exactly
    /// two points. Unmovable points get a zero gradient; so does the last
    /// dimension of points unmovable there.
    pub fn gradient(&self, layout: &Layout) -> Vec<f64> {
        let mut gradient = vec![0.0; layout.as_slice().len()];
        self.gradient_of_buffer(layout.as_slice(), &mut gradient);
        gradient
    }

    pub fn gradient_of_buffer(&self, buffer: &[f64], gradient: &mut [f64]) {
        gradient.fill(0.0);
        let dims = self.number_of_dimensions;

        for entry in self.table_distances.regular() {
            let m = self.map_distance(buffer, entry.point_1, entry.point_2);
            if !m.is_finite() || m <= 0.0 {
                continue;
            }
            // d/dx1 (m - t)^2 = 2 (m - t) (x1 - x2) / m
            let inc = 2.0 * (m - entry.distance) / m;
            for dim in 0..dims {
                let delta = buffer[entry.point_1 * dims + dim] - buffer[entry.point_2 * dims + dim];
                gradient[entry.point_1 * dims + dim] += inc * delta;
                gradient[entry.point_2 * dims + dim] -= inc * delta;
            }
        }

        for entry in self.table_distances.less_than() {
            let m = self.map_distance(buffer, entry.point_1, entry.point_2);
            if !m.is_finite() || m <= 0.0 {
                continue;
            }
            let diff = entry.distance - m + 1.0;
            let s = sigmoid(diff * SIGMOID_MULTIPLIER);
            // d/d(diff) [diff^2 s] = 2 diff s + k diff^2 s (1 - s),
            // and d(diff)/dm = -1
            let d_diff = 2.0 * diff * s + SIGMOID_MULTIPLIER * diff * diff * s * (1.0 - s);
            let inc = -d_diff / m;
            for dim in 0..dims {
                let delta = buffer[entry.point_1 * dims + dim] - buffer[entry.point_2 * dims + dim];
                gradient[entry.point_1 * dims + dim] += inc * delta;
                gradient[entry.point_2 * dims + dim] -= inc * delta;
            }
        }

        for &point in &self.parameters.unmovable {
            gradient[point * dims..(point + 1) * dims].fill(0.0);
        }
        for &point in &self.parameters.unmovable_in_the_last_dimension {
            gradient[point * dims + dims - 1] = 0.0;
        }
    }
}
