//! Flat coordinate buffers and the disconnected-point masking guard.
//!
//! A layout is a row-major `points x dimensions` buffer of `f64`. A point
//! with no known position (disconnected, or structurally absent) stores NaN
//! in all its dimensions. The NaN sentinel is load-bearing: consumers must
//! special-case it rather than let it propagate arithmetically, and any code
//! that hands the buffer to a numerical backend must first substitute zeros
//! via [`DisconnectedMask`], which restores the sentinel on every exit path.

use std::ops::{Deref, DerefMut};

/// Row-major `points x dimensions` coordinate buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    number_of_points: usize,
    number_of_dimensions: usize,
    data: Vec<f64>,
}

impl Layout {
    /// Layout with every coordinate set to the NaN "no position" sentinel.
    pub fn new(number_of_points: usize, number_of_dimensions: usize) -> Self {
        Self {
            number_of_points,
            number_of_dimensions,
            data: vec![f64::NAN; number_of_points * number_of_dimensions],
        }
    }

    /// Layout from an existing buffer; length must be
    /// `number_of_points * number_of_dimensions`.
    pub fn from_vec(number_of_points: usize, number_of_dimensions: usize, data: Vec<f64>) -> Self {
        assert_eq!(
            data.len(),
            number_of_points * number_of_dimensions,
            "layout buffer length does not match points x dimensions"
        );
        Self {
            number_of_points,
            number_of_dimensions,
            data,
        }
    }

    pub fn number_of_points(&self) -> usize {
        self.number_of_points
    }

    pub fn number_of_dimensions(&self) -> usize {
        self.number_of_dimensions
    }

    /// Coordinates of one point.
    pub fn point(&self, index: usize) -> &[f64] {
        let offset = index * self.number_of_dimensions;
        &self.data[offset..offset + self.number_of_dimensions]
    }

    pub fn point_mut(&mut self, index: usize) -> &mut [f64] {
        let offset = index * self.number_of_dimensions;
        &mut self.data[offset..offset + self.number_of_dimensions]
    }

    pub fn set_point(&mut self, index: usize, coordinates: &[f64]) {
        self.point_mut(index).copy_from_slice(coordinates);
    }

    /// Whether the point has finite coordinates (is not NaN-masked).
    pub fn point_has_coordinates(&self, index: usize) -> bool {
        self.point(index).iter().all(|c| c.is_finite())
    }

    /// Euclidean distance between two points. NaN when either point has no
    /// coordinates.
    pub fn distance(&self, point_1: usize, point_2: usize) -> f64 {
        self.point(point_1)
            .iter()
            .zip(self.point(point_2))
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt()
    }

    /// Diameter of the axis-aligned bounding box over points with known
    /// coordinates; 0.0 when fewer than two points are placed.
    pub fn bounding_diameter(&self) -> f64 {
        let mut min = vec![f64::INFINITY; self.number_of_dimensions];
        let mut max = vec![f64::NEG_INFINITY; self.number_of_dimensions];
        let mut placed = 0usize;
        for point in 0..self.number_of_points {
            if !self.point_has_coordinates(point) {
                continue;
            }
            placed += 1;
            for (dim, &coordinate) in self.point(point).iter().enumerate() {
                min[dim] = min[dim].min(coordinate);
                max[dim] = max[dim].max(coordinate);
            }
        }
        if placed < 2 {
            return 0.0;
        }
        min.iter()
            .zip(&max)
            .map(|(lo, hi)| (hi - lo) * (hi - lo))
            .sum::<f64>()
            .sqrt()
    }

    /// Coordinates of every point along one dimension, in point order. The
    /// buffer is row-major, so this is a strided walk.
    pub fn dimension_values(&self, dimension: usize) -> impl Iterator<Item = f64> + '_ {
        self.data
            .iter()
            .skip(dimension)
            .step_by(self.number_of_dimensions)
            .copied()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }
}

/// Scoped zero-substitution for disconnected points.
///
/// Backend math cannot tolerate NaN, so every disconnected point's
/// coordinates are set to 0 for the duration of a backend call. Restoration
/// happens in `Drop`, which guarantees the sentinel comes back on normal
/// return and on error propagation alike; manual pre/post calls would leak
/// zeros into the layout whenever the wrapped call fails.
pub struct DisconnectedMask<'a> {
    layout: &'a mut Layout,
    disconnected: Vec<usize>,
}

impl<'a> DisconnectedMask<'a> {
    pub fn new(layout: &'a mut Layout, disconnected: &[usize]) -> Self {
        for &point in disconnected {
            for coordinate in layout.point_mut(point) {
                *coordinate = 0.0;
            }
        }
        Self {
            layout,
            disconnected: disconnected.to_vec(),
        }
    }
}

impl Deref for DisconnectedMask<'_> {
    type Target = Layout;

    fn deref(&self) -> &Layout {
        self.layout
    }
}

impl DerefMut for DisconnectedMask<'_> {
    fn deref_mut(&mut self) -> &mut Layout {
        self.layout
    }
}

impl Drop for DisconnectedMask<'_> {
    fn drop(&mut self) {
        for &point in &self.disconnected {
            for coordinate in self.layout.point_mut(point) {
                *coordinate = f64::NAN;
            }
        }
    }
}
