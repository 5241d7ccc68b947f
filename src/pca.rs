//! Principal component analysis over layouts.
//!
//! Two uses: projecting a relaxed high-dimensional layout down to the next
//! dimension count of an annealing schedule, and rotating a finished layout
//! onto its principal axes so the widest spread runs along the first axis.
//! Both operate on the connected points only; disconnected points come out
//! with no coordinates at the new dimensionality.

use crate::layout::Layout;
use nalgebra::{DMatrix, SVD};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Clone, Error)]
pub enum PcaError {
    /// SVD iteration failed to converge on the centered coordinate matrix
    #[error("SVD did not converge on a {rows}x{columns} coordinate matrix")]
    SvdDidNotConverge { rows: usize, columns: usize },

    /// Target dimensionality is zero or exceeds the layout's
    #[error("Cannot project a {current}-dimensional layout to {target} dimensions")]
    InvalidDimensions { current: usize, target: usize },

    /// Not enough connected points to define the requested principal axes
    #[error("PCA onto {target} axes needs at least {target} connected points, found {found}")]
    TooFewPoints { target: usize, found: usize },
}

impl PcaError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Project `layout` onto its first `target` principal axes. Points listed in
/// `disconnected` (and any point without coordinates) are excluded from the
/// decomposition and have no coordinates in the result.
pub fn reduce_dimensionality(
    layout: &Layout,
    target: usize,
    disconnected: &[usize],
) -> Result<Layout, PcaError> {
    let dims = layout.number_of_dimensions();
    if target == 0 || target > dims {
        return Err(PcaError::InvalidDimensions {
            current: dims,
            target,
        }
        .log());
    }

    let connected: Vec<usize> = (0..layout.number_of_points())
        .filter(|point| !disconnected.contains(point) && layout.point_has_coordinates(*point))
        .collect();
    // The thin SVD only yields min(points, dims) right singular vectors
    if connected.len() < target.max(2) {
        return Err(PcaError::TooFewPoints {
            target,
            found: connected.len(),
        }
        .log());
    }

    // Center the connected coordinates, then take the right singular vectors
    // of the centered matrix as the principal axes.
    let mut centroid = vec![0.0; dims];
    for &point in &connected {
        for (c, coordinate) in centroid.iter_mut().zip(layout.point(point)) {
            *c += coordinate;
        }
    }
    for c in centroid.iter_mut() {
        *c /= connected.len() as f64;
    }

    let centered = DMatrix::from_fn(connected.len(), dims, |row, column| {
        layout.point(connected[row])[column] - centroid[column]
    });
    let svd = SVD::try_new(centered.clone(), false, true, f64::EPSILON, 0).ok_or_else(|| {
        PcaError::SvdDidNotConverge {
            rows: connected.len(),
            columns: dims,
        }
        .log()
    })?;
    let v_t = svd.v_t.ok_or_else(|| {
        PcaError::SvdDidNotConverge {
            rows: connected.len(),
            columns: dims,
        }
        .log()
    })?;
    let projected = centered * v_t.rows(0, target).transpose();

    let mut reduced = Layout::new(layout.number_of_points(), target);
    for (row, &point) in connected.iter().enumerate() {
        let coordinates: Vec<f64> = (0..target).map(|d| projected[(row, d)]).collect();
        reduced.set_point(point, &coordinates);
    }
    Ok(reduced)
}

/// Rotate `layout` onto its principal axes without changing dimensionality,
/// so the first axis carries the widest spread. Map distances are preserved.
pub fn rebase(layout: &Layout, disconnected: &[usize]) -> Result<Layout, PcaError> {
    reduce_dimensionality(layout, layout.number_of_dimensions(), disconnected)
}
