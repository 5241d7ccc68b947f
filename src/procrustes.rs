//! Rigid (Procrustes) alignment between two layouts.
//!
//! Independently relaxed layouts of the same table agree only up to
//! rotation, reflection, translation and (optionally) uniform scale.
//! Alignment makes them comparable: the best rigid transform over a list of
//! corresponding point pairs, plus the residual rms that measures how well
//! the two geometries actually agree.
//!
//! The rotation comes from the Kabsch construction: SVD of the
//! cross-covariance of the centered pairs, with the smallest singular
//! direction flipped when needed so the result is a proper rotation.

use crate::layout::Layout;
use nalgebra::{DMatrix, DVector, SVD};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Clone, Error)]
pub enum GeometryError {
    /// The two layouts differ in dimensionality
    #[error("Cannot align a {secondary}-dimensional layout onto a {primary}-dimensional one")]
    DimensionMismatch { primary: usize, secondary: usize },

    /// No usable correspondence pairs
    #[error("Alignment needs at least one common point pair with coordinates in both layouts")]
    EmptyCommonPoints,

    /// SVD iteration failed on the cross-covariance matrix
    #[error("SVD did not converge on the cross-covariance matrix")]
    SvdDidNotConverge,
}

impl GeometryError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

pub type GeometryResult<T> = Result<T, GeometryError>;

/// The transform mapping a secondary layout onto a primary one:
/// `y = scale * rotation * x + translation`.
#[derive(Debug, Clone)]
pub struct ProcrustesData {
    pub rotation: DMatrix<f64>,
    pub scale: f64,
    pub translation: DVector<f64>,
    /// Residual rms over the correspondence pairs after the transform
    pub rms: f64,
}

impl ProcrustesData {
    /// Transform one point.
    pub fn apply(&self, coordinates: &[f64]) -> Vec<f64> {
        let x = DVector::from_column_slice(coordinates);
        let y = self.scale * &self.rotation * x + &self.translation;
        y.iter().copied().collect()
    }

    /// Transform a whole layout. Points without coordinates stay that way.
    pub fn transform(&self, layout: &Layout) -> Layout {
        let mut transformed = Layout::new(layout.number_of_points(), layout.number_of_dimensions());
        for point in 0..layout.number_of_points() {
            if layout.point_has_coordinates(point) {
                transformed.set_point(point, &self.apply(layout.point(point)));
            }
        }
        transformed
    }
}

/// Best rigid transform mapping `secondary` onto `primary` over the given
/// correspondence pairs `(primary_point, secondary_point)`. Pairs where
/// either point has no coordinates are skipped; reflections are never
/// produced. `scaling` additionally fits a uniform scale.
pub fn procrustes(
    primary: &Layout,
    secondary: &Layout,
    common: &[(usize, usize)],
    scaling: bool,
) -> GeometryResult<ProcrustesData> {
    let dims = primary.number_of_dimensions();
    if secondary.number_of_dimensions() != dims {
        return Err(GeometryError::DimensionMismatch {
            primary: dims,
            secondary: secondary.number_of_dimensions(),
        }
        .log());
    }
    let pairs: Vec<(usize, usize)> = common
        .iter()
        .copied()
        .filter(|&(p, s)| primary.point_has_coordinates(p) && secondary.point_has_coordinates(s))
        .collect();
    if pairs.is_empty() {
        return Err(GeometryError::EmptyCommonPoints.log());
    }
    let count = pairs.len() as f64;

    let mut primary_centroid = DVector::zeros(dims);
    let mut secondary_centroid = DVector::zeros(dims);
    for &(p, s) in &pairs {
        primary_centroid += DVector::from_column_slice(primary.point(p));
        secondary_centroid += DVector::from_column_slice(secondary.point(s));
    }
    primary_centroid /= count;
    secondary_centroid /= count;

    // Cross-covariance of the centered pairs
    let mut covariance = DMatrix::zeros(dims, dims);
    let mut secondary_spread = 0.0;
    for &(p, s) in &pairs {
        let dp = DVector::from_column_slice(primary.point(p)) - &primary_centroid;
        let ds = DVector::from_column_slice(secondary.point(s)) - &secondary_centroid;
        secondary_spread += ds.norm_squared();
        covariance += dp * ds.transpose();
    }

    let svd = SVD::try_new(covariance, true, true, f64::EPSILON, 0)
        .ok_or_else(|| GeometryError::SvdDidNotConverge.log())?;
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(GeometryError::SvdDidNotConverge.log()),
    };

    // Proper rotation: flip the weakest singular direction when U V^T
    // would be a reflection
    let mut correction = DVector::from_element(dims, 1.0);
    if (&u * &v_t).determinant() < 0.0 {
        correction[dims - 1] = -1.0;
    }
    let rotation = &u * DMatrix::from_diagonal(&correction) * &v_t;

    let scale = if scaling && secondary_spread > 0.0 {
        svd.singular_values
            .iter()
            .zip(correction.iter())
            .map(|(sigma, c)| sigma * c)
            .sum::<f64>()
            / secondary_spread
    } else {
        1.0
    };

    let translation = &primary_centroid - scale * &rotation * &secondary_centroid;
    let data = ProcrustesData {
        rotation,
        scale,
        translation,
        rms: 0.0,
    };

    let residual: f64 = pairs
        .iter()
        .map(|&(p, s)| {
            data.apply(secondary.point(s))
                .iter()
                .zip(primary.point(p))
                .map(|(y, t)| (y - t) * (y - t))
                .sum::<f64>()
        })
        .sum();
    Ok(ProcrustesData {
        rms: (residual / count).sqrt(),
        ..data
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn triangle() -> Layout {
        Layout::from_vec(3, 2, vec![0.0, 0.0, 3.0, 0.0, 0.0, 4.0])
    }

    fn identity_pairs() -> Vec<(usize, usize)> {
        vec![(0, 0), (1, 1), (2, 2)]
    }

    #[test]
    fn test_self_alignment_is_the_identity() {
        let layout = triangle();
        let data = procrustes(&layout, &layout, &identity_pairs(), false).unwrap();
        assert_relative_eq!(data.rms, 0.0, epsilon = 1e-10);
        assert_relative_eq!(data.scale, 1.0);
        for point in 0..3 {
            let mapped = data.apply(layout.point(point));
            for (m, o) in mapped.iter().zip(layout.point(point)) {
                assert_relative_eq!(m, o, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_recovers_a_rotation_and_translation() {
        let primary = triangle();
        let (sin, cos) = 0.7_f64.sin_cos();
        let mut secondary = Layout::new(3, 2);
        for point in 0..3 {
            let &[x, y] = primary.point(point) else {
                unreachable!()
            };
            secondary.set_point(point, &[cos * x + sin * y + 5.0, -sin * x + cos * y - 2.0]);
        }
        let data = procrustes(&primary, &secondary, &identity_pairs(), false).unwrap();
        assert_relative_eq!(data.rms, 0.0, epsilon = 1e-9);
        assert_relative_eq!(data.rotation.determinant(), 1.0, epsilon = 1e-10);

        let aligned = data.transform(&secondary);
        for point in 0..3 {
            assert_relative_eq!(
                aligned.distance(point, (point + 1) % 3),
                primary.distance(point, (point + 1) % 3),
                epsilon = 1e-9
            );
            for (a, p) in aligned.point(point).iter().zip(primary.point(point)) {
                assert_relative_eq!(a, p, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_reflected_layout_aligns_with_a_proper_rotation() {
        let primary = triangle();
        let mut secondary = Layout::new(3, 2);
        for point in 0..3 {
            let &[x, y] = primary.point(point) else {
                unreachable!()
            };
            secondary.set_point(point, &[-x, y]);
        }
        let data = procrustes(&primary, &secondary, &identity_pairs(), false).unwrap();
        assert_relative_eq!(data.rotation.determinant(), 1.0, epsilon = 1e-10);
        // A proper rotation cannot undo a reflection of a scalene triangle
        assert!(data.rms > 0.1);
    }

    #[test]
    fn test_uniform_scale_is_recovered() {
        let primary = triangle();
        let mut secondary = Layout::new(3, 2);
        for point in 0..3 {
            let scaled: Vec<f64> = primary.point(point).iter().map(|c| c / 2.0).collect();
            secondary.set_point(point, &scaled);
        }
        let data = procrustes(&primary, &secondary, &identity_pairs(), true).unwrap();
        assert_relative_eq!(data.scale, 2.0, epsilon = 1e-10);
        assert_relative_eq!(data.rms, 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_degenerate_input_is_rejected() {
        let primary = triangle();
        let secondary_3d = Layout::from_vec(3, 3, vec![0.0; 9]);
        assert!(matches!(
            procrustes(&primary, &secondary_3d, &identity_pairs(), false),
            Err(GeometryError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            procrustes(&primary, &triangle(), &[], false),
            Err(GeometryError::EmptyCommonPoints)
        ));
        // Pairs naming points without coordinates are skipped
        let empty = Layout::new(3, 2);
        assert!(matches!(
            procrustes(&primary, &empty, &identity_pairs(), false),
            Err(GeometryError::EmptyCommonPoints)
        ));
    }

    #[test]
    fn test_points_without_coordinates_stay_that_way() {
        let primary = triangle();
        let mut secondary = Layout::new(4, 2);
        for point in 0..3 {
            secondary.set_point(point, primary.point(point));
        }
        let data = procrustes(&primary, &secondary, &identity_pairs(), false).unwrap();
        let transformed = data.transform(&secondary);
        assert!(!transformed.point_has_coordinates(3));
    }
}
