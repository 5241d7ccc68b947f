//! Randomized starting layouts for multi-restart optimization.
//!
//! Every strategy keeps its generator behind a `Mutex` so a single
//! randomizer can feed concurrent restart attempts; the lock is held per
//! coordinate batch, never across an optimization.

use crate::layout::Layout;
use crate::optimizer::{
    self, OptimizationMethod, OptimizationPrecision, OptimizerResult,
};
use crate::stress::Stress;
use crate::table::TableDistances;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use tracing::debug;

/// A source of randomized starting layouts.
pub trait LayoutRandomizer: Send + Sync {
    /// Overwrite every coordinate of `layout` with a fresh random sample.
    fn fill(&self, layout: &mut Layout);

    /// Side length of the sampling box.
    fn diameter(&self) -> f64;
}

fn sample_box(rng: &mut StdRng, layout: &mut Layout, diameter: f64) {
    let half = diameter / 2.0;
    for coordinate in layout.as_mut_slice() {
        *coordinate = (rng.r#gen::<f64>() - 0.5) * 2.0 * half;
    }
}

/// Uniform sampling in a box sized from the largest table distance. The
/// usual strategy for the first relaxation of a table, when no layout
/// exists yet to calibrate from.
pub struct TableMaxDistance {
    diameter: f64,
    rng: Mutex<StdRng>,
}

impl TableMaxDistance {
    pub fn new(table_distances: &TableDistances, multiplier: f64) -> Self {
        Self {
            diameter: table_distances.max_distance() * multiplier,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(table_distances: &TableDistances, multiplier: f64, seed: u64) -> Self {
        Self {
            diameter: table_distances.max_distance() * multiplier,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Sample from a box of an explicit side length, typically one
    /// calibrated by [`bootstrap_diameter`].
    pub fn with_diameter(diameter: f64) -> Self {
        Self {
            diameter,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_diameter_seeded(diameter: f64, seed: u64) -> Self {
        Self {
            diameter,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl LayoutRandomizer for TableMaxDistance {
    fn fill(&self, layout: &mut Layout) {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        sample_box(&mut rng, layout, self.diameter);
    }

    fn diameter(&self) -> f64 {
        self.diameter
    }
}

/// Uniform sampling in a box sized from the bounding diameter of an
/// existing layout. Used when re-randomizing around a known solution,
/// where the table-distance box would be needlessly large.
pub struct CurrentLayoutArea {
    diameter: f64,
    rng: Mutex<StdRng>,
}

impl CurrentLayoutArea {
    pub fn new(layout: &Layout, multiplier: f64) -> Self {
        Self {
            diameter: layout.bounding_diameter() * multiplier,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(layout: &Layout, multiplier: f64, seed: u64) -> Self {
        Self {
            diameter: layout.bounding_diameter() * multiplier,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl LayoutRandomizer for CurrentLayoutArea {
    fn fill(&self, layout: &mut Layout) {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        sample_box(&mut rng, layout, self.diameter);
    }

    fn diameter(&self) -> f64 {
        self.diameter
    }
}

/// Calibrate a sampling diameter for a table: fill a throwaway layout from
/// the table-distance box, relax it once at very rough precision, and
/// measure the bounding diameter of the result. Feed the returned value to
/// [`TableMaxDistance::with_diameter`] for the real attempts.
pub fn bootstrap_diameter(stress: &Stress, multiplier: f64) -> OptimizerResult<f64> {
    let randomizer = TableMaxDistance::new(stress.table_distances(), 1.0);
    let mut layout = Layout::new(stress.number_of_points(), stress.number_of_dimensions());
    randomizer.fill(&mut layout);
    optimizer::optimize(
        OptimizationMethod::LbfgsQuasiNewton,
        stress,
        &mut layout,
        OptimizationPrecision::VeryRough,
    )?;
    let diameter = layout.bounding_diameter() * multiplier;
    debug!("bootstrapped sampling diameter {diameter:.3}");
    Ok(diameter)
}

/// A line in the plane, given by a point on it and a unit normal. Samples on
/// the negative side of the normal get mirrored across.
#[derive(Debug, Clone, Copy)]
pub struct Line2d {
    pub point: [f64; 2],
    normal: [f64; 2],
}

impl Line2d {
    /// Build from a point on the line and a (not necessarily unit) normal.
    pub fn new(point: [f64; 2], normal: [f64; 2]) -> Self {
        let length = (normal[0] * normal[0] + normal[1] * normal[1]).sqrt();
        Self {
            point,
            normal: [normal[0] / length, normal[1] / length],
        }
    }

    fn signed_distance(&self, x: f64, y: f64) -> f64 {
        (x - self.point[0]) * self.normal[0] + (y - self.point[1]) * self.normal[1]
    }

    fn mirror(&self, x: f64, y: f64) -> (f64, f64) {
        let d = self.signed_distance(x, y);
        (x - 2.0 * d * self.normal[0], y - 2.0 * d * self.normal[1])
    }
}

/// [`CurrentLayoutArea`] sampling restricted to one side of a line; samples
/// landing on the wrong side are mirrored across it. Two-dimensional layouts
/// only.
pub struct LineBordered {
    area: CurrentLayoutArea,
    line: Line2d,
}

impl LineBordered {
    pub fn new(layout: &Layout, multiplier: f64, line: Line2d) -> Self {
        Self {
            area: CurrentLayoutArea::new(layout, multiplier),
            line,
        }
    }

    pub fn seeded(layout: &Layout, multiplier: f64, line: Line2d, seed: u64) -> Self {
        Self {
            area: CurrentLayoutArea::seeded(layout, multiplier, seed),
            line,
        }
    }
}

impl LayoutRandomizer for LineBordered {
    fn fill(&self, layout: &mut Layout) {
        assert_eq!(
            layout.number_of_dimensions(),
            2,
            "line-bordered sampling is two-dimensional"
        );
        self.area.fill(layout);
        for point in 0..layout.number_of_points() {
            let &[x, y] = layout.point(point) else {
                continue;
            };
            if self.line.signed_distance(x, y) < 0.0 {
                let (mx, my) = self.line.mirror(x, y);
                layout.set_point(point, &[mx, my]);
            }
        }
    }

    fn diameter(&self) -> f64 {
        self.area.diameter()
    }
}
