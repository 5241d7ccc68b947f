//! Target distances derived from a titer table.
//!
//! A titer table has antigens in rows and sera in columns. Each serum carries
//! a column basis, the maximum achievable similarity for that serum, and the
//! target distance for a cell is `column_basis - titer.logged() - avidity`.
//! Distances are routed into two buckets because the stress objective treats
//! them with different loss shapes:
//!
//! - `regular`: exact measurements, penalized symmetrically
//! - `less_than`: censored measurements, penalized one-sidedly
//!
//! More-than, invalid and don't-care titers are dropped entirely; they
//! provide no usable distance constraint in this model.

use crate::titer::Titer;
use thiserror::Error;
use tracing::error;

/// Errors from table and distance construction.
#[derive(Debug, Clone, Error)]
pub enum TableError {
    /// Table shape does not match the provided data
    #[error("Table dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Column bases inconsistent with the table
    #[error("Column bases error: {0}")]
    ColumnBases(String),

    /// Avidity adjusts inconsistent with the table
    #[error("Avidity adjusts error: {0}")]
    AvidityAdjusts(String),
}

impl TableError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Result type for table operations
pub type TableResult<T> = Result<T, TableError>;

/// Dense antigen-by-serum titer table.
#[derive(Debug, Clone)]
pub struct TiterTable {
    number_of_antigens: usize,
    number_of_sera: usize,
    titers: Vec<Titer>,
}

impl TiterTable {
    /// Create a table with every cell set to don't-care.
    pub fn new(number_of_antigens: usize, number_of_sera: usize) -> Self {
        Self {
            number_of_antigens,
            number_of_sera,
            titers: vec![Titer::DontCare; number_of_antigens * number_of_sera],
        }
    }

    /// Build a table from rows of titer strings, one row per antigen.
    pub fn from_rows(rows: &[&[&str]]) -> TableResult<Self> {
        let number_of_antigens = rows.len();
        let number_of_sera = rows.first().map_or(0, |row| row.len());
        let mut table = Self::new(number_of_antigens, number_of_sera);
        for (antigen, row) in rows.iter().enumerate() {
            if row.len() != number_of_sera {
                return Err(TableError::DimensionMismatch(format!(
                    "row {} has {} titers, expected {}",
                    antigen,
                    row.len(),
                    number_of_sera
                ))
                .log());
            }
            for (serum, source) in row.iter().enumerate() {
                table.set(antigen, serum, Titer::from(*source));
            }
        }
        Ok(table)
    }

    pub fn set(&mut self, antigen: usize, serum: usize, titer: Titer) {
        self.titers[antigen * self.number_of_sera + serum] = titer;
    }

    pub fn titer(&self, antigen: usize, serum: usize) -> Titer {
        self.titers[antigen * self.number_of_sera + serum]
    }

    pub fn number_of_antigens(&self) -> usize {
        self.number_of_antigens
    }

    pub fn number_of_sera(&self) -> usize {
        self.number_of_sera
    }

    /// Total point count: antigens followed by sera in the layout indexing.
    pub fn number_of_points(&self) -> usize {
        self.number_of_antigens + self.number_of_sera
    }
}

/// Per-serum ceiling used to convert titers into target distances.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnBases {
    bases: Vec<f64>,
}

impl ColumnBases {
    /// Explicit column bases, one logged value per serum.
    pub fn new(bases: Vec<f64>) -> Self {
        Self { bases }
    }

    /// Compute column bases from the table: the maximum logged titer of each
    /// serum, clamped below by `minimum_column_basis` (itself a logged value,
    /// e.g. 7.0 for a minimum basis titer of 1280). A serum with no numeric
    /// titer at all has no basis; that is an error unless a minimum is given.
    pub fn from_table(
        table: &TiterTable,
        minimum_column_basis: Option<f64>,
    ) -> TableResult<Self> {
        let minimum = minimum_column_basis.unwrap_or(f64::NEG_INFINITY);
        let bases = (0..table.number_of_sera())
            .map(|serum| {
                let max_logged = (0..table.number_of_antigens())
                    .map(|antigen| table.titer(antigen, serum))
                    .filter(Titer::is_set)
                    .map(|titer| titer.logged())
                    .fold(f64::NEG_INFINITY, f64::max);
                let basis = max_logged.max(minimum);
                if basis.is_finite() {
                    Ok(basis)
                } else {
                    Err(TableError::ColumnBases(format!(
                        "serum {serum} has no numeric titer and no minimum column basis"
                    ))
                    .log())
                }
            })
            .collect::<TableResult<Vec<f64>>>()?;
        Ok(Self { bases })
    }

    pub fn basis(&self, serum: usize) -> f64 {
        self.bases[serum]
    }

    pub fn number_of_sera(&self) -> usize {
        self.bases.len()
    }
}

/// Per-antigen log-scale reactivity corrections. Empty means no adjustment.
#[derive(Debug, Clone, Default)]
pub struct AvidityAdjusts {
    adjusts: Vec<f64>,
}

impl AvidityAdjusts {
    pub fn new(adjusts: Vec<f64>) -> Self {
        Self { adjusts }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.adjusts.is_empty()
    }

    /// Adjustment for one antigen; 0.0 when no adjusts are configured.
    pub fn adjust(&self, antigen: usize) -> f64 {
        if self.adjusts.is_empty() {
            0.0
        } else {
            self.adjusts[antigen]
        }
    }
}

/// Which loss bucket a target distance belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceKind {
    Regular,
    LessThan,
}

/// One titer converted to a signed target distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TiterDistance {
    pub kind: DistanceKind,
    pub distance: f64,
}

impl TiterDistance {
    /// Convert a titer into a target distance, or `None` when the titer
    /// carries no usable constraint (more-than, don't-care, invalid, or
    /// dodgy under the default policy).
    pub fn new(
        titer: Titer,
        column_basis: f64,
        avidity_adjust: f64,
        dodgy_titer_is_regular: bool,
        avoid_negative: bool,
    ) -> Option<Self> {
        let kind = match titer {
            Titer::Regular(_) => DistanceKind::Regular,
            Titer::LessThan(_) => DistanceKind::LessThan,
            Titer::Dodgy(_) if dodgy_titer_is_regular => DistanceKind::Regular,
            _ => return None,
        };
        let mut distance = column_basis - titer.logged() - avidity_adjust;
        if avoid_negative && distance < 0.0 {
            // Titers above the serum's own ceiling are saturated
            distance = 0.0;
        }
        Some(Self { kind, distance })
    }
}

/// `(point_1, point_2, distance)`: one target-distance constraint between an
/// antigen point and a serum point (serum indices offset by antigen count).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entry {
    pub point_1: usize,
    pub point_2: usize,
    pub distance: f64,
}

impl Entry {
    /// The other endpoint of this entry, given one of its points.
    pub fn other_point(&self, point: usize) -> usize {
        if self.point_1 == point {
            self.point_2
        } else {
            self.point_1
        }
    }

    pub fn touches(&self, point: usize) -> bool {
        self.point_1 == point || self.point_2 == point
    }
}

/// Entries touching one point, split by bucket. Used by the per-point stress
/// contribution and by the grid search.
#[derive(Debug, Clone, Default)]
pub struct PointDistances {
    pub regular: Vec<Entry>,
    pub less_than: Vec<Entry>,
}

impl PointDistances {
    pub fn is_empty(&self) -> bool {
        self.regular.is_empty() && self.less_than.is_empty()
    }
}

/// All target distances of a table, bucketed by loss shape.
///
/// Pure data transformation computed once per `Stress` construction; no
/// gradient bookkeeping happens here.
#[derive(Debug, Clone)]
pub struct TableDistances {
    number_of_points: usize,
    regular: Vec<Entry>,
    less_than: Vec<Entry>,
}

impl TableDistances {
    /// Build target distances for every measurable antigen-serum cell.
    ///
    /// Disconnected points contribute no entries. Negative distances clamp
    /// to zero when `avoid_negative` is set.
    pub fn new(
        table: &TiterTable,
        column_bases: &ColumnBases,
        avidity_adjusts: &AvidityAdjusts,
        disconnected: &[usize],
        dodgy_titer_is_regular: bool,
        avoid_negative: bool,
    ) -> TableResult<Self> {
        if column_bases.number_of_sera() != table.number_of_sera() {
            return Err(TableError::ColumnBases(format!(
                "{} column bases for {} sera",
                column_bases.number_of_sera(),
                table.number_of_sera()
            ))
            .log());
        }
        if !avidity_adjusts.is_empty() && avidity_adjusts.adjusts.len() != table.number_of_antigens()
        {
            return Err(TableError::AvidityAdjusts(format!(
                "{} avidity adjusts for {} antigens",
                avidity_adjusts.adjusts.len(),
                table.number_of_antigens()
            ))
            .log());
        }

        let mut regular = Vec::new();
        let mut less_than = Vec::new();
        for antigen in 0..table.number_of_antigens() {
            if disconnected.contains(&antigen) {
                continue;
            }
            for serum in 0..table.number_of_sera() {
                let serum_point = table.number_of_antigens() + serum;
                if disconnected.contains(&serum_point) {
                    continue;
                }
                let converted = TiterDistance::new(
                    table.titer(antigen, serum),
                    column_bases.basis(serum),
                    avidity_adjusts.adjust(antigen),
                    dodgy_titer_is_regular,
                    avoid_negative,
                );
                if let Some(titer_distance) = converted {
                    let entry = Entry {
                        point_1: antigen,
                        point_2: serum_point,
                        distance: titer_distance.distance,
                    };
                    match titer_distance.kind {
                        DistanceKind::Regular => regular.push(entry),
                        DistanceKind::LessThan => less_than.push(entry),
                    }
                }
            }
        }

        Ok(Self {
            number_of_points: table.number_of_points(),
            regular,
            less_than,
        })
    }

    /// Build from precomputed entries. Collaborators that already hold
    /// target distances (and tests with exact geometry) use this instead of
    /// the titer-table path.
    pub fn from_entries(
        number_of_points: usize,
        regular: Vec<Entry>,
        less_than: Vec<Entry>,
    ) -> Self {
        Self {
            number_of_points,
            regular,
            less_than,
        }
    }

    pub fn regular(&self) -> &[Entry] {
        &self.regular
    }

    pub fn less_than(&self) -> &[Entry] {
        &self.less_than
    }

    pub fn number_of_points(&self) -> usize {
        self.number_of_points
    }

    pub fn number_of_entries(&self) -> usize {
        self.regular.len() + self.less_than.len()
    }

    /// Entries touching `point`, collected per bucket.
    pub fn distances_for_point(&self, point: usize) -> PointDistances {
        PointDistances {
            regular: self
                .regular
                .iter()
                .filter(|entry| entry.touches(point))
                .copied()
                .collect(),
            less_than: self
                .less_than
                .iter()
                .filter(|entry| entry.touches(point))
                .copied()
                .collect(),
        }
    }

    /// Largest target distance implied by any titer/column-basis pair.
    /// Drives the table-max-distance randomization strategy.
    pub fn max_distance(&self) -> f64 {
        self.regular
            .iter()
            .chain(self.less_than.iter())
            .map(|entry| entry.distance)
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_3x2() -> TiterTable {
        TiterTable::from_rows(&[&["40", "80"], &["160", "40"], &["20", "320"]]).unwrap()
    }

    #[test]
    fn test_column_bases_from_table() {
        let table = table_3x2();
        let bases = ColumnBases::from_table(&table, None).unwrap();
        // Serum 0 max titer 160 -> log2(16) = 4; serum 1 max 320 -> 5
        assert_eq!(bases.basis(0), 4.0);
        assert_eq!(bases.basis(1), 5.0);

        let clamped = ColumnBases::from_table(&table, Some(7.0)).unwrap();
        assert_eq!(clamped.basis(0), 7.0);
        assert_eq!(clamped.basis(1), 7.0);
    }

    #[test]
    fn test_column_without_numeric_titers_needs_a_minimum_basis() {
        let table = TiterTable::from_rows(&[&["40", "*"], &["160", "*"]]).unwrap();
        assert!(matches!(
            ColumnBases::from_table(&table, None),
            Err(TableError::ColumnBases(_))
        ));
        let bases = ColumnBases::from_table(&table, Some(7.0)).unwrap();
        assert_eq!(bases.basis(1), 7.0);
    }

    #[test]
    fn test_titer_distance_routing() {
        let regular =
            TiterDistance::new(Titer::Regular(40.0), 5.0, 0.0, false, false).unwrap();
        assert_eq!(regular.kind, DistanceKind::Regular);
        assert_eq!(regular.distance, 3.0);

        let censored =
            TiterDistance::new(Titer::LessThan(10.0), 5.0, 0.0, false, false).unwrap();
        assert_eq!(censored.kind, DistanceKind::LessThan);
        assert_eq!(censored.distance, 5.0);

        assert!(TiterDistance::new(Titer::MoreThan(1280.0), 5.0, 0.0, false, false).is_none());
        assert!(TiterDistance::new(Titer::DontCare, 5.0, 0.0, false, false).is_none());
        assert!(TiterDistance::new(Titer::Invalid, 5.0, 0.0, false, false).is_none());
        assert!(TiterDistance::new(Titer::Dodgy(40.0), 5.0, 0.0, false, false).is_none());
        assert!(TiterDistance::new(Titer::Dodgy(40.0), 5.0, 0.0, true, false).is_some());
    }

    #[test]
    fn test_negative_distance_clamping() {
        // Titer above the column basis would give a negative distance
        let unclamped =
            TiterDistance::new(Titer::Regular(320.0), 4.0, 0.0, false, false).unwrap();
        assert_eq!(unclamped.distance, -1.0);

        let clamped = TiterDistance::new(Titer::Regular(320.0), 4.0, 0.0, false, true).unwrap();
        assert_eq!(clamped.distance, 0.0);
    }

    #[test]
    fn test_table_distances_buckets() {
        let table =
            TiterTable::from_rows(&[&["40", "<10"], &["160", "*"], &[">640", "320"]]).unwrap();
        let bases = ColumnBases::from_table(&table, None).unwrap();
        let distances = TableDistances::new(
            &table,
            &bases,
            &AvidityAdjusts::empty(),
            &[],
            false,
            false,
        )
        .unwrap();
        // 3 regular cells (40, 160, 320); one less-than; more-than and
        // don't-care dropped
        assert_eq!(distances.regular().len(), 3);
        assert_eq!(distances.less_than().len(), 1);
        assert_eq!(distances.number_of_points(), 5);
    }

    #[test]
    fn test_disconnected_points_have_no_entries() {
        let table = table_3x2();
        let bases = ColumnBases::from_table(&table, None).unwrap();
        let distances = TableDistances::new(
            &table,
            &bases,
            &AvidityAdjusts::empty(),
            &[1],
            false,
            false,
        )
        .unwrap();
        assert!(distances.regular().iter().all(|entry| !entry.touches(1)));
        assert_eq!(distances.regular().len(), 4);
        assert!(distances.distances_for_point(1).is_empty());
    }

    #[test]
    fn test_distances_for_point() {
        let table = table_3x2();
        let bases = ColumnBases::from_table(&table, None).unwrap();
        let distances = TableDistances::new(
            &table,
            &bases,
            &AvidityAdjusts::empty(),
            &[],
            false,
            false,
        )
        .unwrap();
        // Serum point 3 touches every antigen
        let for_serum = distances.distances_for_point(3);
        assert_eq!(for_serum.regular.len(), 3);
        assert!(for_serum.regular.iter().all(|entry| entry.touches(3)));
        assert_eq!(for_serum.regular[0].other_point(3), 0);
    }

    #[test]
    fn test_avidity_adjust_shifts_distance() {
        let table = table_3x2();
        let bases = ColumnBases::from_table(&table, None).unwrap();
        let adjusted = TableDistances::new(
            &table,
            &bases,
            &AvidityAdjusts::new(vec![1.0, 0.0, 0.0]),
            &[],
            false,
            false,
        )
        .unwrap();
        let plain = TableDistances::new(
            &table,
            &bases,
            &AvidityAdjusts::empty(),
            &[],
            false,
            false,
        )
        .unwrap();
        // Antigen 0 distances shrink by the adjust, others unchanged
        assert_eq!(
            adjusted.regular()[0].distance,
            plain.regular()[0].distance - 1.0
        );
        assert_eq!(adjusted.regular()[2].distance, plain.regular()[2].distance);
    }

    #[test]
    fn test_max_distance() {
        let table = table_3x2();
        let bases = ColumnBases::from_table(&table, None).unwrap();
        let distances = TableDistances::new(
            &table,
            &bases,
            &AvidityAdjusts::empty(),
            &[],
            false,
            false,
        )
        .unwrap();
        // Largest: antigen 2 serum 0 -> 4 - 1 = 3
        assert_eq!(distances.max_distance(), 3.0);
    }
}
