//! Integration tests for seromap
//!
//! End-to-end coverage of the relaxation pipeline: titer table in, target
//! distances out, backend relaxation, dimension annealing, multi-restart,
//! grid-test diagnosis, and Procrustes alignment.
//!
//! The reference scenario is a 3-antigen, 2-serum table whose titers imply
//! an exactly realizable one-dimensional geometry (antigens at x = 0, 1, 3
//! and sera at x = 2, 6 with column basis 7), so the expected optimum is
//! known in closed form.

use seromap::gridtest::{GridTest, GridTestState};
use seromap::layout::Layout;
use seromap::observers::{LayoutRecorder, OptObserverVec};
use seromap::optimizer::{self, OptimizationMethod, OptimizationPrecision, Termination};
use seromap::procrustes::procrustes;
use seromap::randomizer::TableMaxDistance;
use seromap::stress::{Stress, StressParameters};
use seromap::table::{ColumnBases, Entry, TableDistances, TiterTable};
use seromap::{SeromapResult, pca};
use std::sync::Arc;

/// Column basis 7 (titer 1280); titers chosen so the target distances are
/// A0-S0=2, A1-S0=1, A2-S0=1, A0-S1=6, A1-S1=5, A2-S1=3.
fn reference_table() -> SeromapResult<Stress> {
    let table = TiterTable::from_rows(&[&["320", "20"], &["640", "40"], &["640", "160"]])?;
    let column_bases = ColumnBases::from_table(&table, Some(7.0)).unwrap();
    let stress = Stress::new(&table, &column_bases, StressParameters::default(), 2)?;
    Ok(stress)
}

/// The known optimum of [`reference_table`]: all five points on the x axis.
fn reference_layout() -> Layout {
    Layout::from_vec(
        5,
        2,
        vec![0.0, 0.0, 1.0, 0.0, 3.0, 0.0, 2.0, 0.0, 6.0, 0.0],
    )
}

#[test]
fn test_reference_scenario_relaxes_below_tolerance() {
    let stress = reference_table().unwrap();
    let mut layout = reference_layout();
    let report = optimizer::optimize(
        OptimizationMethod::LbfgsQuasiNewton,
        &stress,
        &mut layout,
        OptimizationPrecision::Fine,
    )
    .unwrap();
    assert!(
        report.final_stress < 1e-6,
        "final stress {} should be below 1e-6",
        report.final_stress
    );
    assert!(matches!(
        report.termination,
        Termination::GradientToleranceReached
            | Termination::StepToleranceReached
            | Termination::CostToleranceReached
    ));
}

#[test]
fn test_reference_scenario_grid_test_is_all_normal() {
    let stress = reference_table().unwrap();
    let layout = reference_layout();
    let results = GridTest::new(&stress, &layout).with_grid_step(1.0).run();
    for result in results.results() {
        assert_eq!(
            result.state,
            GridTestState::Normal,
            "point {} came out {}",
            result.point,
            result.state
        );
    }
    assert_eq!(results.to_string(), "nothing found");
}

#[test]
fn test_grid_test_classifications_match_across_thread_counts() {
    let stress = reference_table().unwrap();
    let mut layout = reference_layout();
    // Misplace a serum to give the test something to find
    layout.set_point(4, &[-6.0, 4.0]);
    let grid_test = GridTest::new(&stress, &layout);
    let sequential = grid_test.run_with_threads(1).unwrap();
    let parallel = grid_test.run_with_threads(4).unwrap();
    for (a, b) in sequential.results().iter().zip(parallel.results()) {
        assert_eq!(a.state, b.state, "point {} diverged", a.point);
        assert_eq!(a.position, b.position);
    }
}

#[test]
fn test_dimension_annealing_reaches_the_plane() {
    let table = TiterTable::from_rows(&[&["320", "20"], &["640", "40"], &["640", "160"]]).unwrap();
    let column_bases = ColumnBases::from_table(&table, Some(7.0)).unwrap();
    let mut stress = Stress::new(&table, &column_bases, StressParameters::default(), 5).unwrap();

    // Start from the known line solution lifted into 5 dimensions with a
    // small perturbation in the extra axes
    let xs = [0.0, 1.0, 3.0, 2.0, 6.0];
    let mut data = Vec::new();
    for (point, &x) in xs.iter().enumerate() {
        let wobble = 0.05 * (point as f64 + 1.0);
        data.extend_from_slice(&[x, wobble, -wobble, wobble / 2.0, 0.0]);
    }
    let mut layout = Layout::from_vec(5, 5, data);

    let report = optimizer::optimize_with_dimension_annealing(
        OptimizationMethod::LbfgsQuasiNewton,
        &mut stress,
        &mut layout,
        &[5, 3, 2],
        OptimizationPrecision::Fine,
    )
    .unwrap();
    assert_eq!(layout.number_of_dimensions(), 2);
    assert!(
        report.final_stress < 1e-6,
        "annealed stress {}",
        report.final_stress
    );
    assert!((layout.distance(0, 3) - 2.0).abs() < 1e-3);
    assert!((layout.distance(2, 4) - 3.0).abs() < 1e-3);
}

#[test]
fn test_multi_start_finds_the_global_basin() {
    let stress = reference_table().unwrap();
    let randomizer = TableMaxDistance::seeded(stress.table_distances(), 2.0, 20260823);
    let (layout, report) = optimizer::optimize_multi_start(
        OptimizationMethod::LbfgsQuasiNewton,
        &stress,
        &randomizer,
        8,
        OptimizationPrecision::Fine,
        1,
    )
    .unwrap();
    assert!(
        report.final_stress < 1e-6,
        "best of 8 attempts left stress at {}",
        report.final_stress
    );
    // The relaxed geometry reproduces the table distances up to rigid motion
    assert!((layout.distance(0, 3) - 2.0).abs() < 1e-3);
    assert!((layout.distance(0, 4) - 6.0).abs() < 1e-3);
}

#[test]
fn test_less_than_titers_only_push_points_apart() {
    // Point 2 is measured only as "less than": its map distance must end up
    // at or beyond the censoring threshold, not at it
    let entries = vec![Entry {
        point_1: 0,
        point_2: 1,
        distance: 1.0,
    }];
    let less_than = vec![
        Entry {
            point_1: 0,
            point_2: 2,
            distance: 2.0,
        },
        Entry {
            point_1: 1,
            point_2: 2,
            distance: 2.0,
        },
    ];
    let stress = Stress::from_table_distances(
        TableDistances::from_entries(3, entries, less_than),
        StressParameters::default(),
        2,
    );
    let mut layout = Layout::from_vec(3, 2, vec![0.0, 0.0, 1.0, 0.1, 0.5, 0.5]);
    let report = optimizer::optimize(
        OptimizationMethod::LbfgsQuasiNewton,
        &stress,
        &mut layout,
        OptimizationPrecision::Fine,
    )
    .unwrap();
    assert!(report.final_stress < 0.05);
    assert!(layout.distance(0, 2) > 1.5);
    assert!(layout.distance(1, 2) > 1.5);
    assert!((layout.distance(0, 1) - 1.0).abs() < 0.05);
}

#[test]
fn test_observers_see_every_iteration() {
    let stress = reference_table().unwrap();
    let mut layout = reference_layout();
    layout.set_point(4, &[4.0, 3.0]); // perturb so iterations happen
    let recorder = Arc::new(LayoutRecorder::new(5, 2));
    let mut observers = OptObserverVec::new();
    observers.add(recorder.clone());
    optimizer::optimize_with_observers(
        OptimizationMethod::LbfgsQuasiNewton,
        &stress,
        &mut layout,
        OptimizationPrecision::Fine,
        &observers,
    )
    .unwrap();
    let recorded = recorder.layouts();
    assert!(!recorded.is_empty());
    let last = recorded.last().unwrap();
    for (a, b) in last.as_slice().iter().zip(layout.as_slice()) {
        assert_eq!(a, b);
    }
}

#[test]
fn test_procrustes_reorients_an_independently_relaxed_layout() {
    let stress = reference_table().unwrap();
    let primary = reference_layout();

    // Independent relaxation from a rotated, shifted copy of the optimum
    let (sin, cos) = 1.1_f64.sin_cos();
    let mut secondary = Layout::new(5, 2);
    for point in 0..5 {
        let x = primary.point(point)[0];
        let y = primary.point(point)[1];
        secondary.set_point(point, &[cos * x - sin * y - 3.0, sin * x + cos * y + 1.0]);
    }
    optimizer::optimize(
        OptimizationMethod::LbfgsQuasiNewton,
        &stress,
        &mut secondary,
        OptimizationPrecision::Fine,
    )
    .unwrap();

    let common: Vec<(usize, usize)> = (0..5).map(|p| (p, p)).collect();
    let data = procrustes(&primary, &secondary, &common, false).unwrap();
    assert!(data.rms < 1e-3, "rms {} after alignment", data.rms);

    let aligned = data.transform(&secondary);
    for point in 0..5 {
        for (a, p) in aligned.point(point).iter().zip(primary.point(point)) {
            assert!((a - p).abs() < 1e-3);
        }
    }
}

#[test]
fn test_pca_rebase_preserves_geometry() {
    let layout = reference_layout();
    let rebased = pca::rebase(&layout, &[]).unwrap();
    for a in 0..5 {
        for b in (a + 1)..5 {
            assert!(
                (rebased.distance(a, b) - layout.distance(a, b)).abs() < 1e-9,
                "distance {a}-{b} changed"
            );
        }
    }
}

#[test]
fn test_disconnected_point_survives_the_whole_pipeline() {
    let table =
        TiterTable::from_rows(&[&["320", "20"], &["640", "40"], &["*", "*"]]).unwrap();
    let column_bases = ColumnBases::from_table(&table, Some(7.0)).unwrap();
    let parameters = StressParameters {
        disconnected: vec![2],
        ..StressParameters::default()
    };
    let stress = Stress::new(&table, &column_bases, parameters, 2).unwrap();

    let mut layout = Layout::new(5, 2);
    layout.set_point(0, &[0.0, 0.0]);
    layout.set_point(1, &[1.0, 0.2]);
    layout.set_point(3, &[2.0, -0.1]);
    layout.set_point(4, &[5.5, 0.3]);
    optimizer::optimize(
        OptimizationMethod::LbfgsQuasiNewton,
        &stress,
        &mut layout,
        OptimizationPrecision::Fine,
    )
    .unwrap();
    assert!(!layout.point_has_coordinates(2));

    let results = GridTest::new(&stress, &layout).run();
    assert_eq!(results.results()[2].state, GridTestState::Excluded);
}
