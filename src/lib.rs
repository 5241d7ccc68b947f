//! # Seromap
//!
//! A Rust library for antigenic cartography: relaxing point layouts against
//! titer-derived target distances and diagnosing the quality of the result.
//!
//! ## Features
//!
//! - **Titer-to-distance conversion**: column bases, avidity adjusts, and
//!   censored (`<`, `>`, `~`) titer handling
//! - **Differentiable stress objective**: squared residuals for regular
//!   titers, a smooth sigmoid-weighted one-sided penalty for censored ones
//! - **Multiple optimization backends**: L-BFGS, conjugate gradient, dense
//!   BFGS, and differential evolution behind one dispatch
//! - **Dimension annealing**: relax high-dimensional, PCA-project down,
//!   relax again
//! - **Randomized multi-restart**: parallel independent attempts, best
//!   layout wins
//! - **Grid test**: per-point diagnosis of trapped and hemisphering points
//! - **Procrustes alignment**: compare independently produced layouts
//!
//! ## Pipeline
//!
//! A titer table becomes a [`table::TableDistances`], which a
//! [`stress::Stress`] evaluates over a flat [`layout::Layout`] buffer. A
//! [`randomizer::LayoutRandomizer`] seeds starting layouts, the
//! [`optimizer`] relaxes them, and [`gridtest::GridTest`] and
//! [`procrustes::procrustes`] judge the result.

pub mod error;
pub mod gridtest;
pub mod layout;
#[cfg(feature = "logging")]
pub mod logger;
pub mod observers;
pub mod optimizer;
pub mod pca;
pub mod procrustes;
pub mod randomizer;
pub mod stress;
pub mod table;
pub mod titer;

pub use error::{SeromapError, SeromapResult};
pub use gridtest::{GridTest, GridTestResult, GridTestResults, GridTestState};
pub use layout::{DisconnectedMask, Layout};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use observers::{LayoutRecorder, OptObserver, OptObserverVec};
pub use optimizer::{
    OptimizationMethod, OptimizationPrecision, OptimizationReport, optimize,
    optimize_multi_start, optimize_with_dimension_annealing, optimize_with_observers,
};
pub use procrustes::{ProcrustesData, procrustes};
pub use randomizer::{
    CurrentLayoutArea, LayoutRandomizer, LineBordered, TableMaxDistance, bootstrap_diameter,
};
pub use stress::{Stress, StressParameters};
pub use table::{AvidityAdjusts, ColumnBases, TableDistances, TiterTable};
pub use titer::Titer;
