//! Error types for the seromap library
//!
//! The library uses a hierarchical error system where:
//! - **`SeromapError`** is the top-level error exposed to users via public APIs
//! - **Module errors** (`TableError`, `OptimizerError`, etc.) are wrapped inside SeromapError
//! - **Error sources** are preserved, allowing full error chain inspection

use crate::optimizer::OptimizerError;
use crate::pca::PcaError;
use crate::procrustes::GeometryError;
use crate::table::TableError;
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the seromap library
pub type SeromapResult<T> = Result<T, SeromapError>;

/// Main error type for the seromap library
///
/// This is the top-level error type exposed by public APIs. It wraps
/// module-specific errors while preserving the full error chain for
/// debugging.
#[derive(Debug, Error)]
pub enum SeromapError {
    /// Titer table and distance construction errors
    #[error(transparent)]
    Table(#[from] TableError),

    /// Optimization backend and dispatch errors
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// Principal component analysis errors
    #[error(transparent)]
    Pca(#[from] PcaError),

    /// Procrustes alignment errors
    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

impl SeromapError {
    /// Get the full error chain as a string for logging and debugging.
    ///
    /// Traverses the error source chain and returns a formatted string
    /// showing the hierarchy from the top-level SeromapError down to the
    /// root cause.
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  -> {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Get a compact single-line error chain for logging
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" -> ")
    }
}
