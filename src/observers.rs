//! Observer pattern for optimization monitoring.
//!
//! Observers registered with an optimization run are notified once per outer
//! iteration with the current coordinate buffer. This keeps diagnostic
//! recording (intermediate layouts, custom metrics) out of the backend
//! solvers; when no observers are registered, notification is a no-op.

use crate::layout::Layout;
use std::sync::{Arc, Mutex};

/// Callback notified at each outer optimization iteration.
pub trait OptObserver {
    /// `coordinates` is the flat layout buffer at the end of the iteration.
    fn on_step(&self, coordinates: &[f64], iteration: usize);
}

// Shared observers can be registered while the caller keeps a handle for
// reading results afterwards
impl<T: OptObserver + ?Sized> OptObserver for Arc<T> {
    fn on_step(&self, coordinates: &[f64], iteration: usize) {
        (**self).on_step(coordinates, iteration);
    }
}

/// An ordered collection of observers.
#[derive(Default)]
pub struct OptObserverVec {
    observers: Vec<Box<dyn OptObserver>>,
}

impl OptObserverVec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, observer: impl OptObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn notify(&self, coordinates: &[f64], iteration: usize) {
        for observer in &self.observers {
            observer.on_step(coordinates, iteration);
        }
    }
}

/// Records one layout snapshot per outer iteration, for diagnostic
/// consumers that want the whole optimization trajectory.
pub struct LayoutRecorder {
    number_of_points: usize,
    number_of_dimensions: usize,
    layouts: Mutex<Vec<Layout>>,
}

impl LayoutRecorder {
    pub fn new(number_of_points: usize, number_of_dimensions: usize) -> Self {
        Self {
            number_of_points,
            number_of_dimensions,
            layouts: Mutex::new(Vec::new()),
        }
    }

    /// Recorded snapshots, one per iteration, in order.
    pub fn layouts(&self) -> Vec<Layout> {
        self.layouts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl OptObserver for LayoutRecorder {
    fn on_step(&self, coordinates: &[f64], _iteration: usize) {
        let layout = Layout::from_vec(
            self.number_of_points,
            self.number_of_dimensions,
            coordinates.to_vec(),
        );
        self.layouts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(layout);
    }
}
