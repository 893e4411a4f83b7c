//! Incremental pose-graph solver.
//!
//! The fusion engine talks to the solver only through [`IncrementalSolver`]:
//! it submits new factors with initial guesses for new variables and reads
//! back the refined joint estimate. [`LmSolver`] is the bundled
//! implementation.

pub mod factors;
pub mod keys;
pub mod lm;
pub mod noise;

use std::fmt;

pub use factors::Factor;
pub use keys::{FromValue, Key, StateIndex, Value, Values};
pub use lm::{LmSolver, LmSolverConfig};
pub use noise::NoiseModel;

use crate::error::SolverError;

/// Summary of one accepted update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolveReport {
    pub iterations: usize,
    /// Cost `Σ ½‖L⁻¹ r‖²` of the active factors before and after optimization.
    pub initial_error: f64,
    pub final_error: f64,
    pub active_variables: usize,
    pub active_factors: usize,
    pub converged: bool,
}

/// Snapshot of the graph for postmortem analysis.
#[derive(Debug, Clone, Default)]
pub struct SolverDiagnostics {
    pub factors: Vec<Factor>,
    pub estimate: Values,
    /// The update that was refused, if the last call failed.
    pub rejected_factors: Vec<Factor>,
    pub rejected_values: Values,
}

impl fmt::Display for SolverDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Factor graph ({} factors):", self.factors.len())?;
        for (i, factor) in self.factors.iter().enumerate() {
            writeln!(f, "  [{}] {}", i, factor)?;
        }
        if !self.rejected_factors.is_empty() || !self.rejected_values.is_empty() {
            writeln!(f, "Rejected update ({} factors):", self.rejected_factors.len())?;
            for factor in &self.rejected_factors {
                writeln!(f, "  {}", factor)?;
            }
            for (key, value) in self.rejected_values.iter() {
                writeln!(f, "  {} <- {}", key, value)?;
            }
        }
        writeln!(f, "Estimate ({} values):", self.estimate.len())?;
        for (key, value) in self.estimate.iter() {
            writeln!(f, "  {}: {}", key, value)?;
        }
        Ok(())
    }
}

/// Contract between the fusion engine and an incremental optimizer.
pub trait IncrementalSolver: Send {
    /// Add factors and initial values for new variables, then re-optimize.
    ///
    /// A failed update leaves the joint estimate untouched.
    fn update(&mut self, factors: Vec<Factor>, values: Values) -> Result<SolveReport, SolverError>;

    /// Current estimate of a variable.
    fn value(&self, key: &Key) -> Option<&Value>;

    fn num_factors(&self) -> usize;

    fn num_keys(&self) -> usize;

    fn diagnostics(&self) -> SolverDiagnostics;

    /// Typed estimate lookup.
    fn estimate<T: FromValue>(&self, key: Key) -> Result<T, SolverError>
    where
        Self: Sized,
    {
        let value = self.value(&key).ok_or(SolverError::KeyNotFound(key))?;
        T::from_value(value).ok_or(SolverError::TypeMismatch {
            key,
            expected: T::TYPE_NAME,
        })
    }
}
