//! Error types for the fusion pipeline.
//!
//! Recoverable conditions (out-of-order input, missing transforms, queue
//! saturation) and the unrecoverable solver failure are kept in separate
//! variants so callers can tell a skipped measurement from a corrupted
//! estimate.

use thiserror::Error;

use crate::fusion::Modality;
use crate::solver::{Key, SolverDiagnostics};

/// Rejected inertial input. The sample is dropped; no state is mutated.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImuError {
    #[error("out-of-order IMU sample at {timestamp:.6}s (last accepted {last:.6}s)")]
    OutOfOrder { timestamp: f64, last: f64 },

    #[error("negative IMU time step {dt:.6}s")]
    NegativeTimeStep { dt: f64 },

    #[error("non-finite IMU sample or time step")]
    NonFinite,
}

/// Frame lookup failure. The measurement is skipped for this cycle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("no {modality} to world transform available at {timestamp:.6}s")]
    Unavailable { modality: Modality, timestamp: f64 },
}

/// Errors reported by an incremental solver.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    /// The linear system is singular or numerically indeterminate.
    #[error("indeterminate linear system{}", .key.map(|k| format!(" near {k}")).unwrap_or_default())]
    IndeterminateSystem { key: Option<Key> },

    #[error("no estimate for {0}")]
    KeyNotFound(Key),

    #[error("{key} does not hold a {expected}")]
    TypeMismatch { key: Key, expected: &'static str },

    #[error("initial value for {0} submitted twice")]
    DuplicateKey(Key),

    #[error("factor references {0} which has no value")]
    UnknownKey(Key),
}

/// Errors surfaced by the fusion engine and the measurement sequencer.
#[derive(Error, Debug)]
pub enum FusionError {
    /// Fatal: the solver rejected an update. Carries the full constraint set
    /// and estimate for postmortem.
    #[error("solver failure: {source}")]
    Solver {
        #[source]
        source: SolverError,
        diagnostics: Box<SolverDiagnostics>,
    },

    /// A previous fatal error stopped the engine.
    #[error("fusion engine halted after a fatal solver error")]
    Halted,

    #[error("measurement queue full, {modality} measurement rejected")]
    Backpressure { modality: Modality },

    #[error("measurement sequencer is not running")]
    Disconnected,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Configuration load errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
}
