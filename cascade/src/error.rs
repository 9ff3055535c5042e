//! Error types
//!
//! Two classes of failure exist in the cascade core:
//!
//! - **Fatal** conditions ([`CascadeError`]) stop the run. Structural mismatches
//!   (wrong exit profile, thresholds fit under other calibration params, a
//!   corrupt record) land here.
//! - **Recoverable** data-quality conditions ([`RunWarning`]) never surface as
//!   errors. The stage recovers locally and the warning is carried in the run
//!   record so every downstream consumer can inspect it.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for cascade operations
pub type CascadeResult<T> = Result<T, CascadeError>;

/// Errors that stop a calibration, selection or evaluation run
#[derive(Error, Debug)]
pub enum CascadeError {
    /// Calibration/thresholds were fit against a different exit profile
    #[error("Exit profile mismatch: expected {expected}, found {found}")]
    ExitProfileMismatch { expected: String, found: String },

    /// Thresholds were selected under different calibration params
    #[error("Calibration mismatch: thresholds were selected under calibration {expected}, got {found}")]
    CalibrationMismatch { expected: String, found: String },

    /// A persisted artifact is partially written or fails schema validation
    #[error("Record at {path} is corrupt: {reason}")]
    RecordCorrupt { path: PathBuf, reason: String },

    /// Exit profile itself is malformed
    #[error("Invalid exit profile: {message}")]
    InvalidProfile { message: String },

    /// Caller-supplied data is malformed (bad label, empty split, bad threshold)
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// The cascade needed an exit the input has no logits for
    #[error("Segment {segment_id} has no scores for exit {exit}")]
    MissingExitScores { segment_id: String, exit: usize },

    /// Two inputs share a segment id
    #[error("Duplicate segment id: {segment_id}")]
    DuplicateSegment { segment_id: String },

    /// The multi-exit model failed to evaluate an input
    #[error("Model evaluation failed for {segment_id}: {message}")]
    Model { segment_id: String, message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Batch aborted before every decision was produced
    #[error("Evaluation cancelled after {completed} of {total} inputs")]
    Cancelled { completed: usize, total: usize },

    /// An evaluation worker panicked or was aborted
    #[error("Evaluation worker failed: {message}")]
    Worker { message: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CascadeError {
    /// Create a profile mismatch error from two fingerprints
    pub fn profile_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::ExitProfileMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create a record corrupt error
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::RecordCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid profile error
    pub fn invalid_profile(message: impl Into<String>) -> Self {
        Self::InvalidProfile {
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the run must stop rather than produce decisions.
    ///
    /// Every `CascadeError` is fatal for the stage that raised it; this only
    /// distinguishes structural problems (which no retry will fix) from IO.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::ExitProfileMismatch { .. }
                | Self::CalibrationMismatch { .. }
                | Self::RecordCorrupt { .. }
                | Self::InvalidProfile { .. }
        )
    }
}

/// Recovered data-quality conditions carried forward in the run record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunWarning {
    /// Too few calibration samples at one exit; identity temperature used
    CalibrationDataInsufficient {
        exit: usize,
        samples: usize,
        required: usize,
    },
    /// No threshold vector met the objective; the Pareto-best point was used
    ThresholdConstraintInfeasible {
        objective: String,
        achieved_accuracy: f64,
        achieved_mean_cost: f64,
    },
}

impl std::fmt::Display for RunWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CalibrationDataInsufficient {
                exit,
                samples,
                required,
            } => write!(
                f,
                "exit {} calibrated with identity temperature ({} samples < {})",
                exit, samples, required
            ),
            Self::ThresholdConstraintInfeasible {
                objective,
                achieved_accuracy,
                achieved_mean_cost,
            } => write!(
                f,
                "{} infeasible; best achievable accuracy {:.4} at mean cost {:.4}",
                objective, achieved_accuracy, achieved_mean_cost
            ),
        }
    }
}
