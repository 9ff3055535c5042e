//! Calibrated Early-Exit Cascade
//!
//! This library decides, per input, how far inference through a multi-exit
//! network proceeds before a class label is committed:
//! - Per-exit temperature calibration so confidences mean what they say
//! - Offline threshold selection against an accuracy floor or a cost ceiling
//! - A step-wise exit cascade and batch evaluators (sequential and pooled)
//! - Checksummed, atomically written run records
//!
//! # Pipeline
//!
//! ```text
//! LogitCache ─▶ Calibrator ─▶ CalibrationParams ─┬─▶ ThresholdSelector ─▶ ThresholdSet
//!                                                │                          │
//!                                                └──────────┬───────────────┘
//!                                                           ▼
//!                                    PolicyEvaluator ─▶ Decisions ─▶ PolicyRunRecord
//! ```
//!
//! # Usage
//!
//! ```bash
//! cascade calibrate --run-dir runs/r1 --cache calib.json
//! cascade select    --run-dir runs/r1 --cache val.json --accuracy-floor 0.95
//! cascade evaluate  --run-dir runs/r1 --cache test.json
//! cascade profile   --run-dir runs/r1 --cache test.json
//! ```

pub mod analysis;
pub mod calibration;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod policy;
pub mod profile;
pub mod record;
pub mod scores;
pub mod thresholds;

pub use calibration::{CalibrationConfig, CalibrationOutcome, CalibrationParams, Calibrator};
pub use config::{EvaluationConfig, PipelineConfig, RunLayout};
pub use error::{CascadeError, CascadeResult, RunWarning};
pub use policy::{
    evaluate_parallel, evaluate_policy, Decision, EvaluationVariant, ExitCascade, PolicyEvaluator,
    PolicyState, PolicySummary,
};
pub use profile::{ExitProfile, ExitSpec};
pub use record::{PolicyRunRecord, RunFlags};
pub use scores::{FeatureInput, LogitCache, LogitEntry, MultiExitModel};
pub use thresholds::{PolicyObjective, SelectionConfig, ThresholdSelector, ThresholdSet};
