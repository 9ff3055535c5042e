//! Pipeline configuration and run-directory layout.
//!
//! Precedence, lowest first: built-in defaults, the optional TOML file,
//! `CASCADE_*` environment variables, then whatever the caller sets after
//! loading (CLI flags).
//!
//! ```toml
//! [calibration]
//! min_samples = 10
//! ece_bins = 15
//!
//! [selection]
//! grid_steps = 100
//!
//! [evaluation]
//! workers = 8
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calibration::CalibrationConfig;
use crate::error::{CascadeError, CascadeResult};
use crate::policy::default_workers;
use crate::thresholds::SelectionConfig;

/// Batch evaluation settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Worker threads for parallel evaluation (`None` = available parallelism)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
}

impl EvaluationConfig {
    /// Effective worker count
    pub fn workers(&self) -> usize {
        self.workers.unwrap_or_else(default_workers).max(1)
    }
}

/// Every knob of the calibrate → select → evaluate pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub calibration: CalibrationConfig,
    pub selection: SelectionConfig,
    pub evaluation: EvaluationConfig,
}

impl PipelineConfig {
    /// Defaults, then `path` (if given), then the process environment.
    pub fn load(path: Option<&Path>) -> CascadeResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file; missing sections keep their defaults.
    pub fn from_toml_file(path: &Path) -> CascadeResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CascadeError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CascadeError::config(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "pipeline config loaded");
        Ok(config)
    }

    /// Apply `CASCADE_*` overrides from `lookup`.
    ///
    /// Set-but-unparseable values are errors rather than silently ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> CascadeResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse(key: &str, value: String) -> CascadeResult<usize> {
            value.trim().parse::<usize>().map_err(|_| {
                CascadeError::config(format!(
                    "{} must be a non-negative integer, got {:?}",
                    key, value
                ))
            })
        }

        if let Some(v) = lookup("CASCADE_MIN_SAMPLES") {
            self.calibration.min_samples = parse("CASCADE_MIN_SAMPLES", v)?;
        }
        if let Some(v) = lookup("CASCADE_ECE_BINS") {
            self.calibration.ece_bins = parse("CASCADE_ECE_BINS", v)?;
        }
        if let Some(v) = lookup("CASCADE_GRID_STEPS") {
            self.selection.grid_steps = parse("CASCADE_GRID_STEPS", v)?;
        }
        if let Some(v) = lookup("CASCADE_WORKERS") {
            self.evaluation.workers = Some(parse("CASCADE_WORKERS", v)?);
        }
        Ok(())
    }

    /// Reject values no stage can run with.
    pub fn validate(&self) -> CascadeResult<()> {
        self.calibration.validate()?;
        self.selection.validate()?;
        if self.evaluation.workers == Some(0) {
            return Err(CascadeError::config("evaluation.workers must be >= 1"));
        }
        Ok(())
    }
}

/// Artifact paths inside one run directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<run>/calibration.json`
    pub fn calibration_path(&self) -> PathBuf {
        self.root.join("calibration.json")
    }

    /// `<run>/thresholds.json`
    pub fn thresholds_path(&self) -> PathBuf {
        self.root.join("thresholds.json")
    }

    /// `<run>/policy_run.json`
    pub fn policy_run_path(&self) -> PathBuf {
        self.root.join("policy_run.json")
    }

    /// `<run>/variants`
    pub fn variants_dir(&self) -> PathBuf {
        self.root.join("variants")
    }

    /// `<run>/variants/<label>.json`, with path separators in the label replaced
    pub fn variant_path(&self, label: &str) -> PathBuf {
        let safe: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.variants_dir().join(format!("{}.json", safe))
    }
}
