//! Logit Cache — per-exit raw logits for a labeled split
//!
//! The trained network runs outside this crate. Its outputs reach the core
//! either through a [`MultiExitModel`] implementation or as a logit cache
//! file, one entry per segment:
//!
//! ```json
//! { "profile": { "num_classes": 3, "exits": [{"cost": 1.0}, {"cost": 2.0}] },
//!   "entries": [ { "segment_id": "seg-0001", "label": 2,
//!                  "exit_logits": [[0.1, 0.3, 1.9], [0.0, -0.4, 3.1]] } ] }
//! ```
//!
//! Entries are kept sorted by segment id, which is the order every batch
//! result is reported in.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CascadeError, CascadeResult};
use crate::profile::ExitProfile;

/// One input handed to a model: a fixed feature tensor and its id
#[derive(Debug, Clone)]
pub struct FeatureInput {
    /// Stable identifier shared with the label set
    pub segment_id: String,
    /// Flattened feature tensor produced by the (external) front end
    pub features: Vec<f32>,
    /// Ground-truth class, when known
    pub label: Option<usize>,
}

/// A trained network with several exits.
///
/// `evaluate` returns one raw logit vector per exit, shallowest first, and
/// must agree with `profile()` on exit and class counts.
#[cfg_attr(test, mockall::automock)]
pub trait MultiExitModel: Send + Sync {
    /// Exit profile agreed at training time
    fn profile(&self) -> &ExitProfile;

    /// Raw per-exit logits for one feature tensor
    fn evaluate(&self, features: &[f32]) -> Result<Vec<Vec<f64>>, String>;
}

/// Cached per-exit logits for one segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogitEntry {
    /// Stable identifier
    pub segment_id: String,
    /// Ground-truth class, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<usize>,
    /// Raw logits for a prefix of exits (usually all of them)
    pub exit_logits: Vec<Vec<f64>>,
}

impl LogitEntry {
    /// Logits at `exit`, if recorded and finite
    pub fn logits_at(&self, exit: usize) -> Option<&[f64]> {
        self.exit_logits
            .get(exit)
            .filter(|l| l.iter().all(|v| v.is_finite()))
            .map(|l| l.as_slice())
    }
}

/// Validated, id-sorted collection of [`LogitEntry`] for one split
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogitCache {
    /// Profile of the model that produced the logits
    pub profile: ExitProfile,
    /// Entries sorted by `segment_id`
    pub entries: Vec<LogitEntry>,
}

impl LogitCache {
    /// Validate and sort entries.
    ///
    /// Every entry must carry at least one exit, no more than the profile
    /// has, each of width `num_classes`. Labels must be valid class indices.
    pub fn new(profile: ExitProfile, mut entries: Vec<LogitEntry>) -> CascadeResult<Self> {
        profile.validate()?;
        for entry in &entries {
            if entry.exit_logits.is_empty() {
                return Err(CascadeError::invalid_input(format!(
                    "segment {} has no exit logits",
                    entry.segment_id
                )));
            }
            if entry.exit_logits.len() > profile.num_exits() {
                return Err(CascadeError::profile_mismatch(
                    format!("{} exits", profile.num_exits()),
                    format!(
                        "{} exits for segment {}",
                        entry.exit_logits.len(),
                        entry.segment_id
                    ),
                ));
            }
            if let Some(bad) = entry
                .exit_logits
                .iter()
                .find(|l| l.len() != profile.num_classes)
            {
                return Err(CascadeError::profile_mismatch(
                    format!("{} classes", profile.num_classes),
                    format!("{} classes for segment {}", bad.len(), entry.segment_id),
                ));
            }
            if let Some(label) = entry.label {
                if label >= profile.num_classes {
                    return Err(CascadeError::invalid_input(format!(
                        "segment {} label {} out of range for {} classes",
                        entry.segment_id, label, profile.num_classes
                    )));
                }
            }
        }

        entries.sort_by(|a, b| a.segment_id.cmp(&b.segment_id));
        if let Some(dup) = entries
            .windows(2)
            .find(|w| w[0].segment_id == w[1].segment_id)
        {
            return Err(CascadeError::DuplicateSegment {
                segment_id: dup[0].segment_id.clone(),
            });
        }

        Ok(Self { profile, entries })
    }

    /// Run `model` once over every input and cache the results.
    pub fn from_model<M: MultiExitModel + ?Sized>(
        model: &M,
        inputs: &[FeatureInput],
    ) -> CascadeResult<Self> {
        let profile = model.profile().clone();
        let mut entries = Vec::with_capacity(inputs.len());
        for input in inputs {
            let exit_logits = model
                .evaluate(&input.features)
                .map_err(|message| CascadeError::Model {
                    segment_id: input.segment_id.clone(),
                    message,
                })?;
            if exit_logits.len() != profile.num_exits() {
                return Err(CascadeError::profile_mismatch(
                    format!("{} exits", profile.num_exits()),
                    format!("{} exits from model", exit_logits.len()),
                ));
            }
            entries.push(LogitEntry {
                segment_id: input.segment_id.clone(),
                label: input.label,
                exit_logits,
            });
        }
        debug!(entries = entries.len(), "logit cache built from model");
        Self::new(profile, entries)
    }

    /// Read and validate a cache file.
    pub fn load(path: impl AsRef<Path>) -> CascadeResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let raw: LogitCache = serde_json::from_str(&content)?;
        Self::new(raw.profile, raw.entries)
    }

    /// Write the cache as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> CascadeResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no segments
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a segment by id
    pub fn get(&self, segment_id: &str) -> Option<&LogitEntry> {
        self.entries
            .binary_search_by(|e| e.segment_id.as_str().cmp(segment_id))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Entries with a ground-truth label
    pub fn labeled(&self) -> impl Iterator<Item = (&LogitEntry, usize)> {
        self.entries
            .iter()
            .filter_map(|e| e.label.map(|label| (e, label)))
    }

    /// Fail unless the cache was produced under `profile`.
    pub fn ensure_profile(&self, profile: &ExitProfile) -> CascadeResult<()> {
        self.profile.ensure_fingerprint(&profile.fingerprint())
    }
}
