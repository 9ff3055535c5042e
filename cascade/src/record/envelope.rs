//! Artifact envelope — checksummed, atomically written JSON files.
//!
//! ```text
//! {"format":"cascade-artifact","version":1,"kind":"policy_run","checksum":"<blake3>","length":N}\n
//! <N bytes of pretty JSON payload>
//! ```
//!
//! Save strategy:
//! 1. Serialize the payload and hash it
//! 2. Write header + payload to a temp file in the target directory, fsync
//! 3. Rename temp to final (atomic on one filesystem)
//!
//! A reader therefore sees either the old file or the complete new one.
//! Load refuses anything it cannot fully verify.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CascadeError, CascadeResult};

/// Format tag written in every header
pub const FORMAT: &str = "cascade-artifact";

/// Current envelope version
pub const CURRENT_VERSION: u32 = 1;

/// What an envelope holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Calibration,
    Thresholds,
    PolicyRun,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Calibration => write!(f, "calibration"),
            Self::Thresholds => write!(f, "thresholds"),
            Self::PolicyRun => write!(f, "policy_run"),
        }
    }
}

/// First line of every artifact file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub format: String,
    pub version: u32,
    pub kind: ArtifactKind,
    /// blake3 hex digest of the payload bytes
    pub checksum: String,
    /// Payload length in bytes
    pub length: u64,
}

/// A value persisted through the envelope.
pub trait Artifact: Serialize + DeserializeOwned {
    const KIND: ArtifactKind;

    /// Internal consistency of a freshly parsed payload
    fn check_consistency(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Atomically write `value` to `path`.
///
/// The temp file is removed if any step fails.
pub fn save<T: Artifact>(value: &T, path: impl AsRef<Path>) -> CascadeResult<()> {
    let path = path.as_ref();
    let payload = serde_json::to_vec_pretty(value)?;
    let header = EnvelopeHeader {
        format: FORMAT.to_string(),
        version: CURRENT_VERSION,
        kind: T::KIND,
        checksum: blake3::hash(&payload).to_hex().to_string(),
        length: payload.len() as u64,
    };
    let mut header_line = serde_json::to_vec(&header)?;
    header_line.push(b'\n');

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let temp_path = temp_path_for(path);

    let written = write_synced(&temp_path, &header_line, &payload)
        .and_then(|()| fs::rename(&temp_path, path));
    if let Err(e) = written {
        if let Err(cleanup) = fs::remove_file(&temp_path) {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    path = %temp_path.display(),
                    error = %cleanup,
                    "failed to remove temp artifact"
                );
            }
        }
        return Err(e.into());
    }
    sync_parent(path);

    debug!(
        path = %path.display(),
        kind = %T::KIND,
        bytes = payload.len(),
        "artifact saved"
    );
    Ok(())
}

/// Read and fully verify an artifact of kind `T::KIND`.
pub fn load<T: Artifact>(path: impl AsRef<Path>) -> CascadeResult<T> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    let (header, payload) = split(path, &bytes)?;

    if header.kind != T::KIND {
        return Err(CascadeError::corrupt(
            path,
            format!("expected {} artifact, found {}", T::KIND, header.kind),
        ));
    }
    if payload.len() as u64 != header.length {
        return Err(CascadeError::corrupt(
            path,
            format!(
                "payload is {} bytes, header says {}",
                payload.len(),
                header.length
            ),
        ));
    }
    let checksum = blake3::hash(payload).to_hex().to_string();
    if checksum != header.checksum {
        return Err(CascadeError::corrupt(path, "checksum mismatch"));
    }

    let value: T = serde_json::from_slice(payload)
        .map_err(|e| CascadeError::corrupt(path, format!("payload does not parse: {}", e)))?;
    value
        .check_consistency()
        .map_err(|reason| CascadeError::corrupt(path, reason))?;
    Ok(value)
}

/// Read only the header, e.g. to dispatch on the artifact kind.
pub fn read_header(path: impl AsRef<Path>) -> CascadeResult<EnvelopeHeader> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    split(path, &bytes).map(|(header, _)| header)
}

fn split<'a>(path: &Path, bytes: &'a [u8]) -> CascadeResult<(EnvelopeHeader, &'a [u8])> {
    let newline = bytes
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| CascadeError::corrupt(path, "missing header line"))?;
    let header: EnvelopeHeader = serde_json::from_slice(&bytes[..newline])
        .map_err(|e| CascadeError::corrupt(path, format!("unreadable header: {}", e)))?;
    if header.format != FORMAT {
        return Err(CascadeError::corrupt(
            path,
            format!("unknown format {:?}", header.format),
        ));
    }
    if header.version > CURRENT_VERSION {
        return Err(CascadeError::corrupt(
            path,
            format!(
                "version {} is newer than supported {}",
                header.version, CURRENT_VERSION
            ),
        ));
    }
    Ok((header, &bytes[newline + 1..]))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

fn write_synced(path: &Path, header: &[u8], payload: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(header)?;
    file.write_all(payload)?;
    file.sync_all()
}

/// Persist the rename itself. Best-effort: not every platform can open a directory.
fn sync_parent(path: &Path) {
    let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return;
    };
    if let Ok(handle) = File::open(dir) {
        if let Err(e) = handle.sync_all() {
            debug!(dir = %dir.display(), error = %e, "directory fsync skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        values: Vec<f64>,
    }

    impl Artifact for Probe {
        const KIND: ArtifactKind = ArtifactKind::Thresholds;

        fn check_consistency(&self) -> Result<(), String> {
            if self.values.is_empty() {
                return Err("no values".to_string());
            }
            Ok(())
        }
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("probe.json");
        let probe = Probe {
            values: vec![0.1, 0.2, 1.0 / 3.0],
        };
        save(&probe, &path).unwrap();
        let back: Probe = load(&path).unwrap();
        assert_eq!(back, probe);

        let header = read_header(&path).unwrap();
        assert_eq!(header.kind, ArtifactKind::Thresholds);
        assert_eq!(header.version, CURRENT_VERSION);

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_inconsistent_payload_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.json");
        save(&Probe { values: Vec::new() }, &path).unwrap();
        let err = load::<Probe>(&path).unwrap_err();
        assert!(matches!(err, CascadeError::RecordCorrupt { .. }));
        assert!(err.to_string().contains("no values"));
    }

    #[test]
    fn test_newer_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.json");
        save(&Probe { values: vec![1.0] }, &path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replacen("\"version\":1", "\"version\":9", 1)).unwrap();
        let err = load::<Probe>(&path).unwrap_err();
        assert!(err.to_string().contains("newer"));
    }

    #[test]
    fn test_missing_file_is_io() {
        let dir = tempfile::tempdir().unwrap();
        let err = load::<Probe>(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, CascadeError::Io(_)));
    }

    #[test]
    fn test_failed_save_cleans_temp() {
        let dir = tempfile::tempdir().unwrap();
        // Target is an existing directory, so the final rename fails
        let target = dir.path().join("occupied");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep"), b"x").unwrap();
        assert!(save(&Probe { values: vec![1.0] }, &target).is_err());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
