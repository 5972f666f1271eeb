//! Verified markers.
//!
//! A marker at `<destination>.verified` records that the destination passed
//! verification. The record is bound to the file it attests to (size,
//! modification time and digest) so that a file replaced or truncated
//! behind the bundler's back is not trusted on the strength of an old
//! marker. A marker never outlives its file: every helper here that removes
//! an artefact removes the marker first.

use super::sha256_digest::Sha256Digest;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::time::{SystemTime, UNIX_EPOCH};

/// Suffix appended to an artefact path to locate its marker.
pub const MARKER_SUFFIX: &str = "verified";

/// Return `<destination>.verified`.
#[must_use]
pub fn marker_path(destination: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{destination}.{MARKER_SUFFIX}"))
}

/// The JSON body of a verified marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRecord {
    /// Seconds since the Unix epoch at which verification succeeded.
    pub verified_at: u64,
    /// Digest of the file when it was verified.
    pub sha256: String,
    /// Size of the file in bytes.
    pub size: u64,
    /// Modification time of the file in seconds since the Unix epoch.
    #[serde(default)]
    pub modified: Option<u64>,
}

/// Result of inspecting a marker on the fast path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerCheck {
    /// The marker matches the file and descriptor.
    Valid(MarkerRecord),
    /// No marker exists.
    Absent,
    /// A marker exists but must not be trusted.
    Stale {
        /// Why the marker was rejected.
        reason: String,
    },
}

/// Inspect the marker for `destination` without hashing the file.
///
/// `expected` is the digest recorded in the current descriptor, if one is
/// readable; the marker must agree with it.
///
/// # Errors
///
/// Returns I/O errors other than "not found" from reading the marker or
/// stating the destination.
pub fn check(
    destination: &Utf8Path,
    expected: Option<&Sha256Digest>,
) -> std::io::Result<MarkerCheck> {
    let body = match std::fs::read_to_string(marker_path(destination)) {
        Ok(body) => body,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(MarkerCheck::Absent),
        Err(err) if err.kind() == ErrorKind::InvalidData => {
            return Ok(stale("marker is not text"));
        }
        Err(err) => return Err(err),
    };

    let metadata = match std::fs::metadata(destination) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(stale("file is missing")),
        Err(err) => return Err(err),
    };

    let Ok(record) = serde_json::from_str::<MarkerRecord>(&body) else {
        return Ok(stale("marker has no verification record"));
    };

    if record.size != metadata.len() {
        return Ok(stale(&format!(
            "size changed from {} to {} bytes",
            record.size,
            metadata.len()
        )));
    }
    if let (Some(recorded), Some(current)) = (record.modified, modified_secs(&metadata))
        && recorded != current
    {
        return Ok(stale("modification time changed"));
    }
    if let Some(expected) = expected
        && !record.sha256.eq_ignore_ascii_case(expected.as_str())
    {
        return Ok(stale("descriptor digest differs from the verified digest"));
    }
    Ok(MarkerCheck::Valid(record))
}

fn stale(reason: &str) -> MarkerCheck {
    MarkerCheck::Stale {
        reason: reason.to_owned(),
    }
}

/// Write a marker for `destination`, binding it to the file's current state.
///
/// # Errors
///
/// Returns I/O errors from stating the destination or writing the marker.
pub fn write(destination: &Utf8Path, digest: &Sha256Digest) -> std::io::Result<MarkerRecord> {
    let metadata = std::fs::metadata(destination)?;
    let record = MarkerRecord {
        verified_at: now_secs(),
        sha256: digest.to_string(),
        size: metadata.len(),
        modified: modified_secs(&metadata),
    };
    let body = serde_json::to_vec_pretty(&record).map_err(std::io::Error::other)?;
    write_atomic(&marker_path(destination), &body)?;
    Ok(record)
}

/// Remove the marker for `destination`, ignoring a missing marker.
///
/// # Errors
///
/// Returns I/O errors other than "not found".
pub fn remove(destination: &Utf8Path) -> std::io::Result<()> {
    remove_if_present(&marker_path(destination))
}

/// Remove an artefact together with its marker and descriptor.
///
/// # Errors
///
/// Returns the first I/O error other than "not found".
pub fn remove_artefact(destination: &Utf8Path, descriptor: Option<&Utf8Path>) -> std::io::Result<()> {
    remove(destination)?;
    remove_if_present(destination)?;
    if let Some(descriptor) = descriptor {
        remove_if_present(descriptor)?;
    }
    Ok(())
}

/// Remove `path`, treating "not found" as success.
///
/// # Errors
///
/// Returns I/O errors other than "not found".
pub fn remove_if_present(path: &Utf8Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Write `contents` to `path` through a temporary file in the same directory.
///
/// # Errors
///
/// Returns I/O errors from creating, writing or renaming the temporary file.
pub fn write_atomic(path: &Utf8Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(contents)?;
    temp.flush()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

fn modified_secs(metadata: &std::fs::Metadata) -> Option<u64> {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_secs())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}
