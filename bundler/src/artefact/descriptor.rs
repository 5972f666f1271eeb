//! Hash descriptor dialects.
//!
//! Upstream sources publish expected digests in two shapes. Release
//! checksum files use the `sha256sum` line format (`<hex>  <filename>`),
//! while some registries answer with the bare hex digest. Registries under
//! load have also been seen to answer the digest endpoint with an HTML error
//! page, which [`BareContent::ErrorPage`] recognises.

use super::error::{ArtefactError, Result};
use super::marker::write_atomic;
use super::sha256_digest::{DIGEST_HEX_LEN, Sha256Digest};
use camino::{Utf8Path, Utf8PathBuf};
use std::fmt;

/// Suffix appended to an artefact path to locate its descriptor.
pub const DESCRIPTOR_SUFFIX: &str = "sha256";

/// Bare-hash content longer than this cannot be a digest.
const ERROR_PAGE_THRESHOLD: usize = 100;

/// The on-disk format of a hash descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// One or more `<hex>  <filename>` lines.
    FilenameHash,
    /// Only the hex digest.
    BareHash,
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FilenameHash => write!(f, "filename-hash"),
            Self::BareHash => write!(f, "bare-hash"),
        }
    }
}

/// Location and dialect of an artefact's descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorSpec {
    /// Path of the descriptor file.
    pub path: Utf8PathBuf,
    /// Dialect the file is written in.
    pub kind: DescriptorKind,
}

impl DescriptorSpec {
    /// Build the conventional descriptor spec for `destination`.
    #[must_use]
    pub fn for_artefact(destination: &Utf8Path, kind: DescriptorKind) -> Self {
        Self {
            path: descriptor_path(destination),
            kind,
        }
    }
}

/// Return `<destination>.sha256`.
#[must_use]
pub fn descriptor_path(destination: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{destination}.{DESCRIPTOR_SUFFIX}"))
}

/// One parsed entry from a `FilenameHash` descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumEntry {
    /// Expected digest.
    pub digest: Sha256Digest,
    /// File name as written in the descriptor, without the binary marker.
    pub file_name: String,
}

impl ChecksumEntry {
    /// Return the final path component of the recorded file name.
    #[must_use]
    pub fn base_name(&self) -> &str {
        self.file_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.file_name)
    }
}

/// Parse every well-formed line of a `FilenameHash` descriptor.
///
/// Blank lines and comment lines are ignored; a leading `*` (binary mode)
/// before the file name is stripped.
///
/// # Errors
///
/// Returns [`ArtefactError::InvalidDescriptor`] when a non-blank line does
/// not start with a valid digest followed by a file name.
pub fn parse_checksum_lines(content: &str) -> Result<Vec<ChecksumEntry>> {
    let mut entries = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (hex, rest) = trimmed.split_once(char::is_whitespace).ok_or_else(|| {
            ArtefactError::InvalidDescriptor {
                reason: format!("line has no file name: {trimmed}"),
            }
        })?;
        let digest = Sha256Digest::parse(hex)?;
        let file_name = rest.trim_start().trim_start_matches('*').to_owned();
        if file_name.is_empty() {
            return Err(ArtefactError::InvalidDescriptor {
                reason: format!("line has no file name: {trimmed}"),
            });
        }
        entries.push(ChecksumEntry { digest, file_name });
    }
    Ok(entries)
}

/// Select the digest recorded for `file_name` in a `FilenameHash` descriptor.
///
/// A descriptor holding exactly one entry is taken to describe the artefact
/// even when it names a different path, since release pipelines often hash
/// from a build directory.
///
/// # Errors
///
/// Returns [`ArtefactError::InvalidDescriptor`] when the content cannot be
/// parsed or holds no entry for the file.
pub fn digest_for_file(content: &str, file_name: &str) -> Result<Sha256Digest> {
    let entries = parse_checksum_lines(content)?;
    if let Some(entry) = entries.iter().find(|entry| entry.base_name() == file_name) {
        return Ok(entry.digest.clone());
    }
    match entries.as_slice() {
        [only] => {
            log::debug!(
                "descriptor entry {} taken to describe {file_name}",
                only.file_name
            );
            Ok(only.digest.clone())
        }
        [] => Err(ArtefactError::InvalidDescriptor {
            reason: "descriptor is empty".to_owned(),
        }),
        _ => Err(ArtefactError::InvalidDescriptor {
            reason: format!("no entry for {file_name}"),
        }),
    }
}

/// Interpretation of a `BareHash` descriptor body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BareContent {
    /// The body holds a usable digest.
    Digest(Sha256Digest),
    /// The body is markup or far too long to be a digest.
    ErrorPage,
    /// The body is neither a digest nor recognisably an error page.
    Malformed(String),
}

/// Interpret the body of a `BareHash` descriptor.
///
/// The first whitespace-separated token is used when it is a digest, so a
/// bare descriptor later rewritten in `FilenameHash` form still reads back.
#[must_use]
pub fn interpret_bare(content: &str) -> BareContent {
    let trimmed = content.trim();
    let lowered = trimmed.to_ascii_lowercase();
    if let Some(first) = lowered.split_whitespace().next()
        && first.len() == DIGEST_HEX_LEN
        && let Ok(digest) = Sha256Digest::parse(first)
    {
        return BareContent::Digest(digest);
    }
    if looks_like_error_page(&lowered) {
        return BareContent::ErrorPage;
    }
    BareContent::Malformed(format!(
        "expected a {DIGEST_HEX_LEN}-character hex digest, got {} characters",
        trimmed.len()
    ))
}

/// Return true for bodies that are markup or implausibly long.
fn looks_like_error_page(lowered: &str) -> bool {
    lowered.starts_with('<')
        || lowered.contains("<html")
        || lowered.contains("<!doctype")
        || lowered.len() > ERROR_PAGE_THRESHOLD
}

/// Render a single `FilenameHash` line for `file_name`.
#[must_use]
pub fn render_filename_hash(digest: &Sha256Digest, file_name: &str) -> String {
    format!("{digest}  {file_name}\n")
}

/// Render a descriptor body in the requested dialect.
#[must_use]
pub fn render(kind: DescriptorKind, digest: &Sha256Digest, file_name: &str) -> String {
    match kind {
        DescriptorKind::FilenameHash => render_filename_hash(digest, file_name),
        DescriptorKind::BareHash => format!("{digest}\n"),
    }
}

/// Read the digest a descriptor records for `file_name`, if it is usable.
///
/// Used on the marker fast path, where an unreadable descriptor simply means
/// the marker cannot be cross-checked.
#[must_use]
pub fn read_expected(spec: &DescriptorSpec, file_name: &str) -> Option<Sha256Digest> {
    let content = std::fs::read_to_string(&spec.path).ok()?;
    match spec.kind {
        DescriptorKind::FilenameHash => digest_for_file(&content, file_name).ok(),
        DescriptorKind::BareHash => match interpret_bare(&content) {
            BareContent::Digest(digest) => Some(digest),
            BareContent::ErrorPage | BareContent::Malformed(_) => None,
        },
    }
}

/// Write a descriptor for `file_name` at `spec.path`.
///
/// # Errors
///
/// Returns I/O errors from writing the file.
pub fn write_descriptor(
    spec: &DescriptorSpec,
    digest: &Sha256Digest,
    file_name: &str,
) -> std::io::Result<()> {
    write_atomic(&spec.path, render(spec.kind, digest, file_name).as_bytes())
}
