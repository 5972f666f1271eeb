//! Archive extraction for bundle artefacts.
//!
//! The archive format is decided from the file name each time an archive is
//! extracted. Extraction is performed by the first available provider (the
//! in-process extractor, or the system `tar`) and the result is judged by
//! [`classify_extraction`]: a tool that complains is only believed to have
//! succeeded when the expected output is positively confirmed on disk.
//!
//! Ownership and extended permission bits are never restored. Entries whose
//! path escapes the destination directory fail the whole extraction.

use super::bounded_log::{BoundedLog, DEFAULT_LOG_LIMIT, tail, truncate_to_tail};
use crate::tools::{Availability, CommandExecutor, CommandRequest, first_program, probe_command};
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path};
use std::time::Duration;

/// Supported archive formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    /// Zstandard-compressed tarball.
    TarZst,
    /// Gzip-compressed tarball.
    TarGz,
    /// Uncompressed tarball.
    Tar,
    /// ZIP container (including `.vsix`).
    Zip,
}

impl ArchiveFormat {
    /// Decide the format from a file name suffix.
    ///
    /// # Examples
    ///
    /// ```
    /// use airgap_bundler::artefact::extraction::ArchiveFormat;
    ///
    /// assert_eq!(
    ///     ArchiveFormat::from_file_name("ollama-linux-amd64.tar.zst"),
    ///     Some(ArchiveFormat::TarZst)
    /// );
    /// assert_eq!(ArchiveFormat::from_file_name("ollama.tgz"), Some(ArchiveFormat::TarGz));
    /// assert_eq!(ArchiveFormat::from_file_name("notes.txt"), None);
    /// ```
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        let lowered = name.to_ascii_lowercase();
        if lowered.ends_with(".tar.zst") || lowered.ends_with(".tzst") {
            Some(Self::TarZst)
        } else if lowered.ends_with(".tar.gz") || lowered.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lowered.ends_with(".tar") {
            Some(Self::Tar)
        } else if lowered.ends_with(".zip") || lowered.ends_with(".vsix") {
            Some(Self::Zip)
        } else {
            None
        }
    }
}

/// What the tool said about its run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolReport {
    /// The tool reported no warnings or errors.
    pub clean: bool,
    /// Bounded tool output.
    pub log: String,
}

/// Errors that make an extraction fail outright.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    /// I/O error during extraction.
    #[error("extraction I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A path in the archive attempts to traverse outside the destination.
    #[error("path traversal detected: {path}")]
    PathTraversal {
        /// The offending path from the archive entry.
        path: String,
    },

    /// The ZIP container could not be read.
    #[error("invalid ZIP archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// An external extraction tool could not be run.
    #[error("extraction tool failed: {0}")]
    Tool(#[from] crate::tools::ToolError),
}

/// An extraction provider.
///
/// # Examples
///
/// ```
/// use airgap_bundler::artefact::extraction::{ArchiveFormat, ArtefactExtractor, NativeExtractor};
///
/// let extractor = NativeExtractor::default();
/// assert!(extractor.availability(ArchiveFormat::TarZst).is_available());
/// ```
#[cfg_attr(test, mockall::automock)]
pub trait ArtefactExtractor {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this provider can extract `format` on this host.
    fn availability(&self, format: ArchiveFormat) -> Availability;

    /// Extract `archive` into `dest_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractionError::PathTraversal`] if any entry attempts to
    /// escape the destination directory, and other variants when the archive
    /// cannot be read at all. Per-entry problems are reported as warnings in
    /// the [`ToolReport`].
    fn extract(
        &self,
        archive: &Utf8Path,
        format: ArchiveFormat,
        dest_dir: &Utf8Path,
    ) -> Result<ToolReport, ExtractionError>;
}

/// In-process extractor using the `tar`, `zstd`, `flate2` and `zip` crates.
#[derive(Debug, Clone, Copy)]
pub struct NativeExtractor {
    log_limit: usize,
}

impl NativeExtractor {
    /// Create an extractor whose warning log is capped at `log_limit` bytes.
    #[must_use]
    pub fn new(log_limit: usize) -> Self {
        Self { log_limit }
    }
}

impl Default for NativeExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_LIMIT)
    }
}

impl ArtefactExtractor for NativeExtractor {
    fn name(&self) -> &'static str {
        "built-in"
    }

    fn availability(&self, _format: ArchiveFormat) -> Availability {
        Availability::Available
    }

    fn extract(
        &self,
        archive: &Utf8Path,
        format: ArchiveFormat,
        dest_dir: &Utf8Path,
    ) -> Result<ToolReport, ExtractionError> {
        let mut log = BoundedLog::new(self.log_limit);
        let file = BufReader::new(File::open(archive)?);
        match format {
            ArchiveFormat::TarZst => {
                let decoder = zstd::Decoder::new(file)?;
                unpack_tar(tar::Archive::new(decoder), dest_dir, &mut log)?;
            }
            ArchiveFormat::TarGz => {
                let decoder = flate2::read::GzDecoder::new(file);
                unpack_tar(tar::Archive::new(decoder), dest_dir, &mut log)?;
            }
            ArchiveFormat::Tar => unpack_tar(tar::Archive::new(file), dest_dir, &mut log)?,
            ArchiveFormat::Zip => unpack_zip(file, dest_dir, &mut log)?,
        }
        Ok(ToolReport {
            clean: log.is_empty(),
            log: log.into_string(),
        })
    }
}

fn unpack_tar<R: std::io::Read>(
    mut archive: tar::Archive<R>,
    dest_dir: &Utf8Path,
    log: &mut BoundedLog,
) -> Result<(), ExtractionError> {
    archive.set_preserve_permissions(false);
    archive.set_preserve_ownerships(false);
    archive.set_unpack_xattrs(false);
    archive.set_preserve_mtime(true);

    for entry_result in archive.entries()? {
        let mut entry = entry_result?;
        let entry_path = entry.path()?.into_owned();
        validate_entry_path(&entry_path)?;

        if let Err(err) = entry.unpack_in(dest_dir) {
            let message = format!("{}: {err}", entry_path.display());
            log::warn!("extraction warning: {message}");
            log.push_line(&message);
        }
    }
    Ok(())
}

fn unpack_zip(
    reader: BufReader<File>,
    dest_dir: &Utf8Path,
    log: &mut BoundedLog,
) -> Result<(), ExtractionError> {
    let mut archive = zip::ZipArchive::new(reader)?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(ExtractionError::PathTraversal {
                path: entry.name().to_owned(),
            });
        };
        let target = dest_dir.as_std_path().join(relative);
        let written = if entry.is_dir() {
            std::fs::create_dir_all(&target)
        } else {
            let mode = entry.unix_mode();
            write_zip_entry(&mut entry, mode, &target)
        };
        if let Err(err) = written {
            let message = format!("{}: {err}", entry.name());
            log::warn!("extraction warning: {message}");
            log.push_line(&message);
        }
    }
    Ok(())
}

fn write_zip_entry(
    entry: &mut impl std::io::Read,
    mode: Option<u32>,
    target: &Path,
) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = File::create(target)?;
    std::io::copy(entry, &mut out)?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(target, std::fs::Permissions::from_mode(mode & 0o777))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

/// Validate that an entry path does not escape the destination directory
/// via `..` components or absolute paths.
fn validate_entry_path(path: &Path) -> Result<(), ExtractionError> {
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)));
    if escapes {
        return Err(ExtractionError::PathTraversal {
            path: path.display().to_string(),
        });
    }
    Ok(())
}

/// The system `tar`, with a ranked `zstd` program for `.tar.zst`.
pub struct SystemTarExtractor<'a> {
    executor: &'a dyn CommandExecutor,
    log_dir: Utf8PathBuf,
    log_limit: usize,
    timeout: Duration,
}

impl<'a> SystemTarExtractor<'a> {
    /// Zstandard decompressors in preference order.
    pub const ZSTD_PROGRAMS: [&'static str; 2] = ["zstd", "unzstd"];

    /// Create an extractor that writes its tool log under `log_dir`.
    #[must_use]
    pub fn new(
        executor: &'a dyn CommandExecutor,
        log_dir: &Utf8Path,
        log_limit: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            executor,
            log_dir: log_dir.to_owned(),
            log_limit,
            timeout,
        }
    }

    fn zstd_program(&self) -> Result<&'a str, String> {
        first_program(self.executor, &Self::ZSTD_PROGRAMS)
    }

    fn arguments(
        &self,
        archive: &Utf8Path,
        format: ArchiveFormat,
        dest_dir: &Utf8Path,
    ) -> Result<Vec<String>, ExtractionError> {
        let mut args = match format {
            ArchiveFormat::TarZst => {
                let program = self.zstd_program().map_err(|reason| {
                    ExtractionError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, reason))
                })?;
                vec![
                    "--use-compress-program".to_owned(),
                    program.to_owned(),
                    "-xf".to_owned(),
                ]
            }
            ArchiveFormat::TarGz => vec!["-xzf".to_owned()],
            ArchiveFormat::Tar => vec!["-xf".to_owned()],
            ArchiveFormat::Zip => {
                return Err(ExtractionError::Io(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "tar cannot extract ZIP containers",
                )));
            }
        };
        args.extend(
            [
                archive.as_str(),
                "-C",
                dest_dir.as_str(),
                "--no-same-owner",
                "--no-same-permissions",
            ]
            .map(str::to_owned),
        );
        Ok(args)
    }
}

impl ArtefactExtractor for SystemTarExtractor<'_> {
    fn name(&self) -> &'static str {
        "system tar"
    }

    fn availability(&self, format: ArchiveFormat) -> Availability {
        match format {
            ArchiveFormat::Zip => Availability::Unavailable("tar cannot extract ZIP".to_owned()),
            ArchiveFormat::TarZst => match probe_command(self.executor, "tar", &["--version"]) {
                Availability::Available => match self.zstd_program() {
                    Ok(_) => Availability::Available,
                    Err(reason) => Availability::Unavailable(reason),
                },
                unavailable @ Availability::Unavailable(_) => unavailable,
            },
            ArchiveFormat::TarGz | ArchiveFormat::Tar => {
                probe_command(self.executor, "tar", &["--version"])
            }
        }
    }

    fn extract(
        &self,
        archive: &Utf8Path,
        format: ArchiveFormat,
        dest_dir: &Utf8Path,
    ) -> Result<ToolReport, ExtractionError> {
        let args = self.arguments(archive, format, dest_dir)?;
        let name = archive.file_name().unwrap_or("archive");
        let log_path = self.log_dir.join(format!("{name}.tar.log"));
        let request = CommandRequest::new("tar", args)
            .with_timeout(self.timeout)
            .logging_to(&log_path);
        let output = self.executor.run(&request)?;
        let log = truncate_to_tail(&log_path, self.log_limit).unwrap_or_default();
        Ok(ToolReport {
            clean: output.status.success() && log.trim().is_empty(),
            log,
        })
    }
}

/// The file an extraction must produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedOutput {
    /// Path relative to the extraction directory.
    pub relative_path: Utf8PathBuf,
    /// Whether the output must carry the executable bit.
    pub executable: bool,
}

/// Result of extracting one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractOutcome {
    /// The tool was clean and the output is present.
    Success {
        /// Located output file.
        output: Utf8PathBuf,
    },
    /// The tool complained but the output is present.
    PartialSuccessWithWarnings {
        /// Located output file.
        output: Utf8PathBuf,
        /// Tail of the tool log.
        log: String,
    },
    /// The output could not be confirmed.
    Failure {
        /// Tool log tail or error description.
        diagnostics: String,
    },
}

/// Judge an extraction from the tool report and the located output.
///
/// A tool reporting problems is only overruled when the expected output was
/// positively found.
#[must_use]
pub fn classify_extraction(
    report: &ToolReport,
    located: Option<Utf8PathBuf>,
    expected: &ExpectedOutput,
    diagnostics_limit: usize,
) -> ExtractOutcome {
    match (located, report.clean) {
        (Some(output), true) => ExtractOutcome::Success { output },
        (Some(output), false) => ExtractOutcome::PartialSuccessWithWarnings {
            output,
            log: tail(&report.log, diagnostics_limit).to_owned(),
        },
        (None, true) => ExtractOutcome::Failure {
            diagnostics: format!(
                "extraction reported success but {} was not found",
                expected.relative_path
            ),
        },
        (None, false) => ExtractOutcome::Failure {
            diagnostics: format!(
                "{} was not found; tool output:\n{}",
                expected.relative_path,
                tail(&report.log, diagnostics_limit)
            ),
        },
    }
}

/// Maximum directory depth searched for a relocated output.
pub const SEARCH_MAX_DEPTH: usize = 6;
/// Maximum directory entries inspected while searching.
pub const SEARCH_MAX_ENTRIES: usize = 10_000;

/// Look for the expected output: first at its relative path, then by file
/// name through a bounded breadth-first search.
#[must_use]
pub fn locate_output(dest_dir: &Utf8Path, expected: &ExpectedOutput) -> Option<Utf8PathBuf> {
    let direct = dest_dir.join(&expected.relative_path);
    if direct.is_file() {
        return Some(direct);
    }
    let wanted = expected.relative_path.file_name()?;
    let mut queue = VecDeque::from([(dest_dir.to_owned(), 0usize)]);
    let mut inspected = 0usize;
    while let Some((dir, depth)) = queue.pop_front() {
        let Ok(entries) = dir.read_dir_utf8() else {
            continue;
        };
        for entry in entries.flatten() {
            inspected += 1;
            if inspected > SEARCH_MAX_ENTRIES {
                log::debug!("search in {dest_dir} stopped after {SEARCH_MAX_ENTRIES} entries");
                return None;
            }
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_file() && entry.file_name() == wanted {
                return Some(entry.into_path());
            }
            if file_type.is_dir() && depth < SEARCH_MAX_DEPTH {
                queue.push_back((entry.into_path(), depth + 1));
            }
        }
    }
    None
}

/// Ensure `path` carries the executable bits, returning `true` if it was fixed.
///
/// # Errors
///
/// Returns I/O errors from reading or changing the permissions.
#[cfg(unix)]
pub fn ensure_executable(path: &Utf8Path) -> std::io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)?.permissions().mode();
    if mode & 0o111 == 0o111 {
        return Ok(false);
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode((mode & 0o777) | 0o755))?;
    Ok(true)
}

/// Ensure `path` carries the executable bits, returning `true` if it was fixed.
///
/// # Errors
///
/// Never fails on platforms without Unix permissions.
#[cfg(not(unix))]
pub fn ensure_executable(_path: &Utf8Path) -> std::io::Result<bool> {
    Ok(false)
}

/// Ranked extraction with logging and output confirmation.
pub struct Extraction<'a> {
    providers: Vec<Box<dyn ArtefactExtractor + 'a>>,
    log_dir: Utf8PathBuf,
    log_limit: usize,
}

impl<'a> Extraction<'a> {
    /// Create an extraction front end writing logs under `log_dir`.
    #[must_use]
    pub fn new(
        providers: Vec<Box<dyn ArtefactExtractor + 'a>>,
        log_dir: &Utf8Path,
        log_limit: usize,
    ) -> Self {
        Self {
            providers,
            log_dir: log_dir.to_owned(),
            log_limit,
        }
    }

    /// Extract `archive` into `dest_dir` and confirm `expected` is present.
    pub fn extract(
        &self,
        archive: &Utf8Path,
        dest_dir: &Utf8Path,
        expected: &ExpectedOutput,
    ) -> ExtractOutcome {
        let name = archive.file_name().unwrap_or(archive.as_str());
        let Some(format) = ArchiveFormat::from_file_name(name) else {
            return ExtractOutcome::Failure {
                diagnostics: format!("unsupported archive format: {name}"),
            };
        };

        let Some(provider) = self
            .providers
            .iter()
            .find(|provider| provider.availability(format).is_available())
        else {
            return ExtractOutcome::Failure {
                diagnostics: format!("no extraction tool available for {name}"),
            };
        };

        if let Err(err) = std::fs::create_dir_all(dest_dir) {
            return ExtractOutcome::Failure {
                diagnostics: format!("cannot create {dest_dir}: {err}"),
            };
        }

        log::info!("extracting {archive} into {dest_dir} with {}", provider.name());
        let report = match provider.extract(archive, format, dest_dir) {
            Ok(report) => report,
            Err(err) => {
                return ExtractOutcome::Failure {
                    diagnostics: err.to_string(),
                };
            }
        };
        self.persist_log(name, &report);

        let located = locate_output(dest_dir, expected);
        let outcome = classify_extraction(&report, located, expected, self.log_limit);
        let output = match &outcome {
            ExtractOutcome::Success { output }
            | ExtractOutcome::PartialSuccessWithWarnings { output, .. } => Some(output),
            ExtractOutcome::Failure { .. } => None,
        };
        if expected.executable
            && let Some(output) = output
        {
            match ensure_executable(output) {
                Ok(true) => log::warn!("{output} was not executable; mode fixed"),
                Ok(false) => {}
                Err(err) => {
                    return ExtractOutcome::Failure {
                        diagnostics: format!("cannot make {output} executable: {err}"),
                    };
                }
            }
        }
        outcome
    }

    fn persist_log(&self, name: &str, report: &ToolReport) {
        if report.log.is_empty() {
            return;
        }
        let path = self.log_dir.join(format!("{name}.extract.log"));
        let body = tail(&report.log, self.log_limit);
        let written = std::fs::create_dir_all(&self.log_dir).and_then(|()| std::fs::write(&path, body));
        if let Err(err) = written {
            log::warn!("could not write extraction log {path}: {err}");
        }
    }
}

#[cfg(test)]
#[path = "extraction_tests.rs"]
mod tests;
