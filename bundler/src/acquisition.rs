//! Per-artefact acquisition state machine.
//!
//! [`Acquirer::acquire`] decides, for one artefact, whether the copy on disk
//! can be trusted, whether it must be (re)downloaded, and whether it must be
//! extracted. The order of precedence is:
//!
//! 0. A destination below its minimum size is removed with its marker and
//!    descriptor before anything else. A fresh download below it fails
//!    before it is hashed.
//! 1. A valid verified marker short-circuits to success.
//! 2. In skip-verification mode an existing file is accepted unhashed.
//! 3. A file with a descriptor is verified; a corrupt file is removed.
//! 4. A file without a descriptor is re-fetched, unless the artefact allows
//!    trust-on-first-use. Without a source it is kept and the artefact fails.
//! 5. Otherwise the file is fetched, its descriptor obtained, and step 3
//!    runs again.
//! 6. Archives are extracted once the file is trusted. Only the marker fast
//!    path may reuse output that is already extracted.
//!
//! Unexpected filesystem errors fail the artefact immediately. Failures are
//! reported, never propagated: one artefact cannot abort the run.

use crate::artefact::descriptor::{self, DescriptorKind, DescriptorSpec};
use crate::artefact::extraction::{ExpectedOutput, ExtractOutcome, Extraction, locate_output};
use crate::artefact::marker::{self, MarkerCheck};
use crate::artefact::retry::{Fetcher, RetryOutcome};
use crate::artefact::sha256_digest::Sha256Digest;
use crate::artefact::verification::{DigestBasis, DigestError, Verdict, Verifier};
use crate::ledger::{Component, Status};
use camino::{Utf8Path, Utf8PathBuf};
use std::fmt;

/// Integrity failures tolerated per artefact per run; the first triggers
/// exactly one re-fetch, the second is final.
pub const MAX_INTEGRITY_FAILURES: u32 = 2;

/// Where the descriptor for a downloaded artefact comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorSource {
    /// A descriptor published next to the artefact, in the artefact's dialect.
    Remote {
        /// Descriptor URL.
        url: String,
    },
    /// A checksum list covering several files; the artefact's entry is used.
    ChecksumList {
        /// Checksum list URL.
        url: String,
    },
    /// No published digest; the downloaded file is hashed locally.
    Local,
}

/// How to download an artefact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    /// Download URL.
    pub url: String,
    /// Descriptor origin.
    pub descriptor: DescriptorSource,
}

impl Source {
    /// A download with a descriptor published at `descriptor_url`.
    #[must_use]
    pub fn with_remote_descriptor(url: impl Into<String>, descriptor_url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            descriptor: DescriptorSource::Remote {
                url: descriptor_url.into(),
            },
        }
    }
}

/// Extraction requirements for an archive artefact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSpec {
    /// Directory the archive is extracted into.
    pub extract_to: Utf8PathBuf,
    /// File the extraction must produce.
    pub expected: ExpectedOutput,
}

/// A named unit of acquisition, built fresh every run.
///
/// # Examples
///
/// ```
/// use airgap_bundler::acquisition::{Artefact, Source};
/// use airgap_bundler::artefact::descriptor::DescriptorKind;
/// use airgap_bundler::ledger::Component;
///
/// let artefact = Artefact::new(
///     "VSCodium",
///     Component::EditorPackage,
///     "/bundle/vscodium/codium_1.90_amd64.deb",
///     DescriptorKind::FilenameHash,
/// )
/// .with_source(Source::with_remote_descriptor(
///     "https://example.test/codium_1.90_amd64.deb",
///     "https://example.test/codium_1.90_amd64.deb.sha256",
/// ));
/// assert_eq!(
///     artefact.descriptor().path.as_str(),
///     "/bundle/vscodium/codium_1.90_amd64.deb.sha256"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artefact {
    /// Display name.
    pub name: String,
    /// Ledger component the artefact belongs to.
    pub component: Component,
    /// Primary file.
    pub destination: Utf8PathBuf,
    /// Dialect of the descriptor at `<destination>.sha256`.
    pub descriptor_kind: DescriptorKind,
    /// Download source; `None` when metadata could not be resolved.
    pub source: Option<Source>,
    /// Extraction requirements for archives.
    pub archive: Option<ArchiveSpec>,
    /// Smallest plausible size; anything smaller is a stub.
    pub minimum_size: Option<u64>,
    /// Accept a local file without a descriptor by hashing it.
    pub accept_without_descriptor: bool,
}

impl Artefact {
    /// Describe an artefact with no source, archive or size floor.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        component: Component,
        destination: impl Into<Utf8PathBuf>,
        descriptor_kind: DescriptorKind,
    ) -> Self {
        Self {
            name: name.into(),
            component,
            destination: destination.into(),
            descriptor_kind,
            source: None,
            archive: None,
            minimum_size: None,
            accept_without_descriptor: false,
        }
    }

    /// Set the download source.
    #[must_use]
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    /// Extract the artefact after it is trusted.
    #[must_use]
    pub fn with_archive(mut self, archive: ArchiveSpec) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Reject files smaller than `bytes`.
    #[must_use]
    pub fn with_minimum_size(mut self, bytes: u64) -> Self {
        self.minimum_size = Some(bytes);
        self
    }

    /// Allow trust-on-first-use for a local file without a descriptor.
    #[must_use]
    pub fn accepting_without_descriptor(mut self) -> Self {
        self.accept_without_descriptor = true;
        self
    }

    /// The descriptor location and dialect.
    #[must_use]
    pub fn descriptor(&self) -> DescriptorSpec {
        DescriptorSpec::for_artefact(&self.destination, self.descriptor_kind)
    }

    fn file_name(&self) -> &str {
        self.destination
            .file_name()
            .unwrap_or(self.destination.as_str())
    }
}

/// States visited while acquiring an artefact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// Nothing examined yet.
    NotStarted,
    /// A valid marker was found.
    AlreadyVerified,
    /// The file must be downloaded.
    NeedsFetch,
    /// A download is in progress.
    Fetching,
    /// The file is being checked against its descriptor.
    Verifying,
    /// The archive is being extracted.
    Extracting,
    /// Terminal: the artefact is usable.
    Succeeded,
    /// Terminal: the artefact could not be acquired.
    Failed,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotStarted => "not-started",
            Self::AlreadyVerified => "already-verified",
            Self::NeedsFetch => "needs-fetch",
            Self::Fetching => "fetching",
            Self::Verifying => "verifying",
            Self::Extracting => "extracting",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// Result of acquiring one artefact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionReport {
    /// Display name of the artefact.
    pub name: String,
    /// Terminal status.
    pub status: Status,
    /// Human-readable explanation.
    pub detail: String,
    /// States visited, in order.
    pub trace: Vec<AcquisitionState>,
    /// Downloads started.
    pub fetches: u32,
    /// Integrity failures observed.
    pub integrity_failures: u32,
    /// Extracted output, for archive artefacts.
    pub output: Option<Utf8PathBuf>,
}

impl AcquisitionReport {
    /// Returns `true` if the artefact ended as a success.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == Status::Success
    }
}

/// Reasons an acquisition fails. Every variant ends up in the report detail.
#[derive(Debug, thiserror::Error)]
enum AcquireError {
    #[error("no download source and no usable local copy")]
    NoSource,

    #[error("download failed after {attempts} attempts: {error}")]
    Exhausted {
        attempts: u32,
        error: crate::artefact::download::DownloadError,
    },

    #[error("download failed: {error}")]
    Fatal {
        error: crate::artefact::download::DownloadError,
    },

    #[error("download is {size} bytes, below the {minimum}-byte minimum")]
    Undersized { size: u64, minimum: u64 },

    #[error("descriptor unavailable: {reason}")]
    Descriptor { reason: String },

    #[error("checksum mismatch after re-download: expected {expected}, got {actual}")]
    IntegrityExhausted {
        expected: Sha256Digest,
        actual: Sha256Digest,
    },

    #[error("{0}")]
    Verification(Verdict),

    #[error(transparent)]
    Digest(#[from] DigestError),

    #[error("{action} {path}: {source}")]
    Filesystem {
        action: &'static str,
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("extraction failed: {diagnostics}")]
    Extraction { diagnostics: String },
}

fn fs_error(action: &'static str, path: &Utf8Path) -> impl FnOnce(std::io::Error) -> AcquireError {
    let path = path.to_owned();
    move |source| AcquireError::Filesystem {
        action,
        path,
        source,
    }
}

/// Outcome of judging the file currently on disk.
enum Judgement {
    Trusted { detail: String },
    Corrupt { expected: Sha256Digest, actual: Sha256Digest },
    Untrusted,
}

/// Mutable bookkeeping for one acquisition.
struct Attempt<'r> {
    artefact: &'r Artefact,
    trace: Vec<AcquisitionState>,
    fetches: u32,
    integrity_failures: u32,
}

impl Attempt<'_> {
    fn enter(&mut self, state: AcquisitionState) {
        log::debug!("{}: {state}", self.artefact.name);
        self.trace.push(state);
    }
}

/// Drives artefacts through fetch, verification and extraction.
pub struct Acquirer<'a> {
    fetcher: &'a Fetcher<'a>,
    verifier: &'a Verifier<'a>,
    extraction: &'a Extraction<'a>,
    skip_verification: bool,
}

impl<'a> Acquirer<'a> {
    /// Combine the building blocks. With `skip_verification` an existing
    /// file is accepted without hashing.
    #[must_use]
    pub fn new(
        fetcher: &'a Fetcher<'a>,
        verifier: &'a Verifier<'a>,
        extraction: &'a Extraction<'a>,
        skip_verification: bool,
    ) -> Self {
        Self {
            fetcher,
            verifier,
            extraction,
            skip_verification,
        }
    }

    /// The fetcher in use, for collaborators that fetch metadata.
    #[must_use]
    pub fn fetcher(&self) -> &'a Fetcher<'a> {
        self.fetcher
    }

    /// Acquire `artefact`, returning the terminal status and the trace.
    #[must_use]
    pub fn acquire(&self, artefact: &Artefact) -> AcquisitionReport {
        let mut attempt = Attempt {
            artefact,
            trace: vec![AcquisitionState::NotStarted],
            fetches: 0,
            integrity_failures: 0,
        };

        let result = self
            .make_trusted(&mut attempt)
            .and_then(|detail| self.extract_if_needed(&mut attempt, detail));

        let (status, detail, output) = match result {
            Ok((detail, output)) => {
                attempt.enter(AcquisitionState::Succeeded);
                log::info!("{}: {detail}", artefact.name);
                (Status::Success, detail, output)
            }
            Err(err) => {
                attempt.enter(AcquisitionState::Failed);
                log::warn!("{}: {err}", artefact.name);
                (Status::Failed, err.to_string(), None)
            }
        };

        AcquisitionReport {
            name: artefact.name.clone(),
            status,
            detail,
            trace: attempt.trace,
            fetches: attempt.fetches,
            integrity_failures: attempt.integrity_failures,
            output,
        }
    }

    /// Steps 0 to 5: end with a trusted file on disk.
    fn make_trusted(&self, attempt: &mut Attempt<'_>) -> Result<String, AcquireError> {
        let artefact = attempt.artefact;
        let destination = &artefact.destination;
        let descriptor = artefact.descriptor();

        remove_undersized(artefact, &descriptor)?;

        let expected = descriptor::read_expected(&descriptor, artefact.file_name());
        match marker::check(destination, expected.as_ref())
            .map_err(fs_error("cannot read marker for", destination))?
        {
            MarkerCheck::Valid(record) => {
                attempt.enter(AcquisitionState::AlreadyVerified);
                return Ok(format!("already verified ({})", short(&record.sha256)));
            }
            MarkerCheck::Stale { reason } => {
                log::warn!("{}: ignoring stale marker: {reason}", artefact.name);
                marker::remove(destination).map_err(fs_error("cannot remove marker for", destination))?;
            }
            MarkerCheck::Absent => {}
        }

        if self.skip_verification && destination.is_file() {
            log::warn!("{}: verification skipped; using {destination} unchecked", artefact.name);
            return Ok("present (verification skipped)".to_owned());
        }

        if destination.is_file() {
            match self.judge_local(attempt, &descriptor)? {
                Judgement::Trusted { detail } => return Ok(detail),
                Judgement::Corrupt { expected, actual } => {
                    self.record_corruption(attempt, &descriptor, &expected, &actual)?;
                }
                Judgement::Untrusted if artefact.source.is_none() => {
                    log::warn!("{}: keeping {destination}; nothing to replace it with", artefact.name);
                    return Err(AcquireError::NoSource);
                }
                Judgement::Untrusted => {
                    marker::remove_artefact(destination, Some(&descriptor.path))
                        .map_err(fs_error("cannot remove", destination))?;
                }
            }
        }

        loop {
            attempt.enter(AcquisitionState::NeedsFetch);
            let source = artefact.source.as_ref().ok_or(AcquireError::NoSource)?;
            self.fetch(attempt, source)?;
            if let Some((size, minimum)) = remove_undersized(artefact, &descriptor)? {
                return Err(AcquireError::Undersized { size, minimum });
            }
            self.obtain_descriptor(artefact, source, &descriptor)?;

            attempt.enter(AcquisitionState::Verifying);
            match self.verify(artefact, &descriptor)? {
                Judgement::Trusted { detail } => {
                    return Ok(format!("downloaded, {detail}"));
                }
                Judgement::Corrupt { expected, actual } => {
                    self.record_corruption(attempt, &descriptor, &expected, &actual)?;
                }
                Judgement::Untrusted if artefact.accept_without_descriptor => {
                    let detail = self.trust_on_first_use(artefact, &descriptor)?;
                    return Ok(format!("downloaded, {detail}"));
                }
                Judgement::Untrusted => {
                    marker::remove_artefact(destination, Some(&descriptor.path))
                        .map_err(fs_error("cannot remove", destination))?;
                    return Err(AcquireError::Descriptor {
                        reason: format!("{} is unusable", descriptor.path),
                    });
                }
            }
        }
    }

    /// Steps 3 and 4 for a file that was already on disk.
    fn judge_local(
        &self,
        attempt: &mut Attempt<'_>,
        descriptor: &DescriptorSpec,
    ) -> Result<Judgement, AcquireError> {
        let artefact = attempt.artefact;
        if descriptor.path.is_file() {
            attempt.enter(AcquisitionState::Verifying);
            match self.verify(artefact, descriptor)? {
                Judgement::Untrusted => {}
                judged => return Ok(judged),
            }
        }
        if artefact.accept_without_descriptor {
            attempt.enter(AcquisitionState::Verifying);
            let detail = self.trust_on_first_use(artefact, descriptor)?;
            return Ok(Judgement::Trusted { detail });
        }
        log::warn!(
            "{}: {} has no usable descriptor; downloading again",
            artefact.name,
            artefact.destination
        );
        Ok(Judgement::Untrusted)
    }

    fn verify(
        &self,
        artefact: &Artefact,
        descriptor: &DescriptorSpec,
    ) -> Result<Judgement, AcquireError> {
        let verdict = self
            .verifier
            .verify(&artefact.destination, &descriptor.path, descriptor.kind);
        match verdict {
            Verdict::Authentic { digest, basis } => {
                marker::write(&artefact.destination, &digest)
                    .map_err(fs_error("cannot write marker for", &artefact.destination))?;
                let detail = match basis {
                    DigestBasis::Descriptor => format!("verified ({})", digest.short()),
                    DigestBasis::SelfComputed => {
                        format!("accepted on its own digest ({})", digest.short())
                    }
                };
                Ok(Judgement::Trusted { detail })
            }
            Verdict::Corrupt { expected, actual } => Ok(Judgement::Corrupt { expected, actual }),
            Verdict::MissingDescriptor { reason } => {
                log::warn!("{}: {reason}", artefact.name);
                Ok(Judgement::Untrusted)
            }
            Verdict::MissingFile => Err(AcquireError::Filesystem {
                action: "file vanished during verification:",
                path: artefact.destination.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
            other @ (Verdict::ToolUnavailable { .. } | Verdict::Unreadable { .. }) => {
                Err(AcquireError::Verification(other))
            }
        }
    }

    fn trust_on_first_use(
        &self,
        artefact: &Artefact,
        descriptor: &DescriptorSpec,
    ) -> Result<String, AcquireError> {
        let digest = self.verifier.compute(&artefact.destination)?;
        log::warn!(
            "{}: no published digest; trusting {} on first use ({})",
            artefact.name,
            artefact.destination,
            digest.short()
        );
        descriptor::write_descriptor(descriptor, &digest, artefact.file_name())
            .map_err(fs_error("cannot write descriptor", &descriptor.path))?;
        marker::write(&artefact.destination, &digest)
            .map_err(fs_error("cannot write marker for", &artefact.destination))?;
        Ok(format!("trusted on first use ({})", digest.short()))
    }

    fn record_corruption(
        &self,
        attempt: &mut Attempt<'_>,
        descriptor: &DescriptorSpec,
        expected: &Sha256Digest,
        actual: &Sha256Digest,
    ) -> Result<(), AcquireError> {
        let artefact = attempt.artefact;
        attempt.integrity_failures += 1;
        log::warn!(
            "{}: checksum mismatch (expected {}, got {}); removing {}",
            artefact.name,
            expected.short(),
            actual.short(),
            artefact.destination
        );
        marker::remove_artefact(&artefact.destination, Some(&descriptor.path))
            .map_err(fs_error("cannot remove", &artefact.destination))?;
        if attempt.integrity_failures >= MAX_INTEGRITY_FAILURES {
            return Err(AcquireError::IntegrityExhausted {
                expected: expected.clone(),
                actual: actual.clone(),
            });
        }
        Ok(())
    }

    fn fetch(&self, attempt: &mut Attempt<'_>, source: &Source) -> Result<(), AcquireError> {
        attempt.enter(AcquisitionState::Fetching);
        attempt.fetches += 1;
        match self.fetcher.fetch(&source.url, &attempt.artefact.destination) {
            RetryOutcome::Success { value, .. } => {
                log::debug!("{}: downloaded {value} bytes", attempt.artefact.name);
                Ok(())
            }
            RetryOutcome::ExhaustedRetries {
                attempts,
                last_error,
            } => Err(AcquireError::Exhausted {
                attempts,
                error: last_error,
            }),
            RetryOutcome::Fatal { error, .. } => Err(AcquireError::Fatal { error }),
        }
    }

    /// Put a descriptor next to a freshly downloaded file.
    fn obtain_descriptor(
        &self,
        artefact: &Artefact,
        source: &Source,
        descriptor: &DescriptorSpec,
    ) -> Result<(), AcquireError> {
        let fetched = match &source.descriptor {
            DescriptorSource::Local => return self.write_local_descriptor(artefact, descriptor),
            DescriptorSource::Remote { url } => self
                .fetcher
                .fetch_text(url)
                .into_result()
                .map_err(|err| err.to_string()),
            DescriptorSource::ChecksumList { url } => self
                .fetcher
                .fetch_text(url)
                .into_result()
                .map_err(|err| err.to_string())
                .and_then(|list| {
                    descriptor::digest_for_file(&list, artefact.file_name())
                        .map(|digest| descriptor::render(descriptor.kind, &digest, artefact.file_name()))
                        .map_err(|err| err.to_string())
                }),
        };
        match fetched {
            Ok(content) => marker::write_atomic(&descriptor.path, content.as_bytes())
                .map_err(fs_error("cannot write descriptor", &descriptor.path)),
            Err(reason) if artefact.accept_without_descriptor => {
                log::warn!("{}: {reason}; computing the digest locally", artefact.name);
                self.write_local_descriptor(artefact, descriptor)
            }
            Err(reason) => Err(AcquireError::Descriptor { reason }),
        }
    }

    fn write_local_descriptor(
        &self,
        artefact: &Artefact,
        descriptor: &DescriptorSpec,
    ) -> Result<(), AcquireError> {
        let digest = self.verifier.compute(&artefact.destination)?;
        descriptor::write_descriptor(descriptor, &digest, artefact.file_name())
            .map_err(fs_error("cannot write descriptor", &descriptor.path))
    }

    /// Step 6: extract trusted archives. Existing output is reused only when
    /// the marker vouched for the archive without a fetch.
    fn extract_if_needed(
        &self,
        attempt: &mut Attempt<'_>,
        detail: String,
    ) -> Result<(String, Option<Utf8PathBuf>), AcquireError> {
        let artefact = attempt.artefact;
        let Some(archive) = &artefact.archive else {
            return Ok((detail, None));
        };
        if let Some(output) = locate_output(&archive.extract_to, &archive.expected) {
            if attempt.trace.contains(&AcquisitionState::AlreadyVerified) {
                log::debug!("{}: {output} already extracted", artefact.name);
                return Ok((detail, Some(output)));
            }
            log::debug!("{}: replacing {output} from the new archive", artefact.name);
            std::fs::remove_file(&output).map_err(fs_error("cannot remove", &output))?;
        }
        attempt.enter(AcquisitionState::Extracting);
        match self
            .extraction
            .extract(&artefact.destination, &archive.extract_to, &archive.expected)
        {
            ExtractOutcome::Success { output } => Ok((format!("{detail}, extracted"), Some(output))),
            ExtractOutcome::PartialSuccessWithWarnings { output, log } => {
                log::warn!("{}: extraction reported problems:\n{log}", artefact.name);
                Ok((format!("{detail}, extracted with warnings"), Some(output)))
            }
            ExtractOutcome::Failure { diagnostics } => Err(AcquireError::Extraction { diagnostics }),
        }
    }
}

/// A file below the size floor is a stub, whatever its marker says. Returns
/// the size and the floor when the file was removed.
fn remove_undersized(
    artefact: &Artefact,
    descriptor: &DescriptorSpec,
) -> Result<Option<(u64, u64)>, AcquireError> {
    let Some(minimum) = artefact.minimum_size else {
        return Ok(None);
    };
    let destination = &artefact.destination;
    let size = match destination.metadata() {
        Ok(metadata) => metadata.len(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(fs_error("cannot inspect", destination)(err)),
    };
    if size >= minimum {
        return Ok(None);
    }
    log::warn!(
        "{}: {destination} is {size} bytes, below the {minimum}-byte minimum; removing it",
        artefact.name
    );
    marker::remove_artefact(destination, Some(&descriptor.path))
        .map_err(fs_error("cannot remove", destination))?;
    Ok(Some((size, minimum)))
}

fn short(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}

#[cfg(test)]
#[path = "acquisition_tests.rs"]
mod tests;
