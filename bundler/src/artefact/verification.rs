//! Integrity verification of downloaded artefacts.
//!
//! The [`Verifier`] compares a file against its companion hash descriptor and
//! returns a [`Verdict`]. It never touches markers, never deletes files and
//! never uses the network: acting on the verdict is the caller's job.
//!
//! Digests are computed by the first available [`DigestProvider`]. The
//! built-in `sha2` provider is always available, so the `sha256sum` command
//! only matters when a verifier is assembled without it.

use super::descriptor::{BareContent, DescriptorKind, digest_for_file, interpret_bare};
use super::sha256_digest::Sha256Digest;
use crate::tools::{
    Availability, Capability, CommandExecutor, CommandRequest, first_available, probe_command,
};
use camino::{Utf8Path, Utf8PathBuf};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::time::Duration;
use thiserror::Error;

/// Where the digest in an authentic verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestBasis {
    /// Compared against a digest recorded in the descriptor.
    Descriptor,
    /// The descriptor was an error page, so the file's own digest was used.
    SelfComputed,
}

/// Outcome of verifying one file against its descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The file matches.
    Authentic {
        /// Digest of the file.
        digest: Sha256Digest,
        /// How the digest was established.
        basis: DigestBasis,
    },
    /// The file does not match the descriptor.
    Corrupt {
        /// Digest recorded in the descriptor.
        expected: Sha256Digest,
        /// Digest of the file on disk.
        actual: Sha256Digest,
    },
    /// The file does not exist.
    MissingFile,
    /// The descriptor is absent or unusable.
    MissingDescriptor {
        /// Why the descriptor could not be used.
        reason: String,
    },
    /// No digest provider is available.
    ToolUnavailable {
        /// Combined rejection reasons from the providers.
        reason: String,
    },
    /// The file or descriptor exists but could not be read.
    Unreadable {
        /// Path that could not be read.
        path: Utf8PathBuf,
        /// OS error classification.
        kind: ErrorKind,
        /// OS error message.
        reason: String,
    },
}

impl Verdict {
    fn unreadable(path: &Utf8Path, err: &std::io::Error) -> Self {
        Self::Unreadable {
            path: path.to_owned(),
            kind: err.kind(),
            reason: err.to_string(),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentic {
                digest,
                basis: DigestBasis::Descriptor,
            } => write!(f, "authentic ({})", digest.short()),
            Self::Authentic {
                digest,
                basis: DigestBasis::SelfComputed,
            } => write!(f, "accepted on self-computed digest ({})", digest.short()),
            Self::Corrupt { expected, actual } => write!(
                f,
                "checksum mismatch: expected {}, got {}",
                expected.short(),
                actual.short()
            ),
            Self::MissingFile => write!(f, "file missing"),
            Self::MissingDescriptor { reason } => write!(f, "descriptor unusable: {reason}"),
            Self::ToolUnavailable { reason } => write!(f, "no SHA-256 tool available: {reason}"),
            Self::Unreadable { path, reason, .. } => write!(f, "cannot read {path}: {reason}"),
        }
    }
}

/// Errors from computing a digest outside of a full verification.
#[derive(Debug, Error)]
pub enum DigestError {
    /// No digest provider is available.
    #[error("no SHA-256 tool available: {reason}")]
    ToolUnavailable {
        /// Combined rejection reasons from the providers.
        reason: String,
    },

    /// The file could not be read.
    #[error("cannot hash {path}: {source}")]
    Io {
        /// File being hashed.
        path: Utf8PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

/// A ranked source of SHA-256 digests.
pub trait DigestProvider: Capability {
    /// Hash the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the file cannot be read or the tool fails.
    fn digest(&self, path: &Utf8Path) -> std::io::Result<Sha256Digest>;
}

/// In-process hashing with the `sha2` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinSha256;

impl Capability for BuiltinSha256 {
    fn name(&self) -> &str {
        "sha2"
    }

    fn availability(&self) -> Availability {
        Availability::Available
    }
}

impl DigestProvider for BuiltinSha256 {
    fn digest(&self, path: &Utf8Path) -> std::io::Result<Sha256Digest> {
        let file = File::open(path)?;
        Sha256Digest::from_reader(BufReader::new(file))
    }
}

/// The coreutils `sha256sum` command.
pub struct Sha256sumCommand<'a> {
    executor: &'a dyn CommandExecutor,
}

impl<'a> Sha256sumCommand<'a> {
    /// Create a provider that runs `sha256sum` through `executor`.
    #[must_use]
    pub fn new(executor: &'a dyn CommandExecutor) -> Self {
        Self { executor }
    }
}

const SHA256SUM_TIMEOUT: Duration = Duration::from_secs(600);

impl Capability for Sha256sumCommand<'_> {
    fn name(&self) -> &str {
        "sha256sum"
    }

    fn availability(&self) -> Availability {
        probe_command(self.executor, "sha256sum", &["--version"])
    }
}

impl DigestProvider for Sha256sumCommand<'_> {
    fn digest(&self, path: &Utf8Path) -> std::io::Result<Sha256Digest> {
        let request =
            CommandRequest::new("sha256sum", ["--", path.as_str()]).with_timeout(SHA256SUM_TIMEOUT);
        let output = self
            .executor
            .run(&request)
            .map_err(std::io::Error::other)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(std::io::Error::other(format!(
                "sha256sum failed: {}",
                stderr.trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let token = stdout.split_whitespace().next().unwrap_or_default();
        Sha256Digest::parse(token).map_err(|err| std::io::Error::new(ErrorKind::InvalidData, err))
    }
}

/// Judges files against hash descriptors.
///
/// # Examples
///
/// ```no_run
/// use airgap_bundler::artefact::descriptor::DescriptorKind;
/// use airgap_bundler::artefact::verification::{Verdict, Verifier};
/// use camino::Utf8Path;
///
/// let verifier = Verifier::builtin();
/// let verdict = verifier.verify(
///     Utf8Path::new("bundle/vscodium/codium_1.90_amd64.deb"),
///     Utf8Path::new("bundle/vscodium/codium_1.90_amd64.deb.sha256"),
///     DescriptorKind::FilenameHash,
/// );
/// assert!(matches!(verdict, Verdict::Authentic { .. }));
/// ```
pub struct Verifier<'a> {
    providers: Vec<Box<dyn DigestProvider + 'a>>,
}

impl<'a> Verifier<'a> {
    /// Use the given providers in preference order.
    #[must_use]
    pub fn with_providers(providers: Vec<Box<dyn DigestProvider + 'a>>) -> Self {
        Self { providers }
    }

    /// Use only the in-process provider.
    #[must_use]
    pub fn builtin() -> Self {
        Self::with_providers(vec![Box::new(BuiltinSha256)])
    }

    /// The standard ranking: in-process hashing, then `sha256sum`.
    #[must_use]
    pub fn standard(executor: &'a dyn CommandExecutor) -> Self {
        Self::with_providers(vec![
            Box::new(BuiltinSha256),
            Box::new(Sha256sumCommand::new(executor)),
        ])
    }

    /// Compute the digest of `file` with the best available provider.
    ///
    /// # Errors
    ///
    /// Returns [`DigestError`] when no provider is available or the file
    /// cannot be read.
    pub fn compute(&self, file: &Utf8Path) -> Result<Sha256Digest, DigestError> {
        let provider = first_available(self.providers.iter().map(|provider| &**provider))
            .map_err(|reason| DigestError::ToolUnavailable { reason })?;
        provider.digest(file).map_err(|source| DigestError::Io {
            path: file.to_owned(),
            source,
        })
    }

    /// Verify `file` against the descriptor at `descriptor`.
    #[must_use]
    pub fn verify(&self, file: &Utf8Path, descriptor: &Utf8Path, kind: DescriptorKind) -> Verdict {
        match std::fs::metadata(file) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Verdict::MissingFile,
            Err(err) => return Verdict::unreadable(file, &err),
        }

        let content = match std::fs::read_to_string(descriptor) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Verdict::MissingDescriptor {
                    reason: format!("{descriptor} not found"),
                };
            }
            Err(err) if err.kind() == ErrorKind::InvalidData => {
                return Verdict::MissingDescriptor {
                    reason: format!("{descriptor} is not text"),
                };
            }
            Err(err) => return Verdict::unreadable(descriptor, &err),
        };

        let expected = match kind {
            DescriptorKind::FilenameHash => {
                let file_name = file.file_name().unwrap_or(file.as_str());
                match digest_for_file(&content, file_name) {
                    Ok(digest) => digest,
                    Err(err) => {
                        return Verdict::MissingDescriptor {
                            reason: err.to_string(),
                        };
                    }
                }
            }
            DescriptorKind::BareHash => match interpret_bare(&content) {
                BareContent::Digest(digest) => digest,
                BareContent::ErrorPage => {
                    log::warn!(
                        "descriptor {descriptor} looks like an error page; accepting {file} on its own digest"
                    );
                    return self.judge(file, None);
                }
                BareContent::Malformed(reason) => return Verdict::MissingDescriptor { reason },
            },
        };

        self.judge(file, Some(expected))
    }

    fn judge(&self, file: &Utf8Path, expected: Option<Sha256Digest>) -> Verdict {
        let actual = match self.compute(file) {
            Ok(digest) => digest,
            Err(DigestError::ToolUnavailable { reason }) => {
                return Verdict::ToolUnavailable { reason };
            }
            Err(DigestError::Io { path, source }) => return Verdict::unreadable(&path, &source),
        };
        match expected {
            None => Verdict::Authentic {
                digest: actual,
                basis: DigestBasis::SelfComputed,
            },
            Some(expected) if expected == actual => Verdict::Authentic {
                digest: actual,
                basis: DigestBasis::Descriptor,
            },
            Some(expected) => Verdict::Corrupt { expected, actual },
        }
    }
}

#[cfg(test)]
#[path = "verification_tests.rs"]
mod tests;
