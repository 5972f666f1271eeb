//! Error types for the bundler binary.
//!
//! Only problems that stop the whole run live here: an unsupported host, an
//! invalid configuration, or a bundle directory that cannot be prepared.
//! Artefact failures are recorded in the ledger instead.

use crate::config::ConfigError;
use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors that end a bundler run with a non-zero exit code.
#[derive(Debug, Error)]
pub enum BundlerError {
    /// The host is not the platform the bundle targets.
    #[error(
        "unsupported platform {os}/{arch}; bundles target linux/x86_64 (pass --skip-platform-check to run anyway)"
    )]
    UnsupportedPlatform {
        /// Host operating system.
        os: &'static str,
        /// Host architecture.
        arch: &'static str,
    },

    /// The configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The bundle directory could not be prepared.
    #[error("cannot prepare bundle directory {path}: {reason}")]
    Workspace {
        /// Directory that failed.
        path: Utf8PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// An I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to write output.
    #[error("failed to write output")]
    WriteFailed {
        /// The underlying error that caused the write to fail.
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias using [`BundlerError`].
pub type Result<T> = std::result::Result<T, BundlerError>;

/// Fail unless the host is Linux on x86_64.
///
/// # Errors
///
/// Returns [`BundlerError::UnsupportedPlatform`] naming the host.
pub fn check_platform(os: &'static str, arch: &'static str) -> Result<()> {
    if os == "linux" && arch == "x86_64" {
        Ok(())
    } else {
        Err(BundlerError::UnsupportedPlatform { os, arch })
    }
}
