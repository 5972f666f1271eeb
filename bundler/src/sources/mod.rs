//! Adapters that turn upstream names into artefacts and tool invocations.
//!
//! Sources only resolve names to URLs and digests, or drive a package tool
//! into a bundle directory. Whether a file is downloaded, trusted or
//! extracted is decided by [`crate::acquisition`].
//!
//! # Sub-modules
//!
//! - [`model_runtime`] - Model pulls through a temporary `ollama serve`.
//! - [`openvsx`] - Extension metadata from an Open VSX registry.
//! - [`packages`] - `apt-get`, `cargo vendor` and `pip` into the bundle.
//! - [`releases`] - GitHub "latest release" metadata for the runtime and editor.
//! - [`rustup`] - The `rustup-init` installer.

pub mod model_runtime;
pub mod openvsx;
pub mod packages;
pub mod releases;
pub mod rustup;

use crate::artefact::download::DownloadError;
use thiserror::Error;

/// Errors raised while resolving upstream metadata.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The metadata request failed.
    #[error("cannot fetch metadata from {url}: {source}")]
    Metadata {
        /// Metadata URL.
        url: String,
        /// Final download error.
        #[source]
        source: DownloadError,
    },

    /// The metadata could not be interpreted.
    #[error("unexpected metadata from {url}: {reason}")]
    InvalidMetadata {
        /// Metadata URL.
        url: String,
        /// What was wrong with it.
        reason: String,
    },

    /// No published asset matches what the bundle needs.
    #[error("no {wanted} asset in release {tag}; available: {available}")]
    NoMatchingAsset {
        /// Description of the wanted asset.
        wanted: &'static str,
        /// Release tag that was searched.
        tag: String,
        /// Comma-separated names of the first published assets.
        available: String,
    },

    /// An identifier in the configuration is malformed.
    #[error(transparent)]
    Artefact(#[from] crate::artefact::error::ArtefactError),
}

/// Result type alias using [`SourceError`].
pub type Result<T> = std::result::Result<T, SourceError>;
