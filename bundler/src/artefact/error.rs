//! Error types for artefact value validation.
//!
//! Each variant provides a descriptive message identifying the invalid input
//! and the constraint that was violated.

use thiserror::Error;

/// Errors arising from invalid artefact-related values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtefactError {
    /// A SHA-256 digest is not a valid 64-character hex string.
    #[error("invalid SHA-256 digest: {reason}")]
    InvalidSha256Digest {
        /// Description of the validation failure.
        reason: String,
    },

    /// A hash descriptor could not be interpreted.
    #[error("invalid hash descriptor: {reason}")]
    InvalidDescriptor {
        /// Description of the parse failure.
        reason: String,
    },

    /// An extension identifier is not of the form `namespace/name`.
    #[error("invalid extension id \"{value}\"; expected namespace/name or namespace.name")]
    InvalidExtensionId {
        /// The rejected identifier.
        value: String,
    },
}

/// Result type alias using [`ArtefactError`].
pub type Result<T> = std::result::Result<T, ArtefactError>;
