//! Acquisition building blocks for a single artefact.
//!
//! These modules know nothing about bundles or components; the acquisition
//! state machine in [`crate::acquisition`] combines them.
//!
//! # Sub-modules
//!
//! - [`bounded_log`] - Size-capped tool logs.
//! - [`descriptor`] - Hash descriptor dialects (`FilenameHash`, `BareHash`).
//! - [`download`] - Single download attempts and failure classification.
//! - [`error`] - Validation errors for digests, descriptors and identifiers.
//! - [`extraction`] - Archive extraction with output confirmation.
//! - [`marker`] - Verified markers bound to the file they attest.
//! - [`retry`] - Bounded retries with exponential backoff.
//! - [`sha256_digest`] - SHA-256 digest newtype (`Sha256Digest`).
//! - [`verification`] - Integrity verdicts from ranked digest providers.

pub mod bounded_log;
pub mod descriptor;
pub mod download;
pub mod error;
pub mod extraction;
pub mod marker;
pub mod retry;
pub mod sha256_digest;
pub mod verification;
