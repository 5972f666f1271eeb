//! Airgap bundler library.
//!
//! This crate downloads third-party artefacts into a single bundle directory
//! that a disconnected machine can install from. Every artefact is verified
//! against a published SHA-256 digest, marked once trusted, and re-used on
//! later runs. It is used by the `airgap-bundler` CLI binary and can be
//! driven programmatically with stub collaborators for testing.
//!
//! # Modules
//!
//! - [`acquisition`] - Per-artefact fetch, verify and extract state machine
//! - [`artefact`] - Digests, descriptors, markers, downloads and extraction
//! - [`cli`] - Command-line argument definitions
//! - [`config`] - `config.toml` loading and CLI overrides
//! - [`dirs`] - Directory resolution abstraction for platform-specific paths
//! - [`error`] - Errors that end a run
//! - [`ledger`] - Per-component outcomes and the closing summary
//! - [`output`] - Progress lines and dry-run reporting
//! - [`pipeline`] - Component orchestration
//! - [`sources`] - Upstream metadata and package tools
//! - [`tools`] - External command execution and capability probing
//! - [`workspace`] - Bundle directory layout and preparation

pub mod acquisition;
pub mod artefact;
pub mod cli;
pub mod config;
pub mod dirs;
pub mod error;
pub mod ledger;
pub mod output;
pub mod pipeline;
pub mod sources;
#[cfg(any(test, feature = "test-support"))]
pub mod test_utils;
pub mod tools;
pub mod workspace;
