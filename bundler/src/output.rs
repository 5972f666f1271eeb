//! Output formatting for the bundler CLI.
//!
//! Progress lines and the dry-run report go to an injected writer (stderr in
//! the binary) so that tests can capture them.

use crate::config::BundleConfig;
use crate::workspace::BundleLayout;
use camino::Utf8Path;
use std::io::Write;

/// Write one line, ignoring write failures.
pub fn write_stderr_line(stderr: &mut dyn Write, message: impl std::fmt::Display) {
    if writeln!(stderr, "{message}").is_err() {
        // Best-effort output; ignore write failures.
    }
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_owned()
    } else {
        items.join(", ")
    }
}

fn enabled(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

/// Configuration information for dry-run output.
///
/// # Example
///
/// ```
/// use airgap_bundler::config::BundleConfig;
/// use airgap_bundler::output::DryRunInfo;
/// use airgap_bundler::workspace::BundleLayout;
///
/// let config = BundleConfig {
///     models: vec!["llama3".to_owned()],
///     ..BundleConfig::default()
/// };
/// let layout = BundleLayout::new(config.bundle_dir.clone());
/// let info = DryRunInfo {
///     config: &config,
///     layout: &layout,
///     config_source: None,
///     verbosity: 0,
///     quiet: false,
/// };
///
/// let output = info.display_text();
/// assert!(output.contains("Dry run"));
/// assert!(output.contains("llama3"));
/// ```
#[derive(Debug)]
pub struct DryRunInfo<'a> {
    /// Resolved settings.
    pub config: &'a BundleConfig,
    /// Bundle layout derived from the settings.
    pub layout: &'a BundleLayout,
    /// File the settings came from.
    pub config_source: Option<&'a Utf8Path>,
    /// Verbosity level (0 = warnings only).
    pub verbosity: u8,
    /// Whether quiet mode is enabled.
    pub quiet: bool,
}

impl DryRunInfo<'_> {
    /// Format the dry-run information for display.
    #[must_use]
    pub fn display_text(&self) -> String {
        let config = self.config;
        let source = self
            .config_source
            .map_or_else(|| "(defaults)".to_owned(), ToString::to_string);
        let mut lines = vec![
            "Dry run - no files will be modified".to_owned(),
            String::new(),
            format!("Configuration: {source}"),
            format!("Bundle directory: {}", self.layout.root()),
            format!("Skip verification: {}", config.skip_verification),
            format!("Max attempts: {}", config.network.max_attempts),
            format!("Prefer system tar: {}", config.tools.prefer_system_tar),
            format!("Verbosity level: {}", self.verbosity),
            format!("Quiet: {}", self.quiet),
            String::new(),
            "Components:".to_owned(),
            format!("  runtime_binary:  {}", enabled(config.runtime)),
            format!("  models:          {}", list_or_none(&config.models)),
            format!("  editor_package:  {}", enabled(config.editor)),
            format!("  extensions:      {}", list_or_none(&config.extensions)),
            format!("  os_packages:     {}", list_or_none(&config.os_packages)),
            format!("  rust_toolchain:  {}", enabled(config.rust_toolchain)),
        ];
        lines.push(format!(
            "  rust_crates:     {}",
            config
                .cargo_manifest
                .as_ref()
                .map_or_else(|| "(none)".to_owned(), ToString::to_string)
        ));
        lines.push(format!(
            "  python_packages: {}",
            config
                .python_requirements
                .as_ref()
                .map_or_else(|| "(none)".to_owned(), ToString::to_string)
        ));

        lines.push(String::new());
        lines.push("Directories:".to_owned());
        for dir in self.layout.directories() {
            lines.push(format!("  - {dir}"));
        }

        lines.join("\n")
    }
}

/// Format the closing line after a run.
#[must_use]
pub fn completion_message(failed: usize, root: &Utf8Path) -> String {
    match failed {
        0 => format!("Bundle complete in {root}"),
        1 => format!("Bundle in {root} is incomplete: 1 component failed; re-run after fixing it"),
        n => format!("Bundle in {root} is incomplete: {n} components failed; re-run after fixing them"),
    }
}
