//! CLI argument definitions for the airgap bundler.
//!
//! This module defines the command-line interface using clap. It is separated
//! from the main entrypoint to keep the binary small and focused on
//! orchestration.

use camino::Utf8PathBuf;
use clap::Parser;

/// Build a self-contained airgap bundle of verified artefacts.
#[derive(Parser, Debug, Clone, Default, PartialEq, Eq)]
#[command(name = "airgap-bundler")]
#[command(version, about)]
#[command(long_about = concat!(
    "Build a self-contained airgap bundle of verified artefacts.\n\n",
    "The bundler downloads a model runtime and its models, an editor package ",
    "and extensions, OS packages, the Rust installer with vendored crates, and ",
    "Python packages into one directory that a disconnected machine can install ",
    "from.\n\n",
    "Every download is verified against its published SHA-256 digest and marked ",
    "once trusted, so re-running the bundler only fetches what is missing or ",
    "corrupt. A failed component never stops the others; the closing summary ",
    "lists what to fix.",
))]
#[command(after_help = concat!(
    "CONFIGURATION:\n",
    "  Settings are read from --config, or from config.toml in the platform\n",
    "  configuration directory when present. Flags override the file.\n\n",
    "EXAMPLES:\n",
    "  Build a bundle in ./airgap-bundle:\n",
    "    $ airgap-bundler\n\n",
    "  Build into a USB drive with a custom configuration:\n",
    "    $ airgap-bundler -b /media/usb/bundle -c bundle.toml\n\n",
    "  Re-run quickly, accepting files already downloaded:\n",
    "    $ airgap-bundler --skip-verification\n\n",
    "  Preview the resolved settings:\n",
    "    $ airgap-bundler --dry-run",
))]
pub struct Cli {
    /// Bundle directory [default: from configuration, else ./airgap-bundle].
    #[arg(short, long, value_name = "DIR")]
    pub bundle_dir: Option<Utf8PathBuf>,

    /// Configuration file [default: platform configuration directory].
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<Utf8PathBuf>,

    /// Accept files already on disk without hashing them.
    #[arg(long)]
    pub skip_verification: bool,

    /// Download attempts per file, including the first.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: Option<u32>,

    /// Show the resolved configuration and exit without side effects.
    #[arg(long)]
    pub dry_run: bool,

    /// Run even when the host is not Linux x86_64.
    #[arg(long)]
    pub skip_platform_check: bool,

    /// Increase log verbosity (repeatable: -v, -vv, -vvv).
    #[arg(
        short,
        long = "verbose",
        alias = "verbosity",
        action = clap::ArgAction::Count,
        conflicts_with = "quiet"
    )]
    pub verbosity: u8,

    /// Suppress progress output (errors and the summary still shown).
    #[arg(short, long, conflicts_with = "verbosity")]
    pub quiet: bool,
}

impl Cli {
    /// The `log` level filter matching `-v` and `--quiet`.
    ///
    /// # Examples
    ///
    /// ```
    /// use airgap_bundler::cli::Cli;
    /// use clap::Parser;
    ///
    /// let cli = Cli::parse_from(["airgap-bundler", "-vv"]);
    /// assert_eq!(cli.log_level(), log::LevelFilter::Debug);
    /// ```
    #[must_use]
    pub fn log_level(&self) -> log::LevelFilter {
        if self.quiet {
            return log::LevelFilter::Error;
        }
        match self.verbosity {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
#[path = "cli_tests.rs"]
mod tests;
