//! Per-component status ledger and the final bundle report.
//!
//! The ledger lives in memory for one run. Every component starts as
//! [`Status::Pending`] and is moved to a terminal status by the pipeline;
//! recording twice overwrites the earlier entry.

use std::collections::BTreeMap;
use std::fmt;

/// A bundle component, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    /// The model runtime archive.
    RuntimeBinary,
    /// Models pulled through the runtime.
    Models,
    /// The editor `.deb` package.
    EditorPackage,
    /// Editor extensions.
    Extensions,
    /// Downloaded OS packages.
    OsPackages,
    /// The `rustup-init` installer.
    RustToolchain,
    /// Vendored crate sources.
    RustCrates,
    /// Python packages installed into a target directory.
    PythonPackages,
}

impl Component {
    /// Every component in pipeline order.
    pub const ALL: [Self; 8] = [
        Self::RuntimeBinary,
        Self::Models,
        Self::EditorPackage,
        Self::Extensions,
        Self::OsPackages,
        Self::RustToolchain,
        Self::RustCrates,
        Self::PythonPackages,
    ];

    /// Stable key used in reports.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::RuntimeBinary => "runtime_binary",
            Self::Models => "models",
            Self::EditorPackage => "editor_package",
            Self::Extensions => "extensions",
            Self::OsPackages => "os_packages",
            Self::RustToolchain => "rust_toolchain",
            Self::RustCrates => "rust_crates",
            Self::PythonPackages => "python_packages",
        }
    }

    /// What to do by hand when the component failed.
    #[must_use]
    pub const fn failure_hint(self) -> &'static str {
        match self {
            Self::RuntimeBinary => {
                "download ollama-linux-amd64.tar.zst from https://github.com/ollama/ollama/releases/latest into ollama/ and re-run"
            }
            Self::Models => {
                "check logs/ollama-serve.log; once the runtime works, re-run to pull the missing models"
            }
            Self::EditorPackage => {
                "download the _amd64.deb and its .sha256 from https://github.com/VSCodium/vscodium/releases/latest into vscodium/"
            }
            Self::Extensions => {
                "download the .vsix files from https://open-vsx.org into extensions/ and re-run"
            }
            Self::OsPackages => {
                "install apt-get and allow passwordless sudo (or run as root), then re-run"
            }
            Self::RustToolchain => {
                "download https://static.rust-lang.org/rustup/dist/x86_64-unknown-linux-gnu/rustup-init and its .sha256 into rust/toolchain/"
            }
            Self::RustCrates => "install cargo and check the configured cargo_manifest path",
            Self::PythonPackages => {
                "install python3 with pip and check the configured python_requirements path"
            }
        }
    }

    /// How to include the component when it was skipped.
    #[must_use]
    pub const fn skip_hint(self) -> &'static str {
        match self {
            Self::RuntimeBinary => "set runtime = true in the configuration to include it",
            Self::Models => "list models in the configuration to include them",
            Self::EditorPackage => "set editor = true in the configuration to include it",
            Self::Extensions => "list extensions in the configuration to include them",
            Self::OsPackages => "list os_packages in the configuration to include them",
            Self::RustToolchain => "set rust_toolchain = true in the configuration to include it",
            Self::RustCrates => "set cargo_manifest in the configuration to include it",
            Self::PythonPackages => "set python_requirements in the configuration to include it",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.key())
    }
}

/// Status of one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Not processed yet.
    Pending,
    /// Everything the component needs is in the bundle.
    Success,
    /// The component could not be completed.
    Failed,
    /// Nothing was configured for the component.
    Skipped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        })
    }
}

/// The recorded state of one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Current status.
    pub status: Status,
    /// Optional explanation shown in the report.
    pub detail: Option<String>,
}

/// Counts of component outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    /// Components that succeeded.
    pub success: usize,
    /// Components that failed.
    pub failed: usize,
    /// Components that were skipped.
    pub skipped: usize,
    /// Components never processed.
    pub pending: usize,
}

/// Status of every component for one run.
///
/// # Examples
///
/// ```
/// use airgap_bundler::ledger::{Component, Ledger, Status};
///
/// let mut ledger = Ledger::new();
/// ledger.record(Component::Models, Status::Skipped);
/// assert_eq!(ledger.get(Component::Models).status, Status::Skipped);
/// assert_eq!(ledger.get(Component::Extensions).status, Status::Pending);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    entries: BTreeMap<Component, Entry>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    /// Create a ledger with every component pending.
    #[must_use]
    pub fn new() -> Self {
        let entries = Component::ALL
            .into_iter()
            .map(|component| {
                (
                    component,
                    Entry {
                        status: Status::Pending,
                        detail: None,
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// Record `status` for `component`, clearing any detail.
    pub fn record(&mut self, component: Component, status: Status) {
        self.entries.insert(
            component,
            Entry {
                status,
                detail: None,
            },
        );
    }

    /// Record `status` with an explanation.
    pub fn record_with_detail(
        &mut self,
        component: Component,
        status: Status,
        detail: impl Into<String>,
    ) {
        log::debug!("{component}: {status}");
        self.entries.insert(
            component,
            Entry {
                status,
                detail: Some(detail.into()),
            },
        );
    }

    /// The entry for `component`.
    #[must_use]
    pub fn get(&self, component: Component) -> &Entry {
        static PENDING: Entry = Entry {
            status: Status::Pending,
            detail: None,
        };
        self.entries.get(&component).unwrap_or(&PENDING)
    }

    /// Count outcomes across all components.
    #[must_use]
    pub fn tally(&self) -> Tally {
        self.entries
            .values()
            .fold(Tally::default(), |mut tally, entry| {
                match entry.status {
                    Status::Success => tally.success += 1,
                    Status::Failed => tally.failed += 1,
                    Status::Skipped => tally.skipped += 1,
                    Status::Pending => tally.pending += 1,
                }
                tally
            })
    }

    /// Returns `true` if any component failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.tally().failed > 0
    }

    /// Render the end-of-run report.
    #[must_use]
    pub fn render_summary(&self) -> String {
        let mut lines = vec!["Bundle summary:".to_owned()];
        for (component, entry) in &self.entries {
            let mut line = format!("  {:<16} {:<8}", component.key(), entry.status);
            if let Some(detail) = &entry.detail {
                line.push(' ');
                line.push_str(detail);
            }
            lines.push(line.trim_end().to_owned());
            let hint = match entry.status {
                Status::Failed => Some(component.failure_hint()),
                Status::Skipped => Some(component.skip_hint()),
                Status::Success | Status::Pending => None,
            };
            if let Some(hint) = hint {
                lines.push(format!("      hint: {hint}"));
            }
        }
        let tally = self.tally();
        lines.push(format!(
            "{} succeeded, {} failed, {} skipped, {} pending",
            tally.success, tally.failed, tally.skipped, tally.pending
        ));
        lines.join("\n")
    }
}
