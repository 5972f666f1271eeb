//! Bundle pipeline orchestration.
//!
//! [`run_bundle`] prepares the bundle layout, then runs one step per
//! [`Component`] in a fixed order and records each outcome in the ledger.
//! Only an unusable bundle directory stops the run; every other failure is
//! recorded and the next component proceeds.

use crate::acquisition::{Acquirer, Artefact};
use crate::artefact::download::Downloader;
use crate::artefact::extraction::{
    ArtefactExtractor, Extraction, NativeExtractor, SystemTarExtractor, ensure_executable,
};
use crate::artefact::retry::{Fetcher, Sleeper};
use crate::artefact::verification::Verifier;
use crate::config::BundleConfig;
use crate::error::{BundlerError, Result};
use crate::ledger::{Component, Ledger, Status};
use crate::output::write_stderr_line;
use crate::sources::model_runtime::ModelPuller;
use crate::sources::openvsx::{self, ExtensionId};
use crate::sources::releases::{self, OLLAMA_LATEST_RELEASE, VSCODIUM_LATEST_RELEASE};
use crate::sources::{SourceError, packages, rustup};
use crate::tools::{CommandExecutor, PrivilegeEscalator};
use crate::workspace::{BundleLayout, PrepareOutcome, ensure_layout};
use std::io::Write;

/// Everything one run works with.
#[derive(Debug, Clone)]
pub struct BundleContext {
    /// Resolved settings.
    pub config: BundleConfig,
    /// Bundle directory layout.
    pub layout: BundleLayout,
    /// Component outcomes.
    pub ledger: Ledger,
    /// Suppress progress lines.
    pub quiet: bool,
}

impl BundleContext {
    /// Start a run for `config` with every component pending.
    #[must_use]
    pub fn new(config: BundleConfig, quiet: bool) -> Self {
        let layout = BundleLayout::new(config.bundle_dir.clone());
        Self {
            config,
            layout,
            ledger: Ledger::new(),
            quiet,
        }
    }
}

/// The effectful services a run depends on.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    /// Runs external commands.
    pub executor: &'a dyn CommandExecutor,
    /// Performs single HTTP requests.
    pub downloader: &'a dyn Downloader,
    /// Waits between retries and readiness checks.
    pub sleeper: &'a dyn Sleeper,
}

/// Terminal outcome of one component step.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StepOutcome {
    status: Status,
    detail: String,
}

impl StepOutcome {
    fn success(detail: impl Into<String>) -> Self {
        Self {
            status: Status::Success,
            detail: detail.into(),
        }
    }

    fn failed(detail: impl std::fmt::Display) -> Self {
        Self {
            status: Status::Failed,
            detail: detail.to_string(),
        }
    }

    fn skipped(detail: &str) -> Self {
        Self {
            status: Status::Skipped,
            detail: detail.to_owned(),
        }
    }
}

/// Prepare the bundle and process every component.
///
/// Returns the ledger with a terminal status for each component.
///
/// # Errors
///
/// Returns [`BundlerError::Workspace`] when the bundle directory cannot be
/// prepared. Component failures are never returned as errors.
pub fn run_bundle(
    mut context: BundleContext,
    collaborators: &Collaborators<'_>,
    stderr: &mut dyn Write,
) -> Result<Ledger> {
    let escalator = PrivilegeEscalator::new(collaborators.executor);
    if !context.quiet {
        write_stderr_line(stderr, format!("Preparing {}...", context.layout.root()));
    }
    if let PrepareOutcome::Failed { reason } = ensure_layout(&context.layout, &escalator) {
        return Err(BundlerError::Workspace {
            path: context.layout.root().to_owned(),
            reason,
        });
    }

    let config = &context.config;
    let fetcher = Fetcher::new(
        collaborators.downloader,
        collaborators.sleeper,
        config.retry_policy(),
    );
    let verifier = Verifier::standard(collaborators.executor);
    let extraction = build_extraction(config, &context.layout, collaborators.executor);
    let acquirer = Acquirer::new(&fetcher, &verifier, &extraction, config.skip_verification);
    if config.skip_verification {
        log::warn!("verification is disabled; existing files are accepted unchecked");
    }

    let steps = Steps {
        config,
        layout: &context.layout,
        acquirer: &acquirer,
        collaborators,
        escalator: &escalator,
    };

    let total = Component::ALL.len();
    for (index, component) in Component::ALL.into_iter().enumerate() {
        if !context.quiet {
            write_stderr_line(stderr, format!("[{}/{total}] {component}", index + 1));
        }
        let outcome = steps.run(component);
        if !context.quiet {
            write_stderr_line(stderr, format!("      {}: {}", outcome.status, outcome.detail));
        }
        context
            .ledger
            .record_with_detail(component, outcome.status, outcome.detail);
    }
    Ok(context.ledger)
}

fn build_extraction<'a>(
    config: &BundleConfig,
    layout: &BundleLayout,
    executor: &'a dyn CommandExecutor,
) -> Extraction<'a> {
    let limit = config.tools.log_limit_bytes;
    let logs = layout.logs_dir();
    let native: Box<dyn ArtefactExtractor + 'a> = Box::new(NativeExtractor::new(limit));
    let system: Box<dyn ArtefactExtractor + 'a> = Box::new(SystemTarExtractor::new(
        executor,
        &logs,
        limit,
        config.command_timeout(),
    ));
    let providers = if config.tools.prefer_system_tar {
        vec![system, native]
    } else {
        vec![native, system]
    };
    Extraction::new(providers, &logs, limit)
}

struct Steps<'a> {
    config: &'a BundleConfig,
    layout: &'a BundleLayout,
    acquirer: &'a Acquirer<'a>,
    collaborators: &'a Collaborators<'a>,
    escalator: &'a PrivilegeEscalator<'a>,
}

impl Steps<'_> {
    fn run(&self, component: Component) -> StepOutcome {
        match component {
            Component::RuntimeBinary => self.runtime(),
            Component::Models => self.models(),
            Component::EditorPackage => self.editor(),
            Component::Extensions => self.extensions(),
            Component::OsPackages => self.os_packages(),
            Component::RustToolchain => self.rust_toolchain(),
            Component::RustCrates => self.rust_crates(),
            Component::PythonPackages => self.python_packages(),
        }
    }

    fn acquire(&self, artefact: &Artefact) -> StepOutcome {
        let report = self.acquirer.acquire(artefact);
        StepOutcome {
            status: report.status,
            detail: report.detail,
        }
    }

    fn runtime(&self) -> StepOutcome {
        if !self.config.runtime {
            return StepOutcome::skipped("disabled");
        }
        let minimum = self.config.runtime_min_bytes;
        let online = releases::fetch_release(self.acquirer.fetcher(), OLLAMA_LATEST_RELEASE)
            .and_then(|release| releases::runtime_artefact(&release, self.layout, minimum));
        match with_offline_fallback(online, || {
            releases::offline_runtime_artefact(self.layout, minimum)
        }) {
            Ok(artefact) => self.acquire(&artefact),
            Err(reason) => StepOutcome::failed(reason),
        }
    }

    fn models(&self) -> StepOutcome {
        if self.config.models.is_empty() {
            return StepOutcome::skipped("no models configured");
        }
        let puller = ModelPuller::new(
            self.collaborators.executor,
            self.collaborators.sleeper,
            self.config.serve_settings(),
        );
        match puller.pull_all(self.layout, &self.config.models) {
            Ok(report) if report.failed.is_empty() => StepOutcome::success(report.summary()),
            Ok(report) => StepOutcome::failed(report.summary()),
            Err(err) => StepOutcome::failed(err),
        }
    }

    fn editor(&self) -> StepOutcome {
        if !self.config.editor {
            return StepOutcome::skipped("disabled");
        }
        let online = releases::fetch_release(self.acquirer.fetcher(), VSCODIUM_LATEST_RELEASE)
            .and_then(|release| releases::editor_artefact(&release, self.layout));
        match with_offline_fallback(online, || releases::offline_editor_artefact(self.layout)) {
            Ok(artefact) => self.acquire(&artefact),
            Err(reason) => StepOutcome::failed(reason),
        }
    }

    fn extensions(&self) -> StepOutcome {
        if self.config.extensions.is_empty() {
            return StepOutcome::skipped("no extensions configured");
        }
        let mut verified = 0_usize;
        let mut failures = Vec::new();
        for value in &self.config.extensions {
            match self.extension(value) {
                Ok(()) => verified += 1,
                Err(reason) => failures.push(format!("{value} ({reason})")),
            }
        }
        if failures.is_empty() {
            StepOutcome::success(format!("{verified} extensions verified"))
        } else {
            StepOutcome::failed(format!(
                "{verified} verified; failed: {}",
                failures.join(", ")
            ))
        }
    }

    fn extension(&self, value: &str) -> std::result::Result<(), String> {
        let id = ExtensionId::parse(value).map_err(|err| err.to_string())?;
        let online = openvsx::resolve(self.acquirer.fetcher(), &self.config.openvsx_url, &id)
            .map(|resolved| openvsx::extension_artefact(&resolved, self.layout));
        let artefact = with_offline_fallback(online, || {
            openvsx::offline_extension_artefact(&id, self.layout)
        })?;
        let report = self.acquirer.acquire(&artefact);
        if report.succeeded() {
            Ok(())
        } else {
            Err(report.detail)
        }
    }

    fn os_packages(&self) -> StepOutcome {
        if self.config.os_packages.is_empty() {
            return StepOutcome::skipped("no packages configured");
        }
        match packages::download_os_packages(
            self.escalator,
            self.layout,
            &self.config.os_packages,
            self.config.command_timeout(),
        ) {
            Ok(count) => StepOutcome::success(format!("{count} .deb files")),
            Err(err) => StepOutcome::failed(err),
        }
    }

    fn rust_toolchain(&self) -> StepOutcome {
        if !self.config.rust_toolchain {
            return StepOutcome::skipped("disabled");
        }
        let artefact = rustup::rustup_artefact(self.layout);
        let outcome = self.acquire(&artefact);
        if outcome.status != Status::Success {
            return outcome;
        }
        match ensure_executable(&artefact.destination) {
            Ok(true) => {
                log::debug!("{} made executable", artefact.destination);
                outcome
            }
            Ok(false) => outcome,
            Err(err) => StepOutcome::failed(format!(
                "cannot make {} executable: {err}",
                artefact.destination
            )),
        }
    }

    fn rust_crates(&self) -> StepOutcome {
        let Some(manifest) = &self.config.cargo_manifest else {
            return StepOutcome::skipped("no cargo_manifest configured");
        };
        match packages::vendor_crates(
            self.collaborators.executor,
            self.layout,
            manifest,
            self.config.command_timeout(),
        ) {
            Ok(count) => StepOutcome::success(format!("{count} crates vendored")),
            Err(err) => StepOutcome::failed(err),
        }
    }

    fn python_packages(&self) -> StepOutcome {
        let Some(requirements) = &self.config.python_requirements else {
            return StepOutcome::skipped("no python_requirements configured");
        };
        match packages::install_python_packages(
            self.collaborators.executor,
            self.layout,
            requirements,
            self.config.command_timeout(),
        ) {
            Ok(count) => StepOutcome::success(format!("about {count} packages installed")),
            Err(err) => StepOutcome::failed(err),
        }
    }
}

/// Use the resolved artefact, or an earlier download when resolution failed.
fn with_offline_fallback(
    online: std::result::Result<Artefact, SourceError>,
    offline: impl FnOnce() -> Option<Artefact>,
) -> std::result::Result<Artefact, String> {
    match online {
        Ok(artefact) => Ok(artefact),
        Err(err) => {
            log::warn!("{err}; looking for an earlier download");
            offline().ok_or_else(|| format!("{err}; no earlier download to fall back on"))
        }
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
