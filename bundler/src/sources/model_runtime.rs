//! Model pulls through a temporary `ollama serve`.
//!
//! The service is only started when at least one configured model lacks a
//! manifest in the bundle. It runs with `OLLAMA_MODELS` pointing into the
//! bundle and is stopped by [`ServeGuard`] before the pipeline moves on.

use crate::artefact::extraction::{ExpectedOutput, locate_output};
use crate::artefact::retry::Sleeper;
use crate::tools::{BackgroundProcess, CommandExecutor, CommandRequest, ToolError, first_program};
use crate::workspace::BundleLayout;
use camino::{Utf8Path, Utf8PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Program name looked up on `PATH` when no bundled runtime is usable.
pub const SYSTEM_RUNTIME: &str = "ollama";

/// Registry directory used for manifests of unqualified model names.
pub const DEFAULT_REGISTRY: &str = "registry.ollama.ai";

/// Log file for the service output, inside the bundle `logs/` directory.
pub const SERVE_LOG: &str = "ollama-serve.log";

const DEFAULT_TAG: &str = "latest";
const DEFAULT_NAMESPACE: &str = "library";
const STDERR_TAIL: usize = 400;

/// Errors that prevent any model from being pulled.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Neither the bundled runtime nor one on `PATH` responds.
    #[error("no usable model runtime ({reason}); install ollama or fix the runtime download")]
    NoRuntime {
        /// Why each candidate was rejected.
        reason: String,
    },

    /// The service could not be started.
    #[error("cannot start {program} serve: {source}")]
    Start {
        /// Runtime program.
        program: String,
        /// Launch failure.
        #[source]
        source: ToolError,
    },

    /// The service exited before answering.
    #[error("{program} serve exited early; see {log}")]
    ServiceExited {
        /// Runtime program.
        program: String,
        /// Service log.
        log: Utf8PathBuf,
    },

    /// The service never answered within the readiness budget.
    #[error("{program} serve not ready after {attempts} checks; see {log}")]
    NotReady {
        /// Runtime program.
        program: String,
        /// Checks made.
        attempts: u32,
        /// Service log.
        log: Utf8PathBuf,
    },
}

/// Tunables for the temporary service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeSettings {
    /// Value of `OLLAMA_HOST` for the service and its clients.
    pub host: String,
    /// Wait after starting before the first readiness check.
    pub settle_delay: Duration,
    /// Readiness checks before giving up.
    pub readiness_attempts: u32,
    /// Wait between readiness checks.
    pub readiness_interval: Duration,
    /// Timeout for each `ollama pull`.
    pub pull_timeout: Duration,
}

impl Default for ServeSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1:11435".to_owned(),
            settle_delay: Duration::from_secs(3),
            readiness_attempts: 10,
            readiness_interval: Duration::from_secs(1),
            pull_timeout: Duration::from_secs(3600),
        }
    }
}

/// Models handled in one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    /// Models whose manifest was already in the bundle.
    pub present: Vec<String>,
    /// Models pulled in this run.
    pub pulled: Vec<String>,
    /// Models that failed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl PullReport {
    /// One-line description for the ledger.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.pulled.is_empty() {
            parts.push(format!("pulled {}", self.pulled.join(", ")));
        }
        if !self.present.is_empty() {
            parts.push(format!("already present {}", self.present.join(", ")));
        }
        if !self.failed.is_empty() {
            let failed: Vec<String> = self
                .failed
                .iter()
                .map(|(model, reason)| format!("{model} ({reason})"))
                .collect();
            parts.push(format!("failed {}", failed.join(", ")));
        }
        parts.join("; ")
    }
}

/// Where a model's manifest lives below `models_dir`.
///
/// # Examples
///
/// ```
/// use airgap_bundler::sources::model_runtime::manifest_path;
/// use camino::Utf8Path;
///
/// let models = Utf8Path::new("/bundle/models");
/// assert_eq!(
///     manifest_path(models, "llama3.2:3b").as_str(),
///     "/bundle/models/manifests/registry.ollama.ai/library/llama3.2/3b"
/// );
/// assert_eq!(
///     manifest_path(models, "acme/coder").as_str(),
///     "/bundle/models/manifests/registry.ollama.ai/acme/coder/latest"
/// );
/// ```
#[must_use]
pub fn manifest_path(models_dir: &Utf8Path, model: &str) -> Utf8PathBuf {
    let (reference, tag) = match model.rsplit_once(':') {
        Some((reference, tag)) if !tag.contains('/') => (reference, tag),
        _ => (model, DEFAULT_TAG),
    };
    let segments: Vec<&str> = reference.split('/').collect();
    let mut path = models_dir.join("manifests");
    match segments.as_slice() {
        [name] => {
            path.push(DEFAULT_REGISTRY);
            path.push(DEFAULT_NAMESPACE);
            path.push(name);
        }
        [namespace, name] => {
            path.push(DEFAULT_REGISTRY);
            path.push(namespace);
            path.push(name);
        }
        qualified => {
            for segment in qualified {
                path.push(segment);
            }
        }
    }
    path.push(tag);
    path
}

/// Split `models` into those already in the bundle and those to pull.
#[must_use]
pub fn partition_models<'m>(models_dir: &Utf8Path, models: &'m [String]) -> (Vec<&'m str>, Vec<&'m str>) {
    models
        .iter()
        .map(String::as_str)
        .partition(|model| manifest_path(models_dir, model).is_file())
}

/// The bundled runtime, when the archive has been extracted.
#[must_use]
pub fn bundled_runtime(layout: &BundleLayout) -> Option<Utf8PathBuf> {
    let expected = ExpectedOutput {
        relative_path: Utf8PathBuf::from("bin/ollama"),
        executable: true,
    };
    locate_output(&layout.runtime_dir(), &expected)
}

/// Pick the runtime program: the bundled binary first, then `ollama` on
/// `PATH`.
///
/// # Errors
///
/// Returns [`ModelError::NoRuntime`] when no candidate answers `--version`.
pub fn select_runtime(
    executor: &dyn CommandExecutor,
    bundled: Option<&Utf8Path>,
) -> Result<String, ModelError> {
    let mut candidates: Vec<&str> = Vec::new();
    if let Some(path) = bundled {
        candidates.push(path.as_str());
    }
    candidates.push(SYSTEM_RUNTIME);
    first_program(executor, &candidates)
        .map(str::to_owned)
        .map_err(|reason| ModelError::NoRuntime { reason })
}

/// Stops the service when dropped.
pub struct ServeGuard {
    process: Box<dyn BackgroundProcess>,
}

impl ServeGuard {
    /// Take ownership of a running service.
    #[must_use]
    pub fn new(process: Box<dyn BackgroundProcess>) -> Self {
        Self { process }
    }

    /// Returns `true` while the service has not exited.
    pub fn is_running(&mut self) -> bool {
        self.process.is_running()
    }
}

impl Drop for ServeGuard {
    fn drop(&mut self) {
        match self.process.stop() {
            Ok(()) => log::debug!("model service stopped"),
            Err(err) => log::warn!("could not stop the model service: {err}"),
        }
    }
}

/// Starts the service and pulls models through it.
pub struct ModelPuller<'a> {
    executor: &'a dyn CommandExecutor,
    sleeper: &'a dyn Sleeper,
    settings: ServeSettings,
}

impl<'a> ModelPuller<'a> {
    /// Create a puller.
    #[must_use]
    pub fn new(executor: &'a dyn CommandExecutor, sleeper: &'a dyn Sleeper, settings: ServeSettings) -> Self {
        Self {
            executor,
            sleeper,
            settings,
        }
    }

    /// Make every model in `models` present in the bundle.
    ///
    /// Individual pull failures are collected in the report; only problems
    /// with the runtime or service are returned as errors.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError`] when no runtime is usable or the service does
    /// not become ready.
    pub fn pull_all(&self, layout: &BundleLayout, models: &[String]) -> Result<PullReport, ModelError> {
        let models_dir = layout.models_dir();
        let (present, pending) = partition_models(&models_dir, models);
        let mut report = PullReport {
            present: present.iter().map(|model| (*model).to_owned()).collect(),
            ..PullReport::default()
        };
        for model in &report.present {
            log::info!("{model}: manifest present; not pulling");
        }
        if pending.is_empty() {
            return Ok(report);
        }

        let bundled = bundled_runtime(layout);
        let runtime = select_runtime(self.executor, bundled.as_deref())?;
        let log = layout.logs_dir().join(SERVE_LOG);
        let mut guard = self.start(&runtime, &models_dir, &log)?;
        self.wait_until_ready(&mut guard, &runtime, &log)?;

        for model in pending {
            match self.pull(&runtime, &models_dir, model) {
                Ok(()) => report.pulled.push(model.to_owned()),
                Err(reason) => {
                    log::warn!("{model}: {reason}");
                    report.failed.push((model.to_owned(), reason));
                }
            }
        }
        Ok(report)
    }

    fn client(&self, runtime: &str, args: &[&str]) -> CommandRequest {
        CommandRequest::new(runtime, args.iter().copied()).with_env("OLLAMA_HOST", self.settings.host.as_str())
    }

    fn start(&self, runtime: &str, models_dir: &Utf8Path, log: &Utf8Path) -> Result<ServeGuard, ModelError> {
        let request = self
            .client(runtime, &["serve"])
            .with_env("OLLAMA_MODELS", models_dir.as_str())
            .logging_to(log);
        log::info!("starting {} on {}", request.display(), self.settings.host);
        let process = self
            .executor
            .spawn(&request)
            .map_err(|source| ModelError::Start {
                program: runtime.to_owned(),
                source,
            })?;
        Ok(ServeGuard::new(process))
    }

    fn wait_until_ready(&self, guard: &mut ServeGuard, runtime: &str, log: &Utf8Path) -> Result<(), ModelError> {
        self.sleeper.sleep(self.settings.settle_delay);
        let attempts = self.settings.readiness_attempts.max(1);
        for attempt in 1..=attempts {
            if !guard.is_running() {
                return Err(ModelError::ServiceExited {
                    program: runtime.to_owned(),
                    log: log.to_owned(),
                });
            }
            let request = self
                .client(runtime, &["list"])
                .with_timeout(crate::tools::PROBE_TIMEOUT);
            match self.executor.run(&request) {
                Ok(output) if output.status.success() => {
                    log::debug!("model service ready after {attempt} checks");
                    return Ok(());
                }
                Ok(output) => log::debug!("readiness check {attempt}: exited with {}", output.status),
                Err(err) => log::debug!("readiness check {attempt}: {err}"),
            }
            if attempt < attempts {
                self.sleeper.sleep(self.settings.readiness_interval);
            }
        }
        Err(ModelError::NotReady {
            program: runtime.to_owned(),
            attempts,
            log: log.to_owned(),
        })
    }

    fn pull(&self, runtime: &str, models_dir: &Utf8Path, model: &str) -> Result<(), String> {
        log::info!("pulling {model}");
        let request = self
            .client(runtime, &["pull", model])
            .with_timeout(self.settings.pull_timeout);
        let output = self.executor.run(&request).map_err(|err| err.to_string())?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let trimmed = stderr.trim();
            let start = trimmed.len().saturating_sub(STDERR_TAIL);
            let tail = trimmed.get(start..).unwrap_or(trimmed);
            return Err(format!("pull exited with {}: {tail}", output.status));
        }
        if !manifest_path(models_dir, model).is_file() {
            log::warn!("{model}: pull succeeded but no manifest was written under {models_dir}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        ExpectedCall, RecordingSleeper, StubExecutor, failure_output, stdout_output, success_output,
    };
    use rstest::{fixture, rstest};

    struct Bundle {
        _dir: tempfile::TempDir,
        layout: BundleLayout,
    }

    #[fixture]
    fn bundle() -> Bundle {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8");
        let layout = BundleLayout::new(root);
        for path in layout.directories() {
            std::fs::create_dir_all(path).expect("layout");
        }
        Bundle { _dir: dir, layout }
    }

    fn settings() -> ServeSettings {
        ServeSettings {
            readiness_attempts: 3,
            ..ServeSettings::default()
        }
    }

    fn models(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| (*name).to_owned()).collect()
    }

    #[rstest]
    #[case::untagged("llama3", "registry.ollama.ai/library/llama3/latest")]
    #[case::tagged("qwen2.5-coder:7b", "registry.ollama.ai/library/qwen2.5-coder/7b")]
    #[case::namespaced("acme/coder:q4", "registry.ollama.ai/acme/coder/q4")]
    #[case::host("hf.co/org/model:Q8", "hf.co/org/model/Q8")]
    fn manifest_locations(#[case] model: &str, #[case] relative: &str) {
        let root = Utf8Path::new("/m");
        assert_eq!(manifest_path(root, model), root.join("manifests").join(relative));
    }

    #[rstest]
    fn present_models_do_not_start_the_service(bundle: Bundle) {
        let manifest = manifest_path(&bundle.layout.models_dir(), "llama3");
        std::fs::create_dir_all(manifest.parent().expect("parent")).expect("dirs");
        std::fs::write(&manifest, "{}").expect("manifest");
        let executor = StubExecutor::default();
        let sleeper = RecordingSleeper::default();

        let report = ModelPuller::new(&executor, &sleeper, settings())
            .pull_all(&bundle.layout, &models(&["llama3"]))
            .expect("report");

        assert_eq!(report.present, vec!["llama3".to_owned()]);
        assert!(executor.requests().is_empty());
    }

    #[rstest]
    fn pulls_through_a_temporary_service(bundle: Bundle) {
        let executor = StubExecutor::new(vec![
            ExpectedCall::new("ollama", &["--version"], Ok(stdout_output("ollama version 0.5.7"))),
            ExpectedCall::new("ollama", &["serve"], Ok(success_output())),
            ExpectedCall::new("ollama", &["list"], Ok(failure_output("connection refused"))),
            ExpectedCall::new("ollama", &["list"], Ok(success_output())),
            ExpectedCall::new("ollama", &["pull", "llama3"], Ok(success_output())),
            ExpectedCall::new("ollama", &["pull", "missing"], Ok(failure_output("pull model manifest: file does not exist"))),
        ]);
        let sleeper = RecordingSleeper::default();

        let report = ModelPuller::new(&executor, &sleeper, settings())
            .pull_all(&bundle.layout, &models(&["llama3", "missing"]))
            .expect("report");

        executor.assert_finished();
        assert_eq!(report.pulled, vec!["llama3".to_owned()]);
        assert_eq!(report.failed.len(), 1);
        assert!(report.summary().contains("file does not exist"));
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_secs(3), Duration::from_secs(1)]
        );

        let requests = executor.requests();
        let serve = requests.get(1).expect("serve request");
        assert!(serve.env.contains(&(
            "OLLAMA_MODELS".to_owned(),
            bundle.layout.models_dir().to_string()
        )));
        assert!(serve.env.iter().any(|(key, _)| key == "OLLAMA_HOST"));
        assert_eq!(serve.log_to, Some(bundle.layout.logs_dir().join(SERVE_LOG)));
    }

    #[rstest]
    fn bundled_runtime_is_preferred(bundle: Bundle) {
        let binary = bundle.layout.runtime_dir().join("bin/ollama");
        std::fs::create_dir_all(binary.parent().expect("parent")).expect("bin dir");
        std::fs::write(&binary, b"#!/bin/sh\n").expect("binary");
        crate::artefact::extraction::ensure_executable(&binary).expect("chmod");
        let found = bundled_runtime(&bundle.layout).expect("bundled");
        let executor = StubExecutor::new(vec![ExpectedCall::new(
            found.as_str(),
            &["--version"],
            Ok(success_output()),
        )]);

        let chosen = select_runtime(&executor, Some(&found)).expect("runtime");

        assert_eq!(chosen, found.as_str());
    }

    #[test]
    fn missing_runtime_is_reported() {
        let executor = StubExecutor::new(vec![ExpectedCall::new(
            "ollama",
            &["--version"],
            Err(ToolError::NotFound {
                program: "ollama".to_owned(),
            }),
        )]);

        let err = select_runtime(&executor, None).expect_err("no runtime");

        assert!(matches!(err, ModelError::NoRuntime { .. }));
    }

    #[rstest]
    fn readiness_is_bounded(bundle: Bundle) {
        let mut calls = vec![
            ExpectedCall::new("ollama", &["--version"], Ok(success_output())),
            ExpectedCall::new("ollama", &["serve"], Ok(success_output())),
        ];
        for _ in 0..3 {
            calls.push(ExpectedCall::new("ollama", &["list"], Ok(failure_output("refused"))));
        }
        let executor = StubExecutor::new(calls);
        let sleeper = RecordingSleeper::default();

        let err = ModelPuller::new(&executor, &sleeper, settings())
            .pull_all(&bundle.layout, &models(&["llama3"]))
            .expect_err("never ready");

        executor.assert_finished();
        assert!(matches!(err, ModelError::NotReady { attempts: 3, .. }));
    }

    #[rstest]
    fn exited_service_stops_the_wait(bundle: Bundle) {
        let executor = StubExecutor::new(vec![
            ExpectedCall::new("ollama", &["--version"], Ok(success_output())),
            ExpectedCall::new("ollama", &["serve"], Ok(failure_output("address in use"))),
        ]);
        let sleeper = RecordingSleeper::default();

        let err = ModelPuller::new(&executor, &sleeper, settings())
            .pull_all(&bundle.layout, &models(&["llama3"]))
            .expect_err("exited");

        assert!(matches!(err, ModelError::ServiceExited { .. }));
    }

    #[test]
    fn guard_stops_the_process_on_drop() {
        struct Flagged(std::rc::Rc<std::cell::Cell<bool>>);
        impl BackgroundProcess for Flagged {
            fn is_running(&mut self) -> bool {
                !self.0.get()
            }
            fn stop(&mut self) -> std::io::Result<()> {
                self.0.set(true);
                Ok(())
            }
        }
        let stopped = std::rc::Rc::new(std::cell::Cell::new(false));

        drop(ServeGuard::new(Box::new(Flagged(stopped.clone()))));

        assert!(stopped.get());
    }
}
