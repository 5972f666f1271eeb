//! Package tools driven into the bundle: `apt-get`, `cargo vendor` and `pip`.
//!
//! Each step runs one external tool with a timeout, sends its combined output
//! to a log under `logs/`, and counts what landed in the bundle.

use crate::tools::{
    Availability, CommandExecutor, CommandRequest, PrivilegeEscalator, ToolError, first_program,
    probe_command,
};
use crate::workspace::BundleLayout;
use camino::{Utf8Path, Utf8PathBuf};
use std::process::Output;
use std::time::Duration;
use thiserror::Error;

/// Log of the `apt-get` download.
pub const APT_LOG: &str = "apt.log";
/// Log of the `pip` install.
pub const PIP_LOG: &str = "pip.log";
/// Log of `cargo vendor` diagnostics.
pub const CARGO_VENDOR_LOG: &str = "cargo-vendor.log";

/// Interpreters tried for `pip`, in preference order.
pub const PYTHON_INTERPRETERS: [&str; 2] = ["python3", "python"];

const STDERR_TAIL: usize = 400;

/// Errors raised by package steps.
#[derive(Debug, Error)]
pub enum PackageError {
    /// A required tool is not installed.
    #[error("{tool} is unavailable ({reason}); {hint}")]
    ToolMissing {
        /// Tool that was probed.
        tool: String,
        /// Why the probe failed.
        reason: String,
        /// What the user can do about it.
        hint: &'static str,
    },

    /// The tool ran and reported failure.
    #[error("{command} exited with {status}; see {log}")]
    CommandFailed {
        /// Command line that failed.
        command: String,
        /// Exit status.
        status: std::process::ExitStatus,
        /// Where its output went, or its stderr tail when captured.
        log: String,
    },

    /// The tool could not be run.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// A filesystem operation around the tool failed.
    #[error("cannot {action} {path}: {source}")]
    Io {
        /// What was being done.
        action: &'static str,
        /// Path involved.
        path: Utf8PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias using [`PackageError`].
pub type Result<T> = std::result::Result<T, PackageError>;

fn io_error(action: &'static str, path: &Utf8Path) -> impl FnOnce(std::io::Error) -> PackageError {
    let path = path.to_owned();
    move |source| PackageError::Io {
        action,
        path,
        source,
    }
}

fn check_status(request: &CommandRequest, output: &Output, log: String) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    Err(PackageError::CommandFailed {
        command: request.display(),
        status: output.status,
        log,
    })
}

fn stderr_tail(output: &Output) -> String {
    let text = String::from_utf8_lossy(&output.stderr);
    let trimmed = text.trim();
    let mut start = trimmed.len().saturating_sub(STDERR_TAIL);
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed.get(start..).unwrap_or_default().to_owned()
}

fn count_entries(dir: &Utf8Path, matches: impl Fn(&str) -> bool) -> Result<usize> {
    let entries = dir.read_dir_utf8().map_err(io_error("list", dir))?;
    Ok(entries
        .flatten()
        .filter(|entry| matches(entry.file_name()))
        .count())
}

/// Download `.deb` files for `packages` into `<root>/debs`.
///
/// Returns the number of `.deb` files in the directory afterwards.
///
/// # Errors
///
/// Returns [`PackageError::ToolMissing`] when `apt-get` is absent and
/// [`PackageError::CommandFailed`] when the download fails.
pub fn download_os_packages(
    escalator: &PrivilegeEscalator<'_>,
    layout: &BundleLayout,
    packages: &[String],
    timeout: Duration,
) -> Result<usize> {
    if let Availability::Unavailable(reason) =
        probe_command(escalator.executor(), "apt-get", &["--version"])
    {
        return Err(PackageError::ToolMissing {
            tool: "apt-get".to_owned(),
            reason,
            hint: "run the bundler on a Debian-based host",
        });
    }

    let debs = layout.debs_dir();
    let partial = debs.join("partial");
    std::fs::create_dir_all(&partial).map_err(io_error("create", &partial))?;
    let log = layout.logs_dir().join(APT_LOG);

    let mut args = vec![
        "install".to_owned(),
        "--download-only".to_owned(),
        "--reinstall".to_owned(),
        "--yes".to_owned(),
        "-o".to_owned(),
        format!("Dir::Cache::archives={debs}"),
    ];
    args.extend(packages.iter().cloned());
    let request = CommandRequest::new("apt-get", args)
        .with_env("DEBIAN_FRONTEND", "noninteractive")
        .with_timeout(timeout)
        .logging_to(&log);

    log::info!("downloading {} OS packages", packages.len());
    let output = escalator.run(&request)?;
    check_status(&request, &output, log.to_string())?;

    let count = count_entries(&debs, |name| name.ends_with(".deb"))?;
    log::info!("{count} .deb files in {debs}");
    Ok(count)
}

/// Vendor the dependencies of `manifest` into `<root>/rust/vendor`.
///
/// The source-replacement snippet printed by `cargo vendor` is written to
/// `<root>/rust/vendor-config.toml`. Returns the number of vendored crates.
///
/// # Errors
///
/// Returns [`PackageError::ToolMissing`] when `cargo` is absent and
/// [`PackageError::CommandFailed`] when vendoring fails.
pub fn vendor_crates(
    executor: &dyn CommandExecutor,
    layout: &BundleLayout,
    manifest: &Utf8Path,
    timeout: Duration,
) -> Result<usize> {
    if let Availability::Unavailable(reason) = probe_command(executor, "cargo", &["--version"]) {
        return Err(PackageError::ToolMissing {
            tool: "cargo".to_owned(),
            reason,
            hint: "install a Rust toolchain with rustup",
        });
    }
    if !manifest.is_file() {
        return Err(io_error("read", manifest)(std::io::Error::from(
            std::io::ErrorKind::NotFound,
        )));
    }

    let vendor = layout.vendor_dir();
    let request = CommandRequest::new(
        "cargo",
        ["vendor", "--manifest-path", manifest.as_str(), vendor.as_str()],
    )
    .with_timeout(timeout);
    log::info!("vendoring crates for {manifest}");
    let output = executor.run(&request)?;

    let log = layout.logs_dir().join(CARGO_VENDOR_LOG);
    std::fs::write(&log, &output.stderr).map_err(io_error("write", &log))?;
    check_status(&request, &output, log.to_string())?;

    let config = layout.vendor_config();
    std::fs::write(&config, &output.stdout).map_err(io_error("write", &config))?;

    let count = count_entries(&vendor, |name| !name.starts_with('.'))?;
    log::info!("{count} crates vendored into {vendor}");
    Ok(count)
}

/// Install the packages listed in `requirements` into a freshly cleared
/// `<root>/python/site-packages`.
///
/// Returns the number of installed distributions (`*-info` entries).
///
/// # Errors
///
/// Returns [`PackageError::ToolMissing`] when no interpreter is found and
/// [`PackageError::CommandFailed`] when `pip` fails.
pub fn install_python_packages(
    executor: &dyn CommandExecutor,
    layout: &BundleLayout,
    requirements: &Utf8Path,
    timeout: Duration,
) -> Result<usize> {
    let python = first_program(executor, &PYTHON_INTERPRETERS).map_err(|reason| {
        PackageError::ToolMissing {
            tool: "python3".to_owned(),
            reason,
            hint: "install Python 3 with pip",
        }
    })?;

    let python_dir = layout.python_dir();
    let site_packages = layout.site_packages_dir();
    match std::fs::remove_dir_all(&site_packages) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(io_error("clear", &site_packages)(err)),
    }
    std::fs::create_dir_all(&site_packages).map_err(io_error("create", &site_packages))?;
    let copied = python_dir.join("requirements.txt");
    std::fs::copy(requirements, &copied).map_err(io_error("copy", requirements))?;

    let log = layout.logs_dir().join(PIP_LOG);
    let request = CommandRequest::new(
        python,
        [
            "-m",
            "pip",
            "install",
            "-r",
            requirements.as_str(),
            "--target",
            site_packages.as_str(),
            "--upgrade",
            "--no-compile",
            "--ignore-installed",
        ],
    )
    .with_timeout(timeout)
    .logging_to(&log);
    log::info!("installing Python packages from {requirements}");
    let output = executor.run(&request)?;
    let detail = if output.stderr.is_empty() {
        log.to_string()
    } else {
        stderr_tail(&output)
    };
    check_status(&request, &output, detail)?;

    let count = count_entries(&site_packages, |name| name.ends_with("-info"))?;
    log::info!("installed about {count} packages into {site_packages}");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        ExpectedCall, StubExecutor, failure_output, stdout_output, success_output,
    };
    use rstest::{fixture, rstest};

    const TIMEOUT: Duration = Duration::from_secs(60);

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

    #[rstest]
    fn apt_downloads_into_the_bundle_as_root(bundle: Bundle) {
        let archives = format!("Dir::Cache::archives={}", bundle.layout.debs_dir());
        let executor = StubExecutor::new(vec![
            ExpectedCall::new("apt-get", &["--version"], Ok(success_output())),
            ExpectedCall::new("id", &["-u"], Ok(stdout_output("0\n"))),
            ExpectedCall::new(
                "apt-get",
                &[
                    "install",
                    "--download-only",
                    "--reinstall",
                    "--yes",
                    "-o",
                    archives.as_str(),
                    "git",
                    "curl",
                ],
                Ok(success_output()),
            ),
        ]);
        std::fs::write(bundle.layout.debs_dir().join("git_2.43_amd64.deb"), b"deb").expect("deb");
        let escalator = PrivilegeEscalator::new(&executor);
        let packages = vec!["git".to_owned(), "curl".to_owned()];

        let count =
            download_os_packages(&escalator, &bundle.layout, &packages, TIMEOUT).expect("apt");

        executor.assert_finished();
        assert_eq!(count, 1);
        assert!(bundle.layout.debs_dir().join("partial").is_dir());
        let install = executor.requests().pop().expect("install request");
        assert_eq!(
            install.env,
            vec![("DEBIAN_FRONTEND".to_owned(), "noninteractive".to_owned())]
        );
    }

    #[rstest]
    fn apt_absence_is_reported_with_a_hint(bundle: Bundle) {
        let executor = StubExecutor::new(vec![ExpectedCall::new(
            "apt-get",
            &["--version"],
            Err(ToolError::NotFound {
                program: "apt-get".to_owned(),
            }),
        )]);
        let escalator = PrivilegeEscalator::new(&executor);

        let err = download_os_packages(&escalator, &bundle.layout, &["git".to_owned()], TIMEOUT)
            .expect_err("apt missing");

        assert!(err.to_string().contains("Debian-based"));
    }

    #[rstest]
    fn apt_failure_points_at_the_log(bundle: Bundle) {
        let executor = StubExecutor::new(vec![
            ExpectedCall::new("apt-get", &["--version"], Ok(success_output())),
            ExpectedCall::new("id", &["-u"], Ok(stdout_output("0"))),
            ExpectedCall::any_args("apt-get", Ok(failure_output("E: Unable to locate package"))),
        ]);
        let escalator = PrivilegeEscalator::new(&executor);

        let err = download_os_packages(&escalator, &bundle.layout, &["nope".to_owned()], TIMEOUT)
            .expect_err("apt failed");

        assert!(matches!(err, PackageError::CommandFailed { .. }));
        assert!(err.to_string().contains(APT_LOG));
    }

    #[rstest]
    fn cargo_vendor_writes_the_source_replacement(bundle: Bundle) {
        let manifest = bundle.layout.root().join("Cargo.toml");
        std::fs::write(&manifest, "[package]\nname = \"x\"\n").expect("manifest");
        let vendor = bundle.layout.vendor_dir();
        std::fs::create_dir_all(vendor.join("serde")).expect("crate dir");
        let snippet = "[source.crates-io]\nreplace-with = \"vendored-sources\"\n";
        let executor = StubExecutor::new(vec![
            ExpectedCall::new("cargo", &["--version"], Ok(success_output())),
            ExpectedCall::new(
                "cargo",
                &["vendor", "--manifest-path", manifest.as_str(), vendor.as_str()],
                Ok(stdout_output(snippet)),
            ),
        ]);

        let count = vendor_crates(&executor, &bundle.layout, &manifest, TIMEOUT).expect("vendor");

        assert_eq!(count, 1);
        let written =
            std::fs::read_to_string(bundle.layout.vendor_config()).expect("vendor config");
        assert_eq!(written, snippet);
    }

    #[rstest]
    fn pip_falls_back_to_python_and_clears_the_target(bundle: Bundle) {
        let requirements = bundle.layout.root().join("requirements-in.txt");
        std::fs::write(&requirements, "requests==2.32.3\n").expect("requirements");
        let site = bundle.layout.site_packages_dir();
        std::fs::create_dir_all(&site).expect("site");
        std::fs::write(site.join("stale.py"), b"").expect("stale");
        let executor = StubExecutor::new(vec![
            ExpectedCall::new(
                "python3",
                &["--version"],
                Err(ToolError::NotFound {
                    program: "python3".to_owned(),
                }),
            ),
            ExpectedCall::new("python", &["--version"], Ok(stdout_output("Python 3.12.3"))),
            ExpectedCall::any_args("python", Ok(success_output())),
        ]);

        let count = install_python_packages(&executor, &bundle.layout, &requirements, TIMEOUT)
            .expect("pip");

        assert_eq!(count, 0);
        assert!(!site.join("stale.py").exists());
        assert!(bundle.layout.python_dir().join("requirements.txt").is_file());
        let pip = executor.requests().pop().expect("pip request");
        assert_eq!(pip.args.get(..3), Some(&["-m".to_owned(), "pip".to_owned(), "install".to_owned()][..]));
        assert!(pip.args.contains(&"--ignore-installed".to_owned()));
    }

    #[rstest]
    fn pip_failure_surfaces_stderr(bundle: Bundle) {
        let requirements = bundle.layout.root().join("req.txt");
        std::fs::write(&requirements, "nonexistent-package\n").expect("requirements");
        let executor = StubExecutor::new(vec![
            ExpectedCall::new("python3", &["--version"], Ok(success_output())),
            ExpectedCall::any_args(
                "python3",
                Ok(failure_output("ERROR: No matching distribution found")),
            ),
        ]);

        let err = install_python_packages(&executor, &bundle.layout, &requirements, TIMEOUT)
            .expect_err("pip failed");

        assert!(err.to_string().contains("No matching distribution"));
    }
}
