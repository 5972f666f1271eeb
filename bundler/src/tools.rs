//! External command execution and capability ranking.
//!
//! Every subprocess the bundler launches goes through [`CommandExecutor`] so
//! that tests can substitute a stub. Where several tools can satisfy the same
//! need (hashing, extraction, privilege escalation, interpreters) the
//! candidates are listed in preference order and the first one reporting
//! [`Availability::Available`] is used.

use camino::{Utf8Path, Utf8PathBuf};
use std::fs::File;
use std::io::Read;
use std::process::{Child, Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use wait_timeout::ChildExt;

/// Errors raised while launching or supervising an external command.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The program could not be found on `PATH`.
    #[error("{program} is not installed or not on PATH")]
    NotFound {
        /// Program that was requested.
        program: String,
    },

    /// The program exists but could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        /// Program that was requested.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The command did not finish within its timeout and was killed.
    #[error("{program} timed out after {seconds} seconds")]
    TimedOut {
        /// Program that was killed.
        program: String,
        /// Timeout that elapsed.
        seconds: u64,
    },

    /// An I/O operation around the command failed.
    #[error("I/O error running command: {0}")]
    Io(#[from] std::io::Error),

    /// Test stub received an unexpected or mismatched command invocation.
    #[cfg(any(test, feature = "test-support"))]
    #[error("stub mismatch: {message}")]
    StubMismatch {
        /// Description of what was expected versus what was received.
        message: String,
    },
}

/// Result type alias using [`ToolError`].
pub type Result<T> = std::result::Result<T, ToolError>;

/// A fully described command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Program name or path.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Environment variables set on the child only.
    pub env: Vec<(String, String)>,
    /// Kill the command if it runs longer than this.
    pub timeout: Option<Duration>,
    /// Send stdout and stderr to this file instead of capturing them.
    pub log_to: Option<Utf8PathBuf>,
}

impl CommandRequest {
    /// Create a request with no environment, timeout or log file.
    ///
    /// # Examples
    ///
    /// ```
    /// use airgap_bundler::tools::CommandRequest;
    ///
    /// let request = CommandRequest::new("sha256sum", ["--version"]);
    /// assert_eq!(request.display(), "sha256sum --version");
    /// ```
    #[must_use]
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            timeout: None,
            log_to: None,
        }
    }

    /// Add an environment variable for the child process.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the timeout after which the command is killed.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Redirect the combined output to `path`.
    #[must_use]
    pub fn logging_to(mut self, path: &Utf8Path) -> Self {
        self.log_to = Some(path.to_owned());
        self
    }

    /// Render the command line for log messages.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).stdin(Stdio::null());
        for (key, value) in &self.env {
            command.env(key, value);
        }
        command
    }
}

/// A process left running in the background.
pub trait BackgroundProcess {
    /// Returns `true` while the process has not exited.
    fn is_running(&mut self) -> bool;

    /// Terminate the process and reap it.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the process could not be signalled or reaped.
    fn stop(&mut self) -> std::io::Result<()>;
}

/// Abstraction for running external commands.
pub trait CommandExecutor {
    /// Run a command to completion and return its captured output.
    ///
    /// Output redirected with [`CommandRequest::logging_to`] is not captured.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError`] when the command cannot be started or exceeds
    /// its timeout. A non-zero exit status is not an error.
    fn run(&self, request: &CommandRequest) -> Result<Output>;

    /// Start a command and return without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError`] when the command cannot be started.
    fn spawn(&self, request: &CommandRequest) -> Result<Box<dyn BackgroundProcess>>;
}

/// Executes commands on the host system.
///
/// # Examples
///
/// ```no_run
/// use airgap_bundler::tools::{CommandExecutor, CommandRequest, SystemCommandExecutor};
///
/// let executor = SystemCommandExecutor;
/// let output = executor.run(&CommandRequest::new("tar", ["--version"]))?;
/// assert!(output.status.success());
/// # Ok::<(), airgap_bundler::tools::ToolError>(())
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandExecutor;

impl CommandExecutor for SystemCommandExecutor {
    fn run(&self, request: &CommandRequest) -> Result<Output> {
        log::debug!("running {}", request.display());
        let mut command = request.to_command();
        attach_output(&mut command, request.log_to.as_deref())?;
        let mut child = command
            .spawn()
            .map_err(|source| spawn_error(&request.program, source))?;

        let stdout = child.stdout.take().map(collect_stream);
        let stderr = child.stderr.take().map(collect_stream);

        let status = match request.timeout {
            Some(timeout) => {
                if let Some(status) = child.wait_timeout(timeout)? {
                    status
                } else {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ToolError::TimedOut {
                        program: request.program.clone(),
                        seconds: timeout.as_secs(),
                    });
                }
            }
            None => child.wait()?,
        };

        Ok(Output {
            status,
            stdout: join_stream(stdout),
            stderr: join_stream(stderr),
        })
    }

    fn spawn(&self, request: &CommandRequest) -> Result<Box<dyn BackgroundProcess>> {
        log::debug!("starting {} in the background", request.display());
        let mut command = request.to_command();
        match request.log_to.as_deref() {
            Some(path) => attach_output(&mut command, Some(path))?,
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        let child = command
            .spawn()
            .map_err(|source| spawn_error(&request.program, source))?;
        Ok(Box::new(SystemProcess { child }))
    }
}

struct SystemProcess {
    child: Child,
}

impl BackgroundProcess for SystemProcess {
    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn stop(&mut self) -> std::io::Result<()> {
        if self.is_running() {
            self.child.kill()?;
        }
        self.child.wait().map(|_| ())
    }
}

fn attach_output(command: &mut Command, log_to: Option<&Utf8Path>) -> Result<()> {
    match log_to {
        Some(path) => {
            let file = File::create(path)?;
            let duplicate = file.try_clone()?;
            command.stdout(Stdio::from(file)).stderr(Stdio::from(duplicate));
        }
        None => {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
    }
    Ok(())
}

fn spawn_error(program: &str, source: std::io::Error) -> ToolError {
    if source.kind() == std::io::ErrorKind::NotFound {
        ToolError::NotFound {
            program: program.to_owned(),
        }
    } else {
        ToolError::Spawn {
            program: program.to_owned(),
            source,
        }
    }
}

// Pipes are drained on their own threads so a chatty child cannot block on a
// full pipe while we wait for it to exit.
fn collect_stream<R: Read + Send + 'static>(mut stream: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = stream.read_to_end(&mut buffer);
        buffer
    })
}

fn join_stream(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .map(|handle| handle.join().unwrap_or_default())
        .unwrap_or_default()
}

/// Whether a capability provider can be used on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    /// The provider is ready.
    Available,
    /// The provider cannot be used, with a reason for diagnostics.
    Unavailable(String),
}

impl Availability {
    /// Returns `true` for [`Availability::Available`].
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }
}

/// One interchangeable provider of a capability.
pub trait Capability {
    /// Short name used in logs and hints.
    fn name(&self) -> &str;

    /// Probe whether the provider can be used right now.
    fn availability(&self) -> Availability;
}

/// Return the first available provider in preference order.
///
/// # Errors
///
/// When no provider is available, returns a message listing every candidate
/// with the reason it was rejected.
pub fn first_available<'a, T>(
    providers: impl IntoIterator<Item = &'a T>,
) -> std::result::Result<&'a T, String>
where
    T: Capability + ?Sized + 'a,
{
    let mut rejected = Vec::new();
    for provider in providers {
        match provider.availability() {
            Availability::Available => {
                log::debug!("using provider {}", provider.name());
                return Ok(provider);
            }
            Availability::Unavailable(reason) => {
                log::debug!("provider {} unavailable: {reason}", provider.name());
                rejected.push(format!("{}: {reason}", provider.name()));
            }
        }
    }
    if rejected.is_empty() {
        Err("no providers configured".to_owned())
    } else {
        Err(rejected.join("; "))
    }
}

/// Probe a program by running it with harmless arguments.
///
/// # Examples
///
/// ```no_run
/// use airgap_bundler::tools::{SystemCommandExecutor, probe_command};
///
/// let availability = probe_command(&SystemCommandExecutor, "zstd", &["--version"]);
/// println!("{availability:?}");
/// ```
pub fn probe_command(executor: &dyn CommandExecutor, program: &str, args: &[&str]) -> Availability {
    let request = CommandRequest::new(program, args.iter().copied()).with_timeout(PROBE_TIMEOUT);
    match executor.run(&request) {
        Ok(output) if output.status.success() => Availability::Available,
        Ok(output) => Availability::Unavailable(format!(
            "{} exited with {}",
            request.display(),
            output.status
        )),
        Err(err) => Availability::Unavailable(err.to_string()),
    }
}

/// Timeout applied to availability probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// A program that is usable when `<program> --version` succeeds.
#[derive(Clone, Copy)]
pub struct ProgramProbe<'a> {
    executor: &'a dyn CommandExecutor,
    program: &'a str,
}

impl<'a> ProgramProbe<'a> {
    /// Create a probe for `program`.
    #[must_use]
    pub fn new(executor: &'a dyn CommandExecutor, program: &'a str) -> Self {
        Self { executor, program }
    }

    /// Program this probe stands for.
    #[must_use]
    pub fn program(&self) -> &'a str {
        self.program
    }
}

impl Capability for ProgramProbe<'_> {
    fn name(&self) -> &str {
        self.program
    }

    fn availability(&self) -> Availability {
        probe_command(self.executor, self.program, &["--version"])
    }
}

/// Pick the first of `programs` that answers `--version`.
///
/// # Errors
///
/// Returns the combined rejection reasons when none responds.
pub fn first_program<'a>(
    executor: &'a dyn CommandExecutor,
    programs: &[&'a str],
) -> std::result::Result<&'a str, String> {
    let probes: Vec<ProgramProbe<'a>> = programs
        .iter()
        .map(|&program| ProgramProbe::new(executor, program))
        .collect();
    first_available(&probes).map(ProgramProbe::program)
}

/// How privileged operations are carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// The process already runs as root.
    Direct,
    /// Commands are prefixed with non-interactive `sudo`.
    Sudo,
}

/// Ranked privilege escalation: already root, then `sudo -n`.
pub struct PrivilegeEscalator<'a> {
    executor: &'a dyn CommandExecutor,
}

impl<'a> PrivilegeEscalator<'a> {
    /// Create an escalator that probes through `executor`.
    #[must_use]
    pub fn new(executor: &'a dyn CommandExecutor) -> Self {
        Self { executor }
    }

    /// Return the executor used for escalated commands.
    #[must_use]
    pub fn executor(&self) -> &'a dyn CommandExecutor {
        self.executor
    }

    /// Determine the best available privilege mode.
    ///
    /// # Errors
    ///
    /// Returns a reason when neither mode is usable.
    pub fn privilege(&self) -> std::result::Result<Privilege, String> {
        let providers: [&dyn Capability; 2] = [
            &RootCheck {
                executor: self.executor,
            },
            &SudoCheck {
                executor: self.executor,
            },
        ];
        let chosen = first_available(providers)?;
        if chosen.name() == ROOT_PROVIDER {
            Ok(Privilege::Direct)
        } else {
            Ok(Privilege::Sudo)
        }
    }

    /// Rewrite `request` so that it runs with the chosen privilege.
    #[must_use]
    pub fn wrap(privilege: Privilege, request: &CommandRequest) -> CommandRequest {
        match privilege {
            Privilege::Direct => request.clone(),
            Privilege::Sudo => {
                let mut args = vec!["-n".to_owned()];
                if !request.env.is_empty() {
                    args.push("env".to_owned());
                    args.extend(request.env.iter().map(|(k, v)| format!("{k}={v}")));
                }
                args.push(request.program.clone());
                args.extend(request.args.iter().cloned());
                CommandRequest {
                    program: "sudo".to_owned(),
                    args,
                    env: Vec::new(),
                    timeout: request.timeout,
                    log_to: request.log_to.clone(),
                }
            }
        }
    }

    /// Run `request` with escalated privileges.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::NotFound`] for `sudo` when no privilege mode is
    /// available, or any error from running the wrapped command.
    pub fn run(&self, request: &CommandRequest) -> Result<Output> {
        let privilege = self.privilege().map_err(|reason| {
            log::warn!("cannot escalate privileges: {reason}");
            ToolError::NotFound {
                program: "sudo".to_owned(),
            }
        })?;
        self.executor.run(&Self::wrap(privilege, request))
    }
}

const ROOT_PROVIDER: &str = "root";

struct RootCheck<'a> {
    executor: &'a dyn CommandExecutor,
}

impl Capability for RootCheck<'_> {
    fn name(&self) -> &str {
        ROOT_PROVIDER
    }

    fn availability(&self) -> Availability {
        let request = CommandRequest::new("id", ["-u"]).with_timeout(PROBE_TIMEOUT);
        match self.executor.run(&request) {
            Ok(output) if String::from_utf8_lossy(&output.stdout).trim() == "0" => {
                Availability::Available
            }
            Ok(_) => Availability::Unavailable("not running as root".to_owned()),
            Err(err) => Availability::Unavailable(err.to_string()),
        }
    }
}

struct SudoCheck<'a> {
    executor: &'a dyn CommandExecutor,
}

impl Capability for SudoCheck<'_> {
    fn name(&self) -> &str {
        "sudo"
    }

    fn availability(&self) -> Availability {
        probe_command(self.executor, "sudo", &["-n", "true"])
    }
}

#[cfg(test)]
#[path = "tools_tests.rs"]
mod tests;
