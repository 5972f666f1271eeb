//! Shared test utilities for the bundler crate.
//!
//! Available to unit tests and, through the `test-support` feature, to the
//! behaviour suites under `tests/`.

use crate::artefact::download::{DownloadError, Downloader};
use crate::artefact::retry::Sleeper;
use crate::tools::{BackgroundProcess, CommandExecutor, CommandRequest, Result, ToolError};
use camino::Utf8Path;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::process::{ExitStatus, Output};
use std::time::Duration;

/// Creates an `ExitStatus` from an exit code (Unix implementation).
#[cfg(unix)]
#[must_use]
pub fn exit_status(code: i32) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;

    ExitStatus::from_raw(code << 8)
}

/// Creates an `ExitStatus` from an exit code (Windows implementation).
#[cfg(windows)]
#[must_use]
pub fn exit_status(code: i32) -> ExitStatus {
    use std::os::windows::process::ExitStatusExt;

    ExitStatus::from_raw(code.cast_unsigned())
}

/// Creates a successful command `Output` with empty stdout and stderr.
#[must_use]
pub fn success_output() -> Output {
    Output {
        status: exit_status(0),
        stdout: Vec::new(),
        stderr: Vec::new(),
    }
}

/// Creates a successful command `Output` with the given stdout.
#[must_use]
pub fn stdout_output(stdout: &str) -> Output {
    Output {
        status: exit_status(0),
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

/// Creates a failed command `Output` with the given stderr message.
#[must_use]
pub fn failure_output(stderr: &str) -> Output {
    Output {
        status: exit_status(1),
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

/// Represents an expected command invocation for testing.
#[derive(Debug)]
pub struct ExpectedCall {
    /// The program to execute (e.g., "tar").
    pub program: String,
    /// The arguments to expect, or `None` to accept any.
    pub args: Option<Vec<String>>,
    /// The result to return when this command is invoked.
    pub result: Result<Output>,
}

impl ExpectedCall {
    /// Expect `program` with exactly `args`.
    #[must_use]
    pub fn new(program: &str, args: &[&str], result: Result<Output>) -> Self {
        Self {
            program: program.to_owned(),
            args: Some(args.iter().map(|arg| (*arg).to_owned()).collect()),
            result,
        }
    }

    /// Expect `program` with any arguments, for paths that embed temporary
    /// directories.
    #[must_use]
    pub fn any_args(program: &str, result: Result<Output>) -> Self {
        Self {
            program: program.to_owned(),
            args: None,
            result,
        }
    }
}

/// A stub implementation of `CommandExecutor` for testing.
///
/// Records expected command invocations and returns predefined results,
/// allowing tests to verify command execution without side effects. Calls
/// made through [`CommandExecutor::spawn`] consume expectations too; a
/// successful result yields a process that runs until stopped.
#[derive(Debug, Default)]
pub struct StubExecutor {
    expected: RefCell<VecDeque<ExpectedCall>>,
    received: RefCell<Vec<CommandRequest>>,
}

impl StubExecutor {
    /// Creates a new `StubExecutor` with the given expected calls.
    #[must_use]
    pub fn new(expected: Vec<ExpectedCall>) -> Self {
        Self {
            expected: RefCell::new(expected.into()),
            received: RefCell::new(Vec::new()),
        }
    }

    /// Every request received so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<CommandRequest> {
        self.received.borrow().clone()
    }

    /// Asserts that all expected command invocations have been consumed.
    ///
    /// # Panics
    ///
    /// Panics if there are remaining expected calls that were not invoked.
    pub fn assert_finished(&self) {
        let remaining = self.expected.borrow();
        assert!(
            remaining.is_empty(),
            "expected no further command invocations, {} remain: {:?}",
            remaining.len(),
            remaining.iter().map(|call| &call.program).collect::<Vec<_>>()
        );
    }

    fn next_result(&self, request: &CommandRequest) -> Result<Output> {
        self.received.borrow_mut().push(request.clone());
        let Some(call) = self.expected.borrow_mut().pop_front() else {
            return Err(ToolError::StubMismatch {
                message: format!("unexpected command invocation: {}", request.display()),
            });
        };
        if call.program != request.program {
            return Err(ToolError::StubMismatch {
                message: format!(
                    "expected program {}, got {}",
                    call.program,
                    request.display()
                ),
            });
        }
        if let Some(args) = &call.args
            && *args != request.args
        {
            return Err(ToolError::StubMismatch {
                message: format!("expected {} {args:?}, got {:?}", call.program, request.args),
            });
        }
        call.result
    }
}

impl CommandExecutor for StubExecutor {
    fn run(&self, request: &CommandRequest) -> Result<Output> {
        self.next_result(request)
    }

    fn spawn(&self, request: &CommandRequest) -> Result<Box<dyn BackgroundProcess>> {
        let output = self.next_result(request)?;
        Ok(Box::new(StubProcess {
            running: output.status.success(),
        }))
    }
}

/// A background process that runs until stopped.
#[derive(Debug)]
pub struct StubProcess {
    running: bool,
}

impl BackgroundProcess for StubProcess {
    fn is_running(&mut self) -> bool {
        self.running
    }

    fn stop(&mut self) -> std::io::Result<()> {
        self.running = false;
        Ok(())
    }
}

/// A canned response served by [`StubDownloader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubResponse {
    /// Respond with this body.
    Body(Vec<u8>),
    /// Respond with an HTTP error status.
    Status(u16),
    /// Fail before a response arrives.
    Transport(String),
}

/// A `Downloader` serving canned responses per URL.
///
/// Each URL holds a queue of responses; the last one is repeated once the
/// queue is drained. Unknown URLs answer 404. Requests are counted so that
/// tests can assert that a second run made no network calls.
#[derive(Debug, Default)]
pub struct StubDownloader {
    routes: RefCell<HashMap<String, VecDeque<StubResponse>>>,
    requests: RefCell<Vec<String>>,
}

impl StubDownloader {
    /// Create a downloader with no routes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` for `url`.
    #[must_use]
    pub fn with_body(self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.respond(url, StubResponse::Body(body.into()));
        self
    }

    /// Queue `responses` for `url`, served in order.
    #[must_use]
    pub fn with_sequence(self, url: &str, responses: Vec<StubResponse>) -> Self {
        for response in responses {
            self.respond(url, response);
        }
        self
    }

    /// Queue another response for `url`.
    pub fn respond(&self, url: &str, response: StubResponse) {
        self.routes
            .borrow_mut()
            .entry(url.to_owned())
            .or_default()
            .push_back(response);
    }

    /// Number of requests made for `url`.
    #[must_use]
    pub fn request_count(&self, url: &str) -> usize {
        self.requests
            .borrow()
            .iter()
            .filter(|requested| requested.as_str() == url)
            .count()
    }

    /// Number of requests made for any URL.
    #[must_use]
    pub fn total_requests(&self) -> usize {
        self.requests.borrow().len()
    }

    fn serve(&self, url: &str) -> std::result::Result<Vec<u8>, DownloadError> {
        self.requests.borrow_mut().push(url.to_owned());
        let mut routes = self.routes.borrow_mut();
        let response = match routes.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        match response {
            Some(StubResponse::Body(body)) => Ok(body),
            Some(StubResponse::Status(404 | 410)) | None => Err(DownloadError::NotFound {
                url: url.to_owned(),
            }),
            Some(StubResponse::Status(status)) => Err(DownloadError::Http {
                url: url.to_owned(),
                status,
            }),
            Some(StubResponse::Transport(reason)) => Err(DownloadError::Transport {
                url: url.to_owned(),
                reason,
            }),
        }
    }
}

impl Downloader for StubDownloader {
    fn fetch_text(
        &self,
        url: &str,
        _timeout: Duration,
    ) -> std::result::Result<String, DownloadError> {
        let body = self.serve(url)?;
        String::from_utf8(body).map_err(|err| DownloadError::InvalidPayload {
            url: url.to_owned(),
            reason: err.to_string(),
        })
    }

    fn download_to(
        &self,
        url: &str,
        dest: &Utf8Path,
        _timeout: Duration,
    ) -> std::result::Result<u64, DownloadError> {
        let body = self.serve(url)?;
        if body.is_empty() {
            return Err(DownloadError::Empty {
                url: url.to_owned(),
            });
        }
        std::fs::write(dest, &body).map_err(|source| DownloadError::Write {
            path: dest.to_owned(),
            source,
        })?;
        Ok(body.len() as u64)
    }
}

/// A `Sleeper` that records requested delays instead of blocking.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    /// Delays requested so far.
    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.delays.borrow_mut().push(duration);
    }
}
