//! Tests for command execution and capability ranking.

use super::*;
use crate::test_utils::{ExpectedCall, StubExecutor, failure_output, stdout_output, success_output};
use rstest::rstest;

#[derive(Debug)]
struct FixedProvider {
    name: &'static str,
    availability: Availability,
}

impl Capability for FixedProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn availability(&self) -> Availability {
        self.availability.clone()
    }
}

fn provider(name: &'static str, available: bool) -> FixedProvider {
    FixedProvider {
        name,
        availability: if available {
            Availability::Available
        } else {
            Availability::Unavailable(format!("{name} missing"))
        },
    }
}

#[test]
fn request_display_joins_program_and_args() {
    let request = CommandRequest::new("apt-get", ["install", "--download-only", "curl"]);
    assert_eq!(request.display(), "apt-get install --download-only curl");
}

#[test]
fn request_builder_sets_env_timeout_and_log() {
    let request = CommandRequest::new("ollama", ["serve"])
        .with_env("OLLAMA_MODELS", "/bundle/models")
        .with_timeout(Duration::from_secs(5))
        .logging_to(Utf8Path::new("/bundle/logs/ollama-serve.log"));
    assert_eq!(
        request.env,
        vec![("OLLAMA_MODELS".to_owned(), "/bundle/models".to_owned())]
    );
    assert_eq!(request.timeout, Some(Duration::from_secs(5)));
    assert_eq!(
        request.log_to.as_deref(),
        Some(Utf8Path::new("/bundle/logs/ollama-serve.log"))
    );
}

#[rstest]
#[case::first_wins(true, true, "primary")]
#[case::falls_through(false, true, "secondary")]
fn first_available_respects_rank(
    #[case] primary: bool,
    #[case] secondary: bool,
    #[case] expected: &str,
) {
    let providers = [provider("primary", primary), provider("secondary", secondary)];
    let chosen = first_available(&providers).expect("a provider");
    assert_eq!(chosen.name(), expected);
}

#[test]
fn first_available_reports_every_rejection() {
    let providers = [provider("zstd", false), provider("unzstd", false)];
    let err = first_available(&providers).expect_err("none available");
    assert!(err.contains("zstd missing"));
    assert!(err.contains("unzstd missing"));
}

#[test]
fn first_available_with_empty_list_is_an_error() {
    let providers: [FixedProvider; 0] = [];
    assert!(first_available(&providers).is_err());
}

#[test]
fn probe_command_maps_failure_to_unavailable() {
    let executor = StubExecutor::new(vec![ExpectedCall::new(
        "sha256sum",
        &["--version"],
        Ok(failure_output("boom")),
    )]);
    let availability = probe_command(&executor, "sha256sum", &["--version"]);
    assert!(!availability.is_available());
    executor.assert_finished();
}

#[test]
fn first_program_skips_missing_interpreter() {
    let executor = StubExecutor::new(vec![
        ExpectedCall::new(
            "python3",
            &["--version"],
            Err(ToolError::NotFound {
                program: "python3".to_owned(),
            }),
        ),
        ExpectedCall::new("python", &["--version"], Ok(success_output())),
    ]);
    let chosen = first_program(&executor, &["python3", "python"]).expect("python");
    assert_eq!(chosen, "python");
    executor.assert_finished();
}

#[test]
fn privilege_is_direct_for_root() {
    let executor = StubExecutor::new(vec![ExpectedCall::new(
        "id",
        &["-u"],
        Ok(stdout_output("0\n")),
    )]);
    let escalator = PrivilegeEscalator::new(&executor);
    assert_eq!(escalator.privilege(), Ok(Privilege::Direct));
    executor.assert_finished();
}

#[test]
fn privilege_falls_back_to_sudo() {
    let executor = StubExecutor::new(vec![
        ExpectedCall::new("id", &["-u"], Ok(stdout_output("1000\n"))),
        ExpectedCall::new("sudo", &["-n", "true"], Ok(success_output())),
    ]);
    let escalator = PrivilegeEscalator::new(&executor);
    assert_eq!(escalator.privilege(), Ok(Privilege::Sudo));
    executor.assert_finished();
}

#[test]
fn privilege_unavailable_without_root_or_sudo() {
    let executor = StubExecutor::new(vec![
        ExpectedCall::new("id", &["-u"], Ok(stdout_output("1000\n"))),
        ExpectedCall::new("sudo", &["-n", "true"], Ok(failure_output("a password is required"))),
    ]);
    let escalator = PrivilegeEscalator::new(&executor);
    assert!(escalator.privilege().is_err());
}

#[test]
fn sudo_wrap_prefixes_command_and_forwards_env() {
    let request = CommandRequest::new("apt-get", ["update"]).with_env("DEBIAN_FRONTEND", "noninteractive");
    let wrapped = PrivilegeEscalator::wrap(Privilege::Sudo, &request);
    assert_eq!(wrapped.program, "sudo");
    assert_eq!(
        wrapped.args,
        vec!["-n", "env", "DEBIAN_FRONTEND=noninteractive", "apt-get", "update"]
    );
    assert!(wrapped.env.is_empty());
}

#[test]
fn direct_wrap_leaves_request_untouched() {
    let request = CommandRequest::new("rm", ["-f", "--", "/bundle/models"]);
    assert_eq!(PrivilegeEscalator::wrap(Privilege::Direct, &request), request);
}

#[cfg(unix)]
#[test]
fn system_executor_captures_output() {
    let output = SystemCommandExecutor
        .run(&CommandRequest::new("sh", ["-c", "printf out; printf err >&2"]))
        .expect("run sh");
    assert!(output.status.success());
    assert_eq!(output.stdout, b"out");
    assert_eq!(output.stderr, b"err");
}

#[cfg(unix)]
#[test]
fn system_executor_writes_log_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = Utf8PathBuf::from_path_buf(dir.path().join("cmd.log")).expect("utf8");
    let request = CommandRequest::new("sh", ["-c", "echo hello; echo oops >&2"]).logging_to(&log);
    let output = SystemCommandExecutor.run(&request).expect("run sh");
    assert!(output.stdout.is_empty());
    let logged = std::fs::read_to_string(&log).expect("read log");
    assert!(logged.contains("hello"));
    assert!(logged.contains("oops"));
}

#[cfg(unix)]
#[test]
fn system_executor_kills_on_timeout() {
    let request = CommandRequest::new("sleep", ["5"]).with_timeout(Duration::from_millis(100));
    let err = SystemCommandExecutor.run(&request).expect_err("timeout");
    assert!(matches!(err, ToolError::TimedOut { .. }));
}

#[test]
fn missing_program_reports_not_found() {
    let request = CommandRequest::new("airgap-bundler-no-such-tool", Vec::<String>::new());
    let err = SystemCommandExecutor.run(&request).expect_err("missing");
    assert!(matches!(err, ToolError::NotFound { .. }));
}
