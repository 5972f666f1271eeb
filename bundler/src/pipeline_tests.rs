//! Tests for the bundle pipeline.

use super::*;
use crate::artefact::sha256_digest::Sha256Digest;
use crate::sources::releases::RUNTIME_CHECKSUM_LIST;
use crate::sources::rustup::RUSTUP_INIT_URL;
use crate::test_utils::{ExpectedCall, RecordingSleeper, StubDownloader, StubExecutor};
use crate::tools::ToolError;
use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

const RUNTIME_ASSET: &str = "ollama-linux-amd64.tar.zst";
const RUNTIME_URL: &str = "https://github.test/download/ollama-linux-amd64.tar.zst";
const CHECKSUMS_URL: &str = "https://github.test/download/sha256sum.txt";

struct Workspace {
    _dir: TempDir,
    root: Utf8PathBuf,
    sleeper: RecordingSleeper,
}

#[fixture]
fn workspace() -> Workspace {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(dir.path().join("bundle")).expect("utf8");
    Workspace {
        _dir: dir,
        root,
        sleeper: RecordingSleeper::default(),
    }
}

impl Workspace {
    /// Configuration with every component switched off.
    fn quiet_config(&self) -> BundleConfig {
        let mut config = BundleConfig {
            bundle_dir: self.root.clone(),
            runtime: false,
            editor: false,
            rust_toolchain: false,
            runtime_min_bytes: 1,
            ..BundleConfig::default()
        };
        config.network.base_delay_secs = 0;
        config
    }

    fn layout(&self) -> BundleLayout {
        BundleLayout::new(self.root.clone())
    }

    fn run(
        &self,
        config: BundleConfig,
        executor: &StubExecutor,
        downloader: &StubDownloader,
    ) -> (Ledger, String) {
        let collaborators = Collaborators {
            executor,
            downloader,
            sleeper: &self.sleeper,
        };
        let mut stderr = Vec::new();
        let ledger = run_bundle(BundleContext::new(config, false), &collaborators, &mut stderr)
            .expect("bundle directory is usable");
        (ledger, String::from_utf8(stderr).expect("utf8 output"))
    }
}

fn sha_line(body: &[u8], name: &str) -> String {
    format!("{}  {name}\n", Sha256Digest::of_bytes(body))
}

fn runtime_archive() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let body = b"#!/bin/sh\necho ollama\n";
    let mut header = tar::Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "bin/ollama", &body[..])
        .expect("append");
    let tarball = builder.into_inner().expect("tar");
    zstd::encode_all(&tarball[..], 0).expect("zstd")
}

fn release_json(assets: &[&str]) -> String {
    let assets: Vec<String> = assets
        .iter()
        .map(|name| {
            format!(
                r#"{{"name":"{name}","browser_download_url":"https://github.test/download/{name}","size":1}}"#
            )
        })
        .collect();
    format!(r#"{{"tag_name":"v0.5.7","assets":[{}]}}"#, assets.join(","))
}

#[rstest]
fn disabled_components_are_skipped(workspace: Workspace) {
    let executor = StubExecutor::default();
    let downloader = StubDownloader::new();

    let (ledger, output) = workspace.run(workspace.quiet_config(), &executor, &downloader);

    assert_eq!(ledger.tally().skipped, Component::ALL.len());
    assert!(!ledger.has_failures());
    assert_eq!(downloader.total_requests(), 0);
    assert!(executor.requests().is_empty());
    for dir in workspace.layout().directories() {
        assert!(dir.is_dir(), "{dir} missing");
    }
    assert!(output.contains("[1/8]"));
    assert!(output.contains("[8/8]"));
}

#[rstest]
fn quiet_runs_print_nothing(workspace: Workspace) {
    let executor = StubExecutor::default();
    let downloader = StubDownloader::new();
    let collaborators = Collaborators {
        executor: &executor,
        downloader: &downloader,
        sleeper: &workspace.sleeper,
    };
    let mut stderr = Vec::new();

    run_bundle(
        BundleContext::new(workspace.quiet_config(), true),
        &collaborators,
        &mut stderr,
    )
    .expect("ledger");

    assert!(stderr.is_empty());
}

#[cfg(unix)]
#[test]
fn unusable_bundle_directory_stops_the_run() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let readonly = Utf8PathBuf::from_path_buf(dir.path().join("readonly")).expect("utf8");
    std::fs::create_dir(&readonly).expect("mkdir");
    std::fs::set_permissions(&readonly, std::fs::Permissions::from_mode(0o555)).expect("chmod");
    if tempfile::tempfile_in(&readonly).is_ok() {
        // Privileged users can write regardless of mode bits.
        return;
    }
    let executor = StubExecutor::default();
    let downloader = StubDownloader::new();
    let sleeper = RecordingSleeper::default();
    let collaborators = Collaborators {
        executor: &executor,
        downloader: &downloader,
        sleeper: &sleeper,
    };
    let config = BundleConfig {
        bundle_dir: readonly.join("bundle"),
        ..BundleConfig::default()
    };

    let result = run_bundle(BundleContext::new(config, true), &collaborators, &mut Vec::new());
    std::fs::set_permissions(&readonly, std::fs::Permissions::from_mode(0o755)).expect("chmod");

    let err = result.expect_err("read-only parent");
    assert!(matches!(err, BundlerError::Workspace { .. }));
    assert_eq!(downloader.total_requests(), 0);
}

#[rstest]
fn runtime_is_downloaded_verified_and_extracted_once(workspace: Workspace) {
    let archive = runtime_archive();
    let downloader = StubDownloader::new()
        .with_body(
            OLLAMA_LATEST_RELEASE,
            release_json(&[RUNTIME_ASSET, "ollama-darwin.tgz", RUNTIME_CHECKSUM_LIST]),
        )
        .with_body(RUNTIME_URL, archive.clone())
        .with_body(CHECKSUMS_URL, sha_line(&archive, &format!("./{RUNTIME_ASSET}")));
    let executor = StubExecutor::default();
    let config = BundleConfig {
        runtime: true,
        ..workspace.quiet_config()
    };

    let (first, _) = workspace.run(config.clone(), &executor, &downloader);
    let (second, _) = workspace.run(config, &executor, &downloader);

    assert_eq!(first.get(Component::RuntimeBinary).status, Status::Success);
    assert_eq!(second.get(Component::RuntimeBinary).status, Status::Success);
    assert!(workspace.layout().runtime_dir().join("bin/ollama").is_file());
    assert_eq!(downloader.request_count(RUNTIME_URL), 1);
}

#[rstest]
fn runtime_without_any_source_fails(workspace: Workspace) {
    let executor = StubExecutor::default();
    let downloader = StubDownloader::new();
    let config = BundleConfig {
        runtime: true,
        ..workspace.quiet_config()
    };

    let (ledger, _) = workspace.run(config, &executor, &downloader);

    let entry = ledger.get(Component::RuntimeBinary);
    assert_eq!(entry.status, Status::Failed);
    assert!(
        entry
            .detail
            .as_deref()
            .is_some_and(|detail| detail.contains("no earlier download"))
    );
    assert_eq!(ledger.get(Component::Models).status, Status::Skipped);
}

#[rstest]
fn editor_falls_back_to_an_earlier_download(workspace: Workspace) {
    let layout = workspace.layout();
    std::fs::create_dir_all(layout.editor_dir()).expect("editor dir");
    let name = "codium_1.90.0_amd64.deb";
    let body = b"editor package";
    std::fs::write(layout.editor_dir().join(name), body).expect("deb");
    std::fs::write(
        layout.editor_dir().join(format!("{name}.sha256")),
        sha_line(body, name),
    )
    .expect("descriptor");
    let executor = StubExecutor::default();
    let downloader = StubDownloader::new();
    let config = BundleConfig {
        editor: true,
        ..workspace.quiet_config()
    };

    let (ledger, _) = workspace.run(config, &executor, &downloader);

    assert_eq!(ledger.get(Component::EditorPackage).status, Status::Success);
    assert_eq!(downloader.request_count(VSCODIUM_LATEST_RELEASE), 1);
}

#[rstest]
fn editor_with_unreachable_metadata_and_no_copy_fails(workspace: Workspace) {
    let executor = StubExecutor::default();
    let downloader = StubDownloader::new();
    let config = BundleConfig {
        editor: true,
        ..workspace.quiet_config()
    };

    let (ledger, _) = workspace.run(config, &executor, &downloader);

    assert_eq!(ledger.get(Component::EditorPackage).status, Status::Failed);
}

#[rstest]
fn malformed_extension_ids_fail_the_component(workspace: Workspace) {
    let executor = StubExecutor::default();
    let downloader = StubDownloader::new();
    let config = BundleConfig {
        extensions: vec!["not an id".to_owned()],
        ..workspace.quiet_config()
    };

    let (ledger, _) = workspace.run(config, &executor, &downloader);

    let entry = ledger.get(Component::Extensions);
    assert_eq!(entry.status, Status::Failed);
    assert!(
        entry
            .detail
            .as_deref()
            .is_some_and(|detail| detail.contains("not an id"))
    );
    assert_eq!(downloader.total_requests(), 0);
}

#[cfg(unix)]
#[rstest]
fn rustup_installer_is_verified_and_made_executable(workspace: Workspace) {
    use std::os::unix::fs::PermissionsExt;

    let body = b"#!/bin/sh\necho rustup\n";
    let downloader = StubDownloader::new()
        .with_body(RUSTUP_INIT_URL, &body[..])
        .with_body(
            &format!("{RUSTUP_INIT_URL}.sha256"),
            sha_line(body, "rustup-init"),
        );
    let executor = StubExecutor::default();
    let config = BundleConfig {
        rust_toolchain: true,
        ..workspace.quiet_config()
    };

    let (ledger, _) = workspace.run(config, &executor, &downloader);

    assert_eq!(ledger.get(Component::RustToolchain).status, Status::Success);
    let installer = workspace.layout().toolchain_dir().join("rustup-init");
    let mode = std::fs::metadata(&installer).expect("metadata").permissions().mode();
    assert_ne!(mode & 0o111, 0);
}

#[rstest]
fn models_without_a_runtime_fail(workspace: Workspace) {
    let executor = StubExecutor::new(vec![ExpectedCall::new(
        "ollama",
        &["--version"],
        Err(ToolError::NotFound {
            program: "ollama".to_owned(),
        }),
    )]);
    let downloader = StubDownloader::new();
    let config = BundleConfig {
        models: vec!["llama3".to_owned()],
        ..workspace.quiet_config()
    };

    let (ledger, _) = workspace.run(config, &executor, &downloader);

    executor.assert_finished();
    let entry = ledger.get(Component::Models);
    assert_eq!(entry.status, Status::Failed);
    assert!(
        entry
            .detail
            .as_deref()
            .is_some_and(|detail| detail.contains("no usable model runtime"))
    );
}

#[rstest]
fn one_failure_does_not_stop_later_components(workspace: Workspace) {
    let body = b"installer";
    let downloader = StubDownloader::new()
        .with_body(RUSTUP_INIT_URL, &body[..])
        .with_body(
            &format!("{RUSTUP_INIT_URL}.sha256"),
            sha_line(body, "rustup-init"),
        );
    let executor = StubExecutor::default();
    let config = BundleConfig {
        editor: true,
        rust_toolchain: true,
        ..workspace.quiet_config()
    };

    let (ledger, _) = workspace.run(config, &executor, &downloader);

    assert_eq!(ledger.get(Component::EditorPackage).status, Status::Failed);
    assert_eq!(ledger.get(Component::RustToolchain).status, Status::Success);
    assert_eq!(ledger.tally().failed, 1);
}
