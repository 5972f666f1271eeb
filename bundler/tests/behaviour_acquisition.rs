//! Behaviour-driven tests for artefact acquisition.
//!
//! These scenarios drive the acquisition state machine through a stub
//! downloader and check how often the network is touched. Tests use the
//! rstest-bdd v0.5.0 mutable world pattern.

use airgap_bundler::acquisition::{Acquirer, AcquisitionReport, Artefact, Source};
use airgap_bundler::artefact::bounded_log::DEFAULT_LOG_LIMIT;
use airgap_bundler::artefact::descriptor::DescriptorKind;
use airgap_bundler::artefact::extraction::{Extraction, NativeExtractor};
use airgap_bundler::artefact::marker::marker_path;
use airgap_bundler::artefact::retry::{Fetcher, RetryPolicy};
use airgap_bundler::artefact::sha256_digest::Sha256Digest;
use airgap_bundler::artefact::verification::Verifier;
use airgap_bundler::ledger::{Component, Status};
use airgap_bundler::test_utils::{RecordingSleeper, StubDownloader, StubResponse};
use camino::Utf8PathBuf;
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use std::time::Duration;
use tempfile::TempDir;

const PACKAGE: &str = "codium_1.90.0_amd64.deb";
const PACKAGE_URL: &str = "https://github.test/download/codium_1.90.0_amd64.deb";
const DIGEST_URL: &str = "https://github.test/download/codium_1.90.0_amd64.deb.sha256";
const PACKAGE_BODY: &[u8] = b"editor package payload";

// ---------------------------------------------------------------------------
// World types
// ---------------------------------------------------------------------------

struct AcquisitionWorld {
    _dir: TempDir,
    root: Utf8PathBuf,
    downloader: StubDownloader,
    sleeper: RecordingSleeper,
    skip_verification: bool,
    report: Option<AcquisitionReport>,
}

impl AcquisitionWorld {
    fn artefact(&self) -> Artefact {
        Artefact::new(
            "VSCodium",
            Component::EditorPackage,
            self.root.join(PACKAGE),
            DescriptorKind::FilenameHash,
        )
        .with_source(Source::with_remote_descriptor(PACKAGE_URL, DIGEST_URL))
    }

    fn report(&self) -> &AcquisitionReport {
        self.report.as_ref().expect("acquisition ran")
    }
}

#[fixture]
fn world() -> AcquisitionWorld {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 tempdir");
    AcquisitionWorld {
        _dir: dir,
        root,
        downloader: StubDownloader::new(),
        sleeper: RecordingSleeper::default(),
        skip_verification: false,
        report: None,
    }
}

fn digest_line(body: &[u8]) -> String {
    format!("{}  {PACKAGE}\n", Sha256Digest::of_bytes(body))
}

// ---------------------------------------------------------------------------
// Step definitions
// ---------------------------------------------------------------------------

#[given("the editor package is published with its digest")]
fn given_published(world: &mut AcquisitionWorld) {
    world
        .downloader
        .respond(PACKAGE_URL, StubResponse::Body(PACKAGE_BODY.to_vec()));
    world
        .downloader
        .respond(DIGEST_URL, StubResponse::Body(digest_line(PACKAGE_BODY).into_bytes()));
}

#[given("the editor package is published with a digest that never matches")]
fn given_published_mismatched(world: &mut AcquisitionWorld) {
    world
        .downloader
        .respond(PACKAGE_URL, StubResponse::Body(b"truncated by a proxy".to_vec()));
    world
        .downloader
        .respond(DIGEST_URL, StubResponse::Body(digest_line(PACKAGE_BODY).into_bytes()));
}

#[given("a corrupt editor package is already in the bundle")]
fn given_corrupt_copy(world: &mut AcquisitionWorld) {
    let artefact = world.artefact();
    std::fs::write(&artefact.destination, b"tampered").expect("write package");
    std::fs::write(&artefact.descriptor().path, digest_line(PACKAGE_BODY)).expect("write digest");
}

#[given("verification is skipped")]
fn given_skip_verification(world: &mut AcquisitionWorld) {
    world.skip_verification = true;
}

#[when("the editor package is acquired")]
fn when_acquired(world: &mut AcquisitionWorld) {
    let policy = RetryPolicy {
        base_delay: Duration::from_millis(1),
        ..RetryPolicy::default()
    };
    let fetcher = Fetcher::new(&world.downloader, &world.sleeper, policy);
    let verifier = Verifier::builtin();
    let extraction = Extraction::new(
        vec![Box::new(NativeExtractor::default())],
        &world.root.join("logs"),
        DEFAULT_LOG_LIMIT,
    );
    let acquirer = Acquirer::new(&fetcher, &verifier, &extraction, world.skip_verification);
    let report = acquirer.acquire(&world.artefact());
    world.report = Some(report);
}

#[when("the editor package is acquired again")]
fn when_acquired_again(world: &mut AcquisitionWorld) {
    when_acquired(world);
}

#[then("the acquisition succeeds")]
fn then_succeeds(world: &mut AcquisitionWorld) {
    let report = world.report();
    assert!(report.succeeded(), "{report:?}");
}

#[then("the acquisition fails with \"{reason}\"")]
fn then_fails(world: &mut AcquisitionWorld, reason: String) {
    let report = world.report();
    assert_eq!(report.status, Status::Failed);
    assert!(report.detail.contains(&reason), "{}", report.detail);
}

#[then("the package download count is {count:usize}")]
fn then_download_count(world: &mut AcquisitionWorld, count: usize) {
    assert_eq!(world.downloader.request_count(PACKAGE_URL), count);
}

#[then("the editor package has a verification marker")]
fn then_marker_exists(world: &mut AcquisitionWorld) {
    assert!(marker_path(&world.artefact().destination).is_file());
}

#[then("the editor package is absent from the bundle")]
fn then_absent(world: &mut AcquisitionWorld) {
    let artefact = world.artefact();
    assert!(!artefact.destination.exists());
    assert!(!marker_path(&artefact.destination).exists());
}

// ---------------------------------------------------------------------------
// Scenario bindings
// ---------------------------------------------------------------------------

#[scenario(
    path = "tests/features/acquisition.feature",
    name = "Fresh download is verified and marked"
)]
fn scenario_fresh_download(world: AcquisitionWorld) {
    let _ = world;
}

#[scenario(
    path = "tests/features/acquisition.feature",
    name = "Second run trusts the marker"
)]
fn scenario_second_run(world: AcquisitionWorld) {
    let _ = world;
}

#[scenario(
    path = "tests/features/acquisition.feature",
    name = "Corrupt local copy is replaced once"
)]
fn scenario_corrupt_copy(world: AcquisitionWorld) {
    let _ = world;
}

#[scenario(
    path = "tests/features/acquisition.feature",
    name = "Persistent corruption fails without a third download"
)]
fn scenario_persistent_corruption(world: AcquisitionWorld) {
    let _ = world;
}

#[scenario(
    path = "tests/features/acquisition.feature",
    name = "Skipping verification accepts an existing file"
)]
fn scenario_skip_verification(world: AcquisitionWorld) {
    let _ = world;
}
