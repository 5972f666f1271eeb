//! Tests for the integrity verifier.

use super::*;
use crate::test_utils::{ExpectedCall, StubExecutor, failure_output, stdout_output, success_output};
use rstest::{fixture, rstest};
use tempfile::TempDir;

const PAYLOAD: &[u8] = b"codium package payload";

struct Scratch {
    _dir: TempDir,
    file: Utf8PathBuf,
    descriptor: Utf8PathBuf,
}

#[fixture]
fn scratch() -> Scratch {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 tempdir");
    let file = root.join("codium_1.90_amd64.deb");
    std::fs::write(&file, PAYLOAD).expect("write payload");
    let descriptor = root.join("codium_1.90_amd64.deb.sha256");
    Scratch {
        _dir: dir,
        file,
        descriptor,
    }
}

fn payload_hex() -> String {
    Sha256Digest::of_bytes(PAYLOAD).to_string()
}

#[rstest]
fn filename_hash_match_is_authentic(scratch: Scratch) {
    let line = format!("{}  codium_1.90_amd64.deb\n", payload_hex());
    std::fs::write(&scratch.descriptor, line).expect("descriptor");

    let verdict = Verifier::builtin().verify(
        &scratch.file,
        &scratch.descriptor,
        DescriptorKind::FilenameHash,
    );

    assert!(matches!(
        verdict,
        Verdict::Authentic {
            basis: DigestBasis::Descriptor,
            ..
        }
    ));
}

#[rstest]
fn filename_hash_mismatch_is_corrupt(scratch: Scratch) {
    let wrong = "0".repeat(64);
    std::fs::write(&scratch.descriptor, format!("{wrong}  codium_1.90_amd64.deb\n"))
        .expect("descriptor");

    let verdict = Verifier::builtin().verify(
        &scratch.file,
        &scratch.descriptor,
        DescriptorKind::FilenameHash,
    );

    match verdict {
        Verdict::Corrupt { expected, actual } => {
            assert_eq!(expected.as_str(), wrong);
            assert_eq!(actual.as_str(), payload_hex());
        }
        other => panic!("expected Corrupt, got {other:?}"),
    }
}

#[rstest]
#[case::upper_with_whitespace(format!("  {}\r\n", payload_hex().to_uppercase()))]
#[case::plain(payload_hex())]
fn bare_hash_tolerates_case_and_whitespace(scratch: Scratch, #[case] body: String) {
    std::fs::write(&scratch.descriptor, body).expect("descriptor");

    let verdict =
        Verifier::builtin().verify(&scratch.file, &scratch.descriptor, DescriptorKind::BareHash);

    assert!(matches!(
        verdict,
        Verdict::Authentic {
            basis: DigestBasis::Descriptor,
            ..
        }
    ));
}

#[rstest]
fn bare_hash_error_page_falls_back_to_self_computed(scratch: Scratch) {
    std::fs::write(
        &scratch.descriptor,
        "<!DOCTYPE html><html><body>502 Bad Gateway</body></html>",
    )
    .expect("descriptor");

    let verdict =
        Verifier::builtin().verify(&scratch.file, &scratch.descriptor, DescriptorKind::BareHash);

    assert_eq!(
        verdict,
        Verdict::Authentic {
            digest: Sha256Digest::of_bytes(PAYLOAD),
            basis: DigestBasis::SelfComputed,
        }
    );
}

#[rstest]
fn bare_hash_short_garbage_is_missing_descriptor(scratch: Scratch) {
    std::fs::write(&scratch.descriptor, "not-a-digest").expect("descriptor");

    let verdict =
        Verifier::builtin().verify(&scratch.file, &scratch.descriptor, DescriptorKind::BareHash);

    assert!(matches!(verdict, Verdict::MissingDescriptor { .. }));
}

#[rstest]
fn absent_descriptor_is_missing_descriptor(scratch: Scratch) {
    let verdict = Verifier::builtin().verify(
        &scratch.file,
        &scratch.descriptor,
        DescriptorKind::FilenameHash,
    );
    assert!(matches!(verdict, Verdict::MissingDescriptor { .. }));
}

#[rstest]
fn absent_file_is_missing_file(scratch: Scratch) {
    std::fs::remove_file(&scratch.file).expect("remove");
    let verdict =
        Verifier::builtin().verify(&scratch.file, &scratch.descriptor, DescriptorKind::BareHash);
    assert_eq!(verdict, Verdict::MissingFile);
}

#[rstest]
fn empty_provider_list_is_tool_unavailable(scratch: Scratch) {
    std::fs::write(&scratch.descriptor, payload_hex()).expect("descriptor");
    let verifier = Verifier::with_providers(Vec::new());

    let verdict = verifier.verify(&scratch.file, &scratch.descriptor, DescriptorKind::BareHash);

    assert!(matches!(verdict, Verdict::ToolUnavailable { .. }));
}

#[rstest]
fn sha256sum_provider_is_used_when_ranked_first(scratch: Scratch) {
    std::fs::write(&scratch.descriptor, payload_hex()).expect("descriptor");
    let stdout = format!("{}  {}\n", payload_hex(), scratch.file);
    let executor = StubExecutor::new(vec![
        ExpectedCall::new("sha256sum", &["--version"], Ok(success_output())),
        ExpectedCall::new(
            "sha256sum",
            &["--", scratch.file.as_str()],
            Ok(stdout_output(&stdout)),
        ),
    ]);
    let verifier = Verifier::with_providers(vec![Box::new(Sha256sumCommand::new(&executor))]);

    let verdict = verifier.verify(&scratch.file, &scratch.descriptor, DescriptorKind::BareHash);

    assert!(matches!(verdict, Verdict::Authentic { .. }));
    executor.assert_finished();
}

#[rstest]
fn failing_sha256sum_surfaces_as_unreadable(scratch: Scratch) {
    let executor = StubExecutor::new(vec![
        ExpectedCall::new("sha256sum", &["--version"], Ok(success_output())),
        ExpectedCall::new(
            "sha256sum",
            &["--", scratch.file.as_str()],
            Ok(failure_output("Input/output error")),
        ),
    ]);
    let verifier = Verifier::with_providers(vec![Box::new(Sha256sumCommand::new(&executor))]);

    let err = verifier.compute(&scratch.file).expect_err("tool failure");

    assert!(matches!(err, DigestError::Io { .. }));
}

#[rstest]
fn compute_matches_in_memory_digest(scratch: Scratch) {
    let digest = Verifier::builtin().compute(&scratch.file).expect("digest");
    assert_eq!(digest, Sha256Digest::of_bytes(PAYLOAD));
}
