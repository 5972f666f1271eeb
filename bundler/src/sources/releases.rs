//! GitHub "latest release" metadata for the model runtime and the editor.
//!
//! When the metadata cannot be fetched, an asset already present in the
//! category directory is used instead so that an offline re-run still
//! verifies what an earlier run downloaded.

use super::{Result, SourceError};
use crate::acquisition::{ArchiveSpec, Artefact, DescriptorSource, Source};
use crate::artefact::descriptor::DescriptorKind;
use crate::artefact::extraction::{ArchiveFormat, ExpectedOutput};
use crate::artefact::retry::Fetcher;
use crate::ledger::Component;
use crate::workspace::BundleLayout;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

/// Latest runtime release.
pub const OLLAMA_LATEST_RELEASE: &str = "https://api.github.com/repos/ollama/ollama/releases/latest";
/// Latest editor release.
pub const VSCODIUM_LATEST_RELEASE: &str =
    "https://api.github.com/repos/VSCodium/vscodium/releases/latest";

/// Runtime assets in preference order.
pub const PREFERRED_RUNTIME_ASSETS: [&str; 2] =
    ["ollama-linux-amd64.tar.zst", "ollama-linux-amd64.tgz"];

/// Checksum list published with runtime releases.
pub const RUNTIME_CHECKSUM_LIST: &str = "sha256sum.txt";

const EDITOR_SUFFIX: &str = "_amd64.deb";
const LISTED_ASSETS: usize = 10;

/// One downloadable file of a release.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Asset {
    /// File name.
    pub name: String,
    /// Direct download URL.
    pub browser_download_url: String,
    /// Size in bytes, when published.
    #[serde(default)]
    pub size: u64,
}

/// The parts of a release the bundler uses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Release {
    /// Release tag.
    pub tag_name: String,
    /// Published assets.
    #[serde(default)]
    pub assets: Vec<Asset>,
}

impl Release {
    /// Look up an asset by exact name.
    #[must_use]
    pub fn asset(&self, name: &str) -> Option<&Asset> {
        self.assets.iter().find(|asset| asset.name == name)
    }

    fn listing(&self) -> String {
        let names: Vec<&str> = self
            .assets
            .iter()
            .take(LISTED_ASSETS)
            .map(|asset| asset.name.as_str())
            .collect();
        if names.is_empty() {
            "none".to_owned()
        } else {
            names.join(", ")
        }
    }
}

/// Parse release metadata.
///
/// # Errors
///
/// Returns [`SourceError::InvalidMetadata`] when the JSON lacks a tag.
pub fn parse_release(url: &str, json: &str) -> Result<Release> {
    serde_json::from_str(json).map_err(|err| SourceError::InvalidMetadata {
        url: url.to_owned(),
        reason: err.to_string(),
    })
}

/// Fetch and parse the release at `api_url`.
///
/// # Errors
///
/// Returns [`SourceError::Metadata`] when the request fails and
/// [`SourceError::InvalidMetadata`] when the body cannot be parsed.
pub fn fetch_release(fetcher: &Fetcher<'_>, api_url: &str) -> Result<Release> {
    let body = fetcher
        .fetch_text(api_url)
        .into_result()
        .map_err(|source| SourceError::Metadata {
            url: api_url.to_owned(),
            source,
        })?;
    let release = parse_release(api_url, &body)?;
    log::info!("{api_url}: release {} with {} assets", release.tag_name, release.assets.len());
    Ok(release)
}

fn is_runtime_candidate(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    lowered.contains("ollama")
        && lowered.contains("linux")
        && lowered.contains("amd64")
        && ArchiveFormat::from_file_name(&lowered).is_some()
}

fn is_rocm(name: &str) -> bool {
    name.to_ascii_lowercase().contains("rocm")
}

/// Pick the runtime asset: the preferred names first, then any other
/// Linux amd64 build, then a ROCm build as a last resort.
///
/// # Examples
///
/// ```
/// use airgap_bundler::sources::releases::{Asset, select_runtime_asset};
///
/// let asset = |name: &str| Asset {
///     name: name.to_owned(),
///     browser_download_url: format!("https://example.test/{name}"),
///     size: 0,
/// };
/// let assets = vec![
///     asset("ollama-linux-amd64-rocm.tar.zst"),
///     asset("ollama-linux-amd64.tgz"),
/// ];
/// assert_eq!(
///     select_runtime_asset(&assets).map(|a| a.name.as_str()),
///     Some("ollama-linux-amd64.tgz")
/// );
/// ```
#[must_use]
pub fn select_runtime_asset(assets: &[Asset]) -> Option<&Asset> {
    for preferred in PREFERRED_RUNTIME_ASSETS {
        if let Some(asset) = assets.iter().find(|asset| asset.name == preferred) {
            return Some(asset);
        }
    }
    let candidates = || assets.iter().filter(|asset| is_runtime_candidate(&asset.name));
    if let Some(asset) = candidates().find(|asset| !is_rocm(&asset.name)) {
        return Some(asset);
    }
    let rocm = candidates().next()?;
    log::warn!(
        "only a ROCm runtime build is published ({}); it targets AMD GPUs and may not run elsewhere",
        rocm.name
    );
    Some(rocm)
}

fn runtime_archive(layout: &BundleLayout) -> ArchiveSpec {
    ArchiveSpec {
        extract_to: layout.runtime_dir(),
        expected: ExpectedOutput {
            relative_path: Utf8PathBuf::from("bin/ollama"),
            executable: true,
        },
    }
}

fn runtime_base(layout: &BundleLayout, file_name: &str, minimum_size: u64) -> Artefact {
    Artefact::new(
        "ollama",
        Component::RuntimeBinary,
        layout.runtime_dir().join(file_name),
        DescriptorKind::FilenameHash,
    )
    .with_archive(runtime_archive(layout))
    .with_minimum_size(minimum_size)
    .accepting_without_descriptor()
}

/// The runtime archive from a release.
///
/// The digest comes from the release checksum list when published,
/// otherwise the download is trusted on first use.
///
/// # Errors
///
/// Returns [`SourceError::NoMatchingAsset`] when no Linux amd64 build is
/// published.
pub fn runtime_artefact(release: &Release, layout: &BundleLayout, minimum_size: u64) -> Result<Artefact> {
    let asset = select_runtime_asset(&release.assets).ok_or_else(|| SourceError::NoMatchingAsset {
        wanted: "Linux amd64 runtime",
        tag: release.tag_name.clone(),
        available: release.listing(),
    })?;
    let descriptor = match release.asset(RUNTIME_CHECKSUM_LIST) {
        Some(list) => DescriptorSource::ChecksumList {
            url: list.browser_download_url.clone(),
        },
        None => {
            log::warn!(
                "release {} publishes no {RUNTIME_CHECKSUM_LIST}; {} will be trusted on first use",
                release.tag_name,
                asset.name
            );
            DescriptorSource::Local
        }
    };
    Ok(runtime_base(layout, &asset.name, minimum_size).with_source(Source {
        url: asset.browser_download_url.clone(),
        descriptor,
    }))
}

/// The editor package and its published `.sha256`.
///
/// # Errors
///
/// Returns [`SourceError::NoMatchingAsset`] when the release has no
/// `_amd64.deb` or no matching `.sha256` asset.
pub fn editor_artefact(release: &Release, layout: &BundleLayout) -> Result<Artefact> {
    let missing = || SourceError::NoMatchingAsset {
        wanted: "amd64 .deb with .sha256",
        tag: release.tag_name.clone(),
        available: release.listing(),
    };
    let deb = release
        .assets
        .iter()
        .find(|asset| asset.name.ends_with(EDITOR_SUFFIX))
        .ok_or_else(missing)?;
    let sha = release
        .asset(&format!("{}.sha256", deb.name))
        .ok_or_else(missing)?;
    Ok(editor_base(layout, &deb.name).with_source(Source::with_remote_descriptor(
        deb.browser_download_url.clone(),
        sha.browser_download_url.clone(),
    )))
}

fn editor_base(layout: &BundleLayout, file_name: &str) -> Artefact {
    Artefact::new(
        "VSCodium",
        Component::EditorPackage,
        layout.editor_dir().join(file_name),
        DescriptorKind::FilenameHash,
    )
}

fn existing_files(dir: &Utf8Path, matches: impl Fn(&str) -> bool) -> Vec<String> {
    let Ok(entries) = dir.read_dir_utf8() else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_file()))
        .map(|entry| entry.file_name().to_owned())
        .filter(|name| matches(name))
        .collect();
    names.sort();
    names
}

/// A runtime archive left by an earlier run, for use without metadata.
#[must_use]
pub fn offline_runtime_artefact(layout: &BundleLayout, minimum_size: u64) -> Option<Artefact> {
    let present = existing_files(&layout.runtime_dir(), is_runtime_candidate);
    let chosen = PREFERRED_RUNTIME_ASSETS
        .iter()
        .find(|preferred| present.iter().any(|name| name == *preferred))
        .map(|preferred| (*preferred).to_owned())
        .or_else(|| present.iter().find(|name| !is_rocm(name)).cloned())
        .or_else(|| present.first().cloned())?;
    log::info!("using {chosen} from an earlier run");
    Some(runtime_base(layout, &chosen, minimum_size))
}

/// An editor package left by an earlier run, for use without metadata.
#[must_use]
pub fn offline_editor_artefact(layout: &BundleLayout) -> Option<Artefact> {
    let chosen = existing_files(&layout.editor_dir(), |name| name.ends_with(EDITOR_SUFFIX))
        .pop()?;
    log::info!("using {chosen} from an earlier run");
    Some(editor_base(layout, &chosen))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    fn asset(name: &str) -> Asset {
        Asset {
            name: name.to_owned(),
            browser_download_url: format!("https://github.test/download/{name}"),
            size: 1,
        }
    }

    fn release(names: &[&str]) -> Release {
        Release {
            tag_name: "v1.0.0".to_owned(),
            assets: names.iter().map(|name| asset(name)).collect(),
        }
    }

    #[fixture]
    fn layout() -> BundleLayout {
        BundleLayout::new("/bundle")
    }

    #[rstest]
    #[case::zst_first(&["ollama-linux-amd64.tgz", "ollama-linux-amd64.tar.zst"], "ollama-linux-amd64.tar.zst")]
    #[case::legacy_tgz(&["ollama-darwin.tgz", "ollama-linux-amd64.tgz"], "ollama-linux-amd64.tgz")]
    #[case::alternative(&["ollama-linux-amd64-rocm.tar.zst", "ollama-linux-amd64-jetpack.tar.zst"], "ollama-linux-amd64-jetpack.tar.zst")]
    #[case::rocm_last_resort(&["ollama-linux-arm64.tgz", "ollama-linux-amd64-rocm.tgz"], "ollama-linux-amd64-rocm.tgz")]
    fn runtime_asset_ranking(#[case] names: &[&str], #[case] expected: &str) {
        let release = release(names);
        let selected = select_runtime_asset(&release.assets).expect("asset selected");
        assert_eq!(selected.name, expected);
    }

    #[test]
    fn no_runtime_asset_lists_what_exists() {
        let err = runtime_artefact(&release(&["ollama-darwin.tgz"]), &BundleLayout::new("/bundle"), 1)
            .expect_err("no linux asset");
        assert!(err.to_string().contains("ollama-darwin.tgz"));
    }

    #[rstest]
    fn runtime_uses_checksum_list_when_published(layout: BundleLayout) {
        let release = release(&["ollama-linux-amd64.tar.zst", "sha256sum.txt"]);

        let artefact = runtime_artefact(&release, &layout, 1024).expect("artefact");

        assert_eq!(
            artefact.destination,
            Utf8PathBuf::from("/bundle/ollama/ollama-linux-amd64.tar.zst")
        );
        assert!(artefact.accept_without_descriptor);
        assert_eq!(artefact.minimum_size, Some(1024));
        let source = artefact.source.expect("source");
        assert_eq!(
            source.descriptor,
            DescriptorSource::ChecksumList {
                url: "https://github.test/download/sha256sum.txt".to_owned()
            }
        );
        let archive = artefact.archive.expect("archive");
        assert!(archive.expected.executable);
    }

    #[rstest]
    fn runtime_without_checksum_list_is_hashed_locally(layout: BundleLayout) {
        let artefact =
            runtime_artefact(&release(&["ollama-linux-amd64.tgz"]), &layout, 1).expect("artefact");
        assert_eq!(
            artefact.source.map(|source| source.descriptor),
            Some(DescriptorSource::Local)
        );
    }

    #[rstest]
    fn editor_requires_sha_asset(layout: BundleLayout) {
        let without_sha = release(&["codium_1.90_amd64.deb", "codium_1.90_arm64.deb"]);
        assert!(editor_artefact(&without_sha, &layout).is_err());

        let with_sha = release(&["codium_1.90_amd64.deb", "codium_1.90_amd64.deb.sha256"]);
        let artefact = editor_artefact(&with_sha, &layout).expect("artefact");
        assert_eq!(
            artefact.source.map(|source| source.descriptor),
            Some(DescriptorSource::Remote {
                url: "https://github.test/download/codium_1.90_amd64.deb.sha256".to_owned()
            })
        );
    }

    #[test]
    fn parses_release_json() {
        let json = r#"{
            "tag_name": "v0.5.7",
            "name": "v0.5.7",
            "assets": [
                {"name": "ollama-linux-amd64.tgz", "browser_download_url": "https://x/ollama-linux-amd64.tgz", "size": 42}
            ]
        }"#;
        let release = parse_release("https://api.test", json).expect("parse");
        assert_eq!(release.tag_name, "v0.5.7");
        assert_eq!(release.assets.first().map(|asset| asset.size), Some(42));
    }

    #[test]
    fn rejects_release_without_tag() {
        assert!(parse_release("https://api.test", r#"{"message": "API rate limit exceeded"}"#).is_err());
    }

    #[test]
    fn offline_artefacts_come_from_existing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8");
        let layout = BundleLayout::new(root);
        std::fs::create_dir_all(layout.runtime_dir()).expect("runtime dir");
        std::fs::create_dir_all(layout.editor_dir()).expect("editor dir");
        std::fs::write(layout.runtime_dir().join("ollama-linux-amd64.tgz"), b"x").expect("write");
        std::fs::write(layout.runtime_dir().join("ollama-linux-amd64.tgz.sha256"), b"x")
            .expect("write");
        std::fs::write(layout.editor_dir().join("codium_1.90_amd64.deb"), b"x").expect("write");

        let runtime = offline_runtime_artefact(&layout, 1).expect("runtime");
        let editor = offline_editor_artefact(&layout).expect("editor");

        assert_eq!(runtime.destination.file_name(), Some("ollama-linux-amd64.tgz"));
        assert!(runtime.source.is_none());
        assert_eq!(editor.destination.file_name(), Some("codium_1.90_amd64.deb"));
    }

    #[rstest]
    fn offline_without_files_yields_nothing(layout: BundleLayout) {
        assert!(offline_runtime_artefact(&layout, 1).is_none());
        assert!(offline_editor_artefact(&layout).is_none());
    }
}
