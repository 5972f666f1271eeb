//! Open VSX registry lookups for editor extensions.

use super::{Result, SourceError};
use crate::acquisition::{Artefact, Source};
use crate::artefact::descriptor::DescriptorKind;
use crate::artefact::error::ArtefactError;
use crate::artefact::retry::Fetcher;
use crate::ledger::Component;
use crate::workspace::BundleLayout;
use serde::Deserialize;
use std::fmt;

/// Public Open VSX registry.
pub const OPENVSX_BASE_URL: &str = "https://open-vsx.org";

/// An extension identifier, `namespace/name` or `namespace.name`.
///
/// # Examples
///
/// ```
/// use airgap_bundler::sources::openvsx::ExtensionId;
///
/// let id = ExtensionId::parse("rust-lang.rust-analyzer").expect("valid id");
/// assert_eq!(id.namespace(), "rust-lang");
/// assert_eq!(id.name(), "rust-analyzer");
/// assert_eq!(id.to_string(), "rust-lang.rust-analyzer");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtensionId {
    namespace: String,
    name: String,
}

impl ExtensionId {
    /// Split an identifier at the first `/`, or the first `.` without one.
    ///
    /// # Errors
    ///
    /// Returns [`ArtefactError::InvalidExtensionId`] when either half is
    /// empty or contains characters unsafe in a URL path or file name.
    pub fn parse(value: &str) -> std::result::Result<Self, ArtefactError> {
        let trimmed = value.trim();
        let split = trimmed
            .split_once('/')
            .or_else(|| trimmed.split_once('.'));
        let invalid = || ArtefactError::InvalidExtensionId {
            value: value.to_owned(),
        };
        let (namespace, name) = split.ok_or_else(invalid)?;
        if !is_segment(namespace) || !is_segment(name) {
            return Err(invalid());
        }
        Ok(Self {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        })
    }

    /// Publisher namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Extension name within the namespace.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn metadata_url(&self, base: &str) -> String {
        format!("{base}/api/{}/{}", self.namespace, self.name)
    }

    fn file_prefix(&self) -> String {
        format!("{}.{}-", self.namespace, self.name)
    }
}

fn is_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

#[derive(Debug, Default, Deserialize)]
struct Files {
    #[serde(default)]
    download: Option<String>,
    #[serde(default)]
    sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExtensionMetadata {
    version: Option<String>,
    #[serde(default)]
    files: Files,
}

/// The registry answers with one object or, for some queries, a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MetadataBody {
    One(ExtensionMetadata),
    Many(Vec<ExtensionMetadata>),
}

/// Download details for the latest version of an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedExtension {
    /// The extension.
    pub id: ExtensionId,
    /// Latest published version.
    pub version: String,
    /// `.vsix` download URL.
    pub download_url: String,
    /// URL of the bare-hash digest.
    pub sha256_url: String,
}

impl ResolvedExtension {
    /// File name of the package inside the extensions directory.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}{}.vsix", self.id.file_prefix(), self.version)
    }
}

/// Interpret registry metadata for `id`.
///
/// # Errors
///
/// Returns [`SourceError::InvalidMetadata`] when the body is not JSON or
/// names no version.
pub fn parse_metadata(base: &str, id: &ExtensionId, json: &str) -> Result<ResolvedExtension> {
    let url = id.metadata_url(base);
    let invalid = |reason: String| SourceError::InvalidMetadata {
        url: url.clone(),
        reason,
    };
    let body: MetadataBody = serde_json::from_str(json).map_err(|err| invalid(err.to_string()))?;
    let metadata = match body {
        MetadataBody::One(metadata) => metadata,
        MetadataBody::Many(list) => list
            .into_iter()
            .next()
            .ok_or_else(|| invalid("empty version list".to_owned()))?,
    };
    let version = metadata
        .version
        .filter(|version| !version.trim().is_empty())
        .ok_or_else(|| invalid("no version field".to_owned()))?;
    let version_base = format!("{url}/{version}");
    let download_url = metadata.files.download.unwrap_or_else(|| {
        format!(
            "{version_base}/file/{}{version}.vsix",
            id.file_prefix()
        )
    });
    let sha256_url = metadata
        .files
        .sha256
        .unwrap_or_else(|| format!("{version_base}/sha256"));
    Ok(ResolvedExtension {
        id: id.clone(),
        version,
        download_url,
        sha256_url,
    })
}

/// Look up the latest version of `id` in the registry at `base`.
///
/// # Errors
///
/// Returns [`SourceError::Metadata`] when the registry cannot be reached
/// and [`SourceError::InvalidMetadata`] when the answer is unusable.
pub fn resolve(fetcher: &Fetcher<'_>, base: &str, id: &ExtensionId) -> Result<ResolvedExtension> {
    let url = id.metadata_url(base);
    let body = fetcher
        .fetch_text(&url)
        .into_result()
        .map_err(|source| SourceError::Metadata {
            url: url.clone(),
            source,
        })?;
    let resolved = parse_metadata(base, id, &body)?;
    log::info!("{id}: latest version {}", resolved.version);
    Ok(resolved)
}

/// The `.vsix` artefact for a resolved extension.
#[must_use]
pub fn extension_artefact(resolved: &ResolvedExtension, layout: &BundleLayout) -> Artefact {
    Artefact::new(
        resolved.id.to_string(),
        Component::Extensions,
        layout.extensions_dir().join(resolved.file_name()),
        DescriptorKind::BareHash,
    )
    .with_source(Source::with_remote_descriptor(
        resolved.download_url.clone(),
        resolved.sha256_url.clone(),
    ))
}

/// A package for `id` left by an earlier run, used when the registry is
/// unreachable. The highest name in sort order wins.
#[must_use]
pub fn offline_extension_artefact(id: &ExtensionId, layout: &BundleLayout) -> Option<Artefact> {
    let prefix = id.file_prefix();
    let dir = layout.extensions_dir();
    let mut names: Vec<String> = dir
        .read_dir_utf8()
        .ok()?
        .flatten()
        .map(|entry| entry.file_name().to_owned())
        .filter(|name| name.starts_with(&prefix) && name.ends_with(".vsix"))
        .collect();
    names.sort();
    let chosen = names.pop()?;
    log::info!("{id}: using {chosen} from an earlier run");
    Some(Artefact::new(
        id.to_string(),
        Component::Extensions,
        dir.join(chosen),
        DescriptorKind::BareHash,
    ))
}
