//! HTTP downloads for bundle artefacts and upstream metadata.
//!
//! Provides a trait-based abstraction over single download attempts so that
//! the retry layer and the acquisition state machine can be tested without
//! network access. Each failure carries enough detail to classify it as
//! transient, permanent or environmental.

use camino::{Utf8Path, Utf8PathBuf};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

/// User agent sent with every request. Release APIs reject anonymous clients.
const USER_AGENT: &str = concat!("airgap-bundler/", env!("CARGO_PKG_VERSION"));

/// Suffix of the in-progress download file next to the destination.
const PARTIAL_SUFFIX: &str = "part";

/// Trait for performing one download attempt.
///
/// Abstractions allow tests to mock HTTP behaviour without network access.
///
/// # Examples
///
/// ```no_run
/// use airgap_bundler::artefact::download::{Downloader, HttpDownloader};
/// use std::time::Duration;
///
/// let downloader = HttpDownloader;
/// let body = downloader.fetch_text(
///     "https://api.github.com/repos/ollama/ollama/releases/latest",
///     Duration::from_secs(30),
/// )?;
/// assert!(body.contains("tag_name"));
/// # Ok::<(), airgap_bundler::artefact::download::DownloadError>(())
/// ```
#[cfg_attr(test, mockall::automock)]
pub trait Downloader {
    /// Fetch `url` and return the body as text.
    ///
    /// # Errors
    ///
    /// Returns a [`DownloadError`] describing why the attempt failed.
    fn fetch_text(&self, url: &str, timeout: Duration) -> Result<String, DownloadError>;

    /// Download `url` into `dest`, returning the number of bytes written.
    ///
    /// On failure nothing is left at `dest`.
    ///
    /// # Errors
    ///
    /// Returns a [`DownloadError`] describing why the attempt failed.
    fn download_to(&self, url: &str, dest: &Utf8Path, timeout: Duration)
    -> Result<u64, DownloadError>;
}

/// How the retry layer should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Worth another attempt after a backoff.
    Transient,
    /// The server said no; retrying cannot help.
    Permanent,
    /// The local machine cannot store the result; retrying cannot help.
    Environmental,
}

/// Errors arising from a single download attempt.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// The server answered with an error status.
    #[error("HTTP {status} from {url}")]
    Http {
        /// The URL that was requested.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// The requested resource does not exist (HTTP 404 or 410).
    #[error("not found: {url}")]
    NotFound {
        /// The URL that was requested.
        url: String,
    },

    /// The connection failed, timed out or was reset.
    #[error("download failed for {url}: {reason}")]
    Transport {
        /// The URL that was requested.
        url: String,
        /// A human-readable description of the failure.
        reason: String,
    },

    /// The body ended before the advertised length.
    #[error("truncated download from {url}: received {received} of {expected} bytes")]
    Incomplete {
        /// The URL that was requested.
        url: String,
        /// Advertised `Content-Length`.
        expected: u64,
        /// Bytes actually received.
        received: u64,
    },

    /// The body was empty.
    #[error("empty response from {url}")]
    Empty {
        /// The URL that was requested.
        url: String,
    },

    /// The body is an error page or an invalid container instead of the
    /// expected archive.
    #[error("invalid payload from {url}: {reason}")]
    InvalidPayload {
        /// The URL that was requested.
        url: String,
        /// What was wrong with the payload.
        reason: String,
    },

    /// Writing the body to disk failed.
    #[error("cannot write {path}: {source}")]
    Write {
        /// File being written.
        path: Utf8PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    /// Classify the failure for the retry layer.
    ///
    /// # Examples
    ///
    /// ```
    /// use airgap_bundler::artefact::download::{DownloadError, RetryClass};
    ///
    /// let err = DownloadError::Http { url: "https://x.test".into(), status: 503 };
    /// assert_eq!(err.retry_class(), RetryClass::Transient);
    /// ```
    #[must_use]
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Http { status, .. } => {
                if matches!(status, 408 | 429 | 500..=599) {
                    RetryClass::Transient
                } else {
                    RetryClass::Permanent
                }
            }
            Self::NotFound { .. } => RetryClass::Permanent,
            Self::Transport { .. }
            | Self::Incomplete { .. }
            | Self::Empty { .. }
            | Self::InvalidPayload { .. } => RetryClass::Transient,
            Self::Write { source, .. } => {
                if is_environmental(source.kind()) {
                    RetryClass::Environmental
                } else {
                    RetryClass::Transient
                }
            }
        }
    }
}

/// Returns `true` for OS errors that no amount of retrying will fix.
#[must_use]
pub fn is_environmental(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::PermissionDenied | ErrorKind::StorageFull | ErrorKind::ReadOnlyFilesystem
    )
}

/// HTTP-based downloader using `ureq`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpDownloader;

impl Downloader for HttpDownloader {
    fn fetch_text(&self, url: &str, timeout: Duration) -> Result<String, DownloadError> {
        log::debug!("GET {url}");
        let response = request(url, timeout)?;
        let body = response
            .into_body()
            .read_to_string()
            .map_err(|e| DownloadError::Transport {
                url: url.to_owned(),
                reason: e.to_string(),
            })?;
        if body.trim().is_empty() {
            return Err(DownloadError::Empty {
                url: url.to_owned(),
            });
        }
        Ok(body)
    }

    fn download_to(
        &self,
        url: &str,
        dest: &Utf8Path,
        timeout: Duration,
    ) -> Result<u64, DownloadError> {
        log::debug!("downloading {url} to {dest}");
        let partial = partial_path(dest);
        let result = download_via(url, dest, &partial, timeout);
        if result.is_err() {
            let _ = std::fs::remove_file(&partial);
        }
        result
    }
}

fn download_via(
    url: &str,
    dest: &Utf8Path,
    partial: &Utf8Path,
    timeout: Duration,
) -> Result<u64, DownloadError> {
    let response = request(url, timeout)?;
    let expected = response
        .headers()
        .get("content-length")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());

    let mut file = File::create(partial).map_err(|source| write_error(partial, source))?;
    let mut body = response.into_body();
    let received = copy_body(url, &mut body.as_reader(), &mut file, partial)?;
    file.flush().map_err(|source| write_error(partial, source))?;
    drop(file);

    check_length(url, expected, received)?;
    if is_zip_container(dest) {
        validate_zip_payload(url, partial)?;
    }
    std::fs::rename(partial, dest).map_err(|source| write_error(dest, source))?;
    Ok(received)
}

fn request(url: &str, timeout: Duration) -> Result<ureq::http::Response<ureq::Body>, DownloadError> {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build();
    ureq::Agent::new_with_config(config)
        .get(url)
        .header("User-Agent", USER_AGENT)
        .call()
        .map_err(|e| map_ureq_error(url, &e))
}

fn copy_body(
    url: &str,
    reader: &mut dyn Read,
    file: &mut File,
    path: &Utf8Path,
) -> Result<u64, DownloadError> {
    let mut buffer = vec![0u8; 64 * 1024];
    let mut received = 0u64;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(DownloadError::Transport {
                    url: url.to_owned(),
                    reason: err.to_string(),
                });
            }
        };
        let chunk = buffer.get(..read).unwrap_or_default();
        file.write_all(chunk)
            .map_err(|source| write_error(path, source))?;
        received += read as u64;
    }
    Ok(received)
}

fn check_length(url: &str, expected: Option<u64>, received: u64) -> Result<(), DownloadError> {
    if received == 0 {
        return Err(DownloadError::Empty {
            url: url.to_owned(),
        });
    }
    match expected {
        Some(expected) if received < expected => Err(DownloadError::Incomplete {
            url: url.to_owned(),
            expected,
            received,
        }),
        _ => Ok(()),
    }
}

/// Returns `true` for destinations that must be valid ZIP containers.
#[must_use]
pub fn is_zip_container(dest: &Utf8Path) -> bool {
    dest.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip") || ext.eq_ignore_ascii_case("vsix"))
}

/// Reject HTML error pages and corrupt containers saved under a ZIP name.
fn validate_zip_payload(url: &str, path: &Utf8Path) -> Result<(), DownloadError> {
    let invalid = |reason: String| DownloadError::InvalidPayload {
        url: url.to_owned(),
        reason,
    };
    let mut head = [0u8; 512];
    let mut file = File::open(path).map_err(|source| write_error(path, source))?;
    let read = file.read(&mut head).map_err(|source| write_error(path, source))?;
    let prefix = String::from_utf8_lossy(head.get(..read).unwrap_or_default()).to_ascii_lowercase();
    if prefix.trim_start().starts_with('<') || prefix.contains("<html") {
        return Err(invalid("received an HTML page instead of an archive".to_owned()));
    }
    let file = File::open(path).map_err(|source| write_error(path, source))?;
    zip::ZipArchive::new(file)
        .map(|_| ())
        .map_err(|e| invalid(format!("not a valid ZIP container: {e}")))
}

fn partial_path(dest: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{dest}.{PARTIAL_SUFFIX}"))
}

fn write_error(path: &Utf8Path, source: std::io::Error) -> DownloadError {
    DownloadError::Write {
        path: path.to_owned(),
        source,
    }
}

/// Map a ureq error to a [`DownloadError`].
fn map_ureq_error(url: &str, err: &ureq::Error) -> DownloadError {
    match err {
        ureq::Error::StatusCode(404 | 410) => DownloadError::NotFound {
            url: url.to_owned(),
        },
        ureq::Error::StatusCode(status) => DownloadError::Http {
            url: url.to_owned(),
            status: *status,
        },
        other => DownloadError::Transport {
            url: url.to_owned(),
            reason: other.to_string(),
        },
    }
}
