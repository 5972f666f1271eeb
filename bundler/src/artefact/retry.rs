//! Bounded retries with exponential backoff around single download attempts.
//!
//! Transient failures are retried up to [`RetryPolicy::max_attempts`] times.
//! Permanent and environmental failures end the fetch at once. A failed fetch
//! never leaves a file at its destination.

use super::download::{DownloadError, Downloader, RetryClass};
use super::marker::remove_if_present;
use camino::Utf8Path;
use std::time::Duration;

/// Attempt and backoff limits for one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Unit of the exponential backoff.
    pub base_delay: Duration,
    /// Per-attempt timeout for metadata requests.
    pub request_timeout: Duration,
    /// Per-attempt timeout for artefact downloads.
    pub download_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(600),
        }
    }
}

/// Delay before the attempt following `attempt` (1-based): `base * 2^attempt`.
///
/// # Examples
///
/// ```
/// use airgap_bundler::artefact::retry::retry_delay;
/// use std::time::Duration;
///
/// assert_eq!(retry_delay(1, Duration::from_secs(1)), Duration::from_secs(2));
/// assert_eq!(retry_delay(2, Duration::from_secs(1)), Duration::from_secs(4));
/// ```
#[must_use]
pub fn retry_delay(attempt: u32, base: Duration) -> Duration {
    let multiplier = 2_u32.saturating_pow(attempt);
    base.saturating_mul(multiplier)
}

/// Blocks the current thread between attempts.
pub trait Sleeper {
    /// Wait for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Sleeps with [`std::thread::sleep`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Result of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// An attempt succeeded.
    Success {
        /// Attempts made, including the successful one.
        attempts: u32,
        /// Value produced by the successful attempt.
        value: T,
    },
    /// Every attempt failed transiently.
    ExhaustedRetries {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last_error: DownloadError,
    },
    /// An attempt failed in a way retrying cannot fix.
    Fatal {
        /// Attempts made.
        attempts: u32,
        /// The failure.
        error: DownloadError,
    },
}

impl<T> RetryOutcome<T> {
    /// Number of attempts that were made.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. }
            | Self::ExhaustedRetries { attempts, .. }
            | Self::Fatal { attempts, .. } => *attempts,
        }
    }

    /// Convert into a `Result`, keeping the final error.
    ///
    /// # Errors
    ///
    /// Returns the last error of a failed outcome.
    pub fn into_result(self) -> Result<T, DownloadError> {
        match self {
            Self::Success { value, .. } => Ok(value),
            Self::ExhaustedRetries { last_error, .. } => Err(last_error),
            Self::Fatal { error, .. } => Err(error),
        }
    }
}

/// Outcome of a file download; the value is the byte count.
pub type FetchOutcome = RetryOutcome<u64>;

/// Retrying front end for a [`Downloader`].
pub struct Fetcher<'a> {
    downloader: &'a dyn Downloader,
    sleeper: &'a dyn Sleeper,
    policy: RetryPolicy,
}

impl<'a> Fetcher<'a> {
    /// Create a fetcher.
    #[must_use]
    pub fn new(
        downloader: &'a dyn Downloader,
        sleeper: &'a dyn Sleeper,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            downloader,
            sleeper,
            policy,
        }
    }

    /// The policy in force.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Download `url` to `destination`.
    pub fn fetch(&self, url: &str, destination: &Utf8Path) -> FetchOutcome {
        let outcome = self.with_retries(
            url,
            || {
                self.downloader
                    .download_to(url, destination, self.policy.download_timeout)
            },
            || discard_partial(destination),
        );
        if !matches!(outcome, RetryOutcome::Success { .. }) {
            discard_partial(destination);
        }
        outcome
    }

    /// Fetch `url` as text, typically API metadata or a descriptor.
    pub fn fetch_text(&self, url: &str) -> RetryOutcome<String> {
        self.with_retries(
            url,
            || self.downloader.fetch_text(url, self.policy.request_timeout),
            || {},
        )
    }

    fn with_retries<T>(
        &self,
        url: &str,
        mut attempt_once: impl FnMut() -> Result<T, DownloadError>,
        before_retry: impl Fn(),
    ) -> RetryOutcome<T> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            log::info!("fetching {url} (attempt {attempt}/{max_attempts})");
            let error = match attempt_once() {
                Ok(value) => {
                    return RetryOutcome::Success {
                        attempts: attempt,
                        value,
                    };
                }
                Err(error) => error,
            };

            match error.retry_class() {
                RetryClass::Permanent | RetryClass::Environmental => {
                    log::warn!("attempt {attempt} for {url} failed permanently: {error}");
                    return RetryOutcome::Fatal {
                        attempts: attempt,
                        error,
                    };
                }
                RetryClass::Transient if attempt >= max_attempts => {
                    log::warn!("attempt {attempt} for {url} failed: {error}; no attempts left");
                    return RetryOutcome::ExhaustedRetries {
                        attempts: attempt,
                        last_error: error,
                    };
                }
                RetryClass::Transient => {
                    let wait = retry_delay(attempt, self.policy.base_delay);
                    log::warn!(
                        "attempt {attempt} for {url} failed: {error}; retrying in {}s",
                        wait.as_secs_f32()
                    );
                    before_retry();
                    self.sleeper.sleep(wait);
                }
            }
            attempt += 1;
        }
    }
}

fn discard_partial(destination: &Utf8Path) {
    if let Err(err) = remove_if_present(destination) {
        log::warn!("could not remove partial download {destination}: {err}");
    }
}
