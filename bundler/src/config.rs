//! Bundle configuration loaded from TOML.
//!
//! Settings come from the file named with `--config`, else from
//! `config.toml` in the platform configuration directory when it exists,
//! else from the defaults. Command-line flags are applied last.
//!
//! ```toml
//! bundle_dir = "/media/usb/bundle"
//! models = ["qwen2.5-coder:7b"]
//! extensions = ["rust-lang.rust-analyzer"]
//! os_packages = ["build-essential", "git"]
//! cargo_manifest = "Cargo.toml"
//! python_requirements = "requirements.txt"
//!
//! [network]
//! max_attempts = 5
//! ```

use crate::artefact::retry::RetryPolicy;
use crate::cli::Cli;
use crate::dirs::BaseDirs;
use crate::sources::model_runtime::ServeSettings;
use crate::sources::openvsx::OPENVSX_BASE_URL;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// File name looked up in the platform configuration directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Errors raised while loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read configuration {path}: {source}")]
    Read {
        /// File that was read.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid.
    #[error("invalid configuration {path}: {reason}")]
    Parse {
        /// File that was parsed.
        path: Utf8PathBuf,
        /// Parser message, including the offending key.
        reason: String,
    },
}

/// Result type alias using [`ConfigError`].
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Download retry and timeout settings.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Attempts per download, including the first.
    pub max_attempts: u32,
    /// Backoff unit in seconds.
    pub base_delay_secs: u64,
    /// Per-attempt timeout for metadata and descriptors.
    pub request_timeout_secs: u64,
    /// Per-attempt timeout for artefact downloads.
    pub download_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_secs: policy.base_delay.as_secs(),
            request_timeout_secs: policy.request_timeout.as_secs(),
            download_timeout_secs: policy.download_timeout.as_secs(),
        }
    }
}

/// External tool settings.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsConfig {
    /// Timeout for package tools (`apt-get`, `cargo vendor`, `pip`).
    pub command_timeout_secs: u64,
    /// Try the system `tar` before the in-process extractor.
    pub prefer_system_tar: bool,
    /// Size limit for extraction logs.
    pub log_limit_bytes: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 1800,
            prefer_system_tar: false,
            log_limit_bytes: 64 * 1024,
        }
    }
}

/// Temporary model service settings.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ModelServiceConfig {
    /// `OLLAMA_HOST` for the temporary service.
    pub host: String,
    /// Wait after start before the first readiness check.
    pub settle_secs: u64,
    /// Readiness checks before giving up.
    pub readiness_attempts: u32,
    /// Timeout for each model pull.
    pub pull_timeout_secs: u64,
}

impl Default for ModelServiceConfig {
    fn default() -> Self {
        let settings = ServeSettings::default();
        Self {
            host: settings.host,
            settle_secs: settings.settle_delay.as_secs(),
            readiness_attempts: settings.readiness_attempts,
            pull_timeout_secs: settings.pull_timeout.as_secs(),
        }
    }
}

/// Everything a bundle run needs to know.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BundleConfig {
    /// Bundle root.
    pub bundle_dir: Utf8PathBuf,
    /// Accept files already on disk without hashing.
    pub skip_verification: bool,
    /// Include the model runtime.
    pub runtime: bool,
    /// Smallest plausible runtime archive; smaller files are stubs.
    pub runtime_min_bytes: u64,
    /// Models to pull, such as `llama3.2:3b`.
    pub models: Vec<String>,
    /// Include the editor package.
    pub editor: bool,
    /// Extensions as `namespace/name` or `namespace.name`.
    pub extensions: Vec<String>,
    /// Extension registry.
    pub openvsx_url: String,
    /// Debian packages to download.
    pub os_packages: Vec<String>,
    /// Include the `rustup-init` installer.
    pub rust_toolchain: bool,
    /// Manifest whose dependencies are vendored.
    pub cargo_manifest: Option<Utf8PathBuf>,
    /// Requirements file for `pip`.
    pub python_requirements: Option<Utf8PathBuf>,
    /// Download settings.
    pub network: NetworkConfig,
    /// Tool settings.
    pub tools: ToolsConfig,
    /// Model service settings.
    pub model_service: ModelServiceConfig,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            bundle_dir: Utf8PathBuf::from("airgap-bundle"),
            skip_verification: false,
            runtime: true,
            runtime_min_bytes: 1024 * 1024,
            models: Vec::new(),
            editor: true,
            extensions: Vec::new(),
            openvsx_url: OPENVSX_BASE_URL.to_owned(),
            os_packages: Vec::new(),
            rust_toolchain: true,
            cargo_manifest: None,
            python_requirements: None,
            network: NetworkConfig::default(),
            tools: ToolsConfig::default(),
            model_service: ModelServiceConfig::default(),
        }
    }
}

/// A configuration and the file it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedConfig {
    /// The parsed settings.
    pub config: BundleConfig,
    /// The file read, or `None` when the defaults were used.
    pub source: Option<Utf8PathBuf>,
}

impl BundleConfig {
    /// Parse a configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for invalid TOML or unknown keys.
    ///
    /// # Examples
    ///
    /// ```
    /// use airgap_bundler::config::BundleConfig;
    /// use camino::Utf8Path;
    ///
    /// let config = BundleConfig::from_toml(
    ///     Utf8Path::new("bundle.toml"),
    ///     "models = [\"llama3\"]\n[network]\nmax_attempts = 5\n",
    /// )?;
    /// assert_eq!(config.network.max_attempts, 5);
    /// assert!(config.editor);
    /// # Ok::<(), airgap_bundler::config::ConfigError>(())
    /// ```
    pub fn from_toml(path: &Utf8Path, text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| ConfigError::Parse {
            path: path.to_owned(),
            reason: err.message().to_owned(),
        })
    }

    /// Load from `explicit`, else the platform configuration file when it
    /// exists, else the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] when an explicitly named file cannot be
    /// read, and [`ConfigError::Parse`] when a file is invalid.
    pub fn load(explicit: Option<&Utf8Path>, dirs: &dyn BaseDirs) -> Result<LoadedConfig> {
        let path = match explicit {
            Some(path) => path.to_owned(),
            None => match default_config_path(dirs) {
                Some(path) if path.is_file() => path,
                _ => {
                    log::debug!("no configuration file; using defaults");
                    return Ok(LoadedConfig {
                        config: Self::default(),
                        source: None,
                    });
                }
            },
        };
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_toml(&path, &text)?;
        log::debug!("configuration loaded from {path}");
        Ok(LoadedConfig {
            config,
            source: Some(path),
        })
    }

    /// Apply command-line overrides.
    pub fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(dir) = &cli.bundle_dir {
            self.bundle_dir = dir.clone();
        }
        if cli.skip_verification {
            self.skip_verification = true;
        }
        if let Some(attempts) = cli.max_attempts {
            self.network.max_attempts = attempts;
        }
    }

    /// Retry policy for the fetcher.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.network.max_attempts,
            base_delay: Duration::from_secs(self.network.base_delay_secs),
            request_timeout: Duration::from_secs(self.network.request_timeout_secs),
            download_timeout: Duration::from_secs(self.network.download_timeout_secs),
        }
    }

    /// Settings for the temporary model service.
    #[must_use]
    pub fn serve_settings(&self) -> ServeSettings {
        ServeSettings {
            host: self.model_service.host.clone(),
            settle_delay: Duration::from_secs(self.model_service.settle_secs),
            readiness_attempts: self.model_service.readiness_attempts,
            pull_timeout: Duration::from_secs(self.model_service.pull_timeout_secs),
            ..ServeSettings::default()
        }
    }

    /// Timeout for package tools.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.command_timeout_secs)
    }
}

/// `config.toml` in the platform configuration directory.
#[must_use]
pub fn default_config_path(dirs: &dyn BaseDirs) -> Option<Utf8PathBuf> {
    let dir = dirs.config_dir()?;
    match Utf8PathBuf::from_path_buf(dir) {
        Ok(dir) => Some(dir.join(CONFIG_FILE_NAME)),
        Err(dir) => {
            log::warn!(
                "configuration directory {} is not valid UTF-8; ignoring it",
                dir.display()
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirs::MockBaseDirs;
    use clap::Parser;
    use rstest::rstest;

    fn dirs_at(dir: Option<std::path::PathBuf>) -> MockBaseDirs {
        let mut dirs = MockBaseDirs::new();
        dirs.expect_config_dir().returning(move || dir.clone());
        dirs
    }

    #[test]
    fn empty_document_gives_defaults() {
        let config = BundleConfig::from_toml(Utf8Path::new("c.toml"), "").expect("parse");
        assert_eq!(config, BundleConfig::default());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = BundleConfig::from_toml(Utf8Path::new("c.toml"), "modles = [\"llama3\"]\n")
            .expect_err("typo rejected");
        assert!(err.to_string().contains("modles"));
    }

    #[test]
    fn nested_tables_are_parsed() {
        let text = concat!(
            "runtime = false\n",
            "cargo_manifest = \"app/Cargo.toml\"\n",
            "[tools]\n",
            "prefer_system_tar = true\n",
            "[model_service]\n",
            "host = \"127.0.0.1:9999\"\n",
        );
        let config = BundleConfig::from_toml(Utf8Path::new("c.toml"), text).expect("parse");
        assert!(!config.runtime);
        assert!(config.tools.prefer_system_tar);
        assert_eq!(config.tools.log_limit_bytes, 64 * 1024);
        assert_eq!(config.cargo_manifest, Some(Utf8PathBuf::from("app/Cargo.toml")));
        assert_eq!(config.serve_settings().host, "127.0.0.1:9999");
    }

    #[rstest]
    #[case::no_dirs(None)]
    #[case::no_file(Some(std::path::PathBuf::from("/nonexistent/airgap-bundler")))]
    fn missing_default_file_gives_defaults(#[case] dir: Option<std::path::PathBuf>) {
        let loaded = BundleConfig::load(None, &dirs_at(dir)).expect("defaults");
        assert!(loaded.source.is_none());
        assert_eq!(loaded.config, BundleConfig::default());
    }

    #[test]
    fn default_file_is_read_when_present() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "models = [\"llama3\"]\n")
            .expect("write config");

        let loaded =
            BundleConfig::load(None, &dirs_at(Some(dir.path().to_path_buf()))).expect("load");

        assert_eq!(loaded.config.models, vec!["llama3".to_owned()]);
        assert!(loaded.source.is_some());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = BundleConfig::load(Some(Utf8Path::new("/nonexistent/bundle.toml")), &dirs_at(None))
            .expect_err("explicit file required");
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn flags_override_the_file() {
        let mut config = BundleConfig::default();
        let cli = Cli::parse_from([
            "airgap-bundler",
            "--bundle-dir",
            "/media/usb",
            "--skip-verification",
            "--max-attempts",
            "7",
        ]);

        config.apply_overrides(&cli);

        assert_eq!(config.bundle_dir, Utf8PathBuf::from("/media/usb"));
        assert!(config.skip_verification);
        assert_eq!(config.retry_policy().max_attempts, 7);
    }
}
