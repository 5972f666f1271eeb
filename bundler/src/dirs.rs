//! Directory resolution abstraction for platform-specific paths.
//!
//! The bundler only needs the configuration directory, where an optional
//! `config.toml` is looked up. The trait lets tests substitute a mock.

use directories_next::ProjectDirs;
use std::path::PathBuf;

/// Platform directories used by the bundler.
#[cfg_attr(test, mockall::automock)]
pub trait BaseDirs {
    /// Directory holding the bundler's `config.toml`, if one can be
    /// determined for the current user.
    fn config_dir(&self) -> Option<PathBuf>;
}

/// [`BaseDirs`] backed by the platform conventions.
///
/// # Examples
///
/// ```no_run
/// use airgap_bundler::dirs::{BaseDirs, SystemBaseDirs};
///
/// let dirs = SystemBaseDirs::new();
/// println!("{:?}", dirs.config_dir());
/// ```
#[derive(Debug, Clone)]
pub struct SystemBaseDirs {
    project: Option<ProjectDirs>,
}

impl SystemBaseDirs {
    /// Resolve the directories. Without a known home directory every lookup
    /// returns `None`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            project: ProjectDirs::from("", "", "airgap-bundler"),
        }
    }
}

impl Default for SystemBaseDirs {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseDirs for SystemBaseDirs {
    fn config_dir(&self) -> Option<PathBuf> {
        self.project
            .as_ref()
            .map(|project| project.config_dir().to_path_buf())
    }
}
