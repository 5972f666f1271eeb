//! Bundle directory layout and preparation.
//!
//! [`ensure`] makes a directory path usable even when earlier runs, or other
//! software, left a regular file or a dangling symlink where a directory is
//! expected. Each path component is re-examined immediately before and after
//! any destructive step, so a component that turned into a directory in the
//! meantime is left alone.

use crate::tools::{CommandRequest, PrivilegeEscalator};
use camino::{Utf8Path, Utf8PathBuf};
use std::io::ErrorKind;

/// Result of preparing a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// The directory exists and is usable.
    Ready,
    /// The directory could not be prepared.
    Failed {
        /// What went wrong, including the OS error.
        reason: String,
    },
}

impl PrepareOutcome {
    /// Returns `true` for [`PrepareOutcome::Ready`].
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Category directories inside a bundle root.
///
/// # Examples
///
/// ```
/// use airgap_bundler::workspace::BundleLayout;
///
/// let layout = BundleLayout::new("/srv/bundle");
/// assert_eq!(layout.vendor_dir(), "/srv/bundle/rust/vendor");
/// assert_eq!(layout.logs_dir(), "/srv/bundle/logs");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleLayout {
    root: Utf8PathBuf,
}

impl BundleLayout {
    /// Lay out a bundle under `root`.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The bundle root.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Model runtime archive and its extracted tree.
    #[must_use]
    pub fn runtime_dir(&self) -> Utf8PathBuf {
        self.root.join("ollama")
    }

    /// Model store used as `OLLAMA_MODELS`.
    #[must_use]
    pub fn models_dir(&self) -> Utf8PathBuf {
        self.root.join("models")
    }

    /// Editor package.
    #[must_use]
    pub fn editor_dir(&self) -> Utf8PathBuf {
        self.root.join("vscodium")
    }

    /// Editor extensions.
    #[must_use]
    pub fn extensions_dir(&self) -> Utf8PathBuf {
        self.root.join("extensions")
    }

    /// Downloaded `.deb` packages.
    #[must_use]
    pub fn debs_dir(&self) -> Utf8PathBuf {
        self.root.join("debs")
    }

    /// `rustup-init` and its descriptor.
    #[must_use]
    pub fn toolchain_dir(&self) -> Utf8PathBuf {
        self.root.join("rust").join("toolchain")
    }

    /// Vendored crate sources.
    #[must_use]
    pub fn vendor_dir(&self) -> Utf8PathBuf {
        self.root.join("rust").join("vendor")
    }

    /// Source-replacement snippet for the vendored crates.
    #[must_use]
    pub fn vendor_config(&self) -> Utf8PathBuf {
        self.root.join("rust").join("vendor-config.toml")
    }

    /// Python packages.
    #[must_use]
    pub fn python_dir(&self) -> Utf8PathBuf {
        self.root.join("python")
    }

    /// `pip --target` directory, cleared before every install.
    #[must_use]
    pub fn site_packages_dir(&self) -> Utf8PathBuf {
        self.python_dir().join("site-packages")
    }

    /// Tool logs.
    #[must_use]
    pub fn logs_dir(&self) -> Utf8PathBuf {
        self.root.join("logs")
    }

    /// Every category directory, in pipeline order.
    #[must_use]
    pub fn directories(&self) -> Vec<Utf8PathBuf> {
        vec![
            self.runtime_dir(),
            self.models_dir(),
            self.editor_dir(),
            self.extensions_dir(),
            self.debs_dir(),
            self.toolchain_dir(),
            self.vendor_dir(),
            self.python_dir(),
            self.logs_dir(),
        ]
    }
}

/// What currently occupies a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Occupant {
    Nothing,
    Directory,
    Other,
}

fn inspect(path: &Utf8Path) -> std::io::Result<Occupant> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => Ok(Occupant::Directory),
        // A symlink to a directory is usable as one.
        Ok(meta) if meta.file_type().is_symlink() && path.is_dir() => Ok(Occupant::Directory),
        Ok(_) => Ok(Occupant::Other),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Occupant::Nothing),
        Err(err) => Err(err),
    }
}

/// Make `path` an existing directory, creating missing components and
/// removing non-directory entries that stand in the way.
///
/// Removal that fails with a permission error is retried through
/// `escalator` when a privilege mode is available.
pub fn ensure(path: &Utf8Path, escalator: &PrivilegeEscalator<'_>) -> PrepareOutcome {
    let mut components: Vec<&Utf8Path> = path
        .ancestors()
        .filter(|ancestor| !ancestor.as_str().is_empty())
        .collect();
    components.reverse();

    for component in components {
        if let Err(reason) = ensure_component(component, escalator) {
            log::warn!("cannot prepare {path}: {reason}");
            return PrepareOutcome::Failed { reason };
        }
    }
    PrepareOutcome::Ready
}

fn ensure_component(
    component: &Utf8Path,
    escalator: &PrivilegeEscalator<'_>,
) -> Result<(), String> {
    let occupant = inspect(component).map_err(|err| format!("cannot inspect {component}: {err}"))?;
    match occupant {
        Occupant::Directory => return Ok(()),
        Occupant::Other => clear_collision(component, escalator)?,
        Occupant::Nothing => {}
    }
    match std::fs::create_dir(component) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            match inspect(component) {
                Ok(Occupant::Directory) => Ok(()),
                _ => Err(format!("{component} appeared while creating it and is not a directory")),
            }
        }
        Err(err) => Err(format!("cannot create {component}: {err}")),
    }
}

fn clear_collision(
    component: &Utf8Path,
    escalator: &PrivilegeEscalator<'_>,
) -> Result<(), String> {
    // Fresh look right before deleting anything.
    match inspect(component) {
        Ok(Occupant::Other) => {}
        Ok(Occupant::Directory | Occupant::Nothing) => return Ok(()),
        Err(err) => return Err(format!("cannot inspect {component}: {err}")),
    }
    log::warn!("{component} is not a directory; removing it");
    match std::fs::remove_file(component) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            log::warn!("permission denied removing {component}; trying with elevated privileges");
            escalated_remove(component, escalator)?;
        }
        Err(err) => return Err(format!("cannot remove {component}: {err}")),
    }
    match inspect(component) {
        Ok(Occupant::Other) => Err(format!("{component} is still not a directory after removal")),
        Ok(Occupant::Directory | Occupant::Nothing) => Ok(()),
        Err(err) => Err(format!("cannot inspect {component}: {err}")),
    }
}

fn escalated_remove(path: &Utf8Path, escalator: &PrivilegeEscalator<'_>) -> Result<(), String> {
    let request = CommandRequest::new("rm", ["-f", "--", path.as_str()]);
    let output = escalator
        .run(&request)
        .map_err(|err| format!("cannot remove {path}: permission denied and {err}"))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "cannot remove {path}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

/// Check that files can be created in `dir`.
///
/// # Errors
///
/// Returns the OS error from creating the probe file.
pub fn probe_writable(dir: &Utf8Path) -> std::io::Result<()> {
    let probe = tempfile::Builder::new()
        .prefix(".write-probe")
        .tempfile_in(dir)?;
    probe.close()
}

/// Prepare the bundle root and every category directory.
///
/// The root is probed for writability before any category directory is
/// touched.
pub fn ensure_layout(layout: &BundleLayout, escalator: &PrivilegeEscalator<'_>) -> PrepareOutcome {
    let root = ensure(layout.root(), escalator);
    if !root.is_ready() {
        return root;
    }
    if let Err(err) = probe_writable(layout.root()) {
        return PrepareOutcome::Failed {
            reason: format!("bundle root {} is not writable: {err}", layout.root()),
        };
    }
    for dir in layout.directories() {
        let outcome = ensure(&dir, escalator);
        if !outcome.is_ready() {
            return outcome;
        }
    }
    log::debug!("bundle layout ready under {}", layout.root());
    PrepareOutcome::Ready
}
