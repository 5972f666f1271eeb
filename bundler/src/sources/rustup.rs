//! The `rustup-init` installer for the language toolchain.

use crate::acquisition::{Artefact, Source};
use crate::artefact::descriptor::DescriptorKind;
use crate::ledger::Component;
use crate::workspace::BundleLayout;

/// Installer for Linux x86_64.
pub const RUSTUP_INIT_URL: &str =
    "https://static.rust-lang.org/rustup/dist/x86_64-unknown-linux-gnu/rustup-init";

/// The installer, verified against the digest published next to it.
///
/// The pipeline marks the file executable once it is trusted.
///
/// # Examples
///
/// ```
/// use airgap_bundler::sources::rustup::rustup_artefact;
/// use airgap_bundler::workspace::BundleLayout;
///
/// let artefact = rustup_artefact(&BundleLayout::new("/bundle"));
/// assert_eq!(artefact.destination.as_str(), "/bundle/rust/toolchain/rustup-init");
/// ```
#[must_use]
pub fn rustup_artefact(layout: &BundleLayout) -> Artefact {
    Artefact::new(
        "rustup-init",
        Component::RustToolchain,
        layout.toolchain_dir().join("rustup-init"),
        DescriptorKind::FilenameHash,
    )
    .with_source(Source::with_remote_descriptor(
        RUSTUP_INIT_URL,
        format!("{RUSTUP_INIT_URL}.sha256"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::DescriptorSource;

    #[test]
    fn descriptor_is_published_next_to_the_installer() {
        let artefact = rustup_artefact(&BundleLayout::new("/b"));
        assert_eq!(artefact.descriptor().path.as_str(), "/b/rust/toolchain/rustup-init.sha256");
        assert_eq!(
            artefact.source.map(|source| source.descriptor),
            Some(DescriptorSource::Remote {
                url: format!("{RUSTUP_INIT_URL}.sha256")
            })
        );
    }
}
