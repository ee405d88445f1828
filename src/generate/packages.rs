use std::collections::HashSet;

use crate::config::BuildConfiguration;

/// Installed on every target.
pub const BASE_PACKAGES: &[&str] = &[
    "ubuntu-desktop-minimal",
    "openssh-server",
    "ca-certificates",
    "curl",
];

/// Needed to unlock a LUKS root at boot.
pub const ENCRYPTION_PACKAGES: &[&str] = &["cryptsetup", "cryptsetup-initramfs", "lvm2"];

/// Base, user apt, encryption and vendor packages, deduplicated with the
/// first occurrence winning.
pub fn resolve_packages(config: &BuildConfiguration) -> Vec<String> {
    let encryption: &[&str] = if config.encryption.enabled {
        ENCRYPTION_PACKAGES
    } else {
        &[]
    };
    let mut seen = HashSet::new();
    BASE_PACKAGES
        .iter()
        .map(|p| p.to_string())
        .chain(config.packages.apt.iter().cloned())
        .chain(encryption.iter().map(|p| p.to_string()))
        .chain(config.hardware.vendor.packages().iter().map(|p| p.to_string()))
        .filter(|p| seen.insert(p.clone()))
        .collect()
}
