//! FAI configuration space: class script, environment export, disk layout
//! and package list.

use std::collections::BTreeMap;

use super::bundle::ArtifactBundle;
use super::disk::render_disk_config;
use super::packages::resolve_packages;
use super::template::{render, require_classes, Values};
use super::GenerationContext;
use crate::error::BuildResult;

pub const CONFIG_ROOT: &str = "fai-config";
pub const CLASS_SCRIPT: &str = "fai-config/class/40-dynamic-classes";
pub const ENVIRONMENT: &str = "fai-config/class/50-environment.var";
pub const PACKAGE_CLASS: &str = "UBUNTU_DESKTOP";

const CLASS_SCRIPT_TEMPLATE: &str = "\
#! /bin/sh
# Classes resolved by autoinstall-builder ({{timestamp}}).
cat <<'EOF'
{{class_lines}}EOF
";

const PACKAGE_TEMPLATE: &str = "\
# Package list for class {{class}}
PACKAGES install-norec
{{package_lines}}";

/// Flat key/value export consumed by the installer hooks.
///
/// Built once from the configuration and class set; nothing here touches
/// the process environment.
pub fn environment(ctx: &GenerationContext<'_>) -> BTreeMap<&'static str, String> {
    let config = ctx.config;
    let flag = |b: bool| b.to_string();
    let mut env = BTreeMap::new();
    env.insert("FAI_USER_NAME", config.user.username.clone());
    env.insert("FAI_USER_FULL_NAME", config.user.full_name.clone());
    env.insert("FAI_SUDO_NOPASSWD", flag(config.user.sudo_nopasswd));
    env.insert("FAI_HARDWARE_VENDOR", config.hardware.vendor.as_str().to_string());
    env.insert("FAI_TARGET_SSD", flag(config.hardware.target_ssd));
    env.insert("FAI_ENCRYPTION_ENABLED", flag(config.encryption.enabled));
    env.insert("FAI_HOSTNAME", config.network.hostname.clone());
    env.insert("FAI_DHCP", flag(config.network.dhcp));
    env.insert("FAI_FIRST_BOOT_ENABLED", flag(config.first_boot.enabled));
    env.insert("FAI_BUILD_TIMESTAMP", ctx.timestamp.to_string());
    env.insert("FAI_ISO_LABEL", config.iso.label.clone());
    env.insert("FAI_CLASSES", ctx.classes.joined());
    env.insert("FAI_DEB_TARGET_DIR", config.packages.deb_target_dir.clone());

    if config.encryption.enabled {
        let enc = &config.encryption;
        env.insert("LUKS_CIPHER", enc.cipher.as_str().to_string());
        env.insert("LUKS_KEY_SIZE", enc.key_size.bits().to_string());
        env.insert("LUKS_HASH", enc.hash.as_str().to_string());
        env.insert("LUKS_ITER_TIME", enc.iter_time_ms.to_string());
    }
    if !config.packages.apt.is_empty() {
        env.insert("CUSTOM_APT_PACKAGES", config.packages.apt.join(" "));
    }
    if !config.packages.snaps.is_empty() {
        env.insert("CUSTOM_SNAP_PACKAGES", config.packages.snaps.join(" "));
    }
    if !config.user.ssh_authorized_keys.is_empty() {
        env.insert("FAI_SSH_KEYS", config.user.ssh_authorized_keys.join("\n"));
    }
    env
}

/// Single-quote `value` for POSIX sh.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub fn render_environment(env: &BTreeMap<&'static str, String>) -> String {
    let mut out = String::from("# Installer environment exported by autoinstall-builder.\n");
    for (key, value) in env {
        out.push_str(&format!("{}={}\n", key, shell_quote(value)));
    }
    out
}

/// Every artifact under `fai-config/`.
pub fn generate(ctx: &GenerationContext<'_>) -> BuildResult<ArtifactBundle> {
    let mut bundle = ArtifactBundle::new();

    let mut values = Values::new();
    values.insert("timestamp", ctx.timestamp.to_string());
    values.insert(
        "class_lines",
        ctx.classes.iter().map(|tag| format!("{}\n", tag)).collect(),
    );
    bundle.add_text(
        CLASS_SCRIPT,
        render(CLASS_SCRIPT, CLASS_SCRIPT_TEMPLATE, &values)?,
        0o755,
    )?;

    bundle.add_text(ENVIRONMENT, render_environment(&environment(ctx)), 0o644)?;

    let (disk_class, layout) = render_disk_config(ctx.config, ctx.classes)?;
    // The encrypted layout carries the passphrase.
    let disk_mode = if ctx.config.encryption.enabled { 0o600 } else { 0o644 };
    bundle.add_text(
        &format!("{}/disk_config/{}", CONFIG_ROOT, disk_class),
        layout,
        disk_mode,
    )?;

    let package_path = format!("{}/package_config/{}", CONFIG_ROOT, PACKAGE_CLASS);
    require_classes(&package_path, ctx.classes, &[PACKAGE_CLASS])?;
    let mut values = Values::new();
    values.insert("class", PACKAGE_CLASS.to_string());
    values.insert(
        "package_lines",
        resolve_packages(ctx.config)
            .iter()
            .map(|p| format!("{}\n", p))
            .collect(),
    );
    bundle.add_text(
        &package_path,
        render(&package_path, PACKAGE_TEMPLATE, &values)?,
        0o644,
    )?;

    Ok(bundle)
}
