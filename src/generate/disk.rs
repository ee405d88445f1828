//! Disk layout descriptors and the volume plan shared with the
//! autoinstall storage section.

use super::template::{render, require_classes, Values};
use crate::classes::ClassSet;
use crate::config::BuildConfiguration;
use crate::error::BuildResult;

pub const ESP_MIB: u64 = 512;
pub const BOOT_MIB: u64 = 1024;
const SWAP_MIN_MIB: u64 = 2 * 1024;
const SWAP_MAX_MIB: u64 = 16 * 1024;

const ENCRYPTED_TEMPLATE: &str = "\
# Disk layout for class UBUNTU_ENCRYPTED (LUKS + LVM)
disk_config disk1 disklabel:gpt bootable:1 fstabkey:uuid
primary /boot/efi {{esp_mib}}M vfat rw
primary /boot {{boot_mib}}M ext4 {{mount_options}}
primary - {{crypt_mib}}M - -

disk_config cryptsetup randinit
luks:\"{{passphrase}}\" disk1.3 - - - cipher={{cipher}} keysize={{key_size}} hash={{hash}} iter-time={{iter_time}}

disk_config lvm fstabkey:uuid
vg vg_system disk1.3
vg_system-root / {{root_mib}}M ext4 {{mount_options}}
vg_system-home /home {{home_mib}}M ext4 {{mount_options}}
vg_system-swap swap {{swap_mib}}M swap {{swap_options}}
";

const PLAIN_TEMPLATE: &str = "\
# Disk layout for class DISK_PLAIN
disk_config disk1 disklabel:gpt bootable:1 fstabkey:uuid
primary /boot/efi {{esp_mib}}M vfat rw
primary / {{root_mib}}M- ext4 {{mount_options}}
";

/// Partition and volume sizes in MiB for a reference disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumePlan {
    pub disk_mib: u64,
    pub esp_mib: u64,
    pub boot_mib: u64,
    /// LUKS container (everything after ESP and /boot).
    pub crypt_mib: u64,
    pub root_mib: u64,
    pub home_mib: u64,
    pub swap_mib: u64,
    /// Left unallocated inside the volume group.
    pub reserved_mib: u64,
}

/// Root 50%, home 40%, swap 8% clamped to [2 GiB, 16 GiB] of the space
/// left after ESP and /boot; the rest stays free.
///
/// When the swap floor pushes the total past the container, home gives
/// up the difference so the volumes always fit.
pub fn plan_volumes(disk_gb: u32) -> VolumePlan {
    let disk_mib = u64::from(disk_gb) * 1024;
    let crypt_mib = disk_mib.saturating_sub(ESP_MIB + BOOT_MIB);
    let swap_mib = (crypt_mib * 8 / 100).clamp(SWAP_MIN_MIB, SWAP_MAX_MIB);
    let root_mib = crypt_mib / 2;
    let home_mib = (crypt_mib * 40 / 100).min(crypt_mib.saturating_sub(root_mib + swap_mib));
    let reserved_mib = crypt_mib.saturating_sub(root_mib + home_mib + swap_mib);
    VolumePlan {
        disk_mib,
        esp_mib: ESP_MIB,
        boot_mib: BOOT_MIB,
        crypt_mib,
        root_mib,
        home_mib,
        swap_mib,
        reserved_mib,
    }
}

/// Mount options for data filesystems; SSD targets get `noatime,discard`.
pub fn mount_options(classes: &ClassSet) -> &'static str {
    if classes.contains("TARGET_SSD") {
        "rw,noatime,discard"
    } else {
        "rw"
    }
}

/// Render the one disk descriptor the configuration selects.
///
/// Returns the class the file is named after and its contents.
pub fn render_disk_config(
    config: &BuildConfiguration,
    classes: &ClassSet,
) -> BuildResult<(&'static str, String)> {
    let plan = plan_volumes(config.reference_disk_gb());
    let options = mount_options(classes);
    let mut values = Values::new();
    values.insert("esp_mib", plan.esp_mib.to_string());
    values.insert("mount_options", options.to_string());

    if config.encryption.enabled {
        let class = "UBUNTU_ENCRYPTED";
        let artifact = format!("disk_config/{}", class);
        require_classes(&artifact, classes, &[class])?;
        let enc = &config.encryption;
        values.insert("boot_mib", plan.boot_mib.to_string());
        values.insert("crypt_mib", plan.crypt_mib.to_string());
        values.insert("root_mib", plan.root_mib.to_string());
        values.insert("home_mib", plan.home_mib.to_string());
        values.insert("swap_mib", plan.swap_mib.to_string());
        values.insert(
            "swap_options",
            if classes.contains("TARGET_SSD") {
                "sw,discard"
            } else {
                "sw"
            }
            .to_string(),
        );
        values.insert("cipher", enc.cipher.as_str().to_string());
        values.insert("key_size", enc.key_size.bits().to_string());
        values.insert("hash", enc.hash.as_str().to_string());
        values.insert("iter_time", enc.iter_time_ms.to_string());
        values.insert(
            "passphrase",
            enc.passphrase
                .as_ref()
                .map(|p| p.expose().replace('"', "\\\""))
                .unwrap_or_default(),
        );
        Ok((class, render(&artifact, ENCRYPTED_TEMPLATE, &values)?))
    } else {
        let class = "DISK_PLAIN";
        let artifact = format!("disk_config/{}", class);
        require_classes(&artifact, classes, &[class])?;
        values.insert(
            "root_mib",
            plan.disk_mib.saturating_sub(plan.esp_mib).to_string(),
        );
        Ok((class, render(&artifact, PLAIN_TEMPLATE, &values)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::resolve_classes;
    use crate::error::BuildError;

    fn config(extra: &str) -> BuildConfiguration {
        BuildConfiguration::from_toml_str(&format!(
            "[user]\nusername = \"ada\"\npassword = \"s3cret-pass\"\n{}",
            extra
        ))
        .unwrap()
    }

    #[test]
    fn volume_plan_percentages_and_swap_clamp() {
        let plan = plan_volumes(256);
        assert_eq!(plan.crypt_mib, 256 * 1024 - 1536);
        assert_eq!(plan.root_mib, plan.crypt_mib / 2);
        assert_eq!(plan.home_mib, plan.crypt_mib * 2 / 5);
        assert_eq!(plan.swap_mib, 16 * 1024);
        assert_eq!(
            plan.root_mib + plan.home_mib + plan.swap_mib + plan.reserved_mib,
            plan.crypt_mib
        );

        let small = plan_volumes(20);
        assert_eq!(small.swap_mib, 2 * 1024);
        assert_eq!(small.root_mib, small.crypt_mib / 2);
        assert_eq!(small.home_mib, small.crypt_mib - small.root_mib - small.swap_mib);
        assert_eq!(small.reserved_mib, 0);
    }

    #[test]
    fn volumes_fit_the_container_for_every_allowed_size() {
        for gb in 20..=10_000u32 {
            let plan = plan_volumes(gb);
            assert_eq!(
                plan.root_mib + plan.home_mib + plan.swap_mib + plan.reserved_mib,
                plan.crypt_mib,
                "disk {} GB",
                gb
            );
            assert!(plan.home_mib > 0, "disk {} GB", gb);
        }
    }

    #[test]
    fn encrypted_layout_carries_luks_parameters() {
        let cfg = config(
            "[encryption]\npassphrase = \"Correct-Horse-42\"\nkey_size = 256\nhash = \"sha512\"\n",
        );
        let classes = resolve_classes(&cfg);
        let (class, text) = render_disk_config(&cfg, &classes).unwrap();
        assert_eq!(class, "UBUNTU_ENCRYPTED");
        assert!(text.contains("cipher=aes-xts-plain64 keysize=256 hash=sha512 iter-time=2000"));
        assert!(text.contains("vg_system-home /home"));
        assert!(!text.contains("noatime"));
    }

    #[test]
    fn ssd_targets_get_discard_options() {
        let cfg = config("[hardware]\ntarget_ssd = true\n[encryption]\nenabled = false\n");
        let classes = resolve_classes(&cfg);
        let (class, text) = render_disk_config(&cfg, &classes).unwrap();
        assert_eq!(class, "DISK_PLAIN");
        assert!(text.contains("ext4 rw,noatime,discard"));
        assert!(!text.to_lowercase().contains("luks"));
    }

    #[test]
    fn class_missing_from_set_is_a_template_error() {
        let cfg = config("[encryption]\nenabled = false\n");
        let err = render_disk_config(&cfg, &ClassSet::default()).unwrap_err();
        assert!(matches!(err, BuildError::TemplateResolution { .. }));
    }
}
