//! Build configuration model.
//!
//! A [`BuildConfiguration`] is produced exactly once per invocation by
//! [`validate`] and is never mutated afterwards. Everything downstream
//! (class resolution, asset acquisition, generation) reads from the same
//! instance.

mod raw;
mod validate;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;

use crate::error::{BuildResult, ConfigValidationError, IoContext};

pub use raw::{RawAssetRef, RawConfig};
pub use validate::{recommendations, validate};

/// Default values for optional fields.
pub mod defaults {
    pub const CIPHER: &str = "aes-xts-plain64";
    pub const KEY_SIZE: u32 = 512;
    pub const HASH: &str = "sha256";
    pub const ITER_TIME_MS: u32 = 2000;
    pub const HOSTNAME: &str = "ubuntu-fai";
    pub const ISO_LABEL: &str = "Ubuntu-FAI";
    pub const DEB_TARGET_DIR: &str = "/opt/packages";
    pub const SCRIPTS_TARGET_DIR: &str = "/opt/first-boot/scripts";
    pub const FIRST_BOOT_TIMEOUT_SECS: u32 = 1800;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HardwareVendor {
    Dell,
    Lenovo,
    Hp,
    Generic,
}

impl HardwareVendor {
    pub const ALL: [HardwareVendor; 4] = [
        HardwareVendor::Dell,
        HardwareVendor::Lenovo,
        HardwareVendor::Hp,
        HardwareVendor::Generic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HardwareVendor::Dell => "dell",
            HardwareVendor::Lenovo => "lenovo",
            HardwareVendor::Hp => "hp",
            HardwareVendor::Generic => "generic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == value.trim().to_ascii_lowercase())
    }

    /// Primary wired interface name the vendor's reference hardware exposes.
    pub fn network_interface(self) -> &'static str {
        match self {
            HardwareVendor::Dell => "eno1",
            HardwareVendor::Lenovo => "enp0s31f6",
            HardwareVendor::Hp => "ens160",
            HardwareVendor::Generic => "eth0",
        }
    }

    /// Firmware and management packages installed for this vendor.
    pub fn packages(self) -> &'static [&'static str] {
        match self {
            HardwareVendor::Dell => &["fwupd", "libsmbios-bin"],
            HardwareVendor::Lenovo => &["fwupd", "tlp"],
            HardwareVendor::Hp => &["fwupd", "hplip"],
            HardwareVendor::Generic => &[],
        }
    }
}

impl fmt::Display for HardwareVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LuksCipher {
    AesXtsPlain64,
    AesCbcEssivSha256,
    AesLrwBenbi,
    SerpentXtsPlain64,
    TwofishXtsPlain64,
}

impl LuksCipher {
    pub const ALL: [LuksCipher; 5] = [
        LuksCipher::AesXtsPlain64,
        LuksCipher::AesCbcEssivSha256,
        LuksCipher::AesLrwBenbi,
        LuksCipher::SerpentXtsPlain64,
        LuksCipher::TwofishXtsPlain64,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LuksCipher::AesXtsPlain64 => "aes-xts-plain64",
            LuksCipher::AesCbcEssivSha256 => "aes-cbc-essiv:sha256",
            LuksCipher::AesLrwBenbi => "aes-lrw-benbi",
            LuksCipher::SerpentXtsPlain64 => "serpent-xts-plain64",
            LuksCipher::TwofishXtsPlain64 => "twofish-xts-plain64",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|c| c.as_str() == value)
    }

    /// Cipher name as it appears inside a class tag (`LUKS_<FRAGMENT>`).
    pub fn class_fragment(self) -> String {
        self.as_str()
            .chars()
            .map(|c| match c {
                '-' | ':' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect()
    }
}

impl fmt::Display for LuksCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuksKeySize {
    Bits256,
    Bits512,
}

impl LuksKeySize {
    pub fn bits(self) -> u32 {
        match self {
            LuksKeySize::Bits256 => 256,
            LuksKeySize::Bits512 => 512,
        }
    }

    pub fn from_bits(bits: i64) -> Option<Self> {
        match bits {
            256 => Some(LuksKeySize::Bits256),
            512 => Some(LuksKeySize::Bits512),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuksHash {
    Sha256,
    Sha512,
}

impl LuksHash {
    pub fn as_str(self) -> &'static str {
        match self {
            LuksHash::Sha256 => "sha256",
            LuksHash::Sha512 => "sha512",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sha256" => Some(LuksHash::Sha256),
            "sha512" => Some(LuksHash::Sha512),
            _ => None,
        }
    }
}

/// How a first-boot script is handled on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScriptType {
    /// Executed unattended during first boot.
    Automated,
    /// Staged for an operator; never executed automatically.
    Manual,
}

impl ScriptType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptType::Automated => "automated",
            ScriptType::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "automated" => Some(ScriptType::Automated),
            "manual" => Some(ScriptType::Manual),
            _ => None,
        }
    }
}

/// A string that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Where an asset comes from. Exactly one source per reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AssetReference {
    Remote {
        url: String,
        checksum: Option<String>,
    },
    Local {
        path: PathBuf,
        checksum: Option<String>,
    },
}

impl AssetReference {
    /// Declared lowercase sha256, if any.
    pub fn checksum(&self) -> Option<&str> {
        match self {
            AssetReference::Remote { checksum, .. } | AssetReference::Local { checksum, .. } => {
                checksum.as_deref()
            }
        }
    }

    /// URL or path, for messages and duplicate detection.
    pub fn source(&self) -> String {
        match self {
            AssetReference::Remote { url, .. } => url.clone(),
            AssetReference::Local { path, .. } => path.display().to_string(),
        }
    }

    /// Final path segment of the URL or path.
    pub fn file_name(&self) -> Option<String> {
        match self {
            AssetReference::Remote { url, .. } => {
                let without_query = url.split(['?', '#']).next().unwrap_or(url);
                without_query
                    .rsplit('/')
                    .next()
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            }
            AssetReference::Local { path, .. } => path
                .file_name()
                .and_then(|s| s.to_str())
                .map(str::to_string),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, AssetReference::Remote { .. })
    }
}

/// A `.deb` package delivered through the first-boot bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebPackage {
    pub name: String,
    pub source: AssetReference,
}

/// A first-boot script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRef {
    pub name: String,
    pub kind: ScriptType,
    pub source: AssetReference,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareConfig {
    pub vendor: HardwareVendor,
    pub target_ssd: bool,
    pub disk_size_min_gb: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub passphrase: Option<Secret>,
    pub cipher: LuksCipher,
    pub key_size: LuksKeySize,
    pub hash: LuksHash,
    pub iter_time_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageConfig {
    pub apt: Vec<String>,
    pub debs: Vec<DebPackage>,
    pub snaps: Vec<String>,
    pub deb_target_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserConfig {
    pub username: String,
    pub full_name: String,
    pub password: Option<Secret>,
    pub ssh_authorized_keys: Vec<String>,
    pub sudo_nopasswd: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstBootConfig {
    pub enabled: bool,
    pub scripts: Vec<ScriptRef>,
    pub target_dir: String,
    pub timeout_seconds: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub dhcp: bool,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoConfig {
    pub label: String,
    pub filename: Option<String>,
}

/// Validated, immutable build configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfiguration {
    pub hardware: HardwareConfig,
    pub encryption: EncryptionConfig,
    pub packages: PackageConfig,
    pub user: UserConfig,
    pub first_boot: FirstBootConfig,
    pub network: NetworkConfig,
    pub iso: IsoConfig,
}

impl BuildConfiguration {
    /// Read, parse and validate a configuration document.
    ///
    /// `.json` files are parsed as JSON, everything else as TOML.
    pub fn load(path: &Path) -> BuildResult<Self> {
        let text = fs::read_to_string(path)
            .io_context(|| format!("reading build config '{}'", path.display()))?;
        let raw = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            RawConfig::from_json_str(&text)?
        } else {
            RawConfig::from_toml_str(&text)?
        };
        Ok(validate(raw)?)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigValidationError> {
        validate(RawConfig::from_toml_str(text)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigValidationError> {
        validate(RawConfig::from_json_str(text)?)
    }

    /// Output ISO file name, explicit or derived from vendor and encryption.
    pub fn iso_filename(&self) -> String {
        if let Some(name) = &self.iso.filename {
            return name.clone();
        }
        format!(
            "ubuntu-24.04-desktop-{}{}.iso",
            self.hardware.vendor,
            if self.encryption.enabled {
                "-encrypted"
            } else {
                ""
            }
        )
    }

    pub fn has_custom_packages(&self) -> bool {
        !self.packages.apt.is_empty()
            || !self.packages.debs.is_empty()
            || !self.packages.snaps.is_empty()
    }

    /// Disk size the volume plan is computed against.
    pub fn reference_disk_gb(&self) -> u32 {
        self.hardware.disk_size_min_gb.unwrap_or(256)
    }

    /// Scripts that take part in the build. Disabled first-boot means none.
    pub fn active_scripts(&self) -> &[ScriptRef] {
        if self.first_boot.enabled {
            &self.first_boot.scripts
        } else {
            &[]
        }
    }

    /// Human-readable overview with secrets elided.
    pub fn summary(&self) -> serde_json::Value {
        json!({
            "hardware": {
                "vendor": self.hardware.vendor.as_str(),
                "target_ssd": self.hardware.target_ssd,
                "disk_size_min_gb": self.hardware.disk_size_min_gb,
            },
            "encryption": {
                "enabled": self.encryption.enabled,
                "cipher": self.encryption.cipher.as_str(),
                "key_size": self.encryption.key_size.bits(),
                "hash": self.encryption.hash.as_str(),
                "iter_time_ms": self.encryption.iter_time_ms,
                "passphrase_set": self.encryption.passphrase.is_some(),
            },
            "packages": {
                "apt": self.packages.apt,
                "snaps": self.packages.snaps,
                "debs": self.packages.debs.iter().map(|d| d.name.clone()).collect::<Vec<_>>(),
                "deb_target_dir": self.packages.deb_target_dir,
            },
            "user": {
                "username": self.user.username,
                "full_name": self.user.full_name,
                "password_set": self.user.password.is_some(),
                "ssh_keys": self.user.ssh_authorized_keys.len(),
                "sudo_nopasswd": self.user.sudo_nopasswd,
            },
            "first_boot": {
                "enabled": self.first_boot.enabled,
                "scripts": self.first_boot.scripts.iter().map(|s| json!({
                    "name": s.name,
                    "type": s.kind.as_str(),
                    "source": s.source.source(),
                })).collect::<Vec<_>>(),
                "target_dir": self.first_boot.target_dir,
                "timeout_seconds": self.first_boot.timeout_seconds,
            },
            "network": {
                "dhcp": self.network.dhcp,
                "hostname": self.network.hostname,
            },
            "iso": {
                "label": self.iso.label,
                "filename": self.iso_filename(),
            },
        })
    }
}
