//! Turns a [`RawConfig`] into a [`BuildConfiguration`].
//!
//! Validation is pure: it never touches the filesystem or the network. All
//! problems are collected before returning so the operator can fix the
//! document in one pass.

use std::collections::HashSet;
use std::path::PathBuf;

use super::raw::{RawAssetRef, RawConfig};
use super::{
    defaults, AssetReference, BuildConfiguration, DebPackage, EncryptionConfig, FirstBootConfig,
    HardwareConfig, HardwareVendor, IsoConfig, LuksCipher, LuksHash, LuksKeySize, NetworkConfig,
    PackageConfig, ScriptRef, ScriptType, Secret, UserConfig,
};
use crate::assets::digest::is_hex_64;
use crate::error::{ConfigValidationError, FieldError};

const PASSPHRASE_MIN: usize = 12;
const PASSPHRASE_MAX: usize = 1024;
const PASSWORD_MIN: usize = 8;
const USERNAME_MAX: usize = 32;
const FULL_NAME_MAX: usize = 128;
const HOSTNAME_MAX: usize = 63;
const ISO_LABEL_MAX: usize = 32;
const SPECIAL_CHARS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?";

const RESERVED_USERNAMES: &[&str] = &["root", "admin", "administrator", "sys", "system"];

const SSH_KEY_TYPES: &[&str] = &[
    "ssh-rsa",
    "ssh-ed25519",
    "ssh-dss",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
];

/// Apt packages that cannot be installed together.
const CONFLICTS: &[(&str, &[&str])] = &[
    ("firefox", &["chromium-browser", "google-chrome-stable"]),
    ("vim", &["nano"]),
    ("apache2", &["nginx"]),
    ("mysql-server", &["postgresql"]),
];

#[derive(Default)]
struct Problems(Vec<FieldError>);

impl Problems {
    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldError::new(field, message));
    }
}

/// Validate a raw document, collecting every problem.
pub fn validate(raw: RawConfig) -> Result<BuildConfiguration, ConfigValidationError> {
    let mut problems = Problems::default();

    let hardware = validate_hardware(&raw, &mut problems);
    let encryption = validate_encryption(&raw, &mut problems);
    let packages = validate_packages(&raw, &mut problems);
    let user = validate_user(&raw, &mut problems);
    let first_boot = validate_first_boot(&raw, &mut problems);
    let network = validate_network(&raw, &mut problems);
    let iso = validate_iso(&raw, &mut problems);

    // A value dropped for its type would otherwise show up again as missing.
    let mut all = raw.shape_problems.clone();
    all.extend(
        problems
            .0
            .into_iter()
            .filter(|p| !raw.shape_problems.iter().any(|s| covers(&s.field, &p.field))),
    );
    if !all.is_empty() {
        return Err(ConfigValidationError { problems: all });
    }

    Ok(BuildConfiguration {
        hardware,
        encryption,
        packages,
        user,
        first_boot,
        network,
        iso,
    })
}

/// True when `field` is `parent` or lies inside it.
fn covers(parent: &str, field: &str) -> bool {
    field
        .strip_prefix(parent)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(['.', '[']))
}

fn validate_hardware(raw: &RawConfig, problems: &mut Problems) -> HardwareConfig {
    let vendor = match raw.hardware.vendor.as_deref() {
        None => HardwareVendor::Generic,
        Some(value) => HardwareVendor::parse(value).unwrap_or_else(|| {
            problems.push(
                "hardware.vendor",
                format!("unknown vendor '{}' (expected dell, lenovo, hp or generic)", value),
            );
            HardwareVendor::Generic
        }),
    };

    let disk_size_min_gb = raw.hardware.disk_size_min_gb.and_then(|gb| {
        if (20..=10_000).contains(&gb) {
            Some(gb as u32)
        } else {
            problems.push(
                "hardware.disk_size_min_gb",
                format!("{} is outside 20..=10000", gb),
            );
            None
        }
    });

    HardwareConfig {
        vendor,
        target_ssd: raw.hardware.target_ssd.unwrap_or(false),
        disk_size_min_gb,
    }
}

fn validate_encryption(raw: &RawConfig, problems: &mut Problems) -> EncryptionConfig {
    let enc = &raw.encryption;
    let enabled = enc.enabled.unwrap_or(true);

    let cipher_name = enc.cipher.as_deref().unwrap_or(defaults::CIPHER);
    let cipher = LuksCipher::parse(cipher_name).unwrap_or_else(|| {
        let allowed = LuksCipher::ALL
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        problems.push(
            "encryption.cipher",
            format!("unsupported cipher '{}' (allowed: {})", cipher_name, allowed),
        );
        LuksCipher::AesXtsPlain64
    });

    let bits = enc.key_size.unwrap_or(i64::from(defaults::KEY_SIZE));
    let key_size = LuksKeySize::from_bits(bits).unwrap_or_else(|| {
        problems.push(
            "encryption.key_size",
            format!("unsupported key size {} (allowed: 256, 512)", bits),
        );
        LuksKeySize::Bits512
    });

    let hash_name = enc.hash.as_deref().unwrap_or(defaults::HASH);
    let hash = LuksHash::parse(hash_name).unwrap_or_else(|| {
        problems.push(
            "encryption.hash",
            format!("unsupported hash '{}' (allowed: sha256, sha512)", hash_name),
        );
        LuksHash::Sha256
    });

    let iter_time = enc.iter_time_ms.unwrap_or(i64::from(defaults::ITER_TIME_MS));
    let iter_time_ms = if (1_000..=60_000).contains(&iter_time) {
        iter_time as u32
    } else {
        problems.push(
            "encryption.iter_time_ms",
            format!("{} is outside 1000..=60000", iter_time),
        );
        defaults::ITER_TIME_MS
    };

    if enabled {
        match enc.passphrase.as_deref() {
            None | Some("") => {
                problems.push("encryption.passphrase", "required when encryption is enabled")
            }
            Some(passphrase) => check_passphrase(passphrase, problems),
        }
    }

    EncryptionConfig {
        enabled,
        passphrase: enc.passphrase.clone().map(Secret::new),
        cipher,
        key_size,
        hash,
        iter_time_ms,
    }
}

fn check_passphrase(passphrase: &str, problems: &mut Problems) {
    let len = passphrase.chars().count();
    if len < PASSPHRASE_MIN {
        problems.push(
            "encryption.passphrase",
            format!("must be at least {} characters", PASSPHRASE_MIN),
        );
    }
    if len > PASSPHRASE_MAX {
        problems.push(
            "encryption.passphrase",
            format!("must be at most {} characters", PASSPHRASE_MAX),
        );
    }
    let classes = [
        passphrase.chars().any(|c| c.is_ascii_uppercase()),
        passphrase.chars().any(|c| c.is_ascii_lowercase()),
        passphrase.chars().any(|c| c.is_ascii_digit()),
        passphrase.chars().any(|c| SPECIAL_CHARS.contains(c)),
    ];
    if classes.iter().filter(|present| **present).count() < 3 {
        problems.push(
            "encryption.passphrase",
            "must mix at least three of: uppercase, lowercase, digits, special characters",
        );
    }
}

fn validate_packages(raw: &RawConfig, problems: &mut Problems) -> PackageConfig {
    let pkgs = &raw.packages;

    let apt = normalize_names(&pkgs.apt_packages);
    for (i, name) in apt.iter().enumerate() {
        if !is_debian_package_name(name) {
            problems.push(
                format!("packages.apt_packages[{}]", i),
                format!("'{}' is not a valid package name", name),
            );
        }
    }
    for (first, others) in CONFLICTS {
        if !apt.iter().any(|p| p == first) {
            continue;
        }
        for other in others.iter().filter(|o| apt.iter().any(|p| p == *o)) {
            problems.push(
                "packages.apt_packages",
                format!("'{}' conflicts with '{}'", first, other),
            );
        }
    }

    let snaps = normalize_names(&pkgs.snap_packages);
    for (i, name) in snaps.iter().enumerate() {
        if !is_snap_name(name) {
            problems.push(
                format!("packages.snap_packages[{}]", i),
                format!("'{}' is not a valid snap name", name),
            );
        }
    }

    let mut debs = Vec::new();
    let mut seen = HashSet::new();
    let mut seen_files = HashSet::new();
    for (i, raw_ref) in pkgs.debs.iter().enumerate() {
        let field = format!("packages.debs[{}]", i);
        if raw_ref.kind.is_some() {
            problems.push(format!("{}.type", field), "only first-boot scripts take a type");
        }
        let Some(source) = asset_reference(raw_ref, &field, problems) else {
            continue;
        };
        let Some(file_name) = source.file_name().filter(|n| n.ends_with(".deb")) else {
            problems.push(field, format!("'{}' does not name a .deb file", source.source()));
            continue;
        };
        if !seen.insert(source.source()) {
            problems.push(field, format!("duplicate package source '{}'", source.source()));
            continue;
        }
        let source_field = format!("{}.{}", field, source_key(&source));
        if !is_plain_file_name(&file_name) {
            problems.push(
                source_field,
                format!("file name '{}' {}", file_name, PLAIN_FILE_NAME),
            );
            continue;
        }
        if !seen_files.insert(file_name.clone()) {
            problems.push(
                source_field,
                format!("file name '{}' is already used by another package", file_name),
            );
            continue;
        }
        let name = raw_ref
            .name
            .clone()
            .unwrap_or_else(|| file_name.trim_end_matches(".deb").to_string());
        debs.push(DebPackage { name, source });
    }

    let deb_target_dir = pkgs
        .deb_target_dir
        .clone()
        .unwrap_or_else(|| defaults::DEB_TARGET_DIR.to_string());
    check_target_dir(&deb_target_dir, "packages.deb_target_dir", problems);

    PackageConfig {
        apt,
        debs,
        snaps,
        deb_target_dir,
    }
}

fn validate_user(raw: &RawConfig, problems: &mut Problems) -> UserConfig {
    let Some(user) = raw.user.as_ref() else {
        problems.push("user", "section is required");
        return UserConfig {
            username: String::new(),
            full_name: String::new(),
            password: None,
            ssh_authorized_keys: Vec::new(),
            sudo_nopasswd: false,
        };
    };

    let username = user.username.clone().unwrap_or_default().trim().to_string();
    if username.is_empty() {
        problems.push("user.username", "is required");
    } else {
        if username.len() > USERNAME_MAX {
            problems.push(
                "user.username",
                format!("must be at most {} characters", USERNAME_MAX),
            );
        }
        if !is_username(&username) {
            problems.push(
                "user.username",
                "must start with a lowercase letter and contain only a-z, 0-9, '_' or '-'",
            );
        }
        if RESERVED_USERNAMES.contains(&username.as_str()) {
            problems.push("user.username", format!("'{}' is reserved", username));
        }
    }

    let full_name = user
        .full_name
        .clone()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| username.clone());
    if full_name.chars().count() > FULL_NAME_MAX {
        problems.push(
            "user.full_name",
            format!("must be at most {} characters", FULL_NAME_MAX),
        );
    }
    if full_name.contains(['\n', '\r', ':']) {
        problems.push("user.full_name", "must not contain ':' or line breaks");
    }

    let password = user.password.clone().filter(|p| !p.is_empty());
    if let Some(pw) = &password {
        if pw.chars().count() < PASSWORD_MIN && !pw.starts_with('$') {
            problems.push(
                "user.password",
                format!("must be at least {} characters", PASSWORD_MIN),
            );
        }
    }

    let ssh_authorized_keys: Vec<String> = user
        .ssh_authorized_keys
        .iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();
    for (i, key) in ssh_authorized_keys.iter().enumerate() {
        let parts: Vec<&str> = key.split_whitespace().collect();
        if parts.len() < 2 || !SSH_KEY_TYPES.contains(&parts[0]) {
            problems.push(
                format!("user.ssh_authorized_keys[{}]", i),
                "not an OpenSSH public key (expected '<type> <base64> [comment]')",
            );
        }
    }

    if password.is_none() && ssh_authorized_keys.is_empty() {
        problems.push("user", "either a password or at least one ssh key is required");
    }

    UserConfig {
        username,
        full_name,
        password: password.map(Secret::new),
        ssh_authorized_keys,
        sudo_nopasswd: user.sudo_nopasswd.unwrap_or(false),
    }
}

fn validate_first_boot(raw: &RawConfig, problems: &mut Problems) -> FirstBootConfig {
    let fb = &raw.first_boot;

    let timeout = fb
        .timeout_seconds
        .unwrap_or(i64::from(defaults::FIRST_BOOT_TIMEOUT_SECS));
    let timeout_seconds = if (60..=7_200).contains(&timeout) {
        timeout as u32
    } else {
        problems.push(
            "first_boot.timeout_seconds",
            format!("{} is outside 60..=7200", timeout),
        );
        defaults::FIRST_BOOT_TIMEOUT_SECS
    };

    let mut scripts = Vec::new();
    let mut seen = HashSet::new();
    let mut seen_manual = false;
    for (i, raw_ref) in fb.scripts.iter().enumerate() {
        let field = format!("first_boot.scripts[{}]", i);
        let kind = match raw_ref.kind.as_deref() {
            None => ScriptType::Automated,
            Some(value) => match ScriptType::parse(value) {
                Some(kind) => kind,
                None => {
                    problems.push(
                        format!("{}.type", field),
                        format!("unknown script type '{}' (expected automated or manual)", value),
                    );
                    continue;
                }
            },
        };
        match kind {
            ScriptType::Manual => seen_manual = true,
            ScriptType::Automated if seen_manual => problems.push(
                field.clone(),
                "automated scripts must be listed before manual scripts",
            ),
            ScriptType::Automated => {}
        }
        let Some(source) = asset_reference(raw_ref, &field, problems) else {
            continue;
        };
        if !seen.insert(source.source()) {
            problems.push(field, format!("duplicate script source '{}'", source.source()));
            continue;
        }
        let Some(name) = raw_ref.name.clone().or_else(|| source.file_name()) else {
            problems.push(field, "cannot derive a script name; set 'name'");
            continue;
        };
        let name_field = if raw_ref.name.is_some() {
            format!("{}.name", field)
        } else {
            format!("{}.{}", field, source_key(&source))
        };
        if !is_plain_file_name(&name) {
            problems.push(name_field, format!("'{}' {}", name, PLAIN_FILE_NAME));
            continue;
        }
        if let Some(file_name) = source.file_name().filter(|n| !is_plain_file_name(n)) {
            problems.push(
                format!("{}.{}", field, source_key(&source)),
                format!("file name '{}' {}", file_name, PLAIN_FILE_NAME),
            );
            continue;
        }
        scripts.push(ScriptRef { name, kind, source });
    }

    let target_dir = fb
        .target_dir
        .clone()
        .unwrap_or_else(|| defaults::SCRIPTS_TARGET_DIR.to_string());
    check_target_dir(&target_dir, "first_boot.target_dir", problems);

    FirstBootConfig {
        enabled: fb.enabled.unwrap_or(true),
        scripts,
        target_dir,
        timeout_seconds,
    }
}

fn validate_network(raw: &RawConfig, problems: &mut Problems) -> NetworkConfig {
    let hostname = raw
        .network
        .hostname
        .clone()
        .unwrap_or_else(|| defaults::HOSTNAME.to_string());
    if !is_hostname(&hostname) {
        problems.push(
            "network.hostname",
            format!(
                "'{}' must be 1-{} letters, digits or inner hyphens",
                hostname, HOSTNAME_MAX
            ),
        );
    }
    NetworkConfig {
        dhcp: raw.network.dhcp.unwrap_or(true),
        hostname,
    }
}

fn validate_iso(raw: &RawConfig, problems: &mut Problems) -> IsoConfig {
    let label = raw
        .iso_label
        .clone()
        .unwrap_or_else(|| defaults::ISO_LABEL.to_string());
    if label.is_empty() || label.len() > ISO_LABEL_MAX {
        problems.push(
            "iso_label",
            format!("must be 1-{} characters", ISO_LABEL_MAX),
        );
    }
    if label.contains(['\'', '"', '\n']) {
        problems.push("iso_label", "must not contain quotes or line breaks");
    }
    if let Some(filename) = &raw.iso_filename {
        if !filename.ends_with(".iso") || filename.len() <= 4 {
            problems.push("iso_filename", "must end with '.iso'");
        }
        if filename.contains(['/', '\\']) {
            problems.push("iso_filename", "must not contain path separators");
        }
    }
    IsoConfig {
        label,
        filename: raw.iso_filename.clone(),
    }
}

fn asset_reference(
    raw_ref: &RawAssetRef,
    field: &str,
    problems: &mut Problems,
) -> Option<AssetReference> {
    let checksum = match raw_ref.checksum.as_deref() {
        None => None,
        Some(sum) if is_hex_64(sum.trim()) => Some(sum.trim().to_ascii_lowercase()),
        Some(_) => {
            problems.push(
                format!("{}.checksum", field),
                "must be a 64-character hex sha256",
            );
            return None;
        }
    };

    match (raw_ref.url.as_deref(), raw_ref.local_path.as_deref()) {
        (Some(_), Some(_)) => {
            problems.push(field, "set either 'url' or 'local_path', not both");
            None
        }
        (None, None) => {
            problems.push(field, "one of 'url' or 'local_path' is required");
            None
        }
        (Some(url), None) => {
            if let Err(message) = check_url(url) {
                problems.push(format!("{}.url", field), message);
                return None;
            }
            Some(AssetReference::Remote {
                url: url.to_string(),
                checksum,
            })
        }
        (None, Some(path)) => {
            if path.trim().is_empty() {
                problems.push(format!("{}.local_path", field), "must not be empty");
                return None;
            }
            Some(AssetReference::Local {
                path: PathBuf::from(path),
                checksum,
            })
        }
    }
}

fn check_url(url: &str) -> Result<(), String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| format!("'{}' is not a URL: {}", url, e))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!("'{}' must use http or https", url));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(format!("'{}' has no host", url));
    }
    Ok(())
}

fn check_target_dir(dir: &str, field: &str, problems: &mut Problems) {
    if !dir.starts_with('/') || dir.contains("..") || dir.contains(['\'', '"', ' ', '\n']) {
        problems.push(
            field,
            format!("'{}' must be an absolute path without '..', quotes or spaces", dir),
        );
    }
}

const PLAIN_FILE_NAME: &str =
    "may only contain letters, digits, '.', '_', '+', '~', '%' or '-' and must not start with '.'";

/// Asset file names end up in generated shell and unit files.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._+~%-".contains(c))
}

fn source_key(source: &AssetReference) -> &'static str {
    if source.is_remote() {
        "url"
    } else {
        "local_path"
    }
}

fn normalize_names(names: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .filter(|n| seen.insert(n.clone()))
        .collect()
}

fn is_debian_package_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() >= 2
        && (first.is_ascii_lowercase() || first.is_ascii_digit())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+-.".contains(c))
}

fn is_snap_name(name: &str) -> bool {
    name.len() <= 40
        && name.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn is_username(name: &str) -> bool {
    name.starts_with(|c: char| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn is_hostname(name: &str) -> bool {
    let bytes = name.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            bytes.len() <= HOSTNAME_MAX
                && first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
        }
        _ => false,
    }
}

/// Non-fatal advice about a valid configuration.
pub fn recommendations(config: &BuildConfiguration) -> Vec<String> {
    let mut out = Vec::new();
    let enc = &config.encryption;

    if enc.enabled {
        if config.hardware.vendor == HardwareVendor::Dell && enc.key_size.bits() > 256 {
            out.push(
                "Dell firmware unlock is faster with a 256-bit LUKS key; consider key_size = 256"
                    .to_string(),
            );
        }
        if config.hardware.vendor == HardwareVendor::Hp
            && enc.cipher == LuksCipher::SerpentXtsPlain64
        {
            out.push(
                "serpent has no hardware acceleration on HP reference machines; prefer aes-xts-plain64"
                    .to_string(),
            );
        }
    } else {
        out.push("disk encryption is disabled".to_string());
    }

    if !config.has_custom_packages() {
        out.push("no custom packages configured".to_string());
    }

    if config.first_boot.enabled && config.first_boot.scripts.is_empty() {
        out.push("first boot is enabled but no scripts are configured".to_string());
    }

    if config.user.sudo_nopasswd && config.user.ssh_authorized_keys.is_empty() {
        out.push("passwordless sudo without ssh keys lets any console user become root".to_string());
    }

    let automated = config
        .active_scripts()
        .iter()
        .filter(|s| s.kind == ScriptType::Automated)
        .count() as u32;
    if automated > 0 && config.first_boot.timeout_seconds / automated < 60 {
        out.push(format!(
            "first-boot timeout leaves less than 60s per automated script ({} scripts, {}s)",
            automated, config.first_boot.timeout_seconds
        ));
    }

    out
}
