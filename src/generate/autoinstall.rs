//! Subiquity autoinstall descriptor (`#cloud-config` user-data + meta-data).

use super::disk::{mount_options, plan_volumes, ESP_MIB};
use super::packages::resolve_packages;
use super::template::{render, require_classes, Values};
use super::{crypt, GenerationContext, FIRST_BOOT_HOME, FIRST_BOOT_MEDIA};
use crate::error::BuildResult;

pub const USER_DATA: &str = "autoinstall/user-data";
pub const META_DATA: &str = "autoinstall/meta-data";

/// Written when the account has no password; only ssh keys can log in.
const LOCKED_PASSWORD: &str = "*";

const USER_DATA_TEMPLATE: &str = "\
#cloud-config
# autoinstall-builder {{timestamp}}
# classes: {{classes}}
autoinstall:
  version: 1
  locale: en_US.UTF-8
  keyboard:
    layout: us
  timezone: UTC
  identity:
    hostname: {{hostname}}
    username: {{username}}
    realname: {{realname}}
    password: {{password}}
  ssh:
    install-server: true
    allow-pw: {{allow_pw}}
{{authorized_keys}}  network:
    version: 2
    ethernets:
      {{interface}}:
{{addressing}}  storage:
    swap:
      size: 0
    config:
{{storage}}  packages:
{{packages}}{{snaps}}{{late_commands}}";

const META_DATA_TEMPLATE: &str = "\
instance-id: {{hostname}}-{{timestamp}}
local-hostname: {{hostname}}
";

/// Render `user-data`.
///
/// `with_first_boot` adds the late-commands that install and enable the
/// first-boot unit; it must only be set when the bundle carries one.
pub fn render_user_data(ctx: &GenerationContext<'_>, with_first_boot: bool) -> BuildResult<String> {
    let config = ctx.config;
    let classes = ctx.classes;
    let base_tags: &[&str] = &["UBUNTU", "UBUNTU_DESKTOP"];
    require_classes(USER_DATA, classes, base_tags)?;

    let user = &config.user;
    let hostname = &config.network.hostname;
    let password = match &user.password {
        Some(secret) => {
            crypt::password_hash(secret.expose(), &crypt::derived_salt(&user.username, hostname))
        }
        None => LOCKED_PASSWORD.to_string(),
    };

    let mut values = Values::new();
    values.insert("timestamp", ctx.timestamp.to_string());
    values.insert("classes", classes.joined());
    values.insert("hostname", quote(hostname));
    values.insert("username", quote(&user.username));
    values.insert("realname", quote(&user.full_name));
    values.insert("password", quote(&password));
    values.insert("allow_pw", user.password.is_some().to_string());
    values.insert("authorized_keys", authorized_keys(&user.ssh_authorized_keys));
    values.insert("interface", config.hardware.vendor.network_interface().to_string());
    values.insert("addressing", addressing(ctx)?);
    values.insert("storage", storage(ctx)?);
    values.insert(
        "packages",
        resolve_packages(config)
            .iter()
            .map(|p| format!("    - {}\n", quote(p)))
            .collect(),
    );
    values.insert("snaps", snaps(&config.packages.snaps));
    values.insert("late_commands", late_commands(ctx, with_first_boot));
    render(USER_DATA, USER_DATA_TEMPLATE, &values)
}

pub fn render_meta_data(ctx: &GenerationContext<'_>) -> BuildResult<String> {
    let mut values = Values::new();
    values.insert("hostname", ctx.config.network.hostname.clone());
    values.insert("timestamp", ctx.timestamp.to_string());
    render(META_DATA, META_DATA_TEMPLATE, &values)
}

/// YAML double-quoted scalar. JSON string syntax is a subset of it.
fn quote(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

fn authorized_keys(keys: &[String]) -> String {
    if keys.is_empty() {
        return String::new();
    }
    let mut out = String::from("    authorized-keys:\n");
    for key in keys {
        out.push_str(&format!("      - {}\n", quote(key)));
    }
    out
}

fn addressing(ctx: &GenerationContext<'_>) -> BuildResult<String> {
    let tag = if ctx.config.network.dhcp {
        "NETWORK_DHCP"
    } else {
        "NETWORK_STATIC"
    };
    require_classes(USER_DATA, ctx.classes, &[tag])?;
    Ok(if ctx.config.network.dhcp {
        "        dhcp4: true\n".to_string()
    } else {
        // Addresses are assigned by the site's installer profile.
        "        dhcp4: false\n        optional: true\n".to_string()
    })
}

fn action(fields: &[(&str, String)]) -> String {
    let body: Vec<String> = fields.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
    format!("      - {{{}}}\n", body.join(", "))
}

fn storage(ctx: &GenerationContext<'_>) -> BuildResult<String> {
    let config = ctx.config;
    let options = mount_options(ctx.classes);
    let s = |v: &str| v.to_string();
    let mib = |v: u64| format!("{}M", v);

    let mut out = String::new();
    out.push_str(&action(&[
        ("type", s("disk")),
        ("id", s("disk0")),
        ("match", s("{size: largest}")),
        ("ptable", s("gpt")),
        ("wipe", s("superblock-recursive")),
        ("preserve", s("false")),
        ("grub_device", s("false")),
    ]));
    out.push_str(&action(&[
        ("type", s("partition")),
        ("id", s("part-esp")),
        ("device", s("disk0")),
        ("number", s("1")),
        ("size", mib(ESP_MIB)),
        ("flag", s("boot")),
        ("grub_device", s("true")),
    ]));
    out.push_str(&action(&[
        ("type", s("format")),
        ("id", s("fmt-esp")),
        ("volume", s("part-esp")),
        ("fstype", s("fat32")),
    ]));

    if !config.encryption.enabled {
        require_classes(USER_DATA, ctx.classes, &["DISK_PLAIN"])?;
        out.push_str(&action(&[
            ("type", s("partition")),
            ("id", s("part-root")),
            ("device", s("disk0")),
            ("number", s("2")),
            ("size", s("-1")),
        ]));
        out.push_str(&action(&[
            ("type", s("format")),
            ("id", s("fmt-root")),
            ("volume", s("part-root")),
            ("fstype", s("ext4")),
        ]));
        out.push_str(&mount("mnt-root", "fmt-root", "/", options));
        out.push_str(&mount("mnt-esp", "fmt-esp", "/boot/efi", "umask=0077"));
        return Ok(out);
    }

    require_classes(USER_DATA, ctx.classes, &["UBUNTU_ENCRYPTED"])?;
    let enc = &config.encryption;
    let plan = plan_volumes(config.reference_disk_gb());
    let passphrase = enc
        .passphrase
        .as_ref()
        .map(|p| p.expose().to_string())
        .unwrap_or_default();

    out.push_str(&action(&[
        ("type", s("partition")),
        ("id", s("part-boot")),
        ("device", s("disk0")),
        ("number", s("2")),
        ("size", mib(plan.boot_mib)),
    ]));
    out.push_str(&action(&[
        ("type", s("format")),
        ("id", s("fmt-boot")),
        ("volume", s("part-boot")),
        ("fstype", s("ext4")),
    ]));
    out.push_str(&action(&[
        ("type", s("partition")),
        ("id", s("part-luks")),
        ("device", s("disk0")),
        ("number", s("3")),
        ("size", s("-1")),
    ]));
    out.push_str(&action(&[
        ("type", s("dm_crypt")),
        ("id", s("luks0")),
        ("volume", s("part-luks")),
        ("dm_name", s("cryptroot")),
        ("key", quote(&passphrase)),
        ("cipher", quote(enc.cipher.as_str())),
        ("keysize", enc.key_size.bits().to_string()),
        ("hash", s(enc.hash.as_str())),
        ("iter_time", enc.iter_time_ms.to_string()),
    ]));
    out.push_str(&action(&[
        ("type", s("lvm_volgroup")),
        ("id", s("vg0")),
        ("name", s("vg_system")),
        ("devices", s("[luks0]")),
    ]));
    for (name, size, fstype) in [
        ("root", plan.root_mib, "ext4"),
        ("home", plan.home_mib, "ext4"),
        ("swap", plan.swap_mib, "swap"),
    ] {
        out.push_str(&action(&[
            ("type", s("lvm_partition")),
            ("id", format!("lv-{}", name)),
            ("volgroup", s("vg0")),
            ("name", s(name)),
            ("size", mib(size)),
        ]));
        out.push_str(&action(&[
            ("type", s("format")),
            ("id", format!("fmt-{}", name)),
            ("volume", format!("lv-{}", name)),
            ("fstype", s(fstype)),
        ]));
    }
    out.push_str(&mount("mnt-root", "fmt-root", "/", options));
    out.push_str(&mount("mnt-boot", "fmt-boot", "/boot", options));
    out.push_str(&mount("mnt-esp", "fmt-esp", "/boot/efi", "umask=0077"));
    out.push_str(&mount("mnt-home", "fmt-home", "/home", options));
    out.push_str(&mount("mnt-swap", "fmt-swap", "none", "sw"));
    Ok(out)
}

fn mount(id: &str, device: &str, path: &str, options: &str) -> String {
    action(&[
        ("type", "mount".to_string()),
        ("id", id.to_string()),
        ("device", device.to_string()),
        ("path", path.to_string()),
        ("options", quote(options)),
    ])
}

fn snaps(snaps: &[String]) -> String {
    if snaps.is_empty() {
        return String::new();
    }
    let mut out = String::from("  snaps:\n");
    for snap in snaps {
        out.push_str(&format!("    - name: {}\n", quote(snap)));
    }
    out
}

fn late_commands(ctx: &GenerationContext<'_>, with_first_boot: bool) -> String {
    let user = &ctx.config.user;
    let mut commands = Vec::new();
    if ctx.classes.contains("SUDO_NOPASSWD") {
        commands.push(format!(
            "echo '{} ALL=(ALL) NOPASSWD:ALL' > /target/etc/sudoers.d/90-{}",
            user.username, user.username
        ));
        commands.push(format!("chmod 0440 /target/etc/sudoers.d/90-{}", user.username));
    }
    if with_first_boot {
        commands.push(format!("mkdir -p /target{}", FIRST_BOOT_HOME));
        commands.push(format!(
            "cp -a {}/. /target{}/",
            FIRST_BOOT_MEDIA, FIRST_BOOT_HOME
        ));
        commands.push(format!(
            "install -m 0644 /target{}/first-boot.service /target/etc/systemd/system/first-boot.service",
            FIRST_BOOT_HOME
        ));
        commands.push(
            "curtin in-target --target=/target -- systemctl enable first-boot.service".to_string(),
        );
    }
    if commands.is_empty() {
        return String::new();
    }
    let mut out = String::from("  late-commands:\n");
    for command in commands {
        out.push_str(&format!("    - {}\n", quote(&command)));
    }
    out
}
