//! First-boot automation bundle.
//!
//! The bundle lands on the target under `FIRST_BOOT_HOME`. A oneshot unit
//! runs `first-boot.sh` once: it stages debs and scripts into their target
//! directories, installs the debs, runs automated scripts in declared order,
//! applies the vendor branch, then writes the marker and disables itself.
//! Manual scripts are staged and listed, never executed.

use serde::Serialize;

use super::bundle::ArtifactBundle;
use super::installer::shell_quote;
use super::template::{render, require_classes, Values};
use super::{GenerationContext, FIRST_BOOT_HOME};
use crate::assets::{AcquiredAsset, AssetRole};
use crate::config::{HardwareVendor, ScriptType};
use crate::error::{BuildError, BuildResult};

pub const ROOT: &str = "first-boot";
pub const SCRIPT: &str = "first-boot/first-boot.sh";
pub const UNIT: &str = "first-boot/first-boot.service";
pub const INDEX: &str = "first-boot/assets.json";
pub const MANUAL_LIST: &str = "first-boot/manual-scripts.txt";
pub const MARKER: &str = "/var/lib/first-boot/completed";

/// Slack on top of the per-script timeouts before systemd gives up.
const UNIT_TIMEOUT_SLACK_SECS: u64 = 600;

const SCRIPT_TEMPLATE: &str = r#"#!/bin/bash
# First-boot provisioning generated by autoinstall-builder ({{timestamp}}).
set -u

BUNDLE={{bundle}}
DEB_DIR={{deb_dir}}
SCRIPT_DIR={{script_dir}}
SCRIPT_TIMEOUT={{timeout}}
MARKER={{marker}}

log() {
    echo "first-boot: $*"
}

if [ -e "$MARKER" ]; then
    log "already completed"
    exit 0
fi

failed=0

run_script() {
    log "running $1"
    if ! timeout "$SCRIPT_TIMEOUT" "$SCRIPT_DIR/$1"; then
        log "$1 failed"
        failed=1
    fi
}

mkdir -p "$DEB_DIR" "$SCRIPT_DIR"
{{stage_commands}}
{{install_commands}}
{{automated_commands}}
{{manual_commands}}
{{vendor_commands}}
mkdir -p "$(dirname "$MARKER")"
date -u +%Y-%m-%dT%H:%M:%SZ > "$MARKER"
systemctl disable first-boot.service
exit "$failed"
"#;

const UNIT_TEMPLATE: &str = "\
[Unit]
Description=First boot provisioning
Wants=network-online.target
After=network-online.target
ConditionPathExists=!{{marker}}

[Service]
Type=oneshot
ExecStart={{bundle}}/first-boot.sh
RemainAfterExit=yes
TimeoutStartSec={{unit_timeout}}
StandardOutput=journal+console

[Install]
WantedBy=multi-user.target
";

/// One entry of `assets.json`.
#[derive(Debug, Serialize)]
struct IndexEntry<'a> {
    name: &'a str,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    script_type: Option<&'static str>,
    bundle_path: String,
    target_path: String,
    source: &'a str,
    size: u64,
    md5: &'a str,
    sha256: &'a str,
    executable: bool,
}

#[derive(Debug, Serialize)]
struct Index<'a> {
    version: u32,
    packages: Vec<IndexEntry<'a>>,
    scripts: Vec<IndexEntry<'a>>,
}

struct Staged<'a> {
    asset: &'a AcquiredAsset,
    /// Name under `assets/<kind>/` and in the target directory.
    staged_name: String,
}

/// The bundle is produced when first-boot is enabled or debs were acquired.
pub fn wanted(ctx: &GenerationContext<'_>) -> bool {
    ctx.config.first_boot.enabled || !ctx.assets.packages.is_empty()
}

pub fn generate(ctx: &GenerationContext<'_>) -> BuildResult<ArtifactBundle> {
    let config = ctx.config;
    let mut bundle = ArtifactBundle::new();

    let packages: Vec<Staged<'_>> = ctx
        .assets
        .packages
        .iter()
        .map(|asset| Staged {
            asset,
            staged_name: asset.file_name.clone(),
        })
        .collect();
    let scripts: Vec<Staged<'_>> = ctx
        .assets
        .scripts
        .iter()
        .enumerate()
        .map(|(i, asset)| Staged {
            asset,
            staged_name: format!("{:02}-{}", i + 1, asset.file_name),
        })
        .collect();

    for staged in &packages {
        bundle.add_file(
            &format!("{}/assets/packages/{}", ROOT, staged.staged_name),
            &staged.asset.path,
            0o644,
        )?;
    }
    for staged in &scripts {
        let mode = if staged.asset.executable || is_automated(staged.asset) {
            0o755
        } else {
            0o644
        };
        bundle.add_file(
            &format!("{}/assets/scripts/{}", ROOT, staged.staged_name),
            &staged.asset.path,
            mode,
        )?;
    }

    if config.first_boot.enabled {
        if scripts.iter().any(|s| is_automated(s.asset)) {
            require_classes(SCRIPT, ctx.classes, &["FIRSTBOOT_AUTOMATED"])?;
        }
        if scripts.iter().any(|s| !is_automated(s.asset)) {
            require_classes(SCRIPT, ctx.classes, &["FIRSTBOOT_MANUAL"])?;
        }
    }

    bundle.add_text(SCRIPT, render_script(ctx, &packages, &scripts)?, 0o755)?;
    bundle.add_text(UNIT, render_unit(ctx, &scripts)?, 0o644)?;
    bundle.add_text(INDEX, render_index(ctx, &packages, &scripts)?, 0o644)?;
    bundle.add_text(MANUAL_LIST, render_manual_list(ctx, &scripts), 0o644)?;
    Ok(bundle)
}

fn is_automated(asset: &AcquiredAsset) -> bool {
    asset.role == AssetRole::Script(ScriptType::Automated)
}

fn render_script(
    ctx: &GenerationContext<'_>,
    packages: &[Staged<'_>],
    scripts: &[Staged<'_>],
) -> BuildResult<String> {
    let config = ctx.config;
    let mut stage = String::new();
    // Staged names are quoted on their own and appended to the quoted
    // directory variable, so they are never expanded by the shell.
    for staged in packages {
        stage.push_str(&format!(
            "install -m 0644 \"$BUNDLE/assets/packages/\"{0} \"$DEB_DIR/\"{0}\n",
            shell_quote(&staged.staged_name)
        ));
    }
    for staged in scripts {
        stage.push_str(&format!(
            "install -m 0755 \"$BUNDLE/assets/scripts/\"{0} \"$SCRIPT_DIR/\"{0}\n",
            shell_quote(&staged.staged_name)
        ));
    }

    let install = if packages.is_empty() {
        String::new()
    } else {
        let files: Vec<String> = packages
            .iter()
            .map(|s| format!("\"$DEB_DIR/\"{}", shell_quote(&s.staged_name)))
            .collect();
        format!(
            "log \"installing {} package(s)\"\n\
             if ! DEBIAN_FRONTEND=noninteractive apt-get install -y {}; then\n    \
             log \"package installation failed\"\n    failed=1\nfi\n",
            packages.len(),
            files.join(" ")
        )
    };

    let automated: String = scripts
        .iter()
        .filter(|s| is_automated(s.asset))
        .map(|s| format!("run_script {}\n", shell_quote(&s.staged_name)))
        .collect();
    let manual: String = scripts
        .iter()
        .filter(|s| !is_automated(s.asset))
        .map(|s| {
            format!(
                "log \"manual script staged: $SCRIPT_DIR/\"{}\n",
                shell_quote(&s.staged_name)
            )
        })
        .collect();

    let mut values = Values::new();
    values.insert("timestamp", ctx.timestamp.to_string());
    values.insert("bundle", shell_quote(FIRST_BOOT_HOME));
    values.insert("deb_dir", shell_quote(&config.packages.deb_target_dir));
    values.insert("script_dir", shell_quote(&config.first_boot.target_dir));
    values.insert("timeout", config.first_boot.timeout_seconds.to_string());
    values.insert("marker", shell_quote(MARKER));
    values.insert("stage_commands", stage);
    values.insert("install_commands", install);
    values.insert("automated_commands", automated);
    values.insert("manual_commands", manual);
    values.insert("vendor_commands", vendor_commands(ctx)?);
    render(SCRIPT, SCRIPT_TEMPLATE, &values)
}

fn vendor_commands(ctx: &GenerationContext<'_>) -> BuildResult<String> {
    let vendor = ctx.config.hardware.vendor;
    let commands = match vendor {
        HardwareVendor::Generic => return Ok(String::new()),
        HardwareVendor::Dell => {
            "if command -v fwupdmgr >/dev/null 2>&1; then\n    \
             fwupdmgr refresh --force || log \"firmware metadata refresh failed\"\n\
             fi\n"
        }
        HardwareVendor::Lenovo => {
            "if command -v tlp >/dev/null 2>&1; then\n    \
             systemctl enable --now tlp.service || log \"tlp could not be enabled\"\n\
             fi\n"
        }
        HardwareVendor::Hp => {
            "if command -v hp-check >/dev/null 2>&1; then\n    \
             hp-check -r >/var/log/hp-check.log 2>&1 || log \"hp-check reported problems\"\n\
             fi\n"
        }
    };
    let tag = format!("HARDWARE_{}", vendor.as_str().to_ascii_uppercase());
    require_classes(SCRIPT, ctx.classes, &[tag.as_str()])?;
    Ok(format!("log \"applying {} settings\"\n{}", vendor, commands))
}

fn render_unit(ctx: &GenerationContext<'_>, scripts: &[Staged<'_>]) -> BuildResult<String> {
    let automated = scripts.iter().filter(|s| is_automated(s.asset)).count() as u64;
    let unit_timeout =
        u64::from(ctx.config.first_boot.timeout_seconds) * automated.max(1) + UNIT_TIMEOUT_SLACK_SECS;
    let mut values = Values::new();
    values.insert("marker", MARKER.to_string());
    values.insert("bundle", FIRST_BOOT_HOME.to_string());
    values.insert("unit_timeout", unit_timeout.to_string());
    render(UNIT, UNIT_TEMPLATE, &values)
}

fn render_index(
    ctx: &GenerationContext<'_>,
    packages: &[Staged<'_>],
    scripts: &[Staged<'_>],
) -> BuildResult<String> {
    let index = Index {
        version: 1,
        packages: packages
            .iter()
            .map(|s| index_entry(s, "packages", &ctx.config.packages.deb_target_dir))
            .collect(),
        scripts: scripts
            .iter()
            .map(|s| index_entry(s, "scripts", &ctx.config.first_boot.target_dir))
            .collect(),
    };
    let mut text = serde_json::to_string_pretty(&index).map_err(|source| BuildError::Json {
        context: format!("serializing {}", INDEX),
        source,
    })?;
    text.push('\n');
    Ok(text)
}

fn index_entry<'a>(staged: &Staged<'a>, kind: &'static str, target_dir: &str) -> IndexEntry<'a> {
    let asset = staged.asset;
    IndexEntry {
        name: &asset.name,
        kind,
        script_type: match asset.role {
            AssetRole::Script(script_type) => Some(script_type.as_str()),
            AssetRole::Package => None,
        },
        bundle_path: format!("assets/{}/{}", kind, staged.staged_name),
        target_path: format!("{}/{}", target_dir.trim_end_matches('/'), staged.staged_name),
        source: &asset.source,
        size: asset.digests.size,
        md5: &asset.digests.md5,
        sha256: &asset.digests.sha256,
        executable: asset.executable,
    }
}

fn render_manual_list(ctx: &GenerationContext<'_>, scripts: &[Staged<'_>]) -> String {
    let mut out = String::from(
        "# Manual first-boot scripts. They are staged but never run automatically.\n",
    );
    for staged in scripts.iter().filter(|s| !is_automated(s.asset)) {
        out.push_str(&format!(
            "{}/{}\t{}\n",
            ctx.config.first_boot.target_dir.trim_end_matches('/'),
            staged.staged_name,
            staged.asset.name
        ));
    }
    out
}
