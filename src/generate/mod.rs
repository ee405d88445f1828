//! Artifact generation.
//!
//! Every generator reads from one [`GenerationContext`]: the validated
//! configuration, its class set, the acquired assets and the build
//! timestamp. Generators return an in-memory [`ArtifactBundle`]; nothing is
//! written until the orchestrator publishes the merged bundle.

pub mod autoinstall;
pub mod bundle;
pub mod crypt;
pub mod disk;
pub mod first_boot;
pub mod installer;
pub mod packages;
pub mod template;

use time::{OffsetDateTime, UtcOffset};

use crate::assets::AcquiredAssets;
use crate::classes::ClassSet;
use crate::config::BuildConfiguration;
use crate::error::BuildResult;

pub use bundle::{clean_stale_staging, Artifact, ArtifactBundle, Body, BUNDLE_DIR};
pub use disk::{plan_volumes, VolumePlan};
pub use packages::resolve_packages;

/// Where the first-boot bundle lives on the installed system.
pub const FIRST_BOOT_HOME: &str = "/opt/first-boot";
/// Where the installer media exposes the bundle's `first-boot/` tree.
pub const FIRST_BOOT_MEDIA: &str = "/cdrom/first-boot";

#[derive(Debug, Clone, Copy)]
pub struct GenerationContext<'a> {
    pub config: &'a BuildConfiguration,
    pub classes: &'a ClassSet,
    pub assets: &'a AcquiredAssets,
    /// Compact UTC build timestamp, `YYYYMMDDTHHMMSSZ`.
    pub timestamp: &'a str,
}

impl GenerationContext<'_> {
    /// Whether a first-boot bundle is produced for this build.
    pub fn wants_first_boot(&self) -> bool {
        first_boot::wanted(self)
    }
}

/// `autoinstall/user-data` and `autoinstall/meta-data`.
pub fn autoinstall(ctx: &GenerationContext<'_>, with_first_boot: bool) -> BuildResult<ArtifactBundle> {
    let mut bundle = ArtifactBundle::new();
    // user-data carries the password hash and the LUKS key.
    bundle.add_text(
        autoinstall::USER_DATA,
        autoinstall::render_user_data(ctx, with_first_boot)?,
        0o600,
    )?;
    bundle.add_text(
        autoinstall::META_DATA,
        autoinstall::render_meta_data(ctx)?,
        0o644,
    )?;
    Ok(bundle)
}

/// Everything under `fai-config/`.
pub fn installer_config(ctx: &GenerationContext<'_>) -> BuildResult<ArtifactBundle> {
    installer::generate(ctx)
}

/// Everything under `first-boot/`; empty when no bundle is wanted.
pub fn first_boot(ctx: &GenerationContext<'_>) -> BuildResult<ArtifactBundle> {
    if !ctx.wants_first_boot() {
        return Ok(ArtifactBundle::new());
    }
    first_boot::generate(ctx)
}

/// Compact UTC form, `YYYYMMDDTHHMMSSZ`. Offsets are converted first.
pub fn format_timestamp(at: OffsetDateTime) -> String {
    let at = at.to_offset(UtcOffset::UTC);
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        at.year(),
        at.month() as u8,
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    )
}
