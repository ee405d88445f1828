//! Build orchestration.
//!
//! Stages run strictly in order: validate, acquire-assets, the three
//! generation stages, publish, then the optional installer. The first
//! failing stage stops the run; its record carries the root cause and the
//! caller gets [`BuildError::StageFailed`]. The build log is written in
//! every case.

pub mod stage_log;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, error, info, warn};

use crate::archive::{bundle_digest, create_tar_zst, ARCHIVE_NAME};
use crate::assets::{acquire, AcquireOptions, AcquiredAssets, FetchPolicy, SourcingMode};
use crate::cache::AssetCache;
use crate::cancel::CancelFlag;
use crate::classes::{resolve_classes, ClassSet};
use crate::config::{recommendations, BuildConfiguration};
use crate::error::{create_dir_all, BuildError, BuildResult, ConfigValidationError};
use crate::fsutil::remove_dir_if_exists;
use crate::generate::{self, clean_stale_staging, format_timestamp, ArtifactBundle, GenerationContext};
use crate::preflight::{preflight, run_installer};

pub use stage_log::{BuildLog, StageRecord, StageStatus, BUILD_LOG_JSON, BUILD_LOG_TEXT};

/// Scratch area under the output directory for local asset copies.
const WORK_DIR: &str = ".work";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Validate,
    AcquireAssets,
    GenerateAutoinstall,
    GenerateInstallerConfig,
    GenerateFirstBoot,
    Publish,
    InvokeInstaller,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Validate,
        Stage::AcquireAssets,
        Stage::GenerateAutoinstall,
        Stage::GenerateInstallerConfig,
        Stage::GenerateFirstBoot,
        Stage::Publish,
        Stage::InvokeInstaller,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::AcquireAssets => "acquire-assets",
            Stage::GenerateAutoinstall => "generate-autoinstall",
            Stage::GenerateInstallerConfig => "generate-installer-config",
            Stage::GenerateFirstBoot => "generate-first-boot",
            Stage::Publish => "publish",
            Stage::InvokeInstaller => "invoke-installer",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stages the caller asked to skip. Validate and publish cannot be skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageSkips {
    pub acquire: bool,
    pub autoinstall: bool,
    pub installer_config: bool,
    pub first_boot: bool,
    pub installer: bool,
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub config_path: PathBuf,
    pub output_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub assets_root: Option<PathBuf>,
    pub mode: SourcingMode,
    pub concurrency: usize,
    pub fetch_policy: FetchPolicy,
    pub skips: StageSkips,
    /// Stamped into every artifact; fixed for reproducible output.
    pub timestamp: OffsetDateTime,
    /// Also write `bundle.tar.zst` next to the bundle.
    pub archive: bool,
    /// Installer program; `None` skips the installer stage.
    pub installer: Option<String>,
    pub cancel: CancelFlag,
}

impl BuildOptions {
    pub fn new(config_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            output_dir: output_dir.into(),
            cache_dir: AssetCache::default_root(),
            assets_root: None,
            mode: SourcingMode::default(),
            concurrency: 4,
            fetch_policy: FetchPolicy::default(),
            skips: StageSkips::default(),
            timestamp: OffsetDateTime::UNIX_EPOCH,
            archive: false,
            installer: None,
            cancel: CancelFlag::new(),
        }
    }
}

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub log: BuildLog,
    pub log_path: PathBuf,
    pub classes: ClassSet,
    pub bundle_dir: Option<PathBuf>,
    pub bundle_digest: Option<String>,
    pub archive: Option<PathBuf>,
    pub iso_path: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct Products {
    classes: ClassSet,
    bundle_dir: Option<PathBuf>,
    bundle_digest: Option<String>,
    archive: Option<PathBuf>,
    iso_path: Option<PathBuf>,
}

struct Runner<'a> {
    log: BuildLog,
    cancel: &'a CancelFlag,
}

impl Runner<'_> {
    /// Run one stage. `f` returns the stage's value and a short detail line
    /// for the log.
    fn run<T>(
        &mut self,
        stage: Stage,
        f: impl FnOnce() -> BuildResult<(T, String)>,
    ) -> BuildResult<T> {
        let clock = stage_log::StageClock::start(stage);
        info!(stage = %stage, "stage started");
        match self.cancel.check().and_then(|()| f()) {
            Ok((value, detail)) => {
                let record = clock.finish(StageStatus::Success, Some(detail), None);
                info!(stage = %stage, duration_ms = record.duration_ms, "stage finished");
                self.log.stages.push(record);
                Ok(value)
            }
            Err(err) => {
                let status = if err.is_cancelled() {
                    StageStatus::Cancelled
                } else {
                    StageStatus::Failed
                };
                error!(stage = %stage, status = status.as_str(), "{}", err);
                self.log
                    .stages
                    .push(clock.finish(status, None, Some(err.to_string())));
                Err(BuildError::StageFailed {
                    stage,
                    source: Box::new(err),
                })
            }
        }
    }

    fn skip(&mut self, stage: Stage, reason: &str) {
        info!(stage = %stage, reason, "stage skipped");
        self.log.stages.push(stage_log::StageClock::start(stage).finish(
            StageStatus::Skipped,
            Some(reason.to_string()),
            None,
        ));
    }
}

/// Run the whole pipeline for one configuration document.
pub fn run_build(opts: &BuildOptions) -> BuildResult<BuildReport> {
    let timestamp = format_timestamp(opts.timestamp);
    create_dir_all(&opts.output_dir)?;

    let mut runner = Runner {
        log: BuildLog::new(&opts.config_path, opts.mode.as_str(), &timestamp),
        cancel: &opts.cancel,
    };
    let work_dir = opts.output_dir.join(WORK_DIR);
    let outcome = run_stages(opts, &timestamp, &work_dir, &mut runner);
    if let Err(err) = remove_dir_if_exists(&work_dir) {
        warn!("{}", err);
    }

    runner.log.finish();
    let written = runner.log.write(&opts.output_dir);
    let products = match outcome {
        Ok(products) => products,
        Err(err) => {
            if let Err(log_err) = &written {
                warn!(error = %log_err, "could not write the build log for the failed build");
            }
            return Err(err);
        }
    };
    let log_path = written?;
    info!(
        log = %log_path.display(),
        status = runner.log.status.as_str(),
        "build finished"
    );
    Ok(BuildReport {
        log: runner.log,
        log_path,
        classes: products.classes,
        bundle_dir: products.bundle_dir,
        bundle_digest: products.bundle_digest,
        archive: products.archive,
        iso_path: products.iso_path,
    })
}

fn run_stages(
    opts: &BuildOptions,
    timestamp: &str,
    work_dir: &Path,
    runner: &mut Runner<'_>,
) -> BuildResult<Products> {
    let mut products = Products::default();

    let (config, classes) = runner.run(Stage::Validate, || {
        let config = BuildConfiguration::load(&opts.config_path)?;
        for advice in recommendations(&config) {
            warn!("{}", advice);
        }
        let classes = resolve_classes(&config);
        let detail = format!("{} class(es)", classes.len());
        Ok(((config, classes), detail))
    })?;
    runner.log.classes = classes.as_slice().to_vec();
    products.classes = classes.clone();

    let assets = if opts.skips.acquire {
        runner.skip(Stage::AcquireAssets, "skipped by flag");
        AcquiredAssets::default()
    } else {
        runner.run(Stage::AcquireAssets, || {
            let cache = AssetCache::open(&opts.cache_dir)?;
            let _session = cache.session()?;
            let base_dir = opts
                .config_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let acquired = acquire(
                &config,
                &AcquireOptions {
                    cache: &cache,
                    work_dir,
                    base_dir,
                    assets_root: opts.assets_root.as_deref(),
                    mode: opts.mode,
                    concurrency: opts.concurrency,
                    policy: opts.fetch_policy.clone(),
                    cancel: opts.cancel.clone(),
                },
            )?;
            let detail = format!(
                "{} package(s), {} script(s)",
                acquired.packages.len(),
                acquired.scripts.len()
            );
            Ok((acquired, detail))
        })?
    };

    let ctx = GenerationContext {
        config: &config,
        classes: &classes,
        assets: &assets,
        timestamp,
    };
    let with_first_boot = !opts.skips.first_boot && ctx.wants_first_boot();
    let mut bundle = ArtifactBundle::new();
    let mut generated = false;

    if opts.skips.autoinstall {
        runner.skip(Stage::GenerateAutoinstall, "skipped by flag");
    } else {
        runner.run(Stage::GenerateAutoinstall, || {
            let part = generate::autoinstall(&ctx, with_first_boot)?;
            let detail = format!("{} artifact(s)", part.len());
            bundle.merge(part)?;
            Ok(((), detail))
        })?;
        generated = true;
    }

    if opts.skips.installer_config {
        runner.skip(Stage::GenerateInstallerConfig, "skipped by flag");
    } else {
        runner.run(Stage::GenerateInstallerConfig, || {
            let part = generate::installer_config(&ctx)?;
            let detail = format!("{} artifact(s)", part.len());
            bundle.merge(part)?;
            Ok(((), detail))
        })?;
        generated = true;
    }

    if opts.skips.first_boot {
        runner.skip(Stage::GenerateFirstBoot, "skipped by flag");
    } else if !with_first_boot {
        runner.skip(
            Stage::GenerateFirstBoot,
            "first-boot disabled and no packages acquired",
        );
    } else {
        runner.run(Stage::GenerateFirstBoot, || {
            let part = generate::first_boot(&ctx)?;
            let detail = format!("{} artifact(s)", part.len());
            bundle.merge(part)?;
            Ok(((), detail))
        })?;
        generated = true;
    }

    if !generated {
        runner.skip(Stage::Publish, "no generation stage ran");
    } else {
        let keep_staging = opts.mode == SourcingMode::Debug;
        let (bundle_dir, digest, archive) = runner.run(Stage::Publish, || {
            let stale = clean_stale_staging(&opts.output_dir)?;
            if stale > 0 {
                debug!(count = stale, "removed stale staging directories");
            }
            let bundle_dir = bundle.publish(&opts.output_dir, keep_staging)?;
            let digest = bundle_digest(&bundle_dir)?;
            let archive = if opts.archive {
                let path = opts.output_dir.join(ARCHIVE_NAME);
                create_tar_zst(&bundle_dir, &path)?;
                info!(archive = %path.display(), "bundle archived");
                Some(path)
            } else {
                None
            };
            let detail = format!("{} artifact(s), sha256 {}", bundle.len(), digest);
            Ok(((bundle_dir, digest, archive), detail))
        })?;
        runner.log.bundle_digest = Some(digest.clone());
        products.bundle_dir = Some(bundle_dir);
        products.bundle_digest = Some(digest);
        products.archive = archive;
    }

    match (&opts.installer, &products.bundle_dir) {
        _ if opts.skips.installer => runner.skip(Stage::InvokeInstaller, "skipped by flag"),
        (None, _) => runner.skip(Stage::InvokeInstaller, "no installer requested"),
        (Some(_), None) => runner.skip(Stage::InvokeInstaller, "nothing was published"),
        (Some(program), Some(bundle_dir)) => {
            let iso_path = opts.output_dir.join(config.iso_filename());
            runner.run(Stage::InvokeInstaller, || {
                let resolved = preflight(program)?;
                run_installer(&resolved, bundle_dir, &iso_path, &opts.cancel)?;
                Ok(((), format!("{} -> {}", resolved.display(), iso_path.display())))
            })?;
            products.iso_path = Some(iso_path);
        }
    }

    Ok(products)
}

/// Build timestamp from `--timestamp`, then `SOURCE_DATE_EPOCH`, then now.
///
/// Accepted forms: unix seconds, RFC 3339, or compact `YYYYMMDDTHHMMSSZ`.
pub fn resolve_timestamp(
    explicit: Option<&str>,
    source_date_epoch: Option<&str>,
) -> Result<OffsetDateTime, ConfigValidationError> {
    if let Some(value) = explicit {
        return parse_timestamp(value)
            .ok_or_else(|| ConfigValidationError::single("timestamp", format!("cannot parse '{}'", value)));
    }
    if let Some(value) = source_date_epoch.filter(|v| !v.trim().is_empty()) {
        return value
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
            .ok_or_else(|| {
                ConfigValidationError::single(
                    "SOURCE_DATE_EPOCH",
                    format!("expected unix seconds, got '{}'", value),
                )
            });
    }
    Ok(OffsetDateTime::now_utc())
}

fn parse_timestamp(value: &str) -> Option<OffsetDateTime> {
    let value = value.trim();
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        return value
            .parse::<i64>()
            .ok()
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok());
    }
    if let Ok(at) = OffsetDateTime::parse(value, &Rfc3339) {
        return Some(at);
    }
    let compact = format_description!("[year][month][day]T[hour][minute][second]Z");
    PrimitiveDateTime::parse(value, compact)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}
