//! autoinstall-builder - installer artifact builder.
//!
//! Reads a build configuration, resolves classes, acquires assets and
//! publishes the autoinstall / FAI / first-boot bundle.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use autoinstall_builder::assets::{scan, AssetManifest, EntryStatus, FetchPolicy, SourcingMode};
use autoinstall_builder::cache::AssetCache;
use autoinstall_builder::classes::{category_of, Category};
use autoinstall_builder::config::recommendations;
use autoinstall_builder::pipeline::{resolve_timestamp, run_build, BuildOptions, StageSkips};
use autoinstall_builder::preflight::DEFAULT_INSTALLER;
use autoinstall_builder::settings::Settings;
use autoinstall_builder::{resolve_classes, BuildConfiguration, BuildError, CancelFlag};

#[derive(Parser)]
#[command(name = "autoinstall-builder")]
#[command(about = "Build verified Ubuntu autoinstall and FAI installer artifacts")]
#[command(
    after_help = "QUICK START:\n  autoinstall-builder validate build.toml   Check a configuration\n  autoinstall-builder build build.toml      Build the bundle\n  autoinstall-builder cache status          Inspect the asset cache"
)]
struct Cli {
    /// Verbose logging (RUST_LOG still wins)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline
    Build(BuildArgs),

    /// Validate a configuration and print its summary
    Validate {
        config: PathBuf,
    },

    /// Print the resolved class tags, one per line
    Classes {
        config: PathBuf,
        /// Also print the rule category that produced each tag
        #[arg(long)]
        categories: bool,
    },

    /// Scan the local assets root, or verify it against a manifest
    Scan {
        /// Assets root (default: AUTOINSTALL_ASSETS_ROOT or local_assets)
        #[arg(long)]
        assets_root: Option<PathBuf>,
        /// Write <assets-root>/manifest.json
        #[arg(long)]
        save: bool,
        /// Compare live files against this manifest
        #[arg(long, value_name = "MANIFEST", conflicts_with = "save")]
        verify: Option<PathBuf>,
    },

    /// Inspect or prune the asset cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
        #[arg(long, global = true)]
        cache_dir: Option<PathBuf>,
    },

    /// Print effective tool settings
    Settings,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Entry counts and sizes
    Status,
    /// Remove blobs no URL index entry points at
    Gc,
}

#[derive(clap::Args)]
struct BuildArgs {
    /// Build configuration (TOML, or JSON with a .json extension)
    config: PathBuf,

    /// Where assets come from
    #[arg(long, value_enum, default_value_t = SourcingMode::Remote)]
    mode: SourcingMode,

    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    #[arg(long)]
    assets_root: Option<PathBuf>,
    /// Parallel asset jobs
    #[arg(long)]
    concurrency: Option<usize>,
    /// Installer program (default: AUTOINSTALL_INSTALLER or fai-cd)
    #[arg(long)]
    installer: Option<String>,
    /// Fixed build timestamp: unix seconds, RFC 3339 or YYYYMMDDTHHMMSSZ
    #[arg(long)]
    timestamp: Option<String>,
    /// Also write bundle.tar.zst
    #[arg(long)]
    archive: bool,

    #[arg(long)]
    skip_acquire: bool,
    #[arg(long)]
    skip_autoinstall: bool,
    #[arg(long)]
    skip_installer_config: bool,
    #[arg(long)]
    skip_first_boot: bool,
    #[arg(long)]
    skip_installer: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load .env if present
    dotenvy::dotenv().ok();

    let verbose = cli.debug
        || matches!(&cli.command, Commands::Build(args) if args.mode == SourcingMode::Debug);
    init_tracing(verbose);

    match dispatch(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            let code = err
                .downcast_ref::<BuildError>()
                .map(BuildError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn dispatch(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Build(args) => cmd_build(args),
        Commands::Validate { config } => cmd_validate(&config),
        Commands::Classes { config, categories } => cmd_classes(&config, categories),
        Commands::Scan {
            assets_root,
            save,
            verify,
        } => cmd_scan(assets_root, save, verify.as_deref()),
        Commands::Cache { action, cache_dir } => cmd_cache(action, cache_dir),
        Commands::Settings => {
            settings()?.print();
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn cmd_build(args: BuildArgs) -> Result<ExitCode> {
    let settings = settings()?;
    let source_date_epoch = std::env::var("SOURCE_DATE_EPOCH").ok();
    let timestamp = resolve_timestamp(args.timestamp.as_deref(), source_date_epoch.as_deref())
        .map_err(BuildError::from)?;

    let cancel = CancelFlag::new();
    spawn_interrupt_watcher(cancel.clone());

    let opts = BuildOptions {
        config_path: args.config.clone(),
        output_dir: args.output_dir.unwrap_or(settings.output_dir),
        cache_dir: args.cache_dir.unwrap_or(settings.cache_dir),
        assets_root: Some(args.assets_root.unwrap_or(settings.assets_root)),
        mode: args.mode,
        concurrency: args.concurrency.unwrap_or(settings.concurrency).max(1),
        fetch_policy: FetchPolicy {
            attempts: settings.fetch_attempts,
            ..FetchPolicy::default()
        },
        skips: StageSkips {
            acquire: args.skip_acquire,
            autoinstall: args.skip_autoinstall,
            installer_config: args.skip_installer_config,
            first_boot: args.skip_first_boot,
            installer: args.skip_installer,
        },
        timestamp,
        archive: args.archive,
        installer: Some(
            args.installer
                .or(settings.installer)
                .unwrap_or_else(|| DEFAULT_INSTALLER.to_string()),
        ),
        cancel,
    };

    let report = run_build(&opts)
        .with_context(|| format!("building from '{}'", args.config.display()))?;

    println!("[build] classes: {}", report.classes);
    for record in &report.log.stages {
        println!(
            "[build] {:<26} {}",
            record.stage.as_str(),
            record.status.as_str()
        );
    }
    if let Some(dir) = &report.bundle_dir {
        println!("[build] bundle: {}", dir.display());
    }
    if let Some(digest) = &report.bundle_digest {
        println!("[build] bundle sha256: {}", digest);
    }
    if let Some(archive) = &report.archive {
        println!("[build] archive: {}", archive.display());
    }
    if let Some(iso) = &report.iso_path {
        println!("[build] iso: {}", iso.display());
    }
    println!("[build] log: {}", report.log_path.display());
    Ok(ExitCode::SUCCESS)
}

/// Set `cancel` on Ctrl-C. The watcher owns a small runtime on its own
/// thread so the synchronous pipeline never has to poll for signals.
fn spawn_interrupt_watcher(cancel: CancelFlag) {
    let spawned = std::thread::Builder::new()
        .name("interrupt".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    warn!("cannot watch for interrupts: {}", err);
                    return;
                }
            };
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current step");
                    cancel.cancel();
                }
            });
        });
    if let Err(err) = spawned {
        warn!("cannot watch for interrupts: {}", err);
    }
}

fn settings() -> Result<Settings> {
    Ok(Settings::from_env().map_err(BuildError::from)?)
}

fn load_config(path: &Path) -> Result<BuildConfiguration> {
    BuildConfiguration::load(path).with_context(|| format!("loading '{}'", path.display()))
}

fn cmd_validate(path: &Path) -> Result<ExitCode> {
    let config = load_config(path)?;
    let classes = resolve_classes(&config);
    let mut summary = config.summary();
    summary["classes"] = serde_json::json!(classes.as_slice());
    println!("{}", serde_json::to_string_pretty(&summary)?);
    for advice in recommendations(&config) {
        println!("recommendation: {}", advice);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_classes(path: &Path, categories: bool) -> Result<ExitCode> {
    let config = load_config(path)?;
    for tag in resolve_classes(&config).iter() {
        if categories {
            let category = category_of(&config, tag).map_or("-", Category::as_str);
            println!("{:<24} {}", tag, category);
        } else {
            println!("{}", tag);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_scan(assets_root: Option<PathBuf>, save: bool, verify: Option<&Path>) -> Result<ExitCode> {
    let root = match assets_root {
        Some(root) => root,
        None => settings()?.assets_root,
    };

    if let Some(manifest_path) = verify {
        let recorded = AssetManifest::load(manifest_path)?;
        let diff = scan::verify(&root, &recorded)?;
        for (path, status) in diff.changes() {
            println!("{:<10} {}", status.as_str(), path);
        }
        println!(
            "[scan] unchanged={} modified={} missing={} new={}",
            diff.count(EntryStatus::Unchanged),
            diff.count(EntryStatus::Modified),
            diff.count(EntryStatus::Missing),
            diff.count(EntryStatus::New)
        );
        return Ok(if diff.is_clean() {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(1)
        });
    }

    let manifest = scan::scan(&root)?;
    for (path, entry) in &manifest.entries {
        println!(
            "{:<8} {:>10} {} {}",
            entry.kind.as_str(),
            entry.size,
            entry.sha256,
            path
        );
    }
    if save {
        let path = AssetManifest::default_path(&root);
        manifest.save(&path)?;
        println!("[scan] manifest written to {}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_cache(action: CacheAction, cache_dir: Option<PathBuf>) -> Result<ExitCode> {
    let root = match cache_dir {
        Some(dir) => dir,
        None => settings()?.cache_dir,
    };
    let cache = AssetCache::open(&root)?;
    match action {
        CacheAction::Status => {
            let status = cache.status()?;
            println!("Cache: {}", status.root.display());
            println!("  blobs: {} ({} bytes)", status.blobs, status.blob_bytes);
            println!("  indexed urls: {}", status.indexed_urls);
        }
        CacheAction::Gc => {
            let removed = cache.gc()?;
            println!("[cache] removed {} unreferenced blob(s)", removed);
        }
    }
    Ok(ExitCode::SUCCESS)
}
