//! Asset acquisition.
//!
//! Every deb package and first-boot script referenced by the configuration
//! (plus, in auto-scan mode, whatever sits under the assets root) is turned
//! into an [`AcquiredAsset`]: a verified local file with known digests.
//! Remote assets land in the [`AssetCache`]; local assets are copied into
//! the build's work area.
//!
//! Jobs run on a bounded pool. The first hard failure stops the stage and
//! names the failing asset; in-flight downloads are dropped together with
//! their staging files.

pub mod digest;
pub mod fetch;
mod local;
pub mod scan;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::cache::AssetCache;
use crate::cancel::CancelFlag;
use crate::config::{AssetReference, BuildConfiguration, ScriptType};
use crate::error::{BuildError, BuildResult, IoContext};
use crate::fsutil::recreate_dir;

pub use digest::Digests;
pub use fetch::FetchPolicy;
pub use scan::{AssetKind, AssetManifest, EntryStatus, ManifestDiff, ManifestEntry};

/// Where assets come from for this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SourcingMode {
    /// Fetch remote references (cache hits skip the network), copy local ones.
    #[default]
    Remote,
    /// Offline: remote references must already be cached.
    Local,
    /// Like `remote`, plus everything discovered under the assets root.
    AutoScan,
    /// Like `remote`, with verbose logging and failed staging kept around.
    Debug,
}

impl SourcingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SourcingMode::Remote => "remote",
            SourcingMode::Local => "local",
            SourcingMode::AutoScan => "auto-scan",
            SourcingMode::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetRole {
    Package,
    Script(ScriptType),
}

/// A verified, locally available asset.
#[derive(Debug, Clone)]
pub struct AcquiredAsset {
    pub name: String,
    pub role: AssetRole,
    /// URL or path the asset was declared with.
    pub source: String,
    /// File name the asset carries into the bundle.
    pub file_name: String,
    pub path: PathBuf,
    pub digests: Digests,
    pub executable: bool,
}

/// Acquisition results in declaration order.
#[derive(Debug, Clone, Default)]
pub struct AcquiredAssets {
    pub packages: Vec<AcquiredAsset>,
    pub scripts: Vec<AcquiredAsset>,
    /// Drift against the previous manifest, in auto-scan mode.
    pub manifest_diff: Option<ManifestDiff>,
}

impl AcquiredAssets {
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty() && self.scripts.is_empty()
    }

    pub fn scripts_of(&self, kind: ScriptType) -> impl Iterator<Item = &AcquiredAsset> {
        self.scripts
            .iter()
            .filter(move |a| a.role == AssetRole::Script(kind))
    }
}

pub struct AcquireOptions<'a> {
    pub cache: &'a AssetCache,
    /// Scratch area for local copies; recreated on every run.
    pub work_dir: &'a Path,
    /// Relative `local_path` values resolve against this directory.
    pub base_dir: &'a Path,
    pub assets_root: Option<&'a Path>,
    pub mode: SourcingMode,
    pub concurrency: usize,
    pub policy: FetchPolicy,
    pub cancel: CancelFlag,
}

#[derive(Debug, Clone)]
struct Job {
    index: usize,
    name: String,
    role: AssetRole,
    reference: AssetReference,
}

/// Resolve every asset the configuration needs.
pub fn acquire(config: &BuildConfiguration, opts: &AcquireOptions<'_>) -> BuildResult<AcquiredAssets> {
    opts.cancel.check()?;
    let assets_dir = opts.work_dir.join("assets");
    recreate_dir(&assets_dir)?;

    let mut jobs = configured_jobs(config, opts.base_dir);
    let mut manifest_diff = None;
    if opts.mode == SourcingMode::AutoScan {
        let root = opts.assets_root.ok_or_else(|| BuildError::NotFound {
            asset: "<assets root>".to_string(),
            path: "(auto-scan needs --assets-root)".to_string(),
        })?;
        let (discovered, diff) = discover(config, root, &jobs)?;
        jobs.extend(discovered);
        manifest_diff = diff;
    }
    for (index, job) in jobs.iter_mut().enumerate() {
        job.index = index;
    }

    if jobs.is_empty() {
        info!("no assets to acquire");
        return Ok(AcquiredAssets {
            manifest_diff,
            ..AcquiredAssets::default()
        });
    }
    info!(
        count = jobs.len(),
        mode = opts.mode.as_str(),
        concurrency = opts.concurrency,
        "acquiring assets"
    );

    let client = opts.policy.client()?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .io_context(|| "starting asset runtime")?;
    let mut done = rt.block_on(run_jobs(jobs, &client, opts, &assets_dir))?;
    done.sort_by_key(|(index, _)| *index);

    let mut out = AcquiredAssets {
        manifest_diff,
        ..AcquiredAssets::default()
    };
    for (_, asset) in done {
        match asset.role {
            AssetRole::Package => out.packages.push(asset),
            AssetRole::Script(_) => out.scripts.push(asset),
        }
    }
    Ok(out)
}

async fn run_jobs(
    jobs: Vec<Job>,
    client: &reqwest::Client,
    opts: &AcquireOptions<'_>,
    assets_dir: &Path,
) -> BuildResult<Vec<(usize, AcquiredAsset)>> {
    let concurrency = opts.concurrency.max(1);
    let mut results = stream::iter(jobs)
        .map(|job| async move {
            let index = job.index;
            run_job(job, client, opts, assets_dir)
                .await
                .map(|asset| (index, asset))
        })
        .buffer_unordered(concurrency);

    let mut done = Vec::new();
    while let Some(result) = results.next().await {
        // Returning here drops the stream and every in-flight job with it.
        let item = result?;
        opts.cancel.check()?;
        done.push(item);
    }
    Ok(done)
}

async fn run_job(
    job: Job,
    client: &reqwest::Client,
    opts: &AcquireOptions<'_>,
    assets_dir: &Path,
) -> BuildResult<AcquiredAsset> {
    opts.cancel.check()?;
    let file_name = job
        .reference
        .file_name()
        .unwrap_or_else(|| job.name.clone());
    debug!(asset = %job.name, source = %job.reference.source(), "resolving");

    match &job.reference {
        AssetReference::Remote { url, checksum } => {
            let hit = if opts.mode == SourcingMode::Local {
                offline_lookup(opts.cache, &job.name, url, checksum.as_deref())?
            } else {
                fetch::fetch_remote(
                    client,
                    opts.cache,
                    &job.name,
                    url,
                    checksum.as_deref(),
                    &opts.policy,
                    &opts.cancel,
                )
                .await?
            };
            Ok(AcquiredAsset {
                executable: matches!(job.role, AssetRole::Script(_)),
                name: job.name,
                role: job.role,
                source: url.clone(),
                file_name,
                path: hit.path,
                digests: hit.digests,
            })
        }
        AssetReference::Local { path, checksum } => {
            let subdir = match job.role {
                AssetRole::Package => "packages",
                AssetRole::Script(_) => "scripts",
            };
            let dest = assets_dir
                .join(subdir)
                .join(format!("{:03}-{}", job.index, file_name));
            let name = job.name.clone();
            let src = path.clone();
            let expected = checksum.clone();
            let keep_exec = matches!(job.role, AssetRole::Script(_));
            let dest_for_copy = dest.clone();
            let (digests, executable) = tokio::task::spawn_blocking(move || {
                local::copy_local(&name, &src, &dest_for_copy, expected.as_deref(), keep_exec)
            })
            .await
            .map_err(|e| BuildError::io(format!("copying '{}'", job.name), std::io::Error::other(e)))??;
            Ok(AcquiredAsset {
                name: job.name,
                role: job.role,
                source: path.display().to_string(),
                file_name,
                path: dest,
                digests,
                executable,
            })
        }
    }
}

fn offline_lookup(
    cache: &AssetCache,
    asset: &str,
    url: &str,
    checksum: Option<&str>,
) -> BuildResult<crate::cache::CacheHit> {
    let hit = match checksum {
        Some(sum) => cache.get(sum)?,
        None => cache.lookup_remote(url)?,
    };
    hit.ok_or_else(|| BuildError::NotFound {
        asset: asset.to_string(),
        path: format!("{} (offline; not in cache)", url),
    })
}

fn configured_jobs(config: &BuildConfiguration, base_dir: &Path) -> Vec<Job> {
    let resolve = |reference: &AssetReference| match reference {
        AssetReference::Local { path, checksum } if path.is_relative() => AssetReference::Local {
            path: base_dir.join(path),
            checksum: checksum.clone(),
        },
        other => other.clone(),
    };
    let packages = config.packages.debs.iter().map(|deb| Job {
        index: 0,
        name: deb.name.clone(),
        role: AssetRole::Package,
        reference: resolve(&deb.source),
    });
    let scripts = config.active_scripts().iter().map(|script| Job {
        index: 0,
        name: script.name.clone(),
        role: AssetRole::Script(script.kind),
        reference: resolve(&script.source),
    });
    packages.chain(scripts).collect()
}

/// Scan the assets root, persist the fresh manifest and turn unclaimed
/// files into jobs.
fn discover(
    config: &BuildConfiguration,
    root: &Path,
    configured: &[Job],
) -> BuildResult<(Vec<Job>, Option<ManifestDiff>)> {
    let manifest_path = AssetManifest::default_path(root);
    let previous = AssetManifest::load_if_exists(&manifest_path)?;
    let manifest = scan::scan(root)?;

    let diff = previous.map(|prev| ManifestDiff::between(&prev, &manifest));
    if let Some(diff) = &diff {
        for (path, status) in diff.changes() {
            warn!(path = %path, status = ?status, "asset changed since last scan");
        }
    }
    manifest.save(&manifest_path)?;

    let claimed_paths: Vec<PathBuf> = configured
        .iter()
        .filter_map(|job| match &job.reference {
            AssetReference::Local { path, .. } => Some(path.clone()),
            AssetReference::Remote { .. } => None,
        })
        .collect();
    let claimed_names: Vec<&str> = configured.iter().map(|j| j.name.as_str()).collect();
    // Packages are staged under their file name, so two with the same name
    // cannot both go into the bundle.
    let mut package_files: HashSet<String> = configured
        .iter()
        .filter(|job| job.role == AssetRole::Package)
        .filter_map(|job| job.reference.file_name())
        .collect();

    let mut jobs = Vec::new();
    for (rel, entry) in &manifest.entries {
        let path = root.join(rel);
        if claimed_paths.iter().any(|p| p == &path) {
            continue;
        }
        let role = match entry.kind {
            AssetKind::Package => AssetRole::Package,
            AssetKind::Script if config.first_boot.enabled => {
                AssetRole::Script(ScriptType::Automated)
            }
            AssetKind::Script | AssetKind::Iso => continue,
        };
        let file_name = rel.rsplit('/').next().unwrap_or(rel).to_string();
        let name = match role {
            AssetRole::Package => file_name.trim_end_matches(".deb").to_string(),
            AssetRole::Script(_) => file_name.clone(),
        };
        if claimed_names.contains(&name.as_str()) {
            debug!(name = %name, "discovered asset shadowed by configured one");
            continue;
        }
        if role == AssetRole::Package && !package_files.insert(file_name.clone()) {
            warn!(path = %rel, "discovered package shares its file name with another; skipped");
            continue;
        }
        info!(path = %rel, "discovered asset");
        jobs.push(Job {
            index: 0,
            name,
            role,
            reference: AssetReference::Local {
                path,
                checksum: Some(entry.sha256.clone()),
            },
        });
    }
    Ok((jobs, diff))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::set_mode;
    use std::fs;
    use tempfile::TempDir;

    const BASE: &str = r#"
        [encryption]
        enabled = false
        [user]
        username = "ada"
        password = "s3cret-pass"
    "#;

    struct Env {
        dir: TempDir,
        cache: AssetCache,
    }

    impl Env {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let cache = AssetCache::open(&dir.path().join("cache")).unwrap();
            Self { dir, cache }
        }

        fn options(&self, mode: SourcingMode) -> AcquireOptions<'_> {
            AcquireOptions {
                cache: &self.cache,
                work_dir: self.dir.path(),
                base_dir: self.dir.path(),
                assets_root: None,
                mode,
                concurrency: 2,
                policy: FetchPolicy::default(),
                cancel: CancelFlag::new(),
            }
        }
    }

    #[test]
    fn local_assets_keep_declaration_order() {
        let env = Env::new();
        fs::write(env.dir.path().join("b.deb"), b"b").unwrap();
        fs::write(env.dir.path().join("a.deb"), b"a").unwrap();
        fs::write(env.dir.path().join("one.sh"), b"#!/bin/sh\n").unwrap();
        let config = BuildConfiguration::from_toml_str(&format!(
            r#"{BASE}
            [[packages.debs]]
            local_path = "b.deb"
            [[packages.debs]]
            local_path = "a.deb"
            [[first_boot.scripts]]
            local_path = "one.sh"
            "#
        ))
        .unwrap();

        let acquired = acquire(&config, &env.options(SourcingMode::Remote)).unwrap();
        let names: Vec<_> = acquired.packages.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(acquired.scripts.len(), 1);
        assert_eq!(acquired.scripts[0].file_name, "one.sh");
        assert!(acquired.scripts[0].path.starts_with(env.dir.path().join("assets/scripts")));
    }

    #[test]
    fn missing_local_asset_names_the_asset() {
        let env = Env::new();
        let config = BuildConfiguration::from_toml_str(&format!(
            "{BASE}\n[[packages.debs]]\nname = \"ghost\"\nlocal_path = \"ghost.deb\"\n"
        ))
        .unwrap();
        let err = acquire(&config, &env.options(SourcingMode::Remote)).unwrap_err();
        match err {
            BuildError::NotFound { asset, .. } => assert_eq!(asset, "ghost"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn offline_mode_serves_remote_refs_from_cache_only() {
        let env = Env::new();
        let src = env.dir.path().join("seed.deb");
        fs::write(&src, b"cached deb").unwrap();
        let hit = env.cache.admit_file(&src).unwrap();

        let cached = BuildConfiguration::from_toml_str(&format!(
            "{BASE}\n[[packages.debs]]\nurl = \"http://127.0.0.1:9/x.deb\"\nchecksum = \"{}\"\n",
            hit.digests.sha256
        ))
        .unwrap();
        let acquired = acquire(&cached, &env.options(SourcingMode::Local)).unwrap();
        assert_eq!(acquired.packages[0].digests, hit.digests);

        let uncached = BuildConfiguration::from_toml_str(&format!(
            "{BASE}\n[[packages.debs]]\nurl = \"http://127.0.0.1:9/y.deb\"\n"
        ))
        .unwrap();
        let err = acquire(&uncached, &env.options(SourcingMode::Local)).unwrap_err();
        assert!(matches!(err, BuildError::NotFound { .. }));
    }

    #[test]
    fn auto_scan_adds_unclaimed_assets_and_writes_manifest() {
        let env = Env::new();
        let root = env.dir.path().join("local_assets");
        fs::create_dir_all(root.join("packages")).unwrap();
        fs::create_dir_all(root.join("scripts")).unwrap();
        fs::write(root.join("packages/found_1.0_all.deb"), b"deb").unwrap();
        fs::write(root.join("scripts/10-setup.sh"), b"#!/bin/sh\n").unwrap();
        set_mode(&root.join("scripts/10-setup.sh"), 0o755).unwrap();

        let config = BuildConfiguration::from_toml_str(BASE).unwrap();
        let mut opts = env.options(SourcingMode::AutoScan);
        opts.assets_root = Some(&root);
        let acquired = acquire(&config, &opts).unwrap();

        assert_eq!(acquired.packages[0].name, "found_1.0_all");
        assert_eq!(acquired.scripts[0].role, AssetRole::Script(ScriptType::Automated));
        assert!(acquired.scripts[0].executable);
        assert!(root.join("manifest.json").is_file());
        assert!(acquired.manifest_diff.is_none());

        let again = acquire(&config, &opts).unwrap();
        assert!(again.manifest_diff.unwrap().is_clean());
    }

    #[test]
    fn auto_scan_skips_packages_whose_file_name_is_taken() {
        let env = Env::new();
        let root = env.dir.path().join("local_assets");
        fs::create_dir_all(root.join("packages")).unwrap();
        fs::write(root.join("packages/tool_1.0_amd64.deb"), b"discovered").unwrap();
        fs::create_dir_all(env.dir.path().join("vendor")).unwrap();
        fs::write(env.dir.path().join("vendor/tool_1.0_amd64.deb"), b"configured").unwrap();

        let config = BuildConfiguration::from_toml_str(&format!(
            "{BASE}\n[[packages.debs]]\nname = \"vendor-tool\"\nlocal_path = \"vendor/tool_1.0_amd64.deb\"\n"
        ))
        .unwrap();
        let mut opts = env.options(SourcingMode::AutoScan);
        opts.assets_root = Some(&root);
        let acquired = acquire(&config, &opts).unwrap();

        let names: Vec<_> = acquired.packages.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["vendor-tool"]);
    }

    #[test]
    fn cancelled_flag_stops_before_any_work() {
        let env = Env::new();
        let config = BuildConfiguration::from_toml_str(BASE).unwrap();
        let opts = env.options(SourcingMode::Remote);
        opts.cancel.cancel();
        assert!(matches!(acquire(&config, &opts), Err(BuildError::Cancelled)));
    }
}
