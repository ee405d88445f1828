//! In-memory artifact set and its atomic publication.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::error::{create_dir_all, BuildError, BuildResult, IoContext};
use crate::fsutil::{remove_dir_if_exists, set_mode};

/// Directory under the output root holding the published bundle.
pub const BUNDLE_DIR: &str = "bundle";
const STAGING_PREFIX: &str = ".staging-";
const OLD_PREFIX: &str = ".bundle-old-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Text(String),
    /// Copied from an acquired asset at publish time.
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub body: Body,
    pub mode: u32,
}

/// Generated artifacts keyed by bundle-relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactBundle {
    artifacts: BTreeMap<String, Artifact>,
}

impl ArtifactBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_text(&mut self, path: &str, text: String, mode: u32) -> BuildResult<()> {
        self.insert(path, Body::Text(text), mode)
    }

    pub fn add_file(&mut self, path: &str, src: &Path, mode: u32) -> BuildResult<()> {
        self.insert(path, Body::File(src.to_path_buf()), mode)
    }

    fn insert(&mut self, path: &str, body: Body, mode: u32) -> BuildResult<()> {
        if path.is_empty()
            || path.starts_with('/')
            || path.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(BuildError::TemplateResolution {
                artifact: path.to_string(),
                message: "artifact path must be relative and normalized".to_string(),
            });
        }
        if self.artifacts.contains_key(path) {
            return Err(BuildError::TemplateResolution {
                artifact: path.to_string(),
                message: "generated twice".to_string(),
            });
        }
        self.artifacts
            .insert(path.to_string(), Artifact { body, mode });
        Ok(())
    }

    /// Move every artifact of `other` into `self`; duplicate paths are an error.
    pub fn merge(&mut self, other: ArtifactBundle) -> BuildResult<()> {
        for (path, artifact) in other.artifacts {
            self.insert(&path, artifact.body, artifact.mode)?;
        }
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&Artifact> {
        self.artifacts.get(path)
    }

    pub fn text(&self, path: &str) -> Option<&str> {
        match self.artifacts.get(path).map(|a| &a.body) {
            Some(Body::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.artifacts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Write everything to a staging directory, then swap it in as
    /// `<output_dir>/bundle`.
    ///
    /// On failure the staging directory is removed (unless `keep_staging`)
    /// and the previously published bundle is left as it was.
    pub fn publish(&self, output_dir: &Path, keep_staging: bool) -> BuildResult<PathBuf> {
        create_dir_all(output_dir)?;
        let staging = output_dir.join(format!("{}{}", STAGING_PREFIX, unique_suffix()));
        let target = output_dir.join(BUNDLE_DIR);

        if let Err(err) = self.write_tree(&staging) {
            if keep_staging {
                warn!(staging = %staging.display(), "publish failed; staging kept for inspection");
            } else {
                discard_staging(&staging);
            }
            return Err(err);
        }

        // Two renames: a crash in between leaves only the old bundle, which
        // `clean_stale_staging` moves back on the next run.
        let old = output_dir.join(format!("{}{}", OLD_PREFIX, unique_suffix()));
        let had_previous = target.exists();
        if had_previous {
            fs::rename(&target, &old).io_context(|| {
                format!("moving previous bundle '{}' aside", target.display())
            })?;
        }
        if let Err(source) = fs::rename(&staging, &target) {
            if had_previous {
                if let Err(err) = fs::rename(&old, &target) {
                    warn!(
                        previous = %old.display(),
                        error = %err,
                        "could not move previous bundle back; the next build restores it"
                    );
                }
            }
            discard_staging(&staging);
            return Err(BuildError::io(
                format!("moving '{}' to '{}'", staging.display(), target.display()),
                source,
            ));
        }
        if had_previous {
            remove_dir_if_exists(&old)?;
        }
        info!(bundle = %target.display(), artifacts = self.len(), "bundle published");
        Ok(target)
    }

    fn write_tree(&self, root: &Path) -> BuildResult<()> {
        create_dir_all(root)?;
        set_mode(root, 0o755)?;
        for (rel, artifact) in &self.artifacts {
            let dest = root.join(rel);
            if let Some(parent) = dest.parent() {
                if !parent.exists() {
                    create_dir_all(parent)?;
                    set_dir_modes(root, parent)?;
                }
            }
            match &artifact.body {
                Body::Text(text) => {
                    fs::write(&dest, text).io_context(|| format!("writing '{}'", dest.display()))?
                }
                Body::File(src) => {
                    fs::copy(src, &dest).io_context(|| {
                        format!("copying '{}' to '{}'", src.display(), dest.display())
                    })?;
                }
            }
            set_mode(&dest, artifact.mode)?;
            debug!(path = %rel, "wrote artifact");
        }
        Ok(())
    }
}

fn discard_staging(staging: &Path) {
    if let Err(err) = fs::remove_dir_all(staging) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(staging = %staging.display(), error = %err, "could not remove staging directory");
        }
    }
}

/// Give every directory between `root` and `dir` a fixed mode so the tree
/// does not depend on the umask.
fn set_dir_modes(root: &Path, dir: &Path) -> BuildResult<()> {
    let mut cursor = Some(dir);
    while let Some(path) = cursor {
        if path == root {
            break;
        }
        set_mode(path, 0o755)?;
        cursor = path.parent();
    }
    Ok(())
}

fn unique_suffix() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{}-{}", std::process::id(), nanos)
}

/// Tidy the output directory after an interrupted run.
///
/// A run that stopped between the two publish renames leaves no `bundle/`
/// but an old bundle beside it; the newest such directory is moved back
/// into place. Staging directories and remaining old bundles are removed.
/// Returns how many directories were removed.
pub fn clean_stale_staging(output_dir: &Path) -> BuildResult<usize> {
    if !output_dir.is_dir() {
        return Ok(0);
    }
    let mut staging = Vec::new();
    let mut previous = Vec::new();
    for entry in fs::read_dir(output_dir)
        .io_context(|| format!("reading output directory '{}'", output_dir.display()))?
    {
        let entry =
            entry.io_context(|| format!("iterating output directory '{}'", output_dir.display()))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(STAGING_PREFIX) {
            staging.push(path);
        } else if name.starts_with(OLD_PREFIX) {
            previous.push(path);
        }
    }

    let target = output_dir.join(BUNDLE_DIR);
    if !target.exists() {
        previous.sort_by_key(|path| {
            let modified = fs::metadata(path).and_then(|m| m.modified()).ok();
            (modified, path.clone())
        });
        if let Some(newest) = previous.pop() {
            fs::rename(&newest, &target).io_context(|| {
                format!("restoring previous bundle '{}'", newest.display())
            })?;
            warn!(
                bundle = %target.display(),
                from = %newest.display(),
                "restored the bundle an interrupted run had moved aside"
            );
        }
    }

    let mut removed = 0;
    for path in staging.into_iter().chain(previous) {
        remove_dir_if_exists(&path)?;
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> ArtifactBundle {
        let mut bundle = ArtifactBundle::new();
        bundle
            .add_text("a/one.txt", "one\n".to_string(), 0o644)
            .unwrap();
        bundle
            .add_text("b/two.sh", "#!/bin/sh\n".to_string(), 0o755)
            .unwrap();
        bundle
    }

    #[test]
    fn duplicate_and_unsafe_paths_are_rejected() {
        let mut bundle = sample();
        assert!(bundle.add_text("a/one.txt", String::new(), 0o644).is_err());
        assert!(bundle.add_text("../escape", String::new(), 0o644).is_err());
        assert!(bundle.add_text("/abs", String::new(), 0o644).is_err());
        assert!(bundle.merge(sample()).is_err());
    }

    #[test]
    fn publish_replaces_previous_bundle() {
        let dir = TempDir::new().unwrap();
        let first = sample().publish(dir.path(), false).unwrap();
        assert_eq!(fs::read_to_string(first.join("a/one.txt")).unwrap(), "one\n");

        let mut second = ArtifactBundle::new();
        second
            .add_text("c/three.txt", "three\n".to_string(), 0o644)
            .unwrap();
        let target = second.publish(dir.path(), false).unwrap();
        assert!(!target.join("a/one.txt").exists());
        assert!(target.join("c/three.txt").is_file());

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(leftovers, vec![BUNDLE_DIR.to_string()]);
    }

    #[test]
    fn failed_publish_keeps_previous_bundle() {
        let dir = TempDir::new().unwrap();
        sample().publish(dir.path(), false).unwrap();

        let mut broken = ArtifactBundle::new();
        broken
            .add_text("fine.txt", "ok".to_string(), 0o644)
            .unwrap();
        broken
            .add_file("assets/missing.deb", &dir.path().join("nope.deb"), 0o644)
            .unwrap();
        assert!(broken.publish(dir.path(), false).is_err());

        let target = dir.path().join(BUNDLE_DIR);
        assert_eq!(fs::read_to_string(target.join("a/one.txt")).unwrap(), "one\n");
        assert!(!target.join("fine.txt").exists());
        assert_eq!(clean_stale_staging(dir.path()).unwrap(), 0);
    }

    #[test]
    fn interrupted_swap_restores_the_previous_bundle() {
        let dir = TempDir::new().unwrap();
        sample().publish(dir.path(), false).unwrap();

        // State after the first publish rename and before the second.
        let target = dir.path().join(BUNDLE_DIR);
        let aside = dir.path().join(format!("{}1-1", OLD_PREFIX));
        fs::rename(&target, &aside).unwrap();
        let staging = dir.path().join(format!("{}1-1", STAGING_PREFIX));
        fs::create_dir_all(staging.join("a")).unwrap();

        assert_eq!(clean_stale_staging(dir.path()).unwrap(), 1);
        assert_eq!(fs::read_to_string(target.join("a/one.txt")).unwrap(), "one\n");
        assert!(!aside.exists());
        assert!(!staging.exists());
    }

    #[test]
    fn old_bundles_beside_a_live_one_are_removed() {
        let dir = TempDir::new().unwrap();
        sample().publish(dir.path(), false).unwrap();
        let aside = dir.path().join(format!("{}1-1", OLD_PREFIX));
        fs::create_dir_all(aside.join("stale")).unwrap();

        assert_eq!(clean_stale_staging(dir.path()).unwrap(), 1);
        assert!(!aside.exists());
        assert!(dir.path().join(BUNDLE_DIR).join("b/two.sh").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn modes_are_applied() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let target = sample().publish(dir.path(), false).unwrap();
        let mode = fs::metadata(target.join("b/two.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
