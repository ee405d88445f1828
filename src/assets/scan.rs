//! Auto-discovery of assets under a local assets root.
//!
//! ```text
//! <root>/packages/*.deb
//! <root>/scripts/*.{sh,py,pl,rb}
//! <root>/iso/*.iso
//! <root>/manifest.json
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use super::digest::hash_file;
use crate::error::{BuildError, BuildResult, IoContext};
use crate::fsutil::{is_executable, relative_slash_path, write_json_atomic};

pub const MANIFEST_FILENAME: &str = "manifest.json";
const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Package,
    Script,
    Iso,
}

impl AssetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AssetKind::Package => "package",
            AssetKind::Script => "script",
            AssetKind::Iso => "iso",
        }
    }
}

struct Folder {
    name: &'static str,
    kind: AssetKind,
    extensions: &'static [&'static str],
}

const FOLDERS: &[Folder] = &[
    Folder {
        name: "packages",
        kind: AssetKind::Package,
        extensions: &["deb"],
    },
    Folder {
        name: "scripts",
        kind: AssetKind::Script,
        extensions: &["sh", "py", "pl", "rb"],
    },
    Folder {
        name: "iso",
        kind: AssetKind::Iso,
        extensions: &["iso"],
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub kind: AssetKind,
    pub size: u64,
    pub md5: String,
    pub sha256: String,
    pub executable: bool,
}

/// Relative path -> entry, persisted as JSON at `<root>/manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetManifest {
    pub version: u32,
    pub entries: BTreeMap<String, ManifestEntry>,
}

impl Default for AssetManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

impl AssetManifest {
    pub fn default_path(root: &Path) -> PathBuf {
        root.join(MANIFEST_FILENAME)
    }

    pub fn load(path: &Path) -> BuildResult<Self> {
        let bytes =
            fs::read(path).io_context(|| format!("reading asset manifest '{}'", path.display()))?;
        serde_json::from_slice(&bytes).map_err(|source| BuildError::Json {
            context: format!("parsing asset manifest '{}'", path.display()),
            source,
        })
    }

    /// `Ok(None)` when no manifest has been written yet.
    pub fn load_if_exists(path: &Path) -> BuildResult<Option<Self>> {
        if path.is_file() {
            Self::load(path).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn save(&self, path: &Path) -> BuildResult<()> {
        write_json_atomic(path, self)
    }
}

/// Walk the assets root and hash every recognised file.
pub fn scan(root: &Path) -> BuildResult<AssetManifest> {
    let mut manifest = AssetManifest::default();
    for folder in FOLDERS {
        let dir = root.join(folder.name);
        if !dir.is_dir() {
            continue;
        }
        for ent in WalkDir::new(&dir).min_depth(1).sort_by_file_name() {
            let ent = ent.map_err(|e| {
                let context = format!("walking '{}'", dir.display());
                match e.into_io_error() {
                    Some(source) => BuildError::io(context, source),
                    None => BuildError::io(context, std::io::Error::other("filesystem loop")),
                }
            })?;
            if !ent.file_type().is_file() || !has_extension(ent.path(), folder.extensions) {
                continue;
            }
            let metadata = ent
                .metadata()
                .map_err(|e| BuildError::io(format!("stat '{}'", ent.path().display()), e.into()))?;
            let digests = hash_file(ent.path())?;
            let rel = relative_slash_path(root, ent.path());
            debug!(path = %rel, sha256 = %digests.sha256, "scanned asset");
            manifest.entries.insert(
                rel,
                ManifestEntry {
                    kind: folder.kind,
                    size: digests.size,
                    md5: digests.md5,
                    sha256: digests.sha256,
                    executable: is_executable(&metadata),
                },
            );
        }
    }
    Ok(manifest)
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Unchanged,
    Modified,
    Missing,
    New,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Unchanged => "unchanged",
            EntryStatus::Modified => "modified",
            EntryStatus::Missing => "missing",
            EntryStatus::New => "new",
        }
    }
}

/// Per-path comparison of a persisted manifest against the live tree.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ManifestDiff {
    pub entries: BTreeMap<String, EntryStatus>,
}

impl ManifestDiff {
    pub fn between(recorded: &AssetManifest, live: &AssetManifest) -> Self {
        let mut entries = BTreeMap::new();
        for (path, old) in &recorded.entries {
            let status = match live.entries.get(path) {
                None => EntryStatus::Missing,
                Some(new) if new.sha256 == old.sha256 && new.md5 == old.md5 && new.size == old.size => {
                    EntryStatus::Unchanged
                }
                Some(_) => EntryStatus::Modified,
            };
            entries.insert(path.clone(), status);
        }
        for path in live.entries.keys() {
            entries.entry(path.clone()).or_insert(EntryStatus::New);
        }
        Self { entries }
    }

    pub fn is_clean(&self) -> bool {
        self.entries.values().all(|s| *s == EntryStatus::Unchanged)
    }

    pub fn count(&self, status: EntryStatus) -> usize {
        self.entries.values().filter(|s| **s == status).count()
    }

    /// Paths whose status is anything but unchanged.
    pub fn changes(&self) -> impl Iterator<Item = (&String, EntryStatus)> {
        self.entries
            .iter()
            .filter(|(_, s)| **s != EntryStatus::Unchanged)
            .map(|(p, s)| (p, *s))
    }
}

/// Re-scan `root` and compare against `recorded`.
pub fn verify(root: &Path, recorded: &AssetManifest) -> BuildResult<ManifestDiff> {
    let live = scan(root)?;
    Ok(ManifestDiff::between(recorded, &live))
}
