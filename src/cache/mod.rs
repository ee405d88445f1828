//! Content-addressed asset cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! blobs/sha256/<2-char prefix>/<sha256>   verified asset bytes
//! index/remote/<sha256(url)>.json          url -> blob mapping
//! tmp/                                     download staging
//! locks/<sha256>.lock                      per-key writer lock
//! locks/cache.lock                         shared by builds, exclusive for gc
//! ```
//!
//! Entries only ever appear through a rename out of `tmp/` after the
//! content has been hashed, so an interrupted build never leaves a partial
//! blob behind. Blobs are re-hashed on every read.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::assets::digest::{hash_file, is_hex_64, sha256_hex, Digests};
use crate::error::{create_dir_all, BuildError, BuildResult, IoContext};

/// Directory name under the user cache dir.
pub const DEFAULT_CACHE_DIR_NAME: &str = "autoinstall-builder";

/// Record of a previous remote fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIndexEntry {
    pub url: String,
    pub sha256: String,
    pub md5: String,
    pub size_bytes: u64,
    pub stored_at_unix: i64,
}

/// A verified blob.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub path: PathBuf,
    pub digests: Digests,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatus {
    pub root: PathBuf,
    pub blobs: u64,
    pub blob_bytes: u64,
    pub indexed_urls: u64,
}

#[derive(Debug, Clone)]
pub struct AssetCache {
    root: PathBuf,
}

impl AssetCache {
    /// Open (and create if needed) the cache at `root`.
    pub fn open(root: &Path) -> BuildResult<Self> {
        let cache = Self {
            root: root.to_path_buf(),
        };
        cache.ensure_layout()?;
        Ok(cache)
    }

    /// `$XDG_CACHE_HOME/autoinstall-builder`, or `.cache/autoinstall-builder`
    /// when the platform has no cache directory.
    pub fn default_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from(".cache"))
            .join(DEFAULT_CACHE_DIR_NAME)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_layout(&self) -> BuildResult<()> {
        create_dir_all(&self.blobs_dir())?;
        create_dir_all(&self.remote_index_dir())?;
        create_dir_all(&self.tmp_dir())?;
        create_dir_all(&self.locks_dir())?;
        Ok(())
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    fn remote_index_dir(&self) -> PathBuf {
        self.root.join("index").join("remote")
    }

    /// Staging area for in-flight downloads. Same filesystem as the blobs.
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn blob_path(&self, sha256: &str) -> BuildResult<PathBuf> {
        if !is_hex_64(sha256) {
            return Err(BuildError::io(
                "resolving cache blob",
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid sha256 '{}'", sha256),
                ),
            ));
        }
        Ok(self.blobs_dir().join(&sha256[..2]).join(sha256))
    }

    fn remote_index_path(&self, url: &str) -> PathBuf {
        self.remote_index_dir()
            .join(format!("{}.json", sha256_hex(url.as_bytes())))
    }

    pub fn contains(&self, sha256: &str) -> bool {
        self.blob_path(sha256).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Look up a blob and verify it still hashes to its key.
    ///
    /// A corrupted blob is removed and reported as a miss.
    pub fn get(&self, sha256: &str) -> BuildResult<Option<CacheHit>> {
        let path = self.blob_path(sha256)?;
        if !path.is_file() {
            return Ok(None);
        }
        let digests = hash_file(&path)?;
        if digests.sha256 != sha256 {
            warn!(
                blob = %path.display(),
                actual = %digests.sha256,
                "cache blob does not match its key; discarding"
            );
            let _lock = self.acquire_lock(sha256)?;
            fs::remove_file(&path)
                .io_context(|| format!("removing corrupted blob '{}'", path.display()))?;
            return Ok(None);
        }
        Ok(Some(CacheHit { path, digests }))
    }

    /// Cache entry for a URL fetched by an earlier build.
    pub fn lookup_remote(&self, url: &str) -> BuildResult<Option<CacheHit>> {
        let index_path = self.remote_index_path(url);
        if !index_path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&index_path)
            .io_context(|| format!("reading cache index '{}'", index_path.display()))?;
        let entry: RemoteIndexEntry =
            serde_json::from_slice(&bytes).map_err(|source| BuildError::Json {
                context: format!("parsing cache index '{}'", index_path.display()),
                source,
            })?;
        if entry.url != url {
            return Ok(None);
        }
        self.get(&entry.sha256)
    }

    /// Move a verified staging file into the cache under its sha256.
    ///
    /// If the blob already exists the staged copy is discarded; identical
    /// key means identical content.
    pub fn admit(&self, staged: NamedTempFile, digests: &Digests) -> BuildResult<PathBuf> {
        let blob_path = self.blob_path(&digests.sha256)?;
        let _lock = self.acquire_lock(&digests.sha256)?;

        if blob_path.is_file() {
            debug!(sha256 = %digests.sha256, "blob already cached");
            return Ok(blob_path);
        }
        if let Some(parent) = blob_path.parent() {
            create_dir_all(parent)?;
        }
        staged.persist(&blob_path).map_err(|e| {
            BuildError::io(
                format!("moving staged download into '{}'", blob_path.display()),
                e.error,
            )
        })?;
        Ok(blob_path)
    }

    /// Copy an existing file into the cache.
    #[cfg(test)]
    pub(crate) fn admit_file(&self, src: &Path) -> BuildResult<CacheHit> {
        let mut staged = NamedTempFile::new_in(self.tmp_dir())
            .io_context(|| format!("creating staging file in '{}'", self.tmp_dir().display()))?;
        let mut reader =
            File::open(src).io_context(|| format!("opening '{}'", src.display()))?;
        std::io::copy(&mut reader, staged.as_file_mut())
            .io_context(|| format!("staging '{}'", src.display()))?;
        let digests = hash_file(staged.path())?;
        let path = self.admit(staged, &digests)?;
        Ok(CacheHit { path, digests })
    }

    /// Remember which blob a URL resolved to.
    pub fn record_remote(&self, url: &str, digests: &Digests) -> BuildResult<()> {
        let entry = RemoteIndexEntry {
            url: url.to_string(),
            sha256: digests.sha256.clone(),
            md5: digests.md5.clone(),
            size_bytes: digests.size,
            stored_at_unix: OffsetDateTime::now_utc().unix_timestamp(),
        };
        let path = self.remote_index_path(url);
        let bytes = serde_json::to_vec_pretty(&entry).map_err(|source| BuildError::Json {
            context: "serializing cache index entry".to_string(),
            source,
        })?;
        let mut tmp = NamedTempFile::new_in(self.tmp_dir())
            .io_context(|| format!("creating staging file in '{}'", self.tmp_dir().display()))?;
        std::io::Write::write_all(tmp.as_file_mut(), &bytes)
            .io_context(|| format!("writing cache index for '{}'", url))?;
        tmp.persist(&path).map_err(|e| {
            BuildError::io(format!("writing cache index '{}'", path.display()), e.error)
        })?;
        Ok(())
    }

    /// Mark the cache as in use by a build until the returned guard drops.
    ///
    /// Any number of builds may hold a session; [`AssetCache::gc`] waits
    /// until none does.
    pub fn session(&self) -> BuildResult<CacheSession> {
        let file = self.open_cache_lock()?;
        file.lock_shared()
            .io_context(|| format!("locking cache '{}'", self.root.display()))?;
        Ok(CacheSession { _file: file })
    }

    fn open_cache_lock(&self) -> BuildResult<File> {
        let lock_path = self.locks_dir().join("cache.lock");
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .io_context(|| format!("opening lock file '{}'", lock_path.display()))
    }

    /// Remove blobs no URL index entry points at, and staging files left by
    /// interrupted runs. Returns the number of blobs removed.
    ///
    /// Waits for running builds to finish first; their in-flight downloads
    /// live in `tmp/`.
    pub fn gc(&self) -> BuildResult<usize> {
        let lock = self.open_cache_lock()?;
        if lock.try_lock_exclusive().is_err() {
            info!(cache = %self.root.display(), "waiting for running builds to release the cache");
            lock.lock_exclusive()
                .io_context(|| format!("locking cache '{}'", self.root.display()))?;
        }

        let referenced = self.referenced_blobs()?;
        let mut removed = 0usize;
        for ent in WalkDir::new(self.blobs_dir())
            .into_iter()
            .filter_map(Result::ok)
        {
            if !ent.file_type().is_file() {
                continue;
            }
            let name = ent.file_name().to_string_lossy().to_string();
            if !is_hex_64(&name) || referenced.contains(&name) {
                continue;
            }
            let _lock = self.acquire_lock(&name)?;
            fs::remove_file(ent.path()).io_context(|| {
                format!("removing unreferenced blob '{}'", ent.path().display())
            })?;
            removed += 1;
        }

        for ent in fs::read_dir(self.tmp_dir())
            .io_context(|| format!("reading '{}'", self.tmp_dir().display()))?
        {
            let ent = ent.io_context(|| format!("reading '{}'", self.tmp_dir().display()))?;
            let path = ent.path();
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed stale staging file"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(BuildError::io(
                        format!("removing stale staging file '{}'", path.display()),
                        err,
                    ))
                }
            }
        }
        Ok(removed)
    }

    pub fn status(&self) -> BuildResult<CacheStatus> {
        let mut blobs = 0u64;
        let mut blob_bytes = 0u64;
        for ent in WalkDir::new(self.blobs_dir())
            .into_iter()
            .filter_map(Result::ok)
        {
            if ent.file_type().is_file() {
                blobs += 1;
                if let Ok(md) = ent.metadata() {
                    blob_bytes += md.len();
                }
            }
        }
        let indexed_urls = fs::read_dir(self.remote_index_dir())
            .io_context(|| format!("reading '{}'", self.remote_index_dir().display()))?
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("json"))
            .count() as u64;
        Ok(CacheStatus {
            root: self.root.clone(),
            blobs,
            blob_bytes,
            indexed_urls,
        })
    }

    fn referenced_blobs(&self) -> BuildResult<BTreeSet<String>> {
        let mut out = BTreeSet::new();
        for ent in fs::read_dir(self.remote_index_dir())
            .io_context(|| format!("reading '{}'", self.remote_index_dir().display()))?
            .filter_map(Result::ok)
        {
            let Ok(bytes) = fs::read(ent.path()) else {
                continue;
            };
            let Ok(entry) = serde_json::from_slice::<RemoteIndexEntry>(&bytes) else {
                continue;
            };
            if is_hex_64(&entry.sha256) {
                out.insert(entry.sha256);
            }
        }
        Ok(out)
    }

    fn acquire_lock(&self, sha256: &str) -> BuildResult<CacheLock> {
        let lock_path = self.locks_dir().join(format!("{}.lock", sha256));
        // Lock files are never unlinked; removing a held lock file would let a
        // second writer lock a fresh inode at the same path.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .io_context(|| format!("opening lock file '{}'", lock_path.display()))?;
        file.lock_exclusive()
            .io_context(|| format!("locking '{}'", lock_path.display()))?;
        Ok(CacheLock { _file: file })
    }
}

/// Holds a cache key's writer lock until dropped.
struct CacheLock {
    _file: File,
}

/// A build's shared hold on the cache. See [`AssetCache::session`].
#[derive(Debug)]
pub struct CacheSession {
    _file: File,
}
