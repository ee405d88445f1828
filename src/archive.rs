//! Bundle tree digest and deterministic `tar.zst` archive.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tar::Builder as TarBuilder;
use tempfile::NamedTempFile;
use tracing::warn;
use walkdir::WalkDir;

use crate::assets::digest::hash_file;
use crate::error::{create_dir_all, BuildError, BuildResult, IoContext};
use crate::fsutil::{mode_of, relative_slash_path, set_mode};

pub const ARCHIVE_NAME: &str = "bundle.tar.zst";
const ZSTD_LEVEL: i32 = 3;

/// Entries below `root` in byte order of their relative paths.
fn sorted_entries(root: &Path) -> BuildResult<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|err| {
            let context = format!("walking '{}'", root.display());
            match err.into_io_error() {
                Some(source) => BuildError::io(context, source),
                None => BuildError::io(context, std::io::Error::other("filesystem loop")),
            }
        })?;
        if entry.path() != root {
            entries.push(entry.into_path());
        }
    }
    entries.sort_by(|a, b| relative_slash_path(root, a).cmp(&relative_slash_path(root, b)));
    Ok(entries)
}

/// SHA256 over the sorted relative paths, modes and file contents.
///
/// Timestamps and ownership do not take part, so two bundles with the same
/// files and permissions have the same digest.
pub fn bundle_digest(root: &Path) -> BuildResult<String> {
    let mut hasher = Sha256::new();
    for path in sorted_entries(root)? {
        let rel = relative_slash_path(root, &path);
        let md = fs::symlink_metadata(&path)
            .io_context(|| format!("reading metadata of '{}'", path.display()))?;
        let line = if md.is_dir() {
            format!("d {:o} {}\n", mode_of(&md), rel)
        } else if md.is_file() {
            let digests = hash_file(&path)?;
            format!("f {:o} {} {}\n", mode_of(&md), digests.sha256, rel)
        } else {
            let target = fs::read_link(&path)
                .io_context(|| format!("reading link '{}'", path.display()))?;
            format!("l {} -> {}\n", rel, target.to_string_lossy())
        };
        hasher.update(line.as_bytes());
    }
    Ok(hex(&hasher.finalize()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Pack `src_dir` into `out_path` as a reproducible zstd-compressed tar.
///
/// Entries are sorted, with mtime 0 and uid/gid 0. The archive is staged
/// beside `out_path` and renamed into place.
pub fn create_tar_zst(src_dir: &Path, out_path: &Path) -> BuildResult<()> {
    let parent = out_path.parent().unwrap_or_else(|| Path::new("."));
    create_dir_all(parent)?;
    let staged = NamedTempFile::new_in(parent)
        .io_context(|| format!("creating temp archive in '{}'", parent.display()))?;
    let ctx = || format!("writing archive '{}'", out_path.display());

    let encoder =
        zstd::stream::Encoder::new(staged.as_file(), ZSTD_LEVEL).io_context(ctx)?;
    let mut builder = TarBuilder::new(encoder);

    for path in sorted_entries(src_dir)? {
        let rel = relative_slash_path(src_dir, &path);
        let md = fs::symlink_metadata(&path)
            .io_context(|| format!("reading metadata of '{}'", path.display()))?;

        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(mode_of(&md));

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder
                .append_data(&mut header, &rel, std::io::empty())
                .io_context(ctx)?;
        } else if md.is_file() {
            let file =
                File::open(&path).io_context(|| format!("opening '{}'", path.display()))?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_cksum();
            builder.append_data(&mut header, &rel, file).io_context(ctx)?;
        } else {
            warn!(path = %rel, "skipping non-regular entry while archiving");
        }
    }

    let encoder = builder.into_inner().io_context(ctx)?;
    let mut file = encoder.finish().io_context(ctx)?;
    file.flush().io_context(ctx)?;
    staged
        .persist(out_path)
        .map_err(|err| BuildError::io(ctx(), err.error))?;
    set_mode(out_path, 0o644)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree(root: &Path, body: &str) {
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/b/file.txt"), body).unwrap();
        fs::write(root.join("top.txt"), "top").unwrap();
    }

    #[test]
    fn digest_tracks_content_not_mtime() {
        let dir = TempDir::new().unwrap();
        let one = dir.path().join("one");
        let two = dir.path().join("two");
        tree(&one, "same");
        tree(&two, "same");
        assert_eq!(bundle_digest(&one).unwrap(), bundle_digest(&two).unwrap());

        fs::write(two.join("a/b/file.txt"), "different").unwrap();
        assert_ne!(bundle_digest(&one).unwrap(), bundle_digest(&two).unwrap());
    }

    #[test]
    fn archive_is_reproducible_and_readable() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        tree(&src, "payload");
        let first = dir.path().join("first.tar.zst");
        let second = dir.path().join("second.tar.zst");
        create_tar_zst(&src, &first).unwrap();
        create_tar_zst(&src, &second).unwrap();
        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());

        let decoder = zstd::stream::Decoder::new(File::open(&first).unwrap()).unwrap();
        let mut archive = tar::Archive::new(decoder);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let entry = e.unwrap();
                assert_eq!(entry.header().mtime().unwrap(), 0);
                let path = entry.path().unwrap().to_string_lossy().to_string();
                path.trim_end_matches('/').to_string()
            })
            .collect();
        assert_eq!(names, vec!["a", "a/b", "a/b/file.txt", "top.txt"]);
    }
}
