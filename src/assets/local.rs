use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::Path;

use tempfile::NamedTempFile;

use super::digest::{Digests, DualHasher};
use crate::error::{create_dir_all, BuildError, BuildResult, IoContext};
use crate::fsutil::{is_executable, set_mode};

/// Copy a local asset into `dest`, hashing on the way.
///
/// Returns the digests and whether the source was executable. With
/// `keep_exec` the executable bit is carried over to the copy.
pub(crate) fn copy_local(
    asset: &str,
    src: &Path,
    dest: &Path,
    expected_sha256: Option<&str>,
    keep_exec: bool,
) -> BuildResult<(Digests, bool)> {
    let metadata = match fs::metadata(src) {
        Ok(md) if md.is_file() => md,
        _ => {
            return Err(BuildError::NotFound {
                asset: asset.to_string(),
                path: src.display().to_string(),
            })
        }
    };
    let executable = is_executable(&metadata);

    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    create_dir_all(parent)?;
    let mut staged = NamedTempFile::new_in(parent)
        .io_context(|| format!("creating staging file in '{}'", parent.display()))?;

    let mut reader =
        BufReader::new(File::open(src).io_context(|| format!("opening '{}'", src.display()))?);
    let mut hasher = DualHasher::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .io_context(|| format!("reading '{}'", src.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        staged
            .write_all(&buf[..n])
            .io_context(|| format!("copying '{}'", src.display()))?;
    }
    let digests = hasher.finalize();

    if let Some(expected) = expected_sha256 {
        if digests.sha256 != expected {
            return Err(BuildError::Integrity {
                asset: asset.to_string(),
                expected: expected.to_string(),
                actual: digests.sha256,
            });
        }
    }

    staged.persist(dest).map_err(|e| {
        BuildError::io(format!("moving copy into '{}'", dest.display()), e.error)
    })?;
    set_mode(dest, if keep_exec && executable { 0o755 } else { 0o644 })?;
    Ok((digests, executable))
}
