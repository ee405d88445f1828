use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{create_dir_all, BuildError, BuildResult, IoContext};

/// Serialize `value` as pretty JSON next to `path`, then rename into place.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> BuildResult<()> {
    let payload = serde_json::to_vec_pretty(value).map_err(|source| BuildError::Json {
        context: format!("serializing '{}'", path.display()),
        source,
    })?;
    write_atomic(path, &payload)
}

/// Write bytes to a pid-suffixed temp file beside `path`, then rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> BuildResult<()> {
    let parent = parent_of(path)?;
    create_dir_all(&parent)?;
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    fs::write(&tmp, bytes).io_context(|| format!("writing temp file '{}'", tmp.display()))?;
    fs::rename(&tmp, path).io_context(|| {
        format!(
            "renaming temp file '{}' to '{}'",
            tmp.display(),
            path.display()
        )
    })
}

/// Remove `path` if present and recreate it empty.
pub(crate) fn recreate_dir(path: &Path) -> BuildResult<()> {
    if path.exists() {
        fs::remove_dir_all(path)
            .io_context(|| format!("removing existing directory '{}'", path.display()))?;
    }
    create_dir_all(path)
}

pub(crate) fn remove_dir_if_exists(path: &Path) -> BuildResult<()> {
    if path.exists() {
        fs::remove_dir_all(path)
            .io_context(|| format!("removing directory '{}'", path.display()))?;
    }
    Ok(())
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> BuildResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .io_context(|| format!("setting mode {:o} on '{}'", mode, path.display()))
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) -> BuildResult<()> {
    Ok(())
}

#[cfg(unix)]
pub(crate) fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
pub(crate) fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
pub(crate) fn mode_of(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub(crate) fn mode_of(metadata: &fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else {
        0o644
    }
}

/// `/`-separated path of `path` relative to `root`.
pub(crate) fn relative_slash_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn parent_of(path: &Path) -> BuildResult<PathBuf> {
    path.parent().map(Path::to_path_buf).ok_or_else(|| {
        BuildError::io(
            format!("path without parent '{}'", path.display()),
            std::io::Error::from(std::io::ErrorKind::InvalidInput),
        )
    })
}
