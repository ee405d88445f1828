//! Installer preflight and invocation.
//!
//! The external installer is only ever handed a published bundle. Its exit
//! status is the only success signal; stderr is kept for the error message.
//!
//! ```rust,no_run
//! use autoinstall_builder::preflight::preflight;
//!
//! let fai_cd = preflight("fai-cd")?;
//! # Ok::<(), autoinstall_builder::BuildError>(())
//! ```

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::cancel::CancelFlag;
use crate::error::{BuildError, BuildResult, IoContext};

/// Installer used when none is configured.
pub const DEFAULT_INSTALLER: &str = "fai-cd";

/// Bytes of stderr kept for the error message.
const STDERR_TAIL: u64 = 4096;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Resolve `program` on `PATH`, or use it as-is when it is a path.
pub fn resolve_program(program: &str) -> BuildResult<PathBuf> {
    let as_path = Path::new(program);
    if as_path.is_absolute() || program.contains('/') {
        if as_path.is_file() {
            return Ok(as_path.to_path_buf());
        }
        return Err(missing(program, "no such file"));
    }
    which::which(program).map_err(|err| missing(program, &err.to_string()))
}

fn missing(program: &str, detail: &str) -> BuildError {
    BuildError::ExternalTool {
        tool: program.to_string(),
        status: "not found".to_string(),
        stderr: detail.to_string(),
    }
}

/// Host tools `fai-cd` shells out to while building an image, as
/// (command, package that provides it).
const FAI_CD_HOST_TOOLS: &[(&str, &str)] = &[("xorriso", "xorriso"), ("mksquashfs", "squashfs-tools")];

/// Host tools an installer needs besides itself. Only `fai-cd` is known;
/// other programs are trusted to check their own environment.
pub fn host_tools_for(program: &Path) -> &'static [(&'static str, &'static str)] {
    match program.file_name().and_then(|n| n.to_str()) {
        Some(DEFAULT_INSTALLER) => FAI_CD_HOST_TOOLS,
        _ => &[],
    }
}

/// Resolve the installer and check its host tools before anything runs.
pub fn preflight(program: &str) -> BuildResult<PathBuf> {
    let resolved = resolve_program(program)?;
    check_required_tools(host_tools_for(&resolved))?;
    debug!(installer = %resolved.display(), "installer preflight passed");
    Ok(resolved)
}

/// Check that specific tools are available.
///
/// Each tuple is (command, package that provides it). All missing tools are
/// reported at once.
pub fn check_required_tools(tools: &[(&str, &str)]) -> BuildResult<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| which::which(tool).is_err())
        .map(|(tool, package)| format!("{} (install: {})", tool, package))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(BuildError::ExternalTool {
        tool: missing.join(", "),
        status: "not found".to_string(),
        stderr: "missing required host tools".to_string(),
    })
}

/// Command line for the installer: `-f -C <bundle>/fai-config <iso>`.
pub fn installer_args(bundle_dir: &Path, iso_path: &Path) -> Vec<String> {
    vec![
        "-f".to_string(),
        "-C".to_string(),
        bundle_dir.join("fai-config").display().to_string(),
        iso_path.display().to_string(),
    ]
}

/// Run the installer against a published bundle.
///
/// The child is killed if `cancel` fires while it runs.
pub fn run_installer(
    program: &Path,
    bundle_dir: &Path,
    iso_path: &Path,
    cancel: &CancelFlag,
) -> BuildResult<()> {
    let tool = program.display().to_string();
    let args = installer_args(bundle_dir, iso_path);
    info!(tool = %tool, args = ?args, "invoking installer");

    let mut stderr_file =
        tempfile::tempfile().io_context(|| "creating installer stderr capture".to_string())?;
    let stderr_handle = stderr_file
        .try_clone()
        .io_context(|| "cloning installer stderr capture".to_string())?;

    let mut child = Command::new(program)
        .args(&args)
        .current_dir(bundle_dir)
        .stdin(Stdio::null())
        .stderr(Stdio::from(stderr_handle))
        .spawn()
        .io_context(|| format!("spawning installer '{}'", tool))?;

    let status = loop {
        if let Some(status) = child
            .try_wait()
            .io_context(|| format!("waiting for installer '{}'", tool))?
        {
            break status;
        }
        if cancel.is_cancelled() {
            debug!(tool = %tool, "killing installer after interrupt");
            let _ = child.kill();
            let _ = child.wait();
            return Err(BuildError::Cancelled);
        }
        thread::sleep(POLL_INTERVAL);
    };

    if status.success() {
        info!(tool = %tool, "installer finished");
        return Ok(());
    }
    Err(BuildError::ExternalTool {
        tool,
        status: status.to_string(),
        stderr: stderr_tail(&mut stderr_file),
    })
}

fn stderr_tail(file: &mut File) -> String {
    let len = file.seek(SeekFrom::End(0)).unwrap_or(0);
    let start = len.saturating_sub(STDERR_TAIL);
    let mut buf = Vec::new();
    if file.seek(SeekFrom::Start(start)).is_ok() {
        let _ = file.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}
