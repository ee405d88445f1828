//! Error taxonomy for the build pipeline.
//!
//! Every component returns [`BuildError`]. The orchestrator wraps whatever a
//! stage returns in [`BuildError::StageFailed`] so callers always learn which
//! stage broke and why.

use std::fmt;
use std::path::Path;

use thiserror::Error;

use crate::pipeline::Stage;

/// Result type used across the library.
pub type BuildResult<T> = Result<T, BuildError>;

/// A single field-level configuration problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every problem found while validating a configuration document.
///
/// Validation never stops at the first problem, so this always carries the
/// complete list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ConfigValidationError {
    pub problems: Vec<FieldError>,
}

impl ConfigValidationError {
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            problems: vec![FieldError::new(field, message)],
        }
    }

    /// True when some problem was reported against `field`.
    pub fn mentions(&self, field: &str) -> bool {
        self.problems.iter().any(|p| p.field == field)
    }
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "configuration invalid ({} problem{})",
            self.problems.len(),
            if self.problems.len() == 1 { "" } else { "s" }
        )?;
        for problem in &self.problems {
            write!(f, "\n  - {}", problem)?;
        }
        Ok(())
    }
}

/// Errors that can occur while building installer artifacts.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The configuration failed validation; raised before any I/O.
    #[error(transparent)]
    ConfigValidation(#[from] ConfigValidationError),

    /// Computed digest does not match the declared checksum.
    #[error("integrity check failed for '{asset}': expected sha256 {expected}, got {actual}")]
    Integrity {
        asset: String,
        expected: String,
        actual: String,
    },

    /// A local asset (or an offline cache entry) does not exist.
    #[error("asset '{asset}' not found at '{path}'")]
    NotFound { asset: String, path: String },

    /// Transport failure, surfaced once the retry budget is spent.
    #[error("fetching '{asset}' from {url} failed after {attempts} attempt(s): {message}")]
    Network {
        asset: String,
        url: String,
        attempts: u32,
        message: String,
    },

    /// A template referenced a value or class that does not exist.
    #[error("cannot render '{artifact}': {message}")]
    TemplateResolution { artifact: String, message: String },

    /// The external installer tool is missing or exited non-zero.
    #[error("external tool '{tool}' failed ({status}){}", stderr_suffix(.stderr))]
    ExternalTool {
        tool: String,
        status: String,
        stderr: String,
    },

    /// Filesystem plumbing failure.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON encoding or decoding failure for an on-disk record.
    #[error("{context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    /// The build was interrupted.
    #[error("build cancelled")]
    Cancelled,

    /// A pipeline stage failed; `source` carries the root cause.
    #[error("stage {stage} failed: {source}")]
    StageFailed {
        stage: Stage,
        #[source]
        source: Box<BuildError>,
    },
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {}", trimmed)
    }
}

impl BuildError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// The innermost error, looking through stage wrappers.
    pub fn root_cause(&self) -> &BuildError {
        match self {
            BuildError::StageFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), BuildError::Cancelled)
    }

    /// Process exit status for this error: 2 invalid configuration,
    /// 3 external tool, 130 interrupted, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self.root_cause() {
            BuildError::ConfigValidation(_) => 2,
            BuildError::ExternalTool { .. } => 3,
            BuildError::Cancelled => 130,
            _ => 1,
        }
    }
}

/// Attach a human context string to an `io::Result`.
pub trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> BuildResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F, S>(self, f: F) -> BuildResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| BuildError::Io {
            context: f().into(),
            source,
        })
    }
}

pub(crate) fn create_dir_all(path: &Path) -> BuildResult<()> {
    std::fs::create_dir_all(path)
        .io_context(|| format!("creating directory '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_problem() {
        let err = ConfigValidationError {
            problems: vec![
                FieldError::new("network.hostname", "invalid hostname"),
                FieldError::new("encryption.passphrase", "too short"),
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("configuration invalid (2 problems)"));
        assert!(text.contains("network.hostname: invalid hostname"));
        assert!(text.contains("encryption.passphrase: too short"));
        assert!(err.mentions("network.hostname"));
        assert!(!err.mentions("user.username"));
    }

    #[test]
    fn root_cause_unwraps_stage_failures() {
        let err = BuildError::StageFailed {
            stage: Stage::AcquireAssets,
            source: Box::new(BuildError::Cancelled),
        };
        assert!(err.is_cancelled());
        assert!(err.to_string().starts_with("stage acquire-assets failed"));
    }

    #[test]
    fn external_tool_message_includes_stderr_only_when_present() {
        let quiet = BuildError::ExternalTool {
            tool: "fai-cd".into(),
            status: "exit status 1".into(),
            stderr: "  ".into(),
        };
        assert_eq!(
            quiet.to_string(),
            "external tool 'fai-cd' failed (exit status 1)"
        );
        let loud = BuildError::ExternalTool {
            tool: "fai-cd".into(),
            status: "exit status 2".into(),
            stderr: "no space left\n".into(),
        };
        assert!(loud.to_string().ends_with(": no space left"));
    }
}
