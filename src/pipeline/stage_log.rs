//! Per-stage build records.
//!
//! `build-log.json` is rewritten atomically after the run; `build.log` is a
//! one-line-per-stage mirror for people.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::Stage;
use crate::error::{BuildResult, IoContext};
use crate::fsutil::{write_atomic, write_json_atomic};

pub const BUILD_LOG_JSON: &str = "build-log.json";
pub const BUILD_LOG_TEXT: &str = "build.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Success => "success",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
            StageStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub status: StageStatus,
    pub started_at_utc: String,
    pub finished_at_utc: String,
    pub duration_ms: u64,
    /// Why the stage was skipped, or what it produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The whole run, as written to `build-log.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLog {
    pub version: u32,
    pub status: StageStatus,
    pub config: String,
    pub mode: String,
    pub build_timestamp: String,
    pub started_at_utc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_utc: Option<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_digest: Option<String>,
    pub stages: Vec<StageRecord>,
}

impl BuildLog {
    pub fn new(config: &Path, mode: &str, build_timestamp: &str) -> Self {
        Self {
            version: 1,
            status: StageStatus::Success,
            config: config.display().to_string(),
            mode: mode.to_string(),
            build_timestamp: build_timestamp.to_string(),
            started_at_utc: now_rfc3339(),
            finished_at_utc: None,
            classes: Vec::new(),
            bundle_digest: None,
            stages: Vec::new(),
        }
    }

    pub fn record(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    /// Status of the run: the first non-success, non-skipped stage, if any.
    fn overall_status(&self) -> StageStatus {
        self.stages
            .iter()
            .map(|r| r.status)
            .find(|s| matches!(s, StageStatus::Failed | StageStatus::Cancelled))
            .unwrap_or(StageStatus::Success)
    }

    pub fn finish(&mut self) {
        self.status = self.overall_status();
        self.finished_at_utc = Some(now_rfc3339());
    }

    pub fn render_text(&self) -> String {
        let mut out = format!(
            "build {} config={} mode={} timestamp={}\n",
            self.status.as_str(),
            self.config,
            self.mode,
            self.build_timestamp
        );
        for record in &self.stages {
            let mut line = format!(
                "{:<26} {:<9} {:>8}ms",
                record.stage.as_str(),
                record.status.as_str(),
                record.duration_ms
            );
            if let Some(detail) = &record.detail {
                line.push_str("  ");
                line.push_str(detail);
            }
            if let Some(error) = &record.error {
                line.push_str("  error: ");
                line.push_str(&error.replace('\n', " "));
            }
            out.push_str(line.trim_end());
            out.push('\n');
        }
        if let Some(digest) = &self.bundle_digest {
            out.push_str(&format!("bundle sha256 {}\n", digest));
        }
        out
    }

    /// Write both log files under `output_dir`.
    pub fn write(&self, output_dir: &Path) -> BuildResult<PathBuf> {
        let json = output_dir.join(BUILD_LOG_JSON);
        write_json_atomic(&json, self)?;
        write_atomic(&output_dir.join(BUILD_LOG_TEXT), self.render_text().as_bytes())?;
        Ok(json)
    }

    pub fn load(output_dir: &Path) -> BuildResult<Self> {
        let path = output_dir.join(BUILD_LOG_JSON);
        let bytes =
            fs::read(&path).io_context(|| format!("reading build log '{}'", path.display()))?;
        serde_json::from_slice(&bytes).map_err(|source| crate::error::BuildError::Json {
            context: format!("parsing build log '{}'", path.display()),
            source,
        })
    }
}

/// Start of a stage; turned into a record once the outcome is known.
pub(crate) struct StageClock {
    stage: Stage,
    started_at_utc: String,
    started: Instant,
}

impl StageClock {
    pub(crate) fn start(stage: Stage) -> Self {
        Self {
            stage,
            started_at_utc: now_rfc3339(),
            started: Instant::now(),
        }
    }

    pub(crate) fn finish(
        self,
        status: StageStatus,
        detail: Option<String>,
        error: Option<String>,
    ) -> StageRecord {
        StageRecord {
            stage: self.stage,
            status,
            started_at_utc: self.started_at_utc,
            finished_at_utc: now_rfc3339(),
            duration_ms: self.started.elapsed().as_millis() as u64,
            detail,
            error,
        }
    }
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}
