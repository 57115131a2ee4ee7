//! Persisted run reports under `<harness_dir>/.proofmend/runs/`.

use crate::util::write_atomic;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use proofmend_core::ResultsReport;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
    Aborted { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub harness: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub results: ResultsReport,
}

impl RunReport {
    pub fn new(harness: &Path, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            harness: harness.to_path_buf(),
            started_at,
            finished_at: started_at,
            status: RunStatus::Completed,
            results: ResultsReport::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    pub fn new(harness_dir: &Path) -> Self {
        Self {
            dir: harness_dir.join(".proofmend").join("runs"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: &Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }

    pub fn save(&self, report: &RunReport) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.path_for(&report.run_id);
        let content = serde_json::to_vec_pretty(report).context("Failed to serialize run report")?;
        write_atomic(&path, &content)?;
        info!(run_id = %report.run_id, path = %path.display(), "run report saved");
        Ok(path)
    }

    pub fn load(&self, run_id: &Uuid) -> Result<RunReport> {
        let path = self.path_for(run_id);
        let content =
            fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_slice(&content).with_context(|| format!("Invalid run report {}", path.display()))
    }

    /// Saved reports, oldest first.
    pub fn list(&self) -> Result<Vec<RunReport>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut reports = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read(&path)?;
            if let Ok(report) = serde_json::from_slice::<RunReport>(&content) {
                reports.push(report);
            }
        }
        reports.sort_by_key(|r| r.started_at);
        Ok(reports)
    }
}
