//! Boundary contracts between the repair loop and its collaborators.

use crate::record::ErrorRecord;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One proposed single-line edit. Consumed once by the patcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchAnchor {
    pub target_function: String,
    pub previous_line_of_code: String,
    pub next_line_of_code: String,
    pub code_to_insert: String,
}

impl PatchAnchor {
    pub fn summary(&self) -> String {
        format!("{} @ {}", self.code_to_insert.trim(), self.target_function)
    }
}

/// Why the previous attempt did not resolve its target. Handed back to the
/// oracle on the next request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    None,
    InsertionAnchorNotFound {
        function: String,
        previous_line: String,
        next_line: String,
    },
    BuildSyntaxError {
        output: String,
    },
    CoverageRegressed {
        /// The target line, if it is no longer reached.
        lost_line: Option<usize>,
        /// Missed block containing the lost line.
        missed_block: Vec<usize>,
    },
    NewContradictoryError {
        line: usize,
        messages: Vec<String>,
    },
    NotFixed,
    NoCandidates,
    BuildAborted {
        timed_out: bool,
    },
}

impl FailureCause {
    pub fn label(&self) -> &'static str {
        match self {
            FailureCause::None => "none",
            FailureCause::InsertionAnchorNotFound { .. } => "insertion-anchor-not-found",
            FailureCause::BuildSyntaxError { .. } => "build-syntax-error",
            FailureCause::CoverageRegressed { .. } => "coverage-regressed",
            FailureCause::NewContradictoryError { .. } => "new-contradictory-error",
            FailureCause::NotFixed => "not-fixed",
            FailureCause::NoCandidates => "no-candidates",
            FailureCause::BuildAborted { .. } => "build-aborted",
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::InsertionAnchorNotFound {
                function,
                previous_line,
                next_line,
            } => write!(
                f,
                "could not locate {:?} or {:?} in {}",
                previous_line, next_line, function
            ),
            FailureCause::CoverageRegressed {
                lost_line: Some(line),
                ..
            } => write!(f, "coverage regressed; line {} is no longer reached", line),
            FailureCause::NewContradictoryError { line, messages } => write!(
                f,
                "inserted line {} introduced {} new error(s)",
                line,
                messages.len()
            ),
            FailureCause::BuildAborted { timed_out: true } => f.write_str("build timed out"),
            FailureCause::BuildAborted { timed_out: false } => f.write_str("build crashed"),
            other => f.write_str(other.label()),
        }
    }
}

/// Result of one build/verify invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutcome {
    /// `None` when the process was killed or terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl BuildOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Timeout or signal: no point retrying the same target.
    pub fn aborted(&self) -> bool {
        self.timed_out || self.exit_code.is_none()
    }

    /// Tail of combined output, for the oracle.
    pub fn output_tail(&self, max_chars: usize) -> String {
        let combined = format!("{}\n{}", self.stdout, self.stderr);
        let trimmed = combined.trim();
        let skip = trimmed.chars().count().saturating_sub(max_chars);
        trimmed.chars().skip(skip).collect()
    }
}

/// Runs the build/verify step for a harness directory.
pub trait BuildRunner: Send + Sync {
    fn run(&self, workdir: &Path, timeout: Duration) -> Result<BuildOutcome>;
}

/// Everything the oracle may look at when proposing edits.
#[derive(Debug, Clone, Copy)]
pub struct OracleRequest<'a> {
    pub record: &'a ErrorRecord,
    pub cause: &'a FailureCause,
    pub advice: &'a [String],
    pub undefined_functions: &'a [String],
    /// Symbol name to the trace page that first referenced it.
    pub symbols: &'a BTreeMap<String, String>,
    /// Raw viewer-trace steps for the target error.
    pub trace: Option<&'a Value>,
    pub harness_path: &'a Path,
    pub harness_source: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub anchors: Vec<PatchAnchor>,
    /// Opaque oracle response, stored on the record.
    #[serde(default)]
    pub response: Value,
    #[serde(default)]
    pub tokens: Option<Value>,
}

/// Proposes edits for an error. `Ok(None)`, an empty proposal and an `Err`
/// all mean "no edit available this attempt".
pub trait RepairOracle: Send + Sync {
    fn propose(&self, request: &OracleRequest<'_>) -> Result<Option<Proposal>>;
}

/// Cooperative cancellation, checked between controller states.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
