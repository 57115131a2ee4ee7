//! Repair iteration controller
//!
//! One controller owns one harness file. For each unresolved error, in
//! cluster priority order, it loops:
//!
//! ```text
//! Requesting -> Applying -> Rebuilding -> Evaluating -> Resolved | Retrying | Abandoned
//! ```
//!
//! Every attempt runs under a [`HarnessSnapshot`]. Only a resolving attempt
//! commits it; every other exit, including errors and cancellation, writes
//! the original harness back.

use crate::advice::advice_for;
use crate::budget::AttemptBudget;
use crate::error::{EvaluateError, RepairError};
use crate::evaluate::{Evaluation, Evaluator};
use anyhow::{anyhow, Context};
use chrono::Utc;
use proofmend_adapters::{
    patch_harness, HarnessSnapshot, PatchError, RepairConfig, RunReport, RunStatus, RunStore,
};
use proofmend_core::report::is_harness_file;
use proofmend_core::{
    AttemptKind, AttemptRecord, BuildRunner, CancelFlag, ErrorId, ErrorRecord, ErrorReport,
    FailureCause, LineLedger, OracleRequest, PatchAnchor, Proposal, RepairOracle, ReportError,
};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const OUTPUT_TAIL_CHARS: usize = 4000;
const NOT_FIXED_FEEDBACK: &str = "did not fix";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Requesting,
    Applying,
    Rebuilding,
    Evaluating,
}

/// How the controller finished with one target error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    Resolved { attempts: usize },
    Abandoned { cause: FailureCause },
}

enum AttemptResult {
    Resolved,
    Retry { kind: AttemptKind, cause: FailureCause },
    Aborted { timed_out: bool },
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct RepairRun {
    pub report: RunReport,
    pub tracker: ErrorReport,
    pub ledger: LineLedger,
    pub outcomes: Vec<(ErrorId, TargetOutcome)>,
}

struct RunState {
    tracker: ErrorReport,
    ledger: LineLedger,
    evaluation: Evaluation,
    outcomes: Vec<(ErrorId, TargetOutcome)>,
}

/// A line whose coverage must survive an edit, in pre-edit numbering.
struct WatchedLine {
    file: String,
    function: String,
    raw_line: usize,
}

pub struct RepairController<'a> {
    config: RepairConfig,
    harness_path: PathBuf,
    harness_dir: PathBuf,
    runner: &'a dyn BuildRunner,
    oracle: &'a dyn RepairOracle,
    evaluator: Evaluator,
    store: RunStore,
    cancel: CancelFlag,
}

impl<'a> RepairController<'a> {
    pub fn new(
        harness_path: impl Into<PathBuf>,
        config: RepairConfig,
        runner: &'a dyn BuildRunner,
        oracle: &'a dyn RepairOracle,
    ) -> Self {
        let harness_path = harness_path.into();
        let harness_dir = harness_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            evaluator: Evaluator::new(&config, &harness_dir),
            store: RunStore::new(&harness_dir),
            config,
            harness_path,
            harness_dir,
            runner,
            oracle,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn harness_path(&self) -> &Path {
        &self.harness_path
    }

    /// Repair every error in the harness. A run report is saved whether or
    /// not the run finishes.
    pub fn run(&self) -> Result<RepairRun, RepairError> {
        let mut report = RunReport::new(&self.harness_path, Utc::now());
        info!(run_id = %report.run_id, harness = %self.harness_path.display(), "repair run started");

        let mut progress = None;
        let result = self.drive(&mut progress);

        report.finished_at = Utc::now();
        report.status = match &result {
            Ok(()) => RunStatus::Completed,
            Err(RepairError::Cancelled) => RunStatus::Cancelled,
            Err(err) => RunStatus::Aborted {
                reason: err.to_string(),
            },
        };
        if let Some(state) = &progress {
            report.results = state.tracker.results_report();
        }
        if let Err(err) = self.store.save(&report) {
            warn!(error = %err, "failed to save run report");
        }
        result?;

        let state = progress.ok_or_else(|| RepairError::Io(anyhow!("run finished without state")))?;
        info!(
            run_id = %report.run_id,
            resolved = state.tracker.resolved().len(),
            failed = state.tracker.failed().len(),
            "repair run finished"
        );
        Ok(RepairRun {
            report,
            tracker: state.tracker,
            ledger: state.ledger,
            outcomes: state.outcomes,
        })
    }

    fn drive(&self, progress: &mut Option<RunState>) -> Result<(), RepairError> {
        self.check_cancelled()?;
        let build = self
            .runner
            .run(&self.harness_dir, self.config.build_timeout())?;
        if !build.succeeded() {
            return Err(RepairError::InitialBuildFailed {
                exit_code: build.exit_code,
                output: build.output_tail(OUTPUT_TAIL_CHARS),
            });
        }

        let ledger = LineLedger::new();
        let evaluation = self.evaluator.evaluate(&ledger)?;
        let tracker = ErrorReport::from_parsed(evaluation.parsed.clone());
        info!(
            errors = tracker.len(),
            undefined_functions = tracker.undefined_functions().len(),
            "initial report parsed"
        );

        let state = progress.insert(RunState {
            tracker,
            ledger,
            evaluation,
            outcomes: Vec::new(),
        });
        while let Some(target) = state.tracker.next() {
            self.check_cancelled()?;
            let outcome = self.repair_target(state, &target)?;
            state.outcomes.push((target, outcome));
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), RepairError> {
        if self.cancel.is_cancelled() {
            info!("repair run cancelled");
            return Err(RepairError::Cancelled);
        }
        Ok(())
    }

    fn harness_name(&self) -> String {
        self.harness_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    fn repair_target(
        &self,
        state: &mut RunState,
        target: &ErrorId,
    ) -> Result<TargetOutcome, RepairError> {
        if let Some(record) = state.tracker.get_mut(target) {
            record.processed = true;
            if record.is_untried() {
                record.attempts = 0;
            }
            info!(id = %target, cluster = %record.cluster, error = %record, "repairing error");
        }

        let mut budget = AttemptBudget::from_config(&self.config);
        let mut cause = FailureCause::None;
        let mut index = 0;
        loop {
            if budget.is_exhausted() {
                return Ok(self.abandon(state, target, cause));
            }
            self.check_cancelled()?;
            index += 1;

            debug!(id = %target, attempt = index, phase = ?Phase::Requesting, "attempt phase");
            let Some(proposal) = self.request(state, target, &cause)? else {
                record_attempt(state, target, index, AttemptKind::Half, FailureCause::NoCandidates, Vec::new());
                return Ok(self.abandon(state, target, FailureCause::NoCandidates));
            };
            let edits: Vec<String> = proposal.anchors.iter().map(PatchAnchor::summary).collect();
            if let Some(record) = state.tracker.get_mut(target) {
                record.attempts += 1;
                record.responses.push(proposal.response.clone());
                if let Some(tokens) = &proposal.tokens {
                    record.tokens = tokens.clone();
                }
            }

            match self.attempt(state, target, &proposal.anchors)? {
                AttemptResult::Resolved => {
                    record_attempt(state, target, index, AttemptKind::Full, FailureCause::None, edits);
                    info!(id = %target, attempts = index, "error resolved");
                    return Ok(TargetOutcome::Resolved { attempts: index });
                }
                AttemptResult::Retry { kind, cause: next } => {
                    budget.charge(kind);
                    info!(
                        id = %target,
                        attempt = index,
                        kind = ?kind,
                        cause = %next,
                        "attempt failed"
                    );
                    if kind == AttemptKind::Full {
                        annotate_not_fixed(state, target);
                    }
                    record_attempt(state, target, index, kind, next.clone(), edits);
                    cause = next;
                }
                AttemptResult::Aborted { timed_out } => {
                    let aborted = FailureCause::BuildAborted { timed_out };
                    record_attempt(state, target, index, AttemptKind::Half, aborted.clone(), edits);
                    self.abandon(state, target, aborted);
                    return Err(RepairError::BuildAborted {
                        target: target.clone(),
                        timed_out,
                    });
                }
            }
        }
    }

    fn request(
        &self,
        state: &RunState,
        target: &ErrorId,
        cause: &FailureCause,
    ) -> Result<Option<Proposal>, RepairError> {
        let Some(record) = state.tracker.get(target) else {
            return Ok(None);
        };
        let harness_source = fs::read_to_string(&self.harness_path)
            .with_context(|| format!("Failed to read harness {}", self.harness_path.display()))?;
        let advice = advice_for(record.cluster, &self.harness_name());
        let request = OracleRequest {
            record,
            cause,
            advice: &advice,
            undefined_functions: state.tracker.undefined_functions(),
            symbols: &state.evaluation.symbols,
            trace: state.evaluation.traces.raw(target.as_str()),
            harness_path: &self.harness_path,
            harness_source: &harness_source,
        };

        match self.oracle.propose(&request) {
            Ok(Some(proposal)) if !proposal.anchors.is_empty() => Ok(Some(proposal)),
            Ok(_) => {
                info!(id = %target, "oracle had no candidate edits");
                Ok(None)
            }
            Err(err) => {
                warn!(id = %target, error = %err, "oracle request failed");
                Ok(None)
            }
        }
    }

    fn attempt(
        &self,
        state: &mut RunState,
        target: &ErrorId,
        anchors: &[PatchAnchor],
    ) -> Result<AttemptResult, RepairError> {
        debug!(id = %target, phase = ?Phase::Applying, edits = anchors.len(), "attempt phase");
        let snapshot = HarnessSnapshot::capture(&self.harness_path)?;
        let mut trial = state.ledger.clone();
        let insertions = match patch_harness(&snapshot, anchors, &mut trial) {
            Ok(insertions) => insertions,
            Err(PatchError::Insert(err)) => {
                warn!(id = %target, error = %err, "edit anchor not found");
                return Ok(AttemptResult::Retry {
                    kind: AttemptKind::Half,
                    cause: FailureCause::InsertionAnchorNotFound {
                        function: err.function,
                        previous_line: err.previous_line,
                        next_line: err.next_line,
                    },
                });
            }
            Err(PatchError::Io(err)) => return Err(err.into()),
        };
        self.check_cancelled()?;

        debug!(id = %target, phase = ?Phase::Rebuilding, "attempt phase");
        let build = self
            .runner
            .run(&self.harness_dir, self.config.build_timeout())?;
        if build.aborted() {
            warn!(id = %target, timed_out = build.timed_out, "build aborted");
            return Ok(AttemptResult::Aborted {
                timed_out: build.timed_out,
            });
        }
        if !build.succeeded() {
            return Ok(AttemptResult::Retry {
                kind: AttemptKind::Half,
                cause: FailureCause::BuildSyntaxError {
                    output: build.output_tail(OUTPUT_TAIL_CHARS),
                },
            });
        }
        self.check_cancelled()?;

        debug!(id = %target, phase = ?Phase::Evaluating, "attempt phase");
        let evaluation = match self.evaluator.evaluate(&trial) {
            Ok(evaluation) => evaluation,
            Err(EvaluateError::Report(ReportError::Contradiction(err))) => {
                warn!(id = %target, error = %err, "edit contradicts itself");
                return Ok(AttemptResult::Retry {
                    kind: AttemptKind::Half,
                    cause: FailureCause::NewContradictoryError {
                        line: err.line,
                        messages: err.messages,
                    },
                });
            }
            Err(err) => return Err(err.into()),
        };

        if let Some(cause) = self.coverage_regression(state, target, &evaluation, &trial) {
            warn!(id = %target, cause = %cause, "edit reduced coverage");
            return Ok(AttemptResult::Retry {
                kind: AttemptKind::Half,
                cause,
            });
        }
        if evaluation.contains(target) {
            return Ok(AttemptResult::Retry {
                kind: AttemptKind::Full,
                cause: FailureCause::NotFixed,
            });
        }

        snapshot.commit();
        state.ledger = trial;
        let merged = state
            .tracker
            .merge(target, &evaluation.parsed, &evaluation.failed_results);
        if merged.introduced_new_errors() {
            warn!(
                id = %target,
                introduced = merged.introduced.len(),
                "edit introduced new errors"
            );
        }
        if let Some(record) = state.tracker.get_mut(target) {
            record
                .added_preconditions
                .extend(insertions.into_iter().map(|i| i.description));
        }
        state.evaluation = evaluation;
        Ok(AttemptResult::Resolved)
    }

    /// The line whose reachability an edit for `record` must preserve. For
    /// builtin errors this is the call site in the caller.
    fn watched_line(&self, record: &ErrorRecord, ledger: &LineLedger) -> Option<WatchedLine> {
        let file = record.file.clone()?;
        let (function, line) = if record.is_builtin {
            let caller = record.stack.get(1)?;
            (caller.function.clone(), caller.line)
        } else {
            (record.function.clone(), record.line)
        };
        let raw_line = if is_harness_file(&file, &self.config.harness_suffix) {
            ledger.to_raw(line)?
        } else {
            line
        };
        Some(WatchedLine {
            file,
            function,
            raw_line,
        })
    }

    fn coverage_regression(
        &self,
        state: &RunState,
        target: &ErrorId,
        fresh: &Evaluation,
        trial: &LineLedger,
    ) -> Option<FailureCause> {
        let suffix = &self.config.harness_suffix;
        let before = state.evaluation.coverage.hit_count();
        let after = fresh.coverage.hit_count();

        let mut lost_line = None;
        let mut missed_block = Vec::new();
        if let Some(watched) = state
            .tracker
            .get(target)
            .and_then(|record| self.watched_line(record, &state.ledger))
        {
            let was_hit = match state.evaluation.coverage.is_line_covered(
                &watched.file,
                &watched.function,
                watched.raw_line,
                &state.ledger,
                suffix,
            ) {
                Ok(hit) => hit,
                Err(err) => {
                    warn!(id = %target, error = %err, "target line has no coverage entry");
                    false
                }
            };
            // a function that drops out of the coverage document ran no lines
            let still_hit = match fresh.coverage.is_line_covered(
                &watched.file,
                &watched.function,
                watched.raw_line,
                trial,
                suffix,
            ) {
                Ok(hit) => hit,
                Err(err) => {
                    if was_hit {
                        warn!(id = %target, error = %err, "target function lost its coverage entry");
                    }
                    false
                }
            };
            if was_hit && !still_hit {
                let line = if is_harness_file(&watched.file, suffix) {
                    trial.to_current(watched.raw_line)
                } else {
                    watched.raw_line
                };
                lost_line = Some(line);
                missed_block = fresh
                    .coverage
                    .missed_block_around(&watched.file, &watched.function, line);
            }
        }

        if after < before || lost_line.is_some() {
            Some(FailureCause::CoverageRegressed {
                lost_line,
                missed_block,
            })
        } else {
            None
        }
    }

    fn abandon(&self, state: &mut RunState, target: &ErrorId, cause: FailureCause) -> TargetOutcome {
        state.tracker.mark_failed(target);
        warn!(id = %target, cause = %cause, "giving up on error");
        TargetOutcome::Abandoned { cause }
    }
}

fn record_attempt(
    state: &mut RunState,
    target: &ErrorId,
    index: usize,
    kind: AttemptKind,
    cause: FailureCause,
    edits: Vec<String>,
) {
    state.tracker.record_attempt(
        target,
        AttemptRecord {
            index,
            kind,
            cause,
            edits,
            at: Utc::now(),
        },
    );
}

fn annotate_not_fixed(state: &mut RunState, target: &ErrorId) {
    let Some(record) = state.tracker.get_mut(target) else {
        return;
    };
    let Some(last) = record.responses.last_mut() else {
        return;
    };
    match last {
        Value::Object(map) => {
            map.insert("feedback".to_string(), json!(NOT_FIXED_FEEDBACK));
        }
        other => {
            let response = other.take();
            *other = json!({ "response": response, "feedback": NOT_FIXED_FEEDBACK });
        }
    }
}
