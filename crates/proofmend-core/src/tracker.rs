//! Error-state tracker
//!
//! Every known error id sits in exactly one of three sets. Ids only move
//! `unresolved -> resolved`, `unresolved -> failed` or `failed -> resolved`,
//! and the union of the three sets never shrinks.

use crate::cluster::ErrorCluster;
use crate::record::{AttemptRecord, ErrorId, ErrorRecord};
use crate::report::ParsedReport;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorState {
    Unresolved,
    Resolved,
    Failed,
}

/// What changed when a fresh report was merged in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub target_resolved: bool,
    /// Other ids that disappeared along with the target.
    pub indirectly_resolved: Vec<ErrorId>,
    /// Ids never seen before this report.
    pub introduced: Vec<ErrorId>,
    /// Resolved ids that showed up again. They stay resolved.
    pub reappeared: Vec<ErrorId>,
}

impl MergeOutcome {
    pub fn introduced_new_errors(&self) -> bool {
        !self.introduced.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ErrorReport {
    records: BTreeMap<ErrorId, ErrorRecord>,
    clusters: BTreeMap<ErrorCluster, BTreeSet<ErrorId>>,
    unresolved: BTreeSet<ErrorId>,
    resolved: BTreeSet<ErrorId>,
    failed: BTreeSet<ErrorId>,
    initial: BTreeMap<ErrorCluster, Vec<String>>,
    undefined_functions: Vec<String>,
}

impl ErrorReport {
    pub fn from_parsed(parsed: ParsedReport) -> Self {
        let mut report = Self {
            undefined_functions: parsed.undefined_functions,
            ..Self::default()
        };
        for (cluster, errors) in parsed.clusters {
            for (id, record) in errors {
                report
                    .initial
                    .entry(cluster)
                    .or_default()
                    .push(record.description());
                report.clusters.entry(cluster).or_default().insert(id.clone());
                report.unresolved.insert(id.clone());
                report.records.insert(id, record);
            }
        }
        report
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &ErrorId) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &ErrorId) -> Option<&ErrorRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &ErrorId) -> Option<&mut ErrorRecord> {
        self.records.get_mut(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.records.values()
    }

    pub fn unresolved(&self) -> &BTreeSet<ErrorId> {
        &self.unresolved
    }

    pub fn resolved(&self) -> &BTreeSet<ErrorId> {
        &self.resolved
    }

    pub fn failed(&self) -> &BTreeSet<ErrorId> {
        &self.failed
    }

    pub fn undefined_functions(&self) -> &[String] {
        &self.undefined_functions
    }

    pub fn state(&self, id: &ErrorId) -> Option<ErrorState> {
        if self.unresolved.contains(id) {
            Some(ErrorState::Unresolved)
        } else if self.resolved.contains(id) {
            Some(ErrorState::Resolved)
        } else if self.failed.contains(id) {
            Some(ErrorState::Failed)
        } else {
            None
        }
    }

    /// Highest-priority unresolved error.
    pub fn next(&self) -> Option<ErrorId> {
        self.next_excluding(&BTreeSet::new())
    }

    pub fn next_excluding(&self, skip: &BTreeSet<ErrorId>) -> Option<ErrorId> {
        self.clusters
            .values()
            .flat_map(|ids| ids.iter())
            .find(|id| self.unresolved.contains(*id) && !skip.contains(*id))
            .cloned()
    }

    /// Move an unresolved error to `failed`. Returns false for any other state.
    pub fn mark_failed(&mut self, id: &ErrorId) -> bool {
        if !self.unresolved.remove(id) {
            return false;
        }
        self.failed.insert(id.clone());
        info!(id = %id, "error marked failed");
        true
    }

    /// Merge a report taken after an edit aimed at `target`. Ids in
    /// `also_present` count as still present even if the parse dropped them.
    pub fn merge(
        &mut self,
        target: &ErrorId,
        fresh: &ParsedReport,
        also_present: &BTreeSet<ErrorId>,
    ) -> MergeOutcome {
        let mut present = fresh.ids();
        present.extend(also_present.iter().cloned());

        let target_description = self
            .records
            .get(target)
            .map(ErrorRecord::description)
            .unwrap_or_else(|| target.to_string());

        let disappeared: Vec<ErrorId> = self
            .unresolved
            .union(&self.failed)
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect();

        let mut outcome = MergeOutcome::default();
        let mut side_effects = Vec::new();
        for id in disappeared {
            self.unresolved.remove(&id);
            self.failed.remove(&id);
            self.resolved.insert(id.clone());
            if &id == target {
                outcome.target_resolved = true;
                continue;
            }
            if let Some(record) = self.records.get_mut(&id) {
                record.resolved_by = Some(target_description.clone());
                side_effects.push(record.description());
            }
            info!(id = %id, by = %target, "error resolved indirectly");
            outcome.indirectly_resolved.push(id);
        }
        if let Some(record) = self.records.get_mut(target) {
            record.indirectly_resolved.extend(side_effects);
        }

        for fresh_record in fresh.records() {
            let id = &fresh_record.id;
            match self.records.get_mut(id) {
                Some(known) => {
                    known.refresh_from(fresh_record);
                    if self.resolved.contains(id) {
                        warn!(id = %id, "resolved error reported again; keeping it resolved");
                        outcome.reappeared.push(id.clone());
                    }
                }
                None => {
                    warn!(
                        id = %id,
                        error = %fresh_record,
                        "new error introduced by edit"
                    );
                    self.clusters
                        .entry(fresh_record.cluster)
                        .or_default()
                        .insert(id.clone());
                    self.unresolved.insert(id.clone());
                    self.records.insert(id.clone(), fresh_record.clone());
                    outcome.introduced.push(id.clone());
                }
            }
        }
        for name in &fresh.undefined_functions {
            if !self.undefined_functions.contains(name) {
                self.undefined_functions.push(name.clone());
            }
        }
        outcome
    }

    /// Errors currently reported at `function:line`.
    pub fn errors_at(&self, function: &str, line: usize) -> Vec<&ErrorRecord> {
        self.records
            .values()
            .filter(|r| r.function == function && r.line == line)
            .collect()
    }

    pub fn record_attempt(&mut self, id: &ErrorId, attempt: AttemptRecord) {
        if let Some(record) = self.records.get_mut(id) {
            record.history.push(attempt);
        }
    }

    pub fn results_report(&self) -> ResultsReport {
        let mut report = ResultsReport {
            initial_errors: InitialErrors {
                total: self.initial.values().map(Vec::len).sum(),
                by_cluster: self.initial.clone(),
            },
            ..ResultsReport::default()
        };
        for (id, record) in &self.records {
            if !record.processed {
                continue;
            }
            let summary = ErrorSummary::from(record);
            if self.failed.contains(id) || record.resolved_by.is_some() {
                report.processed_errors.failure.insert(id.clone(), summary);
            } else {
                report
                    .preconditions_added
                    .extend(record.added_preconditions.iter().cloned());
                report.processed_errors.success.insert(id.clone(), summary);
            }
        }
        report.unresolved = self.unresolved.iter().cloned().collect();
        report
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitialErrors {
    pub total: usize,
    pub by_cluster: BTreeMap<ErrorCluster, Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessedErrors {
    pub success: BTreeMap<ErrorId, ErrorSummary>,
    pub failure: BTreeMap<ErrorId, ErrorSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub function: String,
    pub line: usize,
    pub message: String,
    pub attempts: i32,
    pub added_preconditions: Vec<String>,
    pub indirectly_resolved: Vec<String>,
    pub resolved_by: Option<String>,
    pub tokens: Value,
    pub responses: Vec<Value>,
    pub history: Vec<AttemptRecord>,
}

impl From<&ErrorRecord> for ErrorSummary {
    fn from(record: &ErrorRecord) -> Self {
        Self {
            function: record.function.clone(),
            line: record.line,
            message: record.message.clone(),
            attempts: record.attempts,
            added_preconditions: record.added_preconditions.clone(),
            indirectly_resolved: record.indirectly_resolved.clone(),
            resolved_by: record.resolved_by.clone(),
            tokens: record.tokens.clone(),
            responses: record.responses.clone(),
            history: record.history.clone(),
        }
    }
}

/// Summary of a run over one harness.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultsReport {
    pub initial_errors: InitialErrors,
    pub processed_errors: ProcessedErrors,
    pub preconditions_added: Vec<String>,
    pub unresolved: Vec<ErrorId>,
}
