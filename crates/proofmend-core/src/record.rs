//! Error records and their per-attempt history.

use crate::cluster::ErrorCluster;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// The verifier's own trace key. Never derived from line numbers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorId(pub String);

impl ErrorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ErrorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ErrorId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub function: String,
    pub line: usize,
}

/// `function -> variable -> value` as readable source text.
pub type ScopedVars = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptKind {
    /// Edit never reached a meaningful verification (bad anchor, syntax error,
    /// regression, contradiction).
    Half,
    /// Edit was verified and the target error survived it.
    Full,
}

/// One pass through the repair loop for a target error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub index: usize,
    pub kind: AttemptKind,
    pub cause: crate::protocol::FailureCause,
    /// `code @ function` for every anchor the oracle proposed.
    pub edits: Vec<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: ErrorId,
    pub function: String,
    /// `None` for errors inside the verifier's builtin library.
    pub file: Option<String>,
    /// Line in the current harness view.
    pub line: usize,
    /// Line before any insertion, if the error lives in the harness file and
    /// was not reported on an inserted line.
    pub raw_line: Option<usize>,
    pub message: String,
    pub cluster: ErrorCluster,
    pub is_builtin: bool,
    /// Relative href of the per-error trace page.
    pub trace_page: String,

    #[serde(default)]
    pub stack: Vec<StackFrame>,
    #[serde(default)]
    pub vars: ScopedVars,

    /// -1 until the controller first targets this error.
    pub attempts: i32,
    #[serde(default)]
    pub added_preconditions: Vec<String>,
    #[serde(default)]
    pub indirectly_resolved: Vec<String>,
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub processed: bool,
    /// Opaque oracle bookkeeping, passed through unmodified.
    #[serde(default)]
    pub tokens: Value,
    #[serde(default)]
    pub responses: Vec<Value>,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
}

impl ErrorRecord {
    pub fn new(
        id: ErrorId,
        function: impl Into<String>,
        file: Option<String>,
        line: usize,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        let is_builtin = file.is_none();
        Self {
            id,
            function: function.into(),
            file,
            line,
            raw_line: Some(line),
            cluster: ErrorCluster::classify(&message),
            message,
            is_builtin,
            trace_page: String::new(),
            stack: Vec::new(),
            vars: ScopedVars::new(),
            attempts: -1,
            added_preconditions: Vec::new(),
            indirectly_resolved: Vec::new(),
            resolved_by: None,
            processed: false,
            tokens: Value::Null,
            responses: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Human-readable identity used in `resolved_by` and `indirectly_resolved`.
    pub fn description(&self) -> String {
        self.to_string()
    }

    pub fn is_untried(&self) -> bool {
        self.attempts < 0
    }

    /// Replace the parse/trace-derived fields with a fresh observation of the
    /// same error, keeping all bookkeeping.
    pub fn refresh_from(&mut self, fresh: &ErrorRecord) {
        self.function = fresh.function.clone();
        self.file = fresh.file.clone();
        self.line = fresh.line;
        self.raw_line = fresh.raw_line;
        self.trace_page = fresh.trace_page.clone();
        self.stack = fresh.stack.clone();
        self.vars = fresh.vars.clone();
    }

    pub fn full_attempts(&self) -> usize {
        self.history
            .iter()
            .filter(|a| a.kind == AttemptKind::Full)
            .count()
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {} Line {}", self.message, self.function, self.line)
    }
}
