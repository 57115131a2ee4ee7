//! Error taxonomy for report handling and harness edits.
//!
//! Structure and codec errors are fatal to a run. Insert and contradiction
//! errors are recoverable: the controller turns them into the next attempt's
//! failure cause.

use thiserror::Error;

/// A verifier document did not have the shape we expect.
#[derive(Debug, Error)]
pub enum StructureError {
    #[error("{document}: missing {what}")]
    Missing {
        document: &'static str,
        what: String,
    },
    #[error("{document}: unexpected content {found:?} ({context})")]
    Unexpected {
        document: &'static str,
        context: &'static str,
        found: String,
    },
    #[error("trace {id} is referenced by the report but absent from the trace document")]
    MissingTrace { id: String },
    #[error("failure marker for trace {id} found {count} times in its trace page (expected 1)")]
    AmbiguousFailure { id: String, count: usize },
    #[error("{document}: invalid JSON: {source}")]
    Json {
        document: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A verifier struct/array literal could not be rewritten into valid JSON.
#[derive(Debug, Error)]
#[error("unsupported struct literal {literal:?} (rewritten to {rewritten:?}): {source}")]
pub struct CodecError {
    pub literal: String,
    pub rewritten: String,
    #[source]
    pub source: serde_json::Error,
}

/// Neither anchor line of a proposed edit exists in the target function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "could not find {previous_line:?} or {next_line:?} inside function {function}"
)]
pub struct InsertError {
    pub previous_line: String,
    pub next_line: String,
    pub function: String,
}

/// A freshly inserted line is itself the site of verifier errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line} inserted into the harness introduced {} new error(s)", .messages.len())]
pub struct ContradictionError {
    pub line: usize,
    pub messages: Vec<String>,
}

/// Outcome of parsing a report against the current ledger.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Structure(#[from] StructureError),
    #[error(transparent)]
    Contradiction(#[from] ContradictionError),
}

impl From<CodecError> for ReportError {
    fn from(err: CodecError) -> Self {
        ReportError::Structure(StructureError::Codec(err))
    }
}
