//! Core domain model for proof-harness repair.
//!
//! Parses the verifier's report documents into tracked error records, keeps
//! line identity stable across harness edits, and defines the contracts the
//! repair loop uses to talk to the build step and the repair oracle.

pub mod cluster;
pub mod codec;
pub mod coverage;
pub mod error;
pub mod ledger;
pub mod patch;
pub mod protocol;
pub mod record;
pub mod report;
pub mod trace;
pub mod tracker;

pub use cluster::ErrorCluster;
pub use error::{CodecError, ContradictionError, InsertError, ReportError, StructureError};
pub use ledger::LineLedger;
pub use protocol::*;
pub use record::{AttemptKind, AttemptRecord, ErrorId, ErrorRecord, StackFrame};
pub use report::{DerefDedupPolicy, ParseOptions, ParsedReport, ReportParser};
pub use tracker::{ErrorReport, ErrorState, MergeOutcome, ResultsReport};
