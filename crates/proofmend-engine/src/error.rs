use proofmend_adapters::BundleError;
use proofmend_core::{ErrorId, ReportError, StructureError};
use thiserror::Error;

/// Errors that end a repair run. Everything recoverable is turned into a
/// `FailureCause` for the next attempt instead.
#[derive(Debug, Error)]
pub enum RepairError {
    #[error(transparent)]
    Structure(#[from] StructureError),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
    #[error("harness does not build before any edit (exit code {exit_code:?})")]
    InitialBuildFailed { exit_code: Option<i32>, output: String },
    #[error("build aborted while repairing {target} (timed out: {timed_out})")]
    BuildAborted { target: ErrorId, timed_out: bool },
    #[error("repair run cancelled")]
    Cancelled,
}

impl From<BundleError> for RepairError {
    fn from(err: BundleError) -> Self {
        match err {
            BundleError::Io(err) => RepairError::Io(err),
            BundleError::Structure(err) => RepairError::Structure(err),
        }
    }
}

/// Why an evaluation of the rebuilt report failed.
#[derive(Debug, Error)]
pub enum EvaluateError {
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl From<StructureError> for EvaluateError {
    fn from(err: StructureError) -> Self {
        EvaluateError::Report(ReportError::Structure(err))
    }
}

impl From<EvaluateError> for RepairError {
    fn from(err: EvaluateError) -> Self {
        match err {
            EvaluateError::Report(ReportError::Structure(err)) => RepairError::Structure(err),
            // only reachable outside an attempt, where no line was inserted
            EvaluateError::Report(ReportError::Contradiction(err)) => {
                RepairError::Io(anyhow::Error::new(err))
            }
            EvaluateError::Bundle(err) => err.into(),
            EvaluateError::Io(err) => RepairError::Io(err),
        }
    }
}
