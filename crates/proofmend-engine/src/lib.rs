//! Repair loop for proof harnesses.
//!
//! [`RepairController`] drives one harness through request, apply, rebuild
//! and evaluate until every error is resolved or abandoned. [`RepairPool`]
//! runs several harnesses side by side.

pub mod advice;
pub mod budget;
pub mod controller;
pub mod error;
pub mod evaluate;
pub mod oracle;
pub mod pool;

pub use budget::AttemptBudget;
pub use controller::{RepairController, RepairRun, TargetOutcome};
pub use error::{EvaluateError, RepairError};
pub use evaluate::{Evaluation, Evaluator};
pub use oracle::{NullDerefOracle, OracleChain};
pub use pool::{HarnessJob, RepairPool};
