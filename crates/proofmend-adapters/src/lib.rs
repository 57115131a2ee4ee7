//! Filesystem and process adapters for the repair loop.

pub mod config;
pub mod harness;
pub mod reports;
pub mod runner;
pub mod runs;
pub mod snapshot;
pub mod util;

pub use config::RepairConfig;
pub use harness::{patch_harness, PatchError};
pub use reports::{BundleError, ReportBundle, ReportLayout};
pub use runner::MakeRunner;
pub use runs::{RunReport, RunStatus, RunStore};
pub use snapshot::HarnessSnapshot;
