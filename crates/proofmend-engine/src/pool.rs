//! Runs independent harnesses in parallel.
//!
//! Each job gets its own controller, ledger and tracker. Jobs must not share
//! a build directory; two jobs for the same harness file are serialized by
//! the snapshot lock.

use crate::controller::{RepairController, RepairRun};
use crate::error::RepairError;
use anyhow::{Context, Result};
use proofmend_adapters::RepairConfig;
use proofmend_core::{BuildRunner, CancelFlag, RepairOracle};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone)]
pub struct HarnessJob {
    pub harness_path: PathBuf,
    pub config: RepairConfig,
}

impl HarnessJob {
    /// Job with the config found next to the harness.
    pub fn new(harness_path: impl Into<PathBuf>) -> Self {
        let harness_path = harness_path.into();
        let config = RepairConfig::load(harness_path.parent().unwrap_or(Path::new(".")));
        Self {
            harness_path,
            config,
        }
    }

    pub fn with_config(harness_path: impl Into<PathBuf>, config: RepairConfig) -> Self {
        Self {
            harness_path: harness_path.into(),
            config,
        }
    }
}

pub struct RepairPool {
    pool: rayon::ThreadPool,
}

impl RepairPool {
    /// `threads == 0` leaves the choice to rayon.
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("proofmend-worker-{}", i))
            .build()
            .context("Failed to build repair worker pool")?;
        Ok(Self { pool })
    }

    /// Pool sized by `config.parallelism`.
    pub fn from_config(config: &RepairConfig) -> Result<Self> {
        Self::new(config.parallelism)
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Repair every job. Results come back in job order.
    pub fn run_all(
        &self,
        jobs: &[HarnessJob],
        runner: &dyn BuildRunner,
        oracle: &dyn RepairOracle,
        cancel: &CancelFlag,
    ) -> Vec<(PathBuf, Result<RepairRun, RepairError>)> {
        info!(jobs = jobs.len(), threads = self.threads(), "starting repair pool");
        self.pool.install(|| {
            jobs.par_iter()
                .map(|job| {
                    let controller = RepairController::new(
                        job.harness_path.clone(),
                        job.config.clone(),
                        runner,
                        oracle,
                    )
                    .with_cancel(cancel.clone());
                    (job.harness_path.clone(), controller.run())
                })
                .collect()
        })
    }
}
