use crate::util::run_command_with_timeout;
use anyhow::{anyhow, Result};
use proofmend_core::{BuildOutcome, BuildRunner};
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Runs the harness build (normally `make`) in the harness directory.
#[derive(Debug, Clone)]
pub struct MakeRunner {
    command: Vec<String>,
}

impl MakeRunner {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl BuildRunner for MakeRunner {
    fn run(&self, workdir: &Path, timeout: Duration) -> Result<BuildOutcome> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("Build command is empty"))?;

        let mut command = Command::new(program);
        command.args(args).current_dir(workdir);

        debug!(command = ?self.command, workdir = %workdir.display(), "starting build");
        let started = Instant::now();
        let result = run_command_with_timeout(&mut command, timeout)?;
        let exit_code = if result.timed_out {
            None
        } else {
            result.status.and_then(|s| s.code())
        };
        info!(
            exit_code = ?exit_code,
            timed_out = result.timed_out,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "build finished"
        );

        Ok(BuildOutcome {
            exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            timed_out: result.timed_out,
        })
    }
}
