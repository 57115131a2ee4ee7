//! Whole-file harness snapshots.
//!
//! A snapshot holds the harness bytes from before an attempt and an exclusive
//! lock on the harness, so only one mutator works on it at a time. Dropping an
//! uncommitted snapshot writes the original bytes back.

use crate::util::write_atomic;
use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

const LOCK_TIMEOUT_SECS: u64 = 30;
const LOCK_RETRY_MS: u64 = 100;

struct HarnessLock {
    file: File,
}

impl Drop for HarnessLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_path(harness: &Path) -> PathBuf {
    let name = harness
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "harness".to_string());
    harness.with_file_name(format!(".{}.lock", name))
}

fn lock(harness: &Path, timeout: Duration) -> Result<HarnessLock> {
    let path = lock_path(harness);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("Failed to open lock file {}", path.display()))?;

    let start = Instant::now();
    loop {
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => break,
            Err(err) => {
                if err.kind() != ErrorKind::WouldBlock {
                    return Err(err.into());
                }
                if start.elapsed() >= timeout {
                    return Err(anyhow!(
                        "Timed out waiting for harness lock on {} ({}s)",
                        harness.display(),
                        timeout.as_secs()
                    ));
                }
                std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
            }
        }
    }
    Ok(HarnessLock { file })
}

pub struct HarnessSnapshot {
    path: PathBuf,
    original: Vec<u8>,
    committed: bool,
    // held for the snapshot's lifetime; dropped after the restore in `drop`
    _lock: HarnessLock,
}

impl HarnessSnapshot {
    pub fn capture(path: &Path) -> Result<Self> {
        Self::capture_with_timeout(path, Duration::from_secs(LOCK_TIMEOUT_SECS))
    }

    pub fn capture_with_timeout(path: &Path, timeout: Duration) -> Result<Self> {
        let lock = lock(path, timeout)?;
        let original =
            fs::read(path).with_context(|| format!("Failed to read harness {}", path.display()))?;
        debug!(path = %path.display(), bytes = original.len(), "harness snapshot taken");
        Ok(Self {
            path: path.to_path_buf(),
            original,
            committed: false,
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current_text(&self) -> Result<String> {
        fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read harness {}", self.path.display()))
    }

    pub fn write(&self, text: &str) -> Result<()> {
        write_atomic(&self.path, text.as_bytes())
    }

    /// Put the original bytes back. The snapshot stays live.
    pub fn restore(&self) -> Result<()> {
        write_atomic(&self.path, &self.original)?;
        info!(path = %self.path.display(), "harness reverted");
        Ok(())
    }

    /// Keep the current file contents and release the lock.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for HarnessSnapshot {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = self.restore() {
            error!(path = %self.path.display(), error = %err, "failed to revert harness");
        }
    }
}
