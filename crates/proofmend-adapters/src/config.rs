//! Configuration for repair runs
//!
//! Looked up in `<harness_dir>/proofmend.toml`, then
//! `~/.config/proofmend/config.toml`. Missing fields take their defaults.

use proofmend_core::{DerefDedupPolicy, ParseOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const CONFIG_FILE: &str = "proofmend.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Attempts where the edit was verified and the error survived.
    pub max_resolution_attempts: u32,
    /// Cap on all attempts, verified or not.
    pub max_total_attempts: u32,
    pub build_command: Vec<String>,
    pub build_timeout_secs: u64,
    /// Relative to the harness directory.
    pub report_dir: PathBuf,
    pub harness_suffix: String,
    pub deref_dedup: DerefDedupPolicy,
    pub drop_pointer_relation: bool,
    /// Worker threads for running several harnesses; 0 uses rayon's default.
    pub parallelism: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_resolution_attempts: 3,
            max_total_attempts: 6,
            build_command: vec!["make".to_string(), "-j4".to_string()],
            build_timeout_secs: 600,
            report_dir: PathBuf::from("build/report"),
            harness_suffix: "_harness.c".to_string(),
            deref_dedup: DerefDedupPolicy::CollapseToNull,
            drop_pointer_relation: true,
            parallelism: 0,
        }
    }
}

impl RepairConfig {
    fn sanitize(&mut self) {
        if self.max_resolution_attempts == 0 {
            self.max_resolution_attempts = 1;
        }
        if self.max_total_attempts < self.max_resolution_attempts {
            self.max_total_attempts = self.max_resolution_attempts;
        }
        if self.build_command.is_empty() {
            self.build_command = Self::default().build_command;
        }
        if self.build_timeout_secs == 0 {
            self.build_timeout_secs = Self::default().build_timeout_secs;
        }
    }

    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("proofmend").join("config.toml"))
    }

    /// Load the config for a harness directory, or return defaults.
    pub fn load(harness_dir: &Path) -> Self {
        let candidates = std::iter::once(harness_dir.join(CONFIG_FILE)).chain(Self::user_config_path());
        for path in candidates {
            if let Some(config) = Self::load_from(&path) {
                return config;
            }
        }
        Self::default()
    }

    /// `None` when the file is absent or unreadable. A file that does not
    /// parse is moved aside as `*.toml.corrupt`.
    pub fn load_from(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        match toml::from_str::<RepairConfig>(&content) {
            Ok(mut config) => {
                config.sanitize();
                Some(config)
            }
            Err(err) => {
                preserve_corrupt_config(path, &content);
                warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                None
            }
        }
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            harness_suffix: self.harness_suffix.clone(),
            deref_dedup: self.deref_dedup,
            drop_pointer_relation: self.drop_pointer_relation,
        }
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "max_resolution_attempts = 2\nderef_dedup = \"keep_all\"\n",
        )
        .unwrap();
        let config = RepairConfig::load(dir.path());
        assert_eq!(config.max_resolution_attempts, 2);
        assert_eq!(config.max_total_attempts, 6);
        assert_eq!(config.deref_dedup, DerefDedupPolicy::KeepAll);
        assert_eq!(config.build_command, vec!["make", "-j4"]);
    }

    #[test]
    fn corrupt_file_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "max_total_attempts = [").unwrap();
        assert!(RepairConfig::load_from(&path).is_none());
        assert!(!path.exists());
        assert!(dir.path().join("proofmend.toml.corrupt").exists());
    }

    #[test]
    fn sanitize_keeps_caps_consistent() {
        let mut config = RepairConfig {
            max_resolution_attempts: 4,
            max_total_attempts: 2,
            build_command: Vec::new(),
            ..RepairConfig::default()
        };
        config.sanitize();
        assert_eq!(config.max_total_attempts, 4);
        assert_eq!(config.build_command, vec!["make", "-j4"]);
    }
}
