//! Per-target attempt budget.
//!
//! Full attempts reached verification and the error survived. Half attempts
//! never got that far (anchor miss, build failure, regression, contradiction).
//! Both count towards the overall cap; only full ones count towards the
//! resolution cap.

use proofmend_adapters::RepairConfig;
use proofmend_core::AttemptKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptBudget {
    max_resolution: u32,
    max_total: u32,
    resolution_attempts: u32,
    insertion_attempts: u32,
}

impl AttemptBudget {
    pub fn new(max_resolution: u32, max_total: u32) -> Self {
        Self {
            max_resolution,
            max_total,
            resolution_attempts: 0,
            insertion_attempts: 0,
        }
    }

    pub fn from_config(config: &RepairConfig) -> Self {
        Self::new(config.max_resolution_attempts, config.max_total_attempts)
    }

    pub fn charge(&mut self, kind: AttemptKind) {
        match kind {
            AttemptKind::Full => self.resolution_attempts += 1,
            AttemptKind::Half => self.insertion_attempts += 1,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.resolution_attempts >= self.max_resolution || self.total() >= self.max_total
    }

    pub fn total(&self) -> u32 {
        self.resolution_attempts + self.insertion_attempts
    }

    pub fn resolution_attempts(&self) -> u32 {
        self.resolution_attempts
    }

    pub fn insertion_attempts(&self) -> u32 {
        self.insertion_attempts
    }
}
