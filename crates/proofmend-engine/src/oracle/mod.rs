//! Oracles that need no language model.

mod null_deref;

pub use null_deref::NullDerefOracle;

use anyhow::Result;
use proofmend_core::{OracleRequest, Proposal, RepairOracle};
use tracing::{debug, warn};

/// Asks each oracle in turn and returns the first non-empty proposal.
/// An oracle that errors is skipped.
#[derive(Default)]
pub struct OracleChain {
    oracles: Vec<Box<dyn RepairOracle>>,
}

impl OracleChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, oracle: impl RepairOracle + 'static) -> Self {
        self.oracles.push(Box::new(oracle));
        self
    }

    pub fn len(&self) -> usize {
        self.oracles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.oracles.is_empty()
    }
}

impl RepairOracle for OracleChain {
    fn propose(&self, request: &OracleRequest<'_>) -> Result<Option<Proposal>> {
        for (position, oracle) in self.oracles.iter().enumerate() {
            match oracle.propose(request) {
                Ok(Some(proposal)) if !proposal.anchors.is_empty() => {
                    debug!(position, id = %request.record.id, "oracle proposed edits");
                    return Ok(Some(proposal));
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(position, id = %request.record.id, error = %err, "oracle failed");
                }
            }
        }
        Ok(None)
    }
}
