//! The vote tally state machine the ledger executes.
//!
//! The candidate registry is fixed when the machine is constructed. Every
//! registered candidate owns exactly one counter, starting at zero; nothing
//! else ever gets a counter, so a vote naming a stranger cannot touch state.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::abi::Bytes32;

pub mod binding;

pub use binding::{TallyBinding, TOTAL_VOTES_OP, VALID_CANDIDATE_OP, VOTE_OP};

#[derive(Clone, Debug, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Revert {
    #[error("candidate registry must not be empty")]
    EmptyRegistry,
    #[error("candidate {0} listed more than once")]
    DuplicateCandidate(Bytes32),
    #[error("unknown candidate {0}")]
    UnknownCandidate(Bytes32),
    #[error("index {index} out of range for {len} candidates")]
    IndexOutOfRange { index: u64, len: u64 },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TallyState {
    registry: Vec<Bytes32>,
    counters: BTreeMap<Bytes32, u64>,
}

impl TallyState {
    pub fn construct(candidates: &[Bytes32]) -> Result<Self, Revert> {
        if candidates.is_empty() {
            return Err(Revert::EmptyRegistry);
        }
        let mut seen = BTreeSet::new();
        for candidate in candidates {
            if !seen.insert(*candidate) {
                return Err(Revert::DuplicateCandidate(*candidate));
            }
        }
        Ok(Self {
            registry: candidates.to_vec(),
            counters: candidates.iter().map(|c| (*c, 0)).collect(),
        })
    }

    pub fn candidates(&self) -> &[Bytes32] {
        &self.registry
    }

    pub fn is_candidate(&self, candidate: &Bytes32) -> bool {
        self.counters.contains_key(candidate)
    }

    /// Count one vote; returns the new total.
    pub fn vote(&mut self, candidate: &Bytes32) -> Result<u64, Revert> {
        let counter = self
            .counters
            .get_mut(candidate)
            .ok_or(Revert::UnknownCandidate(*candidate))?;
        *counter += 1;
        Ok(*counter)
    }

    pub fn total_votes_for(&self, candidate: &Bytes32) -> Result<u64, Revert> {
        self.counters
            .get(candidate)
            .copied()
            .ok_or(Revert::UnknownCandidate(*candidate))
    }

    pub fn candidate_at(&self, index: u64) -> Result<Bytes32, Revert> {
        usize::try_from(index)
            .ok()
            .and_then(|idx| self.registry.get(idx))
            .copied()
            .ok_or(Revert::IndexOutOfRange {
                index,
                len: self.registry.len() as u64,
            })
    }

    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"tally");
        for candidate in &self.registry {
            hasher.update(candidate.as_bytes());
            hasher.update(self.counters[candidate].to_le_bytes());
        }
        hasher.finalize().into()
    }
}
