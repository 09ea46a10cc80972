//! Client-side view of the tally.
//!
//! Slots only ever show what the ledger reported: a placeholder before the
//! first read, then the count read back after load or after a vote settles.

use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    abi::Bytes32,
    handle::{Outcome, TransactionHandle},
    identity::Identity,
    proxy::ProxyError,
    tally::TallyBinding,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Not read yet; renders as zero.
    Placeholder,
    Count(u64),
    Failed(String),
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotState::Placeholder => f.write_str("0"),
            SlotState::Count(n) => write!(f, "{n}"),
            SlotState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Where slot updates land.
pub trait DisplaySurface: Send + Sync {
    fn render(&self, slot: &str, candidate: &Bytes32, state: &SlotState);

    /// Messages that belong to no slot, e.g. a vote for a candidate that is
    /// not on display.
    fn notice(&self, _message: &str) {}
}

#[derive(Debug, Default)]
pub struct TerminalSurface;

impl DisplaySurface for TerminalSurface {
    fn render(&self, slot: &str, candidate: &Bytes32, state: &SlotState) {
        println!("{slot:<14} {candidate:<12} {state}");
    }

    fn notice(&self, message: &str) {
        println!("{message}");
    }
}

/// Keeps every frame in memory.
#[derive(Debug, Default)]
pub struct RecordingSurface {
    frames: Mutex<Vec<(String, SlotState)>>,
    notices: Mutex<Vec<String>>,
}

impl RecordingSurface {
    pub fn frames(&self) -> Vec<(String, SlotState)> {
        self.frames.lock().clone()
    }

    pub fn latest(&self, slot: &str) -> Option<SlotState> {
        self.frames
            .lock()
            .iter()
            .rev()
            .find(|(name, _)| name == slot)
            .map(|(_, state)| state.clone())
    }

    pub fn notices(&self) -> Vec<String> {
        self.notices.lock().clone()
    }
}

impl DisplaySurface for RecordingSurface {
    fn render(&self, slot: &str, _candidate: &Bytes32, state: &SlotState) {
        self.frames.lock().push((slot.to_string(), state.clone()));
    }

    fn notice(&self, message: &str) {
        self.notices.lock().push(message.to_string());
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SlotSpec {
    pub candidate: Bytes32,
    pub slot: String,
}

impl SlotSpec {
    /// `candidate-1`, `candidate-2`, ... in display order.
    pub fn numbered(candidates: &[Bytes32]) -> Vec<Self> {
        candidates
            .iter()
            .enumerate()
            .map(|(idx, candidate)| Self {
                candidate: *candidate,
                slot: format!("candidate-{}", idx + 1),
            })
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    #[error("no candidate selected")]
    NothingSelected,
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

#[derive(Clone)]
struct Reconciler {
    binding: TallyBinding,
    slots: Arc<Vec<SlotSpec>>,
    surface: Arc<dyn DisplaySurface>,
}

impl Reconciler {
    fn slot_for(&self, candidate: &Bytes32) -> Option<&SlotSpec> {
        self.slots.iter().find(|s| s.candidate == *candidate)
    }

    fn show_failure(&self, candidate: &Bytes32, reason: String) {
        match self.slot_for(candidate) {
            Some(spec) => self
                .surface
                .render(&spec.slot, candidate, &SlotState::Failed(reason)),
            None => self
                .surface
                .notice(&format!("vote for {candidate} failed: {reason}")),
        }
    }

    fn refresh(&self, spec: &SlotSpec) -> Result<u64, ProxyError> {
        match self.binding.total_votes_for(&spec.candidate) {
            Ok(count) => {
                self.surface
                    .render(&spec.slot, &spec.candidate, &SlotState::Count(count));
                Ok(count)
            }
            Err(err) => {
                warn!(slot = %spec.slot, candidate = %spec.candidate, error = %err, "tally read failed");
                self.surface.render(
                    &spec.slot,
                    &spec.candidate,
                    &SlotState::Failed(err.to_string()),
                );
                Err(err)
            }
        }
    }

    fn reconcile(&self, candidate: &Bytes32, outcome: &Outcome) {
        match outcome {
            Outcome::Confirmed(receipt) => {
                info!(tx = %receipt.tx_id, %candidate, block = receipt.block, "vote confirmed");
                if let Some(spec) = self.slot_for(candidate) {
                    let _ = self.refresh(spec);
                }
            }
            Outcome::Rejected { reason, .. } => {
                let err = ProxyError::from_rejection(reason);
                warn!(%candidate, error = %err, "vote rejected");
                self.show_failure(candidate, err.to_string());
            }
        }
    }
}

pub struct TallyView {
    reconciler: Reconciler,
    selected: Mutex<Option<Bytes32>>,
}

impl TallyView {
    /// Every slot starts as a placeholder.
    pub fn new(
        binding: TallyBinding,
        slots: Vec<SlotSpec>,
        surface: Arc<dyn DisplaySurface>,
    ) -> Self {
        for spec in &slots {
            surface.render(&spec.slot, &spec.candidate, &SlotState::Placeholder);
        }
        Self {
            reconciler: Reconciler {
                binding,
                slots: Arc::new(slots),
                surface,
            },
            selected: Mutex::new(None),
        }
    }

    pub fn slots(&self) -> &[SlotSpec] {
        &self.reconciler.slots
    }

    /// Read every slot once. Returns how many reads failed; failures are
    /// already rendered.
    pub fn load(&self) -> usize {
        self.reconciler
            .slots
            .iter()
            .filter(|spec| self.reconciler.refresh(spec).is_err())
            .count()
    }

    pub fn select(&self, candidate: Bytes32) {
        *self.selected.lock() = Some(candidate);
    }

    pub fn selected(&self) -> Option<Bytes32> {
        *self.selected.lock()
    }

    /// Vote for the selected candidate. The slot changes only after the
    /// ledger settles the vote.
    pub fn cast_vote(&self, identity: &Identity) -> Result<TransactionHandle, ViewError> {
        let candidate = self.selected().ok_or(ViewError::NothingSelected)?;
        let handle = match self.reconciler.binding.vote(&candidate, identity) {
            Ok(handle) => handle,
            Err(err) => {
                self.reconciler.show_failure(&candidate, err.to_string());
                return Err(err.into());
            }
        };
        let reconciler = self.reconciler.clone();
        handle.on_complete(move |outcome| reconciler.reconcile(&candidate, outcome));
        Ok(handle)
    }

    pub fn vote_for(
        &self,
        candidate: Bytes32,
        identity: &Identity,
    ) -> Result<TransactionHandle, ViewError> {
        self.select(candidate);
        self.cast_vote(identity)
    }
}
