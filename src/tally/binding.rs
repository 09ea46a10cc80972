//! Tally-specific wrapper over a bound [`Proxy`].

use crate::{
    abi::{Bytes32, Value},
    handle::TransactionHandle,
    identity::Identity,
    proxy::{Proxy, ProxyError},
};

pub const VOTE_OP: &str = "voteForCandidate";
pub const TOTAL_VOTES_OP: &str = "totalVotesFor";
pub const VALID_CANDIDATE_OP: &str = "validCandidate";

#[derive(Clone)]
pub struct TallyBinding {
    proxy: Proxy,
    precheck: bool,
}

impl TallyBinding {
    pub fn new(proxy: Proxy) -> Self {
        Self {
            proxy,
            precheck: false,
        }
    }

    /// Ask `validCandidate` before submitting a vote. The ledger still
    /// rejects strangers either way.
    pub fn with_precheck(mut self, precheck: bool) -> Self {
        self.precheck = precheck;
        self
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn total_votes_for(&self, candidate: &Bytes32) -> Result<u64, ProxyError> {
        let value = self
            .proxy
            .call(TOTAL_VOTES_OP, &[Value::Bytes32(*candidate)])?;
        value
            .as_uint()
            .ok_or_else(|| ProxyError::Invocation(format!("{TOTAL_VOTES_OP} returned {value}")))
    }

    pub fn is_candidate(&self, candidate: &Bytes32) -> Result<bool, ProxyError> {
        let value = self
            .proxy
            .call(VALID_CANDIDATE_OP, &[Value::Bytes32(*candidate)])?;
        value
            .as_bool()
            .ok_or_else(|| ProxyError::Invocation(format!("{VALID_CANDIDATE_OP} returned {value}")))
    }

    pub fn vote(
        &self,
        candidate: &Bytes32,
        identity: &Identity,
    ) -> Result<TransactionHandle, ProxyError> {
        if self.precheck && !self.is_candidate(candidate)? {
            return Err(ProxyError::UnknownCandidate(*candidate));
        }
        self.proxy
            .invoke(VOTE_OP, &[Value::Bytes32(*candidate)], identity)
    }
}
