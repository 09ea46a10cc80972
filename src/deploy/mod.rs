//! Deployment orchestrator.
//!
//! One call, one construction transaction. The orchestrator waits for the
//! ledger's verdict for as long as block production takes and never
//! resubmits on failure.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    abi::{self, AbiError, Value},
    artifact::Artifact,
    client::{ClientError, LedgerClient},
    descriptor::Descriptor,
    handle::{self, Outcome, TransactionHandle},
    identity::Identity,
    ledger::{contract_address, Address, Rejection, TransactionRequest, TxKind},
    vm::VmError,
};

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("deployment needs {required} gas but the limit is {limit}")]
    ResourceLimitExceeded { required: u64, limit: u64 },
    #[error("deployment rejected: {0}")]
    SubmissionRejected(String),
    #[error("constructor arguments: {0}")]
    Arguments(#[from] AbiError),
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl DeployError {
    fn from_rejection(reason: Rejection) -> Self {
        match reason {
            Rejection::Execution(VmError::OutOfGas { required, limit }) => {
                DeployError::ResourceLimitExceeded { required, limit }
            }
            other => DeployError::SubmissionRejected(other.to_string()),
        }
    }
}

/// A submitted construction transaction that has not been observed to
/// settle yet.
pub struct PendingDeployment {
    handle: TransactionHandle,
    predicted: Address,
    abi: abi::Abi,
    client: Arc<dyn LedgerClient>,
    poll_interval: Duration,
}

impl PendingDeployment {
    pub fn tx_id(&self) -> &str {
        self.handle.id()
    }

    /// Where the machine will live once confirmed. Reads there fail with
    /// not-yet-available until then.
    pub fn predicted_address(&self) -> &str {
        &self.predicted
    }

    pub fn handle(&self) -> &TransactionHandle {
        &self.handle
    }

    /// One status query. `Ok(None)` while still pending.
    pub fn poll(&self) -> Result<Option<Descriptor>, DeployError> {
        if !self.handle.refresh(self.client.as_ref())? {
            return Ok(None);
        }
        self.finish(self.handle.wait()).map(Some)
    }

    /// Block until the ledger settles the transaction.
    pub fn wait(self) -> Result<Descriptor, DeployError> {
        let outcome = handle::observe(self.client.as_ref(), &self.handle, self.poll_interval)?;
        self.finish(outcome)
    }

    fn finish(&self, outcome: Outcome) -> Result<Descriptor, DeployError> {
        match outcome {
            Outcome::Confirmed(receipt) => {
                let address = receipt.contract_address.ok_or_else(|| {
                    DeployError::SubmissionRejected("confirmed without a contract address".into())
                })?;
                if address != self.predicted {
                    warn!(%address, predicted = %self.predicted, "ledger assigned an unexpected address");
                }
                info!(tx = %receipt.tx_id, %address, block = receipt.block, gas_used = receipt.gas_used, "deployment confirmed");
                Ok(Descriptor {
                    address,
                    abi: self.abi.clone(),
                })
            }
            Outcome::Rejected { block, reason } => {
                warn!(tx = %self.handle.id(), block, %reason, "deployment rejected");
                Err(DeployError::from_rejection(reason))
            }
        }
    }
}

pub struct Deployer {
    client: Arc<dyn LedgerClient>,
    poll_interval: Duration,
}

impl Deployer {
    pub fn new(client: Arc<dyn LedgerClient>, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    /// Build, sign and submit the construction transaction.
    pub fn submit(
        &self,
        artifact: &Artifact,
        args: &[Value],
        identity: &Identity,
        gas_limit: u64,
    ) -> Result<PendingDeployment, DeployError> {
        abi::check_args(
            "constructor",
            artifact.constructor.iter().map(|p| p.ty),
            args,
        )?;
        let tx = TransactionRequest::new(
            TxKind::Construct {
                bytecode: artifact.bytecode.clone(),
                args: args.to_vec(),
            },
            gas_limit,
        )
        .sign(identity);
        let id = match self.client.submit(tx) {
            Ok(id) => id,
            Err(ClientError::Ledger(err)) => {
                return Err(DeployError::SubmissionRejected(err.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        let predicted = contract_address(&id);
        debug!(tx = %id, machine = %artifact.name, %predicted, gas_limit, "construction submitted");
        Ok(PendingDeployment {
            handle: TransactionHandle::pending(id),
            predicted,
            abi: artifact.abi.clone(),
            client: self.client.clone(),
            poll_interval: self.poll_interval,
        })
    }

    pub fn deploy(
        &self,
        artifact: &Artifact,
        args: &[Value],
        identity: &Identity,
        gas_limit: u64,
    ) -> Result<Descriptor, DeployError> {
        self.submit(artifact, args, identity, gas_limit)?.wait()
    }
}
