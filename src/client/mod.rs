//! The ledger endpoint as seen by the orchestrator and the proxy.
//!
//! Every component that talks to the ledger receives an explicit
//! `Arc<dyn LedgerClient>`; nothing reaches for a global connection. A client
//! is opened at start-up and closed once at shutdown.

use crate::{
    abi::Value,
    identity::AccountId,
    ledger::{LedgerError, SignedTransaction, TxId, TxStatus},
};

mod local;

pub use local::{LocalLedger, Mining};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("unexpected response to {request}: {response}")]
    UnexpectedResponse { request: String, response: String },
    #[error("client is closed")]
    Closed,
}

pub trait LedgerClient: Send + Sync {
    /// Accounts the ledger exposes for development use.
    fn accounts(&self) -> Result<Vec<AccountId>, ClientError>;

    /// Submit a signed construction or invocation; returns its id while the
    /// transaction is still pending.
    fn submit(&self, tx: SignedTransaction) -> Result<TxId, ClientError>;

    fn status(&self, id: &str) -> Result<TxStatus, ClientError>;

    /// Read-only invocation against the latest confirmed state.
    fn call(&self, address: &str, operation: &str, args: &[Value]) -> Result<Value, ClientError>;

    fn close(&self) -> Result<(), ClientError>;
}
