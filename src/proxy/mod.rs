//! Typed binding to a deployed machine.
//!
//! [`bind`] turns a descriptor into a dispatch table once. Every later call
//! goes through that table: names it does not hold fail closed, read-only
//! entries only answer [`Proxy::call`] and mutating entries only answer
//! [`Proxy::invoke`].

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tracing::{debug, info};

use crate::{
    abi::{AbiError, Bytes32, Operation, Value},
    client::{ClientError, LedgerClient},
    descriptor::Descriptor,
    handle::{ConfirmationWatcher, TransactionHandle},
    identity::Identity,
    ledger::{LedgerError, Rejection, TransactionRequest, TxKind},
    tally::Revert,
    vm::VmError,
};

pub const DEFAULT_INVOKE_GAS: u64 = 200_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Binding {
    ReadOnly(Operation),
    Mutating(Operation),
}

impl Binding {
    pub fn operation(&self) -> &Operation {
        match self {
            Binding::ReadOnly(op) | Binding::Mutating(op) => op,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Binding::ReadOnly(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("unknown operation {0}")]
    UnknownOperation(String),
    #[error("operation {0} appears twice in the interface")]
    DuplicateOperation(String),
    #[error("operation {0} mutates state; use invoke")]
    NotReadOnly(String),
    #[error("operation {0} is read-only; use call")]
    NotMutating(String),
    #[error(transparent)]
    Arguments(#[from] AbiError),
    #[error("unknown candidate {0}")]
    UnknownCandidate(Bytes32),
    #[error("no confirmed machine at {0} yet")]
    NotYetAvailable(String),
    #[error("invocation failed: {0}")]
    Invocation(String),
    #[error(transparent)]
    Client(ClientError),
}

impl From<ClientError> for ProxyError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Ledger(LedgerError::Execution(err)) => ProxyError::from_vm(err),
            ClientError::Ledger(LedgerError::NotYetAvailable(address)) => {
                ProxyError::NotYetAvailable(address)
            }
            ClientError::Ledger(LedgerError::NotReadOnly(op)) => ProxyError::NotReadOnly(op),
            other => ProxyError::Client(other),
        }
    }
}

impl ProxyError {
    fn from_vm(err: VmError) -> Self {
        match err {
            VmError::Reverted(Revert::UnknownCandidate(candidate)) => {
                ProxyError::UnknownCandidate(candidate)
            }
            other => ProxyError::Invocation(other.to_string()),
        }
    }

    /// Classify a ledger rejection of a mutating call.
    pub fn from_rejection(reason: &Rejection) -> Self {
        match reason {
            Rejection::Execution(err) => ProxyError::from_vm(err.clone()),
            Rejection::NotMutating(op) => ProxyError::NotMutating(op.clone()),
            other => ProxyError::Invocation(other.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindOptions {
    pub poll_interval: Duration,
    pub gas_limit: u64,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            gas_limit: DEFAULT_INVOKE_GAS,
        }
    }
}

struct ProxyInner {
    address: String,
    /// Interface order.
    table: Vec<Binding>,
    index: BTreeMap<String, usize>,
    client: Arc<dyn LedgerClient>,
    watcher: ConfirmationWatcher,
    gas_limit: u64,
}

#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

pub fn bind(
    descriptor: &Descriptor,
    client: Arc<dyn LedgerClient>,
    options: BindOptions,
) -> Result<Proxy, ProxyError> {
    let mut table = Vec::new();
    let mut index = BTreeMap::new();
    for op in descriptor.abi.operations() {
        if index.insert(op.name.clone(), table.len()).is_some() {
            return Err(ProxyError::DuplicateOperation(op.name.clone()));
        }
        table.push(if op.is_read_only() {
            Binding::ReadOnly(op.clone())
        } else {
            Binding::Mutating(op.clone())
        });
    }
    info!(address = %descriptor.address, operations = table.len(), "proxy bound");
    let watcher = ConfirmationWatcher::start(client.clone(), options.poll_interval);
    Ok(Proxy {
        inner: Arc::new(ProxyInner {
            address: descriptor.address.clone(),
            table,
            index,
            client,
            watcher,
            gas_limit: options.gas_limit,
        }),
    })
}

impl Proxy {
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn bindings(&self) -> impl Iterator<Item = (&str, &Binding)> {
        self.inner
            .table
            .iter()
            .map(|b| (b.operation().name.as_str(), b))
    }

    pub fn binding(&self, name: &str) -> Result<&Binding, ProxyError> {
        self.inner
            .index
            .get(name)
            .map(|&at| &self.inner.table[at])
            .ok_or_else(|| ProxyError::UnknownOperation(name.to_string()))
    }

    /// Read-only call against the latest confirmed state.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, ProxyError> {
        let op = match self.binding(name)? {
            Binding::ReadOnly(op) => op,
            Binding::Mutating(_) => return Err(ProxyError::NotReadOnly(name.to_string())),
        };
        op.check_args(args)?;
        let value = self.inner.client.call(&self.inner.address, name, args)?;
        debug!(address = %self.inner.address, operation = name, %value, "call");
        Ok(value)
    }

    /// Submit a mutating call. Returns while the transaction is still pending.
    pub fn invoke(
        &self,
        name: &str,
        args: &[Value],
        identity: &Identity,
    ) -> Result<TransactionHandle, ProxyError> {
        let op = match self.binding(name)? {
            Binding::Mutating(op) => op,
            Binding::ReadOnly(_) => return Err(ProxyError::NotMutating(name.to_string())),
        };
        op.check_args(args)?;
        let tx = TransactionRequest::new(
            TxKind::Invoke {
                address: self.inner.address.clone(),
                operation: name.to_string(),
                args: args.to_vec(),
            },
            self.inner.gas_limit,
        )
        .sign(identity);
        let id = self.inner.client.submit(tx)?;
        debug!(tx = %id, address = %self.inner.address, operation = name, "invocation submitted");
        let handle = TransactionHandle::pending(id);
        self.inner.watcher.track(handle.clone());
        Ok(handle)
    }

    /// Stop the confirmation watcher. The ledger client stays open; it is
    /// owned by whoever opened it.
    pub fn close(&self) {
        self.inner.watcher.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abi::{Abi, Mutability, Param, ParamType},
        client::{LocalLedger, Mining},
        ledger::LedgerSettings,
    };

    fn descriptor() -> Descriptor {
        Descriptor {
            address: "0xABC".into(),
            abi: Abi(vec![
                Operation {
                    name: "totalVotesFor".into(),
                    inputs: vec![Param::new("candidate", ParamType::Bytes32)],
                    outputs: vec![Param::new("", ParamType::Uint)],
                    mutability: Mutability::View,
                },
                Operation {
                    name: "voteForCandidate".into(),
                    inputs: vec![Param::new("candidate", ParamType::Bytes32)],
                    outputs: vec![],
                    mutability: Mutability::Mutating,
                },
            ]),
        }
    }

    fn rama() -> Value {
        Value::Bytes32(Bytes32::from_name("Rama").unwrap())
    }

    fn ledger() -> Arc<dyn LedgerClient> {
        Arc::new(LocalLedger::open(&LedgerSettings::default(), Mining::Manual))
    }

    #[test]
    fn dispatch_table_mirrors_the_descriptor() {
        let proxy = bind(&descriptor(), ledger(), BindOptions::default()).unwrap();
        let names: Vec<(&str, bool)> = proxy
            .bindings()
            .map(|(name, b)| (name, b.is_read_only()))
            .collect();
        assert_eq!(names, vec![("totalVotesFor", true), ("voteForCandidate", false)]);
        proxy.close();
    }

    #[test]
    fn bindings_keep_interface_order() {
        let mut descriptor = descriptor();
        descriptor.abi.0.reverse();
        let proxy = bind(&descriptor, ledger(), BindOptions::default()).unwrap();
        let names: Vec<&str> = proxy.bindings().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["voteForCandidate", "totalVotesFor"]);
        assert!(proxy.binding("totalVotesFor").unwrap().is_read_only());
        proxy.close();
    }

    #[test]
    fn unknown_and_misdirected_names_fail_closed() {
        let proxy = bind(&descriptor(), ledger(), BindOptions::default()).unwrap();
        let who = Identity::dev(8545, 0);
        assert!(matches!(
            proxy.call("castVote", &[rama()]),
            Err(ProxyError::UnknownOperation(_))
        ));
        assert!(matches!(
            proxy.invoke("castVote", &[rama()], &who),
            Err(ProxyError::UnknownOperation(_))
        ));
        assert!(matches!(
            proxy.call("voteForCandidate", &[rama()]),
            Err(ProxyError::NotReadOnly(_))
        ));
        assert!(matches!(
            proxy.invoke("totalVotesFor", &[rama()], &who),
            Err(ProxyError::NotMutating(_))
        ));
        assert!(matches!(
            proxy.call("totalVotesFor", &[Value::Uint(1)]),
            Err(ProxyError::Arguments(_))
        ));
    }

    #[test]
    fn reads_before_deployment_are_not_yet_available() {
        let proxy = bind(&descriptor(), ledger(), BindOptions::default()).unwrap();
        assert!(matches!(
            proxy.call("totalVotesFor", &[rama()]),
            Err(ProxyError::NotYetAvailable(_))
        ));
    }

    #[test]
    fn duplicate_names_are_refused() {
        let mut descriptor = descriptor();
        let first = descriptor.abi.0[0].clone();
        descriptor.abi.0.push(first);
        assert!(matches!(
            bind(&descriptor, ledger(), BindOptions::default()),
            Err(ProxyError::DuplicateOperation(_))
        ));
    }

    #[test]
    fn rejections_are_classified() {
        let unknown = Bytes32::from_name("Unknown").unwrap();
        assert!(matches!(
            ProxyError::from_rejection(&Rejection::Execution(VmError::Reverted(
                Revert::UnknownCandidate(unknown)
            ))),
            ProxyError::UnknownCandidate(c) if c == unknown
        ));
        assert!(matches!(
            ProxyError::from_rejection(&Rejection::Execution(VmError::OutOfGas {
                required: 10,
                limit: 1
            })),
            ProxyError::Invocation(_)
        ));
    }
}
