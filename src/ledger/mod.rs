use std::collections::{BTreeMap, VecDeque};

use ed25519_dalek::{Signature, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::{
    abi::Value,
    artifact::serde_hex,
    identity::{account_of, AccountId, Identity},
    tally::TallyState,
    vm::{self, Gas, Program, VmError},
};

pub type TxId = String;
pub type Address = String;

pub const DEFAULT_CALL_GAS_CAP: u64 = 10_000_000;

#[derive(Clone, Debug, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum LedgerError {
    #[error("transaction signature does not verify")]
    InvalidSignature,
    #[error("transaction {0} was already submitted")]
    DuplicateTransaction(TxId),
    #[error("unknown transaction {0}")]
    UnknownTransaction(TxId),
    #[error("no confirmed contract at {0} yet")]
    NotYetAvailable(Address),
    #[error("operation {0} changes state and cannot be called read-only")]
    NotReadOnly(String),
    #[error("execution failed: {0}")]
    Execution(VmError),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// What the ledger is asked to do.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TxKind {
    Construct {
        #[serde(with = "serde_hex")]
        bytecode: Vec<u8>,
        args: Vec<Value>,
    },
    Invoke {
        address: Address,
        operation: String,
        args: Vec<Value>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionRequest {
    pub kind: TxKind,
    pub gas_limit: u64,
    /// Random per-submission salt; keeps ids unique across identical requests.
    pub salt: String,
}

impl TransactionRequest {
    pub fn new(kind: TxKind, gas_limit: u64) -> Self {
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        Self {
            kind,
            gas_limit,
            salt: hex::encode(salt),
        }
    }

    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"tally-tx");
        hasher.update(self.salt.as_bytes());
        hasher.update(self.gas_limit.to_le_bytes());
        match &self.kind {
            TxKind::Construct { bytecode, args } => {
                hasher.update(b"construct");
                hasher.update((bytecode.len() as u64).to_le_bytes());
                hasher.update(bytecode);
                hash_values(&mut hasher, args);
            }
            TxKind::Invoke {
                address,
                operation,
                args,
            } => {
                hasher.update(b"invoke");
                hash_str(&mut hasher, address);
                hash_str(&mut hasher, operation);
                hash_values(&mut hasher, args);
            }
        }
        hasher.finalize().into()
    }

    pub fn sign(self, identity: &Identity) -> SignedTransaction {
        let signature = identity.sign(&self.digest());
        SignedTransaction {
            request: self,
            public_key: hex::encode(identity.public_key().as_bytes()),
            signature: signature.to_bytes().to_vec(),
        }
    }
}

fn hash_str(hasher: &mut Sha256, text: &str) {
    hasher.update((text.len() as u64).to_le_bytes());
    hasher.update(text.as_bytes());
}

fn hash_values(hasher: &mut Sha256, values: &[Value]) {
    hasher.update((values.len() as u64).to_le_bytes());
    for value in values {
        match value {
            Value::Bytes32(v) => {
                hasher.update([1u8]);
                hasher.update(v.as_bytes());
            }
            Value::Bytes32List(items) => {
                hasher.update([2u8]);
                hasher.update((items.len() as u64).to_le_bytes());
                for item in items {
                    hasher.update(item.as_bytes());
                }
            }
            Value::Uint(v) => {
                hasher.update([3u8]);
                hasher.update(v.to_le_bytes());
            }
            Value::Bool(v) => hasher.update([4u8, u8::from(*v)]),
            Value::Unit => hasher.update([0u8]),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedTransaction {
    pub request: TransactionRequest,
    pub public_key: String,
    #[serde(with = "serde_hex")]
    pub signature: Vec<u8>,
}

impl SignedTransaction {
    pub fn id(&self) -> TxId {
        let mut hasher = Sha256::new();
        hasher.update(self.request.digest());
        hasher.update(&self.signature);
        format!("0x{}", hex::encode(hasher.finalize()))
    }

    fn verifying_key(&self) -> Result<VerifyingKey, LedgerError> {
        let raw: [u8; 32] = hex::decode(&self.public_key)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(LedgerError::InvalidSignature)?;
        VerifyingKey::from_bytes(&raw).map_err(|_| LedgerError::InvalidSignature)
    }

    pub fn sender(&self) -> Result<AccountId, LedgerError> {
        Ok(account_of(&self.verifying_key()?))
    }

    pub fn verify(&self) -> Result<(), LedgerError> {
        let key = self.verifying_key()?;
        let signature =
            Signature::from_slice(&self.signature).map_err(|_| LedgerError::InvalidSignature)?;
        key.verify_strict(&self.request.digest(), &signature)
            .map_err(|_| LedgerError::InvalidSignature)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    pub tx_id: TxId,
    pub block: u64,
    pub gas_used: u64,
    pub contract_address: Option<Address>,
    pub output: Value,
}

#[derive(Clone, Debug, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Rejection {
    #[error("{0}")]
    Execution(VmError),
    #[error("no contract at {0}")]
    UnknownContract(Address),
    #[error("operation {0} is read-only and takes no transactions")]
    NotMutating(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Confirmed { receipt: Receipt },
    Rejected { block: u64, reason: Rejection },
}

impl TxStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, TxStatus::Pending)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub height: u64,
    pub timestamp: u64,
    pub transactions: Vec<TxId>,
    pub state_root: [u8; 32],
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    ContractCreated {
        tx: TxId,
        address: Address,
        creator: AccountId,
    },
    Invoked {
        tx: TxId,
        address: Address,
        operation: String,
        sender: AccountId,
    },
    Rejected {
        tx: TxId,
        reason: String,
    },
}

pub struct ContractAccount {
    pub creator: AccountId,
    pub code: Vec<u8>,
    pub program: Program,
    pub state: TallyState,
    pub created_in: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerSettings {
    pub dev_seed: u64,
    pub dev_accounts: u32,
    pub call_gas_cap: u64,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            dev_seed: 8545,
            dev_accounts: 10,
            call_gas_cap: DEFAULT_CALL_GAS_CAP,
        }
    }
}

/// Serial executor: transactions wait in arrival order and a block applies
/// them one at a time, each to completion before the next begins.
#[derive(Default)]
pub struct LedgerState {
    pub height: u64,
    pub timestamp: u64,
    pub blocks: Vec<Block>,
    pub events: Vec<LedgerEvent>,
    pending: VecDeque<(TxId, SignedTransaction)>,
    statuses: BTreeMap<TxId, TxStatus>,
    contracts: BTreeMap<Address, ContractAccount>,
    accounts: Vec<AccountId>,
    call_gas_cap: u64,
}

impl LedgerState {
    pub fn new(settings: &LedgerSettings) -> Self {
        Self {
            accounts: Identity::dev_accounts(settings.dev_seed, settings.dev_accounts),
            call_gas_cap: settings.call_gas_cap,
            ..Self::default()
        }
    }

    pub fn accounts(&self) -> Vec<AccountId> {
        self.accounts.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn contract(&self, address: &str) -> Option<&ContractAccount> {
        self.contracts.get(address)
    }

    pub fn submit(&mut self, tx: SignedTransaction) -> Result<TxId, LedgerError> {
        tx.verify()?;
        let id = tx.id();
        if self.statuses.contains_key(&id) {
            return Err(LedgerError::DuplicateTransaction(id));
        }
        debug!(tx = %id, "transaction queued");
        self.statuses.insert(id.clone(), TxStatus::Pending);
        self.pending.push_back((id.clone(), tx));
        Ok(id)
    }

    pub fn status(&self, id: &str) -> Result<TxStatus, LedgerError> {
        self.statuses
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownTransaction(id.to_string()))
    }

    /// Read-only execution against the latest confirmed state.
    pub fn call(&self, address: &str, operation: &str, args: &[Value]) -> Result<Value, LedgerError> {
        let contract = self
            .contracts
            .get(address)
            .ok_or_else(|| LedgerError::NotYetAvailable(address.to_string()))?;
        let function = contract
            .program
            .function(operation)
            .ok_or_else(|| LedgerError::Execution(VmError::UnknownOperation(operation.to_string())))?;
        if function.mutability != crate::abi::Mutability::View {
            return Err(LedgerError::NotReadOnly(operation.to_string()));
        }
        let mut scratch = contract.state.clone();
        let mut gas = Gas::new(self.call_gas_cap);
        vm::execute(&contract.program, operation, args, &mut scratch, &mut gas)
            .map_err(LedgerError::Execution)
    }

    /// Apply every pending transaction and seal a block. Nothing happens when
    /// the pool is empty.
    pub fn mine_block(&mut self, timestamp: u64) -> Option<Block> {
        if self.pending.is_empty() {
            return None;
        }
        let height = self.height + 1;
        let mut included = Vec::with_capacity(self.pending.len());
        while let Some((id, tx)) = self.pending.pop_front() {
            let status = match self.apply(&id, &tx, height) {
                Ok(receipt) => TxStatus::Confirmed { receipt },
                Err(reason) => {
                    self.events.push(LedgerEvent::Rejected {
                        tx: id.clone(),
                        reason: reason.to_string(),
                    });
                    TxStatus::Rejected {
                        block: height,
                        reason,
                    }
                }
            };
            self.statuses.insert(id.clone(), status);
            included.push(id);
        }
        let block = Block {
            height,
            timestamp,
            transactions: included,
            state_root: compute_state_root(&self.contracts),
        };
        self.height = height;
        self.timestamp = timestamp;
        self.blocks.push(block.clone());
        info!(
            height,
            transactions = block.transactions.len(),
            "block sealed"
        );
        Some(block)
    }

    fn apply(&mut self, id: &TxId, tx: &SignedTransaction, height: u64) -> Result<Receipt, Rejection> {
        let sender = tx
            .sender()
            .map_err(|_| Rejection::Execution(VmError::BadArguments("unreadable sender".into())))?;
        let mut gas = Gas::new(tx.request.gas_limit);
        match &tx.request.kind {
            TxKind::Construct { bytecode, args } => {
                gas.charge(vm::creation_cost(bytecode.len()))
                    .map_err(Rejection::Execution)?;
                let program = Program::decode(bytecode).map_err(Rejection::Execution)?;
                let state = vm::construct(&program, args, &mut gas).map_err(Rejection::Execution)?;
                let address = contract_address(id);
                self.contracts.insert(
                    address.clone(),
                    ContractAccount {
                        creator: sender.clone(),
                        code: bytecode.clone(),
                        program,
                        state,
                        created_in: height,
                    },
                );
                self.events.push(LedgerEvent::ContractCreated {
                    tx: id.clone(),
                    address: address.clone(),
                    creator: sender,
                });
                Ok(Receipt {
                    tx_id: id.clone(),
                    block: height,
                    gas_used: gas.used(),
                    contract_address: Some(address),
                    output: Value::Unit,
                })
            }
            TxKind::Invoke {
                address,
                operation,
                args,
            } => {
                let contract = self
                    .contracts
                    .get_mut(address)
                    .ok_or_else(|| Rejection::UnknownContract(address.clone()))?;
                let function = contract
                    .program
                    .function(operation)
                    .ok_or_else(|| Rejection::Execution(VmError::UnknownOperation(operation.clone())))?;
                if function.mutability == crate::abi::Mutability::View {
                    return Err(Rejection::NotMutating(operation.clone()));
                }
                gas.charge(vm::GAS_TX_BASE).map_err(Rejection::Execution)?;
                let output = vm::execute(&contract.program, operation, args, &mut contract.state, &mut gas)
                    .map_err(Rejection::Execution)?;
                self.events.push(LedgerEvent::Invoked {
                    tx: id.clone(),
                    address: address.clone(),
                    operation: operation.clone(),
                    sender,
                });
                Ok(Receipt {
                    tx_id: id.clone(),
                    block: height,
                    gas_used: gas.used(),
                    contract_address: None,
                    output,
                })
            }
        }
    }
}

/// `0x` followed by the first 20 bytes of SHA-256("contract" ‖ tx id).
pub fn contract_address(tx_id: &str) -> Address {
    let mut hasher = Sha256::new();
    hasher.update(b"contract");
    hasher.update(tx_id.as_bytes());
    let digest = hasher.finalize();
    format!("0x{}", hex::encode(&digest[..20]))
}

fn compute_state_root(contracts: &BTreeMap<Address, ContractAccount>) -> [u8; 32] {
    let leaves = contracts
        .iter()
        .map(|(address, contract)| {
            let mut hasher = Sha256::new();
            hasher.update(b"contract");
            hasher.update(address.as_bytes());
            hasher.update(Sha256::digest(&contract.code));
            hasher.update(contract.state.digest());
            hasher.finalize().into()
        })
        .collect();
    build_merkle(leaves)
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"tally-ledger-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{abi::Bytes32, artifact, tally::Revert};

    const VOTING: &str = include_str!("../../demos/Voting.tally");

    fn candidates(names: &[&str]) -> Value {
        Value::Bytes32List(names.iter().map(|n| Bytes32::from_name(n).unwrap()).collect())
    }

    fn name(n: &str) -> Value {
        Value::Bytes32(Bytes32::from_name(n).unwrap())
    }

    fn deploy(ledger: &mut LedgerState, who: &Identity) -> Address {
        let artifact = artifact::produce(VOTING).unwrap();
        let tx = TransactionRequest::new(
            TxKind::Construct {
                bytecode: artifact.bytecode,
                args: vec![candidates(&["Rama", "Nick", "Claudius"])],
            },
            4_700_000,
        )
        .sign(who);
        let id = ledger.submit(tx).unwrap();
        ledger.mine_block(1).unwrap();
        match ledger.status(&id).unwrap() {
            TxStatus::Confirmed { receipt } => receipt.contract_address.unwrap(),
            other => panic!("deployment not confirmed: {other:?}"),
        }
    }

    fn vote(who: &Identity, address: &str, candidate: &str) -> SignedTransaction {
        TransactionRequest::new(
            TxKind::Invoke {
                address: address.to_string(),
                operation: "voteForCandidate".into(),
                args: vec![name(candidate)],
            },
            100_000,
        )
        .sign(who)
    }

    #[test]
    fn reads_before_confirmation_are_not_yet_available() {
        let mut ledger = LedgerState::new(&LedgerSettings::default());
        let who = Identity::dev(8545, 0);
        let artifact = artifact::produce(VOTING).unwrap();
        let tx = TransactionRequest::new(
            TxKind::Construct {
                bytecode: artifact.bytecode,
                args: vec![candidates(&["Rama"])],
            },
            4_700_000,
        )
        .sign(&who);
        let id = ledger.submit(tx).unwrap();
        let predicted = contract_address(&id);
        assert_eq!(ledger.status(&id).unwrap(), TxStatus::Pending);
        assert_eq!(
            ledger.call(&predicted, "totalVotesFor", &[name("Rama")]),
            Err(LedgerError::NotYetAvailable(predicted.clone()))
        );
        ledger.mine_block(1).unwrap();
        assert_eq!(
            ledger.call(&predicted, "totalVotesFor", &[name("Rama")]),
            Ok(Value::Uint(0))
        );
    }

    #[test]
    fn votes_apply_serially_within_a_block() {
        let mut ledger = LedgerState::new(&LedgerSettings::default());
        let who = Identity::dev(8545, 0);
        let address = deploy(&mut ledger, &who);
        for idx in 0..5 {
            ledger.submit(vote(&Identity::dev(8545, idx), &address, "Rama")).unwrap();
        }
        let block = ledger.mine_block(2).unwrap();
        assert_eq!(block.transactions.len(), 5);
        assert_eq!(ledger.call(&address, "totalVotesFor", &[name("Rama")]), Ok(Value::Uint(5)));
        assert_eq!(ledger.call(&address, "totalVotesFor", &[name("Nick")]), Ok(Value::Uint(0)));
    }

    #[test]
    fn unknown_candidate_vote_is_rejected_without_effect() {
        let mut ledger = LedgerState::new(&LedgerSettings::default());
        let who = Identity::dev(8545, 0);
        let address = deploy(&mut ledger, &who);
        let root_before = ledger.blocks.last().unwrap().state_root;
        let id = ledger.submit(vote(&who, &address, "Unknown")).unwrap();
        let block = ledger.mine_block(2).unwrap();
        match ledger.status(&id).unwrap() {
            TxStatus::Rejected { reason, .. } => assert_eq!(
                reason,
                Rejection::Execution(VmError::Reverted(Revert::UnknownCandidate(
                    Bytes32::from_name("Unknown").unwrap()
                )))
            ),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(block.state_root, root_before);
        assert!(matches!(ledger.events.last(), Some(LedgerEvent::Rejected { .. })));
    }

    #[test]
    fn deployment_over_gas_limit_is_rejected() {
        let mut ledger = LedgerState::new(&LedgerSettings::default());
        let who = Identity::dev(8545, 0);
        let artifact = artifact::produce(VOTING).unwrap();
        let tx = TransactionRequest::new(
            TxKind::Construct {
                bytecode: artifact.bytecode,
                args: vec![candidates(&["Rama"])],
            },
            50_000,
        )
        .sign(&who);
        let id = ledger.submit(tx).unwrap();
        ledger.mine_block(1).unwrap();
        assert!(matches!(
            ledger.status(&id).unwrap(),
            TxStatus::Rejected {
                reason: Rejection::Execution(VmError::OutOfGas { limit: 50_000, .. }),
                ..
            }
        ));
        assert!(ledger.contracts.is_empty());
    }

    #[test]
    fn duplicate_and_forged_submissions_are_refused() {
        let mut ledger = LedgerState::new(&LedgerSettings::default());
        let who = Identity::dev(8545, 0);
        let tx = vote(&who, "0xabc", "Rama");
        ledger.submit(tx.clone()).unwrap();
        assert!(matches!(
            ledger.submit(tx.clone()),
            Err(LedgerError::DuplicateTransaction(_))
        ));
        let mut forged = tx;
        forged.request.gas_limit += 1;
        assert_eq!(ledger.submit(forged), Err(LedgerError::InvalidSignature));
    }

    #[test]
    fn read_only_and_mutating_paths_are_kept_apart() {
        let mut ledger = LedgerState::new(&LedgerSettings::default());
        let who = Identity::dev(8545, 0);
        let address = deploy(&mut ledger, &who);
        assert_eq!(
            ledger.call(&address, "voteForCandidate", &[name("Rama")]),
            Err(LedgerError::NotReadOnly("voteForCandidate".into()))
        );
        let tx = TransactionRequest::new(
            TxKind::Invoke {
                address: address.clone(),
                operation: "totalVotesFor".into(),
                args: vec![name("Rama")],
            },
            100_000,
        )
        .sign(&who);
        let id = ledger.submit(tx).unwrap();
        ledger.mine_block(2).unwrap();
        assert!(matches!(
            ledger.status(&id).unwrap(),
            TxStatus::Rejected {
                reason: Rejection::NotMutating(_),
                ..
            }
        ));
    }

    #[test]
    fn empty_pool_seals_nothing() {
        let mut ledger = LedgerState::new(&LedgerSettings::default());
        assert!(ledger.mine_block(1).is_none());
        assert_eq!(ledger.height, 0);
        assert_eq!(ledger.accounts().len(), 10);
    }
}
