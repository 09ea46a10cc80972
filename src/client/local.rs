use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{ClientError, LedgerClient};
use crate::{
    abi::Value,
    identity::AccountId,
    ledger::{Block, LedgerSettings, LedgerState, SignedTransaction, TxId, TxStatus},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mining {
    /// Seal a block every interval when transactions are waiting.
    Interval(Duration),
    /// Blocks are sealed only through [`LocalLedger::mine`].
    Manual,
}

struct BlockProducer {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// In-process development ledger.
pub struct LocalLedger {
    state: Arc<Mutex<LedgerState>>,
    producer: Mutex<Option<BlockProducer>>,
    closed: AtomicBool,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl LocalLedger {
    pub fn open(settings: &LedgerSettings, mining: Mining) -> Self {
        let state = Arc::new(Mutex::new(LedgerState::new(settings)));
        let producer = match mining {
            Mining::Interval(interval) => Some(spawn_producer(state.clone(), interval)),
            Mining::Manual => None,
        };
        Self {
            state,
            producer: Mutex::new(producer),
            closed: AtomicBool::new(false),
        }
    }

    /// Seal one block from whatever is pending.
    pub fn mine(&self) -> Option<Block> {
        self.state.lock().mine_block(now_secs())
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending_len()
    }

    pub fn height(&self) -> u64 {
        self.state.lock().height
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        Ok(())
    }
}

fn spawn_producer(state: Arc<Mutex<LedgerState>>, interval: Duration) -> BlockProducer {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let thread = thread::spawn(move || {
        while !flag.load(Ordering::Acquire) {
            thread::sleep(interval);
            if let Some(block) = state.lock().mine_block(now_secs()) {
                debug!(height = block.height, "block producer sealed block");
            }
        }
    });
    BlockProducer { stop, thread }
}

impl LedgerClient for LocalLedger {
    fn accounts(&self) -> Result<Vec<AccountId>, ClientError> {
        self.ensure_open()?;
        Ok(self.state.lock().accounts())
    }

    fn submit(&self, tx: SignedTransaction) -> Result<TxId, ClientError> {
        self.ensure_open()?;
        Ok(self.state.lock().submit(tx)?)
    }

    fn status(&self, id: &str) -> Result<TxStatus, ClientError> {
        self.ensure_open()?;
        Ok(self.state.lock().status(id)?)
    }

    fn call(&self, address: &str, operation: &str, args: &[Value]) -> Result<Value, ClientError> {
        self.ensure_open()?;
        Ok(self.state.lock().call(address, operation, args)?)
    }

    fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(producer) = self.producer.lock().take() {
            producer.stop.store(true, Ordering::Release);
            if producer.thread.join().is_err() {
                warn!("block producer thread panicked");
            }
        }
        Ok(())
    }
}

impl Drop for LocalLedger {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
