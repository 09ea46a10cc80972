//! Transaction handles and the watcher that settles them.
//!
//! A handle starts pending and settles exactly once, to confirmed or
//! rejected. Reactions registered on it run exactly once with the terminal
//! outcome, whether they were registered before or after it settled.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::{
    client::{ClientError, LedgerClient},
    ledger::{Receipt, Rejection, TxId, TxStatus},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Confirmed(Receipt),
    Rejected { block: u64, reason: Rejection },
}

impl Outcome {
    fn from_status(status: TxStatus) -> Option<Self> {
        match status {
            TxStatus::Pending => None,
            TxStatus::Confirmed { receipt } => Some(Outcome::Confirmed(receipt)),
            TxStatus::Rejected { block, reason } => Some(Outcome::Rejected { block, reason }),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Outcome::Confirmed(_))
    }
}

type Reaction = Box<dyn FnOnce(&Outcome) + Send + 'static>;

#[derive(Default)]
struct Slot {
    outcome: Option<Outcome>,
    reactions: Vec<Reaction>,
    delivered: bool,
}

struct HandleInner {
    id: TxId,
    slot: Mutex<Slot>,
    settled: Condvar,
}

/// Marks the slot delivered and wakes waiters when dropped, so `wait`
/// returns even if the settling thread unwinds.
struct Delivered<'a>(&'a HandleInner);

impl Drop for Delivered<'_> {
    fn drop(&mut self) {
        self.0.slot.lock().delivered = true;
        self.0.settled.notify_all();
    }
}

#[derive(Clone)]
pub struct TransactionHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.inner.id)
            .field("outcome", &self.inner.slot.lock().outcome)
            .finish()
    }
}

impl TransactionHandle {
    pub fn pending(id: TxId) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                slot: Mutex::new(Slot::default()),
                settled: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn status(&self) -> TxStatus {
        match &self.inner.slot.lock().outcome {
            None => TxStatus::Pending,
            Some(Outcome::Confirmed(receipt)) => TxStatus::Confirmed {
                receipt: receipt.clone(),
            },
            Some(Outcome::Rejected { block, reason }) => TxStatus::Rejected {
                block: *block,
                reason: reason.clone(),
            },
        }
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.slot.lock().outcome.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.inner.slot.lock().outcome.is_none()
    }

    /// Register a completion reaction. Runs on the settling thread, or right
    /// here if the handle has already settled.
    pub fn on_complete<F>(&self, reaction: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        let mut slot = self.inner.slot.lock();
        match slot.outcome.clone() {
            Some(outcome) => {
                drop(slot);
                reaction(&outcome);
            }
            None => slot.reactions.push(Box::new(reaction)),
        }
    }

    /// Block until settled and every reaction registered beforehand has run.
    /// There is no deadline here; see [`Self::wait_timeout`]. Must not be
    /// called from inside a reaction.
    pub fn wait(&self) -> Outcome {
        let mut slot = self.inner.slot.lock();
        loop {
            if let (true, Some(outcome)) = (slot.delivered, &slot.outcome) {
                return outcome.clone();
            }
            self.inner.settled.wait(&mut slot);
        }
    }

    /// `None` means the outcome is unknown, not that the transaction failed:
    /// it may still land after the deadline.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.slot.lock();
        loop {
            if let (true, Some(outcome)) = (slot.delivered, &slot.outcome) {
                return Some(outcome.clone());
            }
            if self.inner.settled.wait_until(&mut slot, deadline).timed_out() {
                return None;
            }
        }
    }

    /// First caller wins; later calls are ignored and return false.
    pub(crate) fn settle(&self, outcome: Outcome) -> bool {
        let reactions = {
            let mut slot = self.inner.slot.lock();
            if slot.outcome.is_some() {
                return false;
            }
            slot.outcome = Some(outcome.clone());
            std::mem::take(&mut slot.reactions)
        };
        let _delivered = Delivered(&self.inner);
        for reaction in reactions {
            if panic::catch_unwind(AssertUnwindSafe(|| reaction(&outcome))).is_err() {
                warn!(tx = %self.inner.id, "completion reaction panicked");
            }
        }
        true
    }

    /// One status query; settles the handle if the ledger reports a verdict.
    pub(crate) fn refresh(&self, client: &dyn LedgerClient) -> Result<bool, ClientError> {
        match Outcome::from_status(client.status(self.id())?) {
            Some(outcome) => {
                self.settle(outcome);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Poll until `handle` settles. No timeout: block production is the
/// ledger's business, not ours.
pub fn observe(
    client: &dyn LedgerClient,
    handle: &TransactionHandle,
    poll_interval: Duration,
) -> Result<Outcome, ClientError> {
    loop {
        if handle.refresh(client)? {
            return Ok(handle.wait());
        }
        debug!(tx = %handle.id(), "waiting for confirmation");
        thread::sleep(poll_interval);
    }
}

struct WatchShared {
    client: Arc<dyn LedgerClient>,
    pending: Mutex<Vec<TransactionHandle>>,
    stop: AtomicBool,
    interval: Duration,
}

/// Background poller that settles every tracked handle.
pub struct ConfirmationWatcher {
    shared: Arc<WatchShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ConfirmationWatcher {
    pub fn start(client: Arc<dyn LedgerClient>, interval: Duration) -> Self {
        let shared = Arc::new(WatchShared {
            client,
            pending: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
            interval,
        });
        let worker = shared.clone();
        let thread = thread::spawn(move || watch_loop(&worker));
        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    pub fn track(&self, handle: TransactionHandle) {
        self.shared.pending.lock().push(handle);
    }

    pub fn tracked(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Stop polling. Handles still pending stay pending; their transactions
    /// may still land on the ledger.
    ///
    /// Called from the watcher thread itself (a reaction dropping the last
    /// owner), this only raises the stop flag; the loop exits after the
    /// current pass.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            debug!("confirmation watcher stopped from its own thread");
            return;
        }
        if thread.join().is_err() {
            warn!("confirmation watcher panicked");
        }
    }
}

impl Drop for ConfirmationWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_loop(shared: &WatchShared) {
    while !shared.stop.load(Ordering::Acquire) {
        thread::sleep(shared.interval);
        let snapshot: Vec<TransactionHandle> = shared.pending.lock().clone();
        if snapshot.is_empty() {
            continue;
        }
        let mut settled = Vec::new();
        for handle in &snapshot {
            match handle.refresh(shared.client.as_ref()) {
                Ok(true) => settled.push(handle.id().to_string()),
                Ok(false) => {}
                Err(err) => warn!(tx = %handle.id(), error = %err, "status query failed"),
            }
        }
        if !settled.is_empty() {
            shared
                .pending
                .lock()
                .retain(|h| !settled.iter().any(|id| id == h.id()));
        }
    }
}
