use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::Mutex;

use crate::core::errors::SheafError;
use crate::core::Result;
use crate::txn::engine::TransactionEngine;
use crate::txn::listener::TransactionListener;
use crate::txn::tvalue::RowLock;
use crate::txn::undo::{UndoEntry, UndoLog};
use crate::txn::{TxnId, TXN_NONE};

/// `Closed -> Open -> (Committing | Waiting) -> Closed`; `Waiting` returns
/// to `Open` on wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Closed,
    Open,
    Committing,
    Waiting,
}

/// Transitions surfaced to the owning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnEvent {
    Waiting,
    WokenUp,
    Committed,
    RolledBack,
}

/// All four SQL levels are accepted; the engine itself enforces
/// read-committed visibility and blocks writers on row conflicts. Stricter
/// predicates are supplied per read by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// An external party joined to this transaction's outcome (e.g. a
/// replication session propagating the commit to peers).
pub trait Participant: Send + Sync {
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;
}

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);

pub(crate) struct TransactionInner {
    pub(crate) tid: TxnId,
    pub(crate) status: Mutex<TxnStatus>,
    pub(crate) isolation: Mutex<IsolationLevel>,
    pub(crate) undo: Mutex<UndoLog>,
    pub(crate) savepoints: Mutex<HashMap<String, u64>>,
    pub(crate) locked_by: Mutex<TxnId>,
    pub(crate) locks: Mutex<Vec<Arc<RowLock>>>,
    pub(crate) listener: Arc<dyn TransactionListener>,
    pub(crate) deadline: Mutex<Option<Instant>>,
    pub(crate) status_hook: Mutex<Option<Arc<dyn Fn(TxnEvent) + Send + Sync>>>,
    pub(crate) participants: Mutex<Vec<Arc<dyn Participant>>>,
}

impl TransactionInner {
    pub(crate) fn new(tid: TxnId, listener: Arc<dyn TransactionListener>) -> Self {
        Self {
            tid,
            status: Mutex::new(TxnStatus::Open),
            isolation: Mutex::new(IsolationLevel::ReadCommitted),
            undo: Mutex::new(UndoLog::new()),
            savepoints: Mutex::new(HashMap::new()),
            locked_by: Mutex::new(TXN_NONE),
            locks: Mutex::new(Vec::new()),
            listener,
            deadline: Mutex::new(None),
            status_hook: Mutex::new(None),
            participants: Mutex::new(Vec::new()),
        }
    }

    fn fire(&self, event: TxnEvent) {
        let hook = self.status_hook.lock().clone();
        if let Some(hook) = hook {
            hook(event);
        }
    }

    /// Called by the releasing owner for each waiter it wakes.
    pub(crate) fn on_wake(&self) {
        let mut status = self.status.lock();
        if *status == TxnStatus::Waiting {
            *status = TxnStatus::Open;
        }
        drop(status);
        *self.locked_by.lock() = TXN_NONE;
        self.fire(TxnEvent::WokenUp);
    }
}

/// A transaction over the engine's maps: undo log, savepoints, row locks,
/// and a cooperative listener for blocking.
#[derive(Clone)]
pub struct Transaction {
    pub(crate) inner: Arc<TransactionInner>,
    pub(crate) engine: TransactionEngine,
}

impl Transaction {
    pub fn tid(&self) -> TxnId {
        self.inner.tid
    }

    pub fn status(&self) -> TxnStatus {
        *self.inner.status.lock()
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        *self.inner.isolation.lock()
    }

    pub fn set_isolation_level(&self, level: IsolationLevel) {
        *self.inner.isolation.lock() = level;
    }

    pub fn listener(&self) -> Arc<dyn TransactionListener> {
        Arc::clone(&self.inner.listener)
    }

    pub fn set_status_hook(&self, hook: Arc<dyn Fn(TxnEvent) + Send + Sync>) {
        *self.inner.status_hook.lock() = Some(hook);
    }

    pub fn add_participant(&self, participant: Arc<dyn Participant>) {
        self.inner.participants.lock().push(participant);
    }

    pub fn check_open(&self) -> Result<()> {
        match self.status() {
            TxnStatus::Open => Ok(()),
            other => Err(SheafError::InvalidTransactionState(format!(
                "transaction {} is {:?}",
                self.tid(),
                other
            ))),
        }
    }

    /// The transaction this one is currently blocked on, if any.
    pub fn get_locked_by(&self) -> TxnId {
        *self.inner.locked_by.lock()
    }

    pub fn log_id(&self) -> u64 {
        self.inner.undo.lock().log_id()
    }

    pub(crate) fn add_undo(&self, entry: Box<dyn UndoEntry>) {
        self.inner.undo.lock().add(entry);
    }

    pub(crate) fn add_lock(&self, lock: Arc<RowLock>) {
        let mut locks = self.inner.locks.lock();
        if !locks.iter().any(|held| Arc::ptr_eq(held, &lock)) {
            locks.push(lock);
        }
    }

    // ---- savepoints ------------------------------------------------------

    pub fn add_savepoint(&self, name: &str) {
        let id = self.log_id();
        self.inner.savepoints.lock().insert(name.to_string(), id);
    }

    pub fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        let id = self
            .inner
            .savepoints
            .lock()
            .get(name)
            .copied()
            .ok_or_else(|| {
                SheafError::IllegalState(format!("unknown savepoint: {name}"))
            })?;
        self.rollback_to(id)
    }

    /// Pop undo records with index `>= id`, restoring their prior cells.
    /// Waiters on rows released this way are woken to retry.
    pub fn rollback_to(&self, id: u64) -> Result<()> {
        self.check_open()?;
        self.inner.undo.lock().rollback_to(id);
        self.wake_waiters(false);
        Ok(())
    }

    // ---- commit / rollback ----------------------------------------------

    pub fn commit(&self) -> Result<()> {
        self.check_open()?;
        *self.inner.status.lock() = TxnStatus::Committing;

        {
            let mut undo = self.inner.undo.lock();
            if !undo.is_empty() {
                let redo = undo.to_redo_buffer();
                self.engine.append_redo(&redo)?;
            }
            undo.commit_all();
        }

        let participants = std::mem::take(&mut *self.inner.participants.lock());
        for participant in participants {
            participant.commit()?;
        }

        self.wake_waiters(true);
        *self.inner.status.lock() = TxnStatus::Closed;
        self.inner.fire(TxnEvent::Committed);
        self.engine.unregister(self.tid());
        debug!("transaction {} committed", self.tid());
        Ok(())
    }

    /// Commit, then hand `task` to the page-operation pool.
    pub fn async_commit(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.commit()?;
        self.engine.submit_runnable(Box::new(task));
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        match self.status() {
            TxnStatus::Closed => return Ok(()),
            TxnStatus::Committing => {
                return Err(SheafError::InvalidTransactionState(format!(
                    "transaction {} is committing",
                    self.tid()
                )))
            }
            _ => {}
        }
        self.inner.undo.lock().rollback_to(0);

        let participants = std::mem::take(&mut *self.inner.participants.lock());
        for participant in participants {
            participant.rollback()?;
        }

        self.wake_waiters(true);
        *self.inner.status.lock() = TxnStatus::Closed;
        self.inner.fire(TxnEvent::RolledBack);
        self.engine.unregister(self.tid());
        debug!("transaction {} rolled back", self.tid());
        Ok(())
    }

    /// Wake waiters in FIFO order per row. With `release` the lock list is
    /// dropped; a savepoint rollback keeps it, waking spuriously so retriers
    /// re-register on rows this transaction still owns.
    fn wake_waiters(&self, release: bool) {
        let locks: Vec<Arc<RowLock>> = if release {
            std::mem::take(&mut *self.inner.locks.lock())
        } else {
            self.inner.locks.lock().clone()
        };
        for lock in locks {
            for waiter in lock.drain_waiters() {
                if let Some(woken) = self.engine.lookup(waiter.tid) {
                    woken.on_wake();
                }
                waiter.listener.operation_complete();
                if let Some(retry) = waiter.take_retry() {
                    retry();
                }
            }
        }
    }

    // ---- waiting ---------------------------------------------------------

    /// Block until the owner of a contended row resolves. Fails fast on a
    /// wait-for cycle; the detecting transaction aborts.
    pub(crate) fn wait_for(&self, owner: TxnId, key_desc: &str) -> Result<()> {
        if let Err(e) = self.engine.check_deadlock(self.tid(), owner) {
            let _ = self.rollback();
            return Err(e);
        }

        *self.inner.locked_by.lock() = owner;
        *self.inner.status.lock() = TxnStatus::Waiting;
        *self.inner.deadline.lock() = Some(Instant::now() + DEFAULT_LOCK_WAIT);
        self.inner.fire(TxnEvent::Waiting);
        debug!(
            "transaction {} waiting on {} for {}",
            self.tid(),
            owner,
            key_desc
        );

        self.inner.listener.before_operation();
        let waited = self.inner.listener.await_completion(Some(DEFAULT_LOCK_WAIT));

        *self.inner.deadline.lock() = None;
        *self.inner.locked_by.lock() = TXN_NONE;
        let mut status = self.inner.status.lock();
        if *status == TxnStatus::Waiting {
            *status = TxnStatus::Open;
        }
        drop(status);

        if waited.is_err() {
            // A timed-out (or failed) waiter aborts.
            let _ = self.rollback();
        }
        waited
    }

    /// Driven by the scheduler once per loop for each session.
    pub fn check_timeout(&self) {
        if self.status() != TxnStatus::Waiting {
            return;
        }
        let expired = self
            .inner
            .deadline
            .lock()
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false);
        if expired {
            self.inner.listener.set_exception(SheafError::LockTimeout(format!(
                "transaction {} timed out waiting for {}",
                self.tid(),
                self.get_locked_by()
            )));
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("tid", &self.tid())
            .field("status", &self.status())
            .finish()
    }
}
