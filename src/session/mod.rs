pub mod pool;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::core::errors::SheafError;
use crate::core::Result;
use crate::repl::ReplicationName;
use crate::txn::{Transaction, TransactionEngine, TransactionListener, TxnEvent};

pub use pool::{SessionFactory, SessionPool};

/// Where a session lives relative to the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    /// In-process caller; never cached in the pool.
    Local,
    /// Client-side handle onto a remote server, keyed by its URL.
    Client { url: String },
    /// Server-side session bound to one connection; closed on release.
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Running,
    Waiting,
    RetryingReturnResult,
    Closed,
}

/// Unit of authentication and transaction ownership. A session's lifetime
/// is bounded by its connection unless it is the `root` session, which
/// outlives individual connections.
pub struct Session {
    id: u64,
    connection_id: Uuid,
    kind: SessionKind,
    host_id: String,
    root: bool,
    status: Mutex<SessionStatus>,
    closed: AtomicBool,
    repl_seq: AtomicU64,
    engine: TransactionEngine,
    txn: Mutex<Option<Transaction>>,
}

impl Session {
    pub fn new(id: u64, kind: SessionKind, host_id: impl Into<String>, engine: TransactionEngine) -> Arc<Self> {
        Arc::new(Self {
            id,
            connection_id: Uuid::new_v4(),
            kind,
            host_id: host_id.into(),
            root: false,
            status: Mutex::new(SessionStatus::Idle),
            closed: AtomicBool::new(false),
            repl_seq: AtomicU64::new(0),
            engine,
            txn: Mutex::new(None),
        })
    }

    pub fn new_root(id: u64, host_id: impl Into<String>, engine: TransactionEngine) -> Arc<Self> {
        Arc::new(Self {
            id,
            connection_id: Uuid::new_v4(),
            kind: SessionKind::Local,
            host_id: host_id.into(),
            root: true,
            status: Mutex::new(SessionStatus::Idle),
            closed: AtomicBool::new(false),
            repl_seq: AtomicU64::new(0),
            engine,
            txn: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn kind(&self) -> &SessionKind {
        &self.kind
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: SessionStatus) {
        *self.status.lock() = status;
    }

    pub fn engine(&self) -> &TransactionEngine {
        &self.engine
    }

    /// Monotone per-session write tag; conflicting replicated writes are
    /// ordered by it, ties broken by coordinator host id.
    pub fn next_replication_name(&self) -> ReplicationName {
        ReplicationName {
            seq: self.repl_seq.fetch_add(1, Ordering::AcqRel) + 1,
            coordinator: self.host_id.clone(),
        }
    }

    /// Begin (or return) this session's transaction. Status transitions of
    /// the transaction are mirrored into the session status.
    pub fn transaction(self: &Arc<Self>) -> Result<Transaction> {
        self.transaction_with_listener(None)
    }

    pub fn transaction_with_listener(
        self: &Arc<Self>,
        listener: Option<Arc<dyn TransactionListener>>,
    ) -> Result<Transaction> {
        if self.is_closed() {
            return Err(SheafError::IllegalState(format!(
                "session {} is closed",
                self.id
            )));
        }
        let mut guard = self.txn.lock();
        if let Some(txn) = guard.as_ref() {
            return Ok(txn.clone());
        }
        let txn = match listener {
            Some(listener) => self.engine.begin_with_listener(listener),
            None => self.engine.begin(),
        };
        let session = Arc::downgrade(self);
        txn.set_status_hook(Arc::new(move |event| {
            let Some(session) = session.upgrade() else {
                return;
            };
            match event {
                TxnEvent::Waiting => session.set_status(SessionStatus::Waiting),
                TxnEvent::WokenUp => {
                    session.set_status(SessionStatus::RetryingReturnResult)
                }
                TxnEvent::Committed | TxnEvent::RolledBack => {
                    session.set_status(SessionStatus::Idle)
                }
            }
        }));
        *guard = Some(txn.clone());
        Ok(txn)
    }

    pub fn current_transaction(&self) -> Option<Transaction> {
        self.txn.lock().clone()
    }

    pub fn commit(&self) -> Result<()> {
        if let Some(txn) = self.txn.lock().take() {
            txn.commit()?;
        }
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        if let Some(txn) = self.txn.lock().take() {
            txn.rollback()?;
        }
        Ok(())
    }

    /// Driven by the scheduler once per loop.
    pub fn check_timeout(&self) {
        if let Some(txn) = self.txn.lock().as_ref() {
            txn.check_timeout();
        }
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(txn) = self.txn.lock().take() {
            let _ = txn.rollback();
        }
        self.set_status(SessionStatus::Closed);
        debug!("session {} closed", self.id);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish()
    }
}
