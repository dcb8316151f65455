use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::btree::types::{write_u8, ByteReader, RecordType};
use crate::core::Result;
use crate::txn::listener::TransactionListener;
use crate::txn::{TxnId, TXN_NONE};

/// A transaction blocked on a row lock. `retry` re-submits the waiter's
/// operation after wake-up (asynchronous writes); synchronous writers loop
/// themselves and leave it empty.
pub struct Waiter {
    pub tid: TxnId,
    pub listener: Arc<dyn TransactionListener>,
    retry: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Waiter {
    pub fn new(tid: TxnId, listener: Arc<dyn TransactionListener>) -> Self {
        Self {
            tid,
            listener,
            retry: Mutex::new(None),
        }
    }

    pub fn with_retry(
        tid: TxnId,
        listener: Arc<dyn TransactionListener>,
        retry: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            tid,
            listener,
            retry: Mutex::new(Some(retry)),
        }
    }

    pub fn take_retry(&self) -> Option<Box<dyn FnOnce() + Send>> {
        self.retry.lock().take()
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter").field("tid", &self.tid).finish()
    }
}

/// FIFO queue of transactions waiting for the owning transaction of a cell
/// to resolve. Shared by every copy-on-write generation of the cell so a
/// page swap never strands a waiter.
#[derive(Debug, Default)]
pub struct RowLock {
    waiters: Mutex<VecDeque<Arc<Waiter>>>,
}

impl RowLock {
    pub fn add_waiter(&self, waiter: Arc<Waiter>) {
        self.waiters.lock().push_back(waiter);
    }

    pub fn drain_waiters(&self) -> Vec<Arc<Waiter>> {
        self.waiters.lock().drain(..).collect()
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.lock().is_empty()
    }
}

/// The value cell of a transactional map: the committed value, the owning
/// transaction's uncommitted value, and the shared row lock.
///
/// Readers see the committed value unless the reading transaction owns the
/// cell. `uncommitted` distinguishes "no pending write" (`None`) from a
/// pending remove (`Some(None)`).
#[derive(Debug, Clone)]
pub struct TValue<V> {
    committed: Option<V>,
    uncommitted: Option<Option<V>>,
    owner: TxnId,
    lock: Arc<RowLock>,
}

impl<V: Clone> TValue<V> {
    pub fn new_committed(value: V) -> Self {
        Self {
            committed: Some(value),
            uncommitted: None,
            owner: TXN_NONE,
            lock: Arc::new(RowLock::default()),
        }
    }

    /// A brand-new cell owned by `tid` with no committed history.
    pub fn new_uncommitted(tid: TxnId, value: Option<V>) -> Self {
        Self {
            committed: None,
            uncommitted: Some(value),
            owner: tid,
            lock: Arc::new(RowLock::default()),
        }
    }

    /// This cell with a pending write by `tid`, keeping the committed value
    /// and the shared lock.
    pub fn with_uncommitted(&self, tid: TxnId, value: Option<V>) -> Self {
        Self {
            committed: self.committed.clone(),
            uncommitted: Some(value),
            owner: tid,
            lock: Arc::clone(&self.lock),
        }
    }

    pub fn committed(&self) -> Option<&V> {
        self.committed.as_ref()
    }

    pub fn owner(&self) -> TxnId {
        self.owner
    }

    pub fn lock(&self) -> &Arc<RowLock> {
        &self.lock
    }

    pub fn is_locked(&self) -> bool {
        self.owner != TXN_NONE
    }

    /// The transaction holding this cell, if it is not `tid` itself.
    pub fn locked_by_other(&self, tid: TxnId) -> Option<TxnId> {
        (self.owner != TXN_NONE && self.owner != tid).then_some(self.owner)
    }

    /// Read-committed visibility: the owner sees its pending write, everyone
    /// else the committed value.
    pub fn visible_for(&self, tid: TxnId) -> Option<V> {
        if self.owner == tid {
            match &self.uncommitted {
                Some(pending) => pending.clone(),
                None => self.committed.clone(),
            }
        } else {
            self.committed.clone()
        }
    }

    /// Promote the pending write. `None` means the cell vanishes (a
    /// committed remove).
    pub fn commit_cell(&self) -> Option<TValue<V>> {
        match &self.uncommitted {
            Some(Some(value)) => Some(Self {
                committed: Some(value.clone()),
                uncommitted: None,
                owner: TXN_NONE,
                lock: Arc::clone(&self.lock),
            }),
            Some(None) => None,
            None => Some(Self {
                committed: self.committed.clone(),
                uncommitted: None,
                owner: TXN_NONE,
                lock: Arc::clone(&self.lock),
            }),
        }
    }
}

impl<V: PartialEq> PartialEq for TValue<V> {
    fn eq(&self, other: &Self) -> bool {
        self.committed == other.committed && self.owner == other.owner
    }
}

const CELL_EMPTY: u8 = 0;
const CELL_VALUE: u8 = 1;

impl<V: RecordType> RecordType for TValue<V> {
    /// Only the committed value is persisted; pending writes and lock state
    /// never reach a page image.
    fn encode(&self, buf: &mut Vec<u8>) {
        match &self.committed {
            Some(value) => {
                write_u8(buf, CELL_VALUE);
                value.encode(buf);
            }
            None => write_u8(buf, CELL_EMPTY),
        }
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let tag = r.read_u8()?;
        let committed = if tag == CELL_VALUE {
            Some(V::decode(r)?)
        } else {
            None
        };
        Ok(Self {
            committed,
            uncommitted: None,
            owner: TXN_NONE,
            lock: Arc::new(RowLock::default()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_follows_ownership() {
        let cell = TValue::new_committed(10i64);
        let pending = cell.with_uncommitted(7, Some(20));
        assert_eq!(pending.visible_for(7), Some(20));
        assert_eq!(pending.visible_for(8), Some(10));
        assert_eq!(pending.locked_by_other(8), Some(7));
        assert_eq!(pending.locked_by_other(7), None);
    }

    #[test]
    fn commit_promotes_and_unlocks() {
        let cell = TValue::new_committed(1i64).with_uncommitted(3, Some(2));
        let committed = cell.commit_cell().unwrap();
        assert_eq!(committed.visible_for(99), Some(2));
        assert!(!committed.is_locked());

        let removed = TValue::new_committed(1i64).with_uncommitted(3, None);
        assert!(removed.commit_cell().is_none());
    }

    #[test]
    fn lock_is_shared_across_generations() {
        let cell = TValue::new_committed(1i64);
        let pending = cell.with_uncommitted(3, Some(2));
        assert!(Arc::ptr_eq(cell.lock(), pending.lock()));
    }
}
