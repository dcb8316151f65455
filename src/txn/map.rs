use std::sync::Arc;

use parking_lot::Mutex;

use crate::btree::cursor::BTreeCursor;
use crate::btree::map::BTreeMap;
use crate::btree::types::{KeyType, RecordType};
use crate::btree::write::ApplyOutcome;
use crate::core::errors::SheafError;
use crate::core::Result;
use crate::pageop::{AsyncResult, ResultListener, SyncListener};
use crate::txn::engine::TransactionEngine;
use crate::txn::transaction::Transaction;
use crate::txn::tvalue::{TValue, Waiter};
use crate::txn::undo::CellUndo;

/// What a transactional write decided after seeing the visible value.
enum Decision<V> {
    Write { value: Option<V>, for_update: bool },
    Skip,
}

enum WriteOutcome<V> {
    Applied(Option<V>),
    Conflict(crate::txn::TxnId),
}

type DecideFn<V> = Arc<dyn Fn(Option<&V>) -> Decision<V> + Send + Sync>;

/// A transactional view over a B-tree map of [`TValue`] cells. Reads are
/// read-committed; writes take the row lock or wait on its owner.
pub struct TransactionMap<K: KeyType, V: RecordType> {
    name: String,
    map: BTreeMap<K, TValue<V>>,
    engine: TransactionEngine,
}

impl<K: KeyType, V: RecordType> Clone for TransactionMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            map: self.map.clone(),
            engine: self.engine.clone(),
        }
    }
}

impl<K: KeyType, V: RecordType> TransactionMap<K, V> {
    pub(crate) fn new(
        name: &str,
        map: BTreeMap<K, TValue<V>>,
        engine: TransactionEngine,
    ) -> Self {
        Self {
            name: name.to_string(),
            map,
            engine,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backing cell map; raw cells include lock state.
    pub fn raw_map(&self) -> &BTreeMap<K, TValue<V>> {
        &self.map
    }

    // ---- reads -----------------------------------------------------------

    pub fn get(&self, txn: &Transaction, key: &K) -> Result<Option<V>> {
        Ok(self
            .map
            .get(key)?
            .and_then(|cell| cell.visible_for(txn.tid())))
    }

    /// Committed value regardless of any reading transaction.
    pub fn get_committed(&self, key: &K) -> Result<Option<V>> {
        Ok(self.map.get(key)?.and_then(|cell| cell.committed().cloned()))
    }

    pub fn contains_key(&self, txn: &Transaction, key: &K) -> Result<bool> {
        Ok(self.get(txn, key)?.is_some())
    }

    /// Entries visible to `txn` over `[from, to]` in key order.
    pub fn cursor(
        &self,
        txn: &Transaction,
        from: Option<K>,
        to: Option<K>,
    ) -> Result<TransactionCursor<K, V>> {
        Ok(TransactionCursor {
            inner: self.map.cursor(from, to)?,
            tid: txn.tid(),
        })
    }

    /// Visible entry count; cells with a pending uncommitted insert by
    /// another transaction do not count.
    pub fn size(&self, txn: &Transaction) -> Result<u64> {
        let mut count = 0;
        for entry in self.cursor(txn, None, None)? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    // ---- writes ----------------------------------------------------------

    pub fn put(&self, txn: &Transaction, key: K, value: V) -> Result<Option<V>> {
        self.write_with(
            txn,
            key,
            Arc::new(move |_| Decision::Write {
                value: Some(value.clone()),
                for_update: false,
            }),
        )
    }

    pub fn put_if_absent(&self, txn: &Transaction, key: K, value: V) -> Result<Option<V>> {
        self.write_with(
            txn,
            key,
            Arc::new(move |current: Option<&V>| match current {
                Some(_) => Decision::Skip,
                None => Decision::Write {
                    value: Some(value.clone()),
                    for_update: false,
                },
            }),
        )
    }

    /// Replace succeeds iff the visible value equals `old_value` by the
    /// value comparator.
    pub fn replace(&self, txn: &Transaction, key: K, old_value: V, new_value: V) -> Result<bool> {
        let old_for_decide = old_value.clone();
        let previous = self.write_with(
            txn,
            key,
            Arc::new(move |current: Option<&V>| match current {
                Some(existing) if *existing == old_for_decide => Decision::Write {
                    value: Some(new_value.clone()),
                    for_update: false,
                },
                _ => Decision::Skip,
            }),
        )?;
        Ok(previous.as_ref() == Some(&old_value))
    }

    pub fn remove(&self, txn: &Transaction, key: K) -> Result<Option<V>> {
        self.write_with(
            txn,
            key,
            Arc::new(|current: Option<&V>| match current {
                Some(_) => Decision::Write {
                    value: None,
                    for_update: false,
                },
                None => Decision::Skip,
            }),
        )
    }

    /// Take the row lock without changing the value (update/delete
    /// preparation).
    pub fn lock_row(&self, txn: &Transaction, key: K) -> Result<Option<V>> {
        self.write_with(
            txn,
            key,
            Arc::new(|current: Option<&V>| match current {
                Some(existing) => Decision::Write {
                    value: Some(existing.clone()),
                    for_update: true,
                },
                None => Decision::Skip,
            }),
        )
    }

    /// Store `value` under the next append key.
    pub fn append(&self, txn: &Transaction, value: V) -> Result<K> {
        txn.check_open()?;
        let tid = txn.tid();
        let cell = TValue::new_uncommitted(tid, Some(value));
        let key = self.map.append(cell.clone())?;
        txn.add_lock(Arc::clone(cell.lock()));
        txn.add_undo(Box::new(CellUndo {
            map: self.map.clone(),
            map_name: self.name.clone(),
            key: key.clone(),
            old: None,
            new: cell,
            for_update: false,
        }));
        Ok(key)
    }

    /// Synchronous write loop: attempt, and on a row conflict wait for the
    /// owner and retry. A wait-for cycle aborts this transaction.
    fn write_with(&self, txn: &Transaction, key: K, decide: DecideFn<V>) -> Result<Option<V>> {
        loop {
            txn.check_open()?;
            let listener = Arc::new(SyncListener::new());
            self.submit_attempt(txn, key.clone(), decide.clone(), listener.clone(), None);
            match listener.await_result()? {
                WriteOutcome::Applied(previous) => return Ok(previous),
                WriteOutcome::Conflict(owner) => {
                    txn.wait_for(owner, &format!("{}:{:?}", self.name, key))?;
                }
            }
        }
    }

    /// Asynchronous write: on a row conflict the waiter re-submits the whole
    /// operation once the owner resolves, and the completion handler fires
    /// on the handler running the final attempt.
    pub fn async_put(
        &self,
        txn: &Transaction,
        key: K,
        value: V,
        handler: impl FnOnce(AsyncResult<Option<V>>) + Send + 'static,
    ) {
        let decide: DecideFn<V> = Arc::new(move |_| Decision::Write {
            value: Some(value.clone()),
            for_update: false,
        });
        self.async_write_internal(txn.clone(), key, decide, SharedCallback::new(handler));
    }

    fn async_write_internal(
        &self,
        txn: Transaction,
        key: K,
        decide: DecideFn<V>,
        callback: SharedCallback<Option<V>>,
    ) {
        if let Err(e) = txn.check_open() {
            callback.fire(AsyncResult::failed(e));
            return;
        }
        let listener = Arc::new(AsyncOutcomeListener {
            callback: callback.clone(),
        });
        let retry: Box<dyn FnOnce() + Send> = {
            let this = self.clone();
            let txn = txn.clone();
            let key = key.clone();
            let decide = decide.clone();
            let callback = callback.clone();
            Box::new(move || this.async_write_internal(txn, key, decide, callback))
        };
        self.submit_attempt(&txn, key, decide, listener, Some(retry));
    }

    /// One attempt as a single-key page operation. `retry` turns a conflict
    /// into a registered waiter that re-submits (asynchronous path); without
    /// it the conflict is reported to the listener (synchronous path).
    fn submit_attempt(
        &self,
        txn: &Transaction,
        key: K,
        decide: DecideFn<V>,
        listener: Arc<dyn ResultListener<WriteOutcome<V>>>,
        retry: Option<Box<dyn FnOnce() + Send>>,
    ) {
        let tid = txn.tid();
        let txn = txn.clone();
        let txn_listener = txn.listener();
        let map = self.map.clone();
        let map_name = self.name.clone();
        let undo_key = key.clone();
        let retry_slot = Mutex::new(retry);

        let apply = Box::new(move |current: Option<&TValue<V>>| {
            match current {
                Some(cell) => {
                    if let Some(owner) = cell.locked_by_other(tid) {
                        match retry_slot.lock().take() {
                            Some(retry) => {
                                cell.lock().add_waiter(Arc::new(Waiter::with_retry(
                                    tid,
                                    Arc::clone(&txn_listener),
                                    retry,
                                )));
                                return ApplyOutcome::Locked;
                            }
                            None => {
                                cell.lock().add_waiter(Arc::new(Waiter::new(
                                    tid,
                                    Arc::clone(&txn_listener),
                                )));
                                return ApplyOutcome::Keep(WriteOutcome::Conflict(owner));
                            }
                        }
                    }
                    let visible = cell.visible_for(tid);
                    match decide(visible.as_ref()) {
                        Decision::Skip => ApplyOutcome::Keep(WriteOutcome::Applied(visible)),
                        Decision::Write { value, for_update } => {
                            let next = cell.with_uncommitted(tid, value);
                            txn.add_lock(Arc::clone(next.lock()));
                            txn.add_undo(Box::new(CellUndo {
                                map: map.clone(),
                                map_name: map_name.clone(),
                                key: undo_key.clone(),
                                old: Some(cell.clone()),
                                new: next.clone(),
                                for_update,
                            }));
                            ApplyOutcome::Put(next, WriteOutcome::Applied(visible))
                        }
                    }
                }
                None => match decide(None) {
                    Decision::Skip => ApplyOutcome::Keep(WriteOutcome::Applied(None)),
                    Decision::Write { value: None, .. } => {
                        ApplyOutcome::Keep(WriteOutcome::Applied(None))
                    }
                    Decision::Write {
                        value: Some(value),
                        for_update,
                    } => {
                        let next = TValue::new_uncommitted(tid, Some(value));
                        txn.add_lock(Arc::clone(next.lock()));
                        txn.add_undo(Box::new(CellUndo {
                            map: map.clone(),
                            map_name: map_name.clone(),
                            key: undo_key.clone(),
                            old: None,
                            new: next.clone(),
                            for_update,
                        }));
                        ApplyOutcome::Put(next, WriteOutcome::Applied(None))
                    }
                },
            }
        });

        self.map.submit_single_write(key, apply, listener);
    }
}

/// Iterator over the entries visible to one transaction.
pub struct TransactionCursor<K: KeyType, V: RecordType> {
    inner: BTreeCursor<K, TValue<V>>,
    tid: crate::txn::TxnId,
}

impl<K: KeyType, V: RecordType> Iterator for TransactionCursor<K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Err(e) => return Some(Err(e)),
                Ok((key, cell)) => match cell.visible_for(self.tid) {
                    Some(value) => return Some(Ok((key, value))),
                    None => continue,
                },
            }
        }
    }
}

/// One-shot completion handler shared between the result listener and the
/// waiter's retry closure; whichever path finishes the operation takes it.
struct SharedCallback<T> {
    cell: Arc<Mutex<Option<Box<dyn FnOnce(AsyncResult<T>) + Send>>>>,
}

impl<T> Clone for SharedCallback<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> SharedCallback<T> {
    fn new(handler: impl FnOnce(AsyncResult<T>) + Send + 'static) -> Self {
        Self {
            cell: Arc::new(Mutex::new(Some(Box::new(handler)))),
        }
    }

    fn fire(&self, result: AsyncResult<T>) {
        if let Some(handler) = self.cell.lock().take() {
            handler(result);
        }
    }
}

struct AsyncOutcomeListener<V: RecordType> {
    callback: SharedCallback<Option<V>>,
}

impl<V: RecordType> ResultListener<WriteOutcome<V>> for AsyncOutcomeListener<V> {
    fn on_result(&self, result: AsyncResult<WriteOutcome<V>>) {
        match result.into_result() {
            Ok(WriteOutcome::Applied(previous)) => {
                self.callback.fire(AsyncResult::succeeded(previous))
            }
            Ok(WriteOutcome::Conflict(owner)) => {
                self.callback.fire(AsyncResult::failed(SheafError::IllegalState(
                    format!("unexpected conflict report for owner {owner}"),
                )))
            }
            Err(e) => self.callback.fire(AsyncResult::failed(e)),
        }
    }
}
