use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::btree::map::BTreeMap;
use crate::btree::types::{KeyType, RecordType};
use crate::core::config::StoreConfig;
use crate::core::errors::SheafError;
use crate::core::Result;
use crate::pageop::{PageOperationHandlerFactory, RunnableOperation};
use crate::storage::page_store::PageStore;
use crate::txn::listener::{CountedListener, TransactionListener};
use crate::txn::map::TransactionMap;
use crate::txn::redo::RedoLog;
use crate::txn::transaction::{Transaction, TransactionInner};
use crate::txn::tvalue::TValue;
use crate::txn::{TxnId, TXN_NONE};

struct EngineShared {
    config: StoreConfig,
    factory: PageOperationHandlerFactory,
    base_path: Option<PathBuf>,
    next_tid: AtomicU64,
    transactions: RwLock<HashMap<TxnId, Arc<TransactionInner>>>,
    redo: Option<Mutex<RedoLog>>,
    maps: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    closers: Mutex<Vec<Box<dyn Fn() -> Result<()> + Send + Sync>>>,
}

/// Owns transaction ids, the live-transaction registry used for deadlock
/// detection, the redo log, and the transactional maps.
#[derive(Clone)]
pub struct TransactionEngine {
    shared: Arc<EngineShared>,
}

impl TransactionEngine {
    pub fn new(
        config: StoreConfig,
        factory: PageOperationHandlerFactory,
        base_path: Option<PathBuf>,
    ) -> Result<Self> {
        let redo = if config.in_memory {
            None
        } else if let Some(base) = &base_path {
            std::fs::create_dir_all(base)?;
            Some(Mutex::new(RedoLog::open(base.join("redo.log"))?))
        } else {
            None
        };
        Ok(Self {
            shared: Arc::new(EngineShared {
                config,
                factory,
                base_path,
                next_tid: AtomicU64::new(TXN_NONE),
                transactions: RwLock::new(HashMap::new()),
                redo,
                maps: Mutex::new(HashMap::new()),
                closers: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    pub fn handler_factory(&self) -> &PageOperationHandlerFactory {
        &self.shared.factory
    }

    pub fn begin(&self) -> Transaction {
        self.begin_with_listener(Arc::new(CountedListener::new()))
    }

    /// Begin with the caller's cooperative blocker; scheduler-bound sessions
    /// pass a listener that runs their inner queues while waiting.
    pub fn begin_with_listener(&self, listener: Arc<dyn TransactionListener>) -> Transaction {
        let tid = self.shared.next_tid.fetch_add(1, Ordering::AcqRel) + 1;
        let inner = Arc::new(TransactionInner::new(tid, listener));
        self.shared.transactions.write().insert(tid, inner.clone());
        debug!("transaction {tid} opened");
        Transaction {
            inner,
            engine: self.clone(),
        }
    }

    /// Open (or fetch) the named transactional map with the given key and
    /// value types.
    pub fn open_map<K: KeyType, V: RecordType>(
        &self,
        name: &str,
    ) -> Result<TransactionMap<K, V>> {
        let mut maps = self.shared.maps.lock();
        if let Some(existing) = maps.get(name) {
            return existing
                .downcast_ref::<TransactionMap<K, V>>()
                .cloned()
                .ok_or_else(|| {
                    SheafError::IllegalState(format!(
                        "map {name} is already open with different types"
                    ))
                });
        }

        let store = if self.shared.config.in_memory {
            None
        } else if let Some(base) = &self.shared.base_path {
            Some(PageStore::open(base.join(format!("{name}.db")))?)
        } else {
            None
        };

        let map = BTreeMap::<K, TValue<V>>::open(
            name,
            self.shared.config.clone(),
            self.shared.factory.clone(),
            store,
        )?;
        let txn_map = TransactionMap::new(name, map.clone(), self.clone());
        maps.insert(name.to_string(), Arc::new(txn_map.clone()));
        self.shared
            .closers
            .lock()
            .push(Box::new(move || map.close()));
        Ok(txn_map)
    }

    /// Committed undo records are persisted before the commit acknowledges.
    pub(crate) fn append_redo(&self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        if let Some(redo) = &self.shared.redo {
            let mut redo = redo.lock();
            redo.append(payload)?;
            redo.sync()?;
        }
        Ok(())
    }

    pub(crate) fn submit_runnable(&self, task: Box<dyn FnOnce() + Send>) {
        let owner = self
            .shared
            .factory
            .affinity_owner(self.shared.next_tid.load(Ordering::Relaxed) as usize);
        self.shared
            .factory
            .submit_to(owner, Box::new(RunnableOperation::new(move || task())));
    }

    pub(crate) fn lookup(&self, tid: TxnId) -> Option<Arc<TransactionInner>> {
        self.shared.transactions.read().get(&tid).cloned()
    }

    pub(crate) fn unregister(&self, tid: TxnId) {
        self.shared.transactions.write().remove(&tid);
    }

    pub fn active_transaction_count(&self) -> usize {
        self.shared.transactions.read().len()
    }

    /// Walk the wait-for chain from `owner`; reaching `start` again is a
    /// cycle and the detecting transaction must abort.
    pub(crate) fn check_deadlock(&self, start: TxnId, owner: TxnId) -> Result<()> {
        let registry = self.shared.transactions.read();
        let mut chain = vec![start];
        let mut current = owner;
        let mut steps = 0usize;
        while current != TXN_NONE {
            chain.push(current);
            if current == start {
                return Err(SheafError::Deadlock(format!(
                    "wait-for cycle: {}",
                    chain
                        .iter()
                        .map(|t| t.to_string())
                        .collect::<Vec<_>>()
                        .join(" -> ")
                )));
            }
            let Some(next) = registry.get(&current) else {
                break;
            };
            current = *next.locked_by.lock();
            steps += 1;
            if steps > registry.len() {
                break;
            }
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let closers = std::mem::take(&mut *self.shared.closers.lock());
        for close in closers {
            close()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TransactionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionEngine")
            .field(
                "active_transactions",
                &self.shared.transactions.read().len(),
            )
            .finish()
    }
}
