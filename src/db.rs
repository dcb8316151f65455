use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;

use crate::btree::map::BTreeMap;
use crate::btree::types::{KeyType, RecordType};
use crate::core::config::StoreConfig;
use crate::core::errors::SheafError;
use crate::core::stats::{snapshot_engine_stats, EngineStatsSnapshot};
use crate::core::Result;
use crate::pageop::PageOperationHandlerFactory;
use crate::scheduler::{Scheduler, SchedulerPool};
use crate::session::{Session, SessionKind};
use crate::storage::page_store::PageStore;
use crate::txn::{TransactionEngine, TransactionMap};

const DEFAULT_HANDLER_COUNT: usize = 4;
const DEFAULT_SCHEDULER_COUNT: usize = 2;

/// One database instance: the handler pool, the scheduler pool, the
/// transaction engine and the session table. All process-wide state lives
/// here and dies with `close`.
pub struct Database {
    config: StoreConfig,
    base_path: Option<PathBuf>,
    host_id: String,
    factory: PageOperationHandlerFactory,
    schedulers: SchedulerPool,
    engine: TransactionEngine,
    sessions: Mutex<HashMap<u64, (Arc<Session>, Scheduler)>>,
    next_session_id: AtomicU64,
    closed: AtomicBool,
}

impl Database {
    pub fn open(base_path: Option<PathBuf>, config: StoreConfig) -> Result<Arc<Self>> {
        config.validate()?;
        if let Some(base) = &base_path {
            std::fs::create_dir_all(base)?;
        }
        let factory = PageOperationHandlerFactory::start(
            DEFAULT_HANDLER_COUNT,
            config.handler_loop_interval(),
        );
        let schedulers = SchedulerPool::start(DEFAULT_SCHEDULER_COUNT, &config);
        let engine_path = if config.in_memory {
            None
        } else {
            base_path.clone()
        };
        let engine = TransactionEngine::new(config.clone(), factory.clone(), engine_path)?;
        let host_id = config
            .init_replication_nodes
            .first()
            .cloned()
            .unwrap_or_else(|| "localhost".to_string());
        info!(
            "database opened (host {host_id}, in_memory={}, sharding={})",
            config.in_memory, config.sharding_mode
        );
        Ok(Arc::new(Self {
            config,
            base_path,
            host_id,
            factory,
            schedulers,
            engine,
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn open_in_memory(mut config: StoreConfig) -> Result<Arc<Self>> {
        config.in_memory = true;
        Self::open(None, config)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn engine(&self) -> &TransactionEngine {
        &self.engine
    }

    pub fn handler_factory(&self) -> &PageOperationHandlerFactory {
        &self.factory
    }

    pub fn scheduler_pool(&self) -> &SchedulerPool {
        &self.schedulers
    }

    /// Open a raw (non-transactional) map with its own chunk file.
    pub fn open_map<K: KeyType, V: RecordType>(&self, name: &str) -> Result<BTreeMap<K, V>> {
        self.check_open()?;
        let store = if self.config.in_memory {
            None
        } else if let Some(base) = &self.base_path {
            Some(PageStore::open(base.join(format!("{name}.db")))?)
        } else {
            None
        };
        BTreeMap::open(name, self.config.clone(), self.factory.clone(), store)
    }

    /// Open a transactional map through the engine.
    pub fn open_transaction_map<K: KeyType, V: RecordType>(
        &self,
        name: &str,
    ) -> Result<TransactionMap<K, V>> {
        self.check_open()?;
        self.engine.open_map(name)
    }

    /// Create a session and bind it to a scheduler round-robin.
    pub fn create_session(&self, kind: SessionKind) -> Result<(Arc<Session>, Scheduler)> {
        self.check_open()?;
        let id = self.next_session_id.fetch_add(1, Ordering::AcqRel) + 1;
        let session = Session::new(id, kind, self.host_id.clone(), self.engine.clone());
        let scheduler = self.schedulers.pick().clone();
        scheduler.register_session(Arc::clone(&session));
        self.sessions
            .lock()
            .insert(id, (Arc::clone(&session), scheduler.clone()));
        Ok((session, scheduler))
    }

    pub fn session(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.lock().get(&id).map(|(s, _)| Arc::clone(s))
    }

    pub fn session_scheduler(&self, id: u64) -> Option<Scheduler> {
        self.sessions.lock().get(&id).map(|(_, s)| s.clone())
    }

    /// Close the session and revoke its scheduler-local state.
    pub fn remove_session(&self, id: u64) {
        if let Some((session, scheduler)) = self.sessions.lock().remove(&id) {
            scheduler.remove_session(id);
            session.close();
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Counters from the scheduler and page-operation hot paths. The
    /// counters are process-wide and only ever grow.
    pub fn stats(&self) -> EngineStatsSnapshot {
        snapshot_engine_stats()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SheafError::IllegalState("database is closed".into()));
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let sessions = std::mem::take(&mut *self.sessions.lock());
        for (id, (session, scheduler)) in sessions {
            scheduler.remove_session(id);
            session.close();
        }
        self.schedulers.end_all();
        self.factory.stop();
        self.engine.close()?;
        info!("database closed");
        Ok(())
    }
}
