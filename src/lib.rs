//! A distributed, transactional key/value store built around a
//! copy-on-write B-tree map, an MVCC transaction engine, and per-thread
//! cooperative schedulers driving network and page-level work.

pub mod btree;
pub mod core;
pub mod db;
pub mod pageop;
pub mod repl;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod storage;
pub mod txn;

pub use crate::btree::{BTreeCursor, BTreeMap, KeyType, Page, PageKey, RecordType};
pub use crate::core::config::{PageStorageMode, StoreConfig};
pub use crate::core::errors::{SheafError, StorageError};
pub use crate::core::stats::{reset_engine_stats, snapshot_engine_stats, EngineStatsSnapshot};
pub use crate::core::Result;
pub use crate::db::Database;
pub use crate::pageop::{
    AsyncResult, PageOperationHandlerFactory, PageOperationResult, SyncListener,
};
pub use crate::repl::{
    LeafMover, LeafPageMovePlan, LocalNode, NodeRegistry, PlanPageKey, ReplicaEndpoint,
    ReplicatedMap, ReplicationName,
};
pub use crate::scheduler::{
    CommandStep, Scheduler, SchedulerPool, SessionCommand, SessionInfo, TaskPriority,
};
pub use crate::server::start_server;
pub use crate::session::{Session, SessionKind, SessionPool, SessionStatus};
pub use crate::storage::{ChunkFile, PageStore};
pub use crate::txn::{
    IsolationLevel, Transaction, TransactionEngine, TransactionListener, TransactionMap,
    TxnStatus,
};
