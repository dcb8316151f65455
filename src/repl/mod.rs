pub mod leaf_move;
pub mod node;
pub mod quorum;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::errors::SheafError;
use crate::core::Result;

pub use leaf_move::{LeafMover, LeafPageMovePlan, PlanPageKey};
pub use node::LocalNode;
pub use quorum::{quorum, ReplicatedMap};

/// Per-write tag giving conflicting replicated writes a total order: the
/// session's monotone counter first, coordinator host id as the tie-break.
/// Replicas discard a write whose name is not newer than the last one
/// applied to the key, which makes retries idempotent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicationName {
    pub seq: u64,
    pub coordinator: String,
}

impl std::fmt::Display for ReplicationName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.seq, self.coordinator)
    }
}

/// The logical replication RPC surface. Byte-level so it can ride any
/// transport; each write carries a [`ReplicationName`].
pub trait ReplicaEndpoint: Send + Sync {
    fn host_id(&self) -> &str;

    fn get(&self, map_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(
        &self,
        rn: &ReplicationName,
        map_name: &str,
        key: &[u8],
        value: &[u8],
        raw: bool,
        add_if_absent: bool,
    ) -> Result<Option<Vec<u8>>>;

    /// Applies at the replica's local append key; the coordinator
    /// reconciles divergent keys via [`ReplicaEndpoint::replication_commit`].
    fn append(&self, rn: &ReplicationName, map_name: &str, value: &[u8]) -> Result<Vec<u8>>;

    fn replace(
        &self,
        rn: &ReplicationName,
        map_name: &str,
        key: &[u8],
        old_value: &[u8],
        new_value: &[u8],
    ) -> Result<bool>;

    fn remove(&self, rn: &ReplicationName, map_name: &str, key: &[u8])
        -> Result<Option<Vec<u8>>>;

    fn prepare_move_leaf_page(
        &self,
        map_name: &str,
        plan: &LeafPageMovePlan,
    ) -> Result<LeafPageMovePlan>;

    fn move_leaf_page(
        &self,
        map_name: &str,
        page_key: &PlanPageKey,
        image: &[u8],
        add_page: bool,
    ) -> Result<()>;

    fn remove_leaf_page(&self, map_name: &str, page_key: &PlanPageKey) -> Result<()>;

    fn read_remote_page(&self, map_name: &str, page_key: &PlanPageKey) -> Result<Vec<u8>>;

    fn replication_commit(
        &self,
        valid_key: &[u8],
        auto_commit: bool,
        retry_replication_names: &[ReplicationName],
    ) -> Result<()>;
}

/// Host id to endpoint directory, shared by coordinators and movers.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<String, Arc<dyn ReplicaEndpoint>>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, endpoint: Arc<dyn ReplicaEndpoint>) {
        self.nodes
            .write()
            .insert(endpoint.host_id().to_string(), endpoint);
    }

    pub fn get(&self, host_id: &str) -> Result<Arc<dyn ReplicaEndpoint>> {
        self.nodes.read().get(host_id).cloned().ok_or_else(|| {
            SheafError::Replication(format!("unknown replication node: {host_id}"))
        })
    }

    pub fn hosts(&self) -> Vec<String> {
        self.nodes.read().keys().cloned().collect()
    }
}
