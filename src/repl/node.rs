use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use parking_lot::Mutex;

use crate::btree::map::BTreeMap;
use crate::btree::types::{ByteReader, KeyType, RecordType};
use crate::core::errors::SheafError;
use crate::core::Result;
use crate::repl::{LeafPageMovePlan, PlanPageKey, ReplicaEndpoint, ReplicationName};

/// In-process replica endpoint over one node's local map. Carries the
/// replica-side state the protocol requires: the last replication name
/// applied per key (duplicate discard), pending appends awaiting their
/// valid key, and the highest-index move plan seen per page key.
pub struct LocalNode<K: KeyType, V: RecordType> {
    host_id: String,
    map: BTreeMap<K, V>,
    applied: Mutex<HashMap<Vec<u8>, ReplicationName>>,
    pending_appends: Mutex<HashMap<ReplicationName, K>>,
    plans: Mutex<HashMap<PlanPageKey, LeafPageMovePlan>>,
    down: AtomicBool,
}

impl<K: KeyType, V: RecordType> LocalNode<K, V> {
    pub fn new(host_id: impl Into<String>, map: BTreeMap<K, V>) -> Self {
        Self {
            host_id: host_id.into(),
            map,
            applied: Mutex::new(HashMap::new()),
            pending_appends: Mutex::new(HashMap::new()),
            plans: Mutex::new(HashMap::new()),
            down: AtomicBool::new(false),
        }
    }

    pub fn map(&self) -> &BTreeMap<K, V> {
        &self.map
    }

    /// Simulate a crashed or partitioned replica; every RPC fails until
    /// restored.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::Release);
    }

    fn check_up(&self) -> Result<()> {
        if self.down.load(Ordering::Acquire) {
            return Err(SheafError::Replication(format!(
                "node {} is down",
                self.host_id
            )));
        }
        Ok(())
    }

    fn decode_key(&self, key: &[u8]) -> Result<K> {
        let mut reader = ByteReader::new(key);
        K::decode(&mut reader)
    }

    fn decode_value(&self, value: &[u8]) -> Result<V> {
        let mut reader = ByteReader::new(value);
        V::decode(&mut reader)
    }

    /// Total order per key: a write whose name is not newer than the last
    /// applied one is a duplicate (or a straggler) and is discarded.
    fn is_stale(&self, key: &[u8], rn: &ReplicationName) -> bool {
        self.applied
            .lock()
            .get(key)
            .map(|last| last >= rn)
            .unwrap_or(false)
    }

    fn record_applied(&self, key: &[u8], rn: &ReplicationName) {
        self.applied.lock().insert(key.to_vec(), rn.clone());
    }
}

impl<K: KeyType, V: RecordType> ReplicaEndpoint for LocalNode<K, V> {
    fn host_id(&self) -> &str {
        &self.host_id
    }

    fn get(&self, _map_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_up()?;
        let key = self.decode_key(key)?;
        Ok(self.map.get(&key)?.map(|value| value.encoded()))
    }

    fn put(
        &self,
        rn: &ReplicationName,
        _map_name: &str,
        key: &[u8],
        value: &[u8],
        _raw: bool,
        add_if_absent: bool,
    ) -> Result<Option<Vec<u8>>> {
        self.check_up()?;
        if self.is_stale(key, rn) {
            debug!("node {}: discarding duplicate write {rn}", self.host_id);
            let key = self.decode_key(key)?;
            return Ok(self.map.get(&key)?.map(|value| value.encoded()));
        }
        let decoded_key = self.decode_key(key)?;
        let decoded_value = self.decode_value(value)?;
        let previous = if add_if_absent {
            self.map.put_if_absent(decoded_key, decoded_value)?
        } else {
            self.map.put(decoded_key, decoded_value)?
        };
        self.record_applied(key, rn);
        Ok(previous.map(|value| value.encoded()))
    }

    fn append(&self, rn: &ReplicationName, _map_name: &str, value: &[u8]) -> Result<Vec<u8>> {
        self.check_up()?;
        if let Some(key) = self.pending_appends.lock().get(rn) {
            return Ok(key.encoded());
        }
        let decoded_value = self.decode_value(value)?;
        let key = self.map.append(decoded_value)?;
        self.pending_appends.lock().insert(rn.clone(), key.clone());
        Ok(key.encoded())
    }

    fn replace(
        &self,
        rn: &ReplicationName,
        _map_name: &str,
        key: &[u8],
        old_value: &[u8],
        new_value: &[u8],
    ) -> Result<bool> {
        self.check_up()?;
        let decoded_key = self.decode_key(key)?;
        let new_decoded = self.decode_value(new_value)?;
        if self.is_stale(key, rn) {
            return Ok(self.map.get(&decoded_key)? == Some(new_decoded));
        }
        let old_decoded = self.decode_value(old_value)?;
        let replaced = self.map.replace(decoded_key, old_decoded, new_decoded)?;
        self.record_applied(key, rn);
        Ok(replaced)
    }

    fn remove(
        &self,
        rn: &ReplicationName,
        _map_name: &str,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        self.check_up()?;
        if self.is_stale(key, rn) {
            return Ok(None);
        }
        let decoded_key = self.decode_key(key)?;
        let previous = self.map.remove(decoded_key)?;
        self.record_applied(key, rn);
        Ok(previous.map(|value| value.encoded()))
    }

    fn prepare_move_leaf_page(
        &self,
        _map_name: &str,
        plan: &LeafPageMovePlan,
    ) -> Result<LeafPageMovePlan> {
        self.check_up()?;
        let mut plans = self.plans.lock();
        let entry = plans
            .entry(plan.page_key.clone())
            .and_modify(|kept| {
                if plan.index > kept.index {
                    *kept = plan.clone();
                }
            })
            .or_insert_with(|| plan.clone());
        Ok(entry.clone())
    }

    fn move_leaf_page(
        &self,
        _map_name: &str,
        page_key: &PlanPageKey,
        image: &[u8],
        add_page: bool,
    ) -> Result<()> {
        self.check_up()?;
        let page_key = page_key.to_page_key::<K>()?;
        self.map.install_leaf(&page_key, image, add_page)
    }

    fn remove_leaf_page(&self, _map_name: &str, page_key: &PlanPageKey) -> Result<()> {
        self.check_up()?;
        let hosts = self
            .plans
            .lock()
            .get(page_key)
            .map(|plan| plan.new_replicas.clone())
            .unwrap_or_default();
        let page_key = page_key.to_page_key::<K>()?;
        self.map.replace_with_remote(&page_key, hosts)
    }

    fn read_remote_page(&self, _map_name: &str, page_key: &PlanPageKey) -> Result<Vec<u8>> {
        self.check_up()?;
        let page_key = page_key.to_page_key::<K>()?;
        self.map.encode_leaf(&page_key)
    }

    fn replication_commit(
        &self,
        valid_key: &[u8],
        _auto_commit: bool,
        _retry_replication_names: &[ReplicationName],
    ) -> Result<()> {
        self.check_up()?;
        let valid = self.decode_key(valid_key)?;
        let pending = std::mem::take(&mut *self.pending_appends.lock());
        for (rn, local_key) in pending {
            if local_key == valid {
                continue;
            }
            // This replica appended at a different key than the quorum
            // agreed on; re-home the entry.
            if let Some(value) = self.map.remove(local_key)? {
                self.map.put(valid.clone(), value)?;
            }
            debug!("node {}: re-homed append {rn} to {:?}", self.host_id, valid);
        }
        Ok(())
    }
}
