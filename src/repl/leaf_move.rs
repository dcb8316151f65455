use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use log::{debug, warn};

use crate::btree::map::BTreeMap;
use crate::btree::page::PageKey;
use crate::btree::types::{KeyType, RecordType};
use crate::core::errors::SheafError;
use crate::core::Result;
use crate::pageop::RunnableOperation;
use crate::repl::quorum::quorum;
use crate::repl::NodeRegistry;

/// Byte-level page key carried by move RPCs; `pos` is peer-local and
/// deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanPageKey {
    pub key: Vec<u8>,
    pub first: bool,
}

impl PlanPageKey {
    pub fn from_page_key<K: KeyType>(page_key: &PageKey<K>) -> Self {
        Self {
            key: page_key.key.encoded(),
            first: page_key.first,
        }
    }

    pub fn to_page_key<K: KeyType>(&self) -> Result<PageKey<K>> {
        let mut reader = crate::btree::types::ByteReader::new(&self.key);
        Ok(PageKey::new(K::decode(&mut reader)?, self.first))
    }
}

/// Proposal negotiated to quorum before a leaf changes hands. Replicas keep
/// the plan with the largest `index` they have seen for a page key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafPageMovePlan {
    pub mover_host_id: String,
    pub new_replicas: Vec<String>,
    pub page_key: PlanPageKey,
    pub index: u64,
}

/// Coordinates the two-phase leaf-page move: propose, quorum-validate,
/// transfer, rewire. Client-server, replication and sharding transitions
/// all run the same rounds with `old_nodes` of size zero, one or many.
pub struct LeafMover<K: KeyType, V: RecordType> {
    map: BTreeMap<K, V>,
    map_name: String,
    registry: NodeRegistry,
    self_host: String,
    max_tries: usize,
    choose_replicas: Arc<dyn Fn(&PageKey<K>) -> Vec<String> + Send + Sync>,
}

impl<K: KeyType, V: RecordType> LeafMover<K, V> {
    pub fn new(
        map: BTreeMap<K, V>,
        registry: NodeRegistry,
        self_host: impl Into<String>,
        max_tries: usize,
        choose_replicas: Arc<dyn Fn(&PageKey<K>) -> Vec<String> + Send + Sync>,
    ) -> Arc<Self> {
        let map_name = map.name().to_string();
        Arc::new(Self {
            map,
            map_name,
            registry,
            self_host: self_host.into(),
            max_tries: max_tries.max(1),
            choose_replicas,
        })
    }

    /// Wire the map's leaf-split event: the right half of every split is
    /// scheduled for a move on the page-operation pool.
    pub fn attach(self: &Arc<Self>) {
        let mover = Arc::clone(self);
        let factory = self.map.handler_factory().clone();
        self.map.on_leaf_page_split(move |page_key| {
            let mover = Arc::clone(&mover);
            let mut hasher = DefaultHasher::new();
            page_key.key.encoded().hash(&mut hasher);
            let owner = factory.affinity_owner(hasher.finish() as usize);
            factory.submit_to(
                owner,
                Box::new(RunnableOperation::new(move || {
                    if let Err(e) = mover.move_leaf(page_key) {
                        warn!("leaf move failed: {e}");
                    }
                })),
            );
        });
    }

    /// Run the negotiation for one leaf and, when this node wins, transfer
    /// the page. Returns the winning plan.
    pub fn move_leaf(&self, page_key: PageKey<K>) -> Result<LeafPageMovePlan> {
        let old_nodes = self.map.leaf_hosts(&page_key.key)?;
        let new_replicas = (self.choose_replicas)(&page_key);
        if new_replicas.is_empty() {
            return Err(SheafError::Replication(
                "replica chooser returned no hosts".into(),
            ));
        }

        let proposal = LeafPageMovePlan {
            mover_host_id: self.self_host.clone(),
            new_replicas,
            page_key: PlanPageKey::from_page_key(&page_key),
            index: 1,
        };
        let winner = self.negotiate(&old_nodes, proposal)?;

        if winner.mover_host_id != self.self_host {
            // Another coordinator won the round; adopt its replica list.
            debug!(
                "map {}: yielding leaf move to {}",
                self.map_name, winner.mover_host_id
            );
            self.map
                .set_leaf_hosts(&page_key, winner.new_replicas.clone())?;
            return Ok(winner);
        }

        let image = self.map.encode_leaf(&page_key)?;
        for host in &winner.new_replicas {
            if host == &self.self_host {
                continue;
            }
            let endpoint = self.registry.get(host)?;
            endpoint.move_leaf_page(&self.map_name, &winner.page_key, &image, true)?;
        }
        for host in &old_nodes {
            if host == &self.self_host || winner.new_replicas.contains(host) {
                continue;
            }
            if let Ok(endpoint) = self.registry.get(host) {
                if let Err(e) =
                    endpoint.move_leaf_page(&self.map_name, &winner.page_key, &image, false)
                {
                    warn!("replica {host} failed metadata move: {e}");
                }
            }
        }

        if winner.new_replicas.contains(&self.self_host) {
            self.map
                .set_leaf_hosts(&page_key, winner.new_replicas.clone())?;
        } else {
            self.map
                .replace_with_remote(&page_key, winner.new_replicas.clone())?;
        }
        debug!(
            "map {}: moved leaf {:?} to {:?}",
            self.map_name, page_key.key, winner.new_replicas
        );
        Ok(winner)
    }

    /// Broadcast `prepareMoveLeafPage` to the old replicas and validate the
    /// acknowledgements: (a) `>= W` identical movers win; (b) otherwise the
    /// lexicographically largest mover wins if `>= W` replicas answered at
    /// all; (c) otherwise retry with `index + 1`.
    fn negotiate(
        &self,
        old_nodes: &[String],
        mut plan: LeafPageMovePlan,
    ) -> Result<LeafPageMovePlan> {
        if old_nodes.is_empty() {
            // Client-server transition: no prior replicas to convince.
            return Ok(plan);
        }
        let w = quorum(old_nodes.len());

        for _round in 0..self.max_tries {
            let mut acks: Vec<LeafPageMovePlan> = Vec::new();
            for host in old_nodes {
                let Ok(endpoint) = self.registry.get(host) else {
                    continue;
                };
                match endpoint.prepare_move_leaf_page(&self.map_name, &plan) {
                    Ok(accepted) => acks.push(accepted),
                    Err(e) => debug!("replica {host} rejected prepare: {e}"),
                }
            }

            let mut by_mover: HashMap<&str, usize> = HashMap::new();
            for ack in &acks {
                *by_mover.entry(ack.mover_host_id.as_str()).or_default() += 1;
            }
            if let Some((mover, _)) = by_mover.iter().find(|(_, count)| **count >= w) {
                let winner = acks
                    .iter()
                    .find(|ack| ack.mover_host_id == *mover)
                    .cloned()
                    .expect("counted mover has an ack");
                return Ok(winner);
            }
            if acks.len() >= w {
                let winner = acks
                    .into_iter()
                    .max_by(|a, b| a.mover_host_id.cmp(&b.mover_host_id))
                    .expect("non-empty acks");
                return Ok(winner);
            }

            plan.index += 1;
        }
        Err(SheafError::QuorumFailed(format!(
            "leaf move for map {} did not reach quorum after {} rounds",
            self.map_name, self.max_tries
        )))
    }
}
