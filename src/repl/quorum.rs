use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{unbounded, RecvTimeoutError};
use log::{debug, warn};
use rand::seq::SliceRandom;

use crate::btree::types::{ByteReader, KeyType, RecordType};
use crate::core::errors::SheafError;
use crate::core::Result;
use crate::repl::{NodeRegistry, ReplicaEndpoint};
use crate::session::Session;

const RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// Write quorum for a replica set of `n`.
pub fn quorum(n: usize) -> usize {
    n / 2 + 1
}

/// Client-side view of a replicated map: writes go to all replicas and
/// succeed at `W = n/2+1` acknowledgements; reads pick a random replica and
/// retry up to `max_tries`.
pub struct ReplicatedMap<K: KeyType, V: RecordType> {
    map_name: String,
    registry: NodeRegistry,
    hosts: Vec<String>,
    max_tries: usize,
    _types: PhantomData<(K, V)>,
}

impl<K: KeyType, V: RecordType> ReplicatedMap<K, V> {
    pub fn new(
        map_name: impl Into<String>,
        registry: NodeRegistry,
        hosts: Vec<String>,
        max_tries: usize,
    ) -> Self {
        Self {
            map_name: map_name.into(),
            registry,
            hosts,
            max_tries: max_tries.max(1),
            _types: PhantomData,
        }
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let key_bytes = key.encoded();
        let mut order = self.hosts.clone();
        order.shuffle(&mut rand::thread_rng());
        let mut last_error = None;
        for host in order.iter().cycle().take(self.max_tries) {
            let endpoint = match self.registry.get(host) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };
            match endpoint.get(&self.map_name, &key_bytes) {
                Ok(value) => return decode_value_opt::<V>(value),
                Err(e) => {
                    debug!("replica {host} failed get on {}: {e}", self.map_name);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            SheafError::Replication(format!("no replicas reachable for {}", self.map_name))
        }))
    }

    pub fn put(&self, session: &Session, key: K, value: V) -> Result<Option<V>> {
        let rn = session.next_replication_name();
        let key_bytes = key.encoded();
        let value_bytes = value.encoded();
        let map_name = self.map_name.clone();
        let previous = self.write_quorum(move |endpoint| {
            endpoint.put(&rn, &map_name, &key_bytes, &value_bytes, false, false)
        })?;
        decode_value_opt::<V>(previous)
    }

    pub fn put_if_absent(&self, session: &Session, key: K, value: V) -> Result<Option<V>> {
        let rn = session.next_replication_name();
        let key_bytes = key.encoded();
        let value_bytes = value.encoded();
        let map_name = self.map_name.clone();
        let previous = self.write_quorum(move |endpoint| {
            endpoint.put(&rn, &map_name, &key_bytes, &value_bytes, false, true)
        })?;
        decode_value_opt::<V>(previous)
    }

    pub fn replace(&self, session: &Session, key: K, old_value: V, new_value: V) -> Result<bool> {
        let rn = session.next_replication_name();
        let key_bytes = key.encoded();
        let old_bytes = old_value.encoded();
        let new_bytes = new_value.encoded();
        let map_name = self.map_name.clone();
        self.write_quorum(move |endpoint| {
            endpoint.replace(&rn, &map_name, &key_bytes, &old_bytes, &new_bytes)
        })
    }

    pub fn remove(&self, session: &Session, key: K) -> Result<Option<V>> {
        let rn = session.next_replication_name();
        let key_bytes = key.encoded();
        let map_name = self.map_name.clone();
        let previous =
            self.write_quorum(move |endpoint| endpoint.remove(&rn, &map_name, &key_bytes))?;
        decode_value_opt::<V>(previous)
    }

    /// Append on every replica; replicas may land on different local keys,
    /// so the largest acknowledged key is broadcast back as the valid one.
    pub fn append(&self, session: &Session, value: V) -> Result<K> {
        let rn = session.next_replication_name();
        let value_bytes = value.encoded();
        let map_name = self.map_name.clone();
        let acked = self.write_quorum_all(move |endpoint| {
            endpoint.append(&rn, &map_name, &value_bytes)
        })?;

        let mut keys = Vec::with_capacity(acked.len());
        for bytes in &acked {
            let mut reader = ByteReader::new(bytes);
            keys.push(K::decode(&mut reader)?);
        }
        let valid_key = keys
            .into_iter()
            .max()
            .ok_or_else(|| SheafError::QuorumFailed("append got no acknowledgements".into()))?;
        let valid_bytes = valid_key.encoded();

        for host in &self.hosts {
            if let Ok(endpoint) = self.registry.get(host) {
                if let Err(e) = endpoint.replication_commit(&valid_bytes, true, &[]) {
                    warn!("replica {host} failed replication commit: {e}");
                }
            }
        }
        Ok(valid_key)
    }

    /// Issue `call` to every replica in parallel and return the first
    /// success once `W` replicas acknowledged; retried whole on failure
    /// with the same replication name, so replicas discard the duplicates.
    fn write_quorum<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn ReplicaEndpoint>) -> Result<T> + Send + Sync + 'static,
    {
        let results = self.broadcast(&Arc::new(call), false)?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| SheafError::QuorumFailed(format!("no acks for {}", self.map_name)))
    }

    /// Like `write_quorum`, but waits for every replica to answer (or
    /// fail); the append path needs the full ack set before it can pick
    /// the valid key.
    fn write_quorum_all<T, F>(&self, call: F) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn ReplicaEndpoint>) -> Result<T> + Send + Sync + 'static,
    {
        self.broadcast(&Arc::new(call), true)
    }

    fn broadcast<T, F>(&self, call: &Arc<F>, wait_all: bool) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn ReplicaEndpoint>) -> Result<T> + Send + Sync + 'static,
    {
        let n = self.hosts.len();
        if n == 0 {
            return Err(SheafError::Replication(format!(
                "map {} has no replica hosts",
                self.map_name
            )));
        }
        let w = quorum(n);
        let mut last_error = None;
        let mut best_acks = 0;

        for attempt in 1..=self.max_tries {
            let (sender, receiver) = unbounded();
            for host in &self.hosts {
                let endpoint = self.registry.get(host);
                let call = Arc::clone(call);
                let sender = sender.clone();
                let host = host.clone();
                std::thread::spawn(move || {
                    let outcome = endpoint.and_then(|endpoint| call(endpoint));
                    let _ = sender.send((host, outcome));
                });
            }
            drop(sender);

            let mut successes = Vec::new();
            let mut failures = 0;
            loop {
                if !wait_all && successes.len() >= w {
                    return Ok(successes);
                }
                if successes.len() + failures >= n {
                    break;
                }
                match receiver.recv_timeout(RPC_TIMEOUT) {
                    Ok((_, Ok(value))) => successes.push(value),
                    Ok((host, Err(e))) => {
                        debug!("replica {host} failed write on {}: {e}", self.map_name);
                        failures += 1;
                        last_error = Some(e);
                    }
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            if successes.len() >= w {
                return Ok(successes);
            }
            best_acks = best_acks.max(successes.len());
            debug!(
                "map {}: quorum attempt {attempt}/{} got {}/{w} acks",
                self.map_name,
                self.max_tries,
                successes.len()
            );
        }
        Err(SheafError::QuorumFailed(format!(
            "map {}: {} of {} replicas acknowledged after {} tries ({})",
            self.map_name,
            best_acks,
            n,
            self.max_tries,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no error".into())
        )))
    }
}

fn decode_value_opt<V: RecordType>(bytes: Option<Vec<u8>>) -> Result<Option<V>> {
    match bytes {
        Some(bytes) => {
            let mut reader = ByteReader::new(&bytes);
            Ok(Some(V::decode(&mut reader)?))
        }
        None => Ok(None),
    }
}
