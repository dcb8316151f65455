use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::core::errors::SheafError;

pub const OPT_READ_ONLY: &str = "readOnly";
pub const OPT_IN_MEMORY: &str = "inMemory";
pub const OPT_SHARDING_MODE: &str = "isShardingMode";
pub const OPT_INIT_REPLICATION_NODES: &str = "initReplicationNodes";
pub const OPT_PAGE_STORAGE_MODE: &str = "pageStorageMode";
pub const OPT_PAGE_SPLIT_SIZE: &str = "pageSplitSize";
pub const OPT_MAX_TRIES: &str = "maxTries";
pub const OPT_SCHEDULER_LOOP_INTERVAL: &str = "scheduler_loop_interval";
pub const OPT_NIO_LOOP_INTERVAL: &str = "server_nio_event_loop_interval";
pub const OPT_HANDLER_LOOP_INTERVAL: &str = "page_operation_handler_loop_interval";
pub const OPT_SESSION_POOL_QUEUE_SIZE: &str = "lealone.session.pool.queue.size";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PageStorageMode {
    RowStorage,
    ColumnStorage,
}

/// Typed view over the string option map handed to a store at open time.
///
/// Presence-style options (`readOnly`, `inMemory`) are true when the key
/// exists, whatever its value.
#[derive(Debug, Clone, Serialize)]
pub struct StoreConfig {
    pub read_only: bool,
    pub in_memory: bool,
    pub sharding_mode: bool,
    pub init_replication_nodes: Vec<String>,
    pub page_storage_mode: PageStorageMode,
    pub page_split_size: usize,
    pub max_tries: usize,
    pub scheduler_loop_interval_ms: u64,
    pub nio_loop_interval_ms: u64,
    pub handler_loop_interval_ms: u64,
    pub session_pool_queue_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            in_memory: false,
            sharding_mode: false,
            init_replication_nodes: Vec::new(),
            page_storage_mode: PageStorageMode::RowStorage,
            page_split_size: 16,
            max_tries: 3,
            scheduler_loop_interval_ms: 100,
            nio_loop_interval_ms: 100,
            handler_loop_interval_ms: 100,
            session_pool_queue_size: 3,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_options(options: &HashMap<String, String>) -> Result<Self, SheafError> {
        let mut config = Self::default();
        config.read_only = options.contains_key(OPT_READ_ONLY);
        config.in_memory = options.contains_key(OPT_IN_MEMORY);
        if let Some(v) = options.get(OPT_SHARDING_MODE) {
            config.sharding_mode = parse_bool(OPT_SHARDING_MODE, v)?;
        }
        if let Some(v) = options.get(OPT_INIT_REPLICATION_NODES) {
            config.init_replication_nodes = v
                .split('&')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = options.get(OPT_PAGE_STORAGE_MODE) {
            config.page_storage_mode = match v.as_str() {
                "ROW_STORAGE" => PageStorageMode::RowStorage,
                "COLUMN_STORAGE" => PageStorageMode::ColumnStorage,
                other => {
                    return Err(SheafError::Config(format!(
                        "unknown pageStorageMode: {other}"
                    )))
                }
            };
        }
        if let Some(v) = options.get(OPT_PAGE_SPLIT_SIZE) {
            config.page_split_size = parse_num(OPT_PAGE_SPLIT_SIZE, v)? as usize;
        }
        if let Some(v) = options.get(OPT_MAX_TRIES) {
            config.max_tries = parse_num(OPT_MAX_TRIES, v)? as usize;
        }
        if let Some(v) = options.get(OPT_SCHEDULER_LOOP_INTERVAL) {
            config.scheduler_loop_interval_ms = parse_num(OPT_SCHEDULER_LOOP_INTERVAL, v)?;
        }
        if let Some(v) = options.get(OPT_NIO_LOOP_INTERVAL) {
            config.nio_loop_interval_ms = parse_num(OPT_NIO_LOOP_INTERVAL, v)?;
        }
        if let Some(v) = options.get(OPT_HANDLER_LOOP_INTERVAL) {
            config.handler_loop_interval_ms = parse_num(OPT_HANDLER_LOOP_INTERVAL, v)?;
        }
        if let Some(v) = options.get(OPT_SESSION_POOL_QUEUE_SIZE) {
            config.session_pool_queue_size = parse_num(OPT_SESSION_POOL_QUEUE_SIZE, v)? as usize;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SheafError> {
        if self.sharding_mode && self.init_replication_nodes.is_empty() {
            return Err(SheafError::Config(
                "initReplicationNodes is required in sharding mode".into(),
            ));
        }
        if self.page_split_size < 4 {
            return Err(SheafError::Config(format!(
                "pageSplitSize must be at least 4, got {}",
                self.page_split_size
            )));
        }
        if self.max_tries == 0 {
            return Err(SheafError::Config("maxTries must be positive".into()));
        }
        Ok(())
    }

    pub fn scheduler_loop_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_loop_interval_ms)
    }

    pub fn handler_loop_interval(&self) -> Duration {
        Duration::from_millis(self.handler_loop_interval_ms)
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn in_memory(mut self) -> Self {
        self.in_memory = true;
        self
    }

    pub fn sharding_mode(mut self, nodes: Vec<String>) -> Self {
        self.sharding_mode = true;
        self.init_replication_nodes = nodes;
        self
    }

    pub fn page_split_size(mut self, size: usize) -> Self {
        self.page_split_size = size;
        self
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, SheafError> {
    value
        .parse::<bool>()
        .map_err(|_| SheafError::Config(format!("invalid boolean for {key}: {value}")))
}

fn parse_num(key: &str, value: &str) -> Result<u64, SheafError> {
    value
        .parse::<u64>()
        .map_err(|_| SheafError::Config(format!("invalid number for {key}: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_options() {
        let mut options = HashMap::new();
        options.insert(OPT_READ_ONLY.to_string(), String::new());
        options.insert(OPT_IN_MEMORY.to_string(), "anything".to_string());
        let config = StoreConfig::from_options(&options).unwrap();
        assert!(config.read_only);
        assert!(config.in_memory);
        assert!(!config.sharding_mode);
    }

    #[test]
    fn session_pool_queue_size_key() {
        let mut options = HashMap::new();
        options.insert(
            "lealone.session.pool.queue.size".to_string(),
            "5".to_string(),
        );
        let config = StoreConfig::from_options(&options).unwrap();
        assert_eq!(config.session_pool_queue_size, 5);
        assert_eq!(StoreConfig::default().session_pool_queue_size, 3);
    }

    #[test]
    fn sharding_requires_nodes() {
        let mut options = HashMap::new();
        options.insert(OPT_SHARDING_MODE.to_string(), "true".to_string());
        assert!(StoreConfig::from_options(&options).is_err());

        options.insert(
            OPT_INIT_REPLICATION_NODES.to_string(),
            "127.0.0.1:9610&127.0.0.1:9611".to_string(),
        );
        let config = StoreConfig::from_options(&options).unwrap();
        assert_eq!(config.init_replication_nodes.len(), 2);
    }
}
