use crate::btree::map::BTreeMap;
use crate::btree::types::{write_bytes, write_u8, KeyType, RecordType};
use crate::txn::tvalue::TValue;

/// One byte tag per redo record kind.
const REDO_PUT: u8 = 1;
const REDO_REMOVE: u8 = 2;

/// Redo buffers rarely exceed this; the retained size hint is capped here so
/// one huge transaction does not pin a large allocation.
const REDO_SIZE_HINT_CAP: usize = 1024;

/// A single undo record, type-erased over the map it touched.
pub(crate) trait UndoEntry: Send {
    fn map_name(&self) -> &str;
    /// Promote the pending cell to its committed form.
    fn commit_entry(&self);
    /// Restore the cell as it was before the write.
    fn undo_entry(&self);
    fn encode_redo(&self, buf: &mut Vec<u8>);
}

/// Undo record for one cell of a transactional map.
pub(crate) struct CellUndo<K: KeyType, V: RecordType> {
    pub map: BTreeMap<K, TValue<V>>,
    pub map_name: String,
    pub key: K,
    pub old: Option<TValue<V>>,
    pub new: TValue<V>,
    pub for_update: bool,
}

impl<K: KeyType, V: RecordType> UndoEntry for CellUndo<K, V> {
    fn map_name(&self) -> &str {
        &self.map_name
    }

    fn commit_entry(&self) {
        match self.new.commit_cell() {
            Some(cell) => {
                let _ = self.map.put(self.key.clone(), cell);
            }
            None => {
                let _ = self.map.remove(self.key.clone());
            }
        }
    }

    fn undo_entry(&self) {
        match &self.old {
            Some(cell) => {
                let _ = self.map.put(self.key.clone(), cell.clone());
            }
            None => {
                let _ = self.map.remove(self.key.clone());
            }
        }
    }

    fn encode_redo(&self, buf: &mut Vec<u8>) {
        // Lock-only records (for_update without a value change) carry no
        // redo payload.
        if self.for_update {
            return;
        }
        match self.new.commit_cell() {
            Some(cell) => {
                write_u8(buf, REDO_PUT);
                write_bytes(buf, self.map_name.as_bytes());
                write_bytes(buf, &self.key.encoded());
                write_bytes(buf, &cell.encoded());
            }
            None => {
                write_u8(buf, REDO_REMOVE);
                write_bytes(buf, self.map_name.as_bytes());
                write_bytes(buf, &self.key.encoded());
            }
        }
    }
}

/// Ordered per-transaction write log. `log_id` is the count of records, so
/// savepoints are plain `log_id` snapshots and rollback pops from the tail.
pub(crate) struct UndoLog {
    records: Vec<Box<dyn UndoEntry>>,
    redo_size_hint: usize,
}

impl UndoLog {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            redo_size_hint: 64,
        }
    }

    pub fn log_id(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn add(&mut self, entry: Box<dyn UndoEntry>) {
        self.records.push(entry);
    }

    /// Promote every record in append order.
    pub fn commit_all(&mut self) {
        for record in self.records.iter() {
            record.commit_entry();
        }
        self.records.clear();
    }

    /// Pop records with index `>= id`, newest first, restoring prior cells.
    pub fn rollback_to(&mut self, id: u64) {
        while self.records.len() as u64 > id {
            if let Some(record) = self.records.pop() {
                record.undo_entry();
            }
        }
    }

    /// Serialise all records into one redo buffer. The size hint is retained
    /// between calls and capped to bound the allocation.
    pub fn to_redo_buffer(&mut self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.redo_size_hint);
        for record in self.records.iter() {
            record.encode_redo(&mut buf);
        }
        self.redo_size_hint = buf.len().min(REDO_SIZE_HINT_CAP).max(64);
        buf
    }
}
