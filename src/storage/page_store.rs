use std::path::{Path, PathBuf};

use log::debug;

use crate::btree::page::{Page, PageRef};
use crate::btree::types::{KeyType, RecordType};
use crate::core::Result;
use crate::storage::chunk::{ChunkFile, ChunkTrailer, ChunkWriter};

/// Persists page images of one map into an append-only chunk file and owns
/// the last-chunk metadata resolved at open time.
pub struct PageStore {
    path: PathBuf,
    chunk_file: ChunkFile,
    root_pos: Option<u64>,
    map_size: u64,
    max_key: u64,
    replica_hosts: Vec<String>,
}

impl PageStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let chunk_file = ChunkFile::open(&path)?;
        let (root_pos, map_size, max_key, replica_hosts) = match chunk_file.last_trailer() {
            Some(trailer) => (
                Some(trailer.root_pos),
                trailer.map_size,
                trailer.max_key,
                trailer.replica_hosts.clone(),
            ),
            None => (None, 0, 0, Vec::new()),
        };
        debug!(
            "page store {:?}: root_pos={:?} map_size={}",
            path, root_pos, map_size
        );
        Ok(Self {
            path,
            chunk_file,
            root_pos,
            map_size,
            max_key,
            replica_hosts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn root_pos(&self) -> Option<u64> {
        self.root_pos
    }

    pub fn map_size(&self) -> u64 {
        self.map_size
    }

    pub fn max_key(&self) -> u64 {
        self.max_key
    }

    pub fn replica_hosts(&self) -> &[String] {
        &self.replica_hosts
    }

    pub fn read_page(&mut self, pos: u64) -> Result<Vec<u8>> {
        self.chunk_file.read_page(pos)
    }

    /// Publish the whole tree as a new chunk. Atomic at chunk granularity:
    /// a crash mid-write leaves the prior chunk authoritative. `force` is
    /// recorded for symmetry; the caller gates the clean case.
    pub fn save_tree<K: KeyType, V: RecordType>(
        &mut self,
        root: &PageRef<K, V>,
        map_size: u64,
        max_key: u64,
        force: bool,
    ) -> Result<()> {
        let replica_hosts = root.page().replication_host_ids().to_vec();
        let trailer = self.chunk_file.append_chunk(|writer| {
            let root_pos = write_page_recursive(writer, root);
            Ok(ChunkTrailer {
                chunk_id: 0,
                root_pos,
                map_size,
                max_key,
                replica_hosts: replica_hosts.clone(),
            })
        })?;
        debug!(
            "page store {:?}: saved chunk {} root_pos={} size={} force={}",
            self.path, trailer.chunk_id, trailer.root_pos, map_size, force
        );
        self.root_pos = Some(trailer.root_pos);
        self.map_size = map_size;
        self.max_key = max_key;
        self.replica_hosts = trailer.replica_hosts;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.chunk_file.sync()
    }
}

/// Post-order walk so node images always reference persisted children.
fn write_page_recursive<K: KeyType, V: RecordType>(
    writer: &mut ChunkWriter,
    slot: &PageRef<K, V>,
) -> u64 {
    let page = slot.page();
    if let Page::Node(node) = &*page {
        for child in &node.children {
            write_page_recursive(writer, child);
        }
    }
    let mut image = Vec::new();
    page.encode(&mut image);
    let pos = writer.write_page(&image);
    slot.set_pos(pos);
    pos
}
