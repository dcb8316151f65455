use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::btree::types::{
    write_bytes, write_u32, write_u64, write_u8, ByteReader, KeyType, RecordType,
};
use crate::core::errors::StorageError;
use crate::core::Result;

const TAG_LEAF: u8 = 1;
const TAG_NODE: u8 = 2;
const TAG_REMOTE: u8 = 3;

/// Handler owner not assigned yet.
pub const NO_OWNER: usize = usize::MAX;

/// Identifies a leaf page towards peers: the separator key that bounds it,
/// whether it is the left or right child of that separator, and the page's
/// persisted position. Equality ignores `pos`.
#[derive(Debug, Clone)]
pub struct PageKey<K> {
    pub key: K,
    pub first: bool,
    pub pos: u64,
}

impl<K: PartialEq> PartialEq for PageKey<K> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.first == other.first
    }
}

impl<K: Eq> Eq for PageKey<K> {}

impl<K> PageKey<K> {
    pub fn new(key: K, first: bool) -> Self {
        Self {
            key,
            first,
            pos: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeafPage<K, V> {
    pub keys: Vec<K>,
    pub values: Vec<V>,
    pub replication_host_ids: Vec<String>,
}

impl<K: KeyType, V: RecordType> LeafPage<K, V> {
    pub fn empty() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            replication_host_ids: Vec::new(),
        }
    }

    pub fn search(&self, key: &K) -> std::result::Result<usize, usize> {
        self.keys.binary_search(key)
    }

    /// Median split. Returns (left, right, split key); the split key is the
    /// first key of the right half.
    pub fn split(&self) -> (LeafPage<K, V>, LeafPage<K, V>, K) {
        let at = self.keys.len() / 2;
        let left = LeafPage {
            keys: self.keys[..at].to_vec(),
            values: self.values[..at].to_vec(),
            replication_host_ids: self.replication_host_ids.clone(),
        };
        let right = LeafPage {
            keys: self.keys[at..].to_vec(),
            values: self.values[at..].to_vec(),
            replication_host_ids: self.replication_host_ids.clone(),
        };
        let split_key = self.keys[at].clone();
        (left, right, split_key)
    }
}

#[derive(Debug, Clone)]
pub struct NodePage<K: KeyType, V: RecordType> {
    pub keys: Vec<K>,
    pub children: Vec<PageRef<K, V>>,
    pub replication_host_ids: Vec<String>,
}

impl<K: KeyType, V: RecordType> NodePage<K, V> {
    /// Child index for a descent towards `key`; keys equal to a separator
    /// route to the right child.
    pub fn page_index(&self, key: &K) -> usize {
        match self.keys.binary_search(key) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// Child index routing equal keys to the left child, used when a
    /// `PageKey` carries the `first` flag.
    pub fn page_index_first(&self, key: &K) -> usize {
        match self.keys.binary_search(key) {
            Ok(i) => i,
            Err(i) => i,
        }
    }

    /// Median split promoting the middle key to the parent.
    pub fn split(&self) -> (NodePage<K, V>, NodePage<K, V>, K) {
        let m = self.keys.len() / 2;
        let promoted = self.keys[m].clone();
        let left = NodePage {
            keys: self.keys[..m].to_vec(),
            children: self.children[..=m].to_vec(),
            replication_host_ids: self.replication_host_ids.clone(),
        };
        let right = NodePage {
            keys: self.keys[m + 1..].to_vec(),
            children: self.children[m + 1..].to_vec(),
            replication_host_ids: self.replication_host_ids.clone(),
        };
        (left, right, promoted)
    }
}

#[derive(Debug, Clone)]
pub struct RemotePage {
    pub replication_host_ids: Vec<String>,
}

/// The three page variants. A page is immutable once published; mutation
/// builds a new page and swaps it into the owning [`PageRef`] slot.
#[derive(Debug, Clone)]
pub enum Page<K: KeyType, V: RecordType> {
    Leaf(LeafPage<K, V>),
    Node(NodePage<K, V>),
    Remote(RemotePage),
}

impl<K: KeyType, V: RecordType> Page<K, V> {
    pub fn is_leaf(&self) -> bool {
        matches!(self, Page::Leaf(_))
    }

    pub fn is_node(&self) -> bool {
        matches!(self, Page::Node(_))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Page::Remote(_))
    }

    pub fn replication_host_ids(&self) -> &[String] {
        match self {
            Page::Leaf(p) => &p.replication_host_ids,
            Page::Node(p) => &p.replication_host_ids,
            Page::Remote(p) => &p.replication_host_ids,
        }
    }

    pub fn entry_count(&self) -> usize {
        match self {
            Page::Leaf(p) => p.keys.len(),
            Page::Node(p) => p.keys.len(),
            Page::Remote(_) => 0,
        }
    }

    /// Serialise this page as a self-describing image. Node children must
    /// already carry a persisted `pos`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Page::Leaf(p) => {
                write_u8(buf, TAG_LEAF);
                encode_host_ids(buf, &p.replication_host_ids);
                write_u32(buf, p.keys.len() as u32);
                for key in &p.keys {
                    key.encode(buf);
                }
                for value in &p.values {
                    value.encode(buf);
                }
            }
            Page::Node(p) => {
                write_u8(buf, TAG_NODE);
                encode_host_ids(buf, &p.replication_host_ids);
                write_u32(buf, p.keys.len() as u32);
                for key in &p.keys {
                    key.encode(buf);
                }
                write_u32(buf, p.children.len() as u32);
                for child in &p.children {
                    write_u64(buf, child.pos());
                }
            }
            Page::Remote(p) => {
                write_u8(buf, TAG_REMOTE);
                encode_host_ids(buf, &p.replication_host_ids);
            }
        }
    }
}

/// A decoded page image; node children are persisted positions until the map
/// rebuilds the in-memory tree.
#[derive(Debug)]
pub enum PageImage<K, V> {
    Leaf(LeafPage<K, V>),
    Node {
        keys: Vec<K>,
        children: Vec<u64>,
        replication_host_ids: Vec<String>,
    },
    Remote(RemotePage),
}

impl<K: KeyType, V: RecordType> PageImage<K, V> {
    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let tag = r.read_u8()?;
        let replication_host_ids = decode_host_ids(r)?;
        match tag {
            TAG_LEAF => {
                let count = r.read_u32()? as usize;
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(K::decode(r)?);
                }
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(V::decode(r)?);
                }
                Ok(PageImage::Leaf(LeafPage {
                    keys,
                    values,
                    replication_host_ids,
                }))
            }
            TAG_NODE => {
                let key_count = r.read_u32()? as usize;
                let mut keys = Vec::with_capacity(key_count);
                for _ in 0..key_count {
                    keys.push(K::decode(r)?);
                }
                let child_count = r.read_u32()? as usize;
                let mut children = Vec::with_capacity(child_count);
                for _ in 0..child_count {
                    children.push(r.read_u64()?);
                }
                Ok(PageImage::Node {
                    keys,
                    children,
                    replication_host_ids,
                })
            }
            TAG_REMOTE => Ok(PageImage::Remote(RemotePage {
                replication_host_ids,
            })),
            other => Err(StorageError(format!("unknown page tag {other}")).into()),
        }
    }
}

fn encode_host_ids(buf: &mut Vec<u8>, hosts: &[String]) {
    write_u32(buf, hosts.len() as u32);
    for host in hosts {
        write_bytes(buf, host.as_bytes());
    }
}

fn decode_host_ids(r: &mut ByteReader<'_>) -> Result<Vec<String>> {
    let count = r.read_u32()? as usize;
    let mut hosts = Vec::with_capacity(count);
    for _ in 0..count {
        hosts.push(r.read_string()?);
    }
    Ok(hosts)
}

struct ParentLink<K: KeyType, V: RecordType> {
    parent: Weak<PageSlot<K, V>>,
    index: usize,
}

/// The slot through which a parent points at a child, and the identity used
/// by children to find their parent. The published page is swapped
/// atomically; in-flight readers keep the page they loaded.
pub struct PageSlot<K: KeyType, V: RecordType> {
    page: ArcSwap<Page<K, V>>,
    pos: AtomicU64,
    latch: AtomicBool,
    owner: AtomicUsize,
    parent: Mutex<Option<ParentLink<K, V>>>,
}

#[derive(Debug)]
pub struct PageRef<K: KeyType, V: RecordType>(Arc<PageSlot<K, V>>);

impl<K: KeyType, V: RecordType> Clone for PageRef<K, V> {
    fn clone(&self) -> Self {
        PageRef(Arc::clone(&self.0))
    }
}

impl<K: KeyType, V: RecordType> std::fmt::Debug for PageSlot<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageSlot")
            .field("pos", &self.pos.load(Ordering::Relaxed))
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K: KeyType, V: RecordType> PageRef<K, V> {
    pub fn new(page: Page<K, V>) -> Self {
        PageRef(Arc::new(PageSlot {
            page: ArcSwap::from_pointee(page),
            pos: AtomicU64::new(0),
            latch: AtomicBool::new(false),
            owner: AtomicUsize::new(NO_OWNER),
            parent: Mutex::new(None),
        }))
    }

    pub fn new_leaf(leaf: LeafPage<K, V>) -> Self {
        Self::new(Page::Leaf(leaf))
    }

    pub fn page(&self) -> Arc<Page<K, V>> {
        self.0.page.load_full()
    }

    /// Swap in a replacement page. The old page stays valid for readers that
    /// already loaded it; the slot's persisted position is invalidated.
    pub fn publish(&self, page: Page<K, V>) {
        self.0.page.store(Arc::new(page));
        self.0.pos.store(0, Ordering::Release);
    }

    pub fn pos(&self) -> u64 {
        self.0.pos.load(Ordering::Acquire)
    }

    pub fn set_pos(&self, pos: u64) {
        self.0.pos.store(pos, Ordering::Release);
    }

    pub fn try_latch(&self) -> bool {
        self.0
            .latch
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlatch(&self) {
        self.0.latch.store(false, Ordering::Release);
    }

    pub fn owner(&self) -> usize {
        self.0.owner.load(Ordering::Acquire)
    }

    pub fn set_owner(&self, owner: usize) {
        self.0.owner.store(owner, Ordering::Release);
    }

    pub fn set_parent(&self, parent: &PageRef<K, V>, index: usize) {
        *self.0.parent.lock() = Some(ParentLink {
            parent: Arc::downgrade(&parent.0),
            index,
        });
    }

    pub fn clear_parent(&self) {
        *self.0.parent.lock() = None;
    }

    pub fn parent(&self) -> Option<(PageRef<K, V>, usize)> {
        let guard = self.0.parent.lock();
        guard
            .as_ref()
            .and_then(|link| link.parent.upgrade().map(|p| (PageRef(p), link.index)))
    }

    /// Stable identity for handler affinity and slot equality.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn same_slot(&self, other: &PageRef<K, V>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
