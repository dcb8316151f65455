use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;

use crate::btree::cursor::BTreeCursor;
use crate::btree::page::{LeafPage, NodePage, Page, PageKey, PageRef, RemotePage, NO_OWNER};
use crate::btree::types::{ByteReader, KeyType, RecordType};
use crate::btree::write::{ApplyOutcome, SingleWrite};
use crate::core::config::StoreConfig;
use crate::core::errors::SheafError;
use crate::core::Result;
use crate::pageop::{
    AsyncResult, CallbackListener, PageOperation, PageOperationHandlerFactory,
    PageOperationResult, ResultListener, SyncListener,
};
use crate::storage::page_store::PageStore;

pub(crate) struct MapInner<K: KeyType, V: RecordType> {
    pub(crate) name: String,
    pub(crate) config: StoreConfig,
    pub(crate) root: PageRef<K, V>,
    pub(crate) size: AtomicU64,
    pub(crate) max_key: AtomicU64,
    pub(crate) latch: RwLock<()>,
    pub(crate) closed: AtomicBool,
    pub(crate) dirty: AtomicBool,
    pub(crate) factory: PageOperationHandlerFactory,
    pub(crate) store: Option<parking_lot::Mutex<PageStore>>,
    split_listener: RwLock<Option<Arc<dyn Fn(PageKey<K>) + Send + Sync>>>,
}

impl<K: KeyType, V: RecordType> MapInner<K, V> {
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SheafError::MapClosed(self.name.clone()));
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.config.read_only {
            return Err(SheafError::ReadOnly(self.name.clone()));
        }
        Ok(())
    }

    pub(crate) fn size_inc(&self) {
        self.size.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn size_dec(&self) {
        self.size.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Descend to the leaf covering `key` without taking any page locks.
    pub(crate) fn find_leaf(&self, key: &K) -> Result<PageRef<K, V>> {
        let mut current = self.root.clone();
        loop {
            let page = current.page();
            match &*page {
                Page::Node(node) => {
                    let index = node.page_index(key);
                    current = node.children[index].clone();
                }
                Page::Leaf(_) | Page::Remote(_) => return Ok(current),
            }
        }
    }

    /// Descend towards the leaf a [`PageKey`] names; the `first` flag picks
    /// the left child when the key equals a separator.
    pub(crate) fn find_leaf_by_page_key(&self, page_key: &PageKey<K>) -> PageRef<K, V> {
        let mut current = self.root.clone();
        loop {
            let page = current.page();
            match &*page {
                Page::Node(node) => {
                    let index = if page_key.first {
                        node.page_index_first(&page_key.key)
                    } else {
                        node.page_index(&page_key.key)
                    };
                    current = node.children[index].clone();
                }
                Page::Leaf(_) | Page::Remote(_) => return current,
            }
        }
    }

    pub(crate) fn ensure_owner(&self, leaf: &PageRef<K, V>) -> usize {
        let owner = leaf.owner();
        if owner != NO_OWNER {
            return owner;
        }
        let assigned = self.factory.affinity_owner(leaf.id());
        leaf.set_owner(assigned);
        assigned
    }

    pub(crate) fn set_split_listener(&self, listener: Arc<dyn Fn(PageKey<K>) + Send + Sync>) {
        *self.split_listener.write() = Some(listener);
    }

    pub(crate) fn fire_leaf_page_split(&self, split_key: K) {
        let listener = self.split_listener.read().clone();
        if let Some(listener) = listener {
            listener(PageKey::new(split_key, false));
        }
    }

    /// Split the latched, oversized leaf. Structural mutation, so the whole
    /// path copy runs under the tree write latch. Returns the split key so
    /// the caller can fire the split event after releasing latches.
    pub(crate) fn split_leaf(&self, leaf: &PageRef<K, V>) -> Option<K> {
        let _guard = self.latch.write();

        let page = leaf.page();
        let leaf_page = match &*page {
            Page::Leaf(l) if l.keys.len() > self.config.page_split_size => l,
            _ => return None,
        };
        let (left, right, split_key) = leaf_page.split();
        debug!(
            "map {}: splitting leaf at {:?} ({} entries)",
            self.name,
            split_key,
            leaf_page.keys.len()
        );

        let right_ref = PageRef::new_leaf(right);
        right_ref.set_owner(self.factory.affinity_owner(right_ref.id()));

        if leaf.same_slot(&self.root) {
            let left_ref = PageRef::new_leaf(left);
            left_ref.set_owner(self.factory.affinity_owner(left_ref.id()));
            let hosts = page.replication_host_ids().to_vec();
            self.root.publish(Page::Node(NodePage {
                keys: vec![split_key.clone()],
                children: vec![left_ref, right_ref],
                replication_host_ids: hosts,
            }));
            self.rewire_children(&self.root);
        } else {
            let Some((parent, index)) = self.locate_parent(leaf) else {
                return None;
            };
            leaf.publish(Page::Leaf(left));
            let parent_page = parent.page();
            let Page::Node(node) = &*parent_page else {
                return None;
            };
            let mut keys = node.keys.clone();
            let mut children = node.children.clone();
            keys.insert(index, split_key.clone());
            children.insert(index + 1, right_ref);
            let oversized = keys.len() > self.config.page_split_size;
            parent.publish(Page::Node(NodePage {
                keys,
                children,
                replication_host_ids: node.replication_host_ids.clone(),
            }));
            self.rewire_children(&parent);
            if oversized {
                self.split_node(&parent);
            }
        }
        Some(split_key)
    }

    /// Split an oversized interior node, recursing towards the root. Caller
    /// holds the tree write latch.
    fn split_node(&self, node_ref: &PageRef<K, V>) {
        let page = node_ref.page();
        let Page::Node(node) = &*page else { return };
        if node.keys.len() <= self.config.page_split_size {
            return;
        }
        let (left, right, promoted) = node.split();

        let left_ref = PageRef::new(Page::Node(left));
        let right_ref = PageRef::new(Page::Node(right));

        if node_ref.same_slot(&self.root) {
            self.root.publish(Page::Node(NodePage {
                keys: vec![promoted],
                children: vec![left_ref.clone(), right_ref.clone()],
                replication_host_ids: node.replication_host_ids.clone(),
            }));
            self.rewire_children(&self.root);
            self.rewire_children(&left_ref);
            self.rewire_children(&right_ref);
        } else {
            let Some((parent, index)) = self.locate_parent(node_ref) else {
                return;
            };
            let parent_page = parent.page();
            let Page::Node(parent_node) = &*parent_page else {
                return;
            };
            let mut keys = parent_node.keys.clone();
            let mut children = parent_node.children.clone();
            keys.insert(index, promoted);
            children[index] = left_ref.clone();
            children.insert(index + 1, right_ref.clone());
            let oversized = keys.len() > self.config.page_split_size;
            parent.publish(Page::Node(NodePage {
                keys,
                children,
                replication_host_ids: parent_node.replication_host_ids.clone(),
            }));
            self.rewire_children(&parent);
            self.rewire_children(&left_ref);
            self.rewire_children(&right_ref);
            if oversized {
                self.split_node(&parent);
            }
        }
    }

    /// Refresh the parent back-references of every child of `node_ref`.
    fn rewire_children(&self, node_ref: &PageRef<K, V>) {
        let page = node_ref.page();
        if let Page::Node(node) = &*page {
            for (index, child) in node.children.iter().enumerate() {
                child.set_parent(node_ref, index);
            }
        }
    }

    /// Rebuild parent links for a whole subtree; used after loading a tree
    /// image from the page store.
    pub(crate) fn rewire_recursive(&self, node_ref: &PageRef<K, V>) {
        let page = node_ref.page();
        if let Page::Node(node) = &*page {
            for (index, child) in node.children.iter().enumerate() {
                child.set_parent(node_ref, index);
                self.rewire_recursive(child);
            }
        }
    }

    /// Parent slot and child index of `child`, validated against the
    /// parent's current page (the stored index may be stale).
    fn locate_parent(&self, child: &PageRef<K, V>) -> Option<(PageRef<K, V>, usize)> {
        let (parent, index) = child.parent()?;
        let page = parent.page();
        if let Page::Node(node) = &*page {
            if index < node.children.len() && node.children[index].same_slot(child) {
                return Some((parent, index));
            }
            for (i, candidate) in node.children.iter().enumerate() {
                if candidate.same_slot(child) {
                    return Some((parent, i));
                }
            }
        }
        None
    }
}

/// A copy-on-write B-tree map with lock-free readers and per-leaf
/// serialised writers.
pub struct BTreeMap<K: KeyType, V: RecordType> {
    inner: Arc<MapInner<K, V>>,
}

impl<K: KeyType, V: RecordType> Clone for BTreeMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: KeyType, V: RecordType> BTreeMap<K, V> {
    pub fn open(
        name: impl Into<String>,
        config: StoreConfig,
        factory: PageOperationHandlerFactory,
        store: Option<PageStore>,
    ) -> Result<Self> {
        let name = name.into();
        let mut root_leaf = LeafPage::empty();
        if config.sharding_mode {
            root_leaf.replication_host_ids = config.init_replication_nodes.clone();
        }
        let root = PageRef::new_leaf(root_leaf);

        let inner = Arc::new(MapInner {
            name,
            config,
            root,
            size: AtomicU64::new(0),
            max_key: AtomicU64::new(0),
            latch: RwLock::new(()),
            closed: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            factory,
            store: store.map(parking_lot::Mutex::new),
            split_listener: RwLock::new(None),
        });

        let map = Self { inner };
        map.load_from_store()?;
        Ok(map)
    }

    fn load_from_store(&self) -> Result<()> {
        let Some(store) = &self.inner.store else {
            return Ok(());
        };
        let mut store = store.lock();
        let Some(root_pos) = store.root_pos() else {
            return Ok(());
        };
        let root_page = self.read_page_tree(&mut store, root_pos)?;
        let _guard = self.inner.latch.write();
        self.inner.root.publish(root_page);
        self.inner.root.set_pos(root_pos);
        self.inner
            .size
            .store(store.map_size(), Ordering::Release);
        self.inner
            .max_key
            .store(store.max_key(), Ordering::Release);
        self.inner.rewire_recursive(&self.inner.root);
        Ok(())
    }

    fn read_page_tree(&self, store: &mut PageStore, pos: u64) -> Result<Page<K, V>> {
        let image = store.read_page(pos)?;
        let mut reader = ByteReader::new(&image);
        let decoded = crate::btree::page::PageImage::<K, V>::decode(&mut reader)?;
        match decoded {
            crate::btree::page::PageImage::Leaf(leaf) => Ok(Page::Leaf(leaf)),
            crate::btree::page::PageImage::Remote(remote) => Ok(Page::Remote(remote)),
            crate::btree::page::PageImage::Node {
                keys,
                children,
                replication_host_ids,
            } => {
                let mut child_refs = Vec::with_capacity(children.len());
                for child_pos in children {
                    let child_page = self.read_page_tree(store, child_pos)?;
                    let child_ref = PageRef::new(child_page);
                    child_ref.set_pos(child_pos);
                    child_refs.push(child_ref);
                }
                let node = NodePage {
                    keys,
                    children: child_refs,
                    replication_host_ids,
                };
                let node_ref_page = Page::Node(node);
                // Parent links are rewired by the caller once the slot that
                // will own this page exists.
                Ok(node_ref_page)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn size(&self) -> u64 {
        self.inner.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn handler_factory(&self) -> &PageOperationHandlerFactory {
        &self.inner.factory
    }

    /// Register the callback fired after a leaf split with the split key;
    /// sharding uses it to schedule the move of the right half.
    pub fn on_leaf_page_split(&self, listener: impl Fn(PageKey<K>) + Send + Sync + 'static) {
        self.inner.set_split_listener(Arc::new(listener));
    }

    // ---- reads -----------------------------------------------------------

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.inner.check_open()?;
        let leaf = self.inner.find_leaf(key)?;
        let page = leaf.page();
        match &*page {
            Page::Leaf(l) => Ok(l.search(key).ok().map(|i| l.values[i].clone())),
            Page::Remote(_) => Err(SheafError::Replication(format!(
                "leaf page for key {key:?} is remote"
            ))),
            Page::Node(_) => Err(SheafError::IllegalState("descended to a node page".into())),
        }
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn first_key(&self) -> Result<Option<K>> {
        self.inner.check_open()?;
        Ok(self.cursor(None, None)?.next().transpose()?.map(|(k, _)| k))
    }

    pub fn last_key(&self) -> Result<Option<K>> {
        self.inner.check_open()?;
        let root = self.inner.root.page();
        Self::last_key_in(&root)
    }

    fn last_key_in(page: &Page<K, V>) -> Result<Option<K>> {
        match page {
            Page::Leaf(l) => Ok(l.keys.last().cloned()),
            Page::Remote(_) => Err(SheafError::Replication("page is remote".into())),
            Page::Node(node) => {
                // Walk right to left so removed-empty leaves are skipped.
                for child in node.children.iter().rev() {
                    let child_page = child.page();
                    if let Some(found) = Self::last_key_in(&child_page)? {
                        return Ok(Some(found));
                    }
                }
                Ok(None)
            }
        }
    }

    /// Largest key `<= key`.
    pub fn floor_key(&self, key: &K) -> Result<Option<K>> {
        self.bounded_key(key, true, true)
    }

    /// Largest key `< key`.
    pub fn lower_key(&self, key: &K) -> Result<Option<K>> {
        self.bounded_key(key, true, false)
    }

    /// Smallest key `>= key`.
    pub fn ceiling_key(&self, key: &K) -> Result<Option<K>> {
        self.bounded_key(key, false, true)
    }

    /// Smallest key `> key`.
    pub fn higher_key(&self, key: &K) -> Result<Option<K>> {
        self.bounded_key(key, false, false)
    }

    fn bounded_key(&self, key: &K, below: bool, inclusive: bool) -> Result<Option<K>> {
        self.inner.check_open()?;
        let root = self.inner.root.page();
        Self::bounded_key_in(&root, key, below, inclusive)
    }

    fn bounded_key_in(
        page: &Page<K, V>,
        key: &K,
        below: bool,
        inclusive: bool,
    ) -> Result<Option<K>> {
        match page {
            Page::Remote(_) => Err(SheafError::Replication("page is remote".into())),
            Page::Leaf(l) => {
                let candidate = match l.keys.binary_search(key) {
                    Ok(i) => {
                        if inclusive {
                            Some(i)
                        } else if below {
                            i.checked_sub(1)
                        } else if i + 1 < l.keys.len() {
                            Some(i + 1)
                        } else {
                            None
                        }
                    }
                    Err(i) => {
                        if below {
                            i.checked_sub(1)
                        } else if i < l.keys.len() {
                            Some(i)
                        } else {
                            None
                        }
                    }
                };
                Ok(candidate.map(|i| l.keys[i].clone()))
            }
            Page::Node(node) => {
                let pivot = node.page_index(key);
                if below {
                    // Try the covering child, then fall back leftwards.
                    for index in (0..=pivot).rev() {
                        let child = node.children[index].page();
                        let found = if index == pivot {
                            Self::bounded_key_in(&child, key, below, inclusive)?
                        } else {
                            Self::last_key_in(&child)?
                        };
                        if found.is_some() {
                            return Ok(found);
                        }
                    }
                    Ok(None)
                } else {
                    for index in pivot..node.children.len() {
                        let child = node.children[index].page();
                        let found = if index == pivot {
                            Self::bounded_key_in(&child, key, below, inclusive)?
                        } else {
                            Self::first_key_in(&child)?
                        };
                        if found.is_some() {
                            return Ok(found);
                        }
                    }
                    Ok(None)
                }
            }
        }
    }

    fn first_key_in(page: &Page<K, V>) -> Result<Option<K>> {
        match page {
            Page::Leaf(l) => Ok(l.keys.first().cloned()),
            Page::Remote(_) => Err(SheafError::Replication("page is remote".into())),
            Page::Node(node) => {
                for child in node.children.iter() {
                    let child_page = child.page();
                    if let Some(found) = Self::first_key_in(&child_page)? {
                        return Ok(Some(found));
                    }
                }
                Ok(None)
            }
        }
    }

    /// Lazy forward iterator over `[from, to]` in key order. Restart by
    /// constructing a new cursor.
    pub fn cursor(&self, from: Option<K>, to: Option<K>) -> Result<BTreeCursor<K, V>> {
        self.inner.check_open()?;
        Ok(BTreeCursor::new(self.inner.clone(), from, to, None))
    }

    /// Cursor restricted to the enumerated leaf pages, visited in the given
    /// order; used by sharding to scan exactly the local leaves.
    pub fn cursor_over_pages(
        &self,
        from: Option<K>,
        to: Option<K>,
        page_keys: Vec<PageKey<K>>,
    ) -> Result<BTreeCursor<K, V>> {
        self.inner.check_open()?;
        Ok(BTreeCursor::new(self.inner.clone(), from, to, Some(page_keys)))
    }

    // ---- writes ----------------------------------------------------------

    pub fn put(&self, key: K, value: V) -> Result<Option<V>> {
        let listener = Arc::new(SyncListener::new());
        self.async_put_with_listener(key, value, listener.clone());
        listener.await_result()
    }

    pub fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>> {
        let listener = Arc::new(SyncListener::new());
        self.async_put_if_absent_with_listener(key, value, listener.clone());
        listener.await_result()
    }

    pub fn replace(&self, key: K, old_value: V, new_value: V) -> Result<bool> {
        let listener = Arc::new(SyncListener::new());
        self.async_replace_with_listener(key, old_value, new_value, listener.clone());
        listener.await_result()
    }

    pub fn remove(&self, key: K) -> Result<Option<V>> {
        let listener = Arc::new(SyncListener::new());
        self.async_remove_with_listener(key, listener.clone());
        listener.await_result()
    }

    /// Reserve the next append key and store `value` under it. Append is the
    /// only operation that advances `max_key`.
    pub fn append(&self, value: V) -> Result<K> {
        let listener = Arc::new(SyncListener::new());
        self.async_append_with_listener(value, listener.clone());
        listener.await_result()
    }

    pub fn async_put(
        &self,
        key: K,
        value: V,
        handler: impl FnOnce(AsyncResult<Option<V>>) + Send + 'static,
    ) {
        self.async_put_with_listener(key, value, Arc::new(CallbackListener::new(handler)));
    }

    pub fn async_put_if_absent(
        &self,
        key: K,
        value: V,
        handler: impl FnOnce(AsyncResult<Option<V>>) + Send + 'static,
    ) {
        self.async_put_if_absent_with_listener(key, value, Arc::new(CallbackListener::new(handler)));
    }

    pub fn async_replace(
        &self,
        key: K,
        old_value: V,
        new_value: V,
        handler: impl FnOnce(AsyncResult<bool>) + Send + 'static,
    ) {
        self.async_replace_with_listener(
            key,
            old_value,
            new_value,
            Arc::new(CallbackListener::new(handler)),
        );
    }

    pub fn async_remove(
        &self,
        key: K,
        handler: impl FnOnce(AsyncResult<Option<V>>) + Send + 'static,
    ) {
        self.async_remove_with_listener(key, Arc::new(CallbackListener::new(handler)));
    }

    pub fn async_append(&self, value: V, handler: impl FnOnce(AsyncResult<K>) + Send + 'static) {
        self.async_append_with_listener(value, Arc::new(CallbackListener::new(handler)));
    }

    fn async_put_with_listener(&self, key: K, value: V, listener: Arc<dyn ResultListener<Option<V>>>) {
        let apply = Box::new(move |current: Option<&V>| {
            ApplyOutcome::Put(value.clone(), current.cloned())
        });
        self.submit_single_write(key, apply, listener);
    }

    fn async_put_if_absent_with_listener(
        &self,
        key: K,
        value: V,
        listener: Arc<dyn ResultListener<Option<V>>>,
    ) {
        let apply = Box::new(move |current: Option<&V>| match current {
            Some(existing) => ApplyOutcome::Keep(Some(existing.clone())),
            None => ApplyOutcome::Put(value.clone(), None),
        });
        self.submit_single_write(key, apply, listener);
    }

    fn async_replace_with_listener(
        &self,
        key: K,
        old_value: V,
        new_value: V,
        listener: Arc<dyn ResultListener<bool>>,
    ) {
        let apply = Box::new(move |current: Option<&V>| match current {
            Some(existing) if *existing == old_value => {
                ApplyOutcome::Put(new_value.clone(), true)
            }
            _ => ApplyOutcome::Keep(false),
        });
        self.submit_single_write(key, apply, listener);
    }

    fn async_remove_with_listener(&self, key: K, listener: Arc<dyn ResultListener<Option<V>>>) {
        let apply = Box::new(move |current: Option<&V>| match current {
            Some(existing) => ApplyOutcome::Remove(Some(existing.clone())),
            None => ApplyOutcome::Keep(None),
        });
        self.submit_single_write(key, apply, listener);
    }

    fn async_append_with_listener(&self, value: V, listener: Arc<dyn ResultListener<K>>) {
        let index = self.inner.max_key.fetch_add(1, Ordering::AcqRel) + 1;
        let Some(key) = K::from_append_index(index) else {
            listener.on_result(AsyncResult::failed(SheafError::IllegalState(format!(
                "map {} key type does not support append",
                self.inner.name
            ))));
            return;
        };
        let result_key = key.clone();
        let apply = Box::new(move |_: Option<&V>| ApplyOutcome::Put(value.clone(), result_key.clone()));
        self.submit_single_write(key, apply, listener);
    }

    pub(crate) fn submit_single_write<R: Send + 'static>(
        &self,
        key: K,
        apply: Box<dyn FnMut(Option<&V>) -> ApplyOutcome<V, R> + Send>,
        listener: Arc<dyn ResultListener<R>>,
    ) {
        let target = match self.inner.find_leaf(&key) {
            Ok(leaf) => leaf,
            Err(e) => {
                listener.on_result(AsyncResult::failed(e));
                return;
            }
        };
        let owner = self.inner.ensure_owner(&target);
        let mut op = SingleWrite::new(self.inner.clone(), key, apply, listener);
        let factory = &self.inner.factory;

        if let Some(current) = factory.current_handler_id() {
            // Already on a handler thread: keep the work here unless the
            // leaf is owned elsewhere.
            if current == owner {
                self.run_to_completion(&mut op, current);
                return;
            }
            factory.submit_to(owner, Box::new(op));
            return;
        }

        // Hot path first: one inline attempt on the caller's thread; fall
        // back to the pool only on contention.
        match factory.try_run_inline(&mut op) {
            PageOperationResult::Succeeded | PageOperationResult::Locked => {}
            PageOperationResult::Shifted(new_owner) => {
                factory.submit_to(new_owner, Box::new(op));
            }
            PageOperationResult::Retry => {
                factory.submit_to(owner, Box::new(op));
            }
        }
    }

    fn run_to_completion<R: Send + 'static>(
        &self,
        op: &mut SingleWrite<K, V, R>,
        handler_id: usize,
    ) {
        use crate::pageop::HandlerContext;
        loop {
            match op.run(HandlerContext::on_handler(handler_id)) {
                PageOperationResult::Retry => std::thread::yield_now(),
                PageOperationResult::Shifted(owner) => {
                    // Re-run as the new owner would; the leaf latch still
                    // serialises the mutation.
                    match op.run(HandlerContext::on_handler(owner)) {
                        PageOperationResult::Retry => continue,
                        _ => return,
                    }
                }
                PageOperationResult::Succeeded | PageOperationResult::Locked => return,
            }
        }
    }

    // ---- whole-tree operations ------------------------------------------

    pub fn clear(&self) -> Result<()> {
        self.inner.check_writable()?;
        let _guard = self.inner.latch.write();
        let hosts = self.inner.root.page().replication_host_ids().to_vec();
        let mut leaf = LeafPage::empty();
        leaf.replication_host_ids = hosts;
        self.inner.root.publish(Page::Leaf(leaf));
        self.inner.size.store(0, Ordering::Release);
        self.inner.mark_dirty();
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.save_inner(false)
    }

    /// Write a chunk even when nothing is dirty; used to seal replica
    /// metadata.
    pub fn force_save(&self) -> Result<()> {
        self.save_inner(true)
    }

    fn save_inner(&self, force: bool) -> Result<()> {
        self.inner.check_open()?;
        let Some(store) = &self.inner.store else {
            return Ok(());
        };
        if !force && !self.inner.dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.inner.latch.write();
        let mut store = store.lock();
        store.save_tree(
            &self.inner.root,
            self.size(),
            self.inner.max_key.load(Ordering::Acquire),
            force,
        )?;
        self.inner.dirty.store(false, Ordering::Release);
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(store) = &self.inner.store {
            let _guard = self.inner.latch.write();
            let mut store = store.lock();
            if self.inner.dirty.swap(false, Ordering::AcqRel) {
                store.save_tree(
                    &self.inner.root,
                    self.size(),
                    self.inner.max_key.load(Ordering::Acquire),
                    false,
                )?;
            }
            store.close()?;
        }
        Ok(())
    }

    // ---- sharding support ------------------------------------------------

    /// Page keys of all local leaves in key order. The first entry carries
    /// the `first` flag.
    pub fn leaf_page_keys(&self) -> Result<Vec<PageKey<K>>> {
        self.inner.check_open()?;
        let mut out = Vec::new();
        let root = self.inner.root.page();
        Self::collect_leaf_page_keys(&root, &mut out)?;
        if let Some(first) = out.first_mut() {
            first.first = true;
        }
        Ok(out)
    }

    fn collect_leaf_page_keys(page: &Page<K, V>, out: &mut Vec<PageKey<K>>) -> Result<()> {
        match page {
            Page::Leaf(l) => {
                if let Some(key) = l.keys.first() {
                    out.push(PageKey::new(key.clone(), false));
                }
                Ok(())
            }
            Page::Remote(_) => Ok(()),
            Page::Node(node) => {
                for child in &node.children {
                    let child_page = child.page();
                    Self::collect_leaf_page_keys(&child_page, out)?;
                }
                Ok(())
            }
        }
    }

    /// Replica hosts of the leaf covering `key`.
    pub fn leaf_hosts(&self, key: &K) -> Result<Vec<String>> {
        let leaf = self.inner.find_leaf(key)?;
        Ok(leaf.page().replication_host_ids().to_vec())
    }

    /// Serialised image of the leaf a page key names.
    pub fn encode_leaf(&self, page_key: &PageKey<K>) -> Result<Vec<u8>> {
        self.inner.check_open()?;
        let leaf = self.inner.find_leaf_by_page_key(page_key);
        let page = leaf.page();
        if !page.is_leaf() {
            return Err(SheafError::Replication(format!(
                "page {:?} is not a local leaf",
                page_key.key
            )));
        }
        let mut buf = Vec::new();
        page.encode(&mut buf);
        Ok(buf)
    }

    /// Install a leaf image received from its mover. With `add_page` the
    /// entries become local; otherwise only the replica metadata is kept.
    pub fn install_leaf(&self, page_key: &PageKey<K>, image: &[u8], add_page: bool) -> Result<()> {
        self.inner.check_writable()?;
        let mut reader = ByteReader::new(image);
        let decoded = crate::btree::page::PageImage::<K, V>::decode(&mut reader)?;
        let crate::btree::page::PageImage::Leaf(incoming) = decoded else {
            return Err(SheafError::Replication("moved image is not a leaf".into()));
        };

        let _guard = self.inner.latch.write();
        let target = self.inner.find_leaf_by_page_key(page_key);
        let page = target.page();
        self.inner.mark_dirty();
        if !add_page {
            if let Page::Leaf(existing) = &*page {
                self.inner
                    .size
                    .fetch_sub(existing.keys.len() as u64, Ordering::AcqRel);
            }
            target.publish(Page::Remote(RemotePage {
                replication_host_ids: incoming.replication_host_ids,
            }));
            return Ok(());
        }
        match &*page {
            Page::Remote(_) => {
                self.inner
                    .size
                    .fetch_add(incoming.keys.len() as u64, Ordering::AcqRel);
                target.publish(Page::Leaf(incoming));
            }
            Page::Leaf(existing) => {
                // Union with local entries, the incoming image wins.
                let mut merged = existing.clone();
                for (key, value) in incoming.keys.into_iter().zip(incoming.values) {
                    match merged.keys.binary_search(&key) {
                        Ok(i) => merged.values[i] = value,
                        Err(i) => {
                            merged.keys.insert(i, key);
                            merged.values.insert(i, value);
                            self.inner.size_inc();
                        }
                    }
                }
                merged.replication_host_ids = incoming.replication_host_ids;
                target.publish(Page::Leaf(merged));
            }
            Page::Node(_) => {
                return Err(SheafError::IllegalState(
                    "page key resolved to a node page".into(),
                ))
            }
        }
        Ok(())
    }

    /// Drop the local copy of a moved leaf, leaving a Remote placeholder
    /// with the new replica set.
    pub fn replace_with_remote(&self, page_key: &PageKey<K>, hosts: Vec<String>) -> Result<()> {
        self.inner.check_writable()?;
        let _guard = self.inner.latch.write();
        let target = self.inner.find_leaf_by_page_key(page_key);
        let page = target.page();
        if let Page::Leaf(l) = &*page {
            self.inner
                .size
                .fetch_sub(l.keys.len() as u64, Ordering::AcqRel);
        }
        target.publish(Page::Remote(RemotePage {
            replication_host_ids: hosts,
        }));
        self.inner.mark_dirty();
        Ok(())
    }

    /// Update the replica host list of the leaf a page key names.
    pub fn set_leaf_hosts(&self, page_key: &PageKey<K>, hosts: Vec<String>) -> Result<()> {
        self.inner.check_writable()?;
        let _guard = self.inner.latch.write();
        let target = self.inner.find_leaf_by_page_key(page_key);
        let page = target.page();
        match &*page {
            Page::Leaf(l) => {
                let mut next = l.clone();
                next.replication_host_ids = hosts;
                target.publish(Page::Leaf(next));
            }
            Page::Remote(_) => {
                target.publish(Page::Remote(RemotePage {
                    replication_host_ids: hosts,
                }));
            }
            Page::Node(_) => {
                return Err(SheafError::IllegalState(
                    "page key resolved to a node page".into(),
                ))
            }
        }
        self.inner.mark_dirty();
        Ok(())
    }

    /// True when the leaf a page key names is a Remote placeholder here.
    pub fn is_remote_leaf(&self, page_key: &PageKey<K>) -> Result<bool> {
        self.inner.check_open()?;
        let target = self.inner.find_leaf_by_page_key(page_key);
        Ok(target.page().is_remote())
    }
}
