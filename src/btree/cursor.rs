use std::sync::Arc;

use crate::btree::map::MapInner;
use crate::btree::page::{Page, PageKey};
use crate::btree::types::{KeyType, RecordType};
use crate::core::errors::SheafError;

struct CursorFrame<K: KeyType, V: RecordType> {
    node: Arc<Page<K, V>>,
    next_child: usize,
}

/// Lazy, single-pass, forward iterator over `[from, to]` in key order.
///
/// Leaves carry no sibling pointers, so advancing to the next leaf climbs a
/// parent stack and descends leftmost again. Frames hold the page images
/// loaded at visit time: a concurrent copy-on-write mutation never changes a
/// page this cursor already loaded.
pub struct BTreeCursor<K: KeyType, V: RecordType> {
    map: Arc<MapInner<K, V>>,
    to: Option<K>,
    from: Option<K>,
    stack: Vec<CursorFrame<K, V>>,
    leaf: Option<Arc<Page<K, V>>>,
    slot: usize,
    page_keys: Option<std::vec::IntoIter<PageKey<K>>>,
    done: bool,
}

impl<K: KeyType, V: RecordType> BTreeCursor<K, V> {
    pub(crate) fn new(
        map: Arc<MapInner<K, V>>,
        from: Option<K>,
        to: Option<K>,
        page_keys: Option<Vec<PageKey<K>>>,
    ) -> Self {
        let mut cursor = Self {
            map,
            to,
            from,
            stack: Vec::new(),
            leaf: None,
            slot: 0,
            page_keys: page_keys.map(Vec::into_iter),
            done: false,
        };
        if cursor.page_keys.is_some() {
            cursor.advance_page_key_leaf();
        } else {
            cursor.seek();
        }
        cursor
    }

    fn seek(&mut self) {
        let mut current = self.map.root.clone();
        loop {
            let page = current.page();
            match &*page {
                Page::Node(node) => {
                    let index = match &self.from {
                        Some(from) => node.page_index(from),
                        None => 0,
                    };
                    current = node.children[index].clone();
                    self.stack.push(CursorFrame {
                        node: page.clone(),
                        next_child: index + 1,
                    });
                }
                Page::Leaf(leaf) => {
                    self.slot = match &self.from {
                        Some(from) => match leaf.keys.binary_search(from) {
                            Ok(i) | Err(i) => i,
                        },
                        None => 0,
                    };
                    self.leaf = Some(page);
                    return;
                }
                Page::Remote(_) => {
                    // Not local; continue with the next local leaf.
                    self.leaf = None;
                    if !self.climb() {
                        self.done = true;
                    }
                    return;
                }
            }
        }
    }

    /// Climb until a frame has an unvisited child, then descend leftmost to
    /// the next local leaf. Returns false when the tree is exhausted.
    fn climb(&mut self) -> bool {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return false;
            };
            let Page::Node(node) = &*frame.node else {
                self.stack.pop();
                continue;
            };
            if frame.next_child >= node.children.len() {
                self.stack.pop();
                continue;
            }
            let child = node.children[frame.next_child].clone();
            frame.next_child += 1;
            if self.descend_leftmost(child) {
                return true;
            }
        }
    }

    fn descend_leftmost(&mut self, start: crate::btree::page::PageRef<K, V>) -> bool {
        let mut current = start;
        loop {
            let page = current.page();
            match &*page {
                Page::Node(node) => {
                    if node.children.is_empty() {
                        return false;
                    }
                    current = node.children[0].clone();
                    self.stack.push(CursorFrame {
                        node: page.clone(),
                        next_child: 1,
                    });
                }
                Page::Leaf(_) => {
                    self.slot = 0;
                    self.leaf = Some(page);
                    return true;
                }
                Page::Remote(_) => return false,
            }
        }
    }

    fn advance_page_key_leaf(&mut self) {
        loop {
            let Some(iter) = self.page_keys.as_mut() else {
                self.done = true;
                return;
            };
            let Some(page_key) = iter.next() else {
                self.done = true;
                return;
            };
            let leaf_ref = self.map.find_leaf_by_page_key(&page_key);
            let page = leaf_ref.page();
            if let Page::Leaf(leaf) = &*page {
                self.slot = match &self.from {
                    Some(from) => match leaf.keys.binary_search(from) {
                        Ok(i) | Err(i) => i,
                    },
                    None => 0,
                };
                self.leaf = Some(page);
                return;
            }
        }
    }

    fn next_entry(&mut self) -> Option<(K, V)> {
        loop {
            if self.done {
                return None;
            }
            let Some(page) = self.leaf.as_ref() else {
                self.done = true;
                return None;
            };
            let Page::Leaf(leaf) = &**page else {
                self.done = true;
                return None;
            };
            if self.slot < leaf.keys.len() {
                let key = leaf.keys[self.slot].clone();
                if let Some(to) = &self.to {
                    if key > *to {
                        self.done = true;
                        return None;
                    }
                }
                let value = leaf.values[self.slot].clone();
                self.slot += 1;
                return Some((key, value));
            }

            self.leaf = None;
            if self.page_keys.is_some() {
                self.advance_page_key_leaf();
            } else if !self.climb() {
                self.done = true;
            }
        }
    }
}

impl<K: KeyType, V: RecordType> Iterator for BTreeCursor<K, V> {
    type Item = Result<(K, V), SheafError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().map(Ok)
    }
}
