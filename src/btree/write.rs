use std::sync::Arc;

use crate::btree::map::MapInner;
use crate::btree::page::{Page, PageRef};
use crate::btree::types::{KeyType, RecordType};
use crate::core::errors::SheafError;
use crate::pageop::{
    AsyncResult, HandlerContext, PageOperation, PageOperationResult, ResultListener,
};

/// What a single-key write decided to do with the current cell, plus the
/// result handed to its listener.
pub(crate) enum ApplyOutcome<V, R> {
    Put(V, R),
    Remove(R),
    Keep(R),
    Locked,
    Fail(SheafError),
}

/// The one shape all single-key writes share: descend to the owning leaf,
/// latch it, let the closure inspect the current cell and decide. Put,
/// PutIfAbsent, Replace, Remove and Append are all closures over this.
///
/// Re-execution safety: the closure runs only while the leaf latch is held
/// and is re-invoked from scratch on RETRY, so it must not capture partial
/// progress.
pub(crate) struct SingleWrite<K: KeyType, V: RecordType, R: Send + 'static> {
    map: Arc<MapInner<K, V>>,
    key: K,
    apply: Box<dyn FnMut(Option<&V>) -> ApplyOutcome<V, R> + Send>,
    listener: Arc<dyn ResultListener<R>>,
}

impl<K: KeyType, V: RecordType, R: Send + 'static> SingleWrite<K, V, R> {
    pub(crate) fn new(
        map: Arc<MapInner<K, V>>,
        key: K,
        apply: Box<dyn FnMut(Option<&V>) -> ApplyOutcome<V, R> + Send>,
        listener: Arc<dyn ResultListener<R>>,
    ) -> Self {
        Self {
            map,
            key,
            apply,
            listener,
        }
    }
}

impl<K: KeyType, V: RecordType, R: Send + 'static> PageOperation for SingleWrite<K, V, R> {
    fn run(&mut self, ctx: HandlerContext) -> PageOperationResult {
        if let Err(e) = self.map.check_writable() {
            self.listener.on_result(AsyncResult::failed(e));
            return PageOperationResult::Succeeded;
        }

        let leaf = match self.map.find_leaf(&self.key) {
            Ok(leaf) => leaf,
            Err(e) => {
                self.listener.on_result(AsyncResult::failed(e));
                return PageOperationResult::Succeeded;
            }
        };

        // A queued operation belongs to the leaf's owner; if a split moved
        // the key to a leaf owned elsewhere, hand the operation over.
        let owner = self.map.ensure_owner(&leaf);
        if let Some(current) = ctx.handler_id {
            if owner != current {
                return PageOperationResult::Shifted(owner);
            }
        }

        if !leaf.try_latch() {
            return PageOperationResult::Retry;
        }

        // The leaf may have been replaced between descent and latch.
        match self.map.find_leaf(&self.key) {
            Ok(current) if current.same_slot(&leaf) => {}
            _ => {
                leaf.unlatch();
                return PageOperationResult::Retry;
            }
        }

        let result = self.apply_latched(&leaf);
        leaf.unlatch();

        match result {
            LatchedOutcome::Done(split_key) => {
                if let Some(split_key) = split_key {
                    self.map.fire_leaf_page_split(split_key);
                }
                PageOperationResult::Succeeded
            }
            LatchedOutcome::Locked => PageOperationResult::Locked,
        }
    }
}

enum LatchedOutcome<K> {
    Done(Option<K>),
    Locked,
}

impl<K: KeyType, V: RecordType, R: Send + 'static> SingleWrite<K, V, R> {
    fn apply_latched(&mut self, leaf: &PageRef<K, V>) -> LatchedOutcome<K> {
        // Shared tree latch: value swaps may run concurrently with each
        // other but not with clear/close/save.
        let guard = self.map.latch.read();

        let page = leaf.page();
        let leaf_page = match &*page {
            Page::Leaf(l) => l,
            Page::Remote(_) => {
                drop(guard);
                self.listener.on_result(AsyncResult::failed(SheafError::Replication(format!(
                    "leaf page for key {:?} is remote",
                    self.key
                ))));
                return LatchedOutcome::Done(None);
            }
            Page::Node(_) => {
                drop(guard);
                self.listener.on_result(AsyncResult::failed(SheafError::IllegalState(
                    "descended to a node page".into(),
                )));
                return LatchedOutcome::Done(None);
            }
        };

        let slot = leaf_page.search(&self.key);
        let current = slot.ok().map(|i| &leaf_page.values[i]);

        match (self.apply)(current) {
            ApplyOutcome::Keep(result) => {
                drop(guard);
                self.listener.on_result(AsyncResult::succeeded(result));
                LatchedOutcome::Done(None)
            }
            ApplyOutcome::Locked => LatchedOutcome::Locked,
            ApplyOutcome::Fail(e) => {
                drop(guard);
                self.listener.on_result(AsyncResult::failed(e));
                LatchedOutcome::Done(None)
            }
            ApplyOutcome::Put(value, result) => {
                let mut next = leaf_page.clone();
                match slot {
                    Ok(i) => next.values[i] = value,
                    Err(i) => {
                        next.keys.insert(i, self.key.clone());
                        next.values.insert(i, value);
                        self.map.size_inc();
                    }
                }
                let needs_split = next.keys.len() > self.map.config.page_split_size;
                leaf.publish(Page::Leaf(next));
                self.map.mark_dirty();
                drop(guard);
                self.listener.on_result(AsyncResult::succeeded(result));
                let split_key = if needs_split {
                    self.map.split_leaf(leaf)
                } else {
                    None
                };
                LatchedOutcome::Done(split_key)
            }
            ApplyOutcome::Remove(result) => {
                if let Ok(i) = slot {
                    let mut next = leaf_page.clone();
                    next.keys.remove(i);
                    next.values.remove(i);
                    leaf.publish(Page::Leaf(next));
                    self.map.size_dec();
                    self.map.mark_dirty();
                }
                drop(guard);
                self.listener.on_result(AsyncResult::succeeded(result));
                LatchedOutcome::Done(None)
            }
        }
    }
}
