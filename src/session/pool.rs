use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::core::errors::SheafError;
use crate::core::Result;
use crate::session::{Session, SessionKind};
use crate::txn::TransactionListener;

const CREATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Creates sessions towards a remote URL. The creation is asynchronous so a
/// scheduler thread can keep draining its queues while the answer to its
/// own request travels back to it.
pub trait SessionFactory: Send + Sync {
    fn create_session_async(
        &self,
        url: &str,
        callback: Box<dyn FnOnce(Result<Arc<Session>>) + Send>,
    );
}

/// Per-URL cache of idle client sessions: a bounded FIFO each (default
/// capacity 3).
pub struct SessionPool {
    queues: RwLock<HashMap<String, Arc<ArrayQueue<Arc<Session>>>>>,
    capacity: usize,
    factory: Arc<dyn SessionFactory>,
}

impl SessionPool {
    pub fn new(capacity: usize, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            factory,
        }
    }

    fn queue_for(&self, url: &str) -> Arc<ArrayQueue<Arc<Session>>> {
        if let Some(queue) = self.queues.read().get(url) {
            return Arc::clone(queue);
        }
        let mut queues = self.queues.write();
        Arc::clone(
            queues
                .entry(url.to_string())
                .or_insert_with(|| Arc::new(ArrayQueue::new(self.capacity))),
        )
    }

    /// Poll the cache first; on a miss create asynchronously and block on
    /// the supplied cooperative listener, which may run other work while
    /// the answer is in flight.
    pub fn get_session_sync(
        &self,
        url: &str,
        listener: &Arc<dyn TransactionListener>,
    ) -> Result<Arc<Session>> {
        let queue = self.queue_for(url);
        while let Some(session) = queue.pop() {
            if !session.is_closed() {
                return Ok(session);
            }
        }

        let slot: Arc<Mutex<Option<Result<Arc<Session>>>>> = Arc::new(Mutex::new(None));
        let callback_slot = Arc::clone(&slot);
        let callback_listener = Arc::clone(listener);
        listener.before_operation();
        self.factory.create_session_async(
            url,
            Box::new(move |result| {
                *callback_slot.lock() = Some(result);
                callback_listener.operation_complete();
            }),
        );
        listener.await_completion(Some(CREATE_TIMEOUT))?;
        let result = slot.lock().take();
        result.unwrap_or_else(|| {
            Err(SheafError::IllegalState(format!(
                "session factory for {url} completed without a result"
            )))
        })
    }

    /// Return a client session to its queue; anything else, or a full
    /// queue, closes it instead.
    pub fn release(&self, session: Arc<Session>) {
        if session.is_closed() {
            return;
        }
        match session.kind() {
            SessionKind::Client { url } => {
                let queue = self.queue_for(url);
                if let Err(rejected) = queue.push(Arc::clone(&session)) {
                    debug!("session pool for {url} is full, closing session");
                    rejected.close();
                }
            }
            SessionKind::Local => {
                // Local sessions are never cached.
            }
            SessionKind::Server => session.close(),
        }
    }

    pub fn idle_count(&self, url: &str) -> usize {
        self.queues
            .read()
            .get(url)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    pub fn close_all(&self) {
        let queues = std::mem::take(&mut *self.queues.write());
        for (_, queue) in queues {
            while let Some(session) = queue.pop() {
                session.close();
            }
        }
    }
}
