use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::core::stats::{record_stat, EngineStatKind};
use crate::pageop::{HandlerContext, PageOperation, PageOperationResult};

const NO_HANDLER: usize = usize::MAX;

thread_local! {
    static CURRENT_HANDLER: Cell<usize> = const { Cell::new(NO_HANDLER) };
}

enum HandlerMessage {
    Op(Box<dyn PageOperation>),
    Stop,
}

/// Cheap periodic work (chunk compaction probes, cache sweeps) run from the
/// idle path of a handler, never from inside an operation.
pub trait PeriodicTask: Send + Sync {
    fn run(&self);
}

struct HandlerShared {
    id: usize,
    name: String,
    sender: Sender<HandlerMessage>,
    queued: AtomicU64,
}

/// A dedicated thread with an MPSC FIFO of page operations. All writes to a
/// given leaf are funnelled through one handler, which serialises them.
#[derive(Clone)]
pub struct PageOperationHandler {
    shared: Arc<HandlerShared>,
}

impl PageOperationHandler {
    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn load(&self) -> u64 {
        self.shared.queued.load(Ordering::Relaxed)
    }

    pub fn submit(&self, op: Box<dyn PageOperation>) {
        self.shared.queued.fetch_add(1, Ordering::Relaxed);
        if self.shared.sender.send(HandlerMessage::Op(op)).is_err() {
            warn!("handler {} is stopped, dropping operation", self.shared.name);
        }
    }
}

struct FactoryShared {
    handlers: Vec<PageOperationHandler>,
    periodic: RwLock<Arc<Vec<Arc<dyn PeriodicTask>>>>,
    stopped: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Owns the handler pool. Handler selection is context-sensitive: a handler
/// thread keeps its own work, other threads first try an inline (dummy) run
/// and fall back to a pool handler picked by leaf affinity.
#[derive(Clone)]
pub struct PageOperationHandlerFactory {
    shared: Arc<FactoryShared>,
}

impl PageOperationHandlerFactory {
    pub fn start(handler_count: usize, loop_interval: Duration) -> Self {
        let count = handler_count.max(1);
        let mut handlers = Vec::with_capacity(count);
        let mut receivers: Vec<(usize, Receiver<HandlerMessage>)> = Vec::with_capacity(count);
        for id in 0..count {
            let (sender, receiver) = unbounded();
            handlers.push(PageOperationHandler {
                shared: Arc::new(HandlerShared {
                    id,
                    name: format!("page-operation-handler-{id}"),
                    sender,
                    queued: AtomicU64::new(0),
                }),
            });
            receivers.push((id, receiver));
        }

        let factory = Self {
            shared: Arc::new(FactoryShared {
                handlers,
                periodic: RwLock::new(Arc::new(Vec::new())),
                stopped: AtomicBool::new(false),
                threads: Mutex::new(Vec::new()),
            }),
        };

        let mut threads = Vec::with_capacity(count);
        for (id, receiver) in receivers {
            let factory = factory.clone();
            let name = factory.shared.handlers[id].shared.name.clone();
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || factory.handler_loop(id, receiver, loop_interval))
                .expect("spawn page operation handler");
            threads.push(handle);
        }
        *factory.shared.threads.lock() = threads;
        factory
    }

    fn handler_loop(
        &self,
        id: usize,
        receiver: Receiver<HandlerMessage>,
        loop_interval: Duration,
    ) {
        CURRENT_HANDLER.with(|current| current.set(id));
        let handler = &self.shared.handlers[id];
        loop {
            match receiver.recv_timeout(loop_interval) {
                Ok(HandlerMessage::Op(op)) => {
                    handler.shared.queued.fetch_sub(1, Ordering::Relaxed);
                    self.run_on_handler(id, op);
                }
                Ok(HandlerMessage::Stop) => break,
                Err(RecvTimeoutError::Timeout) => self.run_periodic_tasks(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        CURRENT_HANDLER.with(|current| current.set(NO_HANDLER));
        debug!("handler {id} stopped");
    }

    fn run_on_handler(&self, id: usize, mut op: Box<dyn PageOperation>) {
        record_stat(EngineStatKind::PageOperation);
        match op.run(HandlerContext::on_handler(id)) {
            PageOperationResult::Succeeded | PageOperationResult::Locked => {}
            PageOperationResult::Retry => {
                record_stat(EngineStatKind::PageOperationRetry);
                self.shared.handlers[id].submit(op);
            }
            PageOperationResult::Shifted(owner) => {
                record_stat(EngineStatKind::PageOperationRetry);
                self.submit_to(owner, op);
            }
        }
    }

    fn run_periodic_tasks(&self) {
        let tasks = self.shared.periodic.read().clone();
        for task in tasks.iter() {
            record_stat(EngineStatKind::PeriodicTask);
            task.run();
        }
    }

    /// Copy-on-write append so running handlers never block on the list.
    pub fn add_periodic_task(&self, task: Arc<dyn PeriodicTask>) {
        let mut guard = self.shared.periodic.write();
        let mut tasks = (**guard).clone();
        tasks.push(task);
        *guard = Arc::new(tasks);
    }

    pub fn handler_count(&self) -> usize {
        self.shared.handlers.len()
    }

    pub fn handler(&self, id: usize) -> &PageOperationHandler {
        &self.shared.handlers[id]
    }

    /// The id of the handler running the current thread, if any.
    pub fn current_handler_id(&self) -> Option<usize> {
        let id = CURRENT_HANDLER.with(|current| current.get());
        (id != NO_HANDLER).then_some(id)
    }

    /// Pool handler by affinity to the target leaf's slot identity.
    pub fn affinity_owner(&self, slot_id: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        slot_id.hash(&mut hasher);
        (hasher.finish() % self.shared.handlers.len() as u64) as usize
    }

    pub fn submit_to(&self, id: usize, op: Box<dyn PageOperation>) {
        let id = id % self.shared.handlers.len();
        self.shared.handlers[id].submit(op);
    }

    /// Run one attempt inline on the caller's thread (the dummy handler).
    pub fn try_run_inline(&self, op: &mut dyn PageOperation) -> PageOperationResult {
        record_stat(EngineStatKind::PageOperation);
        op.run(HandlerContext::inline())
    }

    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for handler in &self.shared.handlers {
            let _ = handler.shared.sender.send(HandlerMessage::Stop);
        }
        let threads = std::mem::take(&mut *self.shared.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
    }
}
