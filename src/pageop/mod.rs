pub mod handler;

use parking_lot::{Condvar, Mutex};

use crate::core::errors::SheafError;
use crate::core::Result;

pub use handler::{PageOperationHandler, PageOperationHandlerFactory, PeriodicTask};

/// Outcome of one execution attempt of a page operation.
///
/// `Shifted` carries the id of the handler that now owns the target leaf;
/// the executing handler forwards the operation there. `Retry` re-enqueues
/// on the same handler. `Locked` means a row-level conflict was found and a
/// waiter was registered; the listener fires once the lock owner resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOperationResult {
    Succeeded,
    Shifted(usize),
    Retry,
    Locked,
}

/// Execution context handed to an operation: the id of the handler running
/// it, or `None` when it runs inline on the caller's thread (dummy handler).
#[derive(Debug, Clone, Copy)]
pub struct HandlerContext {
    pub handler_id: Option<usize>,
}

impl HandlerContext {
    pub fn inline() -> Self {
        Self { handler_id: None }
    }

    pub fn on_handler(id: usize) -> Self {
        Self {
            handler_id: Some(id),
        }
    }
}

/// A unit of work queued on a page-operation handler. Single-key writes and
/// opaque runnables (leaf moves, replica reconfiguration) both implement it.
pub trait PageOperation: Send + 'static {
    fn run(&mut self, ctx: HandlerContext) -> PageOperationResult;
}

/// Opaque work executed once on a handler thread.
pub struct RunnableOperation {
    task: Option<Box<dyn FnOnce() + Send>>,
}

impl RunnableOperation {
    pub fn new(task: impl FnOnce() + Send + 'static) -> Self {
        Self {
            task: Some(Box::new(task)),
        }
    }
}

impl PageOperation for RunnableOperation {
    fn run(&mut self, _ctx: HandlerContext) -> PageOperationResult {
        if let Some(task) = self.task.take() {
            task();
        }
        PageOperationResult::Succeeded
    }
}

/// Result pair delivered to asynchronous callers.
#[derive(Debug)]
pub struct AsyncResult<T> {
    pub value: Option<T>,
    pub error: Option<SheafError>,
}

impl<T> AsyncResult<T> {
    pub fn succeeded(value: T) -> Self {
        Self {
            value: Some(value),
            error: None,
        }
    }

    pub fn failed(error: SheafError) -> Self {
        Self {
            value: None,
            error: Some(error),
        }
    }

    pub fn is_succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<T> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.value.expect("succeeded result carries a value")),
        }
    }
}

/// Receives the outcome of a single-key write exactly once.
pub trait ResultListener<T>: Send + Sync {
    fn on_result(&self, result: AsyncResult<T>);
}

/// Latch-based listener installed by the synchronous map API.
pub struct SyncListener<T> {
    slot: Mutex<Option<AsyncResult<T>>>,
    cond: Condvar,
}

impl<T> SyncListener<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    pub fn await_result(&self) -> Result<T> {
        let mut guard = self.slot.lock();
        while guard.is_none() {
            self.cond.wait(&mut guard);
        }
        guard.take().expect("listener fired").into_result()
    }
}

impl<T> Default for SyncListener<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> ResultListener<T> for SyncListener<T> {
    fn on_result(&self, result: AsyncResult<T>) {
        let mut guard = self.slot.lock();
        *guard = Some(result);
        self.cond.notify_all();
    }
}

/// Adapts a one-shot completion handler to the listener contract; used by
/// the asynchronous map API.
pub struct CallbackListener<T> {
    callback: Mutex<Option<Box<dyn FnOnce(AsyncResult<T>) + Send>>>,
}

impl<T> CallbackListener<T> {
    pub fn new(callback: impl FnOnce(AsyncResult<T>) + Send + 'static) -> Self {
        Self {
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }
}

impl<T: Send> ResultListener<T> for CallbackListener<T> {
    fn on_result(&self, result: AsyncResult<T>) {
        if let Some(callback) = self.callback.lock().take() {
            callback(result);
        }
    }
}
