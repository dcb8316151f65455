use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::core::errors::SheafError;
use crate::core::Result;

/// Cooperative blocker supplied by whatever drives the current thread.
///
/// A waiting caller pairs `before_operation` with `await_completion`; the
/// party completing the work calls `operation_complete` (or
/// `operation_undo` when it was rolled back, or `set_exception` on failure).
/// Scheduler-bound implementations run their inner queues while waiting
/// instead of parking the thread.
pub trait TransactionListener: Send + Sync {
    fn before_operation(&self);
    fn operation_complete(&self);
    fn operation_undo(&self);
    fn set_exception(&self, error: SheafError);
    fn await_completion(&self, timeout: Option<Duration>) -> Result<()>;
}

struct CounterState {
    pending: i64,
    error: Option<SheafError>,
}

/// Default listener: a counter and a condvar. The counter may go negative
/// when a completion lands before the matching `before_operation`; the await
/// only blocks while it is positive.
pub struct CountedListener {
    state: Mutex<CounterState>,
    cond: Condvar,
}

impl CountedListener {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CounterState {
                pending: 0,
                error: None,
            }),
            cond: Condvar::new(),
        }
    }
}

impl Default for CountedListener {
    fn default() -> Self {
        Self::new()
    }
}

impl CountedListener {
    /// One bounded wait step: `Ok(true)` when complete, `Ok(false)` on
    /// timeout, `Err` when an exception was delivered. Lets polling callers
    /// (the scheduler listener) interleave other work between steps.
    pub fn await_step(&self, step: Duration) -> Result<bool> {
        let mut state = self.state.lock();
        if let Some(error) = state.error.take() {
            return Err(error);
        }
        if state.pending <= 0 {
            return Ok(true);
        }
        self.cond.wait_for(&mut state, step);
        if let Some(error) = state.error.take() {
            return Err(error);
        }
        Ok(state.pending <= 0)
    }
}

impl TransactionListener for CountedListener {
    fn before_operation(&self) {
        self.state.lock().pending += 1;
    }

    fn operation_complete(&self) {
        let mut state = self.state.lock();
        state.pending -= 1;
        self.cond.notify_all();
    }

    fn operation_undo(&self) {
        let mut state = self.state.lock();
        state.pending -= 1;
        self.cond.notify_all();
    }

    fn set_exception(&self, error: SheafError) {
        let mut state = self.state.lock();
        if state.error.is_none() {
            state.error = Some(error);
        }
        self.cond.notify_all();
    }

    fn await_completion(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if let Some(error) = state.error.take() {
                return Err(error);
            }
            if state.pending <= 0 {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return Err(SheafError::LockTimeout(
                            "timed out awaiting operation completion".into(),
                        ));
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn completion_before_wait_does_not_block() {
        let listener = Arc::new(CountedListener::new());
        listener.operation_complete();
        listener.before_operation();
        listener
            .await_completion(Some(Duration::from_millis(100)))
            .unwrap();
    }

    #[test]
    fn exception_is_rethrown_from_await() {
        let listener = Arc::new(CountedListener::new());
        listener.before_operation();
        listener.set_exception(SheafError::Deadlock("t1 -> t2 -> t1".into()));
        let err = listener.await_completion(None).unwrap_err();
        assert!(matches!(err, SheafError::Deadlock(_)));
    }
}
