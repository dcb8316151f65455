use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crossbeam::queue::SegQueue;
use parking_lot::Mutex;

use crate::scheduler::SessionCommand;
use crate::session::Session;

/// Scheduler-local state of one session: its pending tasks, queued
/// commands and activity timestamp. Tasks and commands observe FIFO order
/// within the session.
pub struct SessionInfo {
    session: Arc<Session>,
    tasks: SegQueue<Box<dyn FnOnce() + Send>>,
    commands: Mutex<VecDeque<SessionCommand>>,
    last_active: Mutex<Instant>,
}

impl SessionInfo {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            tasks: SegQueue::new(),
            commands: Mutex::new(VecDeque::new()),
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub(crate) fn push_task(&self, task: Box<dyn FnOnce() + Send>) {
        self.tasks.push(task);
    }

    pub(crate) fn run_pending_tasks(&self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.tasks.pop() {
            task();
            ran += 1;
        }
        if ran > 0 {
            *self.last_active.lock() = Instant::now();
        }
        ran
    }

    pub(crate) fn push_command(&self, command: SessionCommand) {
        self.commands.lock().push_back(command);
    }

    /// Highest priority among this session's queued commands.
    pub(crate) fn peek_command_priority(&self) -> Option<i32> {
        self.commands.lock().iter().map(|c| c.priority).max()
    }

    /// Take the highest-priority queued command; FIFO among equals.
    pub(crate) fn take_command(&self) -> Option<SessionCommand> {
        let mut commands = self.commands.lock();
        let best = commands
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.priority.cmp(&b.priority).then(ib.cmp(ia)))?
            .0;
        commands.remove(best)
    }

    /// Re-queue a suspended command; its (possibly promoted) priority
    /// decides when it runs again.
    pub(crate) fn put_back_command(&self, command: SessionCommand) {
        self.commands.lock().push_back(command);
    }

    pub fn idle_since(&self) -> Instant {
        *self.last_active.lock()
    }
}
