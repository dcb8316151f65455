mod session_info;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use log::{debug, error};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::core::config::StoreConfig;
use crate::core::errors::SheafError;
use crate::core::stats::{record_stat, EngineStatKind};
use crate::core::Result;
use crate::pageop::{HandlerContext, PageOperation, PeriodicTask};
use crate::session::Session;
use crate::txn::TransactionListener;

pub use session_info::SessionInfo;

/// Strict cross-session ordering classes; intra-session tasks are FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    Max,
    Norm,
    Min,
}

/// Outcome of one cooperative step of a session command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStep {
    Suspend,
    Finished,
}

/// A multi-step statement bound to a session. The scheduler runs one step
/// at a time; between steps the command may be pre-empted by a
/// higher-priority arrival and re-queued at a promoted priority.
pub struct SessionCommand {
    pub priority: i32,
    step: Box<dyn FnMut(&mut YieldContext<'_>) -> CommandStep + Send>,
}

impl SessionCommand {
    pub fn new(
        priority: i32,
        step: impl FnMut(&mut YieldContext<'_>) -> CommandStep + Send + 'static,
    ) -> Self {
        Self {
            priority,
            step: Box::new(step),
        }
    }
}

/// Handed to a command step so it can ask whether to give up the thread.
pub struct YieldContext<'a> {
    shared: &'a SchedulerShared,
    current_priority: i32,
    yielded: bool,
}

impl YieldContext<'_> {
    /// True when a command with a strictly higher priority is ready; the
    /// caller should suspend. The yielding command's priority is bumped by
    /// one so it cannot be starved.
    pub fn yield_if_needed(&mut self) -> bool {
        if self.shared.has_ready_command_above(self.current_priority) {
            self.yielded = true;
            return true;
        }
        false
    }
}

/// A task admitted to the scheduler only once the validator accepts it.
pub struct SessionInitTask {
    pub session: Arc<Session>,
    pub task: Box<dyn FnOnce() + Send>,
}

pub(crate) struct SchedulerShared {
    id: usize,
    name: String,
    ended: AtomicBool,
    woken: Mutex<bool>,
    wake_cond: Condvar,
    session_init: SegQueue<SessionInitTask>,
    max_queue: SegQueue<Box<dyn FnOnce() + Send>>,
    norm_queue: SegQueue<Box<dyn FnOnce() + Send>>,
    min_queue: SegQueue<Box<dyn FnOnce() + Send>>,
    page_ops: SegQueue<Box<dyn PageOperation>>,
    sessions: Mutex<Vec<Arc<SessionInfo>>>,
    periodic: RwLock<Arc<Vec<Arc<dyn PeriodicTask>>>>,
    init_validator: RwLock<Option<Arc<dyn Fn(&SessionInitTask) -> bool + Send + Sync>>>,
    loop_interval: Duration,
}

impl SchedulerShared {
    fn wake(&self) {
        let mut woken = self.woken.lock();
        *woken = true;
        self.wake_cond.notify_all();
    }

    fn has_ready_command_above(&self, priority: i32) -> bool {
        let sessions = self.sessions.lock();
        sessions
            .iter()
            .filter_map(|info| info.peek_command_priority())
            .any(|p| p > priority)
    }

    /// Drain the three priority queues in order, then the page-operation
    /// queue. Returns the number of tasks run.
    pub(crate) fn run_ready_work(&self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.max_queue.pop() {
            task();
            ran += 1;
        }
        while let Some(task) = self.norm_queue.pop() {
            task();
            ran += 1;
        }
        while let Some(task) = self.min_queue.pop() {
            task();
            ran += 1;
        }
        while let Some(mut op) = self.page_ops.pop() {
            record_stat(EngineStatKind::PageOperation);
            match op.run(HandlerContext::inline()) {
                crate::pageop::PageOperationResult::Retry => {
                    record_stat(EngineStatKind::PageOperationRetry);
                    self.page_ops.push(op);
                    // Leave the rest for the next loop; spinning here would
                    // starve the sessions below.
                    break;
                }
                _ => ran += 1,
            }
        }
        ran
    }

    fn drain_session_init(&self) -> usize {
        let validator = self.init_validator.read().clone();
        let mut ran = 0;
        let mut requeue = Vec::new();
        while let Some(init) = self.session_init.pop() {
            let admit = validator.as_ref().map(|v| v(&init)).unwrap_or(true);
            if admit {
                (init.task)();
                ran += 1;
            } else {
                requeue.push(SessionInitTask {
                    session: init.session,
                    task: init.task,
                });
            }
        }
        for init in requeue {
            self.session_init.push(init);
        }
        ran
    }

    fn run_session_tasks(&self) -> usize {
        let sessions: Vec<Arc<SessionInfo>> = self.sessions.lock().clone();
        let mut ran = 0;
        for info in sessions {
            ran += info.run_pending_tasks();
        }
        ran
    }

    /// Pick the ready command with the highest priority across all
    /// sessions and run one step of it.
    fn execute_next_statement(&self) -> bool {
        let picked = {
            let sessions = self.sessions.lock();
            let mut best: Option<(Arc<SessionInfo>, i32)> = None;
            for info in sessions.iter() {
                if let Some(priority) = info.peek_command_priority() {
                    match &best {
                        Some((_, current)) if *current >= priority => {}
                        _ => best = Some((Arc::clone(info), priority)),
                    }
                }
            }
            best
        };
        let Some((info, _)) = picked else {
            return false;
        };
        let Some(mut command) = info.take_command() else {
            return false;
        };

        record_stat(EngineStatKind::Command);
        let mut ctx = YieldContext {
            shared: self,
            current_priority: command.priority,
            yielded: false,
        };
        let step = (command.step)(&mut ctx);
        match step {
            CommandStep::Finished => {}
            CommandStep::Suspend => {
                if ctx.yielded {
                    record_stat(EngineStatKind::CommandYield);
                    command.priority += 1;
                }
                info.put_back_command(command);
            }
        }
        true
    }

    fn check_session_timeouts(&self) {
        let sessions: Vec<Arc<SessionInfo>> = self.sessions.lock().clone();
        for info in sessions {
            info.session().check_timeout();
        }
    }

    fn run_periodic_tasks(&self) {
        let tasks = self.periodic.read().clone();
        for task in tasks.iter() {
            record_stat(EngineStatKind::PeriodicTask);
            task.run();
        }
    }

    fn do_await(&self) {
        let mut woken = self.woken.lock();
        if !*woken {
            self.wake_cond
                .wait_for(&mut woken, self.loop_interval);
        }
        *woken = false;
    }
}

/// A dedicated thread multiplexing session-init admission, prioritised
/// tasks, page operations, per-session tasks and statement execution; see
/// the loop in `scheduler_loop`.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn start(id: usize, config: &StoreConfig) -> Self {
        let shared = Arc::new(SchedulerShared {
            id,
            name: format!("scheduler-{id}"),
            ended: AtomicBool::new(false),
            woken: Mutex::new(false),
            wake_cond: Condvar::new(),
            session_init: SegQueue::new(),
            max_queue: SegQueue::new(),
            norm_queue: SegQueue::new(),
            min_queue: SegQueue::new(),
            page_ops: SegQueue::new(),
            sessions: Mutex::new(Vec::new()),
            periodic: RwLock::new(Arc::new(Vec::new())),
            init_validator: RwLock::new(None),
            loop_interval: config.scheduler_loop_interval(),
        });
        let loop_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(shared.name.clone())
            .spawn(move || scheduler_loop(loop_shared))
            .expect("spawn scheduler");
        Self {
            shared,
            thread: Arc::new(Mutex::new(Some(handle))),
        }
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn submit_task(&self, priority: TaskPriority, task: impl FnOnce() + Send + 'static) {
        let task: Box<dyn FnOnce() + Send> = Box::new(task);
        match priority {
            TaskPriority::Max => self.shared.max_queue.push(task),
            TaskPriority::Norm => self.shared.norm_queue.push(task),
            TaskPriority::Min => self.shared.min_queue.push(task),
        }
        self.shared.wake();
    }

    pub fn submit_page_op(&self, op: Box<dyn PageOperation>) {
        self.shared.page_ops.push(op);
        self.shared.wake();
    }

    pub fn submit_session_init(&self, init: SessionInitTask) {
        self.shared.session_init.push(init);
        self.shared.wake();
    }

    pub fn set_init_validator(
        &self,
        validator: Arc<dyn Fn(&SessionInitTask) -> bool + Send + Sync>,
    ) {
        *self.shared.init_validator.write() = Some(validator);
    }

    pub fn add_periodic_task(&self, task: Arc<dyn PeriodicTask>) {
        let mut guard = self.shared.periodic.write();
        let mut tasks = (**guard).clone();
        tasks.push(task);
        *guard = Arc::new(tasks);
    }

    pub fn register_session(&self, session: Arc<Session>) -> Arc<SessionInfo> {
        let info = Arc::new(SessionInfo::new(session));
        self.shared.sessions.lock().push(Arc::clone(&info));
        self.shared.wake();
        info
    }

    /// Revokes the session's pending tasks and commands.
    pub fn remove_session(&self, session_id: u64) {
        self.shared
            .sessions
            .lock()
            .retain(|info| info.session().id() != session_id);
    }

    pub fn submit_session_task(
        &self,
        session_id: u64,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let sessions = self.shared.sessions.lock();
        let info = sessions
            .iter()
            .find(|info| info.session().id() == session_id)
            .ok_or_else(|| {
                SheafError::IllegalState(format!("session {session_id} is not scheduled here"))
            })?;
        info.push_task(Box::new(task));
        drop(sessions);
        self.shared.wake();
        Ok(())
    }

    pub fn submit_command(&self, session_id: u64, command: SessionCommand) -> Result<()> {
        let sessions = self.shared.sessions.lock();
        let info = sessions
            .iter()
            .find(|info| info.session().id() == session_id)
            .ok_or_else(|| {
                SheafError::IllegalState(format!("session {session_id} is not scheduled here"))
            })?;
        info.push_command(command);
        drop(sessions);
        self.shared.wake();
        Ok(())
    }

    /// A cooperative blocker that keeps this scheduler's queues moving
    /// while the caller waits; used to avoid self-deadlock when a session's
    /// creation answer would arrive on this very thread.
    pub fn listener(&self) -> Arc<SchedulerListener> {
        Arc::new(SchedulerListener {
            shared: Arc::clone(&self.shared),
            inner: crate::txn::CountedListener::new(),
        })
    }

    pub fn is_ended(&self) -> bool {
        self.shared.ended.load(Ordering::Acquire)
    }

    /// Idempotent; unblocks the loop and lets the thread drain out.
    pub fn end(&self) {
        if self.shared.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.wake();
    }

    pub fn join(&self) {
        self.end();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn scheduler_loop(shared: Arc<SchedulerShared>) {
    debug!("{} started", shared.name);
    while !shared.ended.load(Ordering::Acquire) {
        record_stat(EngineStatKind::SchedulerLoop);
        let mut ran = 0;
        ran += shared.drain_session_init();
        ran += shared.run_ready_work();
        ran += shared.run_session_tasks();
        if shared.execute_next_statement() {
            ran += 1;
        }
        shared.check_session_timeouts();
        if ran == 0 {
            shared.run_periodic_tasks();
            shared.do_await();
        }
    }
    // Drain what is left so a cooperative end never strands a task.
    shared.run_ready_work();
    debug!("{} ended", shared.name);
}

/// Listener that services the scheduler's queues instead of parking, so a
/// wait on this thread cannot deadlock against work only this thread can
/// run.
pub struct SchedulerListener {
    shared: Arc<SchedulerShared>,
    inner: crate::txn::CountedListener,
}

impl TransactionListener for SchedulerListener {
    fn before_operation(&self) {
        self.inner.before_operation();
    }

    fn operation_complete(&self) {
        self.inner.operation_complete();
        self.shared.wake();
    }

    fn operation_undo(&self) {
        self.inner.operation_undo();
        self.shared.wake();
    }

    fn set_exception(&self, error: SheafError) {
        self.inner.set_exception(error);
        self.shared.wake();
    }

    fn await_completion(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.inner.await_step(Duration::from_millis(1))? {
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(SheafError::LockTimeout(
                        "timed out awaiting operation completion".into(),
                    ));
                }
            }
            self.shared.run_ready_work();
        }
    }
}

/// Round-robin pool of schedulers, one per thread.
pub struct SchedulerPool {
    schedulers: Vec<Scheduler>,
    next: AtomicUsize,
}

impl SchedulerPool {
    pub fn start(count: usize, config: &StoreConfig) -> Self {
        let count = count.max(1);
        let schedulers = (0..count).map(|id| Scheduler::start(id, config)).collect();
        Self {
            schedulers,
            next: AtomicUsize::new(0),
        }
    }

    pub fn pick(&self) -> &Scheduler {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.schedulers.len();
        &self.schedulers[index]
    }

    pub fn schedulers(&self) -> &[Scheduler] {
        &self.schedulers
    }

    pub fn end_all(&self) {
        for scheduler in &self.schedulers {
            scheduler.end();
        }
        for scheduler in &self.schedulers {
            scheduler.join();
        }
    }
}

impl Drop for SchedulerPool {
    fn drop(&mut self) {
        for scheduler in &self.schedulers {
            if !scheduler.is_ended() {
                error!("scheduler pool dropped while {} still running", scheduler.name());
                scheduler.end();
            }
        }
    }
}
