//! Lifecycle-gated worker pool.
//!
//! [`TaskEngine::submit`] never rejects work: tasks submitted while the
//! engine is stopped stay queued (PENDING) until the next [`TaskEngine::start`].
//! Every task reports through an [`AsyncResult`] that resolves exactly once.

use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce(JobMode) + Send + 'static>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum JobMode {
    Run,
    Cancel,
}

static NEXT_ENGINE_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Id of the engine owning the current worker thread, 0 elsewhere.
    static CURRENT_ENGINE: Cell<usize> = const { Cell::new(0) };
}

/// Why a task did not produce a value.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("task failed: {cause}")]
    Failed {
        #[source]
        cause: Arc<dyn StdError + Send + Sync>,
    },
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("task was cancelled before it started")]
    Cancelled,
    #[error("timed out waiting for task result")]
    Timeout,
}

impl TaskError {
    pub fn failed(cause: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Failed {
            cause: Arc::from(cause.into()),
        }
    }
}

/// Observable state of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

struct Slot<T> {
    state: TaskState,
    outcome: Option<Result<T, TaskError>>,
}

struct ResultShared<T> {
    slot: Mutex<Slot<T>>,
    resolved: Condvar,
}

/// Shared, single-resolution handle to a task outcome.
///
/// Clones observe the same task. Only the engine (or [`cancel`](Self::cancel)
/// on a task that has not started) resolves it.
pub struct AsyncResult<T> {
    shared: Arc<ResultShared<T>>,
}

impl<T> Clone for AsyncResult<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for AsyncResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResult")
            .field("state", &self.state())
            .finish()
    }
}

impl<T> AsyncResult<T> {
    pub(crate) fn pending() -> Self {
        Self {
            shared: Arc::new(ResultShared {
                slot: Mutex::new(Slot {
                    state: TaskState::Pending,
                    outcome: None,
                }),
                resolved: Condvar::new(),
            }),
        }
    }

    /// A result that is already resolved, for operations that complete without a task.
    pub fn ready(outcome: Result<T, TaskError>) -> Self {
        let result = Self::pending();
        result.resolve(outcome);
        result
    }

    pub fn state(&self) -> TaskState {
        self.shared.slot.lock().state
    }

    /// True while the task body is executing.
    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    /// True once the task body has finished, successfully or not.
    pub fn is_complete(&self) -> bool {
        matches!(self.state(), TaskState::Succeeded | TaskState::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.state() == TaskState::Succeeded
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    /// Cancel a task that has not started. Returns false if it is already
    /// running or resolved; running tasks are never interrupted.
    pub fn cancel(&self) -> bool {
        let mut slot = self.shared.slot.lock();
        if slot.state != TaskState::Pending {
            return false;
        }
        slot.state = TaskState::Cancelled;
        slot.outcome = Some(Err(TaskError::Cancelled));
        drop(slot);
        self.shared.resolved.notify_all();
        true
    }

    /// Move PENDING to RUNNING. False if the task was cancelled meanwhile.
    pub(crate) fn begin(&self) -> bool {
        let mut slot = self.shared.slot.lock();
        if slot.state != TaskState::Pending {
            return false;
        }
        slot.state = TaskState::Running;
        true
    }

    pub(crate) fn resolve(&self, outcome: Result<T, TaskError>) {
        let mut slot = self.shared.slot.lock();
        if slot.state.is_terminal() {
            return;
        }
        slot.state = match &outcome {
            Ok(_) => TaskState::Succeeded,
            Err(TaskError::Cancelled) => TaskState::Cancelled,
            Err(_) => TaskState::Failed,
        };
        slot.outcome = Some(outcome);
        drop(slot);
        self.shared.resolved.notify_all();
    }
}

impl<T: Clone> AsyncResult<T> {
    /// Non-blocking peek at the outcome.
    pub fn resolved(&self) -> Option<Result<T, TaskError>> {
        self.shared.slot.lock().outcome.clone()
    }

    /// Block until the task resolves.
    pub fn wait(&self) -> Result<T, TaskError> {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(outcome) = &slot.outcome {
                return outcome.clone();
            }
            self.shared.resolved.wait(&mut slot);
        }
    }

    /// Block until the task resolves or `timeout` elapses. Timing out does
    /// not affect the task itself.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, TaskError> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(outcome) = &slot.outcome {
                return outcome.clone();
            }
            if self
                .shared
                .resolved
                .wait_until(&mut slot, deadline)
                .timed_out()
            {
                return slot.outcome.clone().unwrap_or(Err(TaskError::Timeout));
            }
        }
    }
}

struct Queue {
    jobs: VecDeque<Job>,
    running: bool,
    terminated: bool,
    active: usize,
}

struct Inner {
    id: usize,
    queue: Mutex<Queue>,
    work: Condvar,
    idle: Condvar,
}

/// Managed pool of worker threads.
pub struct TaskEngine {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl TaskEngine {
    /// Spawn `workers` threads (at least one). The engine starts out stopped.
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let size = workers.max(1);
        let inner = Arc::new(Inner {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                running: false,
                terminated: false,
                active: 0,
            }),
            work: Condvar::new(),
            idle: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(size);
        for n in 0..size {
            let worker = Arc::clone(&inner);
            let spawned = thread::Builder::new()
                .name(format!("hearth-worker-{n}"))
                .spawn(move || worker_loop(&worker));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    let engine = Self {
                        inner,
                        workers: Mutex::new(handles),
                        size,
                    };
                    engine.shutdown();
                    return Err(e);
                }
            }
        }
        debug!(workers = size, "task engine created");

        Ok(Self {
            inner,
            workers: Mutex::new(handles),
            size,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.size
    }

    /// Allow workers to dequeue. Idempotent.
    pub fn start(&self) {
        let mut q = self.inner.queue.lock();
        if q.terminated || q.running {
            return;
        }
        q.running = true;
        let queued = q.jobs.len();
        drop(q);
        self.inner.work.notify_all();
        debug!(queued, "task engine started");
    }

    /// Stop dequeuing and wait for in-flight tasks to finish. Queued tasks
    /// stay pending until the next [`start`](Self::start).
    ///
    /// Called from one of this engine's own workers, the calling task is
    /// not waited for.
    pub fn stop(&self) {
        let own = usize::from(self.is_own_worker());
        let mut q = self.inner.queue.lock();
        if q.running {
            q.running = false;
            debug!(pending = q.jobs.len(), "task engine stopping");
        }
        while q.active > own {
            self.inner.idle.wait(&mut q);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.queue.lock().running
    }

    pub fn pending_count(&self) -> usize {
        self.inner.queue.lock().jobs.len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.queue.lock().active
    }

    /// Queue `task` and return its result handle. Never fails: if the engine
    /// is stopped the task waits for the next start.
    pub fn submit<T, E, F>(&self, task: F) -> AsyncResult<T>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let result = AsyncResult::pending();
        let handle = result.clone();
        let job: Job = Box::new(move |mode| {
            if mode == JobMode::Cancel {
                handle.cancel();
                return;
            }
            if !handle.begin() {
                return;
            }
            let outcome = match catch_unwind(AssertUnwindSafe(task)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(TaskError::failed(e)),
                Err(panic) => {
                    let msg = panic_message(panic.as_ref());
                    warn!("task panicked: {msg}");
                    Err(TaskError::Panicked(msg))
                }
            };
            handle.resolve(outcome);
        });

        let mut q = self.inner.queue.lock();
        if q.terminated {
            drop(q);
            result.resolve(Err(TaskError::Cancelled));
            return result;
        }
        q.jobs.push_back(job);
        let running = q.running;
        drop(q);
        if running {
            self.inner.work.notify_one();
        }
        result
    }

    /// Terminate the pool: stop dequeuing, let in-flight tasks finish and
    /// join the workers. Tasks still queued are dropped and resolve as cancelled.
    pub fn shutdown(&self) {
        let dropped = {
            let mut q = self.inner.queue.lock();
            if q.terminated {
                return;
            }
            q.terminated = true;
            q.running = false;
            std::mem::take(&mut q.jobs)
        };
        self.inner.work.notify_all();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "dropping queued tasks at shutdown");
        }
        // Waiters on dropped tasks must be released
        for job in dropped {
            job(JobMode::Cancel);
        }

        let current = thread::current().id();
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("task engine worker panicked");
            }
        }
        debug!("task engine shut down");
    }

    fn is_own_worker(&self) -> bool {
        CURRENT_ENGINE.with(Cell::get) == self.inner.id
    }
}

impl Drop for TaskEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &Inner) {
    CURRENT_ENGINE.with(|c| c.set(inner.id));
    loop {
        let job = {
            let mut q = inner.queue.lock();
            loop {
                if q.terminated {
                    return;
                }
                if q.running {
                    if let Some(job) = q.jobs.pop_front() {
                        q.active += 1;
                        break job;
                    }
                }
                inner.work.wait(&mut q);
            }
        };
        job(JobMode::Run);
        let mut q = inner.queue.lock();
        q.active -= 1;
        drop(q);
        inner.idle.notify_all();
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
