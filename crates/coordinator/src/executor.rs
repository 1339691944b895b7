//! Executors running the per-branch jobs of a phase
//!
//! A job is submitted through [`submit`], which returns a [`JobHandle`] the
//! phase engine polls with a bounded wait. A panicking job completes its handle
//! with [`JobError::Panicked`] instead of taking the worker down.

use crate::config::ExecutorKind;
use crate::error::{CoordinatorError, Result};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Unit of work handed to an executor
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Failure of a job itself, as opposed to the work it did
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("job rejected: {0}")]
    Rejected(String),
}

/// Runs tasks, possibly concurrently
pub trait Executor: Send + Sync {
    /// Run or schedule the task
    fn execute(&self, task: Task) -> std::result::Result<(), JobError>;

    /// Stop accepting tasks
    fn shutdown(&self);

    fn name(&self) -> &'static str;
}

/// Submit a job and get a handle to its outcome
pub fn submit<T, F>(executor: &dyn Executor, job: F) -> std::result::Result<JobHandle<T>, JobError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let slot = Arc::new(JobSlot::new());
    let completion = slot.clone();

    executor.execute(Box::new(move || {
        let outcome = panic::catch_unwind(AssertUnwindSafe(job))
            .map_err(|payload| JobError::Panicked(panic_message(payload.as_ref())));
        completion.complete(outcome);
    }))?;

    Ok(JobHandle { slot })
}

/// Build the executor selected by configuration
pub fn from_kind(kind: &ExecutorKind) -> Result<Arc<dyn Executor>> {
    let executor: Arc<dyn Executor> = match kind {
        ExecutorKind::Synchronous => Arc::new(SyncExecutor::new()),
        ExecutorKind::ThreadPerJob => Arc::new(ThreadPerJobExecutor::new()),
        ExecutorKind::Pooled { threads } => Arc::new(PooledExecutor::new(*threads)?),
    };
    tracing::debug!("Using {} executor", executor.name());
    Ok(executor)
}

/// Readable message of a caught panic
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

struct SlotState<T> {
    done: bool,
    outcome: Option<std::result::Result<T, JobError>>,
}

struct JobSlot<T> {
    state: Mutex<SlotState<T>>,
    finished: Condvar,
}

impl<T> JobSlot<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                done: false,
                outcome: None,
            }),
            finished: Condvar::new(),
        }
    }

    fn complete(&self, outcome: std::result::Result<T, JobError>) {
        let mut state = self.state.lock();
        state.done = true;
        state.outcome = Some(outcome);
        self.finished.notify_all();
    }
}

/// Outcome of a submitted job
pub struct JobHandle<T> {
    slot: Arc<JobSlot<T>>,
}

impl<T> JobHandle<T> {
    /// Wait at most `timeout` for the job; returns whether it is done
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock();
        while !state.done {
            if self
                .slot
                .finished
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        state.done
    }

    pub fn is_done(&self) -> bool {
        self.slot.state.lock().done
    }

    /// Take the outcome of a finished job
    pub fn take(&self) -> Option<std::result::Result<T, JobError>> {
        self.slot.state.lock().outcome.take()
    }
}

/// Runs every task on the calling thread
#[derive(Debug, Default)]
pub struct SyncExecutor;

impl SyncExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for SyncExecutor {
    fn execute(&self, task: Task) -> std::result::Result<(), JobError> {
        task();
        Ok(())
    }

    fn shutdown(&self) {}

    fn name(&self) -> &'static str {
        "synchronous"
    }
}

/// Spawns a thread per task
#[derive(Debug, Default)]
pub struct ThreadPerJobExecutor {
    shut_down: AtomicBool,
    spawned: AtomicUsize,
}

impl ThreadPerJobExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Executor for ThreadPerJobExecutor {
    fn execute(&self, task: Task) -> std::result::Result<(), JobError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(JobError::Rejected("executor is shut down".to_string()));
        }
        let number = self.spawned.fetch_add(1, Ordering::Relaxed);
        std::thread::Builder::new()
            .name(format!("twophase-job-{}", number))
            .spawn(task)
            .map(|_| ())
            .map_err(|e| JobError::Rejected(e.to_string()))
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }

    fn name(&self) -> &'static str {
        "thread-per-job"
    }
}

/// Runs tasks on a bounded pool of blocking threads
pub struct PooledExecutor {
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
}

impl PooledExecutor {
    pub fn new(threads: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name("twophase-pool")
            .build()
            .map_err(|e| CoordinatorError::ExecutorUnavailable(e.to_string()))?;

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
        })
    }
}

impl Executor for PooledExecutor {
    fn execute(&self, task: Task) -> std::result::Result<(), JobError> {
        match self.runtime.lock().as_ref() {
            Some(runtime) => {
                runtime.spawn_blocking(task);
                Ok(())
            }
            None => Err(JobError::Rejected("executor is shut down".to_string())),
        }
    }

    fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }

    fn name(&self) -> &'static str {
        "pooled"
    }
}

impl Drop for PooledExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
