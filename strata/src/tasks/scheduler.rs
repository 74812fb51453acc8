//! Fixed-size worker pool fed by a bounded queue

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use super::checkpoint::Checkpointer;
use super::task::{FnTask, Task, TaskHandle};
use super::TaskKind;
use crate::wal::{LogStore, WalIndex};
use crate::{Result, StrataError};

struct Job {
    task: Box<dyn Task>,
    handle: TaskHandle,
    scope: Option<(TaskKind, u64)>,
}

#[derive(Default)]
struct KindCounters {
    scheduled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Per-kind task counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskKindStats {
    pub scheduled: u64,
    pub completed: u64,
    pub failed: u64,
}

struct Shared {
    counters: [KindCounters; 5],
    /// (kind, scope id) pairs with a task queued or running
    scopes: Mutex<HashSet<(TaskKind, u64)>>,
}

pub struct TaskScheduler {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    blocking_submit: bool,
    shared: Arc<Shared>,
    checkpointer: Checkpointer,
}

impl TaskScheduler {
    /// Start `workers` threads (at least one) behind a queue of `queue_capacity`
    pub fn new(
        workers: usize,
        queue_capacity: usize,
        blocking_submit: bool,
        wal: Arc<dyn LogStore>,
    ) -> Result<Self> {
        let (sender, receiver) = bounded::<Job>(queue_capacity.max(1));
        let shared = Arc::new(Shared {
            counters: Default::default(),
            scopes: Mutex::new(HashSet::new()),
        });

        let mut handles = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let receiver = receiver.clone();
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("strata-worker-{}", i))
                .spawn(move || worker_loop(receiver, shared))?;
            handles.push(handle);
        }
        log::info!("task scheduler started with {} workers", handles.len());

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            blocking_submit,
            shared,
            checkpointer: Checkpointer::new(wal),
        })
    }

    /// Submit a task; with blocking submit a full queue waits for a free slot,
    /// otherwise it fails with `QueueFull`
    pub fn schedule(&self, task: Box<dyn Task>, waitable: bool) -> Result<TaskHandle> {
        self.submit(task, waitable, None, self.blocking_submit)
    }

    /// Submit without ever waiting for queue space, whatever the submit mode.
    /// Callers holding locks a worker may need use this and handle `QueueFull`.
    pub fn try_schedule(&self, task: Box<dyn Task>, waitable: bool) -> Result<TaskHandle> {
        self.submit(task, waitable, None, false)
    }

    /// Submit a closure as a waitable task
    pub fn schedule_fn(
        &self,
        kind: TaskKind,
        f: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<TaskHandle> {
        self.submit(Box::new(FnTask::new(kind, f)), true, None, self.blocking_submit)
    }

    /// Submit a closure unless a task of the same kind and scope is still in flight
    pub fn schedule_scoped_fn(
        &self,
        kind: TaskKind,
        scope: u64,
        f: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<TaskHandle> {
        self.submit_scoped(kind, scope, f, self.blocking_submit)
    }

    /// `schedule_scoped_fn` that fails with `QueueFull` instead of waiting
    pub fn try_schedule_scoped_fn(
        &self,
        kind: TaskKind,
        scope: u64,
        f: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<TaskHandle> {
        self.submit_scoped(kind, scope, f, false)
    }

    fn submit_scoped(
        &self,
        kind: TaskKind,
        scope: u64,
        f: impl FnOnce() -> Result<()> + Send + 'static,
        blocking: bool,
    ) -> Result<TaskHandle> {
        if !self.shared.scopes.lock().insert((kind, scope)) {
            return Err(StrataError::ScopeConflict(format!("{:?} on {}", kind, scope)));
        }
        self.submit(Box::new(FnTask::new(kind, f)), true, Some((kind, scope)), blocking)
    }

    fn submit(
        &self,
        task: Box<dyn Task>,
        waitable: bool,
        scope: Option<(TaskKind, u64)>,
        blocking: bool,
    ) -> Result<TaskHandle> {
        let kind = task.kind();
        let handle = TaskHandle::new(kind, waitable);
        let job = Job { task, handle: handle.clone(), scope };

        let sender = self.sender.lock().clone();
        let result = match sender {
            None => Err(StrataError::SchedulerStopped),
            Some(sender) if blocking => {
                sender.send(job).map_err(|_| StrataError::SchedulerStopped)
            }
            Some(sender) => sender.try_send(job).map_err(|e| match e {
                TrySendError::Full(_) => StrataError::QueueFull,
                TrySendError::Disconnected(_) => StrataError::SchedulerStopped,
            }),
        };
        if let Err(e) = result {
            if let Some(scope) = scope {
                self.shared.scopes.lock().remove(&scope);
            }
            return Err(e);
        }
        self.shared.counters[kind.slot()].scheduled.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    /// Mark the log durable and reclaimable up to each index; monotonic per group
    pub fn checkpoint(&self, indices: &[WalIndex]) -> Result<usize> {
        self.checkpointer.checkpoint(indices)
    }

    pub fn checkpointer(&self) -> &Checkpointer {
        &self.checkpointer
    }

    pub fn stats(&self, kind: TaskKind) -> TaskKindStats {
        let c = &self.shared.counters[kind.slot()];
        TaskKindStats {
            scheduled: c.scheduled.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stop accepting tasks, run what is queued, join the workers
    pub fn stop(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                log::error!("scheduler worker exited by panic");
            }
        }
        log::info!("task scheduler stopped");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(receiver: Receiver<Job>, shared: Arc<Shared>) {
    for mut job in receiver.iter() {
        let kind = job.task.kind();
        log::trace!("running {:?} task", kind);
        let result = catch_unwind(AssertUnwindSafe(|| job.task.execute())).unwrap_or_else(|_| {
            Err(StrataError::Invariant(format!("{:?} task panicked", kind)))
        });

        let counters = &shared.counters[kind.slot()];
        match &result {
            Ok(()) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("{:?} task failed: {}", kind, e);
            }
        }
        if let Some(scope) = job.scope {
            shared.scopes.lock().remove(&scope);
        }
        job.handle.complete(result);
    }
}
