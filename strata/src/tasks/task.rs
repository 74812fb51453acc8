//! Task trait and completion handles

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::TaskKind;
use crate::{Result, StrataError};

/// A unit of background work; runs exactly once on one worker
pub trait Task: Send + 'static {
    fn kind(&self) -> TaskKind;

    fn execute(&mut self) -> Result<()>;
}

/// Task wrapping a closure
pub struct FnTask {
    kind: TaskKind,
    f: Option<Box<dyn FnOnce() -> Result<()> + Send>>,
}

impl FnTask {
    pub fn new(kind: TaskKind, f: impl FnOnce() -> Result<()> + Send + 'static) -> Self {
        Self { kind, f: Some(Box::new(f)) }
    }
}

impl Task for FnTask {
    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn execute(&mut self) -> Result<()> {
        match self.f.take() {
            Some(f) => f(),
            None => Err(StrataError::InvalidState(format!("{:?} task executed twice", self.kind))),
        }
    }
}

struct Completion {
    done: bool,
    error: Option<Arc<StrataError>>,
}

struct Shared {
    kind: TaskKind,
    waitable: bool,
    completion: Mutex<Completion>,
    cv: Condvar,
}

/// Caller's view of a submitted task
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<Shared>,
}

impl TaskHandle {
    pub(crate) fn new(kind: TaskKind, waitable: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                kind,
                waitable,
                completion: Mutex::new(Completion { done: false, error: None }),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.shared.kind
    }

    pub fn is_waitable(&self) -> bool {
        self.shared.waitable
    }

    pub fn is_done(&self) -> bool {
        self.shared.completion.lock().done
    }

    /// Block until the task ran and return its error
    ///
    /// Only waitable tasks can be waited on.
    pub fn wait_done(&self) -> Result<()> {
        if !self.shared.waitable {
            return Err(StrataError::InvalidState(format!(
                "{:?} task is not waitable",
                self.shared.kind
            )));
        }
        let mut completion = self.shared.completion.lock();
        while !completion.done {
            self.shared.cv.wait(&mut completion);
        }
        match &completion.error {
            None => Ok(()),
            Some(e) => Err(StrataError::TaskFailed { kind: self.shared.kind, source: e.clone() }),
        }
    }

    pub(crate) fn complete(&self, result: Result<()>) {
        let mut completion = self.shared.completion.lock();
        completion.done = true;
        completion.error = result.err().map(Arc::new);
        self.shared.cv.notify_all();
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("kind", &self.shared.kind)
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_after_completion() {
        let handle = TaskHandle::new(TaskKind::Io, true);
        assert!(!handle.is_done());
        handle.complete(Err(StrataError::QueueFull));
        match handle.wait_done() {
            Err(StrataError::TaskFailed { kind: TaskKind::Io, source }) => {
                assert!(matches!(*source, StrataError::QueueFull))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_wait_blocks_until_complete() {
        let handle = TaskHandle::new(TaskKind::Flush, true);
        std::thread::scope(|s| {
            let h = handle.clone();
            s.spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                h.complete(Ok(()));
            });
            handle.wait_done().unwrap();
        });
        assert!(handle.is_done());
    }

    #[test]
    fn test_not_waitable() {
        let handle = TaskHandle::new(TaskKind::Checkpoint, false);
        handle.complete(Ok(()));
        assert!(matches!(handle.wait_done(), Err(StrataError::InvalidState(_))));
    }

    #[test]
    fn test_fn_task_runs_once() {
        let mut task = FnTask::new(TaskKind::Custom, || Ok(()));
        assert_eq!(task.kind(), TaskKind::Custom);
        task.execute().unwrap();
        assert!(task.execute().is_err());
    }
}
