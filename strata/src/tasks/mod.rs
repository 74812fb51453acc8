//! Background work: flush, compaction I/O and WAL checkpoints run on a
//! fixed worker pool off the committing thread

mod checkpoint;
mod scheduler;
mod task;

pub use checkpoint::Checkpointer;
pub use scheduler::{TaskKindStats, TaskScheduler};
pub use task::{FnTask, Task, TaskHandle};

/// What a task does; used for counters and scoping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Flush,
    Compact,
    Checkpoint,
    Io,
    Custom,
}

impl TaskKind {
    pub const ALL: [TaskKind; 5] =
        [TaskKind::Flush, TaskKind::Compact, TaskKind::Checkpoint, TaskKind::Io, TaskKind::Custom];

    pub(crate) fn slot(self) -> usize {
        match self {
            TaskKind::Flush => 0,
            TaskKind::Compact => 1,
            TaskKind::Checkpoint => 2,
            TaskKind::Io => 3,
            TaskKind::Custom => 4,
        }
    }
}
