use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Posts work to a thread the caller does not control (usually the main
/// thread of a heap).
pub trait TaskRunner: Send + Sync {
    fn post_task(&self, task: Task);
}

/// Task queue drained by its owning thread at safe points.
#[derive(Default)]
pub struct ForegroundTaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    posted: Condvar,
}

impl ForegroundTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Runs every task queued so far. Tasks posted while draining wait for
    /// the next call.
    pub fn run_pending(&self) -> usize {
        let batch = std::mem::take(&mut *self.tasks.lock());
        let count = batch.len();
        for task in batch {
            task();
        }
        count
    }

    /// Blocks until at least one task is queued, then drains.
    pub fn wait_and_run(&self) -> usize {
        {
            let mut tasks = self.tasks.lock();
            while tasks.is_empty() {
                self.posted.wait(&mut tasks);
            }
        }
        self.run_pending()
    }
}

impl TaskRunner for ForegroundTaskQueue {
    fn post_task(&self, task: Task) {
        self.tasks.lock().push_back(task);
        self.posted.notify_one();
    }
}
