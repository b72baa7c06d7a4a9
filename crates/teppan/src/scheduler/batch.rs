/// A unit of work that the scheduler can group into batches.
///
/// `size` is the task's leading-dimension row count; batch capacity is
/// expressed as a bound on the sum of task sizes, not on the task count.
pub trait SchedulerTask: Send + 'static {
    fn size(&self) -> usize;
}

/// An ordered list of tasks formed for a single executor invocation.
///
/// Task order is enqueue order; concatenation at processing time walks the
/// tasks in this order.
#[derive(Debug)]
pub struct Batch<T> {
    tasks: Vec<T>,
}

impl<T: SchedulerTask> Batch<T> {
    pub(crate) fn new(tasks: Vec<T>) -> Self {
        Self { tasks }
    }

    /// Sum of the sizes of all tasks in the batch.
    pub fn size(&self) -> usize {
        self.tasks.iter().map(|task| task.size()).sum()
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[T] {
        &self.tasks
    }

    pub fn into_tasks(self) -> Vec<T> {
        self.tasks
    }
}
