//! Execution contexts for listener notifications
//!
//! Requests never invoke listeners on the thread that detected completion.
//! Notifications are handed to the [`Scheduler`] of the bound API context,
//! which decides where they run (a UI thread, a tokio runtime, inline, ...).

/// A unit of work handed to a scheduler
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Marshals tasks onto a specific execution context
pub trait Scheduler: Send + Sync {
    /// Queue `task` for execution on this scheduler's context
    ///
    /// Must not block waiting for the task to run.
    fn schedule(&self, task: Task);
}

/// Scheduler that runs every task inline on the calling thread
///
/// Useful for tests and for callers that have no dedicated event thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    fn schedule(&self, task: Task) {
        task();
    }
}
