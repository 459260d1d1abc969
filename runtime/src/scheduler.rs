//! Schedulers that marshal listener notifications onto an execution context.
//!
//! - [`TokioScheduler`] spawns each notification onto a tokio runtime.
//! - [`UpdateThread`] owns a dedicated OS thread and runs notifications on it in
//!   order, for consumers that must only ever be touched from one thread.
//!
//! # Example
//!
//! ```rust
//! use api_request_core::Scheduler;
//! use api_request_runtime::scheduler::UpdateThread;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let update_thread = UpdateThread::spawn("update")?;
//! let scheduler = update_thread.scheduler();
//!
//! scheduler.schedule(Box::new(|| println!("runs on the update thread")));
//! update_thread.shutdown();
//! # Ok(())
//! # }
//! ```

use api_request_core::scheduler::{Scheduler, Task};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::{JoinHandle, ThreadId};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Errors from scheduler construction.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The update thread could not be spawned
    #[error("Failed to spawn update thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// No tokio runtime is running on the current thread
    #[error("No tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// Scheduler that spawns notifications onto a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Create a scheduler for the runtime behind `handle`.
    #[must_use]
    pub const fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Create a scheduler for the runtime the caller is running on.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::NoRuntime` outside of a tokio runtime.
    pub fn current() -> Result<Self, SchedulerError> {
        Ok(Self::new(Handle::try_current()?))
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, task: Task) {
        self.handle.spawn(async move { task() });
    }
}

enum Message {
    Run(Task),
    Shutdown,
}

/// A dedicated thread that runs scheduled tasks one at a time, in order.
///
/// Dropping the `UpdateThread` stops the thread after the tasks queued before
/// the stop request have run. Tasks scheduled afterwards are dropped with a
/// warning, including those that were already queued behind the stop request.
#[derive(Debug)]
pub struct UpdateThread {
    sender: mpsc::UnboundedSender<Message>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl UpdateThread {
    /// Spawn a named update thread.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Spawn` if the OS refuses to create the thread.
    pub fn spawn(name: impl Into<String>) -> Result<Self, SchedulerError> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Message>();

        let thread = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                while let Some(Message::Run(task)) = receiver.blocking_recv() {
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        tracing::error!("Scheduled task panicked on update thread");
                    }
                }

                receiver.close();
                let mut dropped = 0_usize;
                while let Ok(message) = receiver.try_recv() {
                    if matches!(message, Message::Run(_)) {
                        dropped += 1;
                    }
                }
                if dropped > 0 {
                    tracing::warn!(dropped, "Update thread has stopped, dropping scheduled tasks");
                }
                tracing::debug!("Update thread stopped");
            })?;
        let thread_id = thread.thread().id();

        Ok(Self {
            sender,
            thread: Some(thread),
            thread_id,
        })
    }

    /// A scheduler that queues tasks onto this thread.
    #[must_use]
    pub fn scheduler(&self) -> UpdateScheduler {
        UpdateScheduler {
            sender: self.sender.clone(),
        }
    }

    /// Id of the update thread.
    #[must_use]
    pub const fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Stop the thread once the already queued tasks have run, and wait for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.sender.send(Message::Shutdown);

        if let Some(thread) = self.thread.take() {
            // Joining ourselves would never return
            if thread.thread().id() != std::thread::current().id() && thread.join().is_err() {
                tracing::error!("Update thread panicked");
            }
        }
    }
}

impl Drop for UpdateThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Scheduler handle for an [`UpdateThread`].
#[derive(Debug, Clone)]
pub struct UpdateScheduler {
    sender: mpsc::UnboundedSender<Message>,
}

impl Scheduler for UpdateScheduler {
    fn schedule(&self, task: Task) {
        if self.sender.send(Message::Run(task)).is_err() {
            tracing::warn!("Update thread has stopped, dropping scheduled task");
        }
    }
}
