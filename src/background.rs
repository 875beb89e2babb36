//! Cooperative background execution for long-running passes.
//!
//! The fix-pass orchestrator can take seconds per function (it waits for the
//! host's re-analysis between rounds), so callers run it on a dedicated
//! thread. Cancellation is cooperative: the pass polls a shared flag at the
//! top of every iteration and winds down on its own; nothing is interrupted
//! preemptively.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::log::*;

/// A shared cancellation flag, cloneable across threads.
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// A worker thread running one task to completion, with a cancellation
/// token the task is expected to poll.
pub struct TaskThread {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TaskThread {
    /// Run `task` on a new thread. The task receives the thread's
    /// cancellation token and should check it at its own safe points.
    pub fn spawn<F>(name: impl Into<String>, task: F) -> Self
    where
        F: FnOnce(&CancellationToken) + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let thread_token = token.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                task(&thread_token);
                debug!("Background task done"; "task" => name);
            })
            .expect("spawning a background task thread failed");
        Self {
            token,
            handle: Some(handle),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request cooperative cancellation. The task keeps running until its
    /// next check point.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the task to finish.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TaskThread {
    // Dropping the handle detaches the thread; the task finishes (or
    // notices cancellation) on its own.
    fn drop(&mut self) {
        drop(self.handle.take());
    }
}
