//! Background work queues
//!
//! The loader never spawns threads itself. Best-effort maintenance work is
//! posted to a [`TaskRunner`] supplied by the embedder.

use std::thread;

use log::warn;
use tokio::runtime::Handle;

/// A unit of background work
pub type BackgroundTask = Box<dyn FnOnce() + Send + 'static>;

/// Accepts low-priority, best-effort background tasks
pub trait TaskRunner: Send + Sync {
    fn post_background_task(&self, task: BackgroundTask);
}

/// Runs tasks on the blocking pool of a tokio runtime
#[derive(Debug, Clone)]
pub struct TokioTaskRunner {
    handle: Handle,
}

impl TokioTaskRunner {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl TaskRunner for TokioTaskRunner {
    fn post_background_task(&self, task: BackgroundTask) {
        // Detached: the JoinHandle is dropped on purpose.
        let _ = self.handle.spawn_blocking(task);
    }
}

/// Runs each task on its own detached, named thread
#[derive(Debug, Clone)]
pub struct ThreadTaskRunner {
    name: String,
}

impl ThreadTaskRunner {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for ThreadTaskRunner {
    fn default() -> Self {
        Self::new("LibraryLoaderBackground")
    }
}

impl TaskRunner for ThreadTaskRunner {
    fn post_background_task(&self, task: BackgroundTask) {
        if let Err(e) = thread::Builder::new().name(self.name.clone()).spawn(task) {
            warn!(target: "LibraryLoader", "Unable to start background task: {e}");
        }
    }
}

/// Runs tasks immediately on the posting thread
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineTaskRunner;

impl TaskRunner for InlineTaskRunner {
    fn post_background_task(&self, task: BackgroundTask) {
        task();
    }
}
