//! Background executor for disk loads.
//!
//! The coordinator hands each scheduled load to a `LoadExecutor` as a boxed
//! closure. The closure does the blocking read and then re-enters the
//! coordinator to publish the result.

use tokio::runtime::Handle;

pub type LoadTask = Box<dyn FnOnce() + Send + 'static>;

pub trait LoadExecutor: Send + Sync {
    fn execute(&self, task: LoadTask);
}

/// Runs loads on tokio's blocking pool.
#[derive(Clone)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Executor on the runtime the caller is running in.
    ///
    /// Returns `None` outside a tokio runtime.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl LoadExecutor for TokioExecutor {
    fn execute(&self, task: LoadTask) {
        // Result is observed through the coordinator, not the join handle.
        drop(self.handle.spawn_blocking(task));
    }
}

/// Runs every load inline on the calling thread.
///
/// Only suitable where re-entering the coordinator from inside the
/// scheduling call is fine, i.e. when loads are scheduled without holding
/// the coordinator lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl LoadExecutor for InlineExecutor {
    fn execute(&self, task: LoadTask) {
        task();
    }
}
