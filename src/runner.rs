use std::sync::Arc;
use tokio::runtime::{Handle, TryCurrentError};

/// A unit of work submitted to a [`TaskRunner`].
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Executes units of work on behalf of an execution.
///
/// The engine imposes no threading policy of its own: it only submits a
/// step once every one of its dependencies has finished, and the runner
/// decides where and when the work actually runs: inline, on a thread
/// pool, or anywhere else. Implementations must eventually run every
/// submitted unit, or the execution never completes.
pub trait TaskRunner: Send + Sync {
    /// Execute `work`, now or later, on any thread.
    fn run(&self, work: Work);
}

impl<T: TaskRunner + ?Sized> TaskRunner for Box<T> {
    fn run(&self, work: Work) {
        (**self).run(work);
    }
}

impl<T: TaskRunner + ?Sized> TaskRunner for Arc<T> {
    fn run(&self, work: Work) {
        (**self).run(work);
    }
}

/// Runs every unit of work inline on the submitting thread.
///
/// With this runner the whole graph executes sequentially, in dependency
/// order, during step submission. Useful for tests and for callers that
/// do not want any parallelism.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentThread;

impl TaskRunner for CurrentThread {
    fn run(&self, work: Work) {
        work();
    }
}

/// Dispatches units of work onto a tokio runtime's blocking pool.
///
/// Step callbacks are synchronous and run to completion, so the blocking
/// pool is the right home for them; independent steps execute in
/// parallel up to the pool's thread limit.
#[derive(Debug, Clone)]
pub struct BlockingPool {
    handle: Handle,
}

impl BlockingPool {
    /// A runner dispatching onto the runtime behind `handle`.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// A runner dispatching onto the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when called outside a runtime context.
    pub fn current() -> Result<Self, TryCurrentError> {
        Handle::try_current().map(Self::new)
    }
}

impl TaskRunner for BlockingPool {
    fn run(&self, work: Work) {
        let _ = self.handle.spawn_blocking(work);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_current_thread_runs_inline() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        CurrentThread.run(Box::new(move || flag.store(true, Ordering::Release)));
        // the closure ran before `run` returned
        assert!(ran.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_blocking_pool_runs_work() {
        let runner = BlockingPool::current().expect("inside runtime");
        let (tx, rx) = mpsc::channel();
        runner.run(Box::new(move || {
            let _ = tx.send(42u32);
        }));
        let value = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("work completed");
        assert_eq!(value, 42);
    }
}
