use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

// Public API
pub mod dispatcher;
pub use dispatcher::{Builder, Dispatcher};

pub mod stats;
pub use stats::QueueStatistics;

// Exports
pub(crate) mod context;

pub(crate) mod pool;

pub(crate) mod queue;

pub(crate) mod worker;

#[cfg(test)]
mod tests;

/// Queue selector for submissions and queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueId {
    /// Every queue of the requested type. Queries only.
    All,
    /// Let the dispatcher pick the least-loaded queue. Submissions only.
    Any,
    /// The queue of the currently running coroutine. In-coroutine
    /// submissions only.
    Same,
    /// A specific queue in `[0, pool threads)`.
    Id(usize),
}

/// Which worker pool an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    Coro,
    Io,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolKind {
    Coro,
    Io,
}

impl PoolKind {
    pub(crate) fn label(self) -> &'static str {
        match self {
            PoolKind::Coro => "coro",
            PoolKind::Io => "io",
        }
    }
}

/// State shared by every worker of one dispatcher: the shutdown and drain
/// latches plus the quiescence signal `drain` sleeps on.
#[derive(Default)]
pub(crate) struct PoolShared {
    shutdown: AtomicBool,
    draining: AtomicBool,
    quiesce_lock: Mutex<()>,
    quiesce: Condvar,
}

impl PoolShared {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn set_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub(crate) fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::Release);
    }

    /// Wake a drainer so it can re-check queue emptiness.
    pub(crate) fn notify_quiesce(&self) {
        let _guard = self.quiesce_lock.lock();
        self.quiesce.notify_all();
    }

    /// Sleep until the next quiescence hint, bounded by `timeout` so a
    /// missed notification only delays the re-check.
    pub(crate) fn wait_quiesce(&self, timeout: std::time::Duration) {
        let mut guard = self.quiesce_lock.lock();
        let _ = self.quiesce.wait_for(&mut guard, timeout);
    }
}
