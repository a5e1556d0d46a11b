use crate::coro;
use crate::error::{DispatchError, Result};
use crate::runtime::context;
use crate::runtime::pool::WorkerPool;
use crate::runtime::stats::QueueStatistics;
use crate::runtime::{PoolKind, PoolShared, QueueId, QueueType};
use crate::task::promise::{ErasedPromise, PromiseCore};
use crate::task::record::{self, TaskRef, TaskSlab, cancel_task};
use crate::task::{ChainHandle, CoroContext, JoinHandle, Priority, Promise, TaskId};
use crate::utils;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_IO_THREADS: usize = 5;

const DEFAULT_STEAL_RETRIES: usize = 3;

/// How long `drain` naps between emptiness re-checks when it misses a
/// quiescence notification.
const QUIESCE_POLL: Duration = Duration::from_millis(10);

// Process-wide dispatcher ids; several dispatchers may coexist and their
// workers must never confuse each other's thread-local context.
static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

/// Configures and builds a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct Builder {
    coroutine_threads: Option<usize>,
    io_threads: usize,
    pin_to_cores: bool,
    thread_stack_size: Option<usize>,
    coroutine_stack_size: usize,
    steal_retries: usize,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            coroutine_threads: None,
            io_threads: DEFAULT_IO_THREADS,
            pin_to_cores: false,
            thread_stack_size: None,
            coroutine_stack_size: coro::DEFAULT_STACK_SIZE,
            steal_retries: DEFAULT_STEAL_RETRIES,
        }
    }

    /// Number of coroutine worker threads. Defaults to one per hardware
    /// core.
    #[track_caller]
    pub fn coroutine_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "coroutine threads cannot be set to 0");
        self.coroutine_threads = Some(val);
        self
    }

    /// Number of IO worker threads. 0 disables the IO pool entirely;
    /// `post_io` then fails with `Unsupported`. Defaults to 5.
    pub fn io_threads(mut self, val: usize) -> Self {
        self.io_threads = val;
        self
    }

    /// Pin each coroutine worker to the core matching its queue id.
    /// Silently skipped when there are more workers than cores.
    pub fn pin_to_cores(mut self, val: bool) -> Self {
        self.pin_to_cores = val;
        self
    }

    /// OS stack size for worker threads.
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Stack handed to each coroutine. Default 256 KiB.
    pub fn coroutine_stack_size(mut self, val: usize) -> Self {
        self.coroutine_stack_size = val;
        self
    }

    /// How many full sweeps over peer queues an idle worker makes before
    /// parking.
    pub fn steal_retries(mut self, val: usize) -> Self {
        self.steal_retries = val;
        self
    }

    pub fn build(self) -> Dispatcher {
        let coroutine_threads = self
            .coroutine_threads
            .unwrap_or_else(utils::available_cores);

        let shared = Arc::new(PoolShared::default());
        let id = NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed);

        let coro_pool = WorkerPool::spawn(
            PoolKind::Coro,
            coroutine_threads,
            id,
            &shared,
            self.thread_stack_size,
            self.pin_to_cores,
            self.steal_retries,
        );
        let io_pool = WorkerPool::spawn(
            PoolKind::Io,
            self.io_threads,
            id,
            &shared,
            self.thread_stack_size,
            false,
            self.steal_retries,
        );

        Dispatcher {
            core: Arc::new(DispatcherCore {
                id,
                coroutine_stack_size: self.coroutine_stack_size,
                coro_pool,
                io_pool,
                shared,
                slab: Arc::new(TaskSlab::new()),
                next_task_id: AtomicU64::new(1),
                terminated: AtomicBool::new(false),
            }),
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parallel execution engine running coroutines and blocking IO tasks
/// asynchronously over two fixed worker pools. The main entry point of the
/// crate.
pub struct Dispatcher {
    core: Arc<DispatcherCore>,
}

impl Dispatcher {
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Dispatcher with default settings: one coroutine worker per core and
    /// five IO workers.
    pub fn new() -> Self {
        Builder::new().build()
    }

    /// Post a coroutine on any available queue at normal priority.
    ///
    /// The callable receives a [`CoroContext`] and must return an integer
    /// status: 0 for success after publishing its result through the
    /// context, nonzero for failure.
    pub fn post<T, F>(&self, f: F) -> Result<JoinHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(CoroContext<T>) -> i32 + Send + 'static,
    {
        self.core.post_coroutine(QueueId::Any, false, f)
    }

    /// Post a coroutine on a specific queue. High priority inserts at the
    /// queue's front, to run right after the current task yields or
    /// completes.
    pub fn post_to<T, F>(&self, queue: QueueId, high_priority: bool, f: F) -> Result<JoinHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(CoroContext<T>) -> i32 + Send + 'static,
    {
        self.core.post_coroutine(queue, high_priority, f)
    }

    /// Post the head of a continuation chain; the returned handle's
    /// [`then`] appends coroutines that run sequentially on the same
    /// queue.
    ///
    /// [`then`]: ChainHandle::then
    pub fn post_first<T, F>(&self, f: F) -> Result<ChainHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(CoroContext<T>) -> i32 + Send + 'static,
    {
        self.core.post_first(QueueId::Any, false, f)
    }

    /// [`post_first`] with explicit queue and priority.
    ///
    /// [`post_first`]: Dispatcher::post_first
    pub fn post_first_to<T, F>(
        &self,
        queue: QueueId,
        high_priority: bool,
        f: F,
    ) -> Result<ChainHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(CoroContext<T>) -> i32 + Send + 'static,
    {
        self.core.post_first(queue, high_priority, f)
    }

    /// Post blocking (or long-running) work to the IO pool. The callable
    /// receives the write side of the result channel and is not wrapped in
    /// a coroutine.
    pub fn post_io<T, F>(&self, f: F) -> Result<JoinHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(Promise<T>) -> i32 + Send + 'static,
    {
        self.core.post_io(QueueId::Any, false, f)
    }

    /// [`post_io`] with explicit queue and priority.
    ///
    /// [`post_io`]: Dispatcher::post_io
    pub fn post_io_to<T, F>(
        &self,
        queue: QueueId,
        high_priority: bool,
        f: F,
    ) -> Result<JoinHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(Promise<T>) -> i32 + Send + 'static,
    {
        self.core.post_io(queue, high_priority, f)
    }

    /// Total queued tasks (running included) for the given type and queue.
    /// `QueueType::All` ignores the queue id; `Any` and `Same` are invalid
    /// here.
    pub fn size(&self, queue_type: QueueType, queue: QueueId) -> Result<usize> {
        self.core.size(queue_type, queue)
    }

    /// True when [`size`] would be zero.
    ///
    /// [`size`]: Dispatcher::size
    pub fn empty(&self, queue_type: QueueType, queue: QueueId) -> Result<bool> {
        Ok(self.core.size(queue_type, queue)? == 0)
    }

    /// Per-queue or aggregated statistics snapshot.
    pub fn stats(&self, queue_type: QueueType, queue: QueueId) -> Result<QueueStatistics> {
        self.core.stats(queue_type, queue)
    }

    /// Zero all counters on every queue of both pools.
    pub fn reset_stats(&self) {
        self.core.reset_stats();
    }

    /// Block until both pools are empty. External submissions are rejected
    /// with `Draining` for the duration; tasks posted from within a
    /// running coroutine are still admitted.
    pub fn drain(&self) {
        self.core.drain();
    }

    /// Signal all workers to exit, join them, and cancel everything still
    /// pending or waiting: their promises fulfill with `Cancelled`.
    /// Idempotent; subsequent submissions fail with `Terminated`.
    pub fn terminate(&self) {
        self.core.terminate();
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Same contract as a scoped runtime: wait for outstanding work,
        // then tear the pools down.
        if !self.core.is_terminated() {
            self.core.drain();
        }
        self.core.terminate();
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.core.id)
            .field("coro_threads", &self.core.coro_pool.threads())
            .field("io_threads", &self.core.io_pool.threads())
            .finish()
    }
}

pub(crate) struct DispatcherCore {
    id: u64,
    coroutine_stack_size: usize,
    coro_pool: WorkerPool,
    io_pool: WorkerPool,
    shared: Arc<PoolShared>,
    slab: Arc<TaskSlab>,
    next_task_id: AtomicU64,
    terminated: AtomicBool,
}

impl DispatcherCore {
    pub(crate) fn post_coroutine<T, F>(
        self: &Arc<Self>,
        queue: QueueId,
        high_priority: bool,
        f: F,
    ) -> Result<JoinHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(CoroContext<T>) -> i32 + Send + 'static,
    {
        self.post_coroutine_inner(queue, high_priority, None, f)
    }

    pub(crate) fn post_first<T, F>(
        self: &Arc<Self>,
        queue: QueueId,
        high_priority: bool,
        f: F,
    ) -> Result<ChainHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(CoroContext<T>) -> i32 + Send + 'static,
    {
        let handle = self.post_coroutine_inner(queue, high_priority, None, f)?;
        Ok(ChainHandle::new(handle, Arc::downgrade(self)))
    }

    pub(crate) fn post_io<T, F>(
        self: &Arc<Self>,
        queue: QueueId,
        high_priority: bool,
        f: F,
    ) -> Result<JoinHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(Promise<T>) -> i32 + Send + 'static,
    {
        self.admit()?;
        if self.io_pool.threads() == 0 {
            return Err(DispatchError::Unsupported(
                "dispatcher built without io threads",
            ));
        }

        let (queue_id, pinned) = self.resolve_queue(&self.io_pool, queue, false)?;
        let priority = Self::priority(high_priority);
        let core = PromiseCore::new();
        let task = record::new_io_record(
            &self.slab,
            self.next_id(),
            priority,
            queue_id,
            pinned,
            Arc::clone(&core),
            f,
        );

        let handle = JoinHandle::new(task.clone(), core);
        self.enqueue(&self.io_pool, task)?;
        Ok(handle)
    }

    /// Append `g` to `predecessor`'s continuation chain.
    pub(crate) fn append_chain<T, U, G>(
        self: &Arc<Self>,
        predecessor: &JoinHandle<T>,
        g: G,
    ) -> Result<JoinHandle<U>>
    where
        T: Send + 'static,
        U: Send + 'static,
        G: FnOnce(CoroContext<U>) -> i32 + Send + 'static,
    {
        if self.is_terminated() {
            return Err(DispatchError::Terminated);
        }

        // Chain members share the head's queue and are never stolen.
        let queue_id = predecessor.task.queue_id();
        let core = PromiseCore::new();
        let prev: ErasedPromise = Arc::clone(&predecessor.core) as ErasedPromise;

        let task = record::new_coroutine_record(
            &self.slab,
            self.next_id(),
            Priority::Normal,
            queue_id,
            true,
            self.coroutine_stack_size,
            Arc::clone(&core),
            Some(prev),
            Arc::downgrade(self),
            g,
        );

        let handle = JoinHandle::new(task.clone(), core);
        match predecessor.task.link_successor(task.clone()) {
            record::LinkOutcome::Linked => {
                let queue = self
                    .coro_pool
                    .queue(queue_id)
                    .expect("chain predecessor has a valid queue");
                queue.stats.on_posted(Priority::Normal);
            }
            record::LinkOutcome::PredecessorDone => self.enqueue(&self.coro_pool, task)?,
        }
        Ok(handle)
    }

    pub(crate) fn size(&self, queue_type: QueueType, queue: QueueId) -> Result<usize> {
        match queue_type {
            QueueType::All => {
                Ok(self.coro_pool.total_size() + self.io_pool.total_size())
            }
            QueueType::Coro => Self::pool_size(&self.coro_pool, queue),
            QueueType::Io => Self::pool_size(&self.io_pool, queue),
        }
    }

    pub(crate) fn stats(&self, queue_type: QueueType, queue: QueueId) -> Result<QueueStatistics> {
        match queue_type {
            QueueType::All => {
                let mut total = Self::pool_stats(&self.coro_pool, QueueId::All)?;
                total.merge(&Self::pool_stats(&self.io_pool, QueueId::All)?);
                Ok(total)
            }
            QueueType::Coro => Self::pool_stats(&self.coro_pool, queue),
            QueueType::Io => Self::pool_stats(&self.io_pool, queue),
        }
    }

    pub(crate) fn reset_stats(&self) {
        for queue in self.coro_pool.queues().iter().chain(self.io_pool.queues()) {
            queue.stats.reset();
        }
    }

    pub(crate) fn drain(&self) {
        self.shared.set_draining(true);

        while !self.is_idle() {
            self.shared.wait_quiesce(QUIESCE_POLL);
        }

        self.shared.set_draining(false);
    }

    pub(crate) fn terminate(&self) {
        // Latched: only the first caller tears the pools down.
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::info!(dispatcher = self.id, "terminating");
        self.shared.set_shutdown();
        self.coro_pool.notify_all();
        self.io_pool.notify_all();
        self.coro_pool.join_all();
        self.io_pool.join_all();

        // Workers abandoned whatever was still queued or parked; fulfill
        // every orphaned promise with Cancelled.
        let mut abandoned = self.coro_pool.drain_all_tasks();
        abandoned.extend(self.io_pool.drain_all_tasks());
        let count = abandoned.len();
        for task in &abandoned {
            cancel_task(task);
        }
        drop(abandoned);

        if count > 0 {
            tracing::debug!(dispatcher = self.id, count, "cancelled abandoned tasks");
        }

        // Unblock any drain still sleeping on the quiescence signal.
        self.shared.notify_quiesce();
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn post_coroutine_inner<T, F>(
        self: &Arc<Self>,
        queue: QueueId,
        high_priority: bool,
        prev: Option<ErasedPromise>,
        f: F,
    ) -> Result<JoinHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(CoroContext<T>) -> i32 + Send + 'static,
    {
        self.admit()?;
        let (queue_id, pinned) = self.resolve_queue(&self.coro_pool, queue, true)?;
        let priority = Self::priority(high_priority);
        let core = PromiseCore::new();

        let task = record::new_coroutine_record(
            &self.slab,
            self.next_id(),
            priority,
            queue_id,
            pinned,
            self.coroutine_stack_size,
            Arc::clone(&core),
            prev,
            Arc::downgrade(self),
            f,
        );

        let handle = JoinHandle::new(task.clone(), core);
        self.enqueue(&self.coro_pool, task)?;
        Ok(handle)
    }

    /// Gate every submission on the terminate and drain latches. Posts
    /// from a coroutine already running on this dispatcher bypass the
    /// drain gate.
    fn admit(&self) -> Result<()> {
        if self.is_terminated() || self.shared.is_shutdown() {
            return Err(DispatchError::Terminated);
        }
        if self.shared.is_draining() && context::current_dispatcher() != Some(self.id) {
            return Err(DispatchError::Draining);
        }
        Ok(())
    }

    /// Map a `QueueId` onto a concrete queue of `pool`. Returns the id and
    /// whether the record is pinned (explicit ids stick to their queue;
    /// `Any` records stay stealable).
    fn resolve_queue(
        &self,
        pool: &WorkerPool,
        queue: QueueId,
        allow_same: bool,
    ) -> Result<(usize, bool)> {
        match queue {
            QueueId::Any => Ok((pool.least_loaded(), false)),
            QueueId::Id(id) if id < pool.threads() => Ok((id, true)),
            QueueId::Id(_) => Err(DispatchError::InvalidQueueId),
            QueueId::Same if allow_same => context::current_queue_for(self.id)
                .map(|id| (id, true))
                .ok_or(DispatchError::InvalidQueueId),
            QueueId::Same | QueueId::All => Err(DispatchError::InvalidQueueId),
        }
    }

    /// Push onto the record's assigned queue. A terminate sneaking in
    /// between admission and the push would strand the record in a queue
    /// nobody serves anymore, so re-check and sweep afterwards.
    fn enqueue(&self, pool: &WorkerPool, task: TaskRef) -> Result<()> {
        let queue = pool.queue(task.queue_id()).expect("queue id validated");
        queue.stats.on_posted(task.priority);
        let priority = task.priority;
        queue.enqueue(task, priority);

        if self.shared.is_shutdown() {
            for stranded in pool.drain_all_tasks() {
                cancel_task(&stranded);
            }
            return Err(DispatchError::Terminated);
        }
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.coro_pool.total_size() == 0 && self.io_pool.total_size() == 0
    }

    fn next_id(&self) -> TaskId {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    fn priority(high: bool) -> Priority {
        if high { Priority::High } else { Priority::Normal }
    }

    fn pool_size(pool: &WorkerPool, queue: QueueId) -> Result<usize> {
        match queue {
            QueueId::All => Ok(pool.total_size()),
            QueueId::Id(id) => pool
                .queue(id)
                .map(|q| q.size())
                .ok_or(DispatchError::InvalidQueueId),
            QueueId::Any | QueueId::Same => Err(DispatchError::InvalidQueueId),
        }
    }

    fn pool_stats(pool: &WorkerPool, queue: QueueId) -> Result<QueueStatistics> {
        match queue {
            QueueId::All => {
                let mut total = QueueStatistics::default();
                for q in pool.queues() {
                    total.merge(&q.stats.snapshot(q.size()));
                }
                Ok(total)
            }
            QueueId::Id(id) => pool
                .queue(id)
                .map(|q| q.stats.snapshot(q.size()))
                .ok_or(DispatchError::InvalidQueueId),
            QueueId::Any | QueueId::Same => Err(DispatchError::InvalidQueueId),
        }
    }
}

impl fmt::Debug for DispatcherCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherCore")
            .field("id", &self.id)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
