use crate::alloc::SlabAllocator;
use crate::coro::Coroutine;
use crate::runtime::dispatcher::DispatcherCore;
use crate::task::coro_context::{CoroContext, run_coroutine_entry, run_io_entry};
use crate::task::promise::{ErasedPromise, PromiseCore, ResultSink};
use crate::task::{Priority, TaskId, TaskKind, TaskState};
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Backing store for task records: 1000 slots, indexed by the narrowest
/// integer that can address them. Overflow spills to the heap inside the
/// same allocator.
pub(crate) const TASK_POOL_SIZE: usize = 1000;

pub(crate) type TaskSlab = SlabAllocator<TaskRecord, TASK_POOL_SIZE, u16>;

/// Reason a coroutine handed control back to its worker. Written by the
/// coroutine body right before yielding, consumed by the worker right
/// after the resume returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SuspendReason {
    /// Voluntary yield; requeue behind peers of the same priority.
    Yielded,
    /// Parked on a future; stays off the queue until unparked.
    Waiting,
}

#[derive(Default)]
pub(crate) struct SuspendSignal {
    reason: AtomicU8,
}

impl SuspendSignal {
    pub(crate) fn set(&self, reason: SuspendReason) {
        let v = match reason {
            SuspendReason::Yielded => 1,
            SuspendReason::Waiting => 2,
        };
        self.reason.store(v, Ordering::Release);
    }

    pub(crate) fn take(&self) -> Option<SuspendReason> {
        match self.reason.swap(0, Ordering::AcqRel) {
            1 => Some(SuspendReason::Yielded),
            2 => Some(SuspendReason::Waiting),
            _ => None,
        }
    }
}

/// A coroutine task's execution slot. The entry closure stays boxed until
/// the first resume so records for never-started tasks are cheap to cancel.
pub(crate) enum CoroSlot {
    Unspawned {
        entry: Box<dyn FnOnce() + Send + 'static>,
        stack_size: usize,
    },
    Spawned(Coroutine),
    Done,
}

pub(crate) enum TaskBody {
    Coro(CoroSlot),
    Io(Option<Box<dyn FnOnce() + Send + 'static>>),
}

struct ChainLink {
    next: Option<TaskRef>,
    done: bool,
}

pub(crate) enum LinkOutcome {
    /// Successor stored; the completing worker will enqueue it.
    Linked,
    /// Predecessor already completed; the caller must enqueue now.
    PredecessorDone,
}

/// One unit of work owned by the dispatcher. Records live in the task
/// slab and are reference counted by [`TaskRef`]; a record is released
/// only once it is terminal and the last handle is gone.
pub(crate) struct TaskRecord {
    pub(crate) id: TaskId,
    pub(crate) kind: TaskKind,
    pub(crate) priority: Priority,
    /// False only for `Any` submissions; pinned records are never stolen.
    pub(crate) pinned: bool,
    pub(crate) posted_at: Instant,
    pub(crate) signal: Arc<SuspendSignal>,
    pub(crate) sink: Arc<dyn ResultSink>,

    /// Queue the record is currently assigned to. Rewritten when an
    /// `Any` record is stolen or a chain successor follows its
    /// predecessor.
    queue_id: AtomicUsize,
    state: AtomicU8,
    refs: AtomicUsize,
    /// A wakeup arrived before the owning worker managed to park us.
    notified: AtomicBool,
    started: AtomicBool,
    chain: Mutex<ChainLink>,
    /// Only the worker currently running the record touches the body.
    body: UnsafeCell<TaskBody>,
}

impl TaskRecord {
    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, next: TaskState) {
        debug_assert!(
            self.state().may_transition(next),
            "illegal task transition {:?} -> {:?}",
            self.state(),
            next
        );
        self.state.store(next as u8, Ordering::Release);
    }

    pub(crate) fn queue_id(&self) -> usize {
        self.queue_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_queue_id(&self, id: usize) {
        self.queue_id.store(id, Ordering::Release);
    }

    pub(crate) fn set_notified(&self) {
        self.notified.store(true, Ordering::Release);
    }

    pub(crate) fn take_notified(&self) -> bool {
        self.notified.swap(false, Ordering::AcqRel)
    }

    /// True exactly once, on the first call; drives the latency sample.
    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    /// Append a successor to the continuation chain.
    pub(crate) fn link_successor(&self, next: TaskRef) -> LinkOutcome {
        let mut chain = self.chain.lock();
        if chain.done {
            LinkOutcome::PredecessorDone
        } else {
            debug_assert!(chain.next.is_none(), "chain successor relinked");
            chain.next = Some(next);
            LinkOutcome::Linked
        }
    }

    /// Mark the chain link completed and detach the successor, if any.
    /// Called by the completing worker exactly once.
    pub(crate) fn take_successor(&self) -> Option<TaskRef> {
        let mut chain = self.chain.lock();
        chain.done = true;
        chain.next.take()
    }

    /// Release the execution body early. On cancellation this unwinds a
    /// suspended coroutine stack right away, so anything it captured (for
    /// instance the future it was parked on) does not linger until the
    /// record itself dies.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive ownership of the body: no worker may
    /// be running the record.
    pub(crate) unsafe fn drop_body(&self) {
        let body = unsafe { &mut *self.body.get() };
        match body {
            TaskBody::Coro(slot) => *slot = CoroSlot::Done,
            TaskBody::Io(io) => *io = None,
        }
    }
}

impl fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRecord")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("priority", &self.priority)
            .field("queue", &self.queue_id())
            .finish()
    }
}

/// Reference-counted pointer to a slab-allocated [`TaskRecord`]. The last
/// clone to drop disposes the record back into its slab.
pub(crate) struct TaskRef {
    ptr: NonNull<TaskRecord>,
    slab: Arc<TaskSlab>,
}

// Safety: the record's shared fields are atomics, locks or Arcs; the
// UnsafeCell body is only touched by the worker that dequeued the record.
unsafe impl Send for TaskRef {}
unsafe impl Sync for TaskRef {}

impl TaskRef {
    fn new(slab: Arc<TaskSlab>, record: TaskRecord) -> Self {
        let ptr = slab.create(record);
        Self { ptr, slab }
    }

    /// Exclusive access to the execution body.
    ///
    /// # Safety
    ///
    /// Only the worker that currently owns the record (between dequeue and
    /// requeue/park/release) may call this, and never reentrantly.
    pub(crate) unsafe fn body_mut(&self) -> &mut TaskBody {
        unsafe { &mut *(*self.ptr.as_ptr()).body.get() }
    }
}

impl Deref for TaskRef {
    type Target = TaskRecord;

    fn deref(&self) -> &TaskRecord {
        // Safety: the refcount keeps the record alive while any TaskRef
        // exists.
        unsafe { self.ptr.as_ref() }
    }
}

impl Clone for TaskRef {
    fn clone(&self) -> Self {
        self.refs.fetch_add(1, Ordering::Relaxed);
        Self {
            ptr: self.ptr,
            slab: Arc::clone(&self.slab),
        }
    }
}

impl Drop for TaskRef {
    fn drop(&mut self) {
        if self.refs.fetch_sub(1, Ordering::Release) == 1 {
            std::sync::atomic::fence(Ordering::Acquire);
            // Safety: last reference; nothing can reach the record anymore.
            unsafe { self.slab.dispose(self.ptr) };
        }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.deref(), f)
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn new_coroutine_record<T, F>(
    slab: &Arc<TaskSlab>,
    id: TaskId,
    priority: Priority,
    queue_id: usize,
    pinned: bool,
    stack_size: usize,
    core: Arc<PromiseCore<T>>,
    prev: Option<ErasedPromise>,
    dispatcher: Weak<DispatcherCore>,
    f: F,
) -> TaskRef
where
    T: Send + 'static,
    F: FnOnce(CoroContext<T>) -> i32 + Send + 'static,
{
    let signal = Arc::new(SuspendSignal::default());

    let entry: Box<dyn FnOnce() + Send + 'static> = {
        let core = Arc::clone(&core);
        let signal = Arc::clone(&signal);
        Box::new(move || run_coroutine_entry(core, prev, dispatcher, signal, f))
    };

    let record = TaskRecord {
        id,
        kind: TaskKind::Coroutine,
        priority,
        pinned,
        posted_at: Instant::now(),
        signal,
        sink: core,
        queue_id: AtomicUsize::new(queue_id),
        state: AtomicU8::new(TaskState::Pending as u8),
        refs: AtomicUsize::new(1),
        notified: AtomicBool::new(false),
        started: AtomicBool::new(false),
        chain: Mutex::new(ChainLink {
            next: None,
            done: false,
        }),
        body: UnsafeCell::new(TaskBody::Coro(CoroSlot::Unspawned {
            entry,
            stack_size,
        })),
    };

    TaskRef::new(Arc::clone(slab), record)
}

pub(crate) fn new_io_record<T, F>(
    slab: &Arc<TaskSlab>,
    id: TaskId,
    priority: Priority,
    queue_id: usize,
    pinned: bool,
    core: Arc<PromiseCore<T>>,
    f: F,
) -> TaskRef
where
    T: Send + 'static,
    F: FnOnce(crate::task::Promise<T>) -> i32 + Send + 'static,
{
    let body: Box<dyn FnOnce() + Send + 'static> = {
        let core = Arc::clone(&core);
        Box::new(move || run_io_entry(core, f))
    };

    let record = TaskRecord {
        id,
        kind: TaskKind::Io,
        priority,
        pinned,
        posted_at: Instant::now(),
        signal: Arc::new(SuspendSignal::default()),
        sink: core,
        queue_id: AtomicUsize::new(queue_id),
        state: AtomicU8::new(TaskState::Pending as u8),
        refs: AtomicUsize::new(1),
        notified: AtomicBool::new(false),
        started: AtomicBool::new(false),
        chain: Mutex::new(ChainLink {
            next: None,
            done: false,
        }),
        body: UnsafeCell::new(TaskBody::Io(Some(body))),
    };

    TaskRef::new(Arc::clone(slab), record)
}

/// Minimal record for queue and worker tests: an IO body that bumps a
/// counter when run.
#[cfg(test)]
pub(crate) fn test_record(
    slab: &Arc<TaskSlab>,
    id: TaskId,
    priority: Priority,
    queue_id: usize,
    pinned: bool,
) -> (TaskRef, crate::task::TaskFuture<i32>) {
    let core = PromiseCore::new();
    let task = new_io_record(slab, id, priority, queue_id, pinned, Arc::clone(&core), |p| {
        let _ = p.set(1);
        0
    });
    (task, crate::task::TaskFuture::from_core(core))
}

/// Fulfill the record's promise with `Cancelled` and flip its state.
/// Cancellation walks down the continuation chain: successors that were
/// never enqueued are reachable from nowhere else.
///
/// The caller must own the record exclusively (it was pulled off a queue,
/// or its worker is the caller), so dropping the body here is sound.
pub(crate) fn cancel_task(task: &TaskRef) {
    let mut next = Some(task.clone());
    while let Some(task) = next {
        if !task.state().is_terminal() {
            task.set_state(TaskState::Cancelled);
        }
        task.sink.cancel();
        // Safety: exclusive ownership per this function's contract; chain
        // successors were never handed to any queue or worker.
        unsafe { task.drop_body() };
        next = task.take_successor();
    }
}
