use crate::runtime::queue::RunQueue;
use crate::task::record::TaskRef;
use std::cell::RefCell;
use std::sync::Arc;

/// The task a worker thread is currently resuming. Installed around each
/// resume so code running inside the coroutine can resolve
/// `QueueId::Same`, register future waiters, and pass the drain gate.
///
/// Keyed by dispatcher id: several dispatchers may coexist in a process,
/// and a worker of one must never observe another's context.
pub(crate) struct CurrentTask {
    pub(crate) dispatcher_id: u64,
    pub(crate) queue_id: usize,
    pub(crate) task: TaskRef,
    pub(crate) queue: Arc<RunQueue>,
}

impl Clone for CurrentTask {
    fn clone(&self) -> Self {
        Self {
            dispatcher_id: self.dispatcher_id,
            queue_id: self.queue_id,
            task: self.task.clone(),
            queue: Arc::clone(&self.queue),
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<CurrentTask>> = const { RefCell::new(None) };
}

pub(crate) fn current() -> Option<CurrentTask> {
    CURRENT.with(|current| current.borrow().clone())
}

pub(crate) fn current_dispatcher() -> Option<u64> {
    CURRENT.with(|current| current.borrow().as_ref().map(|c| c.dispatcher_id))
}

/// Queue of the running coroutine, if it belongs to `dispatcher_id`.
pub(crate) fn current_queue_for(dispatcher_id: u64) -> Option<usize> {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .filter(|c| c.dispatcher_id == dispatcher_id)
            .map(|c| c.queue_id)
    })
}

/// Install `current` for the duration of one resume; the guard restores
/// the empty slot on drop, panic paths included.
pub(crate) fn enter(current: CurrentTask) -> CurrentTaskGuard {
    CURRENT.with(|slot| {
        let prev = slot.borrow_mut().replace(current);
        debug_assert!(prev.is_none(), "nested task context");
    });
    CurrentTaskGuard
}

pub(crate) struct CurrentTaskGuard;

impl Drop for CurrentTaskGuard {
    fn drop(&mut self) {
        CURRENT.with(|slot| {
            slot.borrow_mut().take();
        });
    }
}
