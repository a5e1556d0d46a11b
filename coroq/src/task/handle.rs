use crate::error::{DispatchError, Result};
use crate::runtime::dispatcher::DispatcherCore;
use crate::task::promise::PromiseCore;
use crate::task::record::TaskRef;
use crate::task::{CoroContext, TaskFuture};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Caller-visible handle to a submitted task.
///
/// The handle's lifetime is independent of the task's completion: the
/// underlying record is not released until it is terminal *and* every
/// handle is gone. Dropping the handle detaches the task; it keeps
/// running.
pub struct JoinHandle<T> {
    pub(crate) task: TaskRef,
    pub(crate) core: Arc<PromiseCore<T>>,
}

impl<T: Send + 'static> JoinHandle<T> {
    pub(crate) fn new(task: TaskRef, core: Arc<PromiseCore<T>>) -> Self {
        Self { task, core }
    }

    /// Read side of the task's result channel.
    pub fn future(&self) -> TaskFuture<T> {
        TaskFuture::from_core(Arc::clone(&self.core))
    }

    /// True once the task is Completed or Cancelled.
    pub fn is_finished(&self) -> bool {
        self.task.state().is_terminal()
    }

    pub fn task_id(&self) -> u64 {
        self.task.id
    }
}

impl<T: Clone + Send + 'static> JoinHandle<T> {
    pub fn try_get(&self) -> Option<Result<T>> {
        self.core.try_get()
    }

    /// Block the calling thread until the result is published. From inside
    /// a coroutine use [`CoroContext::join`] instead.
    pub fn wait(&self) -> Result<T> {
        self.core.wait()
    }

    pub fn wait_for(&self, timeout: Duration) -> Option<Result<T>> {
        self.core.wait_for(timeout)
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("task", &*self.task)
            .finish()
    }
}

/// Handle returned by `post_first`: a [`JoinHandle`] that additionally
/// permits appending continuations which run sequentially on the head's
/// queue.
pub struct ChainHandle<T> {
    handle: JoinHandle<T>,
    dispatcher: Weak<DispatcherCore>,
}

impl<T: Send + 'static> ChainHandle<T> {
    pub(crate) fn new(handle: JoinHandle<T>, dispatcher: Weak<DispatcherCore>) -> Self {
        Self { handle, dispatcher }
    }

    /// Append a continuation. It becomes ready only once this link has
    /// completed, runs on the same queue, and can read this link's value
    /// through [`CoroContext::prev`].
    pub fn then<U, G>(self, g: G) -> Result<ChainHandle<U>>
    where
        U: Send + 'static,
        G: FnOnce(CoroContext<U>) -> i32 + Send + 'static,
    {
        let core = self.dispatcher.upgrade().ok_or(DispatchError::Terminated)?;
        let next = core.append_chain(&self.handle, g)?;
        Ok(ChainHandle::new(next, self.dispatcher))
    }

    pub fn handle(&self) -> &JoinHandle<T> {
        &self.handle
    }

    pub fn into_handle(self) -> JoinHandle<T> {
        self.handle
    }

    pub fn future(&self) -> TaskFuture<T> {
        self.handle.future()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T: Clone + Send + 'static> ChainHandle<T> {
    pub fn try_get(&self) -> Option<Result<T>> {
        self.handle.try_get()
    }

    pub fn wait(&self) -> Result<T> {
        self.handle.wait()
    }

    pub fn wait_for(&self, timeout: Duration) -> Option<Result<T>> {
        self.handle.wait_for(timeout)
    }
}

impl<T> fmt::Debug for ChainHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainHandle")
            .field("task", &*self.handle.task)
            .finish()
    }
}
