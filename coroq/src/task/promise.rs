use crate::error::{DispatchError, Result};
use crate::runtime::queue::RunQueue;
use crate::task::record::TaskRef;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Type-erased promise reference, used to hand a continuation access to
/// its predecessor's result without threading the predecessor's type
/// through the chain.
pub(crate) type ErasedPromise = Arc<dyn Any + Send + Sync>;

/// A task parked on a future, together with the queue that must unpark it.
/// The future does not own the waiting task; the entry is a lookup handle.
pub(crate) struct Waiter {
    pub(crate) task: TaskRef,
    pub(crate) queue: Arc<RunQueue>,
}

struct Inner<T> {
    value: Option<Result<T>>,
    waiters: SmallVec<[Waiter; 2]>,
}

/// Write-once result channel shared by a task record, its caller-visible
/// handles, and any coroutines parked on it. External readers block on the
/// condvar; coroutine readers register a [`Waiter`] and yield.
pub(crate) struct PromiseCore<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
}

impl<T: Send + 'static> PromiseCore<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                value: None,
                waiters: SmallVec::new(),
            }),
            ready: Condvar::new(),
        })
    }

    /// First write wins; returns false when a value was already published.
    /// Wakes every blocked reader and unparks every registered waiter.
    pub(crate) fn fulfill(&self, value: Result<T>) -> bool {
        let waiters = {
            let mut inner = self.inner.lock();
            if inner.value.is_some() {
                return false;
            }
            inner.value = Some(value);
            std::mem::take(&mut inner.waiters)
        };

        self.ready.notify_all();
        for waiter in waiters {
            // Mark first so an unpark racing the park itself is not lost.
            waiter.task.set_notified();
            waiter.queue.unpark(&waiter.task);
        }
        true
    }

    pub(crate) fn is_fulfilled(&self) -> bool {
        self.inner.lock().value.is_some()
    }

    /// Register a coroutine waiter. Returns false (dropping the entry) when
    /// the value is already available, in which case the caller must not
    /// park.
    pub(crate) fn add_waiter(&self, waiter: Waiter) -> bool {
        let mut inner = self.inner.lock();
        if inner.value.is_some() {
            return false;
        }
        inner.waiters.push(waiter);
        true
    }
}

impl<T: Clone + Send + 'static> PromiseCore<T> {
    pub(crate) fn try_get(&self) -> Option<Result<T>> {
        self.inner.lock().value.clone()
    }

    pub(crate) fn wait(&self) -> Result<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(value) = &inner.value {
                return value.clone();
            }
            self.ready.wait(&mut inner);
        }
    }

    pub(crate) fn wait_for(&self, timeout: Duration) -> Option<Result<T>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.value.is_none() {
            if self.ready.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        inner.value.clone()
    }
}

/// Cancellation interface the dispatcher uses on records without knowing
/// their result type.
pub(crate) trait ResultSink: Send + Sync {
    /// Fulfill with `Cancelled` unless a value was already published.
    fn cancel(&self);

    fn is_fulfilled(&self) -> bool;

    /// True when the published value is an error.
    fn is_error(&self) -> bool;
}

impl<T: Send + 'static> ResultSink for PromiseCore<T> {
    fn cancel(&self) {
        let _ = self.fulfill(Err(DispatchError::Cancelled));
    }

    fn is_fulfilled(&self) -> bool {
        PromiseCore::is_fulfilled(self)
    }

    fn is_error(&self) -> bool {
        self.inner
            .lock()
            .value
            .as_ref()
            .is_some_and(|value| value.is_err())
    }
}

/// Setter half of a standalone result channel. Useful as an external gate
/// that running coroutines can wait on through [`TaskFuture`].
pub struct Promise<T> {
    core: Arc<PromiseCore<T>>,
}

impl<T: Send + 'static> Promise<T> {
    pub fn new() -> Self {
        Self {
            core: PromiseCore::new(),
        }
    }

    pub(crate) fn from_core(core: Arc<PromiseCore<T>>) -> Self {
        Self { core }
    }

    /// Publish the value. Write-once: a second write fails.
    pub fn set(&self, value: T) -> Result<()> {
        if self.core.fulfill(Ok(value)) {
            Ok(())
        } else {
            Err(DispatchError::Unsupported("promise already fulfilled"))
        }
    }

    /// Publish a failure with the given user status code.
    pub fn set_error(&self, code: i32) -> Result<()> {
        if self.core.fulfill(Err(DispatchError::UserError(code))) {
            Ok(())
        } else {
            Err(DispatchError::Unsupported("promise already fulfilled"))
        }
    }

    pub fn future(&self) -> TaskFuture<T> {
        TaskFuture {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

/// Waitable read half of a result channel. Cloneable; every clone observes
/// the same write-once value.
pub struct TaskFuture<T> {
    core: Arc<PromiseCore<T>>,
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Send + 'static> TaskFuture<T> {
    pub(crate) fn from_core(core: Arc<PromiseCore<T>>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<PromiseCore<T>> {
        &self.core
    }

    pub fn is_ready(&self) -> bool {
        self.core.is_fulfilled()
    }
}

impl<T: Clone + Send + 'static> TaskFuture<T> {
    pub fn try_get(&self) -> Option<Result<T>> {
        self.core.try_get()
    }

    /// Block the calling thread until the value is published. From inside a
    /// coroutine use [`CoroContext::wait`] instead, which parks the
    /// coroutine without blocking its worker.
    ///
    /// [`CoroContext::wait`]: crate::CoroContext::wait
    pub fn wait(&self) -> Result<T> {
        self.core.wait()
    }

    pub fn wait_for(&self, timeout: Duration) -> Option<Result<T>> {
        self.core.wait_for(timeout)
    }
}

impl<T> fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::time::Instant;

    assert_impl_all!(Promise<i32>: Send, Sync);
    assert_impl_all!(TaskFuture<String>: Send, Sync, Clone);

    #[test]
    fn test_write_once() {
        let promise = Promise::new();
        let future = promise.future();

        assert!(!future.is_ready());
        promise.set(42).unwrap();
        assert!(matches!(
            promise.set(43),
            Err(DispatchError::Unsupported(_))
        ));
        assert_eq!(future.try_get(), Some(Ok(42)));
    }

    #[test]
    fn test_error_value() {
        let promise = Promise::<()>::new();
        promise.set_error(9).unwrap();
        assert_eq!(
            promise.future().try_get(),
            Some(Err(DispatchError::UserError(9)))
        );
    }

    #[test]
    fn test_cancel_respects_existing_value() {
        let promise = Promise::new();
        promise.set("done").unwrap();
        promise.core.cancel();
        assert_eq!(promise.future().try_get(), Some(Ok("done")));
        assert!(!promise.core.is_error());
    }

    #[test]
    fn test_blocking_wait_across_threads() {
        let promise = Promise::new();
        let future = promise.future();

        let waiter = std::thread::spawn(move || future.wait());
        std::thread::sleep(Duration::from_millis(20));
        promise.set(7u64).unwrap();

        assert_eq!(waiter.join().unwrap(), Ok(7));
    }

    #[test]
    fn test_wait_for_times_out() {
        let promise = Promise::<i32>::new();
        let future = promise.future();

        let start = Instant::now();
        assert!(future.wait_for(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
