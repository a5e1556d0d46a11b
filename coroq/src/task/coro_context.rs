use crate::coro;
use crate::error::{DispatchError, PANIC_STATUS, Result};
use crate::runtime::QueueId;
use crate::runtime::context;
use crate::runtime::dispatcher::DispatcherCore;
use crate::task::promise::{ErasedPromise, PromiseCore, Waiter};
use crate::task::record::{SuspendReason, SuspendSignal};
use crate::task::{ChainHandle, JoinHandle, Promise, TaskFuture};
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

/// Capability handle passed to every coroutine callable.
///
/// Through it the coroutine publishes its result, yields, parks on futures
/// without blocking its worker, reads its chain predecessor's value and
/// submits further work (including onto its own queue with
/// [`QueueId::Same`]).
///
/// The handle never leaves the coroutine's stack.
pub struct CoroContext<T> {
    core: Arc<PromiseCore<T>>,
    prev: Option<ErasedPromise>,
    dispatcher: Weak<DispatcherCore>,
    signal: Arc<SuspendSignal>,
    // Pins the handle to the coroutine that received it.
    _not_send: PhantomData<*mut ()>,
}

impl<T: Send + 'static> CoroContext<T> {
    pub(crate) fn new(
        core: Arc<PromiseCore<T>>,
        prev: Option<ErasedPromise>,
        dispatcher: Weak<DispatcherCore>,
        signal: Arc<SuspendSignal>,
    ) -> Self {
        Self {
            core,
            prev,
            dispatcher,
            signal,
            _not_send: PhantomData,
        }
    }

    /// Publish this task's result. Write-once: a second write fails.
    pub fn set(&self, value: T) -> Result<()> {
        if self.core.fulfill(Ok(value)) {
            Ok(())
        } else {
            Err(DispatchError::Unsupported("promise already fulfilled"))
        }
    }

    /// Hand control back to the worker; the task is requeued behind its
    /// priority peers and resumed on a later pass.
    pub fn yield_now(&self) {
        self.signal.set(SuspendReason::Yielded);
        coro::yield_to_worker();
    }

    /// Park this coroutine until `future` is fulfilled. The worker is free
    /// to run other tasks in the meantime.
    pub fn wait<U: Clone + Send + 'static>(&self, future: &TaskFuture<U>) -> Result<U> {
        loop {
            if let Some(value) = future.try_get() {
                return value;
            }

            let current = context::current()
                .ok_or(DispatchError::Unsupported("wait outside a running coroutine"))?;

            if future.core().add_waiter(Waiter {
                task: current.task,
                queue: current.queue,
            }) {
                self.signal.set(SuspendReason::Waiting);
                coro::yield_to_worker();
            }
            // Registration lost the race with fulfillment; the next
            // iteration picks the value up without parking.
        }
    }

    /// Park on another task posted to this dispatcher.
    pub fn join<U: Clone + Send + 'static>(&self, handle: &JoinHandle<U>) -> Result<U> {
        self.wait(&handle.future())
    }

    /// Value published by the predecessor in a continuation chain, or None
    /// outside a chain (or under a mismatched type).
    pub fn prev<U: Clone + Send + 'static>(&self) -> Option<Result<U>> {
        let prev = Arc::clone(self.prev.as_ref()?);
        prev.downcast::<PromiseCore<U>>().ok()?.try_get()
    }

    /// Post a coroutine on any queue of this dispatcher.
    pub fn post<U, F>(&self, f: F) -> Result<JoinHandle<U>>
    where
        U: Send + 'static,
        F: FnOnce(CoroContext<U>) -> i32 + Send + 'static,
    {
        self.dispatcher()?.post_coroutine(QueueId::Any, false, f)
    }

    /// Post a coroutine on a specific queue; [`QueueId::Same`] targets the
    /// queue this coroutine is running on.
    pub fn post_to<U, F>(&self, queue: QueueId, high_priority: bool, f: F) -> Result<JoinHandle<U>>
    where
        U: Send + 'static,
        F: FnOnce(CoroContext<U>) -> i32 + Send + 'static,
    {
        self.dispatcher()?.post_coroutine(queue, high_priority, f)
    }

    /// Start a continuation chain from inside a coroutine.
    pub fn post_first<U, F>(&self, f: F) -> Result<ChainHandle<U>>
    where
        U: Send + 'static,
        F: FnOnce(CoroContext<U>) -> i32 + Send + 'static,
    {
        self.dispatcher()?.post_first(QueueId::Any, false, f)
    }

    /// Offload blocking work to the IO pool.
    pub fn post_io<U, F>(&self, f: F) -> Result<JoinHandle<U>>
    where
        U: Send + 'static,
        F: FnOnce(Promise<U>) -> i32 + Send + 'static,
    {
        self.dispatcher()?.post_io(QueueId::Any, false, f)
    }

    fn dispatcher(&self) -> Result<Arc<DispatcherCore>> {
        self.dispatcher.upgrade().ok_or(DispatchError::Terminated)
    }
}

impl<T> fmt::Debug for CoroContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroContext").finish_non_exhaustive()
    }
}

/// Body of every coroutine task: build the context, run the user callable,
/// publish the outcome. Runs on the coroutine's own stack.
pub(crate) fn run_coroutine_entry<T, F>(
    core: Arc<PromiseCore<T>>,
    prev: Option<ErasedPromise>,
    dispatcher: Weak<DispatcherCore>,
    signal: Arc<SuspendSignal>,
    f: F,
) where
    T: Send + 'static,
    F: FnOnce(CoroContext<T>) -> i32 + Send + 'static,
{
    let ctx = CoroContext::new(Arc::clone(&core), prev, dispatcher, signal);

    match panic::catch_unwind(AssertUnwindSafe(move || f(ctx))) {
        Ok(code) => {
            // Nonzero status, or a clean return that never published: the
            // promise must still fulfill (first write wins).
            if code != 0 || !core.is_fulfilled() {
                let _ = core.fulfill(Err(DispatchError::UserError(code)));
            }
        }
        Err(payload) => {
            if coro::is_cancel_unwind(payload.as_ref()) {
                // The record is being dropped mid-suspend; let the stack
                // teardown continue.
                panic::resume_unwind(payload);
            }
            tracing::warn!("coroutine task panicked");
            let _ = core.fulfill(Err(DispatchError::UserError(PANIC_STATUS)));
        }
    }
}

/// Body of every IO task; same publishing contract, no coroutine.
pub(crate) fn run_io_entry<T, F>(core: Arc<PromiseCore<T>>, f: F)
where
    T: Send + 'static,
    F: FnOnce(Promise<T>) -> i32 + Send + 'static,
{
    let promise = Promise::from_core(Arc::clone(&core));

    match panic::catch_unwind(AssertUnwindSafe(move || f(promise))) {
        Ok(code) => {
            if code != 0 || !core.is_fulfilled() {
                let _ = core.fulfill(Err(DispatchError::UserError(code)));
            }
        }
        Err(_) => {
            tracing::warn!("io task panicked");
            let _ = core.fulfill(Err(DispatchError::UserError(PANIC_STATUS)));
        }
    }
}
