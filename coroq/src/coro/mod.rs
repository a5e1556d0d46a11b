use generator::{Generator, Gn};
use std::any::Any;

/// Default stack handed to each coroutine. Deep call chains belong on the
/// IO pool, so a few hundred KiB is plenty.
pub(crate) const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Outcome of a single resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CoroState {
    /// The coroutine yielded and can be resumed again.
    Suspended,
    /// The coroutine returned; it must not be resumed again.
    Terminated,
}

/// Stackful user-space context. Runs `body` on its own stack; `resume`
/// returns when the body next calls [`yield_to_worker`] or returns.
///
/// Dropping a suspended coroutine unwinds its stack through the generator
/// cancellation protocol, running destructors of everything still live on
/// it.
pub(crate) struct Coroutine {
    inner: Generator<'static, (), ()>,
}

impl Coroutine {
    pub(crate) fn new<F>(stack_size: usize, body: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            inner: Gn::new_opt(stack_size, move || body()),
        }
    }

    pub(crate) fn resume(&mut self) -> CoroState {
        debug_assert!(!self.inner.is_done(), "resumed a terminated coroutine");
        let _ = self.inner.resume();
        if self.inner.is_done() {
            CoroState::Terminated
        } else {
            CoroState::Suspended
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.inner.is_done()
    }
}

// Safety: a coroutine is resumed by at most one worker at a time and only
// moves between threads while suspended; its stack lives on the heap.
unsafe impl Send for Coroutine {}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("terminated", &self.inner.is_done())
            .finish()
    }
}

/// Suspend the current coroutine and hand control back to the worker loop.
/// Must only be called from inside a coroutine body.
pub(crate) fn yield_to_worker() {
    generator::yield_with(());
}

/// True when an unwind payload belongs to the generator cancellation
/// protocol rather than a user panic. Such payloads must be re-raised so a
/// dropped coroutine can finish tearing down its stack.
pub(crate) fn is_cancel_unwind(payload: &(dyn Any + Send)) -> bool {
    matches!(
        payload.downcast_ref::<generator::Error>(),
        Some(generator::Error::Cancel)
    )
}
