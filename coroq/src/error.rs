/// Status code recorded when a user callable panics instead of returning.
pub(crate) const PANIC_STATUS: i32 = -1;

/// Everything the dispatcher or one of its task handles can report.
///
/// Submission errors (`InvalidQueueId`, `Terminated`, `Draining`,
/// `Unsupported`) are returned synchronously; `Cancelled` and `UserError`
/// surface through the task's promise.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// Queue id out of range, or a sentinel used where it is not valid.
    #[error("invalid queue id")]
    InvalidQueueId,

    /// The dispatcher has been terminated; no further submissions.
    #[error("dispatcher is terminated")]
    Terminated,

    /// External submissions are disabled while a drain is in progress.
    /// Tasks posted from within a running coroutine are still admitted.
    #[error("dispatcher is draining")]
    Draining,

    /// The task was aborted by `terminate` before it could complete.
    #[error("task was cancelled")]
    Cancelled,

    /// The user callable signaled failure, either with a nonzero status
    /// code or by panicking (recorded as status -1). A callable that
    /// returns 0 without publishing a value also lands here with code 0.
    #[error("user callable failed with status {0}")]
    UserError(i32),

    /// The operation is outside what this component supports, e.g.
    /// multi-slot allocation or an IO submission with no IO pool.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl DispatchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DispatchError::Cancelled)
    }

    pub fn is_user_error(&self) -> bool {
        matches!(self, DispatchError::UserError(_))
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(DispatchError: Send, Sync, Clone, std::error::Error);

    #[test]
    fn test_display_messages() {
        assert_eq!(
            DispatchError::UserError(7).to_string(),
            "user callable failed with status 7"
        );
        assert!(DispatchError::Cancelled.is_cancelled());
        assert!(!DispatchError::Terminated.is_cancelled());
    }
}
