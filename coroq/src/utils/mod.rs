pub(crate) mod thread;

/// Hardware cores available to this process; 1 when the query fails.
pub(crate) fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
