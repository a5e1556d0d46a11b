use crate::task::Priority;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Live counters for one queue. Written by the owning worker and the
/// admitting thread; readers take best-effort snapshots.
#[derive(Debug, Default)]
pub(crate) struct QueueStats {
    posted: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
    high_priority: AtomicU64,
    latency_ns: AtomicU64,
    latency_samples: AtomicU64,
}

impl QueueStats {
    pub(crate) fn on_posted(&self, priority: Priority) {
        self.posted.fetch_add(1, Ordering::Relaxed);
        if priority == Priority::High {
            self.high_priority.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Sample the post-to-first-run latency, once per task.
    pub(crate) fn on_started(&self, latency: Duration) {
        self.latency_ns
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_completed(&self, errored: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if errored {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn reset(&self) {
        self.posted.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.high_priority.store(0, Ordering::Relaxed);
        self.latency_ns.store(0, Ordering::Relaxed);
        self.latency_samples.store(0, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, queued: usize) -> QueueStatistics {
        QueueStatistics {
            posted: self.posted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            high_priority: self.high_priority.load(Ordering::Relaxed),
            queued,
            latency_ns: self.latency_ns.load(Ordering::Relaxed),
            latency_samples: self.latency_samples.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters for a single queue, or a sum over queues when
/// queried with `QueueId::All` / `QueueType::All`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatistics {
    /// Tasks admitted to the queue, including continuation links.
    pub posted: u64,
    /// Tasks run to completion (cancellations excluded).
    pub completed: u64,
    /// Completed tasks whose promise holds an error.
    pub errors: u64,
    /// Admissions flagged high priority.
    pub high_priority: u64,
    /// Tasks queued, waiting or running at snapshot time.
    pub queued: usize,
    latency_ns: u64,
    latency_samples: u64,
}

impl QueueStatistics {
    /// Mean post-to-first-run latency over the sampled tasks.
    pub fn avg_latency(&self) -> Duration {
        if self.latency_samples == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.latency_ns / self.latency_samples)
        }
    }

    pub(crate) fn merge(&mut self, other: &QueueStatistics) {
        self.posted += other.posted;
        self.completed += other.completed;
        self.errors += other.errors;
        self.high_priority += other.high_priority;
        self.queued += other.queued;
        self.latency_ns += other.latency_ns;
        self.latency_samples += other.latency_samples;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_reset() {
        let stats = QueueStats::default();
        stats.on_posted(Priority::Normal);
        stats.on_posted(Priority::High);
        stats.on_started(Duration::from_micros(10));
        stats.on_completed(false);
        stats.on_completed(true);

        let snap = stats.snapshot(3);
        assert_eq!(snap.posted, 2);
        assert_eq!(snap.high_priority, 1);
        assert_eq!(snap.completed, 2);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.queued, 3);
        assert_eq!(snap.avg_latency(), Duration::from_micros(10));

        stats.reset();
        assert_eq!(stats.snapshot(0), QueueStatistics::default());
    }

    #[test]
    fn test_merge_aggregates() {
        let a = QueueStats::default();
        let b = QueueStats::default();
        a.on_posted(Priority::Normal);
        a.on_started(Duration::from_micros(4));
        b.on_posted(Priority::High);
        b.on_started(Duration::from_micros(8));

        let mut total = a.snapshot(1);
        total.merge(&b.snapshot(2));

        assert_eq!(total.posted, 2);
        assert_eq!(total.queued, 3);
        assert_eq!(total.avg_latency(), Duration::from_micros(6));
    }
}
