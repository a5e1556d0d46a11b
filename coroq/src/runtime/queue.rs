use crate::runtime::stats::QueueStats;
use crate::task::record::TaskRef;
use crate::task::{Priority, TaskId, TaskState};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

struct QueueInner {
    /// Drained before `normal`; high-priority submissions and unparked
    /// tasks push at the front so they run next.
    high: VecDeque<TaskRef>,
    normal: VecDeque<TaskRef>,
    /// Tasks parked on a future. Not ordered; unpark moves an entry to the
    /// high front of its own queue.
    waiting: HashMap<TaskId, TaskRef>,
}

/// Ready-task queue owned by one worker. Any thread may push; only the
/// owner (or a stealing peer, for unpinned heads) pops. No lock is ever
/// held across a task resume.
pub(crate) struct RunQueue {
    id: usize,
    inner: Mutex<QueueInner>,
    ready: Condvar,
    /// Tasks between dequeue and requeue/park/release, so `size` never
    /// under-reports while a task is being run.
    running: AtomicUsize,
    pub(crate) stats: QueueStats,
}

impl RunQueue {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            inner: Mutex::new(QueueInner {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                waiting: HashMap::new(),
            }),
            ready: Condvar::new(),
            running: AtomicUsize::new(0),
            stats: QueueStats::default(),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Append a ready task and wake the owner if it is parked.
    pub(crate) fn enqueue(&self, task: TaskRef, priority: Priority) {
        task.set_state(TaskState::Ready);
        {
            let mut inner = self.inner.lock();
            match priority {
                Priority::High => inner.high.push_front(task),
                Priority::Normal => inner.normal.push_back(task),
            }
        }
        self.ready.notify_one();
    }

    /// Pop the next ready task, high lane first, and account it as
    /// running. Never blocks.
    pub(crate) fn dequeue(&self) -> Option<TaskRef> {
        let mut inner = self.inner.lock();
        let task = inner.high.pop_front().or_else(|| inner.normal.pop_front())?;
        self.running.fetch_add(1, Ordering::Relaxed);
        Some(task)
    }

    /// Take the head of the normal lane for `thief`, provided the head is
    /// not pinned here. Bounded: only the head is examined. The record is
    /// reassigned and accounted as running on the thief before the victim
    /// lock drops, so neither queue transiently under-reports.
    pub(crate) fn steal_into(&self, thief: &RunQueue) -> Option<TaskRef> {
        let mut inner = self.inner.lock();
        match inner.normal.front() {
            Some(head) if !head.pinned => {
                let task = inner.normal.pop_front()?;
                task.set_queue_id(thief.id);
                thief.running.fetch_add(1, Ordering::Relaxed);
                Some(task)
            }
            _ => None,
        }
    }

    /// Close out the dequeue accounting once a task has been requeued,
    /// parked, or released.
    pub(crate) fn end_run(&self) {
        let prev = self.running.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "end_run without a running task");
    }

    /// Move a Running task into the waiting set. If a wakeup already
    /// arrived, the task goes straight to the high front instead.
    pub(crate) fn park(&self, task: TaskRef) {
        let mut inner = self.inner.lock();
        if task.take_notified() {
            task.set_state(TaskState::Ready);
            inner.high.push_front(task);
        } else {
            task.set_state(TaskState::Waiting);
            inner.waiting.insert(task.id, task);
        }
    }

    /// Move a Waiting task back to the high front, ready to run next. A
    /// task not (yet) parked is left to `park`, which observes the
    /// notified flag the caller set beforehand.
    pub(crate) fn unpark(&self, task: &TaskRef) {
        let woken = {
            let mut inner = self.inner.lock();
            match inner.waiting.remove(&task.id) {
                Some(parked) => {
                    // Consume the wakeup so a later park is not polluted.
                    parked.take_notified();
                    parked.set_state(TaskState::Ready);
                    inner.high.push_front(parked);
                    true
                }
                None => false,
            }
        };

        if woken {
            self.ready.notify_one();
        }
    }

    /// Queued plus waiting plus currently-running tasks.
    pub(crate) fn size(&self) -> usize {
        let inner = self.inner.lock();
        inner.high.len() + inner.normal.len() + inner.waiting.len()
            + self.running.load(Ordering::Relaxed)
    }

    /// True when there is something to pop without stealing.
    pub(crate) fn has_ready(&self) -> bool {
        let inner = self.inner.lock();
        !inner.high.is_empty() || !inner.normal.is_empty()
    }

    /// Block the owning worker until work may be available, bounded by
    /// `timeout` so it periodically re-checks peers and shutdown.
    pub(crate) fn park_worker(&self, timeout: Duration) {
        let mut inner = self.inner.lock();
        if inner.high.is_empty() && inner.normal.is_empty() {
            let _ = self.ready.wait_for(&mut inner, timeout);
        }
    }

    pub(crate) fn notify_all(&self) {
        self.ready.notify_all();
    }

    /// Remove every queued and waiting record. Terminate path; the caller
    /// cancels the returned records with no queue lock held.
    pub(crate) fn drain_all(&self) -> Vec<TaskRef> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut tasks = Vec::with_capacity(
            inner.high.len() + inner.normal.len() + inner.waiting.len(),
        );
        tasks.extend(inner.high.drain(..));
        tasks.extend(inner.normal.drain(..));
        tasks.extend(inner.waiting.drain().map(|(_, task)| task));
        tasks
    }
}

impl std::fmt::Debug for RunQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunQueue")
            .field("id", &self.id)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::record::{TaskSlab, test_record};
    use std::sync::Arc;

    fn slab() -> Arc<TaskSlab> {
        Arc::new(TaskSlab::new())
    }

    #[test]
    fn test_fifo_within_normal_priority() {
        let slab = slab();
        let queue = RunQueue::new(0);

        for id in 1..=3 {
            let (task, _f) = test_record(&slab, id, Priority::Normal, 0, true);
            queue.enqueue(task, Priority::Normal);
        }

        for expected in 1..=3 {
            let task = queue.dequeue().unwrap();
            assert_eq!(task.id, expected);
            queue.end_run();
        }
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_high_priority_jumps_the_line() {
        let slab = slab();
        let queue = RunQueue::new(0);

        let (normal, _f1) = test_record(&slab, 1, Priority::Normal, 0, true);
        let (high, _f2) = test_record(&slab, 2, Priority::High, 0, true);

        queue.enqueue(normal, Priority::Normal);
        queue.enqueue(high, Priority::High);

        assert_eq!(queue.dequeue().unwrap().id, 2);
        queue.end_run();
        assert_eq!(queue.dequeue().unwrap().id, 1);
        queue.end_run();
    }

    #[test]
    fn test_steal_skips_pinned_heads() {
        let slab = slab();
        let victim = RunQueue::new(0);
        let thief = RunQueue::new(1);

        let (pinned, _f1) = test_record(&slab, 1, Priority::Normal, 0, true);
        victim.enqueue(pinned, Priority::Normal);
        assert!(victim.steal_into(&thief).is_none());

        let _ = victim.dequeue().unwrap();
        victim.end_run();

        let (stealable, _f2) = test_record(&slab, 2, Priority::Normal, 0, false);
        victim.enqueue(stealable, Priority::Normal);

        let stolen = victim.steal_into(&thief).expect("unpinned head");
        assert_eq!(stolen.id, 2);
        assert_eq!(stolen.queue_id(), 1);
        assert_eq!(victim.size(), 0);
        assert_eq!(thief.size(), 1);
        thief.end_run();
    }

    #[test]
    fn test_park_unpark_roundtrip() {
        let slab = slab();
        let queue = RunQueue::new(0);

        let (task, _f) = test_record(&slab, 7, Priority::Normal, 0, true);
        queue.enqueue(task, Priority::Normal);

        let task = queue.dequeue().unwrap();
        task.set_state(TaskState::Running);
        queue.park(task.clone());
        queue.end_run();

        assert_eq!(task.state(), TaskState::Waiting);
        assert_eq!(queue.size(), 1, "waiting tasks count toward size");
        assert!(!queue.has_ready());

        queue.unpark(&task);
        assert_eq!(task.state(), TaskState::Ready);
        assert_eq!(queue.dequeue().unwrap().id, 7);
        queue.end_run();
    }

    #[test]
    fn test_notified_flag_beats_the_park() {
        let slab = slab();
        let queue = RunQueue::new(0);

        let (task, _f) = test_record(&slab, 9, Priority::Normal, 0, true);
        queue.enqueue(task, Priority::Normal);
        let task = queue.dequeue().unwrap();
        task.set_state(TaskState::Running);

        // Wakeup arrives before the worker parks: the unpark misses the
        // waiting set but leaves the flag behind.
        task.set_notified();
        queue.unpark(&task);

        queue.park(task.clone());
        queue.end_run();
        assert_eq!(task.state(), TaskState::Ready);
        assert_eq!(queue.dequeue().unwrap().id, 9);
        queue.end_run();
    }

    #[test]
    fn test_drain_all_empties_everything() {
        let slab = slab();
        let queue = RunQueue::new(0);

        let (a, _f1) = test_record(&slab, 1, Priority::Normal, 0, true);
        let (b, _f2) = test_record(&slab, 2, Priority::High, 0, true);
        let (c, _f3) = test_record(&slab, 3, Priority::Normal, 0, true);

        queue.enqueue(a, Priority::Normal);
        queue.enqueue(b, Priority::High);
        queue.enqueue(c, Priority::Normal);
        let parked = queue.dequeue().unwrap();
        parked.set_state(TaskState::Running);
        queue.park(parked);
        queue.end_run();

        let drained = queue.drain_all();
        assert_eq!(drained.len(), 3);
        assert_eq!(queue.size(), 0);
    }
}
