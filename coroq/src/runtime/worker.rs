use crate::coro::{CoroState, Coroutine};
use crate::runtime::context::{self, CurrentTask};
use crate::runtime::queue::RunQueue;
use crate::runtime::{PoolKind, PoolShared};
use crate::task::record::{CoroSlot, SuspendReason, TaskBody, TaskRef, cancel_task};
use crate::task::{TaskKind, TaskState};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on one idle nap; bounds steal and shutdown latency.
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

enum Outcome {
    Completed,
    Suspended(SuspendReason),
}

/// One worker loop: owns a run queue, steals from its pool's peers when
/// idle, and drives tasks through resume/yield/park/complete transitions.
pub(crate) struct Worker {
    pool: PoolKind,
    dispatcher_id: u64,
    queue: Arc<RunQueue>,
    /// Peer queues of the same pool, shuffled per worker so concurrent
    /// steal sweeps start in different places.
    peers: Vec<Arc<RunQueue>>,
    shared: Arc<PoolShared>,
    steal_retries: usize,
}

impl Worker {
    pub(crate) fn new(
        pool: PoolKind,
        dispatcher_id: u64,
        queue: Arc<RunQueue>,
        all_queues: &[Arc<RunQueue>],
        shared: Arc<PoolShared>,
        steal_retries: usize,
    ) -> Self {
        let mut peers = all_queues
            .iter()
            .filter(|peer| peer.id() != queue.id())
            .cloned()
            .collect::<Vec<_>>();
        fastrand::shuffle(&mut peers);

        Self {
            pool,
            dispatcher_id,
            queue,
            peers,
            shared,
            steal_retries,
        }
    }

    pub(crate) fn run(self) {
        tracing::debug!(
            pool = self.pool.label(),
            queue = self.queue.id(),
            "worker started"
        );

        loop {
            if self.shared.is_shutdown() {
                break;
            }

            match self.next_task() {
                Some(task) => self.run_task(task),
                None => self.queue.park_worker(PARK_TIMEOUT),
            }
        }

        tracing::debug!(
            pool = self.pool.label(),
            queue = self.queue.id(),
            "worker stopped"
        );
    }

    fn next_task(&self) -> Option<TaskRef> {
        self.queue.dequeue().or_else(|| self.steal())
    }

    fn steal(&self) -> Option<TaskRef> {
        for _ in 0..self.steal_retries {
            for peer in &self.peers {
                if let Some(task) = peer.steal_into(&self.queue) {
                    tracing::trace!(
                        from = peer.id(),
                        to = self.queue.id(),
                        task = task.id,
                        "stole task"
                    );
                    return Some(task);
                }
            }
        }
        None
    }

    fn run_task(&self, task: TaskRef) {
        if task.mark_started() {
            self.queue.stats.on_started(task.posted_at.elapsed());
        }
        task.set_state(TaskState::Running);

        let outcome = {
            // IO bodies get no in-coroutine capabilities, so only
            // coroutines publish themselves as the running task.
            let _guard = (task.kind == TaskKind::Coroutine).then(|| {
                context::enter(CurrentTask {
                    dispatcher_id: self.dispatcher_id,
                    queue_id: self.queue.id(),
                    task: task.clone(),
                    queue: Arc::clone(&self.queue),
                })
            });

            // Safety: this worker dequeued the record; nothing else touches
            // its body until it is requeued, parked or released.
            unsafe { self.poll_body(&task) }
        };

        let reached_terminal = match outcome {
            Outcome::Completed => {
                self.complete(task);
                true
            }
            Outcome::Suspended(_) if self.shared.is_shutdown() => {
                // Cancellation boundary: a running coroutine observes
                // terminate at its next yield.
                cancel_task(&task);
                true
            }
            Outcome::Suspended(SuspendReason::Yielded) => {
                let priority = task.priority;
                self.queue.enqueue(task, priority);
                false
            }
            Outcome::Suspended(SuspendReason::Waiting) => {
                self.queue.park(task);
                false
            }
        };

        self.queue.end_run();
        if reached_terminal {
            self.shared.notify_quiesce();
        }
    }

    /// Resume the coroutine (spawning it on first run) or execute the IO
    /// body to completion.
    unsafe fn poll_body(&self, task: &TaskRef) -> Outcome {
        match unsafe { task.body_mut() } {
            TaskBody::Coro(slot) => {
                if matches!(*slot, CoroSlot::Unspawned { .. }) {
                    let CoroSlot::Unspawned { entry, stack_size } =
                        std::mem::replace(slot, CoroSlot::Done)
                    else {
                        unreachable!("slot checked above");
                    };
                    *slot = CoroSlot::Spawned(Coroutine::new(stack_size, entry));
                }

                let state = match &mut *slot {
                    CoroSlot::Spawned(coro) => coro.resume(),
                    _ => unreachable!("terminated coroutine rescheduled"),
                };

                match state {
                    CoroState::Terminated => {
                        *slot = CoroSlot::Done;
                        Outcome::Completed
                    }
                    CoroState::Suspended => Outcome::Suspended(
                        task.signal.take().unwrap_or(SuspendReason::Yielded),
                    ),
                }
            }
            TaskBody::Io(body) => {
                let body = body.take().expect("io body ran twice");
                body();
                Outcome::Completed
            }
        }
    }

    fn complete(&self, task: TaskRef) {
        task.set_state(TaskState::Completed);
        self.queue.stats.on_completed(task.sink.is_error());

        // Release the chain link: the successor runs next, on this queue,
        // preserving chain order even after a steal moved the head.
        if let Some(next) = task.take_successor() {
            next.set_queue_id(self.queue.id());
            let priority = next.priority;
            self.queue.enqueue(next, priority);
        }
    }
}
