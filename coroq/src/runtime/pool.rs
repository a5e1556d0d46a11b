use crate::runtime::queue::RunQueue;
use crate::runtime::worker::Worker;
use crate::runtime::{PoolKind, PoolShared};
use crate::task::record::TaskRef;
use crate::utils;
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};
use std::thread;

/// One pool of worker threads, one run queue per thread. The coroutine and
/// IO pools are two disjoint instances of this.
pub(crate) struct WorkerPool {
    kind: PoolKind,
    queues: Vec<Arc<RunQueue>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn spawn(
        kind: PoolKind,
        threads: usize,
        dispatcher_id: u64,
        shared: &Arc<PoolShared>,
        thread_stack_size: Option<usize>,
        pin_to_cores: bool,
        steal_retries: usize,
    ) -> Self {
        let queues = (0..threads)
            .map(|id| Arc::new(RunQueue::new(id)))
            .collect::<Vec<_>>();

        // Pinning is silently skipped when there are more workers than
        // cores.
        let pin = kind == PoolKind::Coro && pin_to_cores && threads <= utils::available_cores();

        // Spawning threads is asynchronous; hold everyone at a barrier so
        // the pool is fully up before the dispatcher accepts work.
        let barrier = Arc::new(Barrier::new(threads + 1));

        let handles = queues
            .iter()
            .map(|queue| {
                let worker = Worker::new(
                    kind,
                    dispatcher_id,
                    Arc::clone(queue),
                    &queues,
                    Arc::clone(shared),
                    steal_retries,
                );
                let barrier = Arc::clone(&barrier);
                let name = format!("coroq-{}-{}", kind.label(), queue.id());
                let core_id = queue.id();

                let mut builder = thread::Builder::new().name(name.clone());
                if let Some(stack_size) = thread_stack_size {
                    builder = builder.stack_size(stack_size);
                }

                builder
                    .spawn(move || {
                        utils::thread::set_current_thread_name(&name);
                        if pin {
                            if let Err(e) = utils::thread::pin_current_thread_to_core(core_id) {
                                tracing::debug!(core = core_id, error = %e, "cpu pinning skipped");
                            }
                        }
                        barrier.wait();
                        worker.run();
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect::<Vec<_>>();

        barrier.wait();

        Self {
            kind,
            queues,
            handles: Mutex::new(handles),
        }
    }

    pub(crate) fn threads(&self) -> usize {
        self.queues.len()
    }

    pub(crate) fn queues(&self) -> &[Arc<RunQueue>] {
        &self.queues
    }

    pub(crate) fn queue(&self, id: usize) -> Option<&Arc<RunQueue>> {
        self.queues.get(id)
    }

    /// Sum of every queue's size, running tasks included.
    pub(crate) fn total_size(&self) -> usize {
        self.queues.iter().map(|queue| queue.size()).sum()
    }

    /// Queue with the smallest sampled size; the lowest id wins ties. Best
    /// effort by design, there is no fairness guarantee across posts.
    pub(crate) fn least_loaded(&self) -> usize {
        self.queues
            .iter()
            .enumerate()
            .min_by_key(|(_, queue)| queue.size())
            .map(|(id, _)| id)
            .unwrap_or(0)
    }

    pub(crate) fn notify_all(&self) {
        for queue in &self.queues {
            queue.notify_all();
        }
    }

    /// Join every worker thread. Called once, from `terminate`.
    pub(crate) fn join_all(&self) {
        let handles = {
            let mut handles = self.handles.lock();
            std::mem::take(&mut *handles)
        };

        let panicked = handles
            .into_iter()
            .filter(|handle| handle.thread().id() != thread::current().id())
            .filter_map(|handle| handle.join().err())
            .count();

        if panicked > 0 {
            tracing::error!(
                pool = self.kind.label(),
                count = panicked,
                "worker thread(s) panicked"
            );
        }
    }

    /// Pull every record still queued or waiting, across all queues.
    pub(crate) fn drain_all_tasks(&self) -> Vec<TaskRef> {
        self.queues
            .iter()
            .flat_map(|queue| queue.drain_all())
            .collect()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("kind", &self.kind)
            .field("threads", &self.queues.len())
            .finish()
    }
}
