use crate::error::DispatchError;
use crate::runtime::{QueueId, QueueType};
use crate::task::{CoroContext, JoinHandle, Promise};
use crate::{Builder, Dispatcher};
use anyhow::Result;
use parking_lot::Mutex;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

assert_impl_all!(Dispatcher: Send, Sync);
assert_impl_all!(Builder: Send, Sync, Clone);
assert_impl_all!(JoinHandle<i32>: Send, Sync);

/// Occupies one worker until `release` flips, keeping everything behind it
/// queued.
fn spin_gate(
    dispatcher: &Dispatcher,
    queue: QueueId,
    release: Arc<AtomicBool>,
) -> JoinHandle<i32> {
    dispatcher
        .post_to(queue, false, move |ctx: CoroContext<i32>| {
            while !release.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
            let _ = ctx.set(0);
            0
        })
        .expect("gate submission")
}

#[test]
fn test_post_returns_value() -> Result<()> {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(2)
        .io_threads(1)
        .build();

    let handle = dispatcher.post(|ctx: CoroContext<i32>| {
        ctx.set(42).unwrap();
        0
    })?;

    assert_eq!(handle.wait(), Ok(42));
    assert!(handle.is_finished() || handle.try_get().is_some());

    dispatcher.terminate();
    Ok(())
}

#[test]
fn test_normal_priority_runs_in_submission_order() -> Result<()> {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(1)
        .io_threads(0)
        .build();

    let release = Arc::new(AtomicBool::new(false));
    let order = Arc::new(Mutex::new(Vec::new()));

    let gate = spin_gate(&dispatcher, QueueId::Any, Arc::clone(&release));

    let handles = (0..10)
        .map(|i| {
            let order = Arc::clone(&order);
            dispatcher.post(move |ctx: CoroContext<i32>| {
                order.lock().push(i);
                ctx.set(i).unwrap();
                0
            })
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    release.store(true, Ordering::Release);
    assert_eq!(gate.wait(), Ok(0));
    for handle in &handles {
        handle.wait().unwrap();
    }

    assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    dispatcher.terminate();
    Ok(())
}

#[test]
fn test_high_priority_runs_before_queued_normals() -> Result<()> {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(1)
        .io_threads(0)
        .build();

    let release = Arc::new(AtomicBool::new(false));
    let order = Arc::new(Mutex::new(Vec::new()));

    let gate = spin_gate(&dispatcher, QueueId::Any, Arc::clone(&release));

    let normals = (0..5)
        .map(|i| {
            let order = Arc::clone(&order);
            dispatcher.post(move |ctx: CoroContext<i32>| {
                order.lock().push(i);
                ctx.set(i).unwrap();
                0
            })
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    // Submitted last, but jumps the whole normal backlog.
    let order_in_high = Arc::clone(&order);
    let high = dispatcher.post_to(QueueId::Any, true, move |ctx: CoroContext<i32>| {
        order_in_high.lock().push(-1);
        ctx.set(-1).unwrap();
        0
    })?;

    release.store(true, Ordering::Release);
    gate.wait().unwrap();
    high.wait().unwrap();
    for handle in &normals {
        handle.wait().unwrap();
    }

    assert_eq!(*order.lock(), vec![-1, 0, 1, 2, 3, 4]);
    dispatcher.terminate();
    Ok(())
}

#[test]
fn test_continuation_chain_depth_five() -> Result<()> {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(2)
        .io_threads(0)
        .build();

    let mut chain = dispatcher.post_first(|ctx: CoroContext<i32>| {
        ctx.set(1).unwrap();
        0
    })?;

    for _ in 0..4 {
        chain = chain.then(|ctx: CoroContext<i32>| {
            let prev = ctx.prev::<i32>().expect("inside a chain").unwrap();
            ctx.set(prev + 1).unwrap();
            0
        })?;
    }

    assert_eq!(chain.wait(), Ok(5));
    dispatcher.terminate();
    Ok(())
}

#[test]
fn test_chain_members_share_a_queue_and_run_in_order() -> Result<()> {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(3)
        .io_threads(0)
        .build();

    let order = Arc::new(Mutex::new(Vec::new()));

    let record = |step: i32| {
        let order = Arc::clone(&order);
        move |ctx: CoroContext<i32>| {
            order.lock().push(step);
            ctx.set(step).unwrap();
            0
        }
    };

    let tail = dispatcher
        .post_first(record(1))?
        .then(record(2))?
        .then(record(3))?;

    assert_eq!(tail.wait(), Ok(3));
    assert_eq!(*order.lock(), vec![1, 2, 3]);

    dispatcher.terminate();
    Ok(())
}

#[test]
fn test_then_after_head_completed() -> Result<()> {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(2)
        .io_threads(0)
        .build();

    let head = dispatcher.post_first(|ctx: CoroContext<i32>| {
        ctx.set(10).unwrap();
        0
    })?;
    assert_eq!(head.wait(), Ok(10));

    let tail = head.then(|ctx: CoroContext<i32>| {
        let prev = ctx.prev::<i32>().expect("inside a chain").unwrap();
        ctx.set(prev * 2).unwrap();
        0
    })?;

    assert_eq!(tail.wait(), Ok(20));
    dispatcher.terminate();
    Ok(())
}

#[test]
fn test_io_offload_keeps_coroutine_pool_responsive() -> Result<()> {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(1)
        .io_threads(2)
        .build();

    let io = dispatcher.post_io(|promise: Promise<String>| {
        std::thread::sleep(Duration::from_millis(100));
        promise.set("ok".to_string()).unwrap();
        0
    })?;

    let start = Instant::now();
    let quick = dispatcher.post(|ctx: CoroContext<i32>| {
        ctx.set(1).unwrap();
        0
    })?;
    assert_eq!(quick.wait(), Ok(1));
    assert!(
        start.elapsed() < Duration::from_millis(50),
        "coroutine pool was blocked by io work"
    );

    assert_eq!(io.wait(), Ok("ok".to_string()));
    dispatcher.terminate();
    Ok(())
}

#[test]
fn test_io_pool_disabled() -> Result<()> {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(1)
        .io_threads(0)
        .build();

    let res = dispatcher.post_io(|promise: Promise<i32>| {
        let _ = promise.set(1);
        0
    });
    assert!(matches!(res, Err(DispatchError::Unsupported(_))));

    dispatcher.terminate();
    Ok(())
}

#[rstest]
#[case::out_of_range(QueueId::Id(64))]
#[case::same_outside_a_coroutine(QueueId::Same)]
#[case::all_is_query_only(QueueId::All)]
fn test_invalid_submission_queue_ids(#[case] queue: QueueId) -> Result<()> {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(2)
        .io_threads(1)
        .build();

    let res = dispatcher.post_to(queue, false, |ctx: CoroContext<i32>| {
        let _ = ctx.set(0);
        0
    });
    assert_eq!(res.err(), Some(DispatchError::InvalidQueueId));

    dispatcher.terminate();
    Ok(())
}

#[test]
fn test_query_sentinels() -> Result<()> {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(2)
        .io_threads(1)
        .build();

    assert_eq!(dispatcher.size(QueueType::All, QueueId::All)?, 0);
    assert!(dispatcher.empty(QueueType::Coro, QueueId::All)?);
    assert!(dispatcher.empty(QueueType::Coro, QueueId::Id(1))?);
    assert!(dispatcher.stats(QueueType::Io, QueueId::Id(0)).is_ok());

    assert_eq!(
        dispatcher.size(QueueType::Coro, QueueId::Any).err(),
        Some(DispatchError::InvalidQueueId)
    );
    assert_eq!(
        dispatcher.size(QueueType::Io, QueueId::Same).err(),
        Some(DispatchError::InvalidQueueId)
    );
    assert_eq!(
        dispatcher.size(QueueType::Coro, QueueId::Id(5)).err(),
        Some(DispatchError::InvalidQueueId)
    );

    dispatcher.terminate();
    Ok(())
}

#[test]
fn test_same_queue_submission_from_coroutine() -> Result<()> {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(2)
        .io_threads(0)
        .build();

    let parent = dispatcher.post_to(QueueId::Id(1), false, |ctx: CoroContext<i32>| {
        match ctx.post_to(QueueId::Same, false, |child: CoroContext<i32>| {
            let _ = child.set(1);
            0
        }) {
            Ok(handle) => {
                let _ = ctx.set(handle.task.queue_id() as i32);
                0
            }
            Err(_) => 1,
        }
    })?;

    assert_eq!(parent.wait(), Ok(1), "child must land on the parent's queue");
    dispatcher.terminate();
    Ok(())
}

#[test]
fn test_join_between_coroutines() -> Result<()> {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(1)
        .io_threads(0)
        .build();

    let parent = dispatcher.post(|ctx: CoroContext<i32>| {
        let child = match ctx.post(|child: CoroContext<i32>| {
            child.set(21).unwrap();
            0
        }) {
            Ok(handle) => handle,
            Err(_) => return 1,
        };

        match ctx.join(&child) {
            Ok(value) => {
                let _ = ctx.set(value * 2);
                0
            }
            Err(_) => 2,
        }
    })?;

    assert_eq!(parent.wait(), Ok(42));
    dispatcher.terminate();
    Ok(())
}

#[test]
fn test_yield_interleaves_tasks_on_one_queue() -> Result<()> {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(1)
        .io_threads(0)
        .build();

    let release = Arc::new(AtomicBool::new(false));
    let order = Arc::new(Mutex::new(Vec::new()));
    let gate = spin_gate(&dispatcher, QueueId::Any, Arc::clone(&release));

    let stepper = |task: i32| {
        let order = Arc::clone(&order);
        move |ctx: CoroContext<i32>| {
            for step in 0..3 {
                order.lock().push((task, step));
                ctx.yield_now();
            }
            ctx.set(task).unwrap();
            0
        }
    };

    let a = dispatcher.post(stepper(0))?;
    let b = dispatcher.post(stepper(1))?;

    release.store(true, Ordering::Release);
    a.wait().unwrap();
    b.wait().unwrap();
    gate.wait().unwrap();

    assert_eq!(
        *order.lock(),
        vec![(0, 0), (1, 0), (0, 1), (1, 1), (0, 2), (1, 2)],
        "voluntary yields must round-robin equal-priority tasks"
    );

    dispatcher.terminate();
    Ok(())
}

#[test]
fn test_work_stealing_rescues_a_blocked_queue() -> Result<()> {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(2)
        .io_threads(0)
        .build();

    let release = Arc::new(AtomicBool::new(false));
    let gate = spin_gate(&dispatcher, QueueId::Id(0), Arc::clone(&release));

    // Any-submitted tasks are stealable: even the ones balanced onto the
    // blocked queue 0 must finish, carried off by the queue-1 worker.
    let handles = (0..20)
        .map(|i| {
            dispatcher.post(move |ctx: CoroContext<i32>| {
                let _ = ctx.set(i);
                0
            })
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for handle in &handles {
        let value = handle
            .wait_for(Duration::from_secs(5))
            .expect("stealing must drain the blocked queue");
        assert!(value.is_ok());
    }

    release.store(true, Ordering::Release);
    gate.wait().unwrap();
    dispatcher.terminate();
    Ok(())
}

#[test]
fn test_drain_waits_for_everything() -> Result<()> {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(2)
        .io_threads(2)
        .build();

    let coro_handles = (0..30)
        .map(|i| {
            dispatcher.post(move |ctx: CoroContext<i32>| {
                ctx.yield_now();
                let _ = ctx.set(i);
                0
            })
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let io_handles = (0..20)
        .map(|i| {
            dispatcher.post_io(move |promise: Promise<i32>| {
                let _ = promise.set(i);
                0
            })
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    dispatcher.drain();

    for handle in coro_handles.iter().chain(&io_handles) {
        assert!(
            handle.try_get().is_some(),
            "every pre-drain submission must be fulfilled once drain returns"
        );
    }
    assert!(dispatcher.empty(QueueType::All, QueueId::All)?);

    dispatcher.terminate();
    Ok(())
}

#[test]
fn test_drain_rejects_external_submissions() -> Result<()> {
    let dispatcher = Arc::new(
        Dispatcher::builder()
            .coroutine_threads(1)
            .io_threads(0)
            .build(),
    );

    let external = Promise::<i32>::new();
    let future = external.future();
    let gate = dispatcher.post(move |ctx: CoroContext<i32>| {
        let _ = ctx.wait(&future);
        let _ = ctx.set(1);
        0
    })?;

    let drainer = {
        let dispatcher = Arc::clone(&dispatcher);
        std::thread::spawn(move || dispatcher.drain())
    };
    std::thread::sleep(Duration::from_millis(100));

    let rejected = dispatcher.post(|ctx: CoroContext<i32>| {
        let _ = ctx.set(2);
        0
    });
    assert_eq!(rejected.err(), Some(DispatchError::Draining));

    external.set(7).unwrap();
    drainer.join().unwrap();
    assert_eq!(gate.wait(), Ok(1));

    // Admission is restored once the drain completes.
    let after = dispatcher.post(|ctx: CoroContext<i32>| {
        let _ = ctx.set(3);
        0
    })?;
    assert_eq!(after.wait(), Ok(3));

    dispatcher.terminate();
    Ok(())
}

#[test]
fn test_drain_admits_posts_from_running_coroutines() -> Result<()> {
    let dispatcher = Arc::new(
        Dispatcher::builder()
            .coroutine_threads(1)
            .io_threads(0)
            .build(),
    );

    let external = Promise::<i32>::new();
    let future = external.future();
    let parent = dispatcher.post(move |ctx: CoroContext<i32>| {
        let _ = ctx.wait(&future);

        // The dispatcher is draining right now; in-coroutine submissions
        // must still go through.
        match ctx.post(|child: CoroContext<i32>| {
            let _ = child.set(5);
            0
        }) {
            Ok(child) => match ctx.join(&child) {
                Ok(value) => {
                    let _ = ctx.set(value);
                    0
                }
                Err(_) => 2,
            },
            Err(_) => 1,
        }
    })?;

    let drainer = {
        let dispatcher = Arc::clone(&dispatcher);
        std::thread::spawn(move || dispatcher.drain())
    };
    std::thread::sleep(Duration::from_millis(100));

    external.set(0).unwrap();
    drainer.join().unwrap();
    assert_eq!(parent.wait(), Ok(5));

    dispatcher.terminate();
    Ok(())
}

#[test]
fn test_terminate_is_idempotent() -> Result<()> {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(2)
        .io_threads(1)
        .build();

    dispatcher.terminate();
    dispatcher.terminate();
    dispatcher.terminate();

    let coro = dispatcher.post(|ctx: CoroContext<i32>| {
        let _ = ctx.set(0);
        0
    });
    assert_eq!(coro.err(), Some(DispatchError::Terminated));

    let io = dispatcher.post_io(|promise: Promise<i32>| {
        let _ = promise.set(0);
        0
    });
    assert_eq!(io.err(), Some(DispatchError::Terminated));

    Ok(())
}

#[test]
fn test_terminate_cancels_parked_coroutines() -> Result<()> {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(2)
        .io_threads(1)
        .build();

    let external = Promise::<i32>::new();
    let future = external.future();

    let handles = (0..100)
        .map(|_| {
            let future = future.clone();
            dispatcher.post(move |ctx: CoroContext<i32>| match ctx.wait(&future) {
                Ok(value) => {
                    let _ = ctx.set(value);
                    0
                }
                Err(_) => 1,
            })
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    // Let the tasks reach their parked state before pulling the plug.
    std::thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    dispatcher.terminate();
    assert!(start.elapsed() < Duration::from_secs(5));

    for handle in handles {
        assert_eq!(handle.wait(), Err(DispatchError::Cancelled));
    }
    Ok(())
}

#[test]
fn test_terminate_cancels_linked_chain_successors() -> Result<()> {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(1)
        .io_threads(0)
        .build();

    let external = Promise::<i32>::new();
    let future = external.future();

    // The head parks forever; its successor is linked but never enqueued.
    let head = dispatcher.post_first(move |ctx: CoroContext<i32>| {
        match ctx.wait(&future) {
            Ok(value) => {
                let _ = ctx.set(value);
                0
            }
            Err(_) => 1,
        }
    })?;
    let tail = head.then(|ctx: CoroContext<i32>| {
        let _ = ctx.set(2);
        0
    })?;

    std::thread::sleep(Duration::from_millis(20));
    dispatcher.terminate();

    assert_eq!(tail.wait(), Err(DispatchError::Cancelled));
    Ok(())
}

#[test]
fn test_user_error_codes_surface_through_the_promise() -> Result<()> {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(1)
        .io_threads(1)
        .build();

    let failed = dispatcher.post(|_ctx: CoroContext<i32>| 7)?;
    assert_eq!(failed.wait(), Err(DispatchError::UserError(7)));

    // First write wins: a published value survives a nonzero return.
    let published = dispatcher.post(|ctx: CoroContext<i32>| {
        ctx.set(1).unwrap();
        3
    })?;
    assert_eq!(published.wait(), Ok(1));

    // A clean return without a publish still fulfills the promise.
    let silent = dispatcher.post(|_ctx: CoroContext<i32>| 0)?;
    assert_eq!(silent.wait(), Err(DispatchError::UserError(0)));

    let panicked = dispatcher.post(|_ctx: CoroContext<i32>| panic!("boom"))?;
    assert_eq!(panicked.wait(), Err(DispatchError::UserError(-1)));

    let io_failed = dispatcher.post_io(|_promise: Promise<i32>| 9)?;
    assert_eq!(io_failed.wait(), Err(DispatchError::UserError(9)));

    dispatcher.drain();
    let stats = dispatcher.stats(QueueType::All, QueueId::All)?;
    assert!(stats.errors >= 4);

    dispatcher.terminate();
    Ok(())
}

#[test]
fn test_stats_track_posts_and_completions() -> Result<()> {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(2)
        .io_threads(1)
        .build();

    for i in 0..9 {
        dispatcher.post(move |ctx: CoroContext<i32>| {
            let _ = ctx.set(i);
            0
        })?;
    }
    dispatcher.post_to(QueueId::Any, true, |ctx: CoroContext<i32>| {
        let _ = ctx.set(-1);
        0
    })?;
    for i in 0..5 {
        dispatcher.post_io(move |promise: Promise<i32>| {
            let _ = promise.set(i);
            0
        })?;
    }

    dispatcher.drain();

    let coro = dispatcher.stats(QueueType::Coro, QueueId::All)?;
    assert_eq!(coro.posted, 10);
    assert_eq!(coro.completed, 10);
    assert_eq!(coro.high_priority, 1);
    assert_eq!(coro.queued, 0);
    assert_eq!(coro.errors, 0);

    let io = dispatcher.stats(QueueType::Io, QueueId::All)?;
    assert_eq!(io.posted, 5);
    assert_eq!(io.completed, 5);

    let all = dispatcher.stats(QueueType::All, QueueId::All)?;
    assert_eq!(all.posted, 15);

    dispatcher.reset_stats();
    let reset = dispatcher.stats(QueueType::All, QueueId::All)?;
    assert_eq!(reset.posted, 0);
    assert_eq!(reset.completed, 0);

    dispatcher.terminate();
    Ok(())
}

#[test]
fn test_drop_of_idle_dispatcher_shuts_down() {
    let dispatcher = Dispatcher::builder()
        .coroutine_threads(1)
        .io_threads(1)
        .build();
    drop(dispatcher);
}

#[test]
fn test_two_dispatchers_coexist() -> Result<()> {
    let a = Dispatcher::builder().coroutine_threads(1).io_threads(0).build();
    let b = Dispatcher::builder().coroutine_threads(1).io_threads(0).build();

    let ha = a.post(|ctx: CoroContext<i32>| {
        ctx.set(1).unwrap();
        0
    })?;
    let hb = b.post(|ctx: CoroContext<i32>| {
        ctx.set(2).unwrap();
        0
    })?;

    assert_eq!(ha.wait(), Ok(1));
    assert_eq!(hb.wait(), Ok(2));

    a.terminate();
    // `b` keeps accepting work after `a` is gone.
    let hb2 = b.post(|ctx: CoroContext<i32>| {
        ctx.set(3).unwrap();
        0
    })?;
    assert_eq!(hb2.wait(), Ok(3));
    b.terminate();
    Ok(())
}
