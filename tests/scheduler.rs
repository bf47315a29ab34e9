use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use weft::{parallel_do, parallel_foreach, Fiber, Scheduler, WorkerPool};

mod util;
use util::{assert_send, assert_sync, init};

#[test]
fn is_send_and_sync() {
    assert_send::<Scheduler>();
    assert_sync::<Scheduler>();
}

#[test]
fn hijacked_caller_runs_work_in_fifo_order() {
    init();
    let pool = WorkerPool::new(1, true);
    let order = Arc::new(Mutex::new(Vec::new()));
    for label in ["a", "b", "c"] {
        let order = Arc::clone(&order);
        pool.schedule(move || order.lock().unwrap().push(label));
    }
    assert!(order.lock().unwrap().is_empty());
    pool.dispatch();
    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    pool.stop();
}

#[test]
fn spawned_workers_drain_the_queue() {
    init();
    let pool = WorkerPool::new(2, false);
    let counter = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = channel();
    for _ in 0..20 {
        let counter = Arc::clone(&counter);
        let tx = tx.clone();
        pool.schedule(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 19 {
                tx.send(()).unwrap();
            }
        });
    }
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    pool.stop();
    assert_eq!(counter.load(Ordering::SeqCst), 20);
}

#[test]
fn rescheduled_fiber_interleaves() {
    init();
    let pool = WorkerPool::new(1, true);
    let order = Arc::new(Mutex::new(Vec::new()));
    {
        let order = Arc::clone(&order);
        pool.schedule(move || {
            order.lock().unwrap().push("first half");
            let scheduler = Scheduler::current().unwrap();
            scheduler.schedule_fiber(Fiber::current());
            scheduler.yield_to();
            order.lock().unwrap().push("second half");
        });
    }
    {
        let order = Arc::clone(&order);
        pool.schedule(move || order.lock().unwrap().push("other"));
    }
    pool.dispatch();
    assert_eq!(
        *order.lock().unwrap(),
        vec!["first half", "other", "second half"]
    );
    pool.stop();
}

#[test]
fn affinity_pins_work_to_a_thread() {
    init();
    let pool = WorkerPool::new(2, false);
    let (tx, rx) = channel();
    pool.schedule(move || {
        tx.send(thread::current().id()).unwrap();
    });
    let worker = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let (tx, rx) = channel();
    for _ in 0..8 {
        let tx = tx.clone();
        pool.schedule_on(worker, move || {
            tx.send(thread::current().id()).unwrap();
        });
    }
    drop(tx);
    let mut seen = 0;
    while let Ok(id) = rx.recv_timeout(Duration::from_secs(5)) {
        assert_eq!(id, worker);
        seen += 1;
        if seen == 8 {
            break;
        }
    }
    assert_eq!(seen, 8);
    pool.stop();
}

#[test]
fn switch_to_migrates_between_pools() {
    init();
    let first = WorkerPool::new(1, false);
    let second = WorkerPool::new(1, false);
    let target = second.scheduler().clone();
    let (tx, rx) = channel();
    first.schedule(move || {
        let before = thread::current().id();
        target.switch_to(None);
        let after = thread::current().id();
        tx.send((before, after)).unwrap();
    });
    let (before, after) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_ne!(before, after);
    second.stop();
    first.stop();
}

#[test]
fn a_panicking_item_does_not_kill_the_worker() {
    init();
    let pool = WorkerPool::new(1, true);
    let survived = Arc::new(AtomicBool::new(false));
    pool.schedule(|| panic!("scheduled work failed"));
    {
        let survived = Arc::clone(&survived);
        pool.schedule(move || survived.store(true, Ordering::SeqCst));
    }
    pool.dispatch();
    assert!(survived.load(Ordering::SeqCst));
    pool.stop();
}

#[test]
fn parallel_do_runs_every_task() {
    init();
    let pool = WorkerPool::new(1, true);
    let counter = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<Box<dyn FnOnce() + Send>> = (0..5)
        .map(|_| {
            let counter = Arc::clone(&counter);
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }) as Box<dyn FnOnce() + Send>
        })
        .collect();
    parallel_do(tasks);
    assert_eq!(counter.load(Ordering::SeqCst), 5);
    pool.stop();
}

#[test]
fn parallel_do_propagates_the_first_panic() {
    init();
    let pool = WorkerPool::new(1, true);
    let completed = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<Box<dyn FnOnce() + Send>> = vec![
        {
            let completed = Arc::clone(&completed);
            Box::new(move || {
                completed.fetch_add(1, Ordering::SeqCst);
            })
        },
        Box::new(|| panic!("task failed")),
        {
            let completed = Arc::clone(&completed);
            Box::new(move || {
                completed.fetch_add(1, Ordering::SeqCst);
            })
        },
    ];
    let result = panic::catch_unwind(AssertUnwindSafe(|| parallel_do(tasks)));
    assert!(result.is_err());
    // The panic is re-raised only after every task has finished.
    assert_eq!(completed.load(Ordering::SeqCst), 2);
    pool.stop();
}

#[test]
fn parallel_foreach_processes_every_item() {
    init();
    let pool = WorkerPool::new(1, true);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let result = {
        let seen = Arc::clone(&seen);
        parallel_foreach(
            0..20,
            move |item: i32| {
                seen.lock().unwrap().push(item);
                true
            },
            4,
        )
    };
    assert!(result);
    let mut seen = seen.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..20).collect::<Vec<_>>());
    pool.stop();
}

#[test]
fn parallel_foreach_short_circuits() {
    init();
    let pool = WorkerPool::new(1, true);
    let seen = Arc::new(AtomicUsize::new(0));
    let result = {
        let seen = Arc::clone(&seen);
        parallel_foreach(
            0..100,
            move |item: i32| {
                seen.fetch_add(1, Ordering::SeqCst);
                item != 3
            },
            2,
        )
    };
    assert!(!result);
    // The iterator is abandoned once a worker reports stop.
    assert!(seen.load(Ordering::SeqCst) < 100);
    pool.stop();
}

#[test]
fn stop_drains_pending_work() {
    init();
    let pool = WorkerPool::new(1, true);
    let done = Arc::new(AtomicBool::new(false));
    {
        let done = Arc::clone(&done);
        pool.schedule(move || done.store(true, Ordering::SeqCst));
    }
    pool.stop();
    assert!(done.load(Ordering::SeqCst));
}
