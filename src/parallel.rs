//! Fan-out combinators over the current scheduler.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::fiber::{Fiber, State};
use crate::scheduler::Scheduler;

/// Runs every callable on its own fiber on the current scheduler and
/// returns once all of them have completed. If any of them panicked, the
/// first captured payload is re-raised here after the rest have finished;
/// no payload is swallowed silently.
///
/// # Panics
///
/// Panics if the current thread is not owned by a scheduler.
pub fn parallel_do(dgs: Vec<Box<dyn FnOnce() + Send>>) {
    let scheduler = Scheduler::current().expect("parallel_do outside a scheduler thread");
    let caller = Fiber::current();
    let count = dgs.len();
    if count == 0 {
        return;
    }

    let fibers: Vec<Fiber> = dgs
        .into_iter()
        .map(|dg| {
            let scheduler = scheduler.clone();
            let caller = caller.clone();
            let mut dg = Some(dg);
            let fiber = Fiber::new(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    if let Some(dg) = dg.take() {
                        dg()
                    }
                }));
                // Stash the payload before waking the caller so the queue
                // lock orders it ahead of the caller's collection pass.
                if let Err(payload) = result {
                    Fiber::current().store_panic(payload);
                }
                scheduler.schedule_fiber(caller.clone());
            });
            fiber.set_auto_rethrow(false);
            fiber
        })
        .collect();

    for fiber in &fibers {
        scheduler.schedule_fiber(fiber.clone());
    }
    // One wakeup per completion.
    for _ in 0..count {
        scheduler.yield_to();
    }
    for fiber in &fibers {
        wait_settled(fiber);
        if let Some(payload) = fiber.take_panic() {
            panic::resume_unwind(payload);
        }
    }
}

/// Feeds `items` through `f` with a sliding window of `parallelism` worker
/// fibers. Once any invocation returns `false`, no further items are
/// consumed and `false` is returned after the in-flight workers drain. A
/// worker's panic is re-raised on the caller once all workers have
/// settled.
///
/// # Panics
///
/// Panics if `parallelism` is zero or the current thread is not owned by
/// a scheduler.
pub fn parallel_foreach<T, I, F>(items: I, f: F, parallelism: usize) -> bool
where
    T: Send + 'static,
    I: IntoIterator<Item = T>,
    F: Fn(T) -> bool + Send + Sync + 'static,
{
    assert!(parallelism > 0, "parallelism must be positive");
    let scheduler = Scheduler::current().expect("parallel_foreach outside a scheduler thread");
    let caller = Fiber::current();
    let f = Arc::new(f);

    struct Slot<T> {
        item: Mutex<Option<T>>,
        done: AtomicBool,
        ok: AtomicBool,
    }

    let slots: Arc<Vec<Slot<T>>> = Arc::new(
        (0..parallelism)
            .map(|_| Slot {
                item: Mutex::new(None),
                done: AtomicBool::new(false),
                ok: AtomicBool::new(true),
            })
            .collect(),
    );

    let fibers: Vec<Fiber> = (0..parallelism)
        .map(|index| {
            let slots = Arc::clone(&slots);
            let f = Arc::clone(&f);
            let scheduler = scheduler.clone();
            let caller = caller.clone();
            // One item per run; the caller refills the slot and resets the
            // fiber for the next.
            let fiber = Fiber::new(move || {
                let slot = &slots[index];
                let item = slot.item.lock().unwrap().take().expect("worker slot empty");
                let result = panic::catch_unwind(AssertUnwindSafe(|| f(item)));
                match result {
                    Ok(ok) => slot.ok.store(ok, Ordering::Release),
                    Err(payload) => {
                        slot.ok.store(false, Ordering::Release);
                        Fiber::current().store_panic(payload);
                    }
                }
                slot.done.store(true, Ordering::Release);
                scheduler.schedule_fiber(caller.clone());
            });
            fiber.set_auto_rethrow(false);
            fiber
        })
        .collect();

    let mut iter = items.into_iter();
    let mut outstanding = 0;
    for index in 0..parallelism {
        match iter.next() {
            Some(item) => {
                *slots[index].item.lock().unwrap() = Some(item);
                scheduler.schedule_fiber(fibers[index].clone());
                outstanding += 1;
            }
            None => break,
        }
    }

    let mut all_ok = true;
    let mut short_circuit = false;
    while outstanding > 0 {
        scheduler.yield_to();
        outstanding -= 1;
        let index = slots
            .iter()
            .position(|slot| slot.done.load(Ordering::Acquire))
            .expect("woken with no finished worker");
        slots[index].done.store(false, Ordering::Release);
        if !slots[index].ok.load(Ordering::Acquire) {
            all_ok = false;
            short_circuit = true;
        }
        if !short_circuit {
            if let Some(item) = iter.next() {
                wait_settled(&fibers[index]);
                fibers[index].reset();
                *slots[index].item.lock().unwrap() = Some(item);
                scheduler.schedule_fiber(fibers[index].clone());
                outstanding += 1;
            }
        }
    }

    for fiber in &fibers {
        wait_settled(fiber);
        if let Some(payload) = fiber.take_panic() {
            panic::resume_unwind(payload);
        }
    }
    all_ok
}

/// A worker that woke us may still be on its final switch out; wait for
/// the state machine to settle before touching it.
fn wait_settled(fiber: &Fiber) {
    while fiber.state() == State::Exec {
        std::thread::yield_now();
    }
}
