//! M:N cooperative scheduling: fibers multiplexed onto a pool of worker
//! threads.
//!
//! A [`Scheduler`] owns a FIFO ready queue of work items (fibers or bare
//! callables, each with optional thread affinity) and a set of worker
//! threads draining it. What a worker does when the queue is empty is
//! plugged in by the concrete front-end: a [`WorkerPool`] idles on a
//! semaphore, an [`IoManager`](crate::IoManager) idles on the kernel event
//! source.
//!
//! With the *use-caller* flag the constructing thread becomes one of the
//! workers: its share of the workloop runs inside a dedicated scheduler
//! fiber that is entered on demand through
//! [`dispatch`](Scheduler::dispatch) or [`yield_to`](Scheduler::yield_to).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use log::{error, trace};

use crate::fiber::{Fiber, State};

/// Stack size of the scheduler fiber driving a hijacked caller thread.
const SCHEDULER_STACK_SIZE: usize = 64 * 1024;
/// Stack size of the idle fiber; the I/O managers run their event loops
/// on it.
const IDLE_STACK_SIZE: usize = 256 * 1024;

/// Pluggable idle behaviour of a scheduler's workers.
pub(crate) trait Idler: Send + Sync + 'static {
    /// Body of the idle fiber. Runs whenever a worker finds no runnable
    /// item; returns once the scheduler is stopping and nothing remains
    /// pending, which lets the worker exit its loop.
    fn idle(&self, scheduler: &Scheduler);

    /// Wakes the idle machinery so newly posted work (or an
    /// earlier-than-expected timer) is observed promptly.
    fn tickle(&self);
}

enum Task {
    Fiber(Fiber),
    Call(Box<dyn FnMut() + Send>),
}

struct Item {
    task: Task,
    thread: Option<ThreadId>,
}

struct Shared {
    queue: Mutex<VecDeque<Item>>,
    idler: OnceLock<Arc<dyn Idler>>,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    thread_count: usize,
    root_thread: Option<ThreadId>,
    root_fiber: Mutex<Option<Fiber>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a scheduler; clones share the same pool.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

thread_local! {
    static SCHEDULER: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
    /// The fiber driving this thread's workloop. On spawned workers it is
    /// the thread fiber itself; on a hijacked caller thread it is the
    /// root scheduler fiber.
    static SCHED_FIBER: RefCell<Option<Fiber>> = const { RefCell::new(None) };
}

impl Scheduler {
    pub(crate) fn new_with_idler(
        threads: usize,
        use_caller: bool,
        idler: Arc<dyn Idler>,
    ) -> Scheduler {
        assert!(threads >= 1, "scheduler needs at least one thread");
        let root_thread = use_caller.then(|| thread::current().id());
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            idler: OnceLock::new(),
            stopping: AtomicBool::new(false),
            auto_stop: AtomicBool::new(false),
            thread_count: threads,
            root_thread,
            root_fiber: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        });
        let _ = shared.idler.set(idler);
        let scheduler = Scheduler { shared };

        let spawn_count = if use_caller {
            assert!(
                Scheduler::current().is_none(),
                "thread already hosts a scheduler"
            );
            SCHEDULER.with(|s| *s.borrow_mut() = Some(scheduler.clone()));
            let weak = Arc::downgrade(&scheduler.shared);
            let root_fiber = Fiber::with_stack_size(
                move || {
                    if let Some(shared) = weak.upgrade() {
                        Scheduler { shared }.run();
                    }
                },
                SCHEDULER_STACK_SIZE,
            );
            SCHED_FIBER.with(|f| *f.borrow_mut() = Some(root_fiber.clone()));
            *scheduler.shared.root_fiber.lock().unwrap() = Some(root_fiber);
            threads - 1
        } else {
            threads
        };

        let mut workers = scheduler.shared.workers.lock().unwrap();
        for _ in 0..spawn_count {
            let scheduler = scheduler.clone();
            workers.push(thread::spawn(move || {
                SCHEDULER.with(|s| *s.borrow_mut() = Some(scheduler.clone()));
                SCHED_FIBER.with(|f| *f.borrow_mut() = Some(Fiber::current()));
                scheduler.run();
                SCHED_FIBER.with(|f| f.borrow_mut().take());
                SCHEDULER.with(|s| s.borrow_mut().take());
            }));
        }
        drop(workers);
        scheduler
    }

    /// The scheduler owning the current thread, if any.
    pub fn current() -> Option<Scheduler> {
        SCHEDULER.with(|s| s.borrow().clone())
    }

    pub(crate) fn same_as(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Appends a callable to the ready queue; it runs on its own fiber so
    /// it may suspend.
    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        let mut f = Some(f);
        self.push(Item {
            task: Task::Call(Box::new(move || {
                if let Some(f) = f.take() {
                    f()
                }
            })),
            thread: None,
        });
    }

    /// Appends a callable bound to a specific worker thread.
    pub fn schedule_on(&self, thread: ThreadId, f: impl FnOnce() + Send + 'static) {
        let mut f = Some(f);
        self.push(Item {
            task: Task::Call(Box::new(move || {
                if let Some(f) = f.take() {
                    f()
                }
            })),
            thread: Some(thread),
        });
    }

    /// Appends a fiber to the ready queue.
    pub fn schedule_fiber(&self, fiber: Fiber) {
        self.push(Item {
            task: Task::Fiber(fiber),
            thread: None,
        });
    }

    /// Appends a fiber bound to a specific worker thread.
    pub fn schedule_fiber_on(&self, thread: ThreadId, fiber: Fiber) {
        self.push(Item {
            task: Task::Fiber(fiber),
            thread: Some(thread),
        });
    }

    fn push(&self, item: Item) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(item);
        let first = queue.len() == 1;
        drop(queue);
        if first {
            self.idler().tickle();
        }
    }

    /// True once [`stop`](Scheduler::stop) was called; an idle fiber may
    /// then wind down even with timers still registered.
    pub(crate) fn stopped_explicitly(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    /// True once [`stop`](Scheduler::stop) was called, or, while a
    /// [`dispatch`](Scheduler::dispatch) is draining, whenever the ready
    /// queue is empty.
    pub fn stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
            || (self.shared.auto_stop.load(Ordering::Acquire)
                && self.shared.queue.lock().unwrap().is_empty())
    }

    /// Stops the pool: sets the stopping flag, wakes every worker, drains
    /// the caller thread's share of the workloop when this is a
    /// use-caller scheduler, and joins the spawned workers.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        for _ in 0..self.shared.thread_count {
            self.idler().tickle();
        }
        if self.shared.root_thread == Some(thread::current().id()) {
            let root = self.shared.root_fiber.lock().unwrap().clone();
            if let Some(root) = root {
                while root.state() != State::Term {
                    root.yield_to(true);
                }
            }
            SCHED_FIBER.with(|f| {
                let same = f
                    .borrow()
                    .as_ref()
                    .is_some_and(|fib| self.shared.root_fiber.lock().unwrap().as_ref().is_some_and(|r| r.ptr_eq(fib)));
                if same {
                    f.borrow_mut().take();
                }
            });
            SCHEDULER.with(|s| {
                let same = s.borrow().as_ref().is_some_and(|sch| sch.same_as(self));
                if same {
                    s.borrow_mut().take();
                }
            });
        }
        let workers = std::mem::take(&mut *self.shared.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.join();
        }
    }

    /// Re-schedules the current fiber on this scheduler (with optional
    /// thread affinity) and yields, migrating the computation between
    /// pools or threads. A no-op when already running in the right
    /// place.
    pub fn switch_to(&self, thread: Option<ThreadId>) {
        let current = Scheduler::current().expect("switch_to outside a scheduler thread");
        if current.same_as(self) && thread.map_or(true, |t| t == std::thread::current().id()) {
            return;
        }
        let fiber = Fiber::current();
        match thread {
            Some(thread) => self.schedule_fiber_on(thread, fiber),
            None => self.schedule_fiber(fiber),
        }
        current.yield_to();
    }

    /// Transfers control to this thread's scheduling fiber so it can pick
    /// up the next work item. The current fiber must already have been
    /// re-scheduled (or registered with an I/O manager) or it will never
    /// resume.
    pub fn yield_to(&self) {
        debug_assert!(Scheduler::current().is_some_and(|s| s.same_as(self)));
        let sched_fiber =
            SCHED_FIBER.with(|f| f.borrow().clone()).expect("no scheduling fiber on this thread");
        if sched_fiber.state() == State::Term {
            sched_fiber.reset();
        }
        let on_root = self.shared.root_thread == Some(thread::current().id());
        sched_fiber.yield_to(on_root);
    }

    /// Drains the ready queue on the calling thread and returns once it is
    /// empty and the idle fiber has wound down. Only meaningful on the
    /// thread that constructed a use-caller scheduler.
    pub fn dispatch(&self) {
        assert_eq!(
            self.shared.root_thread,
            Some(thread::current().id()),
            "dispatch from a thread that does not own this scheduler"
        );
        self.shared.auto_stop.store(true, Ordering::Release);
        let root = self
            .shared
            .root_fiber
            .lock()
            .unwrap()
            .clone()
            .expect("use-caller scheduler lost its root fiber");
        if root.state() == State::Term {
            root.reset();
        }
        root.yield_to(true);
        self.shared.auto_stop.store(false, Ordering::Release);
    }

    fn idler(&self) -> &Arc<dyn Idler> {
        self.shared.idler.get().expect("scheduler idler not installed")
    }

    /// The workloop. Runs on the thread fiber of every spawned worker and
    /// inside the root scheduler fiber of a hijacked caller thread.
    fn run(&self) {
        let me = thread::current().id();
        let idler = Arc::clone(self.idler());
        let idle_fiber = {
            let scheduler = self.clone();
            Fiber::with_stack_size(move || idler.idle(&scheduler), IDLE_STACK_SIZE)
        };
        trace!("worker {:?} entering workloop", me);
        loop {
            let item = {
                let mut queue = self.shared.queue.lock().unwrap();
                let mut found = None;
                for index in 0..queue.len() {
                    let item = &queue[index];
                    if item.thread.is_some_and(|t| t != me) {
                        continue;
                    }
                    // A fiber still running elsewhere stays queued for a
                    // later pass.
                    if let Task::Fiber(fiber) = &item.task {
                        if fiber.state() == State::Exec {
                            continue;
                        }
                    }
                    found = queue.remove(index);
                    break;
                }
                found
            };
            match item {
                Some(Item {
                    task: Task::Fiber(fiber),
                    ..
                }) => {
                    if fiber.state() != State::Term {
                        self.resume(fiber);
                    }
                }
                Some(Item {
                    task: Task::Call(mut call),
                    ..
                }) => {
                    // Bare callables get their own fiber so they can
                    // suspend like any other work.
                    let fiber = Fiber::new(move || call());
                    self.resume(fiber);
                }
                None => {
                    if idle_fiber.state() == State::Term {
                        break;
                    }
                    // Items pinned to another thread stay queued; wake
                    // someone who can claim them before going idle.
                    let pinned_elsewhere = self
                        .shared
                        .queue
                        .lock()
                        .unwrap()
                        .iter()
                        .any(|item| item.thread.is_some_and(|t| t != me));
                    if pinned_elsewhere {
                        self.idler().tickle();
                    }
                    idle_fiber.call();
                }
            }
        }
        trace!("worker {:?} leaving workloop", me);
    }

    /// Resumes one work fiber, surviving any panic it re-raises.
    fn resume(&self, fiber: Fiber) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| fiber.yield_to(true))) {
            let msg = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
                .unwrap_or("<non-string payload>");
            error!("scheduled work panicked: {}", msg);
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("threads", &self.shared.thread_count)
            .field("use_caller", &self.shared.root_thread.is_some())
            .field("stopping", &self.shared.stopping.load(Ordering::Relaxed))
            .finish()
    }
}

/// Counting semaphore for the worker pool's idle wait.
#[derive(Default)]
struct Semaphore {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.condvar.wait(count).unwrap();
        }
        *count -= 1;
    }

    fn notify(&self) {
        *self.count.lock().unwrap() += 1;
        self.condvar.notify_one();
    }
}

#[derive(Default)]
struct SemaphoreIdler {
    semaphore: Semaphore,
}

impl Idler for SemaphoreIdler {
    fn idle(&self, scheduler: &Scheduler) {
        while !scheduler.stopping() {
            self.semaphore.wait();
            Fiber::yield_now();
        }
    }

    fn tickle(&self) {
        self.semaphore.notify();
    }
}

/// A scheduler that idles on a semaphore: pure computation, no I/O
/// integration.
pub struct WorkerPool {
    scheduler: Scheduler,
}

impl WorkerPool {
    /// Creates a pool of `threads` workers. With `use_caller` the calling
    /// thread counts as one of them and must drive its share through
    /// [`dispatch`](Scheduler::dispatch).
    pub fn new(threads: usize, use_caller: bool) -> WorkerPool {
        WorkerPool {
            scheduler: Scheduler::new_with_idler(
                threads,
                use_caller,
                Arc::new(SemaphoreIdler::default()),
            ),
        }
    }

    /// The underlying scheduler handle.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        self.scheduler.schedule(f);
    }

    pub fn schedule_on(&self, thread: ThreadId, f: impl FnOnce() + Send + 'static) {
        self.scheduler.schedule_on(thread, f);
    }

    pub fn schedule_fiber(&self, fiber: Fiber) {
        self.scheduler.schedule_fiber(fiber);
    }

    pub fn schedule_fiber_on(&self, thread: ThreadId, fiber: Fiber) {
        self.scheduler.schedule_fiber_on(thread, fiber);
    }

    pub fn dispatch(&self) {
        self.scheduler.dispatch();
    }

    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

// The weak back-reference in the root fiber's entry closure breaks the
// cycle scheduler -> root fiber -> scheduler, so dropping the last outside
// handle reclaims the pool.
#[allow(dead_code)]
fn _assert_send_sync() {
    fn check<T: Send + Sync>() {}
    check::<Scheduler>();
    check::<WorkerPool>();
}
