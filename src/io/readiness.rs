//! Readiness-model I/O manager for Unix: epoll on Linux, kqueue on the
//! BSDs and macOS.
//!
//! A registration is keyed by (fd, direction) and holds the scheduler to
//! resume on plus either the registering fiber or a bare callback. The
//! idle fiber blocks in the selector, bounded by the next timer deadline;
//! each fired direction schedules its waiter exactly once and is removed
//! from the entry. Errors and hang-ups reported by the kernel wake every
//! direction registered on the descriptor.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, trace};

use crate::fiber::Fiber;
use crate::io::Direction;
use crate::scheduler::{Idler, Scheduler};
use crate::sys::{event, Events, Selector, Waker};
use crate::timer::{Timer, TimerManager};
use crate::{Error, Result};

type Callback = Arc<dyn Fn() + Send + Sync>;

enum WaitTarget {
    Fiber(Fiber),
    Callback(Callback),
}

struct Waiter {
    scheduler: Scheduler,
    target: WaitTarget,
}

impl Waiter {
    fn schedule(self) {
        match self.target {
            WaitTarget::Fiber(fiber) => self.scheduler.schedule_fiber(fiber),
            WaitTarget::Callback(callback) => self.scheduler.schedule(move || callback()),
        }
    }
}

#[derive(Default)]
struct FdEntry {
    read: Option<Waiter>,
    write: Option<Waiter>,
    close: Option<Waiter>,
}

impl FdEntry {
    fn slot_mut(&mut self, direction: Direction) -> &mut Option<Waiter> {
        if direction == Direction::READ {
            &mut self.read
        } else if direction == Direction::WRITE {
            &mut self.write
        } else {
            &mut self.close
        }
    }

    fn mask(&self) -> Option<Direction> {
        let mut mask: Option<Direction> = None;
        let mut fold = |dir: Direction| {
            mask = Some(match mask {
                Some(mask) => mask | dir,
                None => dir,
            });
        };
        if self.read.is_some() {
            fold(Direction::READ);
        }
        if self.write.is_some() {
            fold(Direction::WRITE);
        }
        if self.close.is_some() {
            fold(Direction::CLOSE);
        }
        mask
    }
}

struct Reactor {
    selector: Selector,
    waker: Waker,
    pending: Mutex<HashMap<RawFd, FdEntry>>,
    timers: TimerManager,
}

impl Idler for Reactor {
    fn idle(&self, scheduler: &Scheduler) {
        let mut events = Events::with_capacity(64);
        loop {
            // Pending timers keep a dispatch alive (a fiber may be
            // sleeping on one), but an explicit stop does not wait for
            // them.
            if scheduler.stopping()
                && self.pending.lock().unwrap().is_empty()
                && (scheduler.stopped_explicitly() || !self.timers.has_timers())
            {
                return;
            }
            let timeout = self.timers.next_timer().map(Duration::from_micros);
            if let Err(err) = self.selector.select(&mut events, timeout) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                panic!("selector wait failed: {}", err);
            }
            self.timers.process_timers();

            for event in events.iter() {
                let fd = event::fd(event);
                if fd == self.waker.as_raw_fd() {
                    self.waker.drain();
                    continue;
                }
                let mut pending = self.pending.lock().unwrap();
                let Some(entry) = pending.get_mut(&fd) else {
                    continue;
                };
                let err = event::is_error_or_hup(event);
                if event::is_readable(event) || err {
                    if let Some(waiter) = entry.read.take() {
                        trace!("fd {} readable, waking waiter", fd);
                        waiter.schedule();
                    }
                }
                if event::is_writable(event) || err {
                    if let Some(waiter) = entry.write.take() {
                        trace!("fd {} writable, waking waiter", fd);
                        waiter.schedule();
                    }
                }
                if event::is_closed(event) || err {
                    if let Some(waiter) = entry.close.take() {
                        trace!("fd {} remote close, waking waiter", fd);
                        waiter.schedule();
                    }
                }
                match entry.mask() {
                    None => {
                        if let Err(err) = self.selector.delete(fd) {
                            error!("deregistering fd {}: {}", fd, err);
                        }
                        pending.remove(&fd);
                    }
                    Some(mask) => {
                        if let Err(err) = self.selector.modify(fd, mask) {
                            error!("narrowing interest on fd {}: {}", fd, err);
                        }
                    }
                }
            }
            // Give the scheduler a chance to run the woken work.
            Fiber::yield_now();
        }
    }

    fn tickle(&self) {
        if let Err(err) = self.waker.wake() {
            error!("tickle failed: {}", err);
        }
    }
}

/// Cloneable innards shared between the public handle and the sockets
/// attached to it.
#[derive(Clone)]
pub(crate) struct IoShared {
    scheduler: Scheduler,
    reactor: Arc<Reactor>,
}

impl IoShared {
    /// Registers interest in `directions` on `fd`, to resume the current
    /// fiber. Each direction of a descriptor can hold only one waiter at
    /// a time; registration is consumed when the direction fires.
    pub(crate) fn register_event(&self, fd: RawFd, directions: Direction) -> Result<()> {
        self.register(fd, directions, None)
    }

    /// Like [`register_event`](IoShared::register_event) but schedules
    /// `callback` instead of resuming a fiber.
    pub(crate) fn register_event_with(
        &self,
        fd: RawFd,
        directions: Direction,
        callback: Callback,
    ) -> Result<()> {
        self.register(fd, directions, Some(callback))
    }

    fn register(
        &self,
        fd: RawFd,
        directions: Direction,
        callback: Option<Callback>,
    ) -> Result<()> {
        let scheduler = Scheduler::current()
            .expect("I/O registration outside a scheduler thread");
        trace!("registering fd {} for {:?}", fd, directions);
        let make_waiter = |callback: &Option<Callback>| Waiter {
            scheduler: scheduler.clone(),
            target: match callback {
                Some(callback) => WaitTarget::Callback(Arc::clone(callback)),
                None => WaitTarget::Fiber(Fiber::current()),
            },
        };

        let mut pending = self.reactor.pending.lock().unwrap();
        match pending.entry(fd) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let old_mask = entry.mask().expect("registered entry with empty mask");
                for direction in [Direction::READ, Direction::WRITE, Direction::CLOSE] {
                    if directions.contains(direction) {
                        let slot = entry.slot_mut(direction);
                        assert!(
                            slot.is_none(),
                            "{:?} already registered for fd {}",
                            direction,
                            fd
                        );
                        *slot = Some(make_waiter(&callback));
                    }
                }
                if let Err(err) = self.reactor.selector.modify(fd, old_mask | directions) {
                    for direction in [Direction::READ, Direction::WRITE, Direction::CLOSE] {
                        if directions.contains(direction) {
                            entry.slot_mut(direction).take();
                        }
                    }
                    return Err(Error::from(err));
                }
            }
            Entry::Vacant(vacant) => {
                self.reactor.selector.add(fd, directions)?;
                let mut entry = FdEntry::default();
                for direction in [Direction::READ, Direction::WRITE, Direction::CLOSE] {
                    if directions.contains(direction) {
                        *entry.slot_mut(direction) = Some(make_waiter(&callback));
                    }
                }
                vacant.insert(entry);
            }
        }
        Ok(())
    }

    /// Wakes the waiters for `directions` immediately and removes those
    /// directions from the entry; the woken fibers observe no I/O
    /// progress, retry their syscall, and see whatever cancellation their
    /// caller posted.
    pub(crate) fn cancel_event(&self, fd: RawFd, directions: Direction) {
        self.remove_directions(fd, directions, true);
    }

    /// Removes registrations without waking their waiters.
    pub(crate) fn unregister_event(&self, fd: RawFd, directions: Direction) {
        self.remove_directions(fd, directions, false);
    }

    fn remove_directions(&self, fd: RawFd, directions: Direction, wake: bool) {
        let mut pending = self.reactor.pending.lock().unwrap();
        let Some(entry) = pending.get_mut(&fd) else {
            return;
        };
        trace!("cancelling {:?} on fd {}", directions, fd);
        for direction in [Direction::READ, Direction::WRITE, Direction::CLOSE] {
            if directions.contains(direction) {
                if let Some(waiter) = entry.slot_mut(direction).take() {
                    if wake {
                        waiter.schedule();
                    }
                }
            }
        }
        match entry.mask() {
            None => {
                if let Err(err) = self.reactor.selector.delete(fd) {
                    error!("deregistering fd {}: {}", fd, err);
                }
                pending.remove(&fd);
            }
            Some(mask) => {
                if let Err(err) = self.reactor.selector.modify(fd, mask) {
                    error!("narrowing interest on fd {}: {}", fd, err);
                }
            }
        }
    }

    /// Registers a timer with the embedded manager, re-bounding the
    /// kernel wait when the new timer becomes the earliest.
    pub(crate) fn register_timer(
        &self,
        delay_us: u64,
        callback: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        let (timer, at_front) =
            self.reactor
                .timers
                .register_internal(delay_us, Arc::new(callback), recurring);
        if at_front {
            self.reactor.tickle();
        }
        timer
    }
}

/// A [`Scheduler`] whose idle fiber multiplexes the kernel event source,
/// integrating readiness events and timers with fiber scheduling.
pub struct IoManager {
    shared: IoShared,
}

impl IoManager {
    /// Creates an I/O manager with `threads` workers; with `use_caller`
    /// the constructing thread is one of them and drives its share via
    /// [`dispatch`](IoManager::dispatch).
    pub fn new(threads: usize, use_caller: bool) -> Result<IoManager> {
        let selector = Selector::new()?;
        let waker = Waker::new()?;
        selector.add(waker.as_raw_fd(), Direction::READ)?;
        let reactor = Arc::new(Reactor {
            selector,
            waker,
            pending: Mutex::new(HashMap::new()),
            timers: TimerManager::new(),
        });
        let scheduler =
            Scheduler::new_with_idler(threads, use_caller, Arc::clone(&reactor) as Arc<dyn Idler>);
        Ok(IoManager {
            shared: IoShared { scheduler, reactor },
        })
    }

    pub(crate) fn shared(&self) -> &IoShared {
        &self.shared
    }

    /// See [`Scheduler::schedule`].
    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.scheduler.schedule(f);
    }

    /// See [`Scheduler::schedule_fiber`].
    pub fn schedule_fiber(&self, fiber: Fiber) {
        self.shared.scheduler.schedule_fiber(fiber);
    }

    /// See [`Scheduler::dispatch`].
    pub fn dispatch(&self) {
        self.shared.scheduler.dispatch();
    }

    /// See [`Scheduler::stop`].
    pub fn stop(&self) {
        self.shared.scheduler.stop();
    }

    /// The scheduler backing this I/O manager.
    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    /// Registers interest on a descriptor for the current fiber; see
    /// the socket layer for the full suspension protocol.
    pub fn register_event(&self, fd: RawFd, directions: Direction) -> Result<()> {
        self.shared.register_event(fd, directions)
    }

    /// Registers a callback to be scheduled when `directions` fire.
    pub fn register_event_with(
        &self,
        fd: RawFd,
        directions: Direction,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<()> {
        self.shared.register_event_with(fd, directions, Arc::new(callback))
    }

    /// Immediately wakes and removes the registrations for `directions`.
    pub fn cancel_event(&self, fd: RawFd, directions: Direction) {
        self.shared.cancel_event(fd, directions);
    }

    /// Removes registrations without waking anyone.
    pub fn unregister_event(&self, fd: RawFd, directions: Direction) {
        self.shared.unregister_event(fd, directions);
    }

    /// Registers a timer; see [`TimerManager::register_timer`].
    pub fn register_timer(
        &self,
        delay_us: u64,
        callback: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.shared.register_timer(delay_us, callback, recurring)
    }

    /// The embedded timer manager.
    pub fn timer_manager(&self) -> &TimerManager {
        &self.shared.reactor.timers
    }

    /// Suspends the current fiber for `delay_us` microseconds.
    pub fn sleep(&self, delay_us: u64) {
        let scheduler = Scheduler::current().expect("sleep outside a scheduler thread");
        let fiber = Fiber::current();
        let resume_on = scheduler.clone();
        let _timer = self.shared.register_timer(
            delay_us,
            move || resume_on.schedule_fiber(fiber.clone()),
            false,
        );
        scheduler.yield_to();
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.shared.scheduler.stop();
    }
}

impl fmt::Debug for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.shared.scheduler)
            .field("pending", &self.shared.reactor.pending.lock().unwrap().len())
            .finish()
    }
}
