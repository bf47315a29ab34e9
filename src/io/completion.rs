//! Completion-model I/O manager for Windows, built on an I/O completion
//! port.
//!
//! Handles are associated with the port once at creation. Before each
//! overlapped kernel call the operation's [`AsyncEvent`] is registered,
//! mapping its `OVERLAPPED` address back to the waiting fiber; the real
//! completion (including one produced by `CancelIoEx`) fills the result
//! slots and reschedules the fiber. A tickle posts a sentinel completion
//! key. Raw Win32 event handles are watched by auxiliary wait blocks of
//! up to `MAXIMUM_WAIT_OBJECTS - 1` events each.

#![cfg(windows)]

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use log::{error, trace};

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_INVALID_HANDLE, ERROR_NOT_FOUND, HANDLE,
    INVALID_HANDLE_VALUE, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::System::Threading::{CreateEventW, SetEvent, WaitForMultipleObjects, INFINITE};
use windows_sys::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus,
    OVERLAPPED,
};

use crate::fiber::Fiber;
use crate::scheduler::{Idler, Scheduler};
use crate::sys::windows::{RtlNtStatusToDosError, MAXIMUM_WAIT_OBJECTS};
use crate::timer::{Timer, TimerManager};
use crate::{Error, Result};

const TICKLE_KEY: usize = usize::MAX;

/// Per-operation completion record: an embedded `OVERLAPPED` plus slots
/// the idle fiber fills before rescheduling the waiter.
#[repr(C)]
pub struct AsyncEvent {
    pub overlapped: OVERLAPPED,
    /// Whether the dequeued completion reported success.
    pub ret: bool,
    pub bytes: u32,
    pub completion_key: usize,
    /// DOS error translated from the overlapped's NTSTATUS.
    pub error: u32,
}

impl AsyncEvent {
    pub fn new() -> AsyncEvent {
        AsyncEvent {
            // SAFETY: an all-zero OVERLAPPED is the documented initial state.
            overlapped: unsafe { std::mem::zeroed() },
            ret: false,
            bytes: 0,
            completion_key: 0,
            error: 0,
        }
    }
}

impl Default for AsyncEvent {
    fn default() -> AsyncEvent {
        AsyncEvent::new()
    }
}

impl fmt::Debug for AsyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncEvent")
            .field("ret", &self.ret)
            .field("bytes", &self.bytes)
            .field("error", &self.error)
            .finish()
    }
}

struct Waiter {
    scheduler: Scheduler,
    fiber: Fiber,
    event: *mut AsyncEvent,
}

// The raw AsyncEvent pointer is owned by the suspended fiber's stack and
// stays valid until that fiber is rescheduled.
unsafe impl Send for Waiter {}

type WaitCallback = Arc<dyn Fn() + Send + Sync>;

/// One `WaitForMultipleObjects` batch: slot 0 is the control event used
/// to rescan after registration changes.
struct WaitBlock {
    control: HANDLE,
    watched: Mutex<Vec<(HANDLE, WaitCallback)>>,
}

unsafe impl Send for WaitBlock {}
unsafe impl Sync for WaitBlock {}

impl WaitBlock {
    fn new() -> Result<Arc<WaitBlock>> {
        let control = unsafe { CreateEventW(std::ptr::null(), 0, 0, std::ptr::null()) };
        if control.is_null() {
            return Err(Error::from_os_error(unsafe { GetLastError() } as i32));
        }
        let block = Arc::new(WaitBlock {
            control,
            watched: Mutex::new(Vec::new()),
        });
        let runner = Arc::clone(&block);
        std::thread::spawn(move || runner.run());
        Ok(block)
    }

    fn has_room(&self) -> bool {
        self.watched.lock().unwrap().len() < MAXIMUM_WAIT_OBJECTS - 1
    }

    fn add(&self, handle: HANDLE, callback: WaitCallback) {
        self.watched.lock().unwrap().push((handle, callback));
        unsafe { SetEvent(self.control) };
    }

    fn remove(&self, handle: HANDLE) {
        self.watched.lock().unwrap().retain(|(h, _)| *h != handle);
        unsafe { SetEvent(self.control) };
    }

    fn run(&self) {
        loop {
            let mut handles: Vec<HANDLE> = vec![self.control];
            {
                let watched = self.watched.lock().unwrap();
                handles.extend(watched.iter().map(|(h, _)| *h));
            }
            let rc = unsafe {
                WaitForMultipleObjects(handles.len() as u32, handles.as_ptr(), 0, INFINITE)
            };
            if rc == WAIT_FAILED || rc == WAIT_TIMEOUT {
                error!("WaitForMultipleObjects: {}", unsafe { GetLastError() });
                return;
            }
            let index = (rc - WAIT_OBJECT_0) as usize;
            if index == 0 {
                // Control event: registrations changed, rescan.
                continue;
            }
            let handle = handles[index];
            let callback = {
                let mut watched = self.watched.lock().unwrap();
                match watched.iter().position(|(h, _)| *h == handle) {
                    Some(pos) => Some(watched.remove(pos).1),
                    None => None,
                }
            };
            if let Some(callback) = callback {
                callback();
            }
        }
    }
}

struct Port {
    handle: HANDLE,
    pending: Mutex<HashMap<usize, Waiter>>,
    timers: TimerManager,
    wait_blocks: Mutex<Vec<Arc<WaitBlock>>>,
}

unsafe impl Send for Port {}
unsafe impl Sync for Port {}

impl Drop for Port {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.handle) };
    }
}

impl Idler for Port {
    fn idle(&self, scheduler: &Scheduler) {
        loop {
            if scheduler.stopping()
                && self.pending.lock().unwrap().is_empty()
                && (scheduler.stopped_explicitly() || !self.timers.has_timers())
            {
                return;
            }
            let timeout = self
                .timers
                .next_timer()
                .map(|us| (us / 1000).min(u64::from(u32::MAX - 1)) as u32)
                .unwrap_or(INFINITE);
            let mut bytes = 0u32;
            let mut key = 0usize;
            let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();
            let ret = unsafe {
                GetQueuedCompletionStatus(self.handle, &mut bytes, &mut key, &mut overlapped, timeout)
            };
            self.timers.process_timers();
            if ret != 0 && key == TICKLE_KEY {
                Fiber::yield_now();
                continue;
            }
            if overlapped.is_null() {
                // Timed out waiting: timers were processed above.
                Fiber::yield_now();
                continue;
            }

            let waiter = {
                let mut pending = self.pending.lock().unwrap();
                pending.remove(&(overlapped as usize))
            };
            let Some(waiter) = waiter else {
                continue;
            };
            unsafe {
                let event = &mut *waiter.event;
                event.ret = ret != 0;
                event.bytes = bytes;
                event.completion_key = key;
                event.error = RtlNtStatusToDosError(event.overlapped.Internal as i32);
            }
            trace!("completion for {:p}", overlapped);
            waiter.scheduler.schedule_fiber(waiter.fiber);
            Fiber::yield_now();
        }
    }

    fn tickle(&self) {
        if unsafe {
            PostQueuedCompletionStatus(self.handle, 0, TICKLE_KEY, std::ptr::null_mut())
        } == 0
        {
            error!("PostQueuedCompletionStatus: {}", unsafe { GetLastError() });
        }
    }
}

/// Cloneable innards shared between the public handle and the sockets
/// attached to it.
#[derive(Clone)]
pub(crate) struct IoShared {
    scheduler: Scheduler,
    port: Arc<Port>,
}

impl IoShared {
    /// Associates `handle` with the completion port; done once per
    /// handle, at creation.
    pub(crate) fn register_file(&self, handle: HANDLE) -> Result<()> {
        let ret = unsafe { CreateIoCompletionPort(handle, self.port.handle, 0, 0) };
        if ret != self.port.handle {
            return Err(Error::from_os_error(unsafe { GetLastError() } as i32));
        }
        Ok(())
    }

    /// Records the mapping from `event`'s `OVERLAPPED` to the current
    /// fiber. Must be called before the overlapped kernel call is
    /// issued; `event` must stay alive until the completion arrives.
    pub(crate) fn register_event(&self, event: &mut AsyncEvent) {
        let scheduler = Scheduler::current()
            .expect("I/O registration outside a scheduler thread");
        let waiter = Waiter {
            scheduler,
            fiber: Fiber::current(),
            event: event as *mut AsyncEvent,
        };
        let key = &event.overlapped as *const OVERLAPPED as usize;
        let mut pending = self.port.pending.lock().unwrap();
        assert!(
            pending.insert(key, waiter).is_none(),
            "OVERLAPPED already registered"
        );
    }

    /// Forgets a registration whose kernel call completed synchronously
    /// and will never post to the port.
    pub(crate) fn unregister_event(&self, event: &AsyncEvent) -> bool {
        let key = &event.overlapped as *const OVERLAPPED as usize;
        self.port.pending.lock().unwrap().remove(&key).is_some()
    }

    /// Requests cancellation of the overlapped operation; the mapping is
    /// removed by the genuine completion (which carries
    /// `ERROR_OPERATION_ABORTED`).
    pub(crate) fn cancel_event(&self, handle: HANDLE, event: &AsyncEvent) {
        if unsafe { CancelIoEx(handle, &event.overlapped) } == 0 {
            let err = unsafe { GetLastError() };
            // Nothing in flight (or the handle is already gone): the
            // posted cancellation flag alone settles the operation.
            if err != ERROR_INVALID_HANDLE && err != ERROR_NOT_FOUND {
                error!("CancelIoEx: {}", err);
            }
        }
    }

    /// Watches a raw Win32 event handle, scheduling `callback` once it
    /// signals. Each internal wait block watches up to
    /// `MAXIMUM_WAIT_OBJECTS - 1` events.
    pub(crate) fn register_wait_event(
        &self,
        handle: HANDLE,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<()> {
        let callback: WaitCallback = Arc::new(callback);
        let mut blocks = self.port.wait_blocks.lock().unwrap();
        if let Some(block) = blocks.iter().find(|block| block.has_room()) {
            block.add(handle, callback);
            return Ok(());
        }
        let block = WaitBlock::new()?;
        block.add(handle, callback);
        blocks.push(block);
        Ok(())
    }

    /// Stops watching a raw event handle.
    pub(crate) fn unregister_wait_event(&self, handle: HANDLE) {
        for block in self.port.wait_blocks.lock().unwrap().iter() {
            block.remove(handle);
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
            self.port
                .timers
                .register_internal(delay_us, Arc::new(callback), recurring);
        if at_front {
            self.port.tickle();
        }
        timer
    }
}

/// A [`Scheduler`] whose idle fiber drains an I/O completion port.
pub struct IoManager {
    shared: IoShared,
}

impl IoManager {
    /// Creates an I/O manager with `threads` workers; with `use_caller`
    /// the constructing thread is one of them and drives its share via
    /// [`dispatch`](IoManager::dispatch).
    pub fn new(threads: usize, use_caller: bool) -> Result<IoManager> {
        let handle =
            unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 0) };
        if handle.is_null() {
            return Err(Error::from_os_error(unsafe { GetLastError() } as i32));
        }
        let port = Arc::new(Port {
            handle,
            pending: Mutex::new(HashMap::new()),
            timers: TimerManager::new(),
            wait_blocks: Mutex::new(Vec::new()),
        });
        let scheduler =
            Scheduler::new_with_idler(threads, use_caller, Arc::clone(&port) as Arc<dyn Idler>);
        Ok(IoManager {
            shared: IoShared { scheduler, port },
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

    /// Associates a handle with the completion port.
    pub fn register_file(&self, handle: HANDLE) -> Result<()> {
        self.shared.register_file(handle)
    }

    /// Registers a per-operation completion record for the current fiber;
    /// see [`IoShared::register_event`].
    pub fn register_event(&self, event: &mut AsyncEvent) {
        self.shared.register_event(event);
    }

    /// Forgets a registration that will never post to the port.
    pub fn unregister_event(&self, event: &AsyncEvent) -> bool {
        self.shared.unregister_event(event)
    }

    /// Requests cancellation of an overlapped operation.
    pub fn cancel_event(&self, handle: HANDLE, event: &AsyncEvent) {
        self.shared.cancel_event(handle, event);
    }

    /// Watches a raw Win32 event handle.
    pub fn register_wait_event(
        &self,
        handle: HANDLE,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<()> {
        self.shared.register_wait_event(handle, callback)
    }

    /// Stops watching a raw event handle.
    pub fn unregister_wait_event(&self, handle: HANDLE) {
        self.shared.unregister_wait_event(handle);
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
        &self.shared.port.timers
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
            .field("pending", &self.shared.port.pending.lock().unwrap().len())
            .finish()
    }
}
