//! Stackful fibers with explicit, cooperative transfers of control.
//!
//! A [`Fiber`] owns a stack and a saved machine context. Control moves
//! between fibers in one of two ways:
//!
//! - **Asymmetric**: [`Fiber::call`] enters a fiber and records the caller
//!   as its *outer*; [`Fiber::yield_now`] (and normal termination) return
//!   to the outer.
//! - **Symmetric**: [`Fiber::yield_to`] transfers to an arbitrary suspended
//!   fiber without creating an outer link. When requested, termination of
//!   the target routes control back to the fiber that performed the
//!   transfer (the *terminate-outer*), rather than up a call chain.
//!
//! A panic escaping a fiber's entry function is captured into the fiber;
//! the next fiber that calls or yields into it re-raises the payload.
//!
//! Handles are cheap to clone and may be sent across threads, but a fiber
//! is only ever executed by one thread at a time; `call` and `yield_to`
//! enforce this through the state machine.

use std::any::Any;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

mod context;
mod stack;

use self::context::Context;

/// Default stack size for a new fiber, in bytes.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Execution state of a fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Constructed or reset, never entered (or not since the reset).
    Init,
    /// Suspended at an explicit yield.
    Hold,
    /// Currently running on some thread.
    Exec,
    /// Terminated by a captured panic.
    Except,
    /// Entry function returned normally.
    Term,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Init,
            1 => State::Hold,
            2 => State::Exec,
            3 => State::Except,
            4 => State::Term,
            _ => unreachable!("invalid fiber state"),
        }
    }
}

type EntryFn = Box<dyn FnMut() + Send + 'static>;

/// A stackful fiber. Cloning the handle does not clone the fiber; all
/// clones refer to the same stack and state.
#[derive(Clone)]
pub struct Fiber {
    inner: Arc<Inner>,
}

struct Inner {
    state: AtomicU8,
    context: Context,
    /// Entry function; re-run from the top after a `reset`.
    entry: UnsafeCell<Option<EntryFn>>,
    /// The fiber that `call`-ed this one; control returns there on yield
    /// or termination. Exclusive ownership for the duration of the call.
    outer: UnsafeCell<Option<Fiber>>,
    /// The fiber that last transferred control into this one and has not
    /// yet been acknowledged, together with the state it assumes then.
    yielder: UnsafeCell<Option<Fiber>>,
    yielder_next_state: Cell<State>,
    /// Where to send control when this fiber terminates after having been
    /// entered with `yield_to(true)`. Weak to avoid a cycle with the
    /// originator.
    terminate_outer: UnsafeCell<Weak<Inner>>,
    /// Captured panic payload of an entry function that unwound.
    panic: UnsafeCell<Option<Box<dyn Any + Send>>>,
    /// When cleared, resuming this fiber after a panic does not re-raise;
    /// the payload stays stored for explicit collection.
    auto_rethrow: AtomicBool,
}

// A fiber is executed by at most one thread at a time: `call`/`yield_to`
// assert the state machine, and every UnsafeCell slot is only touched by
// the thread currently executing or switching the fiber. Cross-thread
// handoff of a suspended fiber is ordered by the scheduler's queue lock.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Inner {
    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.context.has_stack() {
            debug_assert!(
                matches!(self.state(), State::Init | State::Term | State::Except),
                "fiber dropped while suspended mid-execution"
            );
        }
    }
}

thread_local! {
    /// Owner of the wrapper fiber for this thread, created lazily.
    static MAIN: RefCell<Option<Fiber>> = const { RefCell::new(None) };
    /// The fiber currently executing on this thread.
    static CURRENT: RefCell<Option<Fiber>> = const { RefCell::new(None) };
}

pub(crate) fn set_current(fiber: Fiber) {
    CURRENT.with(|current| *current.borrow_mut() = Some(fiber));
}

impl Fiber {
    /// Creates a fiber that will run `f` on a stack of
    /// [`DEFAULT_STACK_SIZE`] bytes once first entered.
    ///
    /// # Panics
    ///
    /// Panics if the stack cannot be mapped.
    pub fn new(f: impl FnMut() + Send + 'static) -> Fiber {
        Fiber::with_stack_size(f, DEFAULT_STACK_SIZE)
    }

    /// Creates a fiber with an explicit stack size, rounded up to a whole
    /// number of pages.
    pub fn with_stack_size(f: impl FnMut() + Send + 'static, stack_size: usize) -> Fiber {
        Fiber {
            inner: Arc::new(Inner {
                state: AtomicU8::new(State::Init as u8),
                context: Context::with_stack(stack_size, fiber_entry),
                entry: UnsafeCell::new(Some(Box::new(f))),
                outer: UnsafeCell::new(None),
                yielder: UnsafeCell::new(None),
                yielder_next_state: Cell::new(State::Hold),
                terminate_outer: UnsafeCell::new(Weak::new()),
                panic: UnsafeCell::new(None),
                auto_rethrow: AtomicBool::new(true),
            }),
        }
    }

    /// The fiber currently executing on this thread.
    ///
    /// On first use the calling thread is wrapped in a stackless fiber
    /// record (in [`State::Exec`]) that represents it for the rest of the
    /// thread's lifetime.
    pub fn current() -> Fiber {
        if let Some(fiber) = CURRENT.with(|current| current.borrow().clone()) {
            return fiber;
        }
        let main = Fiber {
            inner: Arc::new(Inner {
                state: AtomicU8::new(State::Exec as u8),
                context: Context::for_thread(),
                entry: UnsafeCell::new(None),
                outer: UnsafeCell::new(None),
                yielder: UnsafeCell::new(None),
                yielder_next_state: Cell::new(State::Hold),
                terminate_outer: UnsafeCell::new(Weak::new()),
                panic: UnsafeCell::new(None),
                auto_rethrow: AtomicBool::new(true),
            }),
        };
        MAIN.with(|slot| *slot.borrow_mut() = Some(main.clone()));
        set_current(main.clone());
        main
    }

    /// Current state of the fiber.
    pub fn state(&self) -> State {
        self.inner.state()
    }

    /// Enters the fiber, recording the current fiber as its outer.
    /// Returns when the callee yields or terminates; a panic captured in
    /// the callee is re-raised here.
    ///
    /// # Panics
    ///
    /// Panics if the fiber is not in [`State::Init`] or [`State::Hold`],
    /// or if it is the current fiber.
    pub fn call(&self) {
        let cur = Fiber::current();
        let state = self.state();
        assert!(
            state == State::Init || state == State::Hold,
            "call on fiber in state {:?}",
            state
        );
        assert!(
            !Arc::ptr_eq(&self.inner, &cur.inner),
            "fiber cannot call itself"
        );
        debug_assert!(unsafe { (*self.inner.outer.get()).is_none() });

        set_current(self.clone());
        unsafe {
            *self.inner.outer.get() = Some(cur.clone());
        }
        self.inner.set_state(State::Exec);
        unsafe {
            cur.inner.context.switch_to(&self.inner.context);
        }
        // The callee yielded or terminated.
        set_current(cur.clone());
        unsafe {
            *self.inner.outer.get() = None;
        }
        cur.process_yielder(true);
    }

    /// Suspends the current fiber back to its outer, leaving it in
    /// [`State::Hold`].
    ///
    /// # Panics
    ///
    /// Panics if the current fiber has no outer (it was entered with
    /// [`yield_to`](Fiber::yield_to), not [`call`](Fiber::call)).
    pub fn yield_now() {
        let cur = Fiber::current();
        debug_assert_eq!(cur.state(), State::Exec);
        let outer =
            unsafe { (*cur.inner.outer.get()).clone() }.expect("yield with no outer fiber");
        unsafe {
            *outer.inner.yielder.get() = Some(cur.clone());
            outer.inner.yielder_next_state.set(State::Hold);
            cur.inner.context.switch_to(&outer.inner.context);
        }
        // Resumed; acknowledge whoever transferred control to us.
        cur.process_yielder(false);
    }

    /// Symmetric transfer: suspends the current fiber (to
    /// [`State::Hold`]) and resumes this one, without linking it as an
    /// outer. With `to_caller_on_terminate` the target's eventual
    /// termination returns control here instead of following a call
    /// chain.
    pub fn yield_to(&self, to_caller_on_terminate: bool) {
        self.yield_to_inner(to_caller_on_terminate, State::Hold);
    }

    fn yield_to_inner(&self, to_caller_on_terminate: bool, next_state: State) {
        let state = self.state();
        assert!(
            state == State::Init || state == State::Hold,
            "yield_to fiber in state {:?}",
            state
        );
        let cur = Fiber::current();
        assert!(
            !Arc::ptr_eq(&self.inner, &cur.inner),
            "fiber cannot yield to itself"
        );
        if to_caller_on_terminate {
            // Termination routes from the outermost fiber of the target's
            // call chain back to us.
            let mut outermost = self.clone();
            while let Some(outer) = unsafe { (*outermost.inner.outer.get()).clone() } {
                outermost = outer;
            }
            unsafe {
                *outermost.inner.terminate_outer.get() = Arc::downgrade(&cur.inner);
            }
        }
        set_current(self.clone());
        self.inner.set_state(State::Exec);
        unsafe {
            *self.inner.yielder.get() = Some(cur.clone());
            self.inner.yielder_next_state.set(next_state);
        }
        let cur_inner: *const Inner = Arc::as_ptr(&cur.inner);
        let target_inner: *const Inner = Arc::as_ptr(&self.inner);
        // Relinquish our own handle: the target's yielder slot keeps the
        // current fiber alive across the switch, so a fiber nobody else
        // references can still be reclaimed once acknowledged.
        drop(cur);
        unsafe {
            (*cur_inner).context.switch_to(&(*target_inner).context);
        }
        // Resumed, possibly on a different thread.
        let cur = unsafe {
            Arc::increment_strong_count(cur_inner);
            Fiber {
                inner: Arc::from_raw(cur_inner),
            }
        };
        set_current(cur.clone());
        cur.process_yielder(true);
    }

    /// Re-initializes the fiber to begin again at its entry function,
    /// reusing the stack and clearing any captured panic.
    ///
    /// # Panics
    ///
    /// Panics unless the state is [`State::Init`], [`State::Term`] or
    /// [`State::Except`].
    pub fn reset(&self) {
        self.reset_impl(None);
    }

    /// Like [`reset`](Fiber::reset), but installs a new entry function.
    pub fn reset_with(&self, f: impl FnMut() + Send + 'static) {
        self.reset_impl(Some(Box::new(f)));
    }

    fn reset_impl(&self, entry: Option<EntryFn>) {
        let state = self.state();
        assert!(
            matches!(state, State::Init | State::Term | State::Except),
            "reset on fiber in state {:?}",
            state
        );
        assert!(
            self.inner.context.has_stack(),
            "cannot reset a thread fiber"
        );
        unsafe {
            if let Some(entry) = entry {
                *self.inner.entry.get() = Some(entry);
            } else {
                assert!(
                    (*self.inner.entry.get()).is_some(),
                    "reset on fiber with no entry function"
                );
            }
            *self.inner.panic.get() = None;
        }
        self.inner.context.reinit(fiber_entry);
        self.inner.set_state(State::Init);
    }

    /// Applies the pending state transition of the fiber that last
    /// transferred control here, optionally re-raising its captured
    /// panic.
    fn process_yielder(&self, rethrow: bool) {
        let yielder = unsafe { (*self.inner.yielder.get()).take() };
        if let Some(yielder) = yielder {
            yielder.inner.set_state(self.inner.yielder_next_state.get());
            if rethrow {
                yielder.rethrow_captured();
            }
        }
    }

    fn rethrow_captured(&self) {
        if self.state() == State::Except && self.inner.auto_rethrow.load(Ordering::Relaxed) {
            if let Some(payload) = unsafe { (*self.inner.panic.get()).take() } {
                panic::resume_unwind(payload);
            }
        }
    }

    /// Controls whether resuming this fiber after a captured panic
    /// re-raises the payload. The parallel combinators clear this and
    /// collect payloads themselves.
    pub(crate) fn set_auto_rethrow(&self, enabled: bool) {
        self.inner.auto_rethrow.store(enabled, Ordering::Relaxed);
    }

    /// Removes and returns the captured panic payload, if any. Only
    /// meaningful once the fiber is no longer executing.
    pub(crate) fn take_panic(&self) -> Option<Box<dyn Any + Send>> {
        debug_assert_ne!(self.state(), State::Exec);
        unsafe { (*self.inner.panic.get()).take() }
    }

    /// Stores a panic payload into the *current* fiber without
    /// terminating it.
    pub(crate) fn store_panic(&self, payload: Box<dyn Any + Send>) {
        debug_assert!(Arc::ptr_eq(&self.inner, &Fiber::current().inner));
        unsafe {
            let slot = &mut *self.inner.panic.get();
            if slot.is_none() {
                *slot = Some(payload);
            }
        }
    }

    pub(crate) fn ptr_eq(&self, other: &Fiber) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("state", &self.state())
            .field("is_thread_fiber", &!self.inner.context.has_stack())
            .finish()
    }
}

/// First frame of every fiber: acknowledge the transfer that started us,
/// run the entry function under a panic catcher, then route control to the
/// terminate-outer or the outer.
extern "C" fn fiber_entry() -> ! {
    let cur = Fiber::current();
    cur.process_yielder(false);
    debug_assert_eq!(cur.state(), State::Exec);
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let entry = unsafe { (*cur.inner.entry.get()).as_mut() };
        (entry.expect("fiber entered with no entry function"))();
    }));
    let next_state = match result {
        Ok(()) => State::Term,
        Err(payload) => {
            unsafe {
                let slot = &mut *cur.inner.panic.get();
                if slot.is_none() {
                    *slot = Some(payload);
                }
            }
            State::Except
        }
    };
    exit_fiber(cur, next_state)
}

/// Final switch out of a terminated fiber. The stack below this frame has
/// already been unwound (on panic) or returned through (on completion);
/// all that remains is to hand control to the right fiber and make sure no
/// strong handle is stranded on the dying stack.
fn exit_fiber(cur: Fiber, next_state: State) -> ! {
    let cur_inner: *const Inner = Arc::as_ptr(&cur.inner);
    let terminate_outer = unsafe { (*(*cur_inner).terminate_outer.get()).upgrade() };
    let has_outer = unsafe { (*(*cur_inner).outer.get()).is_some() };

    let (target, entered_symmetrically) = match terminate_outer {
        Some(inner) if !has_outer => (Fiber { inner }, true),
        _ => {
            let outer = unsafe { (*(*cur_inner).outer.get()).clone() }
                .expect("fiber terminated with no outer to return to");
            (outer, false)
        }
    };
    unsafe {
        *target.inner.yielder.get() = Some(cur.clone());
        target.inner.yielder_next_state.set(next_state);
    }
    if entered_symmetrically {
        debug_assert!(matches!(target.state(), State::Hold | State::Init));
        target.inner.set_state(State::Exec);
    }
    // The TLS slot keeps the target alive, the target's yielder slot keeps
    // the dying fiber alive; everything on this stack can go.
    set_current(target.clone());
    let target_inner: *const Inner = Arc::as_ptr(&target.inner);
    drop(target);
    drop(cur);
    unsafe {
        (*cur_inner).context.switch_to(&(*target_inner).context);
    }
    unreachable!("terminated fiber was resumed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn starts_in_init_and_terminates() {
        let fiber = Fiber::new(|| {});
        assert_eq!(fiber.state(), State::Init);
        fiber.call();
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn yield_leaves_hold() {
        let fiber = Fiber::new(|| Fiber::yield_now());
        fiber.call();
        assert_eq!(fiber.state(), State::Hold);
        fiber.call();
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn reset_runs_from_the_top() {
        let runs = Arc::new(AtomicUsize::new(0));
        let fiber = {
            let runs = Arc::clone(&runs);
            Fiber::new(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };
        fiber.call();
        fiber.reset();
        assert_eq!(fiber.state(), State::Init);
        fiber.call();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panic_is_captured_and_reraised() {
        let fiber = Fiber::new(|| panic!("boom"));
        let result = panic::catch_unwind(AssertUnwindSafe(|| fiber.call()));
        assert!(result.is_err());
        assert_eq!(fiber.state(), State::Except);
    }
}
