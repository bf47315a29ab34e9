use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use weft::{Fiber, State};

mod util;
use util::{assert_send, assert_sync, init};

type Trace = Arc<Mutex<Vec<&'static str>>>;

fn trace() -> Trace {
    Arc::new(Mutex::new(Vec::new()))
}

fn push(trace: &Trace, entry: &'static str) {
    trace.lock().unwrap().push(entry);
}

#[test]
fn is_send_and_sync() {
    assert_send::<Fiber>();
    assert_sync::<Fiber>();
}

#[test]
fn ping_pong() {
    init();
    let log = trace();
    push(&log, "main");
    let fiber = {
        let log = Arc::clone(&log);
        Fiber::new(move || {
            push(&log, "fiber");
            Fiber::yield_now();
            push(&log, "fiber2");
        })
    };
    assert_eq!(fiber.state(), State::Init);
    fiber.call();
    assert_eq!(fiber.state(), State::Hold);
    push(&log, "main2");
    fiber.call();
    assert_eq!(fiber.state(), State::Term);
    push(&log, "main3");
    assert_eq!(
        *log.lock().unwrap(),
        vec!["main", "fiber", "main2", "fiber2", "main3"]
    );
}

#[test]
fn current_is_executing() {
    init();
    let fiber = Fiber::new(|| {
        assert_eq!(Fiber::current().state(), State::Exec);
    });
    fiber.call();
    assert_eq!(Fiber::current().state(), State::Exec);
}

#[test]
fn nested_calls() {
    init();
    let log = trace();
    let inner = {
        let log = Arc::clone(&log);
        Fiber::new(move || push(&log, "inner"))
    };
    let outer = {
        let log = Arc::clone(&log);
        Fiber::new(move || {
            push(&log, "outer before");
            inner.call();
            push(&log, "outer after");
        })
    };
    outer.call();
    assert_eq!(
        *log.lock().unwrap(),
        vec!["outer before", "inner", "outer after"]
    );
}

#[test]
fn reset_reruns_entry_from_the_beginning() {
    init();
    let counter = Arc::new(AtomicUsize::new(0));
    let fiber = {
        let counter = Arc::clone(&counter);
        Fiber::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_now();
            counter.fetch_add(10, Ordering::SeqCst);
        })
    };
    fiber.call();
    fiber.call();
    assert_eq!(fiber.state(), State::Term);
    assert_eq!(counter.load(Ordering::SeqCst), 11);

    fiber.reset();
    assert_eq!(fiber.state(), State::Init);
    fiber.call();
    // Restarted from the top, not resumed past the yield.
    assert_eq!(counter.load(Ordering::SeqCst), 12);
}

#[test]
fn reset_with_installs_a_new_entry() {
    init();
    let log = trace();
    let fiber = {
        let log = Arc::clone(&log);
        Fiber::new(move || push(&log, "first"))
    };
    fiber.call();
    {
        let log = Arc::clone(&log);
        fiber.reset_with(move || push(&log, "second"));
    }
    fiber.call();
    assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn yield_to_with_return_on_terminate() {
    init();
    let log = trace();
    let target = {
        let log = Arc::clone(&log);
        Fiber::new(move || push(&log, "target"))
    };
    let source = {
        let log = Arc::clone(&log);
        let target = target.clone();
        Fiber::new(move || {
            push(&log, "source before");
            target.yield_to(true);
            push(&log, "source after");
        })
    };
    source.call();
    assert_eq!(source.state(), State::Term);
    assert_eq!(target.state(), State::Term);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["source before", "target", "source after"]
    );
}

#[test]
fn panic_is_captured_and_reraised_on_the_caller() {
    init();
    let fiber = Fiber::new(|| panic!("entry failed"));
    let result = panic::catch_unwind(AssertUnwindSafe(|| fiber.call()));
    let payload = result.unwrap_err();
    assert_eq!(*payload.downcast_ref::<&str>().unwrap(), "entry failed");
    assert_eq!(fiber.state(), State::Except);
}

#[test]
fn panicked_fiber_can_be_reset_and_reused() {
    init();
    let ran = Arc::new(AtomicUsize::new(0));
    let fiber = Fiber::new(|| panic!("first run"));
    let _ = panic::catch_unwind(AssertUnwindSafe(|| fiber.call()));
    assert_eq!(fiber.state(), State::Except);
    {
        let ran = Arc::clone(&ran);
        fiber.reset_with(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }
    fiber.call();
    assert_eq!(fiber.state(), State::Term);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn panic_after_a_yield_is_captured() {
    init();
    let fiber = Fiber::new(|| {
        Fiber::yield_now();
        panic!("late failure");
    });
    fiber.call();
    assert_eq!(fiber.state(), State::Hold);
    let result = panic::catch_unwind(AssertUnwindSafe(|| fiber.call()));
    assert!(result.is_err());
    assert_eq!(fiber.state(), State::Except);
}
