use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use weft::timer::now_us;
use weft::TimerManager;

mod util;
use util::init;

#[test]
fn single() {
    init();
    let fired = Arc::new(AtomicUsize::new(0));
    let manager = TimerManager::new();
    assert_eq!(manager.next_timer(), None);
    {
        let fired = Arc::clone(&fired);
        manager.register_timer(0, move || {
            fired.fetch_add(1, Ordering::SeqCst);
        }, false);
    }
    assert_eq!(manager.next_timer(), Some(0));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    manager.process_timers();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(manager.next_timer(), None);
}

#[test]
fn multiple_fire_in_registration_order() {
    init();
    let order = Arc::new(Mutex::new(Vec::new()));
    let manager = TimerManager::new();
    for label in ["first", "second", "third"] {
        let order = Arc::clone(&order);
        manager.register_timer(0, move || order.lock().unwrap().push(label), false);
    }
    manager.process_timers();
    // Equal deadlines break ties by registration identity.
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
}

#[test]
fn cancel_prevents_firing() {
    init();
    let fired = Arc::new(AtomicUsize::new(0));
    let manager = TimerManager::new();
    let timer = {
        let fired = Arc::clone(&fired);
        manager.register_timer(0, move || {
            fired.fetch_add(1, Ordering::SeqCst);
        }, false)
    };
    assert_eq!(manager.next_timer(), Some(0));
    timer.cancel();
    assert_eq!(manager.next_timer(), None);
    manager.process_timers();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn recurring_reinserts_until_cancelled() {
    init();
    let fired = Arc::new(AtomicUsize::new(0));
    let manager = TimerManager::new();
    let timer = {
        let fired = Arc::clone(&fired);
        manager.register_timer(0, move || {
            fired.fetch_add(1, Ordering::SeqCst);
        }, true)
    };
    manager.process_timers();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(manager.next_timer(), Some(0));
    manager.process_timers();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    timer.cancel();
    assert_eq!(manager.next_timer(), None);
    manager.process_timers();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[test]
fn later_deadline_is_reported() {
    init();
    let manager = TimerManager::new();
    let timer = manager.register_timer(1_000_000_000, || {}, false);
    let next = manager.next_timer().unwrap();
    assert!(next > 900_000_000 && next <= 1_000_000_000, "next = {}", next);
    // Not yet due; processing must not fire it.
    manager.process_timers();
    timer.cancel();
    assert_eq!(manager.next_timer(), None);
}

#[test]
fn deadlines_are_ordered_by_delay() {
    init();
    let order = Arc::new(Mutex::new(Vec::new()));
    let manager = TimerManager::new();
    {
        let order = Arc::clone(&order);
        manager.register_timer(0, move || order.lock().unwrap().push("short"), false);
    }
    {
        let order = Arc::clone(&order);
        manager.register_timer(10_000_000, move || order.lock().unwrap().push("long"), false);
    }
    manager.process_timers();
    // Only the expired timer fires.
    assert_eq!(*order.lock().unwrap(), vec!["short"]);
    assert!(manager.next_timer().is_some());
}

#[test]
fn now_is_monotonic() {
    init();
    let a = now_us();
    let b = now_us();
    std::thread::sleep(std::time::Duration::from_millis(2));
    let c = now_us();
    assert!(b >= a);
    assert!(c >= b + 1_000);
}
