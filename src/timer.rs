//! Deadline-ordered callbacks on a monotonic microsecond clock.
//!
//! A [`TimerManager`] holds timers keyed by absolute deadline with a
//! stable sequence number breaking ties, giving ordered retrieval of the
//! earliest expiry and logarithmic insertion and removal. Callbacks run on
//! whichever thread calls [`process_timers`](TimerManager::process_timers)
//! (for an I/O manager, the thread driving its idle fiber), and always
//! outside the internal lock.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

/// Monotonic microseconds since an arbitrary process-local epoch.
///
/// The value never goes backwards, even when the wall clock is adjusted.
pub fn now_us() -> u64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

type Callback = Arc<dyn Fn() + Send + Sync>;

struct TimerData {
    /// Current absolute deadline in microseconds; 0 once cancelled or
    /// (for one-shot timers) claimed for firing.
    deadline: AtomicU64,
    seq: u64,
    period: u64,
    recurring: bool,
    callback: Callback,
}

#[derive(Default)]
struct TimerSet {
    timers: BTreeMap<(u64, u64), Arc<TimerData>>,
    next_seq: u64,
}

/// An ordered set of pending timers.
#[derive(Clone, Default)]
pub struct TimerManager {
    set: Arc<Mutex<TimerSet>>,
}

/// Cancellable handle to a registered timer.
pub struct Timer {
    data: Arc<TimerData>,
    set: Weak<Mutex<TimerSet>>,
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager::default()
    }

    /// Registers a callback to fire once `delay_us` microseconds from
    /// now; a recurring timer re-arms itself with the same delay after
    /// each fire.
    pub fn register_timer(
        &self,
        delay_us: u64,
        callback: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.register_internal(delay_us, Arc::new(callback), recurring).0
    }

    /// Registration that also reports whether the new timer became the
    /// earliest one, so an owning I/O manager can re-bound its kernel
    /// wait.
    pub(crate) fn register_internal(
        &self,
        delay_us: u64,
        callback: Callback,
        recurring: bool,
    ) -> (Timer, bool) {
        let deadline = now_us() + delay_us;
        let mut set = self.set.lock().unwrap();
        let seq = set.next_seq;
        set.next_seq += 1;
        let data = Arc::new(TimerData {
            deadline: AtomicU64::new(deadline),
            seq,
            period: delay_us,
            recurring,
            callback,
        });
        set.timers.insert((deadline, seq), Arc::clone(&data));
        let at_front = set
            .timers
            .first_key_value()
            .map(|(key, _)| *key == (deadline, seq))
            .unwrap_or(false);
        (
            Timer {
                data,
                set: Arc::downgrade(&self.set),
            },
            at_front,
        )
    }

    /// Microseconds until the earliest deadline: `Some(0)` if one has
    /// already passed, `None` if no timer is registered.
    pub fn next_timer(&self) -> Option<u64> {
        let set = self.set.lock().unwrap();
        let (&(deadline, _), _) = set.timers.first_key_value()?;
        Some(deadline.saturating_sub(now_us()))
    }

    /// Fires every timer whose deadline has passed. Recurring timers are
    /// re-inserted with a fresh deadline while still under the lock;
    /// callbacks then run unlocked in deadline order.
    pub fn process_timers(&self) {
        let now = now_us();
        let mut expired = Vec::new();
        {
            let mut set = self.set.lock().unwrap();
            while let Some((&(deadline, seq), _)) = set.timers.first_key_value() {
                if deadline > now {
                    break;
                }
                let data = set.timers.remove(&(deadline, seq)).unwrap();
                if data.recurring {
                    let next = now + data.period;
                    data.deadline.store(next, Ordering::Release);
                    set.timers.insert((next, data.seq), Arc::clone(&data));
                }
                expired.push(data);
            }
        }
        for data in expired {
            // A cancel that raced the collection above wins.
            let live = if data.recurring {
                data.deadline.load(Ordering::Acquire) != 0
            } else {
                data.deadline.swap(0, Ordering::AcqRel) != 0
            };
            if live {
                (data.callback)();
            }
        }
    }

    pub(crate) fn has_timers(&self) -> bool {
        !self.set.lock().unwrap().timers.is_empty()
    }
}

impl Timer {
    /// Removes the timer from its manager if still pending; a recurring
    /// timer that already fired stops recurring.
    pub fn cancel(&self) {
        let Some(set) = self.set.upgrade() else {
            return;
        };
        let mut set = set.lock().unwrap();
        let deadline = self.data.deadline.swap(0, Ordering::AcqRel);
        if deadline != 0 {
            set.timers.remove(&(deadline, self.data.seq));
        }
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = self.set.lock().unwrap();
        f.debug_struct("TimerManager")
            .field("pending", &set.timers.len())
            .finish()
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("deadline_us", &self.data.deadline.load(Ordering::Relaxed))
            .field("recurring", &self.data.recurring)
            .finish()
    }
}
