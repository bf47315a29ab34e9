use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use crate::io::Direction;

/// Readiness selector backed by `epoll(7)`.
///
/// Registrations are level-triggered: the owning I/O manager removes or
/// narrows an entry as soon as it fires, so a ready descriptor wakes its
/// waiter exactly once per registration.
#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub(crate) fn select(
        &self,
        events: &mut Events,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let timeout = timeout
            .map(|to| {
                // `Duration::as_millis` truncates, so round up. This avoids
                // turning sub-millisecond timeouts into a zero timeout,
                // unless the caller explicitly requests that by specifying
                // a zero timeout.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        events.clear();
        syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.as_mut_ptr(),
            events.capacity() as i32,
            timeout,
        ))
        .map(|n_events| {
            // This is safe because `epoll_wait` ensures that `n_events` are
            // assigned.
            unsafe { events.set_len(n_events as usize) };
        })
    }

    pub(crate) fn add(&self, fd: RawFd, directions: Direction) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: directions_to_epoll(directions),
            u64: fd as u64,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn modify(&self, fd: RawFd, directions: Direction) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: directions_to_epoll(directions),
            u64: fd as u64,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            ptr::null_mut()
        ))
        .map(|_| ())
    }
}

fn directions_to_epoll(directions: Direction) -> u32 {
    let mut kind = 0;
    if directions.is_read() {
        kind |= EPOLLIN;
    }
    if directions.is_write() {
        kind |= EPOLLOUT;
    }
    if directions.is_close() {
        kind |= EPOLLRDHUP;
    }
    kind as u32
}

pub(crate) type Event = libc::epoll_event;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use super::*;

    pub(crate) fn fd(event: &Event) -> RawFd {
        event.u64 as RawFd
    }

    pub(crate) fn is_readable(event: &Event) -> bool {
        (event.events as libc::c_int & EPOLLIN) != 0
    }

    pub(crate) fn is_writable(event: &Event) -> bool {
        (event.events as libc::c_int & EPOLLOUT) != 0
    }

    pub(crate) fn is_closed(event: &Event) -> bool {
        (event.events as libc::c_int & EPOLLRDHUP) != 0
    }

    /// Error and hang-up are delivered regardless of the registered
    /// interest; the I/O manager fans them out to every waiter on the fd.
    pub(crate) fn is_error_or_hup(event: &Event) -> bool {
        (event.events as libc::c_int & (EPOLLERR | EPOLLHUP)) != 0
    }
}
