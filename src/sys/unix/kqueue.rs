use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use crate::io::Direction;

/// Readiness selector backed by `kqueue(2)`.
///
/// Interest is expressed per filter; `EV_CLEAR` gives edge semantics so a
/// fired filter stays quiet until the I/O manager re-registers it. The
/// close direction rides on the read filter and is reported through
/// `EV_EOF`.
#[derive(Debug)]
pub(crate) struct Selector {
    kq: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())?;
        // SAFETY: `kqueue(2)` ensures the fd is valid.
        let kq = unsafe { OwnedFd::from_raw_fd(kq) };
        syscall!(fcntl(kq.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Selector { kq })
    }

    pub(crate) fn select(
        &self,
        events: &mut Events,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let timespec = timeout.map(|to| libc::timespec {
            tv_sec: to.as_secs() as libc::time_t,
            tv_nsec: libc::c_long::from(to.subsec_nanos() as i32),
        });
        let timespec_ptr = timespec
            .as_ref()
            .map(|ts| ts as *const libc::timespec)
            .unwrap_or(ptr::null());

        events.clear();
        syscall!(kevent(
            self.kq.as_raw_fd(),
            ptr::null(),
            0,
            events.as_mut_ptr(),
            events.capacity() as libc::c_int,
            timespec_ptr,
        ))
        .map(|n_events| {
            // This is safe because `kevent` ensures that `n_events` are
            // assigned.
            unsafe { events.set_len(n_events as usize) };
        })
    }

    pub(crate) fn add(&self, fd: RawFd, directions: Direction) -> io::Result<()> {
        self.apply(fd, directions, None)
    }

    /// Re-expresses the full interest set for `fd`: wanted filters are
    /// (re-)added, no-longer-wanted ones deleted.
    pub(crate) fn modify(&self, fd: RawFd, directions: Direction) -> io::Result<()> {
        let unwanted = (Direction::READ | Direction::WRITE | Direction::CLOSE)
            .remove(directions)
            .unwrap_or(directions);
        self.apply(fd, directions, Some(unwanted))
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut changes = [
            kevent_change(fd, libc::EVFILT_READ, libc::EV_DELETE),
            kevent_change(fd, libc::EVFILT_WRITE, libc::EV_DELETE),
        ];
        self.submit(&mut changes)
    }

    fn apply(
        &self,
        fd: RawFd,
        wanted: Direction,
        unwanted: Option<Direction>,
    ) -> io::Result<()> {
        let mut changes = Vec::with_capacity(4);
        if wanted.is_read() || wanted.is_close() {
            changes.push(kevent_change(
                fd,
                libc::EVFILT_READ,
                libc::EV_ADD | libc::EV_CLEAR,
            ));
        }
        if wanted.is_write() {
            changes.push(kevent_change(
                fd,
                libc::EVFILT_WRITE,
                libc::EV_ADD | libc::EV_CLEAR,
            ));
        }
        if let Some(unwanted) = unwanted {
            if (unwanted.is_read() || unwanted.is_close())
                && !(wanted.is_read() || wanted.is_close())
            {
                changes.push(kevent_change(fd, libc::EVFILT_READ, libc::EV_DELETE));
            }
            if unwanted.is_write() && !wanted.is_write() {
                changes.push(kevent_change(fd, libc::EVFILT_WRITE, libc::EV_DELETE));
            }
        }
        self.submit(&mut changes)
    }

    fn submit(&self, changes: &mut [Event]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        // Deleting a filter that was never added (or already fired with
        // EV_ONESHOT semantics) reports ENOENT; that is not an error here.
        match syscall!(kevent(
            self.kq.as_raw_fd(),
            changes.as_ptr(),
            changes.len() as libc::c_int,
            ptr::null_mut(),
            0,
            ptr::null(),
        )) {
            Ok(_) => Ok(()),
            Err(ref err) if err.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn kevent_change(fd: RawFd, filter: i16, flags: u16) -> Event {
    // SAFETY: all fields zeroed is a valid kevent.
    let mut event: Event = unsafe { std::mem::zeroed() };
    event.ident = fd as libc::uintptr_t;
    event.filter = filter;
    event.flags = flags;
    event
}

pub(crate) type Event = libc::kevent;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use super::*;

    pub(crate) fn fd(event: &Event) -> RawFd {
        event.ident as RawFd
    }

    pub(crate) fn is_readable(event: &Event) -> bool {
        event.filter == libc::EVFILT_READ
    }

    pub(crate) fn is_writable(event: &Event) -> bool {
        event.filter == libc::EVFILT_WRITE
    }

    pub(crate) fn is_closed(event: &Event) -> bool {
        event.flags & libc::EV_EOF != 0
    }

    pub(crate) fn is_error_or_hup(event: &Event) -> bool {
        event.flags & libc::EV_ERROR != 0
            || (event.flags & libc::EV_EOF != 0 && event.fflags != 0)
    }
}
