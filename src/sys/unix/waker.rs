use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Waker backed by a unix pipe.
///
/// The read end is registered with the selector; a tickle writes one byte
/// and the idle loop drains whatever has accumulated. If the pipe fills
/// up it is emptied and the write retried.
#[derive(Debug)]
pub(crate) struct Waker {
    sender: File,
    receiver: File,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let mut fds = [-1; 2];

        #[cfg(not(any(target_os = "ios", target_os = "macos")))]
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;

        #[cfg(any(target_os = "ios", target_os = "macos"))]
        {
            // `pipe2` is not available; set the flags after the fact.
            syscall!(pipe(fds.as_mut_ptr()))?;
            for fd in &fds {
                syscall!(fcntl(*fd, libc::F_SETFL, libc::O_NONBLOCK))?;
                syscall!(fcntl(*fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
            }
        }

        // SAFETY: `pipe(2)` ensures both fds are valid.
        let receiver = unsafe { File::from_raw_fd(fds[0]) };
        let sender = unsafe { File::from_raw_fd(fds[1]) };
        Ok(Waker { sender, receiver })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        match (&self.sender).write(&[1]) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // The reading end is full so we'll empty the buffer and try
                // again.
                self.drain();
                self.wake()
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => self.wake(),
            Err(err) => Err(err),
        }
    }

    /// Empties the pipe; ignores any errors.
    pub(crate) fn drain(&self) {
        let mut buf = [0; 4096];
        loop {
            match (&self.receiver).read(&mut buf) {
                Ok(n) if n > 0 => continue,
                _ => return,
            }
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.receiver.as_raw_fd()
    }
}
