//! The I/O manager: a scheduler whose idle fiber blocks on the kernel
//! event source.
//!
//! Two kernel models exist behind the same name. On Unix the readiness
//! model suspends fibers on (fd, direction) pairs and resumes them when
//! epoll or kqueue reports readiness. On Windows the completion model
//! associates handles with an I/O completion port and resumes fibers when
//! their overlapped operation finishes. Both share the register / suspend
//! / resume contract plus the embedded timer manager and tickle.

use std::num::NonZeroU8;
use std::{fmt, ops};

#[cfg(unix)]
pub(crate) mod readiness;
#[cfg(unix)]
pub use self::readiness::IoManager;
#[cfg(unix)]
pub(crate) use self::readiness::IoShared;

#[cfg(windows)]
pub(crate) mod completion;
#[cfg(windows)]
pub use self::completion::{AsyncEvent, IoManager};
#[cfg(windows)]
pub(crate) use self::completion::IoShared;

const READ: u8 = 0b0001;
const WRITE: u8 = 0b0010;
const CLOSE: u8 = 0b0100;

/// Directions of interest on one file descriptor.
///
/// A `Direction` is never empty: it always holds at least one of `READ`,
/// `WRITE` and `CLOSE`. Combine with `|`, strip with
/// [`remove`](Direction::remove).
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct Direction(NonZeroU8);

impl Direction {
    /// Readable interest: the next read-like syscall may make progress.
    pub const READ: Direction = Direction(unsafe { NonZeroU8::new_unchecked(READ) });
    /// Writable interest.
    pub const WRITE: Direction = Direction(unsafe { NonZeroU8::new_unchecked(WRITE) });
    /// The peer half-closed the connection; used by the remote-close
    /// watcher independently of any outstanding receive.
    pub const CLOSE: Direction = Direction(unsafe { NonZeroU8::new_unchecked(CLOSE) });

    /// Add together two sets of directions.
    pub const fn add(self, other: Direction) -> Direction {
        Direction(unsafe { NonZeroU8::new_unchecked(self.0.get() | other.0.get()) })
    }

    /// Removes `other` from the set, returning `None` if nothing is left.
    pub fn remove(self, other: Direction) -> Option<Direction> {
        NonZeroU8::new(self.0.get() & !other.0.get()).map(Direction)
    }

    pub const fn is_read(self) -> bool {
        self.0.get() & READ != 0
    }

    pub const fn is_write(self) -> bool {
        self.0.get() & WRITE != 0
    }

    pub const fn is_close(self) -> bool {
        self.0.get() & CLOSE != 0
    }

    pub(crate) fn contains(self, other: Direction) -> bool {
        self.0.get() & other.0.get() == other.0.get()
    }
}

impl ops::BitOr for Direction {
    type Output = Direction;

    fn bitor(self, other: Direction) -> Direction {
        self.add(other)
    }
}

impl ops::BitOrAssign for Direction {
    fn bitor_assign(&mut self, other: Direction) {
        *self = self.add(other);
    }
}

impl fmt::Debug for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        if self.is_read() {
            write!(f, "READ")?;
            one = true;
        }
        if self.is_write() {
            if one {
                write!(f, " | ")?;
            }
            write!(f, "WRITE")?;
            one = true;
        }
        if self.is_close() {
            if one {
                write!(f, " | ")?;
            }
            write!(f, "CLOSE")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Direction;

    #[test]
    fn combine_and_remove() {
        let both = Direction::READ | Direction::WRITE;
        assert!(both.is_read());
        assert!(both.is_write());
        assert!(!both.is_close());
        assert_eq!(both.remove(Direction::WRITE), Some(Direction::READ));
        assert_eq!(Direction::READ.remove(Direction::READ), None);
        assert!(both.contains(Direction::READ));
        assert!(!both.contains(Direction::CLOSE));
    }

    #[test]
    fn debug_lists_directions() {
        assert_eq!(format!("{:?}", Direction::READ), "READ");
        assert_eq!(
            format!("{:?}", Direction::READ | Direction::CLOSE),
            "READ | CLOSE"
        );
    }
}
