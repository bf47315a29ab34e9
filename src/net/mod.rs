//! Fiber-aware networking: addresses, name resolution, and sockets whose
//! blocking operations suspend on an attached I/O manager.
//!
//! The same API rides on both kernel models: non-blocking syscalls plus
//! readiness registration on POSIX, overlapped calls against the
//! completion port (with an event-select fallback for providers without
//! `ConnectEx`/`AcceptEx`) on Windows. Unix-domain addresses exist on
//! POSIX targets only.

mod addr;
mod socket;

pub use self::addr::{Address, Ipv4Address, Ipv6Address, UnknownAddress};
#[cfg(unix)]
pub use self::addr::UnixAddress;
pub use self::socket::Socket;
