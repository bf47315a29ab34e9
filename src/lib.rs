//! A cooperative fiber runtime with an integrated non-blocking I/O
//! multiplexer.
//!
//! Weft multiplexes many stackful fibers onto a small pool of OS threads.
//! Fibers suspend and resume explicitly; there is no preemption. An
//! [`IoManager`] is a [`Scheduler`] whose idle fiber blocks on the platform
//! event source (epoll, kqueue or an I/O completion port), waking fibers
//! when their file descriptor becomes ready or their timer expires. The
//! [`net`] module provides a fiber-aware socket API on top: an operation
//! that would block registers a wait with the I/O manager and yields, and
//! is resumed once the kernel reports progress.
//!
//! # Examples
//!
//! An echo of a single connection, driven by one thread (the example uses
//! libc's address-family constants, so it is compiled on Unix targets;
//! on Windows pass the WinSock equivalents):
//!
#![cfg_attr(unix, doc = "```no_run")]
#![cfg_attr(windows, doc = "```ignore")]
//! use weft::net::{Address, Socket};
//! use weft::IoManager;
//!
//! # fn main() -> weft::Result<()> {
//! let io = IoManager::new(1, true)?;
//!
//! let addr = Address::lookup("127.0.0.1:0", libc::AF_INET, libc::SOCK_STREAM, 0)?
//!     .into_iter()
//!     .next()
//!     .unwrap();
//! let listener = Socket::with_io_manager(&io, addr.family(), libc::SOCK_STREAM, 0)?;
//! listener.bind(&addr)?;
//! listener.listen()?;
//! let addr = listener.local_addr()?;
//!
//! {
//!     let listener = listener.clone();
//!     io.schedule(move || {
//!         let conn = listener.accept().unwrap();
//!         let mut buf = [0u8; 128];
//!         let n = conn.receive(&mut buf).unwrap();
//!         conn.send(&buf[..n]).unwrap();
//!     });
//! }
//!
//! let client = Socket::with_io_manager(&io, addr.family(), libc::SOCK_STREAM, 0)?;
//! client.connect(&addr)?;
//! client.send(b"hello")?;
//! io.dispatch();
//! # Ok(())
//! # }
//! ```
//!
//! # Suspension points
//!
//! Only the following operations suspend a fiber: [`Fiber::yield_now`],
//! [`Fiber::yield_to`], [`Scheduler::yield_to`], [`Scheduler::switch_to`],
//! any socket operation that blocks on an attached I/O manager, and
//! [`IoManager::sleep`]. A fiber that performs none of these monopolizes
//! its worker thread.

#![warn(missing_debug_implementations)]

mod error;
pub mod fiber;
pub mod io;
pub mod net;
pub mod parallel;
pub mod scheduler;
mod sys;
pub mod timer;

pub use crate::error::{Error, LookupError, Result};
pub use crate::fiber::{Fiber, State};
pub use crate::io::{Direction, IoManager};
pub use crate::parallel::{parallel_do, parallel_foreach};
pub use crate::scheduler::{Scheduler, WorkerPool};
pub use crate::timer::{Timer, TimerManager};
