//! Fiber-aware sockets.
//!
//! Without an I/O manager a `Socket` is an ordinary blocking socket. With
//! one attached every operation that can block takes part in the
//! suspension protocol. On POSIX the descriptor is non-blocking: a
//! would-block result registers the direction with the readiness manager,
//! optionally arms a timer that cancels the wait with a timeout, and
//! yields to the scheduler. On Windows the handle is associated with the
//! completion port: each operation posts an overlapped call and yields
//! until its completion record is filled in. Sockets created without
//! `ConnectEx`/`AcceptEx` support fall back to a single event handle with
//! a single waiter per socket.
//!
//! Cancellation is per direction and sticky: once a direction is
//! cancelled, every subsequent operation in that direction fails with the
//! stored error without touching the kernel.

use std::fmt;
use std::io::{IoSlice, IoSliceMut};
use std::mem;
use std::net::Shutdown;
#[cfg(unix)]
use std::os::fd::RawFd;
#[cfg(windows)]
use std::cell::UnsafeCell;
#[cfg(windows)]
use std::ffi::c_void;
#[cfg(windows)]
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
#[cfg(windows)]
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};

use log::{debug, error, info};

#[cfg(windows)]
use windows_sys::core::GUID;
#[cfg(windows)]
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_OPERATION_ABORTED, ERROR_SEM_TIMEOUT, HANDLE,
};
#[cfg(windows)]
use windows_sys::Win32::Networking::WinSock::{
    accept, bind, closesocket, connect, getpeername, getsockname, getsockopt, listen, setsockopt,
    shutdown, socket, WSAEnumNetworkEvents, WSAEventSelect, WSAGetLastError, WSAIoctl, WSARecv,
    WSARecvFrom, WSASend, WSASendTo, AF_INET, AF_INET6, FD_ACCEPT, FD_CLOSE, FD_CONNECT,
    FD_CONNECT_BIT, INVALID_SOCKET, LPFN_ACCEPTEX, LPFN_CONNECTEX, LPFN_GETACCEPTEXSOCKADDRS,
    SD_BOTH, SD_RECEIVE, SD_SEND, SIO_GET_EXTENSION_FUNCTION_POINTER, SOCKADDR, SOCKADDR_STORAGE,
    SOCKET, SOL_SOCKET, SOMAXCONN, SO_REUSEADDR, SO_TYPE, SO_UPDATE_ACCEPT_CONTEXT,
    SO_UPDATE_CONNECT_CONTEXT, WSABUF, WSAEINVAL, WSAETIMEDOUT, WSAEWOULDBLOCK, WSANETWORKEVENTS,
    WSA_IO_PENDING,
};
#[cfg(windows)]
use windows_sys::Win32::System::Threading::{CreateEventW, ResetEvent};
#[cfg(windows)]
use windows_sys::Win32::System::IO::OVERLAPPED;

#[cfg(windows)]
use crate::fiber::Fiber;
#[cfg(windows)]
use crate::io::AsyncEvent;
use crate::io::{Direction, IoManager, IoShared};
use crate::net::addr::{RawSockAddr, RawSockLen};
use crate::net::{Address, Ipv4Address, Ipv6Address};
use crate::scheduler::Scheduler;
use crate::timer::Timer;
use crate::{Error, Result};

const NO_TIMEOUT: u64 = u64::MAX;

#[cfg(unix)]
type SocketHandle = RawFd;
#[cfg(windows)]
type SocketHandle = SOCKET;

#[cfg(unix)]
type AtomicSocket = AtomicI32;
#[cfg(windows)]
type AtomicSocket = AtomicUsize;

#[cfg(unix)]
const INVALID_SOCKET_HANDLE: SocketHandle = -1;
#[cfg(windows)]
const INVALID_SOCKET_HANDLE: SocketHandle = INVALID_SOCKET;

#[cfg(unix)]
const CANCELLED_ERROR: i32 = libc::ECANCELED;
#[cfg(windows)]
const CANCELLED_ERROR: i32 = ERROR_OPERATION_ABORTED as i32;

#[cfg(unix)]
const TIMED_OUT_ERROR: i32 = libc::ETIMEDOUT;
#[cfg(windows)]
const TIMED_OUT_ERROR: i32 = WSAETIMEDOUT;

#[cfg(windows)]
const WS_SOL_SOCKET: i32 = SOL_SOCKET as i32;
#[cfg(windows)]
const WS_SO_TYPE: i32 = SO_TYPE as i32;
#[cfg(windows)]
const WS_SO_REUSEADDR: i32 = SO_REUSEADDR as i32;
#[cfg(windows)]
const WS_SOMAXCONN: i32 = SOMAXCONN as i32;

/// Room `AcceptEx` wants per embedded address.
#[cfg(windows)]
const ACCEPTEX_ADDR_LEN: usize = mem::size_of::<SOCKADDR_STORAGE>() + 16;

type CloseCallback = Arc<dyn Fn() + Send + Sync>;

struct Inner {
    handle: AtomicSocket,
    family: i32,
    protocol: i32,
    io: Option<IoShared>,
    receive_timeout: AtomicU64,
    send_timeout: AtomicU64,
    /// Sticky per-direction cancellation, as the error code to deliver;
    /// 0 when clear.
    cancelled_send: AtomicI32,
    cancelled_receive: AtomicI32,
    local: Mutex<Option<Address>>,
    remote: Mutex<Option<Address>>,
    connected: AtomicBool,
    remote_close_registered: AtomicBool,
    on_remote_close: Mutex<Vec<CloseCallback>>,
    /// Completion records for the in-flight operation of each direction.
    #[cfg(windows)]
    send_event: UnsafeCell<AsyncEvent>,
    #[cfg(windows)]
    receive_event: UnsafeCell<AsyncEvent>,
    /// Single event handle shared by the event-select fallbacks and the
    /// remote-close watcher; one waiter at a time. Stored as a raw value,
    /// 0 when not yet created.
    #[cfg(windows)]
    wait_event: Mutex<usize>,
    /// The fiber parked on `wait_event`, if any.
    #[cfg(windows)]
    wait_fiber: Mutex<Option<(Scheduler, Fiber)>>,
}

// The completion records are only touched by the single fiber driving
// that direction and by the idle fiber through the registered raw
// pointer; the event-select slots sit behind mutexes.
#[cfg(windows)]
unsafe impl Send for Inner {}
#[cfg(windows)]
unsafe impl Sync for Inner {}

/// A socket whose blocking operations suspend the calling fiber when an
/// I/O manager is attached. Clones share the same underlying descriptor.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<Inner>,
}

impl Socket {
    /// A fully synchronous socket with no I/O manager.
    pub fn new(family: i32, socktype: i32, protocol: i32) -> Result<Socket> {
        let handle = create_socket(family, socktype, protocol)?;
        Ok(Socket::from_parts(handle, family, protocol, None))
    }

    /// A socket attached to `io`: non-blocking on POSIX, associated with
    /// the completion port on Windows; operations suspend instead of
    /// blocking.
    pub fn with_io_manager(
        io: &IoManager,
        family: i32,
        socktype: i32,
        protocol: i32,
    ) -> Result<Socket> {
        let handle = create_socket(family, socktype, protocol)?;
        #[cfg(unix)]
        if let Err(err) = set_nonblocking(handle) {
            unsafe { libc::close(handle) };
            return Err(err);
        }
        let socket = Socket::from_parts(handle, family, protocol, Some(io.shared().clone()));
        #[cfg(windows)]
        io.shared().register_file(handle as HANDLE)?;
        Ok(socket)
    }

    fn from_parts(
        handle: SocketHandle,
        family: i32,
        protocol: i32,
        io: Option<IoShared>,
    ) -> Socket {
        Socket {
            inner: Arc::new(Inner {
                handle: AtomicSocket::new(handle),
                family,
                protocol,
                io,
                receive_timeout: AtomicU64::new(NO_TIMEOUT),
                send_timeout: AtomicU64::new(NO_TIMEOUT),
                cancelled_send: AtomicI32::new(0),
                cancelled_receive: AtomicI32::new(0),
                local: Mutex::new(None),
                remote: Mutex::new(None),
                connected: AtomicBool::new(false),
                remote_close_registered: AtomicBool::new(false),
                on_remote_close: Mutex::new(Vec::new()),
                #[cfg(windows)]
                send_event: UnsafeCell::new(AsyncEvent::new()),
                #[cfg(windows)]
                receive_event: UnsafeCell::new(AsyncEvent::new()),
                #[cfg(windows)]
                wait_event: Mutex::new(0),
                #[cfg(windows)]
                wait_fiber: Mutex::new(None),
            }),
        }
    }

    fn handle(&self) -> SocketHandle {
        self.inner.handle.load(Ordering::Acquire)
    }

    pub fn family(&self) -> i32 {
        self.inner.family
    }

    pub fn protocol(&self) -> i32 {
        self.inner.protocol
    }

    /// Socket type as the kernel reports it (`SO_TYPE`).
    pub fn socket_type(&self) -> Result<i32> {
        #[cfg(unix)]
        return self.get_option::<i32>(libc::SOL_SOCKET, libc::SO_TYPE);
        #[cfg(windows)]
        return self.get_option::<i32>(WS_SOL_SOCKET, WS_SO_TYPE);
    }

    /// Receive-side timeout in microseconds, `None` for unbounded.
    pub fn receive_timeout(&self) -> Option<u64> {
        match self.inner.receive_timeout.load(Ordering::Relaxed) {
            NO_TIMEOUT => None,
            us => Some(us),
        }
    }

    pub fn set_receive_timeout(&self, timeout_us: Option<u64>) {
        self.inner
            .receive_timeout
            .store(timeout_us.unwrap_or(NO_TIMEOUT), Ordering::Relaxed);
    }

    pub fn send_timeout(&self) -> Option<u64> {
        match self.inner.send_timeout.load(Ordering::Relaxed) {
            NO_TIMEOUT => None,
            us => Some(us),
        }
    }

    pub fn set_send_timeout(&self, timeout_us: Option<u64>) {
        self.inner
            .send_timeout
            .store(timeout_us.unwrap_or(NO_TIMEOUT), Ordering::Relaxed);
    }

    pub fn bind(&self, addr: &Address) -> Result<()> {
        assert_eq!(addr.family(), self.inner.family, "bind address family mismatch");
        let (raw, len) = addr.as_raw();
        #[cfg(unix)]
        let rc = unsafe { libc::bind(self.handle(), raw, len) };
        #[cfg(windows)]
        let rc = unsafe { bind(self.handle(), raw, len) };
        if rc != 0 {
            let err = last_socket_error();
            error!("bind({}, {}): {}", self.handle(), addr, err);
            return Err(err);
        }
        debug!("bind({}, {})", self.handle(), addr);
        // Prime the cache; also resolves the ephemeral port after a
        // port-0 bind.
        self.inner.local.lock().unwrap().take();
        let _ = self.local_addr()?;
        Ok(())
    }

    pub fn listen(&self) -> Result<()> {
        #[cfg(unix)]
        return self.listen_backlog(libc::SOMAXCONN);
        #[cfg(windows)]
        return self.listen_backlog(WS_SOMAXCONN);
    }

    pub fn listen_backlog(&self, backlog: i32) -> Result<()> {
        #[cfg(unix)]
        let rc = unsafe { libc::listen(self.handle(), backlog) };
        #[cfg(windows)]
        let rc = unsafe { listen(self.handle(), backlog) };
        if rc != 0 {
            let err = last_socket_error();
            error!("listen({}, {}): {}", self.handle(), backlog, err);
            return Err(err);
        }
        debug!("listen({}, {})", self.handle(), backlog);
        Ok(())
    }

    /// Connects to `addr`. With an I/O manager attached, a connect that
    /// cannot finish immediately suspends the fiber until the kernel
    /// reports the outcome.
    #[cfg(unix)]
    pub fn connect(&self, addr: &Address) -> Result<()> {
        assert_eq!(addr.family(), self.inner.family, "connect address family mismatch");
        let fd = self.handle();
        let (raw, len) = addr.as_raw();
        let rc = unsafe { libc::connect(fd, raw, len) };
        match &self.inner.io {
            None => {
                if rc != 0 {
                    let err = Error::last_os_error();
                    error!("connect({}, {}): {}", fd, addr, err);
                    return Err(err);
                }
                info!("connect({}, {})", fd, addr);
            }
            Some(io) => {
                if rc != 0 {
                    let errno = errno();
                    if errno != libc::EINPROGRESS {
                        let err = Error::from_os_error(errno);
                        error!("connect({}, {}): {}", fd, addr, err);
                        return Err(err);
                    }
                    io.register_event(fd, Direction::WRITE)?;
                    let cancelled = self.inner.cancelled_send.load(Ordering::Acquire);
                    if cancelled != 0 {
                        error!("connect({}, {}): cancelled", fd, addr);
                        io.cancel_event(fd, Direction::WRITE);
                        self.yield_to_scheduler();
                        return Err(Error::from_os_error(cancelled));
                    }
                    let timer = self.timeout_timer(io, Direction::WRITE, self.send_timeout());
                    self.yield_to_scheduler();
                    if let Some(timer) = timer {
                        timer.cancel();
                    }
                    let cancelled = self.inner.cancelled_send.load(Ordering::Acquire);
                    if cancelled != 0 {
                        error!("connect({}, {}): cancelled", fd, addr);
                        return Err(Error::from_os_error(cancelled));
                    }
                    let so_error = self.get_option::<i32>(libc::SOL_SOCKET, libc::SO_ERROR)?;
                    if so_error != 0 {
                        let err = Error::from_os_error(so_error);
                        error!("connect({}, {}): {}", fd, addr, err);
                        return Err(err);
                    }
                }
                info!("connect({}, {})", fd, addr);
            }
        }
        self.inner.connected.store(true, Ordering::Release);
        if !self.inner.on_remote_close.lock().unwrap().is_empty() {
            self.register_for_remote_close()?;
        }
        Ok(())
    }

    /// Connects to `addr`: overlapped `ConnectEx` when the provider has
    /// it, the single-event `WSAEventSelect` fallback otherwise.
    #[cfg(windows)]
    pub fn connect(&self, addr: &Address) -> Result<()> {
        assert_eq!(addr.family(), self.inner.family, "connect address family mismatch");
        let handle = self.handle();
        let (raw, len) = addr.as_raw();
        match &self.inner.io {
            None => {
                if unsafe { connect(handle, raw, len) } != 0 {
                    let err = last_socket_error();
                    error!("connect({}, {}): {}", handle, addr, err);
                    return Err(err);
                }
                info!("connect({}, {})", handle, addr);
            }
            Some(io) => {
                match self.connect_ex() {
                    Some(connect_ex) => {
                        // ConnectEx requires a bound socket, even to ANY.
                        if self.inner.local.lock().unwrap().is_none() {
                            let any = self.empty_address();
                            self.bind(&any)?;
                        }
                        unsafe {
                            *self.inner.send_event.get() = AsyncEvent::new();
                        }
                        let event = unsafe { &mut *self.inner.send_event.get() };
                        io.register_event(event);
                        let mut sent = 0u32;
                        let ok = unsafe {
                            connect_ex(
                                handle,
                                raw,
                                len,
                                ptr::null(),
                                0,
                                &mut sent,
                                &mut event.overlapped,
                            )
                        };
                        if ok == 0 {
                            let code = unsafe { WSAGetLastError() };
                            if code != WSA_IO_PENDING {
                                io.unregister_event(event);
                                let err = Error::from_os_error(code);
                                error!("ConnectEx({}, {}): {}", handle, addr, err);
                                return Err(err);
                            }
                        }
                        let cancelled = self.inner.cancelled_send.load(Ordering::Acquire);
                        if cancelled != 0 {
                            error!("connect({}, {}): cancelled", handle, addr);
                            io.cancel_event(handle as HANDLE, event);
                            self.yield_to_scheduler();
                            return Err(Error::from_os_error(cancelled));
                        }
                        let timer =
                            self.timeout_timer(io, Direction::WRITE, self.send_timeout());
                        self.yield_to_scheduler();
                        if let Some(timer) = timer {
                            timer.cancel();
                        }
                        let event = unsafe { &*self.inner.send_event.get() };
                        let code = self.translate_overlapped_error(
                            event.error,
                            &self.inner.cancelled_send,
                        );
                        if code != 0 {
                            let err = Error::from_os_error(code as i32);
                            error!("ConnectEx({}, {}): {}", handle, addr, err);
                            return Err(err);
                        }
                        unsafe {
                            setsockopt(
                                handle,
                                WS_SOL_SOCKET,
                                SO_UPDATE_CONNECT_CONTEXT as i32,
                                ptr::null(),
                                0,
                            );
                        }
                        info!("connect({}, {})", handle, addr);
                    }
                    None => {
                        self.connect_event_select(io, addr)?;
                        info!("connect({}, {})", handle, addr);
                    }
                }
            }
        }
        self.inner.connected.store(true, Ordering::Release);
        if !self.inner.on_remote_close.lock().unwrap().is_empty() {
            self.register_for_remote_close()?;
        }
        Ok(())
    }

    /// The pre-ConnectEx path: a single event handle and a single parked
    /// waiter per socket; concurrent use of this path on one socket is
    /// not supported.
    #[cfg(windows)]
    fn connect_event_select(&self, io: &IoShared, addr: &Address) -> Result<()> {
        let handle = self.handle();
        let (raw, len) = addr.as_raw();
        let event = self.wait_event()?;
        if unsafe { WSAEventSelect(handle, event, FD_CONNECT as i32) } != 0 {
            return Err(last_socket_error());
        }
        let rc = unsafe { connect(handle, raw, len) };
        if rc != 0 {
            let code = unsafe { WSAGetLastError() };
            if code != WSAEWOULDBLOCK {
                unsafe { WSAEventSelect(handle, ptr::null_mut(), 0) };
                let err = Error::from_os_error(code);
                error!("connect({}, {}): {}", handle, addr, err);
                return Err(err);
            }
            self.park_on_wait_event(io, event, Direction::WRITE, self.send_timeout())?;
            let cancelled = self.inner.cancelled_send.load(Ordering::Acquire);
            if cancelled != 0 {
                unsafe { WSAEventSelect(handle, ptr::null_mut(), 0) };
                error!("connect({}, {}): cancelled", handle, addr);
                return Err(Error::from_os_error(cancelled));
            }
            let mut events: WSANETWORKEVENTS = unsafe { mem::zeroed() };
            if unsafe { WSAEnumNetworkEvents(handle, event, &mut events) } != 0 {
                unsafe { WSAEventSelect(handle, ptr::null_mut(), 0) };
                return Err(last_socket_error());
            }
            let code = events.iErrorCode[FD_CONNECT_BIT as usize];
            if code != 0 {
                unsafe { WSAEventSelect(handle, ptr::null_mut(), 0) };
                let err = Error::from_os_error(code);
                error!("connect({}, {}): {}", handle, addr, err);
                return Err(err);
            }
        }
        unsafe { WSAEventSelect(handle, ptr::null_mut(), 0) };
        Ok(())
    }

    /// Accepts one connection, suspending until one arrives when attached
    /// to an I/O manager. The accepted socket shares the listener's I/O
    /// manager.
    #[cfg(unix)]
    pub fn accept(&self) -> Result<Socket> {
        let fd = self.handle();
        let mut newsock;
        let mut err;
        loop {
            newsock = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            err = errno();
            if !(newsock == -1 && err == libc::EINTR) {
                break;
            }
        }
        if let Some(io) = &self.inner.io {
            while newsock == -1 && (err == libc::EAGAIN || err == libc::EWOULDBLOCK) {
                io.register_event(fd, Direction::READ)?;
                let cancelled = self.inner.cancelled_receive.load(Ordering::Acquire);
                if cancelled != 0 {
                    error!("accept({}): cancelled", fd);
                    io.cancel_event(fd, Direction::READ);
                    self.yield_to_scheduler();
                    return Err(Error::from_os_error(cancelled));
                }
                let timer = self.timeout_timer(io, Direction::READ, self.receive_timeout());
                self.yield_to_scheduler();
                if let Some(timer) = timer {
                    timer.cancel();
                }
                let cancelled = self.inner.cancelled_receive.load(Ordering::Acquire);
                if cancelled != 0 {
                    error!("accept({}): cancelled", fd);
                    return Err(Error::from_os_error(cancelled));
                }
                loop {
                    newsock =
                        unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
                    err = errno();
                    if !(newsock == -1 && err == libc::EINTR) {
                        break;
                    }
                }
            }
        }
        if newsock == -1 {
            let err = Error::from_os_error(err);
            error!("accept({}): {}", fd, err);
            return Err(err);
        }
        if self.inner.io.is_some() {
            if let Err(err) = set_nonblocking(newsock) {
                unsafe { libc::close(newsock) };
                return Err(err);
            }
        }
        info!("accept({}): {}", fd, newsock);
        let accepted = Socket::from_parts(
            newsock,
            self.inner.family,
            self.inner.protocol,
            self.inner.io.clone(),
        );
        accepted.inner.connected.store(true, Ordering::Release);
        Ok(accepted)
    }

    /// Accepts one connection: overlapped `AcceptEx` when available, the
    /// single-event `WSAEventSelect` fallback otherwise.
    #[cfg(windows)]
    pub fn accept(&self) -> Result<Socket> {
        let handle = self.handle();
        let Some(io) = self.inner.io.clone() else {
            let newsock = unsafe { accept(handle, ptr::null_mut(), ptr::null_mut()) };
            if newsock == INVALID_SOCKET {
                let err = last_socket_error();
                error!("accept({}): {}", handle, err);
                return Err(err);
            }
            info!("accept({}): {}", handle, newsock);
            let accepted =
                Socket::from_parts(newsock, self.inner.family, self.inner.protocol, None);
            accepted.inner.connected.store(true, Ordering::Release);
            return Ok(accepted);
        };
        match self.accept_ex() {
            Some(accept_ex) => self.accept_overlapped(&io, accept_ex),
            None => self.accept_event_select(&io),
        }
    }

    #[cfg(windows)]
    fn accept_overlapped(
        &self,
        io: &IoShared,
        accept_ex: unsafe extern "system" fn(
            SOCKET,
            SOCKET,
            *mut c_void,
            u32,
            u32,
            u32,
            *mut u32,
            *mut OVERLAPPED,
        ) -> i32,
    ) -> Result<Socket> {
        let handle = self.handle();
        let socktype = self.socket_type()?;
        // AcceptEx wants the accept socket created up front.
        let target = create_socket(self.inner.family, socktype, self.inner.protocol)?;
        let mut addresses = [0u8; 2 * ACCEPTEX_ADDR_LEN];
        unsafe {
            *self.inner.receive_event.get() = AsyncEvent::new();
        }
        let event = unsafe { &mut *self.inner.receive_event.get() };
        io.register_event(event);
        let mut received = 0u32;
        let ok = unsafe {
            accept_ex(
                handle,
                target,
                addresses.as_mut_ptr() as *mut c_void,
                0,
                ACCEPTEX_ADDR_LEN as u32,
                ACCEPTEX_ADDR_LEN as u32,
                &mut received,
                &mut event.overlapped,
            )
        };
        if ok == 0 {
            let code = unsafe { WSAGetLastError() };
            if code != WSA_IO_PENDING {
                io.unregister_event(event);
                unsafe { closesocket(target) };
                let err = Error::from_os_error(code);
                error!("AcceptEx({}): {}", handle, err);
                return Err(err);
            }
        }
        let cancelled = self.inner.cancelled_receive.load(Ordering::Acquire);
        if cancelled != 0 {
            error!("accept({}): cancelled", handle);
            io.cancel_event(handle as HANDLE, event);
            self.yield_to_scheduler();
            unsafe { closesocket(target) };
            return Err(Error::from_os_error(cancelled));
        }
        let timer = self.timeout_timer(io, Direction::READ, self.receive_timeout());
        self.yield_to_scheduler();
        if let Some(timer) = timer {
            timer.cancel();
        }
        let event = unsafe { &*self.inner.receive_event.get() };
        let code =
            self.translate_overlapped_error(event.error, &self.inner.cancelled_receive);
        if code != 0 {
            unsafe { closesocket(target) };
            let err = Error::from_os_error(code as i32);
            error!("AcceptEx({}): {}", handle, err);
            return Err(err);
        }
        unsafe {
            setsockopt(
                target,
                WS_SOL_SOCKET,
                SO_UPDATE_ACCEPT_CONTEXT as i32,
                &handle as *const SOCKET as *const u8,
                mem::size_of::<SOCKET>() as i32,
            );
        }
        let accepted = Socket::from_parts(
            target,
            self.inner.family,
            self.inner.protocol,
            Some(io.clone()),
        );
        io.register_file(target as HANDLE)?;
        // The embedded addresses save the getpeername round trip.
        if let Some(get_sockaddrs) = self.accept_ex_sockaddrs() {
            let mut local: *mut SOCKADDR = ptr::null_mut();
            let mut local_len = 0i32;
            let mut remote: *mut SOCKADDR = ptr::null_mut();
            let mut remote_len = 0i32;
            unsafe {
                get_sockaddrs(
                    addresses.as_ptr() as *const c_void,
                    0,
                    ACCEPTEX_ADDR_LEN as u32,
                    ACCEPTEX_ADDR_LEN as u32,
                    &mut local,
                    &mut local_len,
                    &mut remote,
                    &mut remote_len,
                );
                if !local.is_null() {
                    *accepted.inner.local.lock().unwrap() =
                        Some(Address::from_raw_parts(local, local_len, 0, 0));
                }
                if !remote.is_null() {
                    *accepted.inner.remote.lock().unwrap() =
                        Some(Address::from_raw_parts(remote, remote_len, 0, 0));
                }
            }
        }
        accepted.inner.connected.store(true, Ordering::Release);
        info!("accept({}): {}", handle, target);
        Ok(accepted)
    }

    /// The pre-AcceptEx path: a single event handle and a single parked
    /// waiter per socket; concurrent use of this path on one socket is
    /// not supported.
    #[cfg(windows)]
    fn accept_event_select(&self, io: &IoShared) -> Result<Socket> {
        let handle = self.handle();
        let event = self.wait_event()?;
        if unsafe { WSAEventSelect(handle, event, FD_ACCEPT as i32) } != 0 {
            return Err(last_socket_error());
        }
        let newsock = loop {
            let newsock = unsafe { accept(handle, ptr::null_mut(), ptr::null_mut()) };
            if newsock != INVALID_SOCKET {
                break newsock;
            }
            let code = unsafe { WSAGetLastError() };
            if code != WSAEWOULDBLOCK {
                unsafe { WSAEventSelect(handle, ptr::null_mut(), 0) };
                let err = Error::from_os_error(code);
                error!("accept({}): {}", handle, err);
                return Err(err);
            }
            self.park_on_wait_event(io, event, Direction::READ, self.receive_timeout())?;
            let cancelled = self.inner.cancelled_receive.load(Ordering::Acquire);
            if cancelled != 0 {
                unsafe { WSAEventSelect(handle, ptr::null_mut(), 0) };
                error!("accept({}): cancelled", handle);
                return Err(Error::from_os_error(cancelled));
            }
            unsafe { ResetEvent(event) };
        };
        unsafe { WSAEventSelect(handle, ptr::null_mut(), 0) };
        let accepted = Socket::from_parts(
            newsock,
            self.inner.family,
            self.inner.protocol,
            Some(io.clone()),
        );
        io.register_file(newsock as HANDLE)?;
        accepted.inner.connected.store(true, Ordering::Release);
        info!("accept({}): {}", handle, newsock);
        Ok(accepted)
    }

    /// Parks the current fiber on the socket's wait event, with an
    /// optional timeout that posts a cancellation for `direction`.
    #[cfg(windows)]
    fn park_on_wait_event(
        &self,
        io: &IoShared,
        event: HANDLE,
        direction: Direction,
        timeout_us: Option<u64>,
    ) -> Result<()> {
        let scheduler = Scheduler::current().expect("socket I/O outside a scheduler thread");
        let fiber = Fiber::current();
        *self.inner.wait_fiber.lock().unwrap() = Some((scheduler.clone(), fiber));
        {
            let weak = Arc::downgrade(&self.inner);
            let registered = io.register_wait_event(event, move || {
                if let Some(inner) = weak.upgrade() {
                    if let Some((scheduler, fiber)) = inner.wait_fiber.lock().unwrap().take() {
                        scheduler.schedule_fiber(fiber);
                    }
                }
            });
            if let Err(err) = registered {
                self.inner.wait_fiber.lock().unwrap().take();
                return Err(err);
            }
        }
        let timer = self.timeout_timer(io, direction, timeout_us);
        scheduler.yield_to();
        if let Some(timer) = timer {
            timer.cancel();
        }
        Ok(())
    }

    /// Shuts down one or both directions of the connection.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        #[cfg(unix)]
        let how_raw = match how {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        #[cfg(windows)]
        let how_raw = match how {
            Shutdown::Read => SD_RECEIVE,
            Shutdown::Write => SD_SEND,
            Shutdown::Both => SD_BOTH,
        };
        #[cfg(unix)]
        let rc = unsafe { libc::shutdown(self.handle(), how_raw) };
        #[cfg(windows)]
        let rc = unsafe { shutdown(self.handle(), how_raw) };
        if rc != 0 {
            let err = last_socket_error();
            error!("shutdown({}, {:?}): {}", self.handle(), how, err);
            return Err(err);
        }
        self.teardown_remote_close(self.handle());
        self.inner.connected.store(false, Ordering::Release);
        debug!("shutdown({}, {:?})", self.handle(), how);
        Ok(())
    }

    /// Closes the descriptor, reporting any error. Errors on the implicit
    /// close at drop are logged and suppressed.
    pub fn close(&self) -> Result<()> {
        let handle = self.inner.handle.swap(INVALID_SOCKET_HANDLE, Ordering::AcqRel);
        if handle == INVALID_SOCKET_HANDLE {
            return Ok(());
        }
        self.teardown_remote_close(handle);
        if sys_close(handle) != 0 {
            let err = last_socket_error();
            error!("close({}): {}", handle, err);
            return Err(err);
        }
        debug!("close({})", handle);
        Ok(())
    }

    fn teardown_remote_close(&self, handle: SocketHandle) {
        if self.inner.remote_close_registered.swap(false, Ordering::AcqRel) {
            if let Some(io) = &self.inner.io {
                #[cfg(unix)]
                io.unregister_event(handle, Direction::CLOSE);
                #[cfg(windows)]
                {
                    let event = *self.inner.wait_event.lock().unwrap();
                    if event != 0 {
                        io.unregister_wait_event(event as HANDLE);
                        unsafe { WSAEventSelect(handle, ptr::null_mut(), 0) };
                    }
                }
            }
        }
    }

    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        self.send_vectored(&[IoSlice::new(buf)])
    }

    pub fn send_vectored(&self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        #[cfg(unix)]
        return self.do_send(bufs, None);
        #[cfg(windows)]
        return self.do_io(
            true,
            bufs.as_ptr() as *mut WSABUF,
            bufs.len() as u32,
            None,
            None,
        );
    }

    pub fn send_to(&self, buf: &[u8], to: &Address) -> Result<usize> {
        self.send_to_vectored(&[IoSlice::new(buf)], to)
    }

    pub fn send_to_vectored(&self, bufs: &[IoSlice<'_>], to: &Address) -> Result<usize> {
        #[cfg(unix)]
        return self.do_send(bufs, Some(to));
        #[cfg(windows)]
        return self.do_io(
            true,
            bufs.as_ptr() as *mut WSABUF,
            bufs.len() as u32,
            Some(to),
            None,
        );
    }

    /// Receives data; returns 0 at end-of-stream (the peer shut down its
    /// write side).
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        self.receive_vectored(&mut [IoSliceMut::new(buf)])
    }

    pub fn receive_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> Result<usize> {
        #[cfg(unix)]
        {
            let fd = self.handle();
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_iov = bufs.as_mut_ptr() as *mut libc::iovec;
            msg.msg_iovlen = bufs.len() as _;
            self.io_loop(Direction::READ, "recvmsg", || unsafe {
                libc::recvmsg(fd, &mut msg, 0)
            })
        }
        #[cfg(windows)]
        {
            self.do_io(
                false,
                bufs.as_mut_ptr() as *mut WSABUF,
                bufs.len() as u32,
                None,
                None,
            )
        }
    }

    pub fn receive_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        self.receive_from_vectored(&mut [IoSliceMut::new(buf)])
    }

    pub fn receive_from_vectored(
        &self,
        bufs: &mut [IoSliceMut<'_>],
    ) -> Result<(usize, Address)> {
        #[cfg(unix)]
        {
            let fd = self.handle();
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_iov = bufs.as_mut_ptr() as *mut libc::iovec;
            msg.msg_iovlen = bufs.len() as _;
            msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
            msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let received = self.io_loop(Direction::READ, "recvmsg", || unsafe {
                libc::recvmsg(fd, &mut msg, 0)
            })?;
            let len = msg.msg_namelen;
            let from = unsafe {
                Address::from_raw_parts(&storage as *const _ as *const RawSockAddr, len, 0, 0)
            };
            Ok((received, from))
        }
        #[cfg(windows)]
        {
            let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<SOCKADDR_STORAGE>() as i32;
            let received = self.do_io(
                false,
                bufs.as_mut_ptr() as *mut WSABUF,
                bufs.len() as u32,
                None,
                Some((&mut storage as *mut _ as *mut RawSockAddr, &mut len)),
            )?;
            let from = unsafe {
                Address::from_raw_parts(&storage as *const _ as *const RawSockAddr, len, 0, 0)
            };
            Ok((received, from))
        }
    }

    #[cfg(unix)]
    fn do_send(&self, bufs: &[IoSlice<'_>], to: Option<&Address>) -> Result<usize> {
        let fd = self.handle();
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = bufs.len() as _;
        if let Some(to) = to {
            let (raw, len) = to.as_raw();
            msg.msg_name = raw as *mut libc::c_void;
            msg.msg_namelen = len;
        }
        #[cfg(not(any(target_os = "ios", target_os = "macos")))]
        let flags = libc::MSG_NOSIGNAL;
        #[cfg(any(target_os = "ios", target_os = "macos"))]
        let flags = 0;
        self.io_loop(Direction::WRITE, "sendmsg", || unsafe {
            libc::sendmsg(fd, &msg, flags)
        })
    }

    /// Core of the async I/O protocol on POSIX, shared by every data
    /// operation.
    #[cfg(unix)]
    fn io_loop(
        &self,
        direction: Direction,
        api: &str,
        mut issue: impl FnMut() -> libc::ssize_t,
    ) -> Result<usize> {
        let fd = self.handle();
        if self.inner.io.is_some() {
            let cancelled = self.cancelled_slot(direction).load(Ordering::Acquire);
            if cancelled != 0 {
                let err = Error::from_os_error(cancelled);
                error!("{}({}): {}", api, fd, err);
                return Err(err);
            }
        }
        let mut rc;
        let mut err;
        loop {
            rc = issue();
            err = errno();
            if !(rc == -1 && err == libc::EINTR) {
                break;
            }
        }
        if let Some(io) = &self.inner.io {
            while rc == -1 && (err == libc::EAGAIN || err == libc::EWOULDBLOCK) {
                io.register_event(fd, direction)?;
                let timeout = if direction == Direction::WRITE {
                    self.send_timeout()
                } else {
                    self.receive_timeout()
                };
                let timer = self.timeout_timer(io, direction, timeout);
                self.yield_to_scheduler();
                if let Some(timer) = timer {
                    timer.cancel();
                }
                // A posted cancellation (explicit or timeout) wins over
                // whatever the kernel might now report.
                let cancelled = self.cancelled_slot(direction).load(Ordering::Acquire);
                if cancelled != 0 {
                    let err = Error::from_os_error(cancelled);
                    error!("{}({}): {}", api, fd, err);
                    return Err(err);
                }
                loop {
                    rc = issue();
                    err = errno();
                    if !(rc == -1 && err == libc::EINTR) {
                        break;
                    }
                }
            }
        }
        if rc == -1 {
            let err = Error::from_os_error(err);
            error!("{}({}): {}", api, fd, err);
            return Err(err);
        }
        debug!("{}({}): {}", api, fd, rc);
        Ok(rc as usize)
    }

    /// Core of the async I/O protocol on Windows: post the overlapped
    /// call with the direction's completion record registered, then wait
    /// for the port to fill it in.
    #[cfg(windows)]
    fn do_io(
        &self,
        is_send: bool,
        buffers: *mut WSABUF,
        count: u32,
        to: Option<&Address>,
        from: Option<(*mut RawSockAddr, *mut i32)>,
    ) -> Result<usize> {
        let api = if is_send {
            if to.is_some() {
                "WSASendTo"
            } else {
                "WSASend"
            }
        } else if from.is_some() {
            "WSARecvFrom"
        } else {
            "WSARecv"
        };
        let handle = self.handle();
        let direction = if is_send {
            Direction::WRITE
        } else {
            Direction::READ
        };
        let event_cell = if is_send {
            &self.inner.send_event
        } else {
            &self.inner.receive_event
        };
        if self.inner.io.is_some() {
            let cancelled = self.cancelled_slot(direction).load(Ordering::Acquire);
            if cancelled != 0 {
                let err = Error::from_os_error(cancelled);
                error!("{}({}): {}", api, handle, err);
                return Err(err);
            }
            unsafe {
                *event_cell.get() = AsyncEvent::new();
            }
        }
        let overlapped: *mut OVERLAPPED = match &self.inner.io {
            Some(io) => {
                let event = unsafe { &mut *event_cell.get() };
                io.register_event(event);
                &mut event.overlapped
            }
            None => ptr::null_mut(),
        };

        let mut transferred = 0u32;
        let mut flags = 0u32;
        let rc = unsafe {
            if is_send {
                match to {
                    Some(to) => {
                        let (raw, len) = to.as_raw();
                        WSASendTo(
                            handle,
                            buffers,
                            count,
                            &mut transferred,
                            0,
                            raw,
                            len,
                            overlapped,
                            None,
                        )
                    }
                    None => WSASend(handle, buffers, count, &mut transferred, 0, overlapped, None),
                }
            } else {
                match from {
                    Some((addr, addr_len)) => WSARecvFrom(
                        handle,
                        buffers,
                        count,
                        &mut transferred,
                        &mut flags,
                        addr,
                        addr_len,
                        overlapped,
                        None,
                    ),
                    None => WSARecv(
                        handle,
                        buffers,
                        count,
                        &mut transferred,
                        &mut flags,
                        overlapped,
                        None,
                    ),
                }
            }
        };
        if rc != 0 {
            let code = unsafe { WSAGetLastError() };
            if self.inner.io.is_none() || code != WSA_IO_PENDING {
                if let Some(io) = &self.inner.io {
                    io.unregister_event(unsafe { &*event_cell.get() });
                }
                let err = Error::from_os_error(code);
                error!("{}({}): {}", api, handle, err);
                return Err(err);
            }
        }
        let Some(io) = &self.inner.io else {
            debug!("{}({}): {}", api, handle, transferred);
            return Ok(transferred as usize);
        };
        // The port sees a packet even for synchronous completions, so
        // always wait for it.
        let timeout = if is_send {
            self.send_timeout()
        } else {
            self.receive_timeout()
        };
        let timer = self.timeout_timer(io, direction, timeout);
        self.yield_to_scheduler();
        if let Some(timer) = timer {
            timer.cancel();
        }
        let event = unsafe { &*event_cell.get() };
        let code = self.translate_overlapped_error(event.error, self.cancelled_slot(direction));
        if code != 0 {
            let err = Error::from_os_error(code as i32);
            error!("{}({}): {}", api, handle, err);
            return Err(err);
        }
        debug!("{}({}): {}", api, handle, event.bytes);
        Ok(event.bytes as usize)
    }

    /// A timeout-driven abort looks like any other abort to the port;
    /// only the sticky flag tells them apart.
    #[cfg(windows)]
    fn translate_overlapped_error(&self, code: u32, cancelled: &AtomicI32) -> u32 {
        let mut code = code;
        if code == ERROR_OPERATION_ABORTED
            && cancelled.load(Ordering::Acquire) != ERROR_OPERATION_ABORTED as i32
        {
            code = WSAETIMEDOUT as u32;
        }
        if code == ERROR_SEM_TIMEOUT {
            code = WSAETIMEDOUT as u32;
        }
        code
    }

    fn cancelled_slot(&self, direction: Direction) -> &AtomicI32 {
        if direction == Direction::WRITE {
            &self.inner.cancelled_send
        } else {
            &self.inner.cancelled_receive
        }
    }

    fn yield_to_scheduler(&self) {
        Scheduler::current()
            .expect("socket I/O outside a scheduler thread")
            .yield_to();
    }

    /// Arms a one-shot timer that posts a `TimedOut` cancellation for
    /// `direction`, or `None` when no timeout is configured.
    fn timeout_timer(
        &self,
        io: &IoShared,
        direction: Direction,
        timeout_us: Option<u64>,
    ) -> Option<Timer> {
        let timeout_us = timeout_us?;
        let weak = Arc::downgrade(&self.inner);
        Some(io.register_timer(
            timeout_us,
            move || {
                if let Some(inner) = weak.upgrade() {
                    Socket { inner }.cancel_io(direction, TIMED_OUT_ERROR);
                }
            },
            false,
        ))
    }

    /// Posts a sticky cancellation for one direction and wakes any
    /// pending waiter through the I/O manager's cancel primitive.
    #[cfg(unix)]
    fn cancel_io(&self, direction: Direction, error: i32) {
        debug_assert_ne!(error, 0);
        let slot = self.cancelled_slot(direction);
        if slot
            .compare_exchange(0, error, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Some(io) = &self.inner.io {
            io.cancel_event(self.handle(), direction);
        }
    }

    /// Posts a sticky cancellation for one direction. An event-select
    /// waiter has no overlapped operation to cancel and is unhooked and
    /// rescheduled directly; otherwise the in-flight overlapped call is
    /// aborted and its completion settles the fiber.
    #[cfg(windows)]
    fn cancel_io(&self, direction: Direction, error: i32) {
        debug_assert_ne!(error, 0);
        let slot = self.cancelled_slot(direction);
        if slot
            .compare_exchange(0, error, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let Some(io) = &self.inner.io else {
            return;
        };
        if let Some((scheduler, fiber)) = self.inner.wait_fiber.lock().unwrap().take() {
            let event = *self.inner.wait_event.lock().unwrap();
            if event != 0 {
                io.unregister_wait_event(event as HANDLE);
            }
            scheduler.schedule_fiber(fiber);
            return;
        }
        let event_cell = if direction == Direction::WRITE {
            &self.inner.send_event
        } else {
            &self.inner.receive_event
        };
        io.cancel_event(self.handle() as HANDLE, unsafe { &*event_cell.get() });
    }

    /// Cancels a pending accept; subsequent waits on the receive
    /// direction fail with [`Error::OperationAborted`].
    pub fn cancel_accept(&self) {
        self.cancel_io(Direction::READ, CANCELLED_ERROR);
    }

    /// Cancels a pending connect.
    pub fn cancel_connect(&self) {
        self.cancel_io(Direction::WRITE, CANCELLED_ERROR);
    }

    /// Cancels pending and future sends.
    pub fn cancel_send(&self) {
        self.cancel_io(Direction::WRITE, CANCELLED_ERROR);
    }

    /// Cancels pending and future receives.
    pub fn cancel_receive(&self) {
        self.cancel_io(Direction::READ, CANCELLED_ERROR);
    }

    pub fn get_option<T: Copy>(&self, level: i32, option: i32) -> Result<T> {
        let mut value = mem::MaybeUninit::<T>::uninit();
        #[cfg(unix)]
        {
            let mut len = mem::size_of::<T>() as libc::socklen_t;
            if unsafe {
                libc::getsockopt(
                    self.handle(),
                    level,
                    option,
                    value.as_mut_ptr() as *mut libc::c_void,
                    &mut len,
                )
            } != 0
            {
                return Err(Error::last_os_error());
            }
        }
        #[cfg(windows)]
        {
            let mut len = mem::size_of::<T>() as i32;
            if unsafe {
                getsockopt(
                    self.handle(),
                    level,
                    option,
                    value.as_mut_ptr() as *mut u8,
                    &mut len,
                )
            } != 0
            {
                return Err(last_socket_error());
            }
        }
        Ok(unsafe { value.assume_init() })
    }

    pub fn set_option<T: Copy>(&self, level: i32, option: i32, value: &T) -> Result<()> {
        #[cfg(unix)]
        let rc = unsafe {
            libc::setsockopt(
                self.handle(),
                level,
                option,
                value as *const T as *const libc::c_void,
                mem::size_of::<T>() as libc::socklen_t,
            )
        };
        #[cfg(windows)]
        let rc = unsafe {
            setsockopt(
                self.handle(),
                level,
                option,
                value as *const T as *const u8,
                mem::size_of::<T>() as i32,
            )
        };
        if rc != 0 {
            return Err(last_socket_error());
        }
        Ok(())
    }

    pub fn set_reuse_address(&self, reuse: bool) -> Result<()> {
        #[cfg(unix)]
        return self.set_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, &(reuse as i32));
        #[cfg(windows)]
        return self.set_option(WS_SOL_SOCKET, WS_SO_REUSEADDR, &(reuse as i32));
    }

    /// The bound local address, cached after the first query.
    pub fn local_addr(&self) -> Result<Address> {
        let mut cached = self.inner.local.lock().unwrap();
        if let Some(addr) = cached.as_ref() {
            return Ok(addr.clone());
        }
        #[cfg(unix)]
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        #[cfg(windows)]
        let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as RawSockLen;
        #[cfg(unix)]
        let rc = unsafe {
            libc::getsockname(self.handle(), &mut storage as *mut _ as *mut RawSockAddr, &mut len)
        };
        #[cfg(windows)]
        let rc = unsafe {
            getsockname(self.handle(), &mut storage as *mut _ as *mut RawSockAddr, &mut len)
        };
        if rc != 0 {
            return Err(last_socket_error());
        }
        let addr = unsafe {
            Address::from_raw_parts(&storage as *const _ as *const RawSockAddr, len, 0, 0)
        };
        *cached = Some(addr.clone());
        Ok(addr)
    }

    /// The peer address, cached after the first query.
    pub fn remote_addr(&self) -> Result<Address> {
        let mut cached = self.inner.remote.lock().unwrap();
        if let Some(addr) = cached.as_ref() {
            return Ok(addr.clone());
        }
        #[cfg(unix)]
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        #[cfg(windows)]
        let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as RawSockLen;
        #[cfg(unix)]
        let rc = unsafe {
            libc::getpeername(self.handle(), &mut storage as *mut _ as *mut RawSockAddr, &mut len)
        };
        #[cfg(windows)]
        let rc = unsafe {
            getpeername(self.handle(), &mut storage as *mut _ as *mut RawSockAddr, &mut len)
        };
        if rc != 0 {
            return Err(last_socket_error());
        }
        let addr = unsafe {
            Address::from_raw_parts(&storage as *const _ as *const RawSockAddr, len, 0, 0)
        };
        *cached = Some(addr.clone());
        Ok(addr)
    }

    /// An unspecified address of this socket's family, e.g. for
    /// `receive_from` on unconnected sockets.
    pub fn empty_address(&self) -> Address {
        #[cfg(unix)]
        let (inet, inet6) = (libc::AF_INET, libc::AF_INET6);
        #[cfg(windows)]
        let (inet, inet6) = (AF_INET as i32, AF_INET6 as i32);
        if self.inner.family == inet {
            return Address::Ipv4(Ipv4Address::any());
        }
        if self.inner.family == inet6 {
            return Address::Ipv6(Ipv6Address::any());
        }
        #[cfg(unix)]
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        #[cfg(windows)]
        let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
        storage.ss_family = self.inner.family as _;
        unsafe {
            Address::from_raw_parts(
                &storage as *const _ as *const RawSockAddr,
                mem::size_of_val(&storage) as RawSockLen,
                0,
                0,
            )
        }
    }

    /// Registers a callback fired when the peer half-closes the
    /// connection, independent of any outstanding receive. Requires an
    /// attached I/O manager.
    pub fn on_remote_close(&self, callback: impl Fn() + Send + Sync + 'static) -> Result<()> {
        self.inner
            .on_remote_close
            .lock()
            .unwrap()
            .push(Arc::new(callback));
        if self.inner.connected.load(Ordering::Acquire)
            && !self.inner.remote_close_registered.load(Ordering::Acquire)
        {
            self.register_for_remote_close()?;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn register_for_remote_close(&self) -> Result<()> {
        let Some(io) = &self.inner.io else {
            return Err(Error::Native(libc::EOPNOTSUPP));
        };
        let weak = Arc::downgrade(&self.inner);
        io.register_event_with(
            self.handle(),
            Direction::CLOSE,
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let callbacks = inner.on_remote_close.lock().unwrap().clone();
                    for callback in callbacks {
                        callback();
                    }
                }
            }),
        )?;
        self.inner
            .remote_close_registered
            .store(true, Ordering::Release);
        Ok(())
    }

    /// Selects `FD_CLOSE` onto the socket's wait event and watches it
    /// through the I/O manager's wait blocks.
    #[cfg(windows)]
    fn register_for_remote_close(&self) -> Result<()> {
        let Some(io) = &self.inner.io else {
            return Err(Error::Native(WSAEINVAL));
        };
        let event = self.wait_event()?;
        if unsafe { WSAEventSelect(self.handle(), event, FD_CLOSE as i32) } != 0 {
            return Err(last_socket_error());
        }
        let weak = Arc::downgrade(&self.inner);
        io.register_wait_event(event, move || {
            if let Some(inner) = weak.upgrade() {
                let callbacks = inner.on_remote_close.lock().unwrap().clone();
                for callback in callbacks {
                    callback();
                }
            }
        })?;
        self.inner
            .remote_close_registered
            .store(true, Ordering::Release);
        Ok(())
    }

    /// Lazily creates the socket's single manual-reset event handle.
    #[cfg(windows)]
    fn wait_event(&self) -> Result<HANDLE> {
        let mut slot = self.inner.wait_event.lock().unwrap();
        if *slot == 0 {
            let event = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
            if event.is_null() {
                return Err(Error::from_os_error(unsafe { GetLastError() } as i32));
            }
            *slot = event as usize;
        } else {
            unsafe { ResetEvent(*slot as HANDLE) };
        }
        Ok(*slot as HANDLE)
    }

    #[cfg(windows)]
    fn connect_ex(&self) -> LPFN_CONNECTEX {
        self.extension_function::<LPFN_CONNECTEX>(windows_sys::Win32::Networking::WinSock::WSAID_CONNECTEX)
    }

    #[cfg(windows)]
    fn accept_ex(&self) -> LPFN_ACCEPTEX {
        self.extension_function::<LPFN_ACCEPTEX>(windows_sys::Win32::Networking::WinSock::WSAID_ACCEPTEX)
    }

    #[cfg(windows)]
    fn accept_ex_sockaddrs(&self) -> LPFN_GETACCEPTEXSOCKADDRS {
        self.extension_function::<LPFN_GETACCEPTEXSOCKADDRS>(
            windows_sys::Win32::Networking::WinSock::WSAID_GETACCEPTEXSOCKADDRS,
        )
    }

    /// Asks the provider for one of the extension function pointers;
    /// `None` on providers that predate them.
    #[cfg(windows)]
    fn extension_function<F: Copy + Default>(&self, guid: GUID) -> F {
        let mut function = F::default();
        let mut bytes = 0u32;
        let rc = unsafe {
            WSAIoctl(
                self.handle(),
                SIO_GET_EXTENSION_FUNCTION_POINTER,
                &guid as *const GUID as *const c_void,
                mem::size_of::<GUID>() as u32,
                &mut function as *mut F as *mut c_void,
                mem::size_of::<F>() as u32,
                &mut bytes,
                ptr::null_mut(),
                None,
            )
        };
        if rc != 0 {
            return F::default();
        }
        function
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let handle = self.handle.swap(INVALID_SOCKET_HANDLE, Ordering::AcqRel);
        #[cfg(windows)]
        {
            let event = *self.wait_event.lock().unwrap();
            if event != 0 {
                if self.remote_close_registered.load(Ordering::Acquire) {
                    if let Some(io) = &self.io {
                        io.unregister_wait_event(event as HANDLE);
                    }
                }
                unsafe { CloseHandle(event as HANDLE) };
            }
        }
        if handle == INVALID_SOCKET_HANDLE {
            return;
        }
        #[cfg(unix)]
        if self.remote_close_registered.load(Ordering::Acquire) {
            if let Some(io) = &self.io {
                io.unregister_event(handle, Direction::CLOSE);
            }
        }
        if sys_close(handle) != 0 {
            // Close errors are reported by the explicit `close` only.
            error!("close({}): {}", handle, last_socket_error());
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("handle", &self.handle())
            .field("family", &self.inner.family)
            .field("connected", &self.inner.connected.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(unix)]
fn create_socket(family: i32, socktype: i32, protocol: i32) -> Result<SocketHandle> {
    let fd = unsafe { libc::socket(family, socktype, protocol) };
    if fd == -1 {
        let err = Error::last_os_error();
        error!("socket({}, {}, {}): {}", family, socktype, protocol, err);
        return Err(err);
    }
    debug!("socket({}, {}, {}): {}", family, socktype, protocol, fd);
    #[cfg(any(target_os = "ios", target_os = "macos"))]
    {
        let opt: libc::c_uint = 1;
        if unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &opt as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_uint>() as libc::socklen_t,
            )
        } == -1
        {
            let err = Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
    }
    Ok(fd)
}

#[cfg(windows)]
fn create_socket(family: i32, socktype: i32, protocol: i32) -> Result<SocketHandle> {
    let handle = unsafe { socket(family, socktype, protocol) };
    if handle == INVALID_SOCKET {
        let err = last_socket_error();
        error!("socket({}, {}, {}): {}", family, socktype, protocol, err);
        return Err(err);
    }
    debug!("socket({}, {}, {}): {}", family, socktype, protocol, handle);
    Ok(handle)
}

#[cfg(unix)]
fn set_nonblocking(fd: RawFd) -> Result<()> {
    if unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) } == -1 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

fn sys_close(handle: SocketHandle) -> i32 {
    #[cfg(unix)]
    return unsafe { libc::close(handle) };
    #[cfg(windows)]
    return unsafe { closesocket(handle) };
}

fn last_socket_error() -> Error {
    #[cfg(unix)]
    return Error::last_os_error();
    #[cfg(windows)]
    return Error::from_os_error(unsafe { WSAGetLastError() });
}

#[cfg(unix)]
fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
