#![cfg(unix)]

use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use weft::net::{Address, Socket};
use weft::timer::now_us;
use weft::{Error, IoManager};

mod util;
use util::init;

struct Conn {
    listen: Socket,
    connect: Socket,
    address: Address,
}

fn establish(io: &IoManager) -> Conn {
    let address = Address::lookup("127.0.0.1:0", libc::AF_INET, libc::SOCK_STREAM, 0)
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    let listen = Socket::with_io_manager(io, address.family(), libc::SOCK_STREAM, 0).unwrap();
    listen.set_reuse_address(true).unwrap();
    listen.bind(&address).unwrap();
    listen.listen().unwrap();
    // The ephemeral port the kernel picked.
    let address = listen.local_addr().unwrap();
    assert_ne!(address.port(), Some(0));
    let connect = Socket::with_io_manager(io, address.family(), libc::SOCK_STREAM, 0).unwrap();
    Conn {
        listen,
        connect,
        address,
    }
}

/// Schedules an accept and drives it together with a connect from the
/// main fiber.
fn connect_pair(io: &IoManager, conn: &Conn) -> Socket {
    let accepted = Arc::new(Mutex::new(None));
    {
        let listen = conn.listen.clone();
        let accepted = Arc::clone(&accepted);
        io.schedule(move || {
            *accepted.lock().unwrap() = Some(listen.accept().unwrap());
        });
    }
    conn.connect.connect(&conn.address).unwrap();
    io.dispatch();
    let accepted = accepted.lock().unwrap().take().unwrap();
    accepted
}

#[test]
fn accept_then_receive() {
    init();
    let io = IoManager::new(1, true).unwrap();
    let conn = establish(&io);
    let accepted = connect_pair(&io, &conn);

    assert_eq!(conn.connect.send(b"abcd").unwrap(), 4);
    let mut buf = [0u8; 4];
    assert_eq!(accepted.receive(&mut buf).unwrap(), 4);
    assert_eq!(&buf, b"abcd");

    // And the other direction.
    assert_eq!(accepted.send(b"efgh").unwrap(), 4);
    assert_eq!(conn.connect.receive(&mut buf).unwrap(), 4);
    assert_eq!(&buf, b"efgh");
}

#[test]
fn addresses_are_cached_and_consistent() {
    init();
    let io = IoManager::new(1, true).unwrap();
    let conn = establish(&io);
    let accepted = connect_pair(&io, &conn);
    assert_eq!(accepted.remote_addr().unwrap(), conn.connect.local_addr().unwrap());
    assert_eq!(accepted.local_addr().unwrap(), conn.connect.remote_addr().unwrap());
}

#[test]
fn receive_timeout_is_sticky() {
    init();
    let io = IoManager::new(1, true).unwrap();
    let conn = establish(&io);
    conn.connect.set_receive_timeout(Some(1_000_000));
    let _accepted = connect_pair(&io, &conn);

    let mut buf = [0u8; 1];
    let start = now_us();
    match conn.connect.receive(&mut buf) {
        Err(Error::TimedOut) => {}
        other => panic!("expected TimedOut, got {:?}", other.map(|_| ())),
    }
    let elapsed = now_us() - start;
    assert!(
        (900_000..1_100_000).contains(&elapsed),
        "timed out after {}us",
        elapsed
    );
    // The cancellation is sticky: the next receive fails immediately.
    let start = now_us();
    assert!(matches!(conn.connect.receive(&mut buf), Err(Error::TimedOut)));
    assert!(now_us() - start < 100_000);
    // The send direction is unaffected.
    assert_eq!(conn.connect.send(b"x").unwrap(), 1);
}

#[test]
fn accept_timeout() {
    init();
    let io = IoManager::new(1, true).unwrap();
    let conn = establish(&io);
    conn.listen.set_receive_timeout(Some(1_000_000));
    let start = now_us();
    assert!(matches!(conn.listen.accept(), Err(Error::TimedOut)));
    let elapsed = now_us() - start;
    assert!(
        (900_000..1_100_000).contains(&elapsed),
        "timed out after {}us",
        elapsed
    );
    assert!(matches!(conn.listen.accept(), Err(Error::TimedOut)));
}

#[test]
fn send_timeout() {
    init();
    let io = IoManager::new(1, true).unwrap();
    let conn = establish(&io);
    conn.connect.set_send_timeout(Some(1_000_000));
    let _accepted = connect_pair(&io, &conn);

    let buf = [0u8; 65536];
    let start = now_us();
    let err = loop {
        match conn.connect.send(&buf) {
            Ok(_) => continue,
            Err(err) => break err,
        }
    };
    assert!(matches!(err, Error::TimedOut));
    let elapsed = now_us() - start;
    assert!(
        (900_000..1_500_000).contains(&elapsed),
        "timed out after {}us",
        elapsed
    );
    assert!(matches!(conn.connect.send(&buf), Err(Error::TimedOut)));
}

#[test]
fn cancel_a_pending_accept() {
    init();
    let io = IoManager::new(1, true).unwrap();
    let conn = establish(&io);
    let result = Arc::new(Mutex::new(None));
    {
        let listen = conn.listen.clone();
        let result = Arc::clone(&result);
        io.schedule(move || {
            *result.lock().unwrap() = Some(listen.accept().map(|_| ()));
        });
    }
    {
        let listen = conn.listen.clone();
        io.schedule(move || listen.cancel_accept());
    }
    io.dispatch();
    let result = result.lock().unwrap().take().unwrap();
    assert!(matches!(result, Err(Error::OperationAborted)));
}

#[test]
fn cancelled_receive_never_touches_the_kernel() {
    init();
    let io = IoManager::new(1, true).unwrap();
    let conn = establish(&io);
    let accepted = connect_pair(&io, &conn);

    // Data is waiting, but the posted cancellation still wins.
    accepted.send(b"pending").unwrap();
    conn.connect.cancel_receive();
    let mut buf = [0u8; 16];
    assert!(matches!(
        conn.connect.receive(&mut buf),
        Err(Error::OperationAborted)
    ));
    assert!(matches!(
        conn.connect.receive(&mut buf),
        Err(Error::OperationAborted)
    ));
}

#[test]
fn peer_shutdown_reads_as_eof() {
    init();
    let io = IoManager::new(1, true).unwrap();
    let conn = establish(&io);
    let accepted = connect_pair(&io, &conn);

    accepted.shutdown(Shutdown::Write).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(conn.connect.receive(&mut buf).unwrap(), 0);
}

#[test]
fn remote_close_notification() {
    init();
    let io = IoManager::new(1, true).unwrap();
    let conn = establish(&io);
    let accepted = connect_pair(&io, &conn);

    let notified = Arc::new(AtomicBool::new(false));
    {
        let notified = Arc::clone(&notified);
        conn.connect
            .on_remote_close(move || notified.store(true, Ordering::SeqCst))
            .unwrap();
    }
    accepted.close().unwrap();
    io.dispatch();
    assert!(notified.load(Ordering::SeqCst));
}

#[test]
fn udp_send_to_and_receive_from() {
    init();
    let io = IoManager::new(1, true).unwrap();
    let address = Address::lookup("127.0.0.1:0", libc::AF_INET, libc::SOCK_DGRAM, 0)
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    let receiver = Socket::with_io_manager(&io, address.family(), libc::SOCK_DGRAM, 0).unwrap();
    receiver.bind(&address).unwrap();
    let receiver_addr = receiver.local_addr().unwrap();
    let sender = Socket::with_io_manager(&io, address.family(), libc::SOCK_DGRAM, 0).unwrap();
    sender.bind(&address).unwrap();
    let sender_addr = sender.local_addr().unwrap();

    let payload: [u8; 8] = rand::random();
    assert_eq!(sender.send_to(&payload, &receiver_addr).unwrap(), 8);
    let mut buf = [0u8; 16];
    let (received, from) = receiver.receive_from(&mut buf).unwrap();
    assert_eq!(received, 8);
    assert_eq!(&buf[..8], &payload);
    assert_eq!(from, sender_addr);
}

#[test]
fn sleep_suspends_for_the_requested_time() {
    init();
    let io = IoManager::new(1, true).unwrap();
    let start = now_us();
    io.sleep(200_000);
    let elapsed = now_us() - start;
    assert!(
        (180_000..500_000).contains(&elapsed),
        "slept for {}us",
        elapsed
    );
}

#[test]
fn io_timer_fires_and_cancelled_timer_does_not() {
    init();
    let io = IoManager::new(1, true).unwrap();
    let fired_at = Arc::new(Mutex::new(None));
    let start = now_us();
    {
        let fired_at = Arc::clone(&fired_at);
        io.register_timer(
            1_000_000,
            move || {
                *fired_at.lock().unwrap() = Some(now_us());
            },
            false,
        );
    }
    let cancelled_fired = Arc::new(AtomicBool::new(false));
    let cancelled = {
        let cancelled_fired = Arc::clone(&cancelled_fired);
        io.register_timer(500_000, move || cancelled_fired.store(true, Ordering::SeqCst), false)
    };
    cancelled.cancel();
    // dispatch keeps the idle fiber alive until the pending timer fires.
    io.dispatch();
    let fired_at = fired_at.lock().unwrap().expect("timer never fired");
    let elapsed = fired_at - start;
    assert!(
        (900_000..1_100_000).contains(&elapsed),
        "fired after {}us",
        elapsed
    );
    assert!(!cancelled_fired.load(Ordering::SeqCst));
}

#[test]
fn socket_type_and_options() {
    init();
    let socket = Socket::new(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    assert_eq!(socket.socket_type().unwrap(), libc::SOCK_STREAM);
    socket.set_reuse_address(true).unwrap();
    assert_ne!(
        socket
            .get_option::<i32>(libc::SOL_SOCKET, libc::SO_REUSEADDR)
            .unwrap(),
        0
    );
    assert_eq!(socket.family(), libc::AF_INET);
}
