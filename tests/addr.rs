#![cfg(unix)]

use std::net::{Ipv4Addr, Ipv6Addr};

use weft::net::{Address, Ipv4Address, Ipv6Address};
use weft::Error;

mod util;
use util::init;

#[test]
fn lookup_node_and_service() {
    init();
    let addresses =
        Address::lookup("127.0.0.1:8080", libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    assert!(!addresses.is_empty());
    let address = &addresses[0];
    assert_eq!(address.family(), libc::AF_INET);
    assert_eq!(address.port(), Some(8080));
    assert_eq!(address.to_string(), "127.0.0.1:8080");
    assert_eq!(address.without_port().to_string(), "127.0.0.1");
}

#[test]
fn lookup_bracketed_ipv6() {
    init();
    let addresses = Address::lookup("[::1]:443", libc::AF_INET6, libc::SOCK_STREAM, 0).unwrap();
    assert!(!addresses.is_empty());
    let address = &addresses[0];
    assert_eq!(address.family(), libc::AF_INET6);
    assert_eq!(address.port(), Some(443));
    assert_eq!(address.to_string(), "[::1]:443");
    assert_eq!(address.without_port().to_string(), "::1");
}

#[test]
fn lookup_bare_ipv6_literal_is_not_split() {
    init();
    // Multiple colons mean the host has no service component.
    let addresses = Address::lookup("::1", libc::AF_INET6, libc::SOCK_DGRAM, 0).unwrap();
    assert!(!addresses.is_empty());
    assert_eq!(addresses[0].port(), Some(0));
}

#[test]
fn lookup_failure_maps_to_the_taxonomy() {
    init();
    // `.invalid` is reserved to never resolve.
    let result = Address::lookup(
        "this-host-does-not-exist.invalid",
        libc::AF_UNSPEC,
        libc::SOCK_STREAM,
        0,
    );
    assert!(matches!(result, Err(Error::NameLookup(_))));
}

#[test]
fn set_port() {
    init();
    let mut address = Address::from(Ipv4Address::new(Ipv4Addr::new(10, 0, 0, 1), 0));
    address.set_port(4242);
    assert_eq!(address.port(), Some(4242));
    assert_eq!(address.to_string(), "10.0.0.1:4242");
}

#[test]
fn ipv4_mask_math() {
    init();
    assert_eq!(
        Ipv4Address::subnet_mask(24).addr(),
        Ipv4Addr::new(255, 255, 255, 0)
    );
    assert_eq!(Ipv4Address::subnet_mask(0).addr(), Ipv4Addr::UNSPECIFIED);
    assert_eq!(
        Ipv4Address::subnet_mask(32).addr(),
        Ipv4Addr::new(255, 255, 255, 255)
    );

    let host = Ipv4Address::new(Ipv4Addr::new(192, 168, 1, 17), 80);
    assert_eq!(
        host.broadcast_address(24).addr(),
        Ipv4Addr::new(192, 168, 1, 255)
    );
    assert_eq!(
        host.network_address(24).addr(),
        Ipv4Addr::new(192, 168, 1, 0)
    );
    // The port is carried through.
    assert_eq!(host.network_address(24).port(), 80);
}

#[test]
fn ipv6_mask_math() {
    init();
    let mask = Ipv6Address::subnet_mask(64).addr();
    assert_eq!(
        mask,
        "ffff:ffff:ffff:ffff::".parse::<Ipv6Addr>().unwrap()
    );
    let host = Ipv6Address::new("2001:db8::42".parse().unwrap(), 0);
    assert_eq!(
        host.network_address(32).addr(),
        "2001:db8::".parse::<Ipv6Addr>().unwrap()
    );
}

#[test]
fn equality_and_ordering() {
    init();
    let a = Address::from(Ipv4Address::new(Ipv4Addr::new(127, 0, 0, 1), 80));
    let b = Address::from(Ipv4Address::new(Ipv4Addr::new(127, 0, 0, 1), 80));
    let c = Address::from(Ipv4Address::new(Ipv4Addr::new(127, 0, 0, 1), 81));
    assert_eq!(a, b);
    assert_ne!(a, c);
    let mut sorted = vec![c.clone(), a.clone()];
    sorted.sort();
    assert_eq!(sorted, vec![a, c]);
}

#[test]
fn unix_address_display() {
    init();
    let address = Address::from(weft::net::UnixAddress::new("/tmp/weft.sock").unwrap());
    assert_eq!(address.family(), libc::AF_UNIX);
    assert_eq!(address.to_string(), "/tmp/weft.sock");
}

#[test]
#[cfg(any(target_os = "android", target_os = "linux"))]
fn abstract_unix_address_display() {
    init();
    let address = Address::from(weft::net::UnixAddress::new_abstract(b"weft-test").unwrap());
    assert_eq!(address.to_string(), "@weft-test");
}

#[test]
fn interface_addresses_enumerate() {
    init();
    let interfaces = Address::interface_addresses().unwrap();
    // Any sane environment has at least a loopback interface.
    assert!(!interfaces.is_empty());
    for addresses in interfaces.values() {
        for (address, prefix) in addresses {
            match address.family() {
                libc::AF_INET => assert!(*prefix <= 32),
                libc::AF_INET6 => assert!(*prefix <= 128),
                _ => {}
            }
        }
    }
}

#[test]
fn from_std_socket_addr() {
    init();
    let std_addr: std::net::SocketAddr = "192.0.2.7:9000".parse().unwrap();
    let address = Address::from(std_addr);
    assert_eq!(address.to_string(), "192.0.2.7:9000");
}
