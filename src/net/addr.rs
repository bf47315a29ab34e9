//! Socket addresses and name resolution.
//!
//! [`Address`] wraps the platform's raw socket address structures so the
//! same value can be handed to `bind`/`connect` and the data-path calls
//! without re-encoding, while printing and comparing like a first-class
//! value. [`Address::lookup`] drives the platform resolver and accepts
//! `host`, `host:service` and `[ipv6]:service` forms. Unix-domain
//! addresses exist on POSIX targets only.

use std::collections::HashMap;
use std::ffi::CString;
#[cfg(unix)]
use std::ffi::CStr;
use std::fmt;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
#[cfg(unix)]
use std::path::Path;
use std::ptr;

use log::{debug, error};

#[cfg(windows)]
use windows_sys::Win32::Foundation::ERROR_BUFFER_OVERFLOW;
#[cfg(windows)]
use windows_sys::Win32::NetworkManagement::IpHelper::{
    GetAdaptersAddresses, IP_ADAPTER_ADDRESSES_LH, IP_ADAPTER_UNICAST_ADDRESS_LH,
};
#[cfg(windows)]
use windows_sys::Win32::Networking::WinSock::{
    freeaddrinfo, getaddrinfo, ADDRINFOA, AF_INET, AF_INET6, AF_UNSPEC, SOCKADDR, SOCKADDR_IN,
    SOCKADDR_IN6, SOCKADDR_STORAGE, SOCK_STREAM, WSAEINVAL,
};

use crate::{Error, Result};

#[cfg(unix)]
pub(crate) type RawSockAddr = libc::sockaddr;
#[cfg(unix)]
pub(crate) type RawSockLen = libc::socklen_t;
#[cfg(windows)]
pub(crate) type RawSockAddr = SOCKADDR;
#[cfg(windows)]
pub(crate) type RawSockLen = i32;

#[cfg(unix)]
const FAMILY_INET: i32 = libc::AF_INET;
#[cfg(unix)]
const FAMILY_INET6: i32 = libc::AF_INET6;
#[cfg(windows)]
const FAMILY_INET: i32 = AF_INET as i32;
#[cfg(windows)]
const FAMILY_INET6: i32 = AF_INET6 as i32;

/// A socket address of any supported family.
#[derive(Clone)]
pub enum Address {
    Ipv4(Ipv4Address),
    Ipv6(Ipv6Address),
    #[cfg(unix)]
    Unix(UnixAddress),
    Unknown(UnknownAddress),
}

/// An IPv4 address and port.
#[derive(Clone, Copy)]
pub struct Ipv4Address {
    #[cfg(unix)]
    sin: libc::sockaddr_in,
    #[cfg(windows)]
    sin: SOCKADDR_IN,
    socktype: i32,
    protocol: i32,
}

/// An IPv6 address and port.
#[derive(Clone, Copy)]
pub struct Ipv6Address {
    #[cfg(unix)]
    sin6: libc::sockaddr_in6,
    #[cfg(windows)]
    sin6: SOCKADDR_IN6,
    socktype: i32,
    protocol: i32,
}

/// A unix-domain socket address: pathname, abstract (Linux), or unnamed.
#[cfg(unix)]
#[derive(Clone, Copy)]
pub struct UnixAddress {
    sun: libc::sockaddr_un,
    len: RawSockLen,
}

/// An address of a family this crate has no dedicated representation
/// for; carried as raw bytes.
#[derive(Clone)]
pub struct UnknownAddress {
    #[cfg(unix)]
    storage: libc::sockaddr_storage,
    #[cfg(windows)]
    storage: SOCKADDR_STORAGE,
    len: RawSockLen,
}

impl Address {
    /// Resolves `host` through the platform name resolver, returning one
    /// address per result.
    ///
    /// `host` may be a bare node (`"example.com"`, `"127.0.0.1"`), a
    /// `node:service` pair, or a bracketed IPv6 form `[::1]:service`.
    /// `family`, `socktype` and `protocol` narrow the results the way the
    /// corresponding `addrinfo` hints do; pass the platform's `AF_UNSPEC`
    /// and zeroes to accept anything.
    #[cfg(unix)]
    pub fn lookup(host: &str, family: i32, socktype: i32, protocol: i32) -> Result<Vec<Address>> {
        let (node, service) = split_host_service(host);
        let node = CString::new(node).map_err(|_| Error::Native(libc::EINVAL))?;
        let service = service
            .map(|s| CString::new(s).map_err(|_| Error::Native(libc::EINVAL)))
            .transpose()?;

        // SAFETY: zeroed addrinfo is a valid hints value.
        let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
        hints.ai_family = family;
        hints.ai_socktype = socktype;
        hints.ai_protocol = protocol;

        let mut results: *mut libc::addrinfo = ptr::null_mut();
        let rc = unsafe {
            libc::getaddrinfo(
                node.as_ptr(),
                service.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
                &hints,
                &mut results,
            )
        };
        if rc != 0 {
            error!("getaddrinfo({}, {}): {}", host, family, rc);
            return Err(Error::from_lookup_error(rc));
        }
        let mut addresses = Vec::new();
        let mut next = results;
        while !next.is_null() {
            let info = unsafe { &*next };
            addresses.push(unsafe {
                Address::from_raw_parts(
                    info.ai_addr,
                    info.ai_addrlen,
                    info.ai_socktype,
                    info.ai_protocol,
                )
            });
            next = info.ai_next;
        }
        unsafe { libc::freeaddrinfo(results) };
        debug!("lookup({}) -> {} addresses", host, addresses.len());
        Ok(addresses)
    }

    /// See the POSIX arm; this one drives WinSock's resolver.
    #[cfg(windows)]
    pub fn lookup(host: &str, family: i32, socktype: i32, protocol: i32) -> Result<Vec<Address>> {
        let (node, service) = split_host_service(host);
        let node = CString::new(node).map_err(|_| Error::Native(WSAEINVAL))?;
        let service = service
            .map(|s| CString::new(s).map_err(|_| Error::Native(WSAEINVAL)))
            .transpose()?;

        // SAFETY: zeroed ADDRINFOA is a valid hints value.
        let mut hints: ADDRINFOA = unsafe { mem::zeroed() };
        hints.ai_family = family;
        hints.ai_socktype = socktype;
        hints.ai_protocol = protocol;

        let mut results: *mut ADDRINFOA = ptr::null_mut();
        let rc = unsafe {
            getaddrinfo(
                node.as_ptr() as *const u8,
                service
                    .as_ref()
                    .map_or(ptr::null(), |s| s.as_ptr() as *const u8),
                &hints,
                &mut results,
            )
        };
        if rc != 0 {
            error!("getaddrinfo({}, {}): {}", host, family, rc);
            return Err(Error::from_lookup_error(rc));
        }
        let mut addresses = Vec::new();
        let mut next = results;
        while !next.is_null() {
            let info = unsafe { &*next };
            addresses.push(unsafe {
                Address::from_raw_parts(
                    info.ai_addr,
                    info.ai_addrlen as RawSockLen,
                    info.ai_socktype,
                    info.ai_protocol,
                )
            });
            next = info.ai_next;
        }
        unsafe { freeaddrinfo(results) };
        debug!("lookup({}) -> {} addresses", host, addresses.len());
        Ok(addresses)
    }

    /// One `(address, prefix length)` list per network interface.
    #[cfg(unix)]
    pub fn interface_addresses() -> Result<HashMap<String, Vec<(Address, u32)>>> {
        let mut ifaddrs: *mut libc::ifaddrs = ptr::null_mut();
        if unsafe { libc::getifaddrs(&mut ifaddrs) } != 0 {
            return Err(Error::last_os_error());
        }
        let mut result: HashMap<String, Vec<(Address, u32)>> = HashMap::new();
        let mut next = ifaddrs;
        while !next.is_null() {
            let ifa = unsafe { &*next };
            next = ifa.ifa_next;
            if ifa.ifa_addr.is_null() {
                continue;
            }
            let family = unsafe { (*ifa.ifa_addr).sa_family } as i32;
            let (len, prefix) = match family {
                libc::AF_INET => (
                    mem::size_of::<libc::sockaddr_in>() as RawSockLen,
                    netmask_prefix(ifa.ifa_netmask, 4),
                ),
                libc::AF_INET6 => (
                    mem::size_of::<libc::sockaddr_in6>() as RawSockLen,
                    netmask_prefix(ifa.ifa_netmask, 16),
                ),
                _ => continue,
            };
            let name = unsafe { CStr::from_ptr(ifa.ifa_name) }
                .to_string_lossy()
                .into_owned();
            let address = unsafe { Address::from_raw_parts(ifa.ifa_addr, len, 0, 0) };
            result.entry(name).or_default().push((address, prefix));
        }
        unsafe { libc::freeifaddrs(ifaddrs) };
        Ok(result)
    }

    /// One `(address, prefix length)` list per adapter, from
    /// `GetAdaptersAddresses`.
    #[cfg(windows)]
    pub fn interface_addresses() -> Result<HashMap<String, Vec<(Address, u32)>>> {
        let mut size = 16 * 1024u32;
        let mut buffer: Vec<u8>;
        loop {
            buffer = vec![0u8; size as usize];
            let rc = unsafe {
                GetAdaptersAddresses(
                    AF_UNSPEC as u32,
                    0,
                    ptr::null_mut(),
                    buffer.as_mut_ptr() as *mut IP_ADAPTER_ADDRESSES_LH,
                    &mut size,
                )
            };
            if rc == ERROR_BUFFER_OVERFLOW {
                continue;
            }
            if rc != 0 {
                return Err(Error::from_os_error(rc as i32));
            }
            break;
        }
        let mut result: HashMap<String, Vec<(Address, u32)>> = HashMap::new();
        let mut adapter = buffer.as_ptr() as *const IP_ADAPTER_ADDRESSES_LH;
        while !adapter.is_null() {
            let entry = unsafe { &*adapter };
            adapter = entry.Next;
            let name = unsafe { std::ffi::CStr::from_ptr(entry.AdapterName as *const i8) }
                .to_string_lossy()
                .into_owned();
            let mut unicast = entry.FirstUnicastAddress as *const IP_ADAPTER_UNICAST_ADDRESS_LH;
            while !unicast.is_null() {
                let ua = unsafe { &*unicast };
                unicast = ua.Next;
                if ua.Address.lpSockaddr.is_null() {
                    continue;
                }
                let address = unsafe {
                    Address::from_raw_parts(
                        ua.Address.lpSockaddr,
                        ua.Address.iSockaddrLength,
                        0,
                        0,
                    )
                };
                result
                    .entry(name.clone())
                    .or_default()
                    .push((address, u32::from(ua.OnLinkPrefixLength)));
            }
        }
        Ok(result)
    }

    /// Builds an `Address` from a raw sockaddr the kernel filled in.
    ///
    /// # Safety
    ///
    /// `addr` must point to a valid socket address of at least `len`
    /// bytes.
    pub(crate) unsafe fn from_raw_parts(
        addr: *const RawSockAddr,
        len: RawSockLen,
        socktype: i32,
        protocol: i32,
    ) -> Address {
        let family = unsafe { (*addr).sa_family } as i32;
        if family == FAMILY_INET {
            #[cfg(unix)]
            let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
            #[cfg(windows)]
            let mut sin: SOCKADDR_IN = unsafe { mem::zeroed() };
            unsafe {
                ptr::copy_nonoverlapping(
                    addr as *const u8,
                    &mut sin as *mut _ as *mut u8,
                    (len as usize).min(mem::size_of_val(&sin)),
                );
            }
            return Address::Ipv4(Ipv4Address {
                sin,
                socktype,
                protocol,
            });
        }
        if family == FAMILY_INET6 {
            #[cfg(unix)]
            let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
            #[cfg(windows)]
            let mut sin6: SOCKADDR_IN6 = unsafe { mem::zeroed() };
            unsafe {
                ptr::copy_nonoverlapping(
                    addr as *const u8,
                    &mut sin6 as *mut _ as *mut u8,
                    (len as usize).min(mem::size_of_val(&sin6)),
                );
            }
            return Address::Ipv6(Ipv6Address {
                sin6,
                socktype,
                protocol,
            });
        }
        #[cfg(unix)]
        if family == libc::AF_UNIX {
            let mut sun: libc::sockaddr_un = unsafe { mem::zeroed() };
            unsafe {
                ptr::copy_nonoverlapping(
                    addr as *const u8,
                    &mut sun as *mut _ as *mut u8,
                    (len as usize).min(mem::size_of::<libc::sockaddr_un>()),
                );
            }
            return Address::Unix(UnixAddress { sun, len });
        }
        #[cfg(unix)]
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        #[cfg(windows)]
        let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
        unsafe {
            ptr::copy_nonoverlapping(
                addr as *const u8,
                &mut storage as *mut _ as *mut u8,
                (len as usize).min(mem::size_of_val(&storage)),
            );
        }
        Address::Unknown(UnknownAddress { storage, len })
    }

    /// Address family (`AF_*`, in the platform's numbering).
    pub fn family(&self) -> i32 {
        match self {
            Address::Ipv4(_) => FAMILY_INET,
            Address::Ipv6(_) => FAMILY_INET6,
            #[cfg(unix)]
            Address::Unix(_) => libc::AF_UNIX,
            Address::Unknown(a) => a.storage.ss_family as i32,
        }
    }

    /// Socket type hint recorded by the resolver, when known.
    pub fn socktype(&self) -> i32 {
        match self {
            Address::Ipv4(a) => a.socktype,
            Address::Ipv6(a) => a.socktype,
            _ => 0,
        }
    }

    /// Protocol hint recorded by the resolver, when known.
    pub fn protocol(&self) -> i32 {
        match self {
            Address::Ipv4(a) => a.protocol,
            Address::Ipv6(a) => a.protocol,
            _ => 0,
        }
    }

    /// The port, for IP addresses.
    pub fn port(&self) -> Option<u16> {
        match self {
            Address::Ipv4(a) => Some(a.port()),
            Address::Ipv6(a) => Some(a.port()),
            _ => None,
        }
    }

    /// Sets the port of an IP address; no-op otherwise.
    pub fn set_port(&mut self, port: u16) {
        match self {
            Address::Ipv4(a) => a.set_port(port),
            Address::Ipv6(a) => a.set_port(port),
            _ => {}
        }
    }

    /// Raw pointer and length for handing to the socket ABI.
    pub(crate) fn as_raw(&self) -> (*const RawSockAddr, RawSockLen) {
        match self {
            Address::Ipv4(a) => (
                &a.sin as *const _ as *const RawSockAddr,
                mem::size_of_val(&a.sin) as RawSockLen,
            ),
            Address::Ipv6(a) => (
                &a.sin6 as *const _ as *const RawSockAddr,
                mem::size_of_val(&a.sin6) as RawSockLen,
            ),
            #[cfg(unix)]
            Address::Unix(a) => (&a.sun as *const _ as *const RawSockAddr, a.len),
            Address::Unknown(a) => (&a.storage as *const _ as *const RawSockAddr, a.len),
        }
    }

    fn raw_bytes(&self) -> &[u8] {
        let (ptr, len) = self.as_raw();
        unsafe { std::slice::from_raw_parts(ptr as *const u8, len as usize) }
    }

    /// Adapter that prints the address without its port.
    pub fn without_port(&self) -> impl fmt::Display + '_ {
        WithoutPort(self)
    }

    /// A synchronous socket suited to this address, using the resolver's
    /// type and protocol hints (stream/0 when unknown).
    pub fn create_socket(&self) -> Result<crate::net::Socket> {
        crate::net::Socket::new(self.family(), self.default_socktype(), self.protocol())
    }

    /// Like [`create_socket`](Address::create_socket), attached to an I/O
    /// manager.
    pub fn create_socket_with(&self, io: &crate::IoManager) -> Result<crate::net::Socket> {
        crate::net::Socket::with_io_manager(
            io,
            self.family(),
            self.default_socktype(),
            self.protocol(),
        )
    }

    fn default_socktype(&self) -> i32 {
        match self.socktype() {
            #[cfg(unix)]
            0 => libc::SOCK_STREAM,
            #[cfg(windows)]
            0 => SOCK_STREAM,
            socktype => socktype,
        }
    }
}

impl Ipv4Address {
    /// An address from host-order octets and port.
    pub fn new(addr: Ipv4Addr, port: u16) -> Ipv4Address {
        #[cfg(unix)]
        let sin = {
            let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = port.to_be();
            sin.sin_addr.s_addr = u32::from(addr).to_be();
            sin
        };
        #[cfg(windows)]
        let sin = {
            let mut sin: SOCKADDR_IN = unsafe { mem::zeroed() };
            sin.sin_family = AF_INET;
            sin.sin_port = port.to_be();
            sin.sin_addr.S_un.S_addr = u32::from(addr).to_be();
            sin
        };
        Ipv4Address {
            sin,
            socktype: 0,
            protocol: 0,
        }
    }

    /// The unspecified address (`0.0.0.0:0`).
    pub fn any() -> Ipv4Address {
        Ipv4Address::new(Ipv4Addr::UNSPECIFIED, 0)
    }

    pub fn addr(&self) -> Ipv4Addr {
        #[cfg(unix)]
        let raw = self.sin.sin_addr.s_addr;
        #[cfg(windows)]
        let raw = unsafe { self.sin.sin_addr.S_un.S_addr };
        Ipv4Addr::from(u32::from_be(raw))
    }

    pub fn port(&self) -> u16 {
        u16::from_be(self.sin.sin_port)
    }

    pub fn set_port(&mut self, port: u16) {
        self.sin.sin_port = port.to_be();
    }

    /// The directed broadcast address of this address's network.
    pub fn broadcast_address(&self, prefix_length: u32) -> Ipv4Address {
        assert!(prefix_length <= 32);
        let mask = u32::from(Ipv4Address::subnet_mask(prefix_length).addr());
        Ipv4Address::new(Ipv4Addr::from(u32::from(self.addr()) | !mask), self.port())
    }

    /// The network address under the given prefix.
    pub fn network_address(&self, prefix_length: u32) -> Ipv4Address {
        assert!(prefix_length <= 32);
        let mask = u32::from(Ipv4Address::subnet_mask(prefix_length).addr());
        Ipv4Address::new(Ipv4Addr::from(u32::from(self.addr()) & mask), self.port())
    }

    /// The netmask with `prefix_length` leading ones.
    pub fn subnet_mask(prefix_length: u32) -> Ipv4Address {
        assert!(prefix_length <= 32);
        let mask = if prefix_length == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_length)
        };
        Ipv4Address::new(Ipv4Addr::from(mask), 0)
    }
}

impl Ipv6Address {
    pub fn new(addr: Ipv6Addr, port: u16) -> Ipv6Address {
        #[cfg(unix)]
        let sin6 = {
            let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = port.to_be();
            sin6.sin6_addr.s6_addr = addr.octets();
            sin6
        };
        #[cfg(windows)]
        let sin6 = {
            let mut sin6: SOCKADDR_IN6 = unsafe { mem::zeroed() };
            sin6.sin6_family = AF_INET6;
            sin6.sin6_port = port.to_be();
            sin6.sin6_addr.u.Byte = addr.octets();
            sin6
        };
        Ipv6Address {
            sin6,
            socktype: 0,
            protocol: 0,
        }
    }

    /// The unspecified address (`[::]:0`).
    pub fn any() -> Ipv6Address {
        Ipv6Address::new(Ipv6Addr::UNSPECIFIED, 0)
    }

    pub fn addr(&self) -> Ipv6Addr {
        #[cfg(unix)]
        let octets = self.sin6.sin6_addr.s6_addr;
        #[cfg(windows)]
        let octets = unsafe { self.sin6.sin6_addr.u.Byte };
        Ipv6Addr::from(octets)
    }

    pub fn port(&self) -> u16 {
        u16::from_be(self.sin6.sin6_port)
    }

    pub fn set_port(&mut self, port: u16) {
        self.sin6.sin6_port = port.to_be();
    }

    pub fn broadcast_address(&self, prefix_length: u32) -> Ipv6Address {
        assert!(prefix_length <= 128);
        let mut octets = self.addr().octets();
        apply_mask(&mut octets, prefix_length, |byte, mask| byte | !mask);
        Ipv6Address::new(Ipv6Addr::from(octets), self.port())
    }

    pub fn network_address(&self, prefix_length: u32) -> Ipv6Address {
        assert!(prefix_length <= 128);
        let mut octets = self.addr().octets();
        apply_mask(&mut octets, prefix_length, |byte, mask| byte & mask);
        Ipv6Address::new(Ipv6Addr::from(octets), self.port())
    }

    pub fn subnet_mask(prefix_length: u32) -> Ipv6Address {
        assert!(prefix_length <= 128);
        let mut octets = [0u8; 16];
        apply_mask(&mut octets, prefix_length, |_, mask| mask);
        Ipv6Address::new(Ipv6Addr::from(octets), 0)
    }
}

fn apply_mask(octets: &mut [u8], prefix_length: u32, f: impl Fn(u8, u8) -> u8) {
    for (index, byte) in octets.iter_mut().enumerate() {
        let remaining = prefix_length as isize - (index as isize * 8);
        let mask = if remaining >= 8 {
            0xff
        } else if remaining <= 0 {
            0x00
        } else {
            0xffu8 << (8 - remaining)
        };
        *byte = f(*byte, mask);
    }
}

#[cfg(unix)]
impl UnixAddress {
    /// A pathname address. Fails if the path does not fit the platform's
    /// `sun_path`.
    pub fn new(path: impl AsRef<Path>) -> Result<UnixAddress> {
        use std::os::unix::ffi::OsStrExt;
        let bytes = path.as_ref().as_os_str().as_bytes();
        let mut sun: libc::sockaddr_un = unsafe { mem::zeroed() };
        if bytes.len() >= sun.sun_path.len() {
            return Err(Error::Native(libc::ENAMETOOLONG));
        }
        sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        let len = path_offset(&sun) + bytes.len() + 1;
        Ok(UnixAddress {
            sun,
            len: len as RawSockLen,
        })
    }

    /// An abstract-namespace address (Linux): not bound to the
    /// filesystem, distinguished by a leading NUL in `sun_path`.
    #[cfg(any(target_os = "android", target_os = "linux"))]
    pub fn new_abstract(name: &[u8]) -> Result<UnixAddress> {
        let mut sun: libc::sockaddr_un = unsafe { mem::zeroed() };
        if name.len() + 1 > sun.sun_path.len() {
            return Err(Error::Native(libc::ENAMETOOLONG));
        }
        sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (dst, src) in sun.sun_path[1..].iter_mut().zip(name) {
            *dst = *src as libc::c_char;
        }
        let len = path_offset(&sun) + 1 + name.len();
        Ok(UnixAddress {
            sun,
            len: len as RawSockLen,
        })
    }

    fn path_bytes(&self) -> &[u8] {
        let path_len = (self.len as usize).saturating_sub(path_offset(&self.sun));
        // SAFETY: sun_path is a plain byte array within our own struct.
        let bytes = unsafe {
            std::slice::from_raw_parts(self.sun.sun_path.as_ptr() as *const u8, path_len)
        };
        let is_abstract = bytes.first() == Some(&0);
        // A trailing NUL on pathname addresses is not part of the path.
        match bytes.split_last() {
            Some((&0, rest)) if !is_abstract => rest,
            _ => bytes,
        }
    }
}

#[cfg(unix)]
fn path_offset(sun: &libc::sockaddr_un) -> usize {
    let base = sun as *const _ as usize;
    let path = &sun.sun_path as *const _ as usize;
    path - base
}

#[cfg(unix)]
fn netmask_prefix(netmask: *const libc::sockaddr, len: usize) -> u32 {
    if netmask.is_null() {
        return 0;
    }
    let family = unsafe { (*netmask).sa_family } as i32;
    match family {
        libc::AF_INET => {
            let sin = netmask as *const libc::sockaddr_in;
            u32::from_be(unsafe { (*sin).sin_addr.s_addr }).count_ones()
        }
        libc::AF_INET6 => {
            let sin6 = netmask as *const libc::sockaddr_in6;
            unsafe { (*sin6).sin6_addr.s6_addr }
                .iter()
                .take(len)
                .map(|b| b.count_ones())
                .sum()
        }
        _ => 0,
    }
}

fn split_host_service(host: &str) -> (&str, Option<&str>) {
    // Bracketed IPv6, with optional :service.
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let node = &rest[..end];
            let tail = &rest[end + 1..];
            let service = tail.strip_prefix(':');
            return (node, service);
        }
    }
    // node:service, but more than one colon means a bare IPv6 literal.
    if let Some(colon) = host.find(':') {
        if !host[colon + 1..].contains(':') {
            return (&host[..colon], Some(&host[colon + 1..]));
        }
    }
    (host, None)
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Address {
        match addr {
            SocketAddr::V4(v4) => Address::Ipv4(Ipv4Address::new(*v4.ip(), v4.port())),
            SocketAddr::V6(v6) => Address::Ipv6(Ipv6Address::new(*v6.ip(), v6.port())),
        }
    }
}

impl From<Ipv4Address> for Address {
    fn from(addr: Ipv4Address) -> Address {
        Address::Ipv4(addr)
    }
}

impl From<Ipv6Address> for Address {
    fn from(addr: Ipv6Address) -> Address {
        Address::Ipv6(addr)
    }
}

#[cfg(unix)]
impl From<UnixAddress> for Address {
    fn from(addr: UnixAddress) -> Address {
        Address::Unix(addr)
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Address) -> bool {
        self.family() == other.family() && self.raw_bytes() == other.raw_bytes()
    }
}

impl Eq for Address {}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Address) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Address) -> std::cmp::Ordering {
        (self.family(), self.raw_bytes()).cmp(&(other.family(), other.raw_bytes()))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        display_address(self, f, true)
    }
}

struct WithoutPort<'a>(&'a Address);

impl fmt::Display for WithoutPort<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        display_address(self.0, f, false)
    }
}

fn display_address(addr: &Address, f: &mut fmt::Formatter<'_>, with_port: bool) -> fmt::Result {
    match addr {
        Address::Ipv4(a) => {
            if with_port {
                write!(f, "{}:{}", a.addr(), a.port())
            } else {
                write!(f, "{}", a.addr())
            }
        }
        Address::Ipv6(a) => {
            if with_port {
                write!(f, "[{}]:{}", a.addr(), a.port())
            } else {
                write!(f, "{}", a.addr())
            }
        }
        #[cfg(unix)]
        Address::Unix(a) => {
            let bytes = a.path_bytes();
            if bytes.is_empty() {
                write!(f, "<anonymous>")
            } else if bytes[0] == 0 {
                write!(f, "@{}", String::from_utf8_lossy(&bytes[1..]))
            } else {
                write!(f, "{}", String::from_utf8_lossy(bytes))
            }
        }
        Address::Unknown(a) => write!(f, "(unknown address family {})", a.storage.ss_family),
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl fmt::Debug for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ipv4Address({}:{})", self.addr(), self.port())
    }
}

impl fmt::Debug for Ipv6Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ipv6Address([{}]:{})", self.addr(), self.port())
    }
}

#[cfg(unix)]
impl fmt::Debug for UnixAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UnixAddress({})",
            String::from_utf8_lossy(self.path_bytes())
        )
    }
}

impl fmt::Debug for UnknownAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnknownAddress(family {})", self.storage.ss_family)
    }
}
