use std::io;

use thiserror::Error as ThisError;

/// Specialized result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed errors for the runtime and the socket layer.
///
/// Every kernel failure is mapped onto one of these categories; codes with
/// no dedicated category are carried verbatim in [`Error::Native`].
/// Would-block conditions are never surfaced: with an I/O manager attached
/// they are converted into fiber suspensions instead.
#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum Error {
    #[error("operation aborted")]
    OperationAborted,
    #[error("operation timed out")]
    TimedOut,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("bad handle")]
    BadHandle,
    #[error("file not found")]
    FileNotFound,
    #[error("address in use")]
    AddressInUse,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("host is down")]
    HostDown,
    #[error("no route to host")]
    HostUnreachable,
    #[error("network is down")]
    NetworkDown,
    #[error("network dropped connection on reset")]
    NetworkReset,
    #[error("network is unreachable")]
    NetworkUnreachable,
    #[error(transparent)]
    NameLookup(#[from] LookupError),
    #[error("os error {0}")]
    Native(i32),
}

/// Failures reported by the platform name resolver.
#[derive(Debug, ThisError)]
pub enum LookupError {
    #[error("temporary failure in name resolution (gai error {0})")]
    Temporary(i32),
    #[error("permanent failure in name resolution (gai error {0})")]
    Permanent(i32),
    #[error("no address associated with hostname (gai error {0})")]
    NoData(i32),
    #[error("host not found (gai error {0})")]
    NotFound(i32),
    #[error("name resolution failed (gai error {0})")]
    Generic(i32),
}

impl Error {
    /// Maps a raw `errno` value onto the taxonomy.
    #[cfg(unix)]
    pub fn from_os_error(code: i32) -> Error {
        match code {
            libc::EBADF | libc::ENOTSOCK => Error::BadHandle,
            libc::ENOENT => Error::FileNotFound,
            libc::ECANCELED => Error::OperationAborted,
            libc::EPIPE => Error::BrokenPipe,
            libc::EADDRINUSE => Error::AddressInUse,
            libc::ECONNABORTED => Error::ConnectionAborted,
            libc::ECONNRESET => Error::ConnectionReset,
            libc::ECONNREFUSED => Error::ConnectionRefused,
            libc::EHOSTDOWN => Error::HostDown,
            libc::EHOSTUNREACH => Error::HostUnreachable,
            libc::ENETDOWN => Error::NetworkDown,
            libc::ENETRESET => Error::NetworkReset,
            libc::ENETUNREACH => Error::NetworkUnreachable,
            libc::ETIMEDOUT => Error::TimedOut,
            code => Error::Native(code),
        }
    }

    /// Maps a raw Windows error code onto the taxonomy.
    #[cfg(windows)]
    pub fn from_os_error(code: i32) -> Error {
        use windows_sys::Win32::Foundation::{
            ERROR_FILE_NOT_FOUND, ERROR_INVALID_HANDLE, ERROR_OPERATION_ABORTED,
        };
        use windows_sys::Win32::Networking::WinSock::{
            WSAEADDRINUSE, WSAECONNABORTED, WSAECONNREFUSED, WSAECONNRESET, WSAEHOSTDOWN,
            WSAEHOSTUNREACH, WSAENETDOWN, WSAENETRESET, WSAENETUNREACH, WSAENOTSOCK, WSAESHUTDOWN,
            WSAETIMEDOUT,
        };

        match code as u32 {
            ERROR_INVALID_HANDLE => Error::BadHandle,
            ERROR_FILE_NOT_FOUND => Error::FileNotFound,
            ERROR_OPERATION_ABORTED => Error::OperationAborted,
            _ => match code {
                WSAENOTSOCK => Error::BadHandle,
                WSAESHUTDOWN => Error::BrokenPipe,
                WSAEADDRINUSE => Error::AddressInUse,
                WSAECONNABORTED => Error::ConnectionAborted,
                WSAECONNRESET => Error::ConnectionReset,
                WSAECONNREFUSED => Error::ConnectionRefused,
                WSAEHOSTDOWN => Error::HostDown,
                WSAEHOSTUNREACH => Error::HostUnreachable,
                WSAENETDOWN => Error::NetworkDown,
                WSAENETRESET => Error::NetworkReset,
                WSAENETUNREACH => Error::NetworkUnreachable,
                WSAETIMEDOUT => Error::TimedOut,
                code => Error::Native(code),
            },
        }
    }

    /// Maps the thread's last OS error onto the taxonomy.
    pub fn last_os_error() -> Error {
        Error::from_os_error(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// Maps a `getaddrinfo` return code onto the lookup taxonomy.
    #[cfg(unix)]
    pub(crate) fn from_lookup_error(code: i32) -> Error {
        let err = match code {
            libc::EAI_AGAIN => LookupError::Temporary(code),
            libc::EAI_FAIL => LookupError::Permanent(code),
            libc::EAI_NODATA => LookupError::NoData(code),
            libc::EAI_NONAME => LookupError::NotFound(code),
            code => LookupError::Generic(code),
        };
        Error::NameLookup(err)
    }

    /// Maps a WinSock `getaddrinfo` return code onto the lookup taxonomy.
    #[cfg(windows)]
    pub(crate) fn from_lookup_error(code: i32) -> Error {
        use windows_sys::Win32::Networking::WinSock::{
            WSAHOST_NOT_FOUND, WSANO_DATA, WSANO_RECOVERY, WSATRY_AGAIN,
        };

        let err = match code {
            WSATRY_AGAIN => LookupError::Temporary(code),
            WSANO_RECOVERY => LookupError::Permanent(code),
            WSANO_DATA => LookupError::NoData(code),
            WSAHOST_NOT_FOUND => LookupError::NotFound(code),
            code => LookupError::Generic(code),
        };
        Error::NameLookup(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(code) => Error::from_os_error(code),
            None => Error::Native(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn errno_mapping() {
        assert!(matches!(
            Error::from_os_error(libc::ECANCELED),
            Error::OperationAborted
        ));
        assert!(matches!(
            Error::from_os_error(libc::ETIMEDOUT),
            Error::TimedOut
        ));
        assert!(matches!(
            Error::from_os_error(libc::ECONNRESET),
            Error::ConnectionReset
        ));
        assert!(matches!(Error::from_os_error(7777), Error::Native(7777)));
    }

    #[test]
    #[cfg(unix)]
    fn lookup_mapping() {
        assert!(matches!(
            Error::from_lookup_error(libc::EAI_NONAME),
            Error::NameLookup(LookupError::NotFound(_))
        ));
        assert!(matches!(
            Error::from_lookup_error(libc::EAI_AGAIN),
            Error::NameLookup(LookupError::Temporary(_))
        ));
    }
}
