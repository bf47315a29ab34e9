#![cfg(windows)]

//! Windows-specific FFI the completion-model I/O manager builds on.

/// Documented limit of `WaitForMultipleObjects`.
pub(crate) const MAXIMUM_WAIT_OBJECTS: usize = 64;

#[link(name = "ntdll")]
extern "system" {
    /// Translates the NTSTATUS a completion left in `OVERLAPPED.Internal`
    /// into a DOS error code.
    pub(crate) fn RtlNtStatusToDosError(status: i32) -> u32;
}
