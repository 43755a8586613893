//! Windows backend: paging-file backed file mappings and kernel event objects

use crate::config::Scope;
use std::io;
use std::time::Duration;
use windows::Win32::Foundation::{
    CloseHandle, ERROR_ALREADY_EXISTS, GetLastError, HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0,
    WAIT_TIMEOUT,
};
use windows::Win32::System::Memory::{
    CreateFileMappingW, FILE_MAP_ALL_ACCESS, MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile,
    PAGE_READWRITE, UnmapViewOfFile,
};
use windows::Win32::System::Threading::{CreateEventW, ResetEvent, SetEvent, WaitForSingleObject};
use windows::core::PCWSTR;

fn wide(name: &str) -> Vec<u16> {
    name.encode_utf16().chain(std::iter::once(0)).collect()
}

/// `Local\` objects live in the caller's session namespace
pub(crate) fn object_name(base: &str, scope: Scope) -> String {
    match scope {
        Scope::Session => format!("Local\\{base}"),
        Scope::Global => format!("Global\\{base}"),
    }
}

/// The kernel destroys named objects with their last handle
pub(crate) fn release_name(_name: &str) {}

/// A mapped view of a named file mapping
pub(crate) struct Mapping {
    handle: HANDLE,
    view: MEMORY_MAPPED_VIEW_ADDRESS,
}

// SAFETY: the mapping handle is a process-wide kernel object and the view stays
// valid until drop; all access to the view goes through atomics.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Create the mapping if absent, otherwise attach to it.
    /// Returns `true` alongside the mapping when this call created it.
    pub(crate) fn open_or_create(name: &str, len: usize) -> io::Result<(Self, bool)> {
        let name_wide = wide(name);

        unsafe {
            let handle = CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                0,
                len as u32,
                PCWSTR(name_wide.as_ptr()),
            );

            // Must be read before any other API call overwrites it
            let already_exists = GetLastError() == ERROR_ALREADY_EXISTS;

            let handle = handle.map_err(io::Error::other)?;

            let view = MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, len);
            if view.Value.is_null() {
                let err = io::Error::last_os_error();
                let _ = CloseHandle(handle);
                return Err(err);
            }

            Ok((Self { handle, view }, !already_exists))
        }
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.view.Value as *mut u8
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = UnmapViewOfFile(self.view);
            let _ = CloseHandle(self.handle);
        }
    }
}

/// A named manual-reset event
pub(crate) struct Event(HANDLE);

// SAFETY: event handles may be waited on and signalled from any thread.
unsafe impl Send for Event {}
unsafe impl Sync for Event {}

impl Event {
    pub(crate) fn open_or_create(name: &str) -> io::Result<Self> {
        let name_wide = wide(name);
        // Manual reset: an auto-reset event would release a single waiter
        // across all processes sharing the name.
        let handle = unsafe { CreateEventW(None, true, false, PCWSTR(name_wide.as_ptr())) }
            .map_err(io::Error::other)?;
        Ok(Self(handle))
    }

    pub(crate) fn set(&self) -> io::Result<()> {
        unsafe { SetEvent(self.0) }.map_err(io::Error::other)
    }

    pub(crate) fn reset(&self) -> io::Result<()> {
        unsafe { ResetEvent(self.0) }.map_err(io::Error::other)
    }

    /// Block until the event is signalled (`true`) or the timeout expires (`false`)
    pub(crate) fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let millis = timeout.as_millis().min(u128::from(u32::MAX - 1)) as u32;
        let result = unsafe { WaitForSingleObject(self.0, millis) };
        if result == WAIT_OBJECT_0 {
            Ok(true)
        } else if result == WAIT_TIMEOUT {
            Ok(false)
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}
