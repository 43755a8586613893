//! Unix backend: POSIX shared memory segments
//!
//! POSIX has no named event object, so the event lives in its own small segment:
//!
//! ```text
//! ┌──────────────────┐
//! │ signaled: u32    │  <- 1 while set, cleared by reset()
//! │ generation: u32  │  <- bumped by every set(), futex word on Linux
//! │ magic: u32       │  <- EVENT_MAGIC
//! │ attached: u32    │  <- live handles; the last one marks it released
//! │                  │     and unlinks the name
//! └──────────────────┘
//! ```

use crate::config::Scope;
use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Magic value identifying an event segment
const EVENT_MAGIC: u32 = 0x4556_4E54; // "EVNT"

/// Attempts to open a segment that keeps disappearing between create and open
const OPEN_ATTEMPTS: usize = 8;

const SEGMENT_MODE: u32 = 0o600;

/// Segment names must start with a single `/` and contain no other slash
pub(crate) fn object_name(base: &str, scope: Scope) -> String {
    let sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match scope {
        Scope::Session => format!("/{}.{}", sanitized, unsafe { libc::getuid() }),
        Scope::Global => format!("/{sanitized}"),
    }
}

/// Remove a segment name; existing mappings stay valid
pub(crate) fn release_name(name: &str) {
    if let Ok(cname) = CString::new(name) {
        unsafe {
            libc::shm_unlink(cname.as_ptr());
        }
    }
}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "object name contains an interior NUL byte",
        )
    })
}

#[cfg(not(target_vendor = "apple"))]
unsafe fn shm_open(name: &CStr, flags: libc::c_int) -> libc::c_int {
    unsafe { libc::shm_open(name.as_ptr(), flags, SEGMENT_MODE as libc::mode_t) }
}

#[cfg(target_vendor = "apple")]
unsafe fn shm_open(name: &CStr, flags: libc::c_int) -> libc::c_int {
    unsafe { libc::shm_open(name.as_ptr(), flags, SEGMENT_MODE as libc::c_uint) }
}

/// Open the segment exclusively, falling back to attaching to an existing one
fn open_fd(name: &CStr) -> io::Result<(OwnedFd, bool)> {
    for _ in 0..OPEN_ATTEMPTS {
        let fd = unsafe { shm_open(name, libc::O_RDWR | libc::O_CREAT | libc::O_EXCL) };
        if fd >= 0 {
            return Ok((unsafe { OwnedFd::from_raw_fd(fd) }, true));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err);
        }

        let fd = unsafe { shm_open(name, libc::O_RDWR) };
        if fd >= 0 {
            return Ok((unsafe { OwnedFd::from_raw_fd(fd) }, false));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOENT) {
            return Err(err);
        }
        // Unlinked by its last user between our two calls; try again
    }
    Err(io::Error::new(
        io::ErrorKind::WouldBlock,
        "shared memory segment kept disappearing while opening",
    ))
}

/// A mapped view of a named shared memory segment
pub(crate) struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is MAP_SHARED memory valid until drop; all access to it
// goes through atomics.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Create the segment if absent, otherwise attach to it.
    /// Returns `true` alongside the mapping when this call created it.
    pub(crate) fn open_or_create(name: &str, len: usize) -> io::Result<(Self, bool)> {
        let cname = c_name(name)?;
        let (fd, created) = open_fd(&cname)?;

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let size = stat.st_size as usize;
        if size == 0 {
            // Creator and early attachers may both size the segment; fresh
            // pages are zero-filled either way.
            if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
                return Err(io::Error::last_os_error());
            }
        } else if size != len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("segment has size {size}, expected {len}"),
            ));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
        Ok((Self { ptr, len }, created))
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

#[repr(C)]
struct EventBlock {
    signaled: AtomicU32,
    generation: AtomicU32,
    magic: AtomicU32,
    attached: AtomicU32,
}

/// A named manual-reset event emulated in shared memory
pub(crate) struct Event {
    mapping: Mapping,
    name: String,
}

impl Event {
    pub(crate) fn open_or_create(name: &str) -> io::Result<Self> {
        let (mapping, created) = Self::attach(name)?;
        // Counted from here on, so drop on the error path balances it
        let event = Self {
            mapping,
            name: name.to_string(),
        };

        let block = event.block();
        if created {
            block.magic.store(EVENT_MAGIC, Ordering::Release);
        } else {
            let found = block.magic.load(Ordering::Acquire);
            // Zero means the creator has not stamped it yet
            if found != 0 && found != EVENT_MAGIC {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("segment is not an event (magic {found:#010x})"),
                ));
            }
        }
        Ok(event)
    }

    /// Map the segment and count this handle, skipping one being released
    fn attach(name: &str) -> io::Result<(Mapping, bool)> {
        for _ in 0..super::ATTACH_ATTEMPTS {
            let (mapping, created) = Mapping::open_or_create(name, size_of::<EventBlock>())?;
            if super::try_attach(&Self::block_of(&mapping).attached) {
                return Ok((mapping, created));
            }
            drop(mapping);
            std::thread::sleep(super::ATTACH_RETRY_DELAY);
        }
        Err(io::Error::new(
            io::ErrorKind::WouldBlock,
            "event segment stayed in release while attaching",
        ))
    }

    fn block_of(mapping: &Mapping) -> &EventBlock {
        unsafe { &*(mapping.as_ptr() as *const EventBlock) }
    }

    fn block(&self) -> &EventBlock {
        Self::block_of(&self.mapping)
    }

    pub(crate) fn set(&self) -> io::Result<()> {
        let block = self.block();
        block.signaled.store(1, Ordering::SeqCst);
        block.generation.fetch_add(1, Ordering::SeqCst);
        futex::wake_all(&block.generation);
        Ok(())
    }

    pub(crate) fn reset(&self) -> io::Result<()> {
        self.block().signaled.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Block until the event is signalled (`true`) or the timeout expires (`false`)
    pub(crate) fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let block = self.block();
        let deadline = Instant::now() + timeout;
        loop {
            // Generation first: a set() landing after the signaled check
            // changes it and makes the futex wait return immediately.
            let generation = block.generation.load(Ordering::SeqCst);
            if block.signaled.load(Ordering::SeqCst) != 0 {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            futex::wait(&block.generation, generation, deadline - now)?;
        }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if super::detach(&self.block().attached) {
            release_name(&self.name);
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod futex {
    use std::io;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Sleep while `word == expected`, at most `timeout`.
    /// Spurious returns are fine; the caller re-checks its condition.
    pub(super) fn wait(word: &AtomicU32, expected: u32, timeout: Duration) -> io::Result<()> {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        // No FUTEX_PRIVATE_FLAG: the word is shared between processes
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT,
                expected,
                &ts as *const libc::timespec,
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) | Some(libc::ETIMEDOUT) => Ok(()),
            _ => Err(err),
        }
    }

    pub(super) fn wake_all(word: &AtomicU32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAKE,
                i32::MAX,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod futex {
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const SLICE: Duration = Duration::from_millis(1);

    /// No process-shared wait primitive on these targets, so waiters poll the
    /// generation word in 1ms slices; wake-ups are delayed by up to one slice
    pub(super) fn wait(word: &AtomicU32, expected: u32, timeout: Duration) -> io::Result<()> {
        if word.load(Ordering::SeqCst) == expected {
            std::thread::sleep(timeout.min(SLICE));
        }
        Ok(())
    }

    pub(super) fn wake_all(_word: &AtomicU32) {}
}
