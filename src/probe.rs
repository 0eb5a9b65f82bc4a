//! External Probe Channel.
//!
//! An instrumentation agent outside this process (a SystemTap script in the
//! usual setup) keeps the name of the function the target is executing in a
//! 512-byte POSIX shared memory record. We map it read-only and copy it out
//! on every sample. The writer takes no lock, so a copy can be torn; callers
//! only ever compare it against the sentinel.

use std::ffi::CString;
use std::io::Error;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};

use anyhow::{bail, Context, Result};

/// Size of the record shared with the probe.
pub const PROBE_RECORD_SIZE: usize = 512;

/// Value the probe publishes until the target reaches instrumented code.
pub const SENTINEL_TAG: &str = "-1,systemtap_setup";

pub const DEFAULT_PROBE_SHM: &str = "/benchprof_probe";

/// One copy of the shared record.
#[derive(Clone, Copy)]
pub struct ProbeRecord {
    bytes: [u8; PROBE_RECORD_SIZE],
}

impl ProbeRecord {
    pub fn from_bytes(bytes: [u8; PROBE_RECORD_SIZE]) -> Self {
        ProbeRecord { bytes }
    }

    /// A record holding `tag`, truncated to fit with its terminating NUL.
    pub fn from_tag(tag: &str) -> Self {
        let mut bytes = [0u8; PROBE_RECORD_SIZE];
        let len = tag.len().min(PROBE_RECORD_SIZE - 1);
        bytes[..len].copy_from_slice(&tag.as_bytes()[..len]);
        ProbeRecord { bytes }
    }

    /// The text up to the first NUL, cut at the first invalid UTF-8 byte.
    pub fn tag(&self) -> &str {
        let end = self
            .bytes
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(PROBE_RECORD_SIZE);
        let raw = &self.bytes[..end];
        match std::str::from_utf8(raw) {
            Ok(s) => s.trim_end(),
            // valid_up_to() guarantees the prefix is UTF-8
            Err(e) => std::str::from_utf8(&raw[..e.valid_up_to()]).unwrap_or(""),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.tag() == SENTINEL_TAG
    }

    /// The function part of a `"<pid>,<function>"` tag.
    pub fn function(&self) -> &str {
        let tag = self.tag();
        match tag.split_once(',') {
            Some((_, function)) => function,
            None => tag,
        }
    }
}

impl std::fmt::Debug for ProbeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeRecord").field("tag", &self.tag()).finish()
    }
}

/// Where the sampler gets probe records from.
///
/// `read` runs in the timer signal handler: no allocation, no locks.
pub trait ProbeSource {
    fn read(&self) -> ProbeRecord;
}

/// Read-only mapping of the probe's shared memory record.
#[derive(Debug)]
pub struct ProbeChannel {
    name: String,
    map: Option<NonNull<u8>>,
    fd: Option<OwnedFd>,
}

impl ProbeChannel {
    /// Map the record named `name` (e.g. `/benchprof_probe`).
    ///
    /// The probe must already have created it.
    pub fn open(name: &str) -> Result<Self> {
        let c_name =
            CString::new(name).with_context(|| format!("Probe channel name {:?} contains NUL", name))?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC, 0) };
        if fd < 0 {
            bail!(
                "Failed to open probe channel {}: {}. Is the probe running?",
                name,
                Error::last_os_error()
            );
        }
        // SAFETY: shm_open just returned this descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut st: libc::stat = unsafe { mem::zeroed() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut st) } != 0 {
            bail!(
                "Failed to stat probe channel {}: {}",
                name,
                Error::last_os_error()
            );
        }
        if (st.st_size as usize) < PROBE_RECORD_SIZE {
            bail!(
                "Probe channel {} is {} bytes, expected {}",
                name,
                st.st_size,
                PROBE_RECORD_SIZE
            );
        }

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                PROBE_RECORD_SIZE,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            bail!(
                "Failed to map probe channel {}: {}",
                name,
                Error::last_os_error()
            );
        }

        tracing::debug!("Mapped probe channel {}", name);
        Ok(ProbeChannel {
            name: name.to_string(),
            map: NonNull::new(addr as *mut u8),
            fd: Some(fd),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.map.is_some()
    }

    /// Unmap the record and close the descriptor. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(map) = self.map.take() {
            unsafe {
                libc::munmap(map.as_ptr() as *mut libc::c_void, PROBE_RECORD_SIZE);
            }
        }
        self.fd = None;
    }
}

impl ProbeSource for ProbeChannel {
    /// Copy the record. A closed channel reads as the sentinel.
    fn read(&self) -> ProbeRecord {
        match self.map {
            Some(map) => {
                // SAFETY: the mapping is PROBE_RECORD_SIZE bytes and stays
                // mapped until close(), which needs &mut self.
                let bytes = unsafe {
                    ptr::read_volatile(map.as_ptr() as *const [u8; PROBE_RECORD_SIZE])
                };
                ProbeRecord::from_bytes(bytes)
            }
            None => ProbeRecord::from_tag(SENTINEL_TAG),
        }
    }
}

impl Drop for ProbeChannel {
    fn drop(&mut self) {
        self.close();
    }
}
