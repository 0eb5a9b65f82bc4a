use std::io::Error;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use bitfield::bitfield;
use nix::errno::Errno;
use nix::ioctl_none;

bitfield! {
    #[allow(non_camel_case_types)]
    pub struct perf_event_attr_flags(u64);
    impl Debug;
    pub disabled, set_disabled: 0, 0;
    pub inherit, set_inherit: 1, 1;
    pub pinned, set_pinned: 2, 2;
    pub exclusive, set_exclusive: 3, 3;
    pub exclude_user, set_exclude_user: 4, 4;
    pub exclude_kernel, set_exclude_kernel: 5, 5;
    pub exclude_hv, set_exclude_hv: 6, 6;
    pub exclude_idle, set_exclude_idle: 7, 7;
    pub enable_on_exec, set_enable_on_exec: 12, 12;
    pub __reserved, _: 38, 63;
}

/// `struct perf_event_attr` as of PERF_ATTR_SIZE_VER6.
///
/// The sampling and breakpoint unions are flattened to their `u64` storage,
/// counting mode never touches them.
#[repr(C)]
#[allow(non_camel_case_types)]
pub struct perf_event_attr {
    pub _type: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: perf_event_attr_flags,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
}

impl perf_event_attr {
    /// A zeroed attr for a user-space-only counting event that starts disabled.
    pub fn counting(event_type: u32, config: u64) -> Self {
        // SAFETY: every field is a plain integer, all-zero is the kernel default.
        let mut attr: perf_event_attr = unsafe { mem::zeroed() };
        attr._type = event_type;
        attr.size = mem::size_of::<perf_event_attr>() as u32;
        attr.config = config;
        attr.flags.set_disabled(1);
        attr.flags.set_exclude_kernel(1);
        attr.flags.set_exclude_hv(1);
        attr
    }
}

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_RAW: u32 = 4;

pub const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

pub fn perf_event_open(
    hw_event: &perf_event_attr,
    pid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: libc::c_int,
    flags: libc::c_ulong,
) -> Result<PerfEventFile, Error> {
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            hw_event as *const perf_event_attr,
            pid,
            cpu,
            group_fd,
            flags,
        )
    } as i32;

    if fd < 0 {
        return Err(Error::last_os_error());
    }

    Ok(PerfEventFile {
        // SAFETY: the syscall just handed us this descriptor.
        fd: unsafe { OwnedFd::from_raw_fd(fd) },
        need_disable: false,
    })
}

const PERF_EVENT_MAGIC: u8 = b'$';
const PERF_EVENT_IOC_ENABLE: u8 = 0;
const PERF_EVENT_IOC_DISABLE: u8 = 1;
const PERF_EVENT_IOC_RESET: u8 = 3;
ioctl_none!(
    perf_event_ioc_enable,
    PERF_EVENT_MAGIC,
    PERF_EVENT_IOC_ENABLE
);
ioctl_none!(
    perf_event_ioc_disable,
    PERF_EVENT_MAGIC,
    PERF_EVENT_IOC_DISABLE
);
ioctl_none!(perf_event_ioc_reset, PERF_EVENT_MAGIC, PERF_EVENT_IOC_RESET);

/// One open counting event. The descriptor is closed on drop.
#[derive(Debug)]
pub struct PerfEventFile {
    fd: OwnedFd,
    need_disable: bool,
}

impl PerfEventFile {
    pub fn reset(&self) -> Result<(), Error> {
        unsafe { perf_event_ioc_reset(self.fd.as_raw_fd()) }?;
        Ok(())
    }

    pub fn enable(&mut self) -> Result<(), Error> {
        unsafe { perf_event_ioc_enable(self.fd.as_raw_fd()) }?;
        self.need_disable = true;
        Ok(())
    }

    pub fn disable(&mut self) -> Result<(), Error> {
        match unsafe { perf_event_ioc_disable(self.fd.as_raw_fd()) } {
            Ok(_) => {
                self.need_disable = false;
                Ok(())
            }
            Err(Errno::ENOTTY) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the current count. Plain `read(2)` of a `u64`, safe to call from
    /// a signal handler.
    pub fn read_value(&self) -> Result<u64, Error> {
        let mut value: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            return Err(Error::last_os_error());
        }
        if n as usize != mem::size_of::<u64>() {
            return Err(Error::from_raw_os_error(libc::EIO));
        }
        Ok(value)
    }
}

impl AsRawFd for PerfEventFile {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for PerfEventFile {
    fn drop(&mut self) {
        if self.need_disable {
            let _ = unsafe { perf_event_ioc_disable(self.fd.as_raw_fd()) };
        }
    }
}
