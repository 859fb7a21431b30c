//! Hardware counters through the Linux `perf_event_open(2)` interface.

use super::counter::{Counter, CounterSource};
use autopin_shared::Tid;
use autopin_shared::perf_event::PerfEvent;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

pub const KIND: &str = "perf";

const PERF_TYPE_HARDWARE: u32 = 0;
const PERF_ATTR_SIZE_VER5: u32 = 112;
/// `perf_event_attr.disabled`, the first bit of the flag word.
const ATTR_FLAG_DISABLED: u64 = 1 << 0;
const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

nix::ioctl_none!(perf_event_ioc_enable, b'$', 0);
nix::ioctl_none!(perf_event_ioc_reset, b'$', 3);

/// `struct perf_event_attr` up to `PERF_ATTR_SIZE_VER5`.
#[repr(C)]
#[derive(Debug, Default)]
#[allow(dead_code)] // only read by the kernel
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    reserved: u16,
}

const _: () = assert!(std::mem::size_of::<PerfEventAttr>() == PERF_ATTR_SIZE_VER5 as usize);

impl PerfEventAttr {
    /// A disabled counter of `event`, counting on any CPU the thread runs on.
    fn hardware(event: PerfEvent) -> Self {
        Self {
            type_: PERF_TYPE_HARDWARE,
            size: PERF_ATTR_SIZE_VER5,
            config: event.hardware_config(),
            flags: ATTR_FLAG_DISABLED,
            ..Default::default()
        }
    }
}

fn perf_event_open(attr: &PerfEventAttr, tid: Tid) -> io::Result<File> {
    let cpu: libc::c_int = -1;
    let group_fd: libc::c_int = -1;
    let flags = PERF_FLAG_FD_CLOEXEC;

    // SAFETY: attr points to a fully initialised perf_event_attr whose size field matches its
    // layout, the kernel only reads it.
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            tid,
            cpu,
            group_fd,
            flags,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: the syscall returned a fresh file descriptor that nothing else owns
    Ok(unsafe { File::from_raw_fd(fd as RawFd) })
}

/// Opens one `PERF_TYPE_HARDWARE` counter per thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct PerfCounterSource;

/// A perf counter file descriptor, closed on drop.
#[derive(Debug)]
pub struct PerfCounter {
    file: File,
}

impl Counter for PerfCounter {
    fn enable(&mut self) -> io::Result<()> {
        // SAFETY: the descriptor is a live perf event owned by self
        unsafe { perf_event_ioc_enable(self.file.as_raw_fd()) }?;
        Ok(())
    }

    fn reset(&mut self) -> io::Result<()> {
        // SAFETY: the descriptor is a live perf event owned by self
        unsafe { perf_event_ioc_reset(self.file.as_raw_fd()) }?;
        Ok(())
    }

    fn read(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.file.read_exact(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

impl CounterSource for PerfCounterSource {
    type Counter = PerfCounter;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn open(&mut self, event: PerfEvent, tid: Tid) -> io::Result<PerfCounter> {
        let attr = PerfEventAttr::hardware(event);
        let file = perf_event_open(&attr, tid)?;
        Ok(PerfCounter { file })
    }
}
