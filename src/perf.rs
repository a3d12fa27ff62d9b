use std::fs;
use std::io::Error;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bitfield::bitfield;
use nix::ioctl_none;

use crate::error::AgentError;
use crate::ringbuf::{decode_records, sample_addresses};

#[repr(C)]
pub union sample_un {
    pub sample_period: u64,
    pub sample_freq: u64,
}

#[repr(C)]
pub union wakeup_un {
    pub wakeup_events: u32,
    pub wakeup_watermark: u32,
}

#[repr(C)]
pub union bp_1_un {
    pub bp_addr: u64,
    pub kprobe_func: u64,
    pub uprobe_path: u64,
    pub config1: u64,
}

#[repr(C)]
pub union bp_2_un {
    pub bp_len: u64,
    pub kprobe_addr: u64,
    pub probe_offset: u64,
    pub config2: u64,
}

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
    pub mmap, set_mmap: 8, 8;
    pub comm, set_comm: 9, 9;
    pub freq, set_freq: 10, 10;
    pub __reserved_1, _: 63, 11;
}

#[repr(C)]
#[allow(non_camel_case_types)]
pub struct perf_event_attr {
    pub _type: u32,
    pub size: u32,
    pub config: u64,
    pub sample: sample_un,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: perf_event_attr_flags,
    pub wakeup: wakeup_un,
    pub bp_type: u32,
    pub bp_1: bp_1_un,
    pub bp_2: bp_2_un,
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

/// Leading portion of the kernel's `struct perf_event_mmap_page`. The
/// reserved block pads the producer/consumer offsets out to their fixed
/// 1 KiB positions; fields past `data_size` are not used here.
#[repr(C)]
#[allow(non_camel_case_types)]
pub struct perf_event_mmap_page {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub __reserved_1: u32,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub __reserved: [u8; 116 * 8 - 4 * 8],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
}

pub const PERF_TYPE_HARDWARE: u32 = 0;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;

pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_TID: u64 = 1 << 1;

/// Data pages mapped behind the control page. The kernel requires a power
/// of two.
pub const DATA_PAGES: usize = 8;

/// How often the measurement sleep re-checks the stop flag.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Policy file consulted before any counter is opened.
pub const PARANOID_PATH: &str = "/proc/sys/kernel/perf_event_paranoid";

extern "C" {
    fn syscall(number: libc::c_long, ...) -> libc::c_long;
}

pub fn perf_event_open(
    hw_event: &perf_event_attr,
    pid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: libc::c_int,
    flags: libc::c_ulong,
) -> Result<PerfEventFile, Error> {
    let fd = unsafe {
        syscall(
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
        fd,
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

/// An open counter fd. Disabled (if needed) and closed on drop, so the
/// counter is released on every exit path.
#[derive(Debug)]
pub struct PerfEventFile {
    fd: RawFd,
    need_disable: bool,
}

impl PerfEventFile {
    pub fn enable(&mut self) -> Result<(), Error> {
        unsafe { perf_event_ioc_enable(self.fd) }?;
        self.need_disable = true;
        Ok(())
    }

    pub fn disable(&mut self) -> Result<(), Error> {
        unsafe { perf_event_ioc_disable(self.fd) }?;
        self.need_disable = false;
        Ok(())
    }

    pub fn reset(&self) -> Result<(), Error> {
        unsafe { perf_event_ioc_reset(self.fd) }?;
        Ok(())
    }

    /// Read the accumulated counter value straight off the fd.
    pub fn read_count(&self) -> Result<u64, Error> {
        let mut value: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut value as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            return Err(Error::last_os_error());
        }
        Ok(value)
    }
}

impl AsRawFd for PerfEventFile {
    fn as_raw_fd(&self) -> i32 {
        self.fd
    }
}

impl Drop for PerfEventFile {
    fn drop(&mut self) {
        if self.need_disable {
            let _ = unsafe { perf_event_ioc_disable(self.fd) };
        }
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// The shared ring mapped over a counter fd: one control page plus
/// `DATA_PAGES` data pages. Unmapped on drop.
pub struct SampleRing {
    base: *mut libc::c_void,
    len: usize,
    page_size: usize,
}

impl SampleRing {
    pub fn map(file: &PerfEventFile) -> Result<Self, Error> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = (DATA_PAGES + 1) * page_size;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(SampleRing {
            base,
            len,
            page_size,
        })
    }

    fn control(&self) -> *const perf_event_mmap_page {
        self.base as *const perf_event_mmap_page
    }

    /// Kernel write position, monotonically increasing.
    pub fn producer_offset(&self) -> u64 {
        let head = unsafe { std::ptr::read_volatile(std::ptr::addr_of!((*self.control()).data_head)) };
        fence(Ordering::Acquire);
        head
    }

    pub fn consumer_offset(&self) -> u64 {
        unsafe { std::ptr::read_volatile(std::ptr::addr_of!((*self.control()).data_tail)) }
    }

    /// Publish how far we consumed back to the kernel.
    pub fn advance_consumer(&self, to: u64) {
        fence(Ordering::Release);
        unsafe {
            std::ptr::write_volatile(
                std::ptr::addr_of!((*self.control()).data_tail) as *mut u64,
                to,
            );
        }
    }

    /// The circular data region behind the control page.
    pub fn data(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                (self.base as *const u8).add(self.page_size),
                DATA_PAGES * self.page_size,
            )
        }
    }
}

impl Drop for SampleRing {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.len);
        }
    }
}

/// What the kernel lets unprivileged users do with the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingPolicy {
    Permitted,
    Restricted,
}

/// Classify the content of `perf_event_paranoid`. Level 3 and above (a
/// common distro patch) refuses unprivileged sampling outright; anything
/// unparsable falls through to the open so the kernel reports the real
/// errno.
pub fn classify_policy(content: &str) -> SamplingPolicy {
    match content.trim().parse::<i64>() {
        Ok(level) if level >= 3 => SamplingPolicy::Restricted,
        _ => SamplingPolicy::Permitted,
    }
}

/// Result of one duration-long cycle measurement.
#[derive(Debug, Default, Clone)]
pub struct CycleSample {
    pub total_cycles: u64,
    pub addresses: Vec<u64>,
}

/// Measure retired user-mode cycles of `pid` for `duration`, sampling the
/// instruction pointer at `frequency_hz`. Blocks for the whole window
/// unless `stop` is raised. The counter fd and the mapped ring are released
/// on every exit path, including errors.
pub fn begin_sampling(
    pid: i32,
    duration: Duration,
    frequency_hz: u64,
    stop: &AtomicBool,
) -> Result<CycleSample, AgentError> {
    if let Ok(content) = fs::read_to_string(PARANOID_PATH) {
        if classify_policy(&content) == SamplingPolicy::Restricted {
            return Err(AgentError::PermissionDenied {
                context: format!(
                    "kernel.perf_event_paranoid is {} which forbids user-initiated \
                     sampling; lower it (e.g. sysctl kernel.perf_event_paranoid=1) \
                     or run with CAP_PERFMON",
                    content.trim()
                ),
                errno: libc::EACCES,
            });
        }
    }

    let mut attr: perf_event_attr = unsafe { mem::zeroed() };
    attr._type = PERF_TYPE_HARDWARE;
    attr.size = mem::size_of::<perf_event_attr>() as u32;
    attr.config = PERF_COUNT_HW_CPU_CYCLES;
    attr.sample.sample_freq = frequency_hz;
    attr.sample_type = PERF_SAMPLE_IP | PERF_SAMPLE_TID;
    attr.flags.set_disabled(1);
    attr.flags.set_exclude_kernel(1);
    attr.flags.set_exclude_hv(1);
    attr.flags.set_freq(1);

    // Attach to the target pid on any CPU.
    let mut file = perf_event_open(&attr, pid, -1, -1, 0).map_err(|err| open_error(pid, err))?;
    let ring = SampleRing::map(&file).map_err(|err| resource_error("mapping the sample ring", err))?;

    file.reset()
        .map_err(|err| resource_error("resetting the cycle counter", err))?;
    file.enable()
        .map_err(|err| resource_error("enabling the cycle counter", err))?;

    let deadline = Instant::now() + duration;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || stop.load(Ordering::Relaxed) {
            break;
        }
        thread::sleep(remaining.min(STOP_POLL));
    }

    file.disable()
        .map_err(|err| resource_error("disabling the cycle counter", err))?;
    let total_cycles = file
        .read_count()
        .map_err(|err| resource_error("reading the cycle counter", err))?;

    let producer = ring.producer_offset();
    let consumer = ring.consumer_offset();
    let records = decode_records(ring.data(), consumer, producer);
    ring.advance_consumer(producer);

    Ok(CycleSample {
        total_cycles,
        addresses: sample_addresses(&records),
    })
}

fn open_error(pid: i32, err: Error) -> AgentError {
    let errno = err.raw_os_error().unwrap_or(0);
    match errno {
        libc::EACCES | libc::EPERM => AgentError::PermissionDenied {
            context: format!("perf_event_open on pid {pid} was refused"),
            errno,
        },
        libc::ESRCH => AgentError::ProcessNotFound(pid),
        _ => AgentError::ResourceUnavailable {
            context: format!("perf_event_open on pid {pid} failed"),
            errno,
        },
    }
}

fn resource_error(context: &str, err: Error) -> AgentError {
    AgentError::ResourceUnavailable {
        context: context.to_string(),
        errno: err.raw_os_error().unwrap_or(0),
    }
}
