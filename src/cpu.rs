//! CPU tick accounting from /proc.
//!
//! Utilization is the ratio of the target's active-tick delta to the
//! system-wide total-tick delta between two snapshots. Resolution is bound
//! to the kernel's tick granularity: at short sampling intervals a busy
//! process can legitimately read 0% for a beat, which is a property of the
//! source, not something to smooth over.

use std::fs;
use std::io;
use std::time::Instant;

/// Sentinel for "utilization unknown" (system tick delta was not positive).
pub const UNKNOWN_CPU_PERCENT: f64 = -1.0;

#[derive(Debug, Clone, Copy)]
pub struct ProcessCpuSnapshot {
    pub user_ticks: u64,
    pub kernel_ticks: u64,
    pub captured_at: Instant,
}

impl ProcessCpuSnapshot {
    pub fn active_ticks(&self) -> u64 {
        self.user_ticks + self.kernel_ticks
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SystemCpuSnapshot {
    pub idle_ticks: u64,
    pub total_ticks: u64,
}

/// Snapshot the target's utime/stime counters. `Err` once the process is
/// gone.
pub fn snapshot_process(pid: i32) -> io::Result<ProcessCpuSnapshot> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat"))?;
    let (user_ticks, kernel_ticks) = parse_process_stat(&stat).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed stat line for pid {pid}"),
        )
    })?;
    Ok(ProcessCpuSnapshot {
        user_ticks,
        kernel_ticks,
        captured_at: Instant::now(),
    })
}

/// Snapshot the system-wide tick counters from the aggregate `cpu` line.
pub fn snapshot_system() -> io::Result<SystemCpuSnapshot> {
    let stat = fs::read_to_string("/proc/stat")?;
    parse_system_stat(&stat)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed /proc/stat"))
}

/// Utilization percentage between two snapshot pairs, clamped to [0, 100].
/// Returns [`UNKNOWN_CPU_PERCENT`] when the system tick delta is not
/// positive, rather than coercing the unknown reading to 0%.
pub fn cpu_percent(
    prev_process: &ProcessCpuSnapshot,
    curr_process: &ProcessCpuSnapshot,
    prev_system: &SystemCpuSnapshot,
    curr_system: &SystemCpuSnapshot,
) -> f64 {
    let system_delta = curr_system.total_ticks.saturating_sub(prev_system.total_ticks);
    if system_delta == 0 {
        return UNKNOWN_CPU_PERCENT;
    }
    let process_delta = curr_process
        .active_ticks()
        .saturating_sub(prev_process.active_ticks());
    (process_delta as f64 / system_delta as f64 * 100.0).clamp(0.0, 100.0)
}

/// The comm field may contain spaces and parentheses, so the numeric fields
/// resume after the *last* `)`. utime and stime are fields 14 and 15 of the
/// full line.
fn parse_process_stat(line: &str) -> Option<(u64, u64)> {
    let rest = &line[line.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let utime = fields.nth(11)?.parse().ok()?;
    let stime = fields.next()?.parse().ok()?;
    Some((utime, stime))
}

fn parse_system_stat(content: &str) -> Option<SystemCpuSnapshot> {
    let line = content.lines().find(|line| line.starts_with("cpu "))?;
    let ticks: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map_while(|field| field.parse().ok())
        .collect();
    if ticks.len() < 8 {
        return None;
    }
    Some(SystemCpuSnapshot {
        idle_ticks: ticks[3] + ticks[4],
        total_ticks: ticks[..8].iter().sum(),
    })
}
