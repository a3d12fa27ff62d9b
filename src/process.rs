//! Target process identity and memory footprint.
//!
//! This is the per-process status summary the report's metadata and the
//! per-interval samples draw from; it doubles as the liveness check that
//! ends a session early when the target goes away.

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

#[derive(Debug, Clone, Serialize)]
pub struct ProcessMetadata {
    pub pid: i32,
    pub process_name: String,
    pub threads: i32,
    pub vm_rss_kb: i64,
    pub vm_size_kb: i64,
}

pub struct ProcessWatch {
    system: System,
}

impl ProcessWatch {
    pub fn new() -> Self {
        ProcessWatch {
            system: System::new(),
        }
    }

    /// Refresh and read the target's status summary. `None` once the
    /// process is gone.
    pub fn metadata(&mut self, pid: i32) -> Option<ProcessMetadata> {
        let target = Pid::from_u32(pid as u32);
        let refreshed = self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::nothing().with_memory().with_tasks(),
        );
        if refreshed == 0 {
            return None;
        }
        let process = self.system.process(target)?;
        Some(ProcessMetadata {
            pid,
            process_name: process.name().to_string_lossy().into_owned(),
            threads: process.tasks().map_or(1, |tasks| tasks.len() as i32),
            vm_rss_kb: (process.memory() / 1024) as i64,
            vm_size_kb: (process.virtual_memory() / 1024) as i64,
        })
    }
}

impl Default for ProcessWatch {
    fn default() -> Self {
        Self::new()
    }
}
