//! One profiling session, from first snapshot to assembled report.
//!
//! The session is a three-stage run: capture initial metadata and baseline
//! tick snapshots, sample on a fixed interval until the deadline (with the
//! cycle counter measuring concurrently over the same wall-clock window),
//! then finalize. The target vanishing mid-run, a failed interval read, or
//! an interrupt all end the session the same way: early, gracefully, and
//! with a partial but valid report.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use rand::RngCore;

use crate::cpu;
use crate::error::AgentError;
use crate::perf;
use crate::process::ProcessWatch;
use crate::report::{SessionOutcome, SessionReport, Summary, SymbolSample, UtilizationSample};
use crate::symbolize::{Addr2LineSource, SymbolResolver};

/// Instruction-pointer sampling rate for the cycle counter.
pub const SAMPLE_FREQUENCY_HZ: u64 = 99;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub pid: i32,
    pub duration: Duration,
    pub interval: Duration,
    pub frequency_hz: u64,
}

/// Run a full session. Fatal errors are limited to the target not existing
/// at start and the baseline snapshots being unreadable; everything else
/// degrades and the report is still assembled.
pub fn run(config: &SessionConfig, stop: Arc<AtomicBool>) -> Result<SessionReport, AgentError> {
    let session_id = format!("{:016x}", rand::rng().next_u64());
    let start_time = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut watch = ProcessWatch::new();
    let initial = watch
        .metadata(config.pid)
        .ok_or(AgentError::ProcessNotFound(config.pid))?;

    // The region snapshot is taken once, up front, so modules the target
    // loads later simply resolve to "unknown".
    let mut resolver = match SymbolResolver::load_regions(config.pid) {
        Ok(resolver) => resolver,
        Err(err) => {
            eprintln!(
                "warning: could not read memory map of pid {}: {err}",
                config.pid
            );
            SymbolResolver::from_regions(Vec::new(), Addr2LineSource)
        }
    };

    let mut prev_process =
        cpu::snapshot_process(config.pid).map_err(|_| AgentError::ProcessNotFound(config.pid))?;
    let mut prev_system = cpu::snapshot_system().map_err(|source| AgentError::Io {
        what: "/proc/stat".to_string(),
        source,
    })?;

    let sampler_stop = stop.clone();
    let (pid, duration, frequency_hz) = (config.pid, config.duration, config.frequency_hz);
    let sampler = thread::Builder::new()
        .name("cycle_sampler".to_string())
        .spawn(move || perf::begin_sampling(pid, duration, frequency_hz, &sampler_stop))
        .map_err(|source| AgentError::Io {
            what: "spawn of the cycle sampler thread".to_string(),
            source,
        })?;

    println!(
        "Profiling pid {} ({}) for {} seconds",
        config.pid,
        initial.process_name,
        config.duration.as_secs()
    );

    let started = Instant::now();
    let deadline = started + config.duration;
    let mut samples: Vec<UtilizationSample> = Vec::new();
    let mut outcome = SessionOutcome::Completed;

    while Instant::now() < deadline {
        if stop.load(Ordering::Relaxed) {
            outcome = SessionOutcome::Aborted;
            break;
        }
        let slice = deadline
            .saturating_duration_since(Instant::now())
            .min(config.interval);
        thread::sleep(slice);

        // Any read failure here means the target is gone (or going); both
        // finalize with whatever was collected.
        let (curr_process, curr_system) =
            match (cpu::snapshot_process(config.pid), cpu::snapshot_system()) {
                (Ok(process), Ok(system)) => (process, system),
                _ => {
                    outcome = SessionOutcome::Aborted;
                    break;
                }
            };
        let Some(meta) = watch.metadata(config.pid) else {
            outcome = SessionOutcome::Aborted;
            break;
        };

        samples.push(UtilizationSample {
            elapsed_seconds: started.elapsed().as_secs_f64(),
            cpu_percent: cpu::cpu_percent(&prev_process, &curr_process, &prev_system, &curr_system),
            resident_kb: meta.vm_rss_kb,
            thread_count: meta.threads,
        });
        prev_process = curr_process;
        prev_system = curr_system;
    }

    if outcome == SessionOutcome::Aborted {
        // Wake the sampler early; it polls this flag between sleep slices.
        stop.store(true, Ordering::Relaxed);
        println!("Target finished early, finalizing");
    }

    let cycles = match sampler.join() {
        Ok(Ok(sample)) => Some(sample),
        Ok(Err(err)) => {
            eprintln!("warning: cycle sampling unavailable: {err}");
            None
        }
        Err(_) => {
            eprintln!("warning: cycle sampler thread panicked");
            None
        }
    };

    let symbol_samples: Vec<SymbolSample> = match &cycles {
        Some(sample) => sample
            .addresses
            .iter()
            .map(|&ip| SymbolSample {
                ip,
                func: resolver.resolve(ip),
            })
            .collect(),
        None => Vec::new(),
    };

    let summary = Summary::from_samples(&samples);
    Ok(SessionReport {
        session_id,
        start_time,
        status: outcome,
        duration_seconds: started.elapsed().as_secs(),
        requested_duration_seconds: config.duration.as_secs(),
        metadata: initial,
        summary,
        samples,
        total_cycles: cycles.as_ref().map(|sample| sample.total_cycles),
        symbol_samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_target_is_fatal() {
        let config = SessionConfig {
            pid: 0x7fff_fffe,
            duration: Duration::from_secs(1),
            interval: Duration::from_millis(100),
            frequency_hz: SAMPLE_FREQUENCY_HZ,
        };
        let err = run(&config, Arc::new(AtomicBool::new(false))).unwrap_err();
        assert!(matches!(err, AgentError::ProcessNotFound(_)));
    }

    #[test]
    fn test_self_profile_produces_ordered_samples() {
        let config = SessionConfig {
            pid: std::process::id() as i32,
            duration: Duration::from_millis(500),
            interval: Duration::from_millis(50),
            frequency_hz: SAMPLE_FREQUENCY_HZ,
        };
        let report = run(&config, Arc::new(AtomicBool::new(false))).unwrap();
        assert_eq!(report.status, SessionOutcome::Completed);
        assert_eq!(report.summary.sample_count, report.samples.len());
        assert!(report
            .samples
            .windows(2)
            .all(|pair| pair[0].elapsed_seconds < pair[1].elapsed_seconds));
        for sample in &report.samples {
            assert!(sample.cpu_percent <= 100.0);
            assert!(sample.cpu_percent >= 0.0 || sample.cpu_percent == cpu::UNKNOWN_CPU_PERCENT);
        }
    }

    #[test]
    fn test_raised_stop_flag_aborts_immediately() {
        let config = SessionConfig {
            pid: std::process::id() as i32,
            duration: Duration::from_secs(30),
            interval: Duration::from_millis(50),
            frequency_hz: SAMPLE_FREQUENCY_HZ,
        };
        let begun = Instant::now();
        let report = run(&config, Arc::new(AtomicBool::new(true))).unwrap();
        assert_eq!(report.status, SessionOutcome::Aborted);
        assert!(begun.elapsed() < Duration::from_secs(5));
    }
}
