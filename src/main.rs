use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use cputrace::error::AgentError;
use cputrace::report;
use cputrace::session::{self, SessionConfig};

/// Profile the CPU usage of a single running process.
#[derive(Debug, Parser)]
#[command(name = "cputrace", version)]
struct Command {
    /// Target process id
    #[arg(long)]
    pid: i32,
    /// Seconds to profile
    #[arg(long)]
    duration: u64,
    /// Output JSON path
    #[arg(long)]
    out: PathBuf,
    /// Utilization sampling interval in milliseconds
    #[arg(long, default_value = "100")]
    interval: u64,
}

fn main() -> Result<()> {
    let opts = Command::parse();

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || handler_stop.store(true, Ordering::Relaxed))
        .expect("Error setting Ctrl-C handler");

    let config = SessionConfig {
        pid: opts.pid,
        duration: Duration::from_secs(opts.duration),
        interval: Duration::from_millis(opts.interval.max(1)),
        frequency_hz: session::SAMPLE_FREQUENCY_HZ,
    };

    let session_report = session::run(&config, stop)?;
    report::write_atomic(&session_report, &opts.out).map_err(|source| AgentError::ReportWrite {
        path: opts.out.clone(),
        source,
    })?;
    println!("Report written to {}", opts.out.display());
    Ok(())
}
