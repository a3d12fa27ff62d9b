//! The session report: data model, JSON shape, and the final write.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Serialize, Serializer};

use crate::process::ProcessMetadata;

fn two_decimals<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64((value * 100.0).round() / 100.0)
}

fn hex_address<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{value:#x}"))
}

/// How the session ended. Both outcomes produce a report; `Aborted` means
/// the target went away (or the run was interrupted) before the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOutcome {
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct UtilizationSample {
    #[serde(rename = "t", serialize_with = "two_decimals")]
    pub elapsed_seconds: f64,
    /// In [0, 100], or -1 when utilization was unknown for the interval.
    #[serde(rename = "cpu_pct", serialize_with = "two_decimals")]
    pub cpu_percent: f64,
    #[serde(rename = "rss_kb")]
    pub resident_kb: i64,
    #[serde(rename = "threads")]
    pub thread_count: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolSample {
    #[serde(serialize_with = "hex_address")]
    pub ip: u64,
    pub func: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    #[serde(serialize_with = "two_decimals")]
    pub cpu_avg_percent: f64,
    #[serde(serialize_with = "two_decimals")]
    pub cpu_max_percent: f64,
    pub sample_count: usize,
}

impl Summary {
    /// Average and max are taken over the intervals whose utilization was
    /// known; unknown-sentinel samples still count toward `sample_count`.
    /// With no known interval at all, avg and max are themselves the
    /// sentinel.
    pub fn from_samples(samples: &[UtilizationSample]) -> Self {
        let known: Vec<f64> = samples
            .iter()
            .map(|sample| sample.cpu_percent)
            .filter(|percent| *percent >= 0.0)
            .collect();
        let (cpu_avg_percent, cpu_max_percent) = if known.is_empty() {
            (
                crate::cpu::UNKNOWN_CPU_PERCENT,
                crate::cpu::UNKNOWN_CPU_PERCENT,
            )
        } else {
            (
                known.iter().sum::<f64>() / known.len() as f64,
                known.iter().copied().fold(0.0, f64::max),
            )
        };
        Summary {
            cpu_avg_percent,
            cpu_max_percent,
            sample_count: samples.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub start_time: String,
    pub status: SessionOutcome,
    /// Actual elapsed whole seconds, which is less than requested when the
    /// session aborted early.
    pub duration_seconds: u64,
    pub requested_duration_seconds: u64,
    pub metadata: ProcessMetadata,
    pub summary: Summary,
    pub samples: Vec<UtilizationSample>,
    /// None when cycle sampling was unavailable for the session.
    pub total_cycles: Option<u64>,
    pub symbol_samples: Vec<SymbolSample>,
}

/// Write the report in one shot. A temp file plus rename keeps an
/// interrupted run from leaving a truncated artifact at the target path.
pub fn write_atomic(report: &SessionReport, path: &Path) -> io::Result<()> {
    let body = serde_json::to_vec_pretty(report)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(t: f64, pct: f64) -> UtilizationSample {
        UtilizationSample {
            elapsed_seconds: t,
            cpu_percent: pct,
            resident_kb: 1024,
            thread_count: 2,
        }
    }

    fn test_report() -> SessionReport {
        let samples = vec![sample(0.1, 50.0), sample(0.2, 25.127)];
        SessionReport {
            session_id: "f00dfeedf00dfeed".to_string(),
            start_time: "2026-01-02T03:04:05Z".to_string(),
            status: SessionOutcome::Completed,
            duration_seconds: 2,
            requested_duration_seconds: 2,
            metadata: ProcessMetadata {
                pid: 42,
                process_name: "app".to_string(),
                threads: 2,
                vm_rss_kb: 1024,
                vm_size_kb: 4096,
            },
            summary: Summary::from_samples(&samples),
            samples,
            total_cycles: Some(123456789),
            symbol_samples: vec![SymbolSample {
                ip: 0x55d2c0a15abc,
                func: "main".to_string(),
            }],
        }
    }

    #[test]
    fn test_summary_over_known_samples() {
        let samples = vec![sample(0.1, 10.0), sample(0.2, 30.0), sample(0.3, -1.0)];
        let summary = Summary::from_samples(&samples);
        assert_eq!(summary.sample_count, 3);
        assert!((summary.cpu_avg_percent - 20.0).abs() < 1e-9);
        assert_eq!(summary.cpu_max_percent, 30.0);
    }

    #[test]
    fn test_summary_with_no_known_samples() {
        let samples = vec![sample(0.1, -1.0), sample(0.2, -1.0)];
        let summary = Summary::from_samples(&samples);
        assert_eq!(summary.sample_count, 2);
        assert_eq!(summary.cpu_avg_percent, -1.0);
        assert_eq!(summary.cpu_max_percent, -1.0);
    }

    #[test]
    fn test_summary_of_empty_session() {
        let summary = Summary::from_samples(&[]);
        assert_eq!(summary.sample_count, 0);
        assert_eq!(summary.cpu_avg_percent, -1.0);
    }

    #[test]
    fn test_json_shape() {
        let value = serde_json::to_value(test_report()).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["samples"][0]["t"], 0.1);
        assert_eq!(value["samples"][1]["cpu_pct"], 25.13);
        assert_eq!(value["samples"][0]["rss_kb"], 1024);
        assert_eq!(value["symbol_samples"][0]["ip"], "0x55d2c0a15abc");
        assert_eq!(value["symbol_samples"][0]["func"], "main");
        assert_eq!(value["metadata"]["process_name"], "app");
        assert_eq!(value["summary"]["sample_count"], 2);
        assert_eq!(value["total_cycles"], 123456789);
    }

    #[test]
    fn test_unavailable_cycles_serialize_as_null() {
        let mut report = test_report();
        report.total_cycles = None;
        let value = serde_json::to_value(report).unwrap();
        assert!(value["total_cycles"].is_null());
    }

    #[test]
    fn test_atomic_write_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("report.json");
        write_atomic(&test_report(), &path).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
        let body = fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["session_id"], "f00dfeedf00dfeed");
    }
}
