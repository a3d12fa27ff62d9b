//! Integration tests for the cputrace binary.
//!
//! These drive the built binary against short-lived helper processes and
//! validate the emitted report. They only need an unprivileged Linux
//! environment: when cycle sampling is unavailable the agent degrades and
//! the utilization path is still fully exercised.

use std::process::{Child, Command, Stdio};
use std::thread;

use tempfile::TempDir;

/// Spawn a child that spins on the CPU until killed.
fn spawn_busy_child() -> Child {
    Command::new("sh")
        .args(["-c", "while :; do :; done"])
        .stdout(Stdio::null())
        .spawn()
        .expect("Failed to spawn busy child")
}

fn run_cputrace(pid: u32, duration: &str, interval: &str, out: &std::path::Path) -> bool {
    let output = Command::new(env!("CARGO_BIN_EXE_cputrace"))
        .args(["--pid", &pid.to_string(), "--duration", duration])
        .args(["--interval", interval])
        .arg("--out")
        .arg(out)
        .output()
        .expect("Failed to run cputrace");
    if !output.status.success() {
        eprintln!(
            "cputrace failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    output.status.success()
}

fn read_report(path: &std::path::Path) -> serde_json::Value {
    let body = std::fs::read_to_string(path).expect("Report file missing");
    serde_json::from_str(&body).expect("Report is not valid JSON")
}

#[test]
fn test_busy_target_end_to_end() {
    let mut child = spawn_busy_child();
    let dir = TempDir::new().expect("Failed to create temp dir");
    let out = dir.path().join("report.json");

    let success = run_cputrace(child.id(), "2", "100", &out);
    child.kill().ok();
    child.wait().ok();
    assert!(success, "cputrace exited non-zero");

    let report = read_report(&out);
    assert_eq!(report["status"], "completed");
    assert_eq!(report["metadata"]["pid"], child.id() as i64);
    assert_eq!(report["duration_seconds"], 2);

    let samples = report["samples"].as_array().expect("samples array");
    // 2 s at a 100 ms cadence; allow slack for scheduler jitter.
    assert!(
        samples.len() >= 14 && samples.len() <= 21,
        "expected ~20 samples, got {}",
        samples.len()
    );
    assert_eq!(
        report["summary"]["sample_count"].as_u64().unwrap() as usize,
        samples.len()
    );

    let mut prev_t = -1.0;
    for sample in samples {
        let t = sample["t"].as_f64().unwrap();
        assert!(t > prev_t, "samples must be time-ordered");
        prev_t = t;
        assert!(sample["cpu_pct"].as_f64().unwrap() >= 0.0);
        assert!(sample["rss_kb"].as_i64().unwrap() > 0);
        assert!(sample["threads"].as_i64().unwrap() >= 1);
    }

    let avg = report["summary"]["cpu_avg_percent"].as_f64().unwrap();
    let mean = samples
        .iter()
        .map(|sample| sample["cpu_pct"].as_f64().unwrap())
        .sum::<f64>()
        / samples.len() as f64;
    assert!(
        (avg - mean).abs() < 0.05,
        "summary avg {avg} drifted from sample mean {mean}"
    );
}

#[test]
fn test_target_exit_aborts_with_partial_report() {
    let mut child = Command::new("sleep")
        .arg("1")
        .spawn()
        .expect("Failed to spawn sleep");
    let pid = child.id();
    // Reap the child the moment it exits so its pid actually disappears.
    let reaper = thread::spawn(move || {
        child.wait().ok();
    });

    let dir = TempDir::new().expect("Failed to create temp dir");
    let out = dir.path().join("report.json");
    assert!(run_cputrace(pid, "10", "100", &out));
    reaper.join().unwrap();

    let report = read_report(&out);
    assert_eq!(report["status"], "aborted");
    let actual = report["duration_seconds"].as_u64().unwrap();
    assert!(actual < 10, "aborted run reported full duration {actual}");
    assert_eq!(report["requested_duration_seconds"], 10);
    let samples = report["samples"].as_array().unwrap();
    assert!(
        samples.len() <= 12,
        "only ~10 samples fit before the target exited, got {}",
        samples.len()
    );
}

#[test]
fn test_never_existing_pid_is_fatal() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let out = dir.path().join("report.json");
    let output = Command::new(env!("CARGO_BIN_EXE_cputrace"))
        .args(["--pid", "2147483534", "--duration", "1"])
        .arg("--out")
        .arg(&out)
        .output()
        .expect("Failed to run cputrace");
    assert!(!output.status.success());
    assert!(!out.exists(), "no report may be written for a dead start");
}

#[test]
fn test_missing_required_flags_usage_exit_2() {
    let output = Command::new(env!("CARGO_BIN_EXE_cputrace"))
        .output()
        .expect("Failed to run cputrace");
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Usage"), "usage text goes to stderr");
    assert!(output.stdout.is_empty());
}
