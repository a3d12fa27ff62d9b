use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures a profiling session can surface.
///
/// Only `ProcessNotFound` at session start, `Io` on the baseline snapshots,
/// and `ReportWrite` are fatal to the run. Counter failures disable sampling
/// for the session; the report is still produced.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("target process {0} does not exist")]
    ProcessNotFound(i32),

    #[error("{context} (os error {errno})")]
    PermissionDenied { context: String, errno: i32 },

    #[error("{context} (os error {errno})")]
    ResourceUnavailable { context: String, errno: i32 },

    #[error("failed to read {what}: {source}")]
    Io {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write report to {path}: {source}")]
    ReportWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
