use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::profile::ProfileError;
use crate::protocol::ProtocolError;

/// Result type used throughout the harness.
pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

/// Errors produced while driving a harness-managed process.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Creating, writing to or removing the workspace failed.
    #[error("workspace operation on {path} failed: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The workspace was already removed.
    #[error("workspace {0} already cleaned up")]
    WorkspaceCleaned(PathBuf),

    /// The OS refused to start the process.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A readiness gate ran out of time.
    #[error("{what} not established within {waited:?}{}", last_error_suffix(.last_error))]
    ReadinessTimeout {
        what: String,
        waited: Duration,
        last_error: Option<String>,
    },

    /// A readiness predicate failed in a way retrying cannot fix.
    #[error("{what} failed: {source}")]
    ProbeFailed {
        what: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The process outlived its shutdown timeout and was killed.
    #[error("{program} took too long to exit ({timeout:?}), it has been killed")]
    ShutdownTimeout { program: String, timeout: Duration },

    /// The process exited with a failure status.
    #[error("{program} exited unsuccessfully: {status}")]
    ProcessFailed { program: String, status: ExitStatus },

    /// Waiting on the process failed.
    #[error("waiting on {program} failed: {source}")]
    Wait {
        program: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// Talking to the server failed.
    #[error(transparent)]
    Transport(#[from] ProtocolError),

    /// The heap profile could not be read or parsed.
    #[error(transparent)]
    Profile(#[from] ProfileError),

    /// A heap profile was requested from a client run without profiling.
    #[error("heap profiling not enabled for this run")]
    ProfilingDisabled,
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(err) => format!(": {err}"),
        None => String::new(),
    }
}
