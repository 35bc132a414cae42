//! Decides whether a process death was our own doing.
//!
//! This is the only place that decodes platform signal information. On
//! targets without POSIX signals nothing is ever an expected kill.

use crate::process::WaitResult;
use crate::shutdown::{ExitFailure, ExitOutcome, ShutdownType};

/// The signal the harness uses to kill a cancelled process group.
#[cfg(unix)]
pub const TERMINATION_SIGNAL: nix::sys::signal::Signal = nix::sys::signal::Signal::SIGKILL;

/// Classifies the result of waiting on a process.
///
/// A death by [`TERMINATION_SIGNAL`] is only expected when the caller asked
/// for a hard shutdown. During a soft shutdown the process promised to exit
/// on its own, so any signal death is a failure.
pub fn classify(shutdown_type: ShutdownType, result: &WaitResult) -> ExitOutcome {
    let status = match result {
        Ok(status) => *status,
        Err(e) => return ExitOutcome::Failure(ExitFailure::Wait(e.clone())),
    };

    if status.success() {
        return ExitOutcome::Success;
    }
    if shutdown_type.signals() && killed_by_harness(&status) {
        return ExitOutcome::ExpectedKill;
    }
    ExitOutcome::Failure(ExitFailure::Status(status))
}

#[cfg(unix)]
fn killed_by_harness(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;

    status.code().is_none() && status.signal() == Some(TERMINATION_SIGNAL as i32)
}

#[cfg(not(unix))]
fn killed_by_harness(_status: &std::process::ExitStatus) -> bool {
    false
}
