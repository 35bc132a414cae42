use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::classify::classify;
use crate::error::{HarnessError, Result};
use crate::process::Instance;

/// How a shutdown treats the running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownType {
    /// Same as [`ShutdownType::Hard`].
    #[default]
    Unspecified,
    /// Kill the process immediately.
    Hard,
    /// Wait for the process to exit on its own.
    Soft,
}

impl ShutdownType {
    /// Whether this shutdown kills the process up front.
    pub fn signals(self) -> bool {
        self != ShutdownType::Soft
    }
}

/// Why a shutdown failed.
#[derive(Debug, Clone)]
pub enum ExitFailure {
    /// The process exited with a non-zero code, or died by a signal that
    /// was not an expected kill.
    Status(ExitStatus),
    /// Waiting on the process failed.
    Wait(Arc<std::io::Error>),
    /// The process outlived the shutdown timeout and was force-killed.
    TimedOut(Duration),
}

impl PartialEq for ExitFailure {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Status(a), Self::Status(b)) => a == b,
            (Self::Wait(a), Self::Wait(b)) => Arc::ptr_eq(a, b),
            (Self::TimedOut(a), Self::TimedOut(b)) => a == b,
            _ => false,
        }
    }
}

/// How a managed process ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    /// Exited with status 0.
    Success,
    /// Killed by the harness during a hard shutdown; not an error.
    ExpectedKill,
    /// Anything else.
    Failure(ExitFailure),
}

impl ExitOutcome {
    /// True for [`ExitOutcome::Failure`].
    pub fn is_failure(&self) -> bool {
        matches!(self, ExitOutcome::Failure(_))
    }

    /// Converts the outcome into the caller-visible result.
    pub fn into_result(self, program: &str) -> Result<()> {
        let program = program.to_string();
        match self {
            ExitOutcome::Success | ExitOutcome::ExpectedKill => Ok(()),
            ExitOutcome::Failure(ExitFailure::Status(status)) => {
                Err(HarnessError::ProcessFailed { program, status })
            }
            ExitOutcome::Failure(ExitFailure::Wait(source)) => {
                Err(HarnessError::Wait { program, source })
            }
            ExitOutcome::Failure(ExitFailure::TimedOut(timeout)) => {
                Err(HarnessError::ShutdownTimeout { program, timeout })
            }
        }
    }
}

impl Instance {
    /// Shuts the process down and reports whether that went cleanly.
    ///
    /// See [`Instance::shutdown_outcome`] for the state machine. Expected
    /// kills are reported as `Ok`.
    ///
    /// # Arguments
    /// * `shutdown_type` - Whether to kill the process up front
    /// * `timeout` - How long to wait for the exit before force-killing
    ///
    /// # Returns
    /// * `Result<()>` - `Ok` for a clean exit or an expected kill
    pub async fn shutdown(&mut self, shutdown_type: ShutdownType, timeout: Duration) -> Result<()> {
        let outcome = self.shutdown_outcome(shutdown_type, timeout).await;
        outcome.into_result(&self.program)
    }

    /// Shuts the process down and returns the classified outcome.
    ///
    /// Unless `shutdown_type` is soft, the process is killed first. The exit
    /// is then raced against `timeout`; if the timer wins, the process is
    /// killed and the outcome is [`ExitFailure::TimedOut`] regardless of the
    /// shutdown type. The background waiter still reaps the process.
    ///
    /// The outcome is cached, so calling this again returns immediately
    /// without signalling the process a second time.
    pub async fn shutdown_outcome(&mut self, shutdown_type: ShutdownType, timeout: Duration) -> ExitOutcome {
        if let Some(outcome) = &self.outcome {
            debug!("{} already shut down: {:?}", self.program, outcome);
            return outcome.clone();
        }

        if shutdown_type.signals() {
            debug!("{}: Hard shutdown, signalling", self.program);
            self.cancel();
        } else {
            debug!("{}: Soft shutdown, waiting up to {:?}", self.program, timeout);
        }

        let outcome = match tokio::time::timeout(timeout, self.exit.wait()).await {
            Ok(result) => classify(shutdown_type, &result),
            Err(_) => {
                warn!("{} took too long to exit ({:?}), killing it", self.program, timeout);
                self.cancel();
                ExitOutcome::Failure(ExitFailure::TimedOut(timeout))
            }
        };

        info!("{} shut down: {:?}", self.program, outcome);
        self.outcome = Some(outcome.clone());
        outcome
    }

    /// The cached outcome of a completed shutdown.
    pub fn outcome(&self) -> Option<&ExitOutcome> {
        self.outcome.as_ref()
    }
}
