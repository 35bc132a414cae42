use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

use crate::error::{HarnessError, Result};

/// Fixed-interval retry budget for a readiness gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Pause between attempts.
    pub interval: Duration,
    /// Total time allowed before giving up.
    pub max_wait: Duration,
}

impl Backoff {
    /// Creates a budget of `max_wait`, probing every `interval`.
    pub const fn new(interval: Duration, max_wait: Duration) -> Self {
        Self { interval, max_wait }
    }
}

/// Calls `probe` every `backoff.interval` until it succeeds or
/// `backoff.max_wait` runs out.
///
/// The first attempt happens immediately, and the value of the first
/// successful attempt is returned right away. `what` names the thing being
/// waited for in the timeout error.
///
/// # Returns
/// * `Result<T>` - The first successful probe value, or
///   [`HarnessError::ReadinessTimeout`] carrying the last probe error
pub async fn wait_ready<F, Fut, T, E>(what: &str, backoff: Backoff, mut probe: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let start = Instant::now();
    let mut last_error = None;
    let mut attempts = 0u32;

    let attempt_loop = async {
        loop {
            attempts += 1;
            match probe().await {
                Ok(value) => return value,
                Err(e) => {
                    debug!("{} attempt {} failed: {}", what, attempts, e);
                    last_error = Some(e.to_string());
                }
            }
            sleep(backoff.interval).await;
        }
    };

    let result = timeout(backoff.max_wait, attempt_loop).await;
    match result {
        Ok(value) => {
            debug!("{} ready after {:?} ({} attempts)", what, start.elapsed(), attempts);
            Ok(value)
        }
        Err(_) => Err(HarnessError::ReadinessTimeout {
            what: what.to_string(),
            waited: backoff.max_wait,
            last_error,
        }),
    }
}

/// Polls `still_indexing` every `backoff.interval` until it reports `false`.
///
/// An error from the predicate is permanent: it means the server cannot be
/// reached, not that it is busy, so it is returned immediately without
/// retrying.
pub async fn wait_indexed<F, Fut, E>(what: &str, backoff: Backoff, mut still_indexing: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<bool, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let outcome = wait_ready(what, backoff, || {
        let check = still_indexing();
        async move {
            match check.await {
                Ok(false) => Ok(Ok(())),
                Ok(true) => Err(Pending),
                Err(e) => Ok(Err(e)),
            }
        }
    })
    .await?;

    outcome.map_err(|e| HarnessError::ProbeFailed {
        what: what.to_string(),
        source: Box::new(e),
    })
}

struct Pending;

impl Display for Pending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("still in progress")
    }
}
