//! Wait Policy
//!
//! Fixed-interval polling used by the synchronous half of the operation
//! lifecycle. Every wait honours an optional deadline and a cancellation
//! token; without a deadline the wait is unbounded.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Interval between two polls of the backend
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Wait Policy
// =============================================================================

/// How long and how often to wait at a suspension point
#[derive(Debug, Clone)]
pub struct WaitPolicy {
    /// Delay between two polls
    pub interval: Duration,
    /// Overall deadline, `None` waits forever
    pub timeout: Option<Duration>,
    /// Cancels the wait when triggered
    pub cancel: CancellationToken,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl WaitPolicy {
    /// Set the overall deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the poll interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Copy of this policy whose token is cancelled along with this one but
    /// can also be cancelled on its own
    pub fn child(&self) -> Self {
        Self {
            interval: self.interval,
            timeout: self.timeout,
            cancel: self.cancel.child_token(),
        }
    }

    /// Absolute deadline for a wait starting now
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| Instant::now() + timeout)
    }
}

/// Sleep until `deadline`, or forever when there is none
pub(crate) async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

// =============================================================================
// Operation Options
// =============================================================================

/// Per-call lifecycle options for mutating storage operations
#[derive(Debug, Clone, Default)]
pub struct OpOptions {
    /// Return as soon as the backend accepts the request
    pub run_async: bool,
    /// Wait policy used when `run_async` is false
    pub wait: WaitPolicy,
}

impl OpOptions {
    pub fn new(run_async: bool, wait: WaitPolicy) -> Self {
        Self { run_async, wait }
    }

    /// Fire-and-forget options
    pub fn asynchronous() -> Self {
        Self {
            run_async: true,
            wait: WaitPolicy::default(),
        }
    }
}

// =============================================================================
// Polling
// =============================================================================

/// Poll `probe` every `policy.interval` until it reports ready
///
/// Returns [`Error::WaitTimeout`] once the deadline passes and
/// [`Error::Cancelled`] when the policy's token fires. Probe errors end the
/// wait immediately.
pub async fn poll_until<F, Fut>(
    policy: &WaitPolicy,
    operation: &str,
    resource: &str,
    mut probe: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let started = Instant::now();
    let deadline = policy.deadline();
    let mut polls: u64 = 0;

    let timed_out = || Error::WaitTimeout {
        operation: operation.to_string(),
        resource: resource.to_string(),
        waited: started.elapsed(),
    };
    let cancelled = || Error::Cancelled {
        operation: operation.to_string(),
    };

    loop {
        let ready = tokio::select! {
            biased;
            _ = policy.cancel.cancelled() => return Err(cancelled()),
            _ = sleep_until_deadline(deadline) => return Err(timed_out()),
            ready = probe() => ready?,
        };

        polls += 1;
        if ready {
            debug!(operation, resource, polls, "wait complete");
            return Ok(());
        }

        trace!(operation, resource, polls, "not ready, polling again");

        tokio::select! {
            biased;
            _ = policy.cancel.cancelled() => return Err(cancelled()),
            _ = sleep_until_deadline(deadline) => return Err(timed_out()),
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }
}
