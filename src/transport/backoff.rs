//! Reconnect backoff and the retrying connect loop

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{AuthError, TransportError};

/// Exponential backoff: starts at `min`, doubles per failure, capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Delay to sleep after the current failure; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Back to the minimum after a successful connection
    pub fn reset(&mut self) {
        self.current = self.min;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Why a single connection attempt failed
#[derive(Debug, thiserror::Error)]
pub enum ConnectFailure {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Keep calling `attempt` until it connects, sleeping with `backoff` between
/// failures. Each attempt gets `attempt_timeout` to finish.
///
/// Returns `None` once `cancel` fires, `Some(Err)` on an authentication
/// failure (never retried).
pub async fn connect_with_retry<T, F, Fut>(
    backoff: &mut Backoff,
    attempt_timeout: Duration,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Option<Result<T, AuthError>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectFailure>>,
{
    let mut failures: u32 = 0;

    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return None,
            outcome = timeout(attempt_timeout, attempt()) => outcome,
        };

        match outcome {
            Ok(Ok(connection)) => {
                backoff.reset();
                return Some(Ok(connection));
            }
            Ok(Err(ConnectFailure::Auth(e))) => return Some(Err(e)),
            Ok(Err(ConnectFailure::Transport(e))) => {
                warn!(error = %e, failures, "Connection attempt failed");
            }
            Err(_) => {
                warn!(
                    timeout_secs = attempt_timeout.as_secs_f64(),
                    failures, "Connection attempt timed out"
                );
            }
        }

        failures += 1;
        let delay = backoff.next_delay();
        info!(delay_secs = delay.as_secs_f64(), failures, "Retrying connection");

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = sleep(delay) => {}
        }
    }
}
