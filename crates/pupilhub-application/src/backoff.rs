//! Back-off after rejected credentials.

use pupilhub_core::HubError;
use std::time::Duration;
use tokio::time::Instant;

/// Wait after the 1st, 2nd, 3rd and every later consecutive failure.
const STEPS: [Duration; 4] = [
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
    Duration::from_secs(45 * 60),
    Duration::from_secs(2 * 60 * 60),
];

/// Consecutive authentication failures and when the last one happened.
#[derive(Debug, Default)]
pub(crate) struct AuthBackoff {
    failures: u32,
    last_failure: Option<Instant>,
}

impl AuthBackoff {
    pub(crate) fn window(&self) -> Duration {
        let index = (self.failures.max(1) as usize - 1).min(STEPS.len() - 1);
        STEPS[index]
    }

    /// Fails with [`HubError::Backoff`] while the current window is open.
    pub(crate) fn check(&self) -> Result<(), HubError> {
        let Some(last) = self.last_failure else {
            return Ok(());
        };
        let remaining = self.window().saturating_sub(last.elapsed());
        if remaining.is_zero() {
            return Ok(());
        }
        Err(HubError::Backoff {
            failures: self.failures,
            retry_after_secs: remaining.as_secs().max(1),
        })
    }

    pub(crate) fn record_failure(&mut self) {
        self.failures += 1;
        self.last_failure = Some(Instant::now());
        tracing::warn!(
            target: "pupilhub::auth",
            failures = self.failures,
            window_secs = self.window().as_secs(),
            "Authentication failure recorded"
        );
    }

    pub(crate) fn reset(&mut self) {
        if self.failures > 0 {
            tracing::debug!(target: "pupilhub::auth", "Authentication back-off cleared");
        }
        self.failures = 0;
        self.last_failure = None;
    }
}
