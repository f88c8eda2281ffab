//! Diagnoses slow admission decisions.
//!
//! Decisions are never failed for being slow, they are only logged with the requesting user.
use std::time::Duration;

use tokio::time::Instant;

/// Logs a warning when dropped later than `threshold` after its creation.
///
/// The guard is created right before a handler is invoked, so dropping it covers every way
/// the admission can end, including a timeout.
#[derive(Debug)]
pub struct SlowTrace {
    handler: &'static str,
    user: String,
    threshold: Duration,
    started: Instant,
}

impl SlowTrace {
    pub fn start(handler: &'static str, user: impl Into<String>, threshold: Duration) -> Self {
        Self {
            handler,
            user: user.into(),
            threshold,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_slow(&self) -> bool {
        self.elapsed() > self.threshold
    }
}

impl Drop for SlowTrace {
    fn drop(&mut self) {
        if self.is_slow() {
            tracing::warn!(
                handler = self.handler,
                user.name = %self.user,
                elapsed = ?self.elapsed(),
                threshold = ?self.threshold,
                "slow admission decision"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn slow_after_threshold() {
        let trace = SlowTrace::start("namespaces", "alice", Duration::from_secs(2));
        assert!(!trace.is_slow());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!trace.is_slow());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(trace.is_slow());
    }
}
