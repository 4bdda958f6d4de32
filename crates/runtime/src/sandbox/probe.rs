//! Engine readiness polling

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::ExecutionEngine;
use crate::types::SandboxError;

/// Pings the engine until it answers or a deadline passes
pub struct ReadinessProber {
    engine: Arc<dyn ExecutionEngine>,
    interval: Duration,
}

impl ReadinessProber {
    pub fn new(engine: Arc<dyn ExecutionEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Return on the first successful ping. Each attempt is bounded by the
    /// time left, so the call never outlives `deadline` by more than one
    /// interval.
    pub async fn wait_ready(&self, deadline: Duration) -> Result<(), SandboxError> {
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let remaining = deadline.saturating_sub(started.elapsed());
            let attempt_limit = remaining.max(self.interval);

            let reason = match tokio::time::timeout(attempt_limit, self.engine.ping()).await {
                Ok(Ok(())) => {
                    if attempts > 1 {
                        tracing::info!(attempts, waited = ?started.elapsed(), "Engine ready");
                    }
                    return Ok(());
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("ping did not answer within {:?}", attempt_limit),
            };

            if started.elapsed() + self.interval > deadline {
                tracing::error!(attempts, "Engine not reachable: {}", reason);
                return Err(SandboxError::Connectivity {
                    waited: started.elapsed(),
                    reason,
                });
            }

            tracing::debug!(attempt = attempts, "Engine not ready: {}", reason);
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;

    #[tokio::test]
    async fn test_ready_after_transient_failures() {
        let engine = Arc::new(MockEngine::new().with_failing_pings(3));
        let prober = ReadinessProber::new(engine.clone(), Duration::from_millis(10));

        prober.wait_ready(Duration::from_secs(2)).await.unwrap();
        assert_eq!(engine.calls("ping"), 4);
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let engine = Arc::new(MockEngine::new().unreachable());
        let prober = ReadinessProber::new(engine.clone(), Duration::from_millis(20));

        let started = Instant::now();
        let err = prober.wait_ready(Duration::from_millis(150)).await.unwrap_err();

        assert!(err.is_connectivity());
        assert!(engine.calls("ping") >= 2);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_immediate_success_pings_once() {
        let engine = Arc::new(MockEngine::new());
        let prober = ReadinessProber::new(engine.clone(), Duration::from_millis(10));

        prober.wait_ready(Duration::from_millis(50)).await.unwrap();
        assert_eq!(engine.calls("ping"), 1);
    }
}
