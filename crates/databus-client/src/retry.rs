use std::{future::Future, time::Duration};

use async_trait::async_trait;

use crate::error::Result;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Exponential backoff schedule: 1 s doubling up to a 10 s ceiling.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = MIN_BACKOFF
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(MAX_BACKOFF);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }
}

/// Lifecycle gates the retry driver consults between attempts.
#[async_trait]
pub(crate) trait RetryGate: Sync {
    /// Fails with a permanent error if the channel was destroyed, or with
    /// [`Error::Stopped`](crate::Error::Stopped) if a running loop has a
    /// pending stop request.
    fn check(&self) -> Result<()>;

    /// Sleep for `delay`, cut short by a stop request.
    async fn wait(&self, delay: Duration);
}

/// Re-invoke `op` with exponential backoff until it succeeds or a
/// classification forbids another attempt.
///
/// Consumer-loss errors escape immediately: retrying here would loop against
/// a consumer id the server has already forgotten, so the run loop must
/// observe the loss and re-create the consumer instead.
pub(crate) async fn with_retry<T, G, F, Fut>(
    gate: &G,
    operation: &str,
    retry_on_fail: bool,
    mut op: F,
) -> Result<T>
where
    G: RetryGate + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new();
    loop {
        gate.check()?;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_consumer_loss() => return Err(e),
            Err(e) if !retry_on_fail || !e.is_temporary() => return Err(e),
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    operation,
                    error = %e,
                    delay_secs = delay.as_secs(),
                    "temporary failure, retrying"
                );
                gate.wait(delay).await;
            }
        }
    }
}
