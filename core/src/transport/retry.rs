use crate::error::ClientError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

/// Retries allowed after the initial connection attempt.
pub const MAX_RETRIES: u32 = 5;

/// How long one attempt may wait for `connection_ack`.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(10_000);

const BASE_DELAY: Duration = Duration::from_millis(1_000);
const JITTER_MS: std::ops::Range<u64> = 300..3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `1s * 2^retry` plus 300-3000 ms of jitter.
    RandomizedExponential,
    /// Retry immediately. Used by in-process backends and tests.
    Immediate,
}

/// Connection policy for the streaming channel.
///
/// The retry cap and ack timeout are fixed; only the wait between attempts
/// can be changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::RandomizedExponential,
        }
    }
}

impl RetryPolicy {
    pub fn immediate() -> Self {
        Self {
            backoff: Backoff::Immediate,
        }
    }

    pub fn max_retries(&self) -> u32 {
        MAX_RETRIES
    }

    pub fn ack_timeout(&self) -> Duration {
        ACK_TIMEOUT
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Wait before retry number `retry` (zero-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Immediate => Duration::ZERO,
            Backoff::RandomizedExponential => {
                let exp = BASE_DELAY.saturating_mul(2u32.saturating_pow(retry));
                let jitter = rand::thread_rng().gen_range(JITTER_MS);
                exp + Duration::from_millis(jitter)
            }
        }
    }

    /// Drive `attempt` until it succeeds, fails with an auth error, or the
    /// retry budget is spent. Each attempt is cut off at the ack timeout.
    ///
    /// `attempt` receives the zero-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> Result<T, ClientError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut retries = 0;
        loop {
            let outcome = match timeout(ACK_TIMEOUT, attempt(retries)).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::ack_timeout(ACK_TIMEOUT)),
            };
            match outcome {
                Ok(value) => {
                    if retries > 0 {
                        info!(retries, "streaming connection re-established");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_auth() => return Err(err),
                Err(err) if retries >= MAX_RETRIES => {
                    return Err(ClientError::Connection {
                        attempts: retries + 1,
                        reason: err.to_string(),
                    });
                }
                Err(err) => {
                    let delay = self.delay_for(retries);
                    retries += 1;
                    warn!(error = %err, retry = retries, ?delay, "streaming connection attempt failed");
                    sleep(delay).await;
                }
            }
        }
    }
}
